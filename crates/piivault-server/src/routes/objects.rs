//! Object routes: add, list/get, search, delete.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use super::{csv, request_context, with_vault};
use crate::error::ApiResult;
use crate::state::AppState;
use piivault_resolve::{ListOptions, ListRequest, Page, SearchQuery};
use piivault_runtime::{ObjectFields, ObjectRow};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/data/collections/{collection}/objects",
            get(get_objects).post(add_object),
        )
        .route(
            "/data/collections/{collection}/objects/{id}",
            delete(delete_object),
        )
        .route(
            "/data/collections/{collection}/query/objects",
            post(search_objects),
        )
}

/// Query parameters shared by the object routes. List fields are comma-separated.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectParams {
    pub reason: Option<String>,
    pub options: Option<String>,
    pub props: Option<String>,
    pub ids: Option<String>,
    pub page_size: Option<usize>,
    pub cursor: Option<String>,
}

impl ObjectParams {
    fn list_request(&self) -> ApiResult<ListRequest> {
        Ok(ListRequest {
            ids: csv(self.ids.as_deref()),
            props: csv(self.props.as_deref()),
            page_size: self.page_size,
            cursor: self.cursor.clone().filter(|c| !c.is_empty()),
            options: ListOptions::from_query(self.options.as_deref())?,
        })
    }
}

async fn add_object(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<ObjectParams>,
    headers: HeaderMap,
    Json(fields): Json<ObjectFields>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let id = with_vault(&state, move |vault| {
        vault.add_object(&collection, &ctx, &fields)
    })
    .await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn get_objects(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<ObjectParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Page<ObjectRow>>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let request = params.list_request()?;
    let page = with_vault(&state, move |vault| {
        vault.get_objects(&collection, &ctx, &request)
    })
    .await?;
    debug!("Listed {} objects", page.results.len());
    Ok(Json(page))
}

async fn search_objects(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<ObjectParams>,
    headers: HeaderMap,
    Json(query): Json<SearchQuery>,
) -> ApiResult<Json<Page<ObjectRow>>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let request = params.list_request()?;
    let page = with_vault(&state, move |vault| {
        vault.search_objects(&collection, &ctx, &query, &request)
    })
    .await?;
    Ok(Json(page))
}

async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Query(params): Query<ObjectParams>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let deleted = id.clone();
    with_vault(&state, move |vault| vault.delete_object(&collection, &ctx, &id)).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
