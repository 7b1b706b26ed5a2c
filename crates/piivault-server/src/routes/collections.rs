//! Collection registry routes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{ctl_context, with_vault};
use crate::error::ApiResult;
use crate::state::AppState;
use piivault_store::Collection;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ctl/collections", get(list_collections).post(add_collection))
        .route(
            "/ctl/collections/{name}",
            get(get_collection).delete(delete_collection),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct CtlParams {
    pub reason: Option<String>,
}

async fn list_collections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CtlParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Collection>>> {
    let ctx = ctl_context(&state, &headers, params.reason.as_deref())?;
    let collections = with_vault(&state, move |vault| vault.list_collections(&ctx)).await?;
    Ok(Json(collections))
}

async fn add_collection(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CtlParams>,
    headers: HeaderMap,
    Json(definition): Json<Collection>,
) -> ApiResult<Json<Collection>> {
    let ctx = ctl_context(&state, &headers, params.reason.as_deref())?;
    let stored = with_vault(&state, move |vault| vault.add_collection(&ctx, definition)).await?;
    Ok(Json(stored))
}

async fn get_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<CtlParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Collection>> {
    let ctx = ctl_context(&state, &headers, params.reason.as_deref())?;
    let collection = with_vault(&state, move |vault| vault.get_collection(&ctx, &name)).await?;
    Ok(Json(collection))
}

async fn delete_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<CtlParams>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = ctl_context(&state, &headers, params.reason.as_deref())?;
    let deleted = name.clone();
    with_vault(&state, move |vault| vault.delete_collection(&ctx, &name)).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
