//! Token routes: tokenize, detokenize, search, update, rotate, delete.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{csv_opt, request_context, with_vault};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use piivault_runtime::{
    DetokenizedToken, ItemOutcome, RotatedTokens, TokenInfo, TokenQuery, TokenValue,
    TokenizeRequest,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/data/collections/{collection}/tokens",
            get(detokenize)
                .post(tokenize)
                .delete(delete_tokens)
                .patch(update_tokens),
        )
        .route(
            "/data/collections/{collection}/query/tokens",
            post(search_tokens),
        )
        .route(
            "/data/collections/{collection}/rotate/tokens",
            post(rotate_tokens),
        )
}

/// Token filters as query parameters. List fields are comma-separated.
#[derive(Debug, Default, Deserialize)]
pub struct TokenParams {
    pub reason: Option<String>,
    pub token_ids: Option<String>,
    pub object_ids: Option<String>,
    pub tags: Option<String>,
}

impl TokenParams {
    fn query(&self) -> TokenQuery {
        TokenQuery {
            object_ids: csv_opt(self.object_ids.as_deref()),
            token_ids: csv_opt(self.token_ids.as_deref()),
            tags: csv_opt(self.tags.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokensBody {
    pub tags: Vec<String>,
}

async fn tokenize(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
    Json(requests): Json<Vec<TokenizeRequest>>,
) -> ApiResult<Json<Vec<ItemOutcome<TokenValue>>>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let outcomes = with_vault(&state, move |vault| {
        vault.tokenize(&collection, &ctx, &requests)
    })
    .await?;
    Ok(Json(outcomes))
}

/// Resolve by `token_ids`, or by `tags` when no ids are given.
async fn detokenize(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ItemOutcome<DetokenizedToken>>>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let query = params.query();
    let outcomes = match (query.token_ids, query.tags) {
        (Some(ids), _) => {
            with_vault(&state, move |vault| vault.detokenize(&collection, &ctx, &ids)).await?
        }
        (None, Some(tags)) => {
            with_vault(&state, move |vault| {
                vault.detokenize_by_tags(&collection, &ctx, &tags)
            })
            .await?
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "token_ids or tags is required".into(),
            ))
        }
    };
    Ok(Json(outcomes))
}

async fn search_tokens(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
    Json(query): Json<TokenQuery>,
) -> ApiResult<Json<Vec<TokenInfo>>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let infos = with_vault(&state, move |vault| {
        vault.search_tokens(&collection, &ctx, &query)
    })
    .await?;
    Ok(Json(infos))
}

async fn delete_tokens(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let query = params.query();
    let deleted = with_vault(&state, move |vault| {
        vault.delete_tokens(&collection, &ctx, &query)
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn update_tokens(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
    Json(body): Json<UpdateTokensBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let query = params.query();
    let updated = with_vault(&state, move |vault| {
        vault.update_tokens(&collection, &ctx, &query, &body.tags)
    })
    .await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn rotate_tokens(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> ApiResult<Json<RotatedTokens>> {
    let ctx = request_context(&state, &headers, params.reason.as_deref())?;
    let query = params.query();
    let rotated = with_vault(&state, move |vault| {
        vault.rotate_tokens(&collection, &ctx, &query)
    })
    .await?;
    Ok(Json(rotated))
}
