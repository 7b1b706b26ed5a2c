//! HTTP routes under `/api/pvlt/1.0`.

pub mod collections;
pub mod info;
pub mod objects;
pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::Response,
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use piivault_core::{CallerIdentity, Error, Reason, RequestContext};
use piivault_runtime::Vault;

pub const API_PREFIX: &str = "/api/pvlt/1.0";

pub const CALLER_HEADER: &str = "x-pvault-caller";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

const DEFAULT_CALLER: &str = "default";
/// Reason recorded for ctl calls that name none.
const CTL_REASON: &str = "Maintenance";

/// Build the full API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .merge(collections::routes())
        .merge(objects::routes())
        .merge(tokens::routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .nest(API_PREFIX, authenticated.merge(info::routes()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token.trim(), &state.auth_token) => {
            Ok(next.run(request).await)
        }
        Some(_) => Err(ApiError::Unauthorized("invalid bearer token".into())),
        None => Err(ApiError::Unauthorized("bearer token required".into())),
    }
}

/// Constant-time token comparison. Only the length can differ observably.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Build the per-call context from the `reason` parameter and request headers.
pub(crate) fn request_context(
    state: &AppState,
    headers: &HeaderMap,
    reason: Option<&str>,
) -> ApiResult<RequestContext> {
    let reason = Reason::new(reason.unwrap_or_default())?;
    let caller = header_str(headers, CALLER_HEADER)?.unwrap_or(DEFAULT_CALLER);

    let timeout = match header_str(headers, TIMEOUT_HEADER)? {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ApiError::BadRequest(format!("invalid {} '{}'", TIMEOUT_HEADER, raw)))?,
        None => state.request_timeout,
    };

    let mut ctx = RequestContext::new(reason, CallerIdentity::new(caller)).with_timeout(timeout);
    if let Some(key) = header_str(headers, IDEMPOTENCY_HEADER)? {
        ctx = ctx.with_idempotency_key(key.trim());
    }
    Ok(ctx)
}

/// Like [`request_context`], with a default reason for registry calls.
pub(crate) fn ctl_context(
    state: &AppState,
    headers: &HeaderMap,
    reason: Option<&str>,
) -> ApiResult<RequestContext> {
    request_context(state, headers, Some(reason.unwrap_or(CTL_REASON)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::BadRequest(format!("header {} is not valid text", name)))
        })
        .transpose()
}

/// Run a vault call on the blocking pool. Store access and retry backoff block.
pub(crate) async fn with_vault<T, F>(state: &Arc<AppState>, op: F) -> ApiResult<T>
where
    F: FnOnce(&Vault) -> piivault_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || op(&state.vault))
        .await
        .map_err(|e| ApiError::Vault(Error::Internal(format!("vault task failed: {}", e))))?
        .map_err(ApiError::from)
}

/// Split a comma-separated query value, dropping blanks.
pub(crate) fn csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// Like [`csv`], but an absent parameter stays `None`.
pub(crate) fn csv_opt(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|r| csv(Some(r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_csv() {
        assert_eq!(csv(Some("ssn, email,,")), vec!["ssn", "email"]);
        assert!(csv(None).is_empty());
        assert_eq!(csv_opt(Some("")), Some(vec![]));
        assert_eq!(csv_opt(None), None);
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("pvaultauth", "pvaultauth"));
        assert!(!token_matches("pvaultautH", "pvaultauth"));
        assert!(!token_matches("pvault", "pvaultauth"));
        assert!(!token_matches("", "pvaultauth"));
    }

    #[test]
    fn test_header_str() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("250"));
        assert_eq!(header_str(&headers, TIMEOUT_HEADER).unwrap(), Some("250"));
        assert_eq!(header_str(&headers, IDEMPOTENCY_HEADER).unwrap(), None);
    }
}
