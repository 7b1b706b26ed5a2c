//! Shared application state.

use std::time::{Duration, Instant};

use piivault_runtime::Vault;

pub struct AppState {
    pub vault: Vault,
    /// Bearer token every data and ctl route requires.
    pub auth_token: String,
    /// Deadline applied when a request carries no `X-Request-Timeout-Ms`.
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(vault: Vault) -> Self {
        let auth_token = vault.config().auth_token.clone();
        let request_timeout = vault.config().request_timeout();
        Self {
            vault,
            auth_token,
            request_timeout,
            started_at: Instant::now(),
        }
    }
}
