//! PiiVault HTTP surface and operator tooling.

pub mod admin;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
