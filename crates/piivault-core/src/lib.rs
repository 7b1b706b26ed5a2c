//! PiiVault Core: error taxonomy, configuration, request context.

pub mod config;
pub mod context;
pub mod error;

pub use config::{DataPaths, VaultConfig};
pub use context::{CallerIdentity, Deadline, Reason, RequestContext};
pub use error::{Error, Result};
