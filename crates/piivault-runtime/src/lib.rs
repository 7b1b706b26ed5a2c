//! PiiVault runtime: the `Vault` service.
//!
//! Schema registry, object store and tokenization engine operations, each
//! gated by the purpose policy and reported to the audit sink.

pub mod objects;
pub mod registry;
pub mod retry;
pub mod tokens;
pub mod types;
pub mod vault;

pub use objects::ObjectRow;
pub use retry::{RetryPolicy, RetryStrategy};
pub use types::*;
pub use vault::Vault;
