//! PiiVault Store: SQLite persistence for collections, encrypted objects and tokens.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::{db_err, SqliteStore, DB_FILE};
pub use types::*;
