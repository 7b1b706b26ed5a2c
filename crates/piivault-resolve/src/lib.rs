//! Query engine: shapes stored objects into caller-facing results.
//!
//! Parses property selections (`email`, `ssn.mask`, `id`), renders raw or
//! masked values, and turns store pages into opaque-cursor pagination.

pub mod cursor;
pub mod paging;
pub mod selection;
pub mod types;

pub use cursor::{filtered_scope, Cursor};
pub use paging::{paginate, resolve_page_size};
pub use selection::{Render, SelectedProperty, Selection};
pub use types::*;
