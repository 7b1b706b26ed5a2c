//! Page sizing and paging metadata.

use tracing::debug;

use crate::cursor::Cursor;
use crate::types::Paging;
use piivault_core::{Error, Result};
use piivault_store::StoredPage;

/// Effective page size: the default when unset, clamped to `max`.
pub fn resolve_page_size(requested: Option<usize>, default: usize, max: usize) -> Result<usize> {
    match requested {
        None => Ok(default.min(max)),
        Some(0) => Err(Error::Validation("page_size must be positive".into())),
        Some(n) if n > max => {
            debug!("page_size {} clamped to {}", n, max);
            Ok(max)
        }
        Some(n) => Ok(n),
    }
}

/// Paging block for a store page. The cursor is empty once nothing remains.
pub fn paginate(scope: &str, page: &StoredPage) -> Result<Paging> {
    let size = page.objects.len();
    let remaining_count = (page.matching - size as i64).max(0);
    let cursor = match page.objects.last() {
        Some(last) if remaining_count > 0 => Cursor {
            scope: scope.to_string(),
            after_seq: last.seq,
            high_water: page.high_water,
        }
        .encode()?,
        _ => String::new(),
    };
    Ok(Paging {
        cursor,
        size,
        remaining_count,
    })
}
