//! Opaque pagination cursors.
//!
//! A cursor records the last object sequence delivered and the listing's
//! high-water mark, encoded as URL-safe base64 JSON. `scope` ties it to the
//! listing that produced it, including that listing's filter.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use piivault_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub scope: String,
    pub after_seq: i64,
    pub high_water: i64,
}

impl Cursor {
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a cursor and check it belongs to `scope`.
    pub fn decode(raw: &str, scope: &str) -> Result<Self> {
        let invalid = || Error::Validation("invalid cursor".into());
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).map_err(|_| invalid())?;
        let cursor: Cursor = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        if cursor.scope != scope {
            return Err(Error::Validation(
                "cursor does not belong to this listing".into(),
            ));
        }
        Ok(cursor)
    }
}

/// Scope of a filtered listing: `base` plus a digest of the filter terms.
/// Term order and duplicates do not matter.
pub fn filtered_scope<S: AsRef<str>>(base: &str, terms: &[S]) -> String {
    let mut sorted: Vec<&str> = terms.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for term in sorted {
        hasher.update(term.as_bytes());
        hasher.update([0u8]);
    }
    format!("{}#{}", base, hex::encode(&hasher.finalize()[..12]))
}
