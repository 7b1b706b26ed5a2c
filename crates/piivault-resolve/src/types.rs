//! Query engine types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use piivault_core::{Error, Result};

/// Listing options named by the caller (`options=unsafe,include_metadata`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Authorizes raw values of sensitive properties and "all properties" listings.
    pub unsafe_access: bool,
    /// Adds `_creation_time` to each result.
    pub include_metadata: bool,
}

impl ListOptions {
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Result<Self> {
        let mut parsed = Self::default();
        for option in options {
            match option.as_ref().trim() {
                "" => {}
                "unsafe" => parsed.unsafe_access = true,
                "include_metadata" => parsed.include_metadata = true,
                other => {
                    return Err(Error::Validation(format!("unknown option '{}'", other)));
                }
            }
        }
        Ok(parsed)
    }

    /// Parse the comma-separated query-string form.
    pub fn from_query(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(raw) => Self::parse(&raw.split(',').collect::<Vec<_>>()),
            None => Ok(Self::default()),
        }
    }
}

/// Parameters of a listing, lookup or search call.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Restrict to these object ids. Empty means all objects.
    pub ids: Vec<String>,
    /// Requested properties; empty means all (requires `unsafe`).
    pub props: Vec<String>,
    pub page_size: Option<usize>,
    pub cursor: Option<String>,
    pub options: ListOptions,
}

/// Exact-match search body: `{"match": {"email": "john@somemail.com"}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(rename = "match", default)]
    pub match_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// Empty on the final page.
    pub cursor: String,
    pub size: usize,
    pub remaining_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub paging: Paging,
}
