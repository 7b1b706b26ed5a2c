//! Runtime request and result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use piivault_core::{Error, Result};
use piivault_store::TokenType;

/// Object fields as supplied by callers: property name to JSON value.
pub type ObjectFields = Map<String, Value>;

/// What a tokenize request points at: a stored object or an inline bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<ObjectFields>,
}

/// One tokenize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeRequest {
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub object: ObjectRef,
    #[serde(default)]
    pub props: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl TokenizeRequest {
    pub fn pointer(object_id: &str, props: &[&str]) -> Self {
        Self {
            token_type: TokenType::Pointer,
            object: ObjectRef {
                id: Some(object_id.to_string()),
                fields: None,
            },
            props: props.iter().map(|p| p.to_string()).collect(),
            tags: Vec::new(),
            ttl_seconds: None,
        }
    }

    pub fn randomized(object_id: &str, props: &[&str]) -> Self {
        Self {
            token_type: TokenType::Randomized,
            ..Self::pointer(object_id, props)
        }
    }

    pub fn randomized_inline(fields: ObjectFields) -> Self {
        Self {
            token_type: TokenType::Randomized,
            object: ObjectRef {
                id: None,
                fields: Some(fields),
            },
            props: Vec::new(),
            tags: Vec::new(),
            ttl_seconds: None,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }
}

/// Issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValue {
    pub token_id: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

/// Token metadata returned by searches. Carries no values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_id: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub props: Vec<String>,
    pub tags: Vec<String>,
    pub creation_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

/// Result of resolving one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizedToken {
    pub token_id: String,
    pub fields: ObjectFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub tags: Vec<String>,
}

/// Token filters. Every filter given must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TokenQuery {
    pub fn by_ids(ids: &[String]) -> Self {
        Self {
            token_ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn by_objects(ids: &[String]) -> Self {
        Self {
            object_ids: Some(ids.to_vec()),
            ..Default::default()
        }
    }

    pub fn by_tags(tags: &[String]) -> Self {
        Self {
            tags: Some(tags.to_vec()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_none() && self.token_ids.is_none() && self.tags.is_none()
    }
}

/// Old token id to new token id.
pub type RotatedTokens = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: String,
    pub message: String,
}

/// Per-item outcome of a batch call: `{"ok": ...}` or `{"error": {code, message}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome<T> {
    Ok(T),
    Error(ItemError),
}

impl<T> ItemOutcome<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            ItemOutcome::Ok(v) => Some(v),
            ItemOutcome::Error(_) => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ItemOutcome::Ok(_) => None,
            ItemOutcome::Error(e) => Some(&e.code),
        }
    }
}

impl<T> From<Result<T>> for ItemOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => ItemOutcome::Ok(v),
            Err(e) => ItemOutcome::Error(ItemError {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Sorted, de-duplicated, non-blank tags.
pub(crate) fn normalize_tags(tags: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(Error::Validation("tags must not be blank".into()));
        }
        out.push(tag.to_string());
    }
    out.sort();
    out.dedup();
    Ok(out)
}
