//! Data types for collections, encrypted objects, and tokens.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use piivault_protocol::PiiType;

/// Domain tag of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionType {
    Persons,
    Data,
}

/// Typed, constrained field definition within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(alias = "pii_type_name")]
    pub data_type_name: PiiType,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named schema grouping typed properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(rename = "type")]
    pub collection_type: CollectionType,
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
}

impl Collection {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.name.clone()).collect()
    }
}

/// One encrypted field ready for insertion.
#[derive(Debug, Clone)]
pub struct FieldRecord {
    pub property: String,
    pub ciphertext: Vec<u8>,
    pub blind_index: String,
    pub is_unique: bool,
}

/// An object row with its encrypted fields. Absent keys are null fields.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub seq: i64,
    pub id: String,
    pub created_at: i64,
    pub fields: BTreeMap<String, Vec<u8>>,
}

/// Which objects of a collection a page query walks over.
#[derive(Debug, Clone)]
pub enum ObjectFilter {
    All,
    Ids(Vec<String>),
    /// Conjunction of (property, blind index) equality clauses.
    Match(Vec<(String, String)>),
}

/// One page of objects, read under a single lock.
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub objects: Vec<StoredObject>,
    /// Highest object sequence visible to the listing.
    pub high_water: i64,
    /// Matching objects after the cursor position, including this page.
    pub matching: i64,
}

/// Result of an insert, distinguishing an idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub object_id: String,
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    #[serde(alias = "pointer")]
    Pointer,
    #[serde(alias = "randomized")]
    Randomized,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Pointer => "POINTER",
            TokenType::Randomized => "RANDOMIZED",
        }
    }
}

/// What a token stands for. A pointer holds a live reference and no value;
/// a randomized token holds a value snapshot and no live reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTarget {
    Pointer {
        object_id: String,
        props: Vec<String>,
    },
    Randomized {
        /// Encrypted JSON map of the captured fields.
        snapshot: Vec<u8>,
        props: Vec<String>,
        /// Object the snapshot was taken from, if any. Never re-read.
        origin_object_id: Option<String>,
    },
}

impl TokenTarget {
    pub fn token_type(&self) -> TokenType {
        match self {
            TokenTarget::Pointer { .. } => TokenType::Pointer,
            TokenTarget::Randomized { .. } => TokenType::Randomized,
        }
    }

    pub fn props(&self) -> &[String] {
        match self {
            TokenTarget::Pointer { props, .. } | TokenTarget::Randomized { props, .. } => props,
        }
    }

    /// Object id this token is associated with for lookups by object.
    pub fn object_id(&self) -> Option<&str> {
        match self {
            TokenTarget::Pointer { object_id, .. } => Some(object_id),
            TokenTarget::Randomized {
                origin_object_id, ..
            } => origin_object_id.as_deref(),
        }
    }
}

/// Token row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token_id: String,
    pub collection: String,
    pub target: TokenTarget,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    /// Set when a pointer's target object was deleted.
    pub invalidated_at: Option<i64>,
}

impl TokenRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// Filters for token lookup; all given filters must match.
#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub object_ids: Option<Vec<String>>,
    pub token_ids: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub collections: i64,
    pub objects: i64,
    pub tokens: i64,
    pub invalidated_tokens: i64,
    pub db_path: String,
    pub db_size_mb: f64,
}
