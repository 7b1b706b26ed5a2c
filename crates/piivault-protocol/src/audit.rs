//! Audit event model and sinks.
//!
//! Write, read, tokenize and detokenize calls emit an [`AuditEvent`] to an
//! [`AuditSink`]. Events carry identifiers and property names only; PII values
//! never appear in them.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use piivault_core::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    CollectionAdded,
    CollectionDeleted,
    ObjectAdded,
    ObjectsRead,
    ObjectsSearched,
    ObjectDeleted,
    Tokenized,
    Detokenized,
    TokensSearched,
    TokensDeleted,
    TokensUpdated,
    TokensRotated,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CollectionAdded => "collection.added",
            Self::CollectionDeleted => "collection.deleted",
            Self::ObjectAdded => "object.added",
            Self::ObjectsRead => "objects.read",
            Self::ObjectsSearched => "objects.searched",
            Self::ObjectDeleted => "object.deleted",
            Self::Tokenized => "tokens.created",
            Self::Detokenized => "tokens.detokenized",
            Self::TokensSearched => "tokens.searched",
            Self::TokensDeleted => "tokens.deleted",
            Self::TokensUpdated => "tokens.updated",
            Self::TokensRotated => "tokens.rotated",
        };
        write!(f, "{s}")
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: String,
    pub kind: AuditEventKind,
    pub caller: String,
    pub reason: String,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, ctx: &RequestContext, collection: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
            caller: ctx.caller.to_string(),
            reason: ctx.reason.to_string(),
            collection: collection.to_string(),
            object_ids: Vec::new(),
            token_ids: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_objects<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.object_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tokens<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.token_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_properties<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = props.into_iter().map(Into::into).collect();
        self
    }
}

/// Receiver of audit events. Implementations must not block for long.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes events as structured logs on the `piivault::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        info!(
            target: "piivault::audit",
            event_id = %event.event_id,
            kind = %event.kind,
            caller = %event.caller,
            reason = %event.reason,
            collection = %event.collection,
            objects = event.object_ids.len(),
            tokens = event.token_ids.len(),
            properties = ?event.properties,
            "audit"
        );
    }
}

/// Keeps events in memory; used by tests and the `validate` tooling.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
