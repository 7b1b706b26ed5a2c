//! Privacy protocol: PII data types, purpose policy, audit events, field cipher.
//!
//! Provides the closed set of PII property types with their validators and
//! maskers, the (collection, property, reason) policy table, the audit event
//! model with its sinks, and the field cipher used for encryption at rest and
//! blind equality indexes.

pub mod audit;
pub mod cipher;
pub mod pii;
pub mod policy;

pub use audit::{AuditEvent, AuditEventKind, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use cipher::{AesGcmCipher, FieldCipher};
pub use pii::{PiiType, PiiValue};
pub use policy::{Access, Operation, PolicyDocument, PolicyRule, PolicyTable, SensitiveProperty};
