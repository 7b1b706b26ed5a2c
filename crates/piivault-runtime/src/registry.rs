//! Schema registry: collection definitions.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::vault::Vault;
use piivault_core::{Error, RequestContext, Result};
use piivault_protocol::{AuditEvent, AuditEventKind};
use piivault_store::Collection;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("valid regex"));

const RESERVED_PROPERTIES: &[&str] = &["id"];

impl Vault {
    /// Register a collection. Returns the stored definition, properties sorted by name.
    pub fn add_collection(&self, ctx: &RequestContext, definition: Collection) -> Result<Collection> {
        let mut collection = validate_definition(definition)?;
        collection.creation_time = Some(chrono::Utc::now().to_rfc3339());

        self.store.insert_collection(&collection, &ctx.deadline)?;
        info!(
            "Collection added: {} ({} properties)",
            collection.name,
            collection.properties.len()
        );
        self.emit(
            AuditEvent::new(AuditEventKind::CollectionAdded, ctx, &collection.name)
                .with_properties(collection.property_names()),
        );
        Ok(collection)
    }

    pub fn get_collection(&self, ctx: &RequestContext, name: &str) -> Result<Collection> {
        self.require_collection(name, ctx)
    }

    /// All collections, sorted by name.
    pub fn list_collections(&self, ctx: &RequestContext) -> Result<Vec<Collection>> {
        self.retry.run(&ctx.deadline, "list collections", || {
            self.store.list_collections(&ctx.deadline)
        })
    }

    /// Remove a collection together with its objects and tokens.
    pub fn delete_collection(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        if !self.store.delete_collection(name, &ctx.deadline)? {
            return Err(Error::NotFound(format!("collection '{}' not found", name)));
        }
        info!("Collection deleted: {}", name);
        self.emit(AuditEvent::new(AuditEventKind::CollectionDeleted, ctx, name));
        Ok(())
    }
}

fn validate_definition(mut collection: Collection) -> Result<Collection> {
    if !NAME_RE.is_match(&collection.name) {
        return Err(Error::Validation(format!(
            "invalid collection name '{}'",
            collection.name
        )));
    }
    if collection.properties.is_empty() {
        return Err(Error::Validation(format!(
            "collection '{}' has no properties",
            collection.name
        )));
    }

    let mut seen = HashSet::new();
    for property in &collection.properties {
        if RESERVED_PROPERTIES.contains(&property.name.as_str()) {
            return Err(Error::Validation(format!(
                "property name '{}' is reserved",
                property.name
            )));
        }
        if property.name.contains('.') {
            return Err(Error::Validation(format!(
                "property name '{}' must not contain '.'",
                property.name
            )));
        }
        if !NAME_RE.is_match(&property.name) {
            return Err(Error::Validation(format!(
                "invalid property name '{}'",
                property.name
            )));
        }
        if !seen.insert(property.name.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate property '{}'",
                property.name
            )));
        }
        if property.is_unique && !property.data_type_name.supports_unique() {
            return Err(Error::Validation(format!(
                "property '{}' of type {} cannot be unique",
                property.name, property.data_type_name
            )));
        }
    }

    collection.properties.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(collection)
}
