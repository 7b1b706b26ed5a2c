//! Property selection and projection.
//!
//! A selection names the properties a caller wants back and how each is
//! rendered. `ssn` asks for the raw value, `ssn.mask` for the masked one,
//! and `id` is accepted but implied: every result carries the object id.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::ListOptions;
use piivault_core::{Error, Result};
use piivault_protocol::{PiiType, PiiValue};
use piivault_store::Collection;

pub const ID_KEY: &str = "id";
pub const MASK_SUFFIX: &str = ".mask";
pub const CREATION_TIME_KEY: &str = "_creation_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    Raw,
    Masked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedProperty {
    /// Key in the result object; the selector as the caller wrote it.
    pub key: String,
    pub property: String,
    pub pii_type: PiiType,
    pub render: Render,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub properties: Vec<SelectedProperty>,
    pub include_metadata: bool,
}

impl Selection {
    /// Resolve selectors against a collection. Listing every property needs `unsafe`.
    pub fn parse(collection: &Collection, props: &[String], options: &ListOptions) -> Result<Self> {
        let mut properties: Vec<SelectedProperty> = Vec::new();

        if props.is_empty() {
            if !options.unsafe_access {
                return Err(Error::Validation(
                    "props must be given unless the 'unsafe' option is set".into(),
                ));
            }
            properties = collection
                .properties
                .iter()
                .map(|p| SelectedProperty {
                    key: p.name.clone(),
                    property: p.name.clone(),
                    pii_type: p.data_type_name,
                    render: Render::Raw,
                })
                .collect();
        }

        for selector in props {
            let selector = selector.trim();
            if selector == ID_KEY || properties.iter().any(|p| p.key == selector) {
                continue;
            }
            let (name, render) = match selector.strip_suffix(MASK_SUFFIX) {
                Some(name) => (name, Render::Masked),
                None => (selector, Render::Raw),
            };
            if name.contains('.') {
                return Err(Error::Validation(format!(
                    "unsupported transformation in '{}'",
                    selector
                )));
            }
            let property = collection.property(name).ok_or_else(|| {
                Error::Validation(format!(
                    "unknown property '{}' in collection '{}'",
                    name, collection.name
                ))
            })?;
            properties.push(SelectedProperty {
                key: selector.to_string(),
                property: property.name.clone(),
                pii_type: property.data_type_name,
                render,
            });
        }

        Ok(Self {
            properties,
            include_metadata: options.include_metadata,
        })
    }

    /// Downgrade raw selections of properties matching `sensitive` to masked.
    pub fn force_masked(&mut self, sensitive: impl Fn(&str) -> bool) {
        for selected in &mut self.properties {
            if selected.render == Render::Raw && sensitive(&selected.property) {
                selected.render = Render::Masked;
            }
        }
    }

    /// Distinct underlying property names.
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.properties.iter().map(|p| p.property.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Render one object. Absent (null) fields appear as JSON `null`.
    pub fn project(
        &self,
        object_id: &str,
        created_at_ms: i64,
        values: &BTreeMap<String, PiiValue>,
    ) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(ID_KEY.to_string(), Value::String(object_id.to_string()));
        for selected in &self.properties {
            let rendered = match values.get(&selected.property) {
                Some(value) => Value::String(match selected.render {
                    Render::Raw => value.canonical(),
                    Render::Masked => value.mask(),
                }),
                None => Value::Null,
            };
            out.insert(selected.key.clone(), rendered);
        }
        if self.include_metadata {
            let created = chrono::DateTime::from_timestamp_millis(created_at_ms)
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null);
            out.insert(CREATION_TIME_KEY.to_string(), created);
        }
        out
    }
}
