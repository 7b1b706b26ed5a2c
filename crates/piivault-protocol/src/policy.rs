//! Purpose policy: maps (collection, property, reason) to an access level.
//!
//! Rules may use `*` for any field. Lookup picks the most specific matching
//! rule (fewest wildcards); among equally specific rules the most restrictive
//! wins. No matching rule means `denied`.

use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use piivault_core::{Error, Reason, Result};

pub const WILDCARD: &str = "*";

/// Access level granted by a rule. Ordered from least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Denied,
    Masked,
    Raw,
}

/// What the caller is about to do with a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadRaw,
    ReadMasked,
    Write,
    Search,
    Tokenize,
    Detokenize,
    Delete,
}

impl Operation {
    fn required(self) -> Access {
        match self {
            Operation::ReadRaw | Operation::Detokenize => Access::Raw,
            Operation::ReadMasked
            | Operation::Write
            | Operation::Search
            | Operation::Tokenize
            | Operation::Delete => Access::Masked,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Operation::ReadRaw => "read",
            Operation::ReadMasked => "read masked",
            Operation::Write => "write",
            Operation::Search => "search",
            Operation::Tokenize => "tokenize",
            Operation::Detokenize => "detokenize",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub collection: String,
    pub property: String,
    pub reason: String,
    pub access: Access,
}

impl PolicyRule {
    pub fn new(collection: &str, property: &str, reason: &str, access: Access) -> Self {
        Self {
            collection: collection.to_string(),
            property: property.to_string(),
            reason: reason.to_string(),
            access,
        }
    }

    /// Number of concrete (non-wildcard) fields when the rule matches, `None` otherwise.
    fn specificity(&self, collection: &str, property: &str, reason: &str) -> Option<u8> {
        let mut score = 0;
        for (pattern, value) in [
            (&self.collection, collection),
            (&self.property, property),
            (&self.reason, reason),
        ] {
            if pattern == WILDCARD {
                continue;
            }
            if pattern != value {
                return None;
            }
            score += 1;
        }
        Some(score)
    }
}

/// A (collection, property) pair whose raw value needs the `unsafe` option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveProperty {
    pub collection: String,
    pub property: String,
}

/// On-disk policy shape (`policy.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub sensitive: Vec<SensitiveProperty>,
}

impl PolicyDocument {
    /// Built-in policy: `AppFunctionality` and `Maintenance` read raw,
    /// `Analytics` reads masked only, `Marketing` may only touch `email`.
    pub fn builtin() -> Self {
        Self {
            rules: vec![
                PolicyRule::new(WILDCARD, WILDCARD, "AppFunctionality", Access::Raw),
                PolicyRule::new(WILDCARD, WILDCARD, "Maintenance", Access::Raw),
                PolicyRule::new(WILDCARD, WILDCARD, "Analytics", Access::Masked),
                PolicyRule::new(WILDCARD, WILDCARD, "Marketing", Access::Denied),
                PolicyRule::new(WILDCARD, "email", "Marketing", Access::Raw),
            ],
            sensitive: Vec::new(),
        }
    }
}

/// Policy table consulted before any value leaves the vault.
pub struct PolicyTable {
    doc: RwLock<PolicyDocument>,
}

impl PolicyTable {
    pub fn new(doc: PolicyDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    /// Load `policy.json`, falling back to the built-in policy when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let doc: PolicyDocument = serde_json::from_str(&data)?;
                info!(
                    "Policy loaded: {} rules, {} sensitive properties, path={}",
                    doc.rules.len(),
                    doc.sensitive.len(),
                    path.display()
                );
                Ok(Self::new(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No policy file at {}, using built-in policy", path.display());
                Ok(Self::new(PolicyDocument::builtin()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Swap in a new policy document.
    pub fn replace(&self, doc: PolicyDocument) {
        *self.doc.write() = doc;
    }

    pub fn snapshot(&self) -> PolicyDocument {
        self.doc.read().clone()
    }

    /// Effective access for one property.
    pub fn access(&self, collection: &str, property: &str, reason: &Reason) -> Access {
        let doc = self.doc.read();
        let mut best: Option<(u8, Access)> = None;
        for rule in &doc.rules {
            let Some(score) = rule.specificity(collection, property, reason.as_str()) else {
                continue;
            };
            best = match best {
                Some((s, a)) if s > score => Some((s, a)),
                Some((s, a)) if s == score => Some((s, a.min(rule.access))),
                _ => Some((score, rule.access)),
            };
        }
        best.map(|(_, access)| access).unwrap_or(Access::Denied)
    }

    /// Fail unless some rule mentions this reason (or any reason).
    pub fn check_reason(&self, reason: &Reason) -> Result<()> {
        let known = self
            .doc
            .read()
            .rules
            .iter()
            .any(|r| r.reason == WILDCARD || r.reason == reason.as_str());
        if known {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("reason '{}' is not permitted", reason)))
        }
    }

    /// Fail with `Forbidden` unless `op` on this property is allowed for `reason`.
    pub fn authorize(
        &self,
        collection: &str,
        property: &str,
        reason: &Reason,
        op: Operation,
    ) -> Result<()> {
        let access = self.access(collection, property, reason);
        if access >= op.required() {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "reason '{}' may not {} '{}.{}'",
                reason,
                op.verb(),
                collection,
                property
            )))
        }
    }

    /// Collection-wide operations (deleting objects or tokens) need the reason to
    /// reach at least one property of the collection at the required level.
    pub fn authorize_collection(
        &self,
        collection: &str,
        properties: &[String],
        reason: &Reason,
        op: Operation,
    ) -> Result<()> {
        self.check_reason(reason)?;
        if properties
            .iter()
            .any(|p| self.access(collection, p, reason) >= op.required())
        {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "reason '{}' may not {} in collection '{}'",
                reason,
                op.verb(),
                collection
            )))
        }
    }

    pub fn is_sensitive(&self, collection: &str, property: &str) -> bool {
        self.doc.read().sensitive.iter().any(|s| {
            (s.collection == WILDCARD || s.collection == collection)
                && (s.property == WILDCARD || s.property == property)
        })
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(PolicyDocument::builtin())
    }
}
