//! Tokenization engine: issue, resolve, search, retag, rotate and revoke tokens.
//!
//! A pointer token re-reads the live object on every detokenize; once the
//! object is deleted it is invalidated and resolves as `Gone`. A randomized
//! token carries an encrypted snapshot and never looks at the object again.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::*;
use crate::vault::Vault;
use piivault_core::{Error, RequestContext, Result};
use piivault_protocol::{AuditEvent, AuditEventKind, Operation, PiiValue};
use piivault_store::{Collection, TokenFilter, TokenRecord, TokenTarget, TokenType};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn rfc3339(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl Vault {
    /// Issue one token per request. Each item succeeds or fails on its own.
    pub fn tokenize(
        &self,
        collection: &str,
        ctx: &RequestContext,
        requests: &[TokenizeRequest],
    ) -> Result<Vec<ItemOutcome<TokenValue>>> {
        self.policy.check_reason(&ctx.reason)?;
        let coll = self.require_collection(collection, ctx)?;

        let mut outcomes = Vec::with_capacity(requests.len());
        let mut issued = Vec::new();
        let mut props = Vec::new();
        for request in requests {
            let result = self.tokenize_one(&coll, ctx, request);
            if let Ok(value) = &result {
                issued.push(value.token_id.clone());
                props.extend(request.props.iter().cloned());
            }
            outcomes.push(ItemOutcome::from(result));
        }

        props.sort();
        props.dedup();
        debug!(
            "Tokenized in {}: {}/{} succeeded",
            collection,
            issued.len(),
            requests.len()
        );
        self.emit(
            AuditEvent::new(AuditEventKind::Tokenized, ctx, collection)
                .with_tokens(issued)
                .with_properties(props),
        );
        Ok(outcomes)
    }

    fn tokenize_one(
        &self,
        coll: &Collection,
        ctx: &RequestContext,
        request: &TokenizeRequest,
    ) -> Result<TokenValue> {
        let tags = normalize_tags(&request.tags)?;
        let created_at = now_ms();
        let expires_at = match request.ttl_seconds {
            Some(0) => return Err(Error::Validation("ttl_seconds must be positive".into())),
            Some(ttl) => {
                let ttl_ms = i64::try_from(ttl.saturating_mul(1000)).unwrap_or(i64::MAX);
                Some(created_at.saturating_add(ttl_ms))
            }
            None => None,
        };

        let target = match request.token_type {
            TokenType::Pointer => self.pointer_target(coll, ctx, request)?,
            TokenType::Randomized => self.randomized_target(coll, ctx, request)?,
        };

        let record = TokenRecord {
            token_id: Uuid::new_v4().to_string(),
            collection: coll.name.clone(),
            target,
            tags,
            created_at,
            expires_at,
            invalidated_at: None,
        };
        self.store.insert_token(&record, &ctx.deadline)?;
        Ok(TokenValue {
            token_id: record.token_id,
            token_type: request.token_type,
            expiration: expires_at.map(rfc3339),
        })
    }

    fn pointer_target(
        &self,
        coll: &Collection,
        ctx: &RequestContext,
        request: &TokenizeRequest,
    ) -> Result<TokenTarget> {
        if request.object.fields.is_some() {
            return Err(Error::Validation(
                "pointer tokens must reference a stored object".into(),
            ));
        }
        let object_id = request
            .object
            .id
            .clone()
            .ok_or_else(|| Error::Validation("pointer tokens need object.id".into()))?;
        let props = self.token_props(coll, ctx, &request.props)?;
        Ok(TokenTarget::Pointer { object_id, props })
    }

    fn randomized_target(
        &self,
        coll: &Collection,
        ctx: &RequestContext,
        request: &TokenizeRequest,
    ) -> Result<TokenTarget> {
        let (snapshot, props, origin_object_id) = match (&request.object.id, &request.object.fields)
        {
            (Some(object_id), None) => {
                let props = self.token_props(coll, ctx, &request.props)?;
                let object = self
                    .store
                    .get_object(&coll.name, object_id, &ctx.deadline)?
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "object '{}' not found in '{}'",
                            object_id, coll.name
                        ))
                    })?;
                let values = self.decrypt_object(coll, &object, &props)?;
                let snapshot: Map<String, Value> = props
                    .iter()
                    .map(|p| {
                        let v = values
                            .get(p)
                            .map(|v| Value::String(v.canonical()))
                            .unwrap_or(Value::Null);
                        (p.clone(), v)
                    })
                    .collect();
                (snapshot, props, Some(object_id.clone()))
            }
            (None, Some(fields)) => {
                if !request.props.is_empty() {
                    return Err(Error::Validation(
                        "inline randomized tokens take their properties from object.fields".into(),
                    ));
                }
                let supplied: Vec<String> = fields.keys().cloned().collect();
                let props = self.token_props(coll, ctx, &supplied)?;
                let values = validate_inline(coll, fields)?;
                let snapshot: Map<String, Value> = values
                    .into_iter()
                    .map(|(p, v)| (p, Value::String(v)))
                    .collect();
                (snapshot, props, None)
            }
            _ => {
                return Err(Error::Validation(
                    "randomized tokens need exactly one of object.id or object.fields".into(),
                ))
            }
        };

        let sealed = self.cipher.encrypt(
            &serde_json::to_vec(&snapshot)?,
            &Self::snapshot_aad(&coll.name),
        )?;
        Ok(TokenTarget::Randomized {
            snapshot: sealed,
            props,
            origin_object_id,
        })
    }

    /// Check token properties exist and may be tokenized. Sorted, de-duplicated.
    fn token_props(
        &self,
        coll: &Collection,
        ctx: &RequestContext,
        props: &[String],
    ) -> Result<Vec<String>> {
        if props.is_empty() {
            return Err(Error::Validation("tokens need at least one property".into()));
        }
        let mut out = Vec::with_capacity(props.len());
        for name in props {
            if coll.property(name).is_none() {
                return Err(Error::Validation(format!(
                    "unknown property '{}' in collection '{}'",
                    name, coll.name
                )));
            }
            self.policy
                .authorize(&coll.name, name, &ctx.reason, Operation::Tokenize)?;
            out.push(name.clone());
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Resolve tokens to values, one outcome per id in request order.
    pub fn detokenize(
        &self,
        collection: &str,
        ctx: &RequestContext,
        token_ids: &[String],
    ) -> Result<Vec<ItemOutcome<DetokenizedToken>>> {
        self.policy.check_reason(&ctx.reason)?;
        let coll = self.require_collection(collection, ctx)?;
        let records = self.retry.run(&ctx.deadline, "detokenize", || {
            self.store.get_tokens(collection, token_ids, &ctx.deadline)
        })?;
        let by_id: HashMap<&str, &TokenRecord> =
            records.iter().map(|r| (r.token_id.as_str(), r)).collect();

        let now = now_ms();
        let mut outcomes = Vec::with_capacity(token_ids.len());
        let mut resolved = Vec::new();
        let mut props = Vec::new();
        for token_id in token_ids {
            let result = match by_id.get(token_id.as_str()) {
                Some(record) if !record.is_expired(now) => self.resolve_token(&coll, ctx, record),
                _ => Err(Error::NotFound(format!("token '{}' not found", token_id))),
            };
            if let Ok(token) = &result {
                resolved.push(token.token_id.clone());
                props.extend(token.fields.keys().cloned());
            }
            outcomes.push(ItemOutcome::from(result));
        }

        props.sort();
        props.dedup();
        self.emit(
            AuditEvent::new(AuditEventKind::Detokenized, ctx, collection)
                .with_tokens(resolved)
                .with_properties(props),
        );
        Ok(outcomes)
    }

    /// Resolve every live token carrying all of `tags`.
    pub fn detokenize_by_tags(
        &self,
        collection: &str,
        ctx: &RequestContext,
        tags: &[String],
    ) -> Result<Vec<ItemOutcome<DetokenizedToken>>> {
        let tags = normalize_tags(tags)?;
        if tags.is_empty() {
            return Err(Error::Validation("at least one tag is required".into()));
        }
        self.policy.check_reason(&ctx.reason)?;
        let ids: Vec<String> = self
            .live_tokens(collection, ctx, &TokenQuery::by_tags(&tags))?
            .into_iter()
            .map(|t| t.token_id)
            .collect();
        self.detokenize(collection, ctx, &ids)
    }

    fn resolve_token(
        &self,
        coll: &Collection,
        ctx: &RequestContext,
        record: &TokenRecord,
    ) -> Result<DetokenizedToken> {
        for prop in record.target.props() {
            self.policy
                .authorize(&coll.name, prop, &ctx.reason, Operation::Detokenize)?;
        }
        if record.invalidated_at.is_some() {
            return Err(gone(record));
        }

        let fields = match &record.target {
            TokenTarget::Pointer { object_id, props } => {
                let object = self
                    .store
                    .get_object(&coll.name, object_id, &ctx.deadline)?
                    .ok_or_else(|| gone(record))?;
                let values = self.decrypt_object(coll, &object, props)?;
                props
                    .iter()
                    .map(|p| {
                        let v = values
                            .get(p)
                            .map(|v| Value::String(v.canonical()))
                            .unwrap_or(Value::Null);
                        (p.clone(), v)
                    })
                    .collect()
            }
            TokenTarget::Randomized { snapshot, .. } => {
                let plaintext = self
                    .cipher
                    .decrypt(snapshot, &Self::snapshot_aad(&coll.name))?;
                serde_json::from_slice(&plaintext)?
            }
        };

        Ok(DetokenizedToken {
            token_id: record.token_id.clone(),
            fields,
            object_id: record.target.object_id().map(str::to_string),
            tags: record.tags.clone(),
        })
    }

    /// Live tokens matching every given filter, in creation order.
    pub fn search_tokens(
        &self,
        collection: &str,
        ctx: &RequestContext,
        query: &TokenQuery,
    ) -> Result<Vec<TokenInfo>> {
        self.policy.check_reason(&ctx.reason)?;
        let tokens = self.live_tokens(collection, ctx, query)?;
        let infos: Vec<TokenInfo> = tokens.iter().map(token_info).collect();
        self.emit(
            AuditEvent::new(AuditEventKind::TokensSearched, ctx, collection)
                .with_tokens(infos.iter().map(|t| t.token_id.as_str())),
        );
        Ok(infos)
    }

    /// Tokens for the given objects: pointers to them and snapshots taken from them.
    pub fn search_tokens_by_object(
        &self,
        collection: &str,
        ctx: &RequestContext,
        object_ids: &[String],
    ) -> Result<Vec<TokenInfo>> {
        self.search_tokens(collection, ctx, &TokenQuery::by_objects(object_ids))
    }

    /// Delete matching tokens, live or not. Deleting absent tokens is not an error.
    pub fn delete_tokens(
        &self,
        collection: &str,
        ctx: &RequestContext,
        query: &TokenQuery,
    ) -> Result<usize> {
        let coll = self.require_collection(collection, ctx)?;
        self.policy.authorize_collection(
            collection,
            &coll.property_names(),
            &ctx.reason,
            Operation::Delete,
        )?;
        let filter = store_filter(query)?;
        let deleted = self
            .store
            .delete_tokens(collection, &filter, &ctx.deadline)?;
        info!("Tokens deleted in {}: {}", collection, deleted);
        self.emit(
            AuditEvent::new(AuditEventKind::TokensDeleted, ctx, collection)
                .with_tokens(query.token_ids.iter().flatten().map(String::as_str)),
        );
        Ok(deleted)
    }

    /// Replace the tag set of matching live tokens. Returns the ids updated.
    pub fn update_tokens(
        &self,
        collection: &str,
        ctx: &RequestContext,
        query: &TokenQuery,
        tags: &[String],
    ) -> Result<Vec<String>> {
        let coll = self.require_collection(collection, ctx)?;
        self.policy.authorize_collection(
            collection,
            &coll.property_names(),
            &ctx.reason,
            Operation::Tokenize,
        )?;
        let tags = normalize_tags(tags)?;
        let filter = store_filter(query)?;
        let updated = self
            .store
            .update_token_tags(collection, &filter, &tags, &ctx.deadline)?;
        self.emit(
            AuditEvent::new(AuditEventKind::TokensUpdated, ctx, collection)
                .with_tokens(updated.iter().map(String::as_str)),
        );
        Ok(updated)
    }

    /// Issue a fresh id for every matching live token. The old ids stop resolving.
    pub fn rotate_tokens(
        &self,
        collection: &str,
        ctx: &RequestContext,
        query: &TokenQuery,
    ) -> Result<RotatedTokens> {
        let coll = self.require_collection(collection, ctx)?;
        self.policy.authorize_collection(
            collection,
            &coll.property_names(),
            &ctx.reason,
            Operation::Tokenize,
        )?;
        let pairs: Vec<(String, String)> = self
            .live_tokens(collection, ctx, query)?
            .into_iter()
            .map(|t| (t.token_id, Uuid::new_v4().to_string()))
            .collect();
        let applied = self.store.rotate_tokens(collection, &pairs, &ctx.deadline)?;
        info!("Tokens rotated in {}: {}", collection, applied.len());
        self.emit(
            AuditEvent::new(AuditEventKind::TokensRotated, ctx, collection)
                .with_tokens(applied.iter().map(|(old, _)| old.as_str())),
        );
        Ok(applied.into_iter().collect())
    }

    fn live_tokens(
        &self,
        collection: &str,
        ctx: &RequestContext,
        query: &TokenQuery,
    ) -> Result<Vec<TokenRecord>> {
        let filter = store_filter(query)?;
        self.require_collection(collection, ctx)?;
        self.retry.run(&ctx.deadline, "search tokens", || {
            self.store.search_tokens(collection, &filter, &ctx.deadline)
        })
    }
}

fn gone(record: &TokenRecord) -> Error {
    Error::Gone(format!(
        "token '{}' refers to an object that no longer exists",
        record.token_id
    ))
}

fn store_filter(query: &TokenQuery) -> Result<TokenFilter> {
    if query.is_empty() {
        return Err(Error::Validation(
            "give at least one of object_ids, token_ids or tags".into(),
        ));
    }
    Ok(TokenFilter {
        object_ids: query.object_ids.clone(),
        token_ids: query.token_ids.clone(),
        tags: query.tags.as_deref().map(normalize_tags).transpose()?,
    })
}

fn token_info(record: &TokenRecord) -> TokenInfo {
    TokenInfo {
        token_id: record.token_id.clone(),
        token_type: record.target.token_type(),
        object_id: record.target.object_id().map(str::to_string),
        props: record.target.props().to_vec(),
        tags: record.tags.clone(),
        creation_time: rfc3339(record.created_at),
        expiration: record.expires_at.map(rfc3339),
    }
}

/// Validate an inline bundle. Unlike a stored object it may be partial.
/// Returns canonical strings for the non-null values.
fn validate_inline(coll: &Collection, fields: &ObjectFields) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        let property = coll.property(name).ok_or_else(|| {
            Error::Validation(format!(
                "unknown property '{}' in collection '{}'",
                name, coll.name
            ))
        })?;
        match value {
            Value::Null if property.is_nullable => {}
            Value::String(raw) => {
                let parsed = PiiValue::parse(property.data_type_name, raw)?;
                out.push((name.clone(), parsed.canonical()));
            }
            other => {
                return Err(Error::Validation(format!(
                    "property '{}' cannot be {}",
                    name, other
                )))
            }
        }
    }
    Ok(out)
}
