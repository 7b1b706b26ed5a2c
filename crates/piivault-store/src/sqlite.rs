//! SQLite-backed vault store.
//!
//! One connection behind a mutex. Every mutation runs in its own transaction,
//! and every lock acquisition is bounded by the caller's [`Deadline`]. The
//! store never sees plaintext: field values arrive encrypted and equality
//! lookups go through blind indexes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::schema::SCHEMA_SQL;
use crate::types::*;
use piivault_core::{Deadline, Error, Result};

pub const DB_FILE: &str = "piivault.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN_COLUMNS: &str = "token_id, collection, token_type, object_id, props_json, snapshot, \
                             tags_json, created_at, expires_at, invalidated_at";

/// SQLite store for collections, encrypted objects, tokens and idempotency keys.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Map a rusqlite error onto the vault taxonomy.
pub fn db_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return Error::Unavailable(e.to_string());
        }
    }
    Error::Database(e.to_string())
}

fn unique_or(e: rusqlite::Error, conflict: impl FnOnce() -> Error) -> Error {
    if e.to_string().contains("UNIQUE constraint") {
        conflict()
    } else {
        db_err(e)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteStore {
    /// Open or create the store. The file will be `db_dir/piivault.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join(DB_FILE);

        let conn = Self::create_connection(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let stats = store.get_stats()?;
        info!(
            "SqliteStore initialized: {} collections, {} objects, {} tokens, path={}",
            stats.collections,
            stats.objects,
            stats.tokens,
            store.db_path.display()
        );
        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Acquire the connection, waiting no longer than the deadline allows.
    fn lock(&self, deadline: &Deadline) -> Result<MutexGuard<'_, Connection>> {
        deadline.check("store access")?;
        match deadline.remaining() {
            None => Ok(self.conn.lock()),
            Some(remaining) => self.conn.try_lock_for(remaining).ok_or_else(|| {
                Error::Unavailable("store busy past the request deadline".into())
            }),
        }
    }

    // ---------------------------------------------------------------
    // Collections
    // ---------------------------------------------------------------

    pub fn insert_collection(&self, collection: &Collection, deadline: &Deadline) -> Result<()> {
        let definition = serde_json::to_string(collection)?;
        let conn = self.lock(deadline)?;
        conn.prepare_cached(
            "INSERT INTO collections (name, definition_json, created_at) VALUES (?1, ?2, ?3)",
        )
        .map_err(db_err)?
        .execute(params![collection.name, definition, now_ms()])
        .map_err(|e| {
            unique_or(e, || {
                Error::Conflict(format!("collection '{}' already exists", collection.name))
            })
        })?;
        debug!("Collection stored: {}", collection.name);
        Ok(())
    }

    pub fn get_collection(&self, name: &str, deadline: &Deadline) -> Result<Option<Collection>> {
        let conn = self.lock(deadline)?;
        let definition: Option<String> = conn
            .prepare_cached("SELECT definition_json FROM collections WHERE name = ?1")
            .map_err(db_err)?
            .query_row(params![name], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        definition
            .map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    /// All collections, sorted by name.
    pub fn list_collections(&self, deadline: &Deadline) -> Result<Vec<Collection>> {
        let conn = self.lock(deadline)?;
        let mut stmt = conn
            .prepare_cached("SELECT definition_json FROM collections ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    /// Remove a collection with its objects, fields, tokens and idempotency keys.
    /// Returns false if it did not exist.
    pub fn delete_collection(&self, name: &str, deadline: &Deadline) -> Result<bool> {
        let conn = self.lock(deadline)?;
        let deleted = conn
            .prepare_cached("DELETE FROM collections WHERE name = ?1")
            .map_err(db_err)?
            .execute(params![name])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // ---------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------

    /// Insert one object and its encrypted fields in a single transaction.
    ///
    /// Unique fields are checked against every committed object first; the
    /// partial unique index backs the check if two writers race.
    pub fn insert_object(
        &self,
        collection: &str,
        object_id: &str,
        fields: &[FieldRecord],
        idempotency_key: Option<&str>,
        deadline: &Deadline,
    ) -> Result<InsertOutcome> {
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;

        if let Some(key) = idempotency_key {
            let existing: Option<String> = tx
                .prepare_cached(
                    "SELECT object_id FROM idempotency_keys WHERE collection = ?1 AND key = ?2",
                )
                .map_err(db_err)?
                .query_row(params![collection, key], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            if let Some(object_id) = existing {
                debug!("Idempotent replay in {}: {}", collection, object_id);
                return Ok(InsertOutcome {
                    object_id,
                    replayed: true,
                });
            }
        }

        for field in fields.iter().filter(|f| f.is_unique) {
            let taken: bool = tx
                .prepare_cached(
                    "SELECT EXISTS(SELECT 1 FROM object_fields
                     WHERE collection = ?1 AND property = ?2 AND blind_index = ?3 AND is_unique = 1)",
                )
                .map_err(db_err)?
                .query_row(
                    params![collection, field.property, field.blind_index],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if taken {
                return Err(duplicate_value(collection, &field.property));
            }
        }

        let now = now_ms();
        let seq = tx
            .prepare_cached("INSERT INTO objects (id, collection, created_at) VALUES (?1, ?2, ?3)")
            .map_err(db_err)?
            .insert(params![object_id, collection, now])
            .map_err(|e| {
                unique_or(e, || {
                    Error::Conflict(format!("object id '{}' already exists", object_id))
                })
            })?;

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO object_fields
                     (object_seq, collection, property, ciphertext, blind_index, is_unique)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(db_err)?;
            for field in fields {
                stmt.execute(params![
                    seq,
                    collection,
                    field.property,
                    field.ciphertext,
                    field.blind_index,
                    field.is_unique
                ])
                .map_err(|e| unique_or(e, || duplicate_value(collection, &field.property)))?;
            }
        }

        if let Some(key) = idempotency_key {
            tx.prepare_cached(
                "INSERT INTO idempotency_keys (collection, key, object_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(db_err)?
            .execute(params![collection, key, object_id, now])
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        debug!(
            "Object stored in {}: {} ({} fields)",
            collection,
            object_id,
            fields.len()
        );
        Ok(InsertOutcome {
            object_id: object_id.to_string(),
            replayed: false,
        })
    }

    pub fn get_object(
        &self,
        collection: &str,
        object_id: &str,
        deadline: &Deadline,
    ) -> Result<Option<StoredObject>> {
        let conn = self.lock(deadline)?;
        let head: Option<(i64, i64)> = conn
            .prepare_cached("SELECT seq, created_at FROM objects WHERE collection = ?1 AND id = ?2")
            .map_err(db_err)?
            .query_row(params![collection, object_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(db_err)?;
        match head {
            Some((seq, created_at)) => Ok(Some(StoredObject {
                seq,
                id: object_id.to_string(),
                created_at,
                fields: Self::load_fields(&conn, seq)?,
            })),
            None => Ok(None),
        }
    }

    /// Ids from `ids` that do not name a live object of the collection.
    pub fn missing_object_ids(
        &self,
        collection: &str,
        ids: &[String],
        deadline: &Deadline,
    ) -> Result<Vec<String>> {
        let conn = self.lock(deadline)?;
        let mut stmt = conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM objects WHERE collection = ?1 AND id = ?2)")
            .map_err(db_err)?;
        let mut missing = Vec::new();
        for id in ids {
            let exists: bool = stmt
                .query_row(params![collection, id], |row| row.get(0))
                .map_err(db_err)?;
            if !exists {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    }

    /// Read one page of objects in insertion order.
    ///
    /// Only objects with `after_seq < seq <= high_water` are visible. When
    /// `high_water` is `None` the current maximum is taken and returned, so
    /// a listing started now never sees later inserts on later pages.
    pub fn page_objects(
        &self,
        collection: &str,
        filter: &ObjectFilter,
        after_seq: i64,
        high_water: Option<i64>,
        limit: usize,
        deadline: &Deadline,
    ) -> Result<StoredPage> {
        let conn = self.lock(deadline)?;
        let high_water = match high_water {
            Some(h) => h,
            None => conn
                .prepare_cached("SELECT COALESCE(MAX(seq), 0) FROM objects")
                .map_err(db_err)?
                .query_row([], |row| row.get(0))
                .map_err(db_err)?,
        };

        let mut args: Vec<Value> = vec![
            Value::Text(collection.to_string()),
            Value::Integer(after_seq),
            Value::Integer(high_water),
        ];
        let mut clauses = String::new();
        match filter {
            ObjectFilter::All => {}
            ObjectFilter::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(StoredPage {
                        objects: Vec::new(),
                        high_water,
                        matching: 0,
                    });
                }
                let marks: Vec<String> = (0..ids.len())
                    .map(|i| format!("?{}", args.len() + i + 1))
                    .collect();
                clauses.push_str(&format!(" AND o.id IN ({})", marks.join(", ")));
                args.extend(ids.iter().map(|id| Value::Text(id.clone())));
            }
            ObjectFilter::Match(pairs) => {
                for (property, blind_index) in pairs {
                    let p = args.len() + 1;
                    clauses.push_str(&format!(
                        " AND EXISTS (SELECT 1 FROM object_fields f WHERE f.object_seq = o.seq \
                         AND f.property = ?{} AND f.blind_index = ?{})",
                        p,
                        p + 1
                    ));
                    args.push(Value::Text(property.clone()));
                    args.push(Value::Text(blind_index.clone()));
                }
            }
        }

        let from = format!(
            "FROM objects o WHERE o.collection = ?1 AND o.seq > ?2 AND o.seq <= ?3{}",
            clauses
        );
        let matching: i64 = conn
            .prepare(&format!("SELECT COUNT(*) {}", from))
            .map_err(db_err)?
            .query_row(params_from_iter(args.iter()), |row| row.get(0))
            .map_err(db_err)?;

        let heads = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT o.seq, o.id, o.created_at {} ORDER BY o.seq LIMIT {}",
                    from, limit
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        let mut objects = Vec::with_capacity(heads.len());
        for (seq, id, created_at) in heads {
            objects.push(StoredObject {
                seq,
                id,
                created_at,
                fields: Self::load_fields(&conn, seq)?,
            });
        }

        Ok(StoredPage {
            objects,
            high_water,
            matching,
        })
    }

    /// Delete an object and invalidate every pointer token referencing it,
    /// in one transaction. Returns the number of tokens invalidated.
    pub fn delete_object(
        &self,
        collection: &str,
        object_id: &str,
        deadline: &Deadline,
    ) -> Result<usize> {
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;

        let deleted = tx
            .prepare_cached("DELETE FROM objects WHERE collection = ?1 AND id = ?2")
            .map_err(db_err)?
            .execute(params![collection, object_id])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::NotFound(format!(
                "object '{}' not found in '{}'",
                object_id, collection
            )));
        }

        let invalidated = tx
            .prepare_cached(
                "UPDATE tokens SET invalidated_at = ?3
                 WHERE collection = ?1 AND object_id = ?2
                   AND token_type = 'POINTER' AND invalidated_at IS NULL",
            )
            .map_err(db_err)?
            .execute(params![collection, object_id, now_ms()])
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        debug!(
            "Object deleted from {}: {} ({} tokens invalidated)",
            collection, object_id, invalidated
        );
        Ok(invalidated)
    }

    fn load_fields(conn: &Connection, seq: i64) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut stmt = conn
            .prepare_cached("SELECT property, ciphertext FROM object_fields WHERE object_seq = ?1")
            .map_err(db_err)?;
        let fields = stmt
            .query_map(params![seq], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map_err(db_err)?;
        Ok(fields)
    }

    // ---------------------------------------------------------------
    // Tokens
    // ---------------------------------------------------------------

    /// Store a token. A pointer's target object must exist at commit time.
    pub fn insert_token(&self, token: &TokenRecord, deadline: &Deadline) -> Result<()> {
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;

        let (object_id, snapshot) = match &token.target {
            TokenTarget::Pointer { object_id, .. } => {
                let exists: bool = tx
                    .prepare_cached(
                        "SELECT EXISTS(SELECT 1 FROM objects WHERE collection = ?1 AND id = ?2)",
                    )
                    .map_err(db_err)?
                    .query_row(params![token.collection, object_id], |row| row.get(0))
                    .map_err(db_err)?;
                if !exists {
                    return Err(Error::NotFound(format!(
                        "object '{}' not found in '{}'",
                        object_id, token.collection
                    )));
                }
                (Some(object_id.as_str()), None)
            }
            TokenTarget::Randomized {
                snapshot,
                origin_object_id,
                ..
            } => (origin_object_id.as_deref(), Some(snapshot.as_slice())),
        };

        tx.prepare_cached(
            "INSERT INTO tokens
             (token_id, collection, token_type, object_id, props_json, snapshot, tags_json,
              created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .map_err(db_err)?
        .execute(params![
            token.token_id,
            token.collection,
            token.target.token_type().as_str(),
            object_id,
            serde_json::to_string(token.target.props())?,
            snapshot,
            serde_json::to_string(&token.tags)?,
            token.created_at,
            token.expires_at
        ])
        .map_err(|e| {
            unique_or(e, || {
                Error::Conflict(format!("token id '{}' already exists", token.token_id))
            })
        })?;

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Tokens by id in any state (live, invalidated, expired). Unknown ids are skipped.
    pub fn get_tokens(
        &self,
        collection: &str,
        token_ids: &[String],
        deadline: &Deadline,
    ) -> Result<Vec<TokenRecord>> {
        let filter = TokenFilter {
            token_ids: Some(token_ids.to_vec()),
            ..Default::default()
        };
        let conn = self.lock(deadline)?;
        Self::select_tokens(&conn, collection, &filter, None)
    }

    /// Live tokens matching every given filter, in creation order.
    pub fn search_tokens(
        &self,
        collection: &str,
        filter: &TokenFilter,
        deadline: &Deadline,
    ) -> Result<Vec<TokenRecord>> {
        let conn = self.lock(deadline)?;
        Self::select_tokens(&conn, collection, filter, Some(now_ms()))
    }

    /// Delete tokens matching the filter, whatever their state. Returns the count.
    pub fn delete_tokens(
        &self,
        collection: &str,
        filter: &TokenFilter,
        deadline: &Deadline,
    ) -> Result<usize> {
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;
        let matched = Self::select_tokens(&tx, collection, filter, None)?;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM tokens WHERE collection = ?1 AND token_id = ?2")
                .map_err(db_err)?;
            for token in &matched {
                stmt.execute(params![collection, token.token_id])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(matched.len())
    }

    /// Replace the tags of live tokens matching the filter. Returns the ids updated.
    pub fn update_token_tags(
        &self,
        collection: &str,
        filter: &TokenFilter,
        tags: &[String],
        deadline: &Deadline,
    ) -> Result<Vec<String>> {
        let tags_json = serde_json::to_string(tags)?;
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;
        let matched = Self::select_tokens(&tx, collection, filter, Some(now_ms()))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE tokens SET tags_json = ?3 WHERE collection = ?1 AND token_id = ?2",
                )
                .map_err(db_err)?;
            for token in &matched {
                stmt.execute(params![collection, token.token_id, tags_json])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(matched.into_iter().map(|t| t.token_id).collect())
    }

    /// Give live tokens new ids. `pairs` is (old, new); returns the pairs applied.
    pub fn rotate_tokens(
        &self,
        collection: &str,
        pairs: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<Vec<(String, String)>> {
        let mut conn = self.lock(deadline)?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = now_ms();
        let mut applied = Vec::new();
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE tokens SET token_id = ?3
                     WHERE collection = ?1 AND token_id = ?2 AND invalidated_at IS NULL
                       AND (expires_at IS NULL OR expires_at > ?4)",
                )
                .map_err(db_err)?;
            for (old, new) in pairs {
                let n = stmt
                    .execute(params![collection, old, new, now])
                    .map_err(|e| {
                        unique_or(e, || {
                            Error::Conflict(format!("token id '{}' already exists", new))
                        })
                    })?;
                if n > 0 {
                    applied.push((old.clone(), new.clone()));
                }
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(applied)
    }

    /// Shared token query. `live_at` restricts to tokens neither invalidated
    /// nor expired at that instant.
    fn select_tokens(
        conn: &Connection,
        collection: &str,
        filter: &TokenFilter,
        live_at: Option<i64>,
    ) -> Result<Vec<TokenRecord>> {
        let mut sql = format!("SELECT {} FROM tokens WHERE collection = ?1", TOKEN_COLUMNS);
        let mut args: Vec<Value> = vec![Value::Text(collection.to_string())];

        if let Some(now) = live_at {
            sql.push_str(&format!(
                " AND invalidated_at IS NULL AND (expires_at IS NULL OR expires_at > ?{})",
                args.len() + 1
            ));
            args.push(Value::Integer(now));
        }
        for (column, values) in [
            ("object_id", &filter.object_ids),
            ("token_id", &filter.token_ids),
        ] {
            let Some(values) = values else { continue };
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let marks: Vec<String> = (0..values.len())
                .map(|i| format!("?{}", args.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND {} IN ({})", column, marks.join(", ")));
            args.extend(values.iter().map(|v| Value::Text(v.clone())));
        }
        sql.push_str(" ORDER BY seq");

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let tokens = stmt
            .query_map(params_from_iter(args.iter()), Self::row_to_token)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        // Tags live in a JSON column; a token matches when it carries all requested tags.
        Ok(match &filter.tags {
            Some(tags) => tokens
                .into_iter()
                .filter(|t| tags.iter().all(|tag| t.tags.contains(tag)))
                .collect(),
            None => tokens,
        })
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let (collections, objects, tokens, invalidated_tokens) = {
            let conn = self.conn.lock();
            let count = |sql: &str| -> Result<i64> {
                conn.query_row(sql, [], |row| row.get(0)).map_err(db_err)
            };
            (
                count("SELECT COUNT(*) FROM collections")?,
                count("SELECT COUNT(*) FROM objects")?,
                count("SELECT COUNT(*) FROM tokens")?,
                count("SELECT COUNT(*) FROM tokens WHERE invalidated_at IS NOT NULL")?,
            )
        };

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            collections,
            objects,
            tokens,
            invalidated_tokens,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRecord> {
        let token_type: String = row.get("token_type")?;
        let object_id: Option<String> = row.get("object_id")?;
        let props: Vec<String> = json_column(row, "props_json")?;
        let target = if token_type == TokenType::Pointer.as_str() {
            TokenTarget::Pointer {
                object_id: object_id.unwrap_or_default(),
                props,
            }
        } else {
            TokenTarget::Randomized {
                snapshot: row.get::<_, Option<Vec<u8>>>("snapshot")?.unwrap_or_default(),
                props,
                origin_object_id: object_id,
            }
        };
        Ok(TokenRecord {
            token_id: row.get("token_id")?,
            collection: row.get("collection")?,
            target,
            tags: json_column(row, "tags_json")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            invalidated_at: row.get("invalidated_at")?,
        })
    }
}

fn duplicate_value(collection: &str, property: &str) -> Error {
    Error::Conflict(format!(
        "a value for unique property '{}' already exists in '{}'",
        property, collection
    ))
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use piivault_protocol::PiiType;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn customers() -> Collection {
        Collection {
            name: "customers".into(),
            collection_type: CollectionType::Persons,
            properties: vec![
                Property {
                    name: "email".into(),
                    data_type_name: PiiType::Email,
                    is_unique: false,
                    is_nullable: false,
                    description: None,
                },
                Property {
                    name: "ssn".into(),
                    data_type_name: PiiType::Ssn,
                    is_unique: true,
                    is_nullable: false,
                    description: None,
                },
            ],
            creation_time: None,
        }
    }

    fn field(property: &str, index: &str, unique: bool) -> FieldRecord {
        FieldRecord {
            property: property.into(),
            ciphertext: format!("ct-{}", index).into_bytes(),
            blind_index: index.into(),
            is_unique: unique,
        }
    }

    fn add(store: &SqliteStore, id: &str, ssn_index: &str) -> Result<InsertOutcome> {
        store.insert_object(
            "customers",
            id,
            &[field("ssn", ssn_index, true), field("email", "e-1", false)],
            None,
            &Deadline::none(),
        )
    }

    fn pointer(token_id: &str, object_id: &str) -> TokenRecord {
        TokenRecord {
            token_id: token_id.into(),
            collection: "customers".into(),
            target: TokenTarget::Pointer {
                object_id: object_id.into(),
                props: vec!["email".into()],
            },
            tags: vec!["t1".into()],
            created_at: now_ms(),
            expires_at: None,
            invalidated_at: None,
        }
    }

    fn setup() -> (SqliteStore, TempDir) {
        let (store, dir) = test_store();
        store
            .insert_collection(&customers(), &Deadline::none())
            .unwrap();
        (store, dir)
    }

    #[test]
    fn test_collection_crud() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        let err = store.insert_collection(&customers(), &d).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let got = store.get_collection("customers", &d).unwrap().unwrap();
        assert_eq!(got, customers());
        assert!(store.get_collection("missing", &d).unwrap().is_none());

        let mut other = customers();
        other.name = "accounts".into();
        store.insert_collection(&other, &d).unwrap();
        let names: Vec<String> = store
            .list_collections(&d)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["accounts", "customers"]);

        assert!(store.delete_collection("accounts", &d).unwrap());
        assert!(!store.delete_collection("accounts", &d).unwrap());
    }

    #[test]
    fn test_insert_and_get_object() {
        let (store, _dir) = setup();
        add(&store, "obj-1", "s-1").unwrap();
        let obj = store
            .get_object("customers", "obj-1", &Deadline::none())
            .unwrap()
            .unwrap();
        assert_eq!(obj.fields.len(), 2);
        assert_eq!(obj.fields["ssn"], b"ct-s-1".to_vec());
        assert!(store
            .get_object("customers", "nope", &Deadline::none())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unique_conflict() {
        let (store, _dir) = setup();
        add(&store, "obj-1", "s-1").unwrap();
        let err = add(&store, "obj-2", "s-1").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // Nothing of the rejected insert is visible.
        assert!(store
            .get_object("customers", "obj-2", &Deadline::none())
            .unwrap()
            .is_none());
        // Non-unique duplicates are fine.
        add(&store, "obj-3", "s-3").unwrap();
    }

    #[test]
    fn test_concurrent_unique_inserts() {
        let (store, _dir) = setup();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || add(&store, &format!("obj-{}", i), "same").is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_idempotency_key_replays() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        let fields = [field("ssn", "s-1", true), field("email", "e", false)];
        let first = store
            .insert_object("customers", "obj-1", &fields, Some("key-1"), &d)
            .unwrap();
        let second = store
            .insert_object("customers", "obj-2", &fields, Some("key-1"), &d)
            .unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.object_id, "obj-1");
        assert_eq!(store.get_stats().unwrap().objects, 1);
    }

    #[test]
    fn test_paging_with_high_water() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        for i in 0..5 {
            add(&store, &format!("obj-{}", i), &format!("s-{}", i)).unwrap();
        }
        let first = store
            .page_objects("customers", &ObjectFilter::All, 0, None, 2, &d)
            .unwrap();
        assert_eq!(first.objects.len(), 2);
        assert_eq!(first.matching, 5);

        // Inserted after the listing started: invisible to later pages.
        add(&store, "obj-late", "s-late").unwrap();

        let last_seq = first.objects.last().unwrap().seq;
        let rest = store
            .page_objects(
                "customers",
                &ObjectFilter::All,
                last_seq,
                Some(first.high_water),
                10,
                &d,
            )
            .unwrap();
        let ids: Vec<&str> = rest.objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["obj-2", "obj-3", "obj-4"]);
        assert_eq!(rest.matching, 3);
    }

    #[test]
    fn test_match_and_id_filters() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        add(&store, "obj-1", "s-1").unwrap();
        add(&store, "obj-2", "s-2").unwrap();

        let by_ssn = ObjectFilter::Match(vec![("ssn".into(), "s-2".into())]);
        let page = store
            .page_objects("customers", &by_ssn, 0, None, 10, &d)
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].id, "obj-2");

        let by_ids = ObjectFilter::Ids(vec!["obj-1".into()]);
        let page = store
            .page_objects("customers", &by_ids, 0, None, 10, &d)
            .unwrap();
        assert_eq!(page.objects[0].id, "obj-1");

        let missing = store
            .missing_object_ids("customers", &["obj-1".into(), "ghost".into()], &d)
            .unwrap();
        assert_eq!(missing, vec!["ghost"]);
    }

    #[test]
    fn test_delete_object_invalidates_pointers() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        add(&store, "obj-1", "s-1").unwrap();
        store.insert_token(&pointer("tok-1", "obj-1"), &d).unwrap();

        assert_eq!(store.delete_object("customers", "obj-1", &d).unwrap(), 1);
        let err = store.delete_object("customers", "obj-1", &d).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let tokens = store.get_tokens("customers", &["tok-1".into()], &d).unwrap();
        assert!(tokens[0].invalidated_at.is_some());
        let live = store
            .search_tokens(
                "customers",
                &TokenFilter {
                    object_ids: Some(vec!["obj-1".into()]),
                    ..Default::default()
                },
                &d,
            )
            .unwrap();
        assert!(live.is_empty());
        // The unique value is free again.
        add(&store, "obj-2", "s-1").unwrap();
    }

    #[test]
    fn test_pointer_requires_object() {
        let (store, _dir) = setup();
        let err = store
            .insert_token(&pointer("tok-1", "ghost"), &Deadline::none())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_token_tags_update_and_rotate() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        add(&store, "obj-1", "s-1").unwrap();
        store.insert_token(&pointer("tok-1", "obj-1"), &d).unwrap();
        let randomized = TokenRecord {
            token_id: "tok-2".into(),
            target: TokenTarget::Randomized {
                snapshot: b"sealed".to_vec(),
                props: vec!["email".into()],
                origin_object_id: None,
            },
            tags: vec!["t1".into(), "t2".into()],
            ..pointer("tok-2", "obj-1")
        };
        store.insert_token(&randomized, &d).unwrap();

        let both = TokenFilter {
            tags: Some(vec!["t1".into(), "t2".into()]),
            ..Default::default()
        };
        let found = store.search_tokens("customers", &both, &d).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target, randomized.target);

        let only_tok1 = TokenFilter {
            token_ids: Some(vec!["tok-1".into()]),
            ..Default::default()
        };
        let updated = store
            .update_token_tags("customers", &only_tok1, &["t2".into(), "t1".into()], &d)
            .unwrap();
        assert_eq!(updated, vec!["tok-1"]);
        assert_eq!(store.search_tokens("customers", &both, &d).unwrap().len(), 2);

        let rotated = store
            .rotate_tokens("customers", &[("tok-1".into(), "tok-9".into())], &d)
            .unwrap();
        assert_eq!(rotated.len(), 1);
        assert!(store.get_tokens("customers", &["tok-1".into()], &d).unwrap().is_empty());
        assert_eq!(store.get_tokens("customers", &["tok-9".into()], &d).unwrap().len(), 1);

        let all_ids = TokenFilter {
            token_ids: Some(vec!["tok-9".into(), "tok-2".into(), "ghost".into()]),
            ..Default::default()
        };
        assert_eq!(store.delete_tokens("customers", &all_ids, &d).unwrap(), 2);
        assert_eq!(store.delete_tokens("customers", &all_ids, &d).unwrap(), 0);
    }

    #[test]
    fn test_expired_tokens_are_not_live() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        add(&store, "obj-1", "s-1").unwrap();
        let mut token = pointer("tok-1", "obj-1");
        token.expires_at = Some(now_ms() - 1);
        store.insert_token(&token, &d).unwrap();

        let filter = TokenFilter {
            token_ids: Some(vec!["tok-1".into()]),
            ..Default::default()
        };
        assert!(store.search_tokens("customers", &filter, &d).unwrap().is_empty());
        assert!(store.get_tokens("customers", &["tok-1".into()], &d).unwrap()[0]
            .is_expired(now_ms()));
    }

    #[test]
    fn test_delete_collection_cascades() {
        let (store, _dir) = setup();
        let d = Deadline::none();
        add(&store, "obj-1", "s-1").unwrap();
        store.insert_token(&pointer("tok-1", "obj-1"), &d).unwrap();
        assert!(store.delete_collection("customers", &d).unwrap());

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.collections, 0);
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.tokens, 0);
    }

    #[test]
    fn test_lock_respects_deadline() {
        let (store, _dir) = setup();
        let _held = store.conn.lock();
        let err = store
            .get_collection("customers", &Deadline::after(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
