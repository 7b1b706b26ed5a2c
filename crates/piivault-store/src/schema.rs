//! Database schema SQL.

/// Core tables: collections, objects, object_fields, tokens, idempotency_keys.
///
/// Field values are ciphertext; `blind_index` is a keyed digest, never plaintext.
/// The partial unique index is what makes `is_unique` hold across concurrent inserts.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS objects (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objects_collection ON objects(collection, seq);

CREATE TABLE IF NOT EXISTS object_fields (
    object_seq INTEGER NOT NULL REFERENCES objects(seq) ON DELETE CASCADE,
    collection TEXT NOT NULL,
    property TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    blind_index TEXT NOT NULL,
    is_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (object_seq, property)
);

CREATE INDEX IF NOT EXISTS idx_fields_lookup
    ON object_fields(collection, property, blind_index);

CREATE UNIQUE INDEX IF NOT EXISTS idx_fields_unique
    ON object_fields(collection, property, blind_index) WHERE is_unique = 1;

CREATE TABLE IF NOT EXISTS tokens (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id TEXT NOT NULL UNIQUE,
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    token_type TEXT NOT NULL CHECK (token_type IN ('POINTER', 'RANDOMIZED')),
    object_id TEXT,
    props_json TEXT NOT NULL,
    snapshot BLOB,
    tags_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    invalidated_at INTEGER,
    CHECK (
        (token_type = 'POINTER' AND object_id IS NOT NULL AND snapshot IS NULL)
        OR (token_type = 'RANDOMIZED' AND snapshot IS NOT NULL)
    )
);

CREATE INDEX IF NOT EXISTS idx_tokens_object ON tokens(collection, object_id);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    key TEXT NOT NULL,
    object_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (collection, key)
);
"#;

/// Tables the `validate` tooling expects to find.
pub const REQUIRED_TABLES: &[&str] = &[
    "collections",
    "objects",
    "object_fields",
    "tokens",
    "idempotency_keys",
];
