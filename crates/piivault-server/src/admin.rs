//! Operator checks over a data directory: `validate` and `check-clear`.
//!
//! Both open the database read-only and never create it.

use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use piivault_protocol::PolicyTable;
use piivault_store::schema::REQUIRED_TABLES;
use piivault_store::DB_FILE;

/// Result of an operator check.
#[derive(Debug, Default)]
pub struct AdminReport {
    pub db_valid: bool,
    pub collections: Vec<String>,
    pub objects: i64,
    pub tokens: i64,
    pub invalidated_tokens: i64,
    pub policy_rules: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl AdminReport {
    pub fn is_ok(&self) -> bool {
        self.db_valid && self.errors.is_empty()
    }
}

/// Validate that a data directory holds a usable PiiVault database and policy.
pub fn validate(data_dir: &Path) -> AdminReport {
    let mut report = AdminReport::default();

    let policy_path = data_dir.join("policy.json");
    if policy_path.exists() {
        match PolicyTable::load(&policy_path) {
            Ok(policy) => report.policy_rules = policy.snapshot().rules.len(),
            Err(e) => report.errors.push(format!("Invalid policy file: {}", e)),
        }
    } else {
        report
            .warnings
            .push("No policy.json found, built-in policy applies".to_string());
    }

    let db_path = data_dir.join("db").join(DB_FILE);
    if !db_path.exists() {
        report
            .errors
            .push(format!("Database not found: {}", db_path.display()));
        return report;
    }

    let conn = match Connection::open_with_flags(
        &db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) {
        Ok(c) => c,
        Err(e) => {
            report.errors.push(format!("Failed to open database: {}", e));
            return report;
        }
    };

    for table in REQUIRED_TABLES {
        match table_exists(&conn, table) {
            Ok(true) => {}
            Ok(false) => report
                .errors
                .push(format!("Missing required table: {}", table)),
            Err(e) => report
                .errors
                .push(format!("Error checking table {}: {}", table, e)),
        }
    }
    if !report.errors.is_empty() {
        return report;
    }

    report.db_valid = true;
    report.collections = collection_names(&conn).unwrap_or_default();
    report.objects = count_rows(&conn, "objects", None).unwrap_or(0);
    report.tokens = count_rows(&conn, "tokens", None).unwrap_or(0);
    report.invalidated_tokens =
        count_rows(&conn, "tokens", Some("invalidated_at IS NOT NULL")).unwrap_or(0);

    // Fields whose object row is gone mean the cascade was bypassed.
    if let Ok(orphans) = conn.query_row(
        "SELECT COUNT(*) FROM object_fields WHERE object_seq NOT IN (SELECT seq FROM objects)",
        [],
        |row| row.get::<_, i64>(0),
    ) {
        if orphans > 0 {
            report
                .warnings
                .push(format!("{} orphaned field rows found", orphans));
        }
    }

    report
}

/// Assert the vault holds no collections. A directory with no database is clear.
pub fn check_clear(data_dir: &Path) -> AdminReport {
    let db_path = data_dir.join("db").join(DB_FILE);
    if !db_path.exists() {
        info!("No database at {}, vault is clear", db_path.display());
        return AdminReport {
            db_valid: true,
            ..Default::default()
        };
    }

    let mut report = validate(data_dir);
    if report.db_valid && !report.collections.is_empty() {
        report.errors.push(format!(
            "Vault is not clear: {} collection(s) present ({})",
            report.collections.len(),
            report.collections.join(", ")
        ));
    }
    report
}

/// Print a report to stdout.
pub fn print_report(title: &str, report: &AdminReport) {
    println!();
    println!("=== PiiVault {} Report ===", title);
    println!();
    println!("Database valid:      {}", report.db_valid);
    println!("Collections:         {}", report.collections.len());
    for name in &report.collections {
        println!("  - {}", name);
    }
    println!("Objects:             {}", report.objects);
    println!(
        "Tokens:              {} ({} invalidated)",
        report.tokens, report.invalidated_tokens
    );
    println!("Policy rules:        {}", report.policy_rules);

    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in &report.warnings {
            println!("  - {}", w);
        }
    }

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for e in &report.errors {
            println!("  - {}", e);
        }
    }

    println!();
    if report.is_ok() {
        println!("Status: OK");
    } else {
        println!("Status: FAILED");
    }
    println!();
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn count_rows(conn: &Connection, table: &str, filter: Option<&str>) -> rusqlite::Result<i64> {
    let sql = match filter {
        Some(f) => format!("SELECT COUNT(*) FROM {} WHERE {}", table, f),
        None => format!("SELECT COUNT(*) FROM {}", table),
    };
    conn.query_row(&sql, [], |row| row.get(0))
}

fn collection_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use piivault_core::Deadline;
    use piivault_protocol::PiiType;
    use piivault_store::{Collection, CollectionType, Property, SqliteStore};
    use tempfile::TempDir;

    fn add_collection(dir: &Path, name: &str) {
        let store = SqliteStore::open(dir.join("db")).unwrap();
        let collection = Collection {
            name: name.into(),
            collection_type: CollectionType::Persons,
            properties: vec![Property {
                name: "email".into(),
                data_type_name: PiiType::Email,
                is_unique: false,
                is_nullable: false,
                description: None,
            }],
            creation_time: None,
        };
        store.insert_collection(&collection, &Deadline::none()).unwrap();
    }

    #[test]
    fn test_missing_database() {
        let dir = TempDir::new().unwrap();
        let report = validate(dir.path());
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("Database not found"));

        let clear = check_clear(dir.path());
        assert!(clear.is_ok());
    }

    #[test]
    fn test_validate_fresh_store() {
        let dir = TempDir::new().unwrap();
        SqliteStore::open(dir.path().join("db")).unwrap();

        let report = validate(dir.path());
        assert!(report.is_ok(), "errors: {:?}", report.errors);
        assert!(report.collections.is_empty());
        assert_eq!(report.objects, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(check_clear(dir.path()).is_ok());
    }

    #[test]
    fn test_check_clear_fails_with_collections() {
        let dir = TempDir::new().unwrap();
        add_collection(dir.path(), "customers");

        let report = check_clear(dir.path());
        assert!(!report.is_ok());
        assert_eq!(report.collections, vec!["customers"]);
        assert!(report.errors[0].contains("not clear"));
    }

    #[test]
    fn test_invalid_policy_file() {
        let dir = TempDir::new().unwrap();
        SqliteStore::open(dir.path().join("db")).unwrap();
        std::fs::write(dir.path().join("policy.json"), "{not json").unwrap();

        let report = validate(dir.path());
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("Invalid policy file"));
    }
}
