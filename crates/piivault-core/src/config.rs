//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Paths to all PiiVault data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Database directory (`data/db/`).
    pub db: PathBuf,
    /// Purpose policy table (`data/policy.json`).
    pub policy_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            policy_file: root.join("policy.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        Ok(())
    }
}

/// Top-level PiiVault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// 32-byte master key for field encryption and blind indexing.
    /// `None` means an ephemeral key is generated at startup.
    #[serde(skip)]
    pub master_key: Option<Vec<u8>>,
    /// Bearer token accepted by the HTTP surface.
    #[serde(skip)]
    pub auth_token: String,
    /// Page size used when a listing does not name one.
    pub default_page_size: usize,
    /// Upper bound on any requested page size.
    pub max_page_size: usize,
    /// Per-request deadline applied when the caller gives none.
    pub request_timeout_ms: u64,
    /// Attempts for idempotent reads that hit a transient store error.
    pub read_retries: u32,
}

impl VaultConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let port = env_parse("PIIVAULT_PORT").unwrap_or(8123);

        let master_key = match std::env::var("PIIVAULT_MASTER_KEY") {
            Ok(hex_key) => Some(parse_master_key(&hex_key)?),
            Err(_) => None,
        };

        let auth_token =
            std::env::var("PIIVAULT_AUTH_TOKEN").unwrap_or_else(|_| "pvaultauth".to_string());

        let data_paths = DataPaths::new(data_dir)?;

        let config = Self {
            port,
            data_paths,
            master_key,
            auth_token,
            default_page_size: env_parse("PIIVAULT_DEFAULT_PAGE_SIZE").unwrap_or(100),
            max_page_size: env_parse("PIIVAULT_MAX_PAGE_SIZE").unwrap_or(1000),
            request_timeout_ms: env_parse("PIIVAULT_REQUEST_TIMEOUT_MS").unwrap_or(5000),
            read_retries: env_parse("PIIVAULT_READ_RETRIES").unwrap_or(3),
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `data_dir`, ignoring the environment (for tests and tooling).
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            port: 8123,
            data_paths: DataPaths::new(data_dir)?,
            master_key: None,
            auth_token: "pvaultauth".to_string(),
            default_page_size: 100,
            max_page_size: 1000,
            request_timeout_ms: 5000,
            read_retries: 3,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(Error::Config("page sizes must be positive".into()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(Error::Config(format!(
                "default page size {} exceeds max page size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }
}

/// Decode a 64-character hex master key.
pub fn parse_master_key(hex_key: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::Config(format!("PIIVAULT_MASTER_KEY is not hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::Config(format!(
            "PIIVAULT_MASTER_KEY must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_data_paths_created() {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        assert!(paths.db.is_dir());
        assert_eq!(paths.policy_file, dir.path().join("policy.json"));
    }

    #[test]
    fn test_parse_master_key() {
        let key = "00".repeat(32);
        assert_eq!(parse_master_key(&key).unwrap().len(), 32);
        assert!(parse_master_key("abcd").is_err());
        assert!(parse_master_key("not hex at all").is_err());
    }

    #[test]
    fn test_defaults_are_consistent() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::with_defaults(dir.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8123);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }
}
