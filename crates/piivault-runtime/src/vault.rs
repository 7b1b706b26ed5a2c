//! The vault service: schema registry, object store and tokenization engine
//! behind one policy-gated API.
//!
//! Every operation takes a [`RequestContext`]. Policy is checked before any
//! value leaves the store, audit events go to the configured sink, and reads
//! retry transient store failures within the request deadline.

use std::sync::Arc;

use tracing::info;

use piivault_core::{Error, RequestContext, Result, VaultConfig};
use piivault_protocol::{
    AesGcmCipher, AuditEvent, AuditSink, FieldCipher, PiiValue, PolicyTable, TracingAuditSink,
};
use piivault_store::{Collection, Property, SqliteStore};

use crate::retry::RetryPolicy;

/// Associated data for randomized-token snapshots.
const SNAPSHOT_AAD_SUFFIX: &str = "/token-snapshot";

pub struct Vault {
    pub(crate) store: SqliteStore,
    pub(crate) cipher: Arc<dyn FieldCipher>,
    pub(crate) policy: PolicyTable,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) config: VaultConfig,
    pub(crate) retry: RetryPolicy,
}

impl Vault {
    /// Open the vault described by `config`: store, cipher, policy and the tracing audit sink.
    pub fn open(config: VaultConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.data_paths.db)?;
        let cipher: Arc<dyn FieldCipher> = match &config.master_key {
            Some(key) => Arc::new(AesGcmCipher::new(key)?),
            None => Arc::new(AesGcmCipher::ephemeral()?),
        };
        let policy = PolicyTable::load(&config.data_paths.policy_file)?;
        Ok(Self::new(
            store,
            cipher,
            policy,
            Arc::new(TracingAuditSink),
            config,
        ))
    }

    pub fn new(
        store: SqliteStore,
        cipher: Arc<dyn FieldCipher>,
        policy: PolicyTable,
        audit: Arc<dyn AuditSink>,
        config: VaultConfig,
    ) -> Self {
        let retry = RetryPolicy::reads(config.read_retries);
        info!(
            "Vault ready: db={}, page_size={}/{}, read_retries={}",
            store.db_path().display(),
            config.default_page_size,
            config.max_page_size,
            config.read_retries
        );
        Self {
            store,
            cipher,
            policy,
            audit,
            config,
            retry,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: AuditEvent) {
        self.audit.emit(&event);
    }

    /// Load a collection definition or fail with `NotFound`.
    pub(crate) fn require_collection(&self, name: &str, ctx: &RequestContext) -> Result<Collection> {
        self.retry
            .run(&ctx.deadline, "collection lookup", || {
                self.store.get_collection(name, &ctx.deadline)
            })?
            .ok_or_else(|| Error::NotFound(format!("collection '{}' not found", name)))
    }

    pub(crate) fn field_aad(collection: &str, object_id: &str, property: &str) -> Vec<u8> {
        format!("{}/{}/{}", collection, object_id, property).into_bytes()
    }

    pub(crate) fn snapshot_aad(collection: &str) -> Vec<u8> {
        format!("{}{}", collection, SNAPSHOT_AAD_SUFFIX).into_bytes()
    }

    pub(crate) fn encrypt_field(
        &self,
        collection: &str,
        object_id: &str,
        property: &str,
        value: &PiiValue,
    ) -> Result<Vec<u8>> {
        self.cipher.encrypt(
            value.canonical().as_bytes(),
            &Self::field_aad(collection, object_id, property),
        )
    }

    pub(crate) fn decrypt_field(
        &self,
        collection: &str,
        object_id: &str,
        property: &Property,
        ciphertext: &[u8],
    ) -> Result<PiiValue> {
        let plaintext = self.cipher.decrypt(
            ciphertext,
            &Self::field_aad(collection, object_id, &property.name),
        )?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto(format!("field '{}' is not valid UTF-8", property.name)))?;
        PiiValue::parse(property.data_type_name, &text)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use piivault_core::{CallerIdentity, Reason};
    use piivault_protocol::MemoryAuditSink;
    use piivault_store::{CollectionType, Property};
    use piivault_protocol::PiiType;
    use serde_json::json;
    use tempfile::TempDir;

    pub struct TestVault {
        pub vault: Vault,
        pub audit: Arc<MemoryAuditSink>,
        _dir: TempDir,
    }

    impl std::ops::Deref for TestVault {
        type Target = Vault;
        fn deref(&self) -> &Vault {
            &self.vault
        }
    }

    pub fn test_vault() -> TestVault {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::with_defaults(dir.path()).unwrap();
        let store = SqliteStore::open(&config.data_paths.db).unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let vault = Vault::new(
            store,
            Arc::new(AesGcmCipher::new(&[42u8; 32]).unwrap()),
            PolicyTable::default(),
            audit.clone(),
            config,
        );
        TestVault {
            vault,
            audit,
            _dir: dir,
        }
    }

    pub fn ctx(reason: &str) -> RequestContext {
        RequestContext::new(Reason::new(reason).unwrap(), CallerIdentity::new("tester"))
    }

    pub fn app() -> RequestContext {
        ctx("AppFunctionality")
    }

    fn prop(name: &str, t: PiiType, unique: bool, nullable: bool) -> Property {
        Property {
            name: name.into(),
            data_type_name: t,
            is_unique: unique,
            is_nullable: nullable,
            description: None,
        }
    }

    /// `customers`: ssn unique, email, phone_number and zip_code_us nullable.
    pub fn customers() -> Collection {
        Collection {
            name: "customers".into(),
            collection_type: CollectionType::Persons,
            properties: vec![
                prop("ssn", PiiType::Ssn, true, false),
                prop("email", PiiType::Email, false, false),
                prop("phone_number", PiiType::PhoneNumber, false, true),
                prop("zip_code_us", PiiType::ZipCodeUs, false, true),
            ],
            creation_time: None,
        }
    }

    pub fn person(ssn: &str, email: &str, phone: &str) -> crate::types::ObjectFields {
        json!({
            "ssn": ssn,
            "email": email,
            "phone_number": phone,
            "zip_code_us": "12345",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    /// Vault with `customers` registered and john, mary and eric inserted.
    pub fn seeded() -> (TestVault, Vec<String>) {
        let v = test_vault();
        v.add_collection(&app(), customers()).unwrap();
        let ids = [
            ("123-12-1234", "john@somemail.com", "+1-121212123"),
            ("123-12-1235", "mary@somemail.com", "+1-121212124"),
            ("123-12-1236", "eric@somemail.com", "+1-121212125"),
        ]
        .iter()
        .map(|(ssn, email, phone)| {
            v.add_object("customers", &app(), &person(ssn, email, phone))
                .unwrap()
        })
        .collect();
        (v, ids)
    }
}
