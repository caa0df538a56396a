// pgvault/src/backup/testing.rs
//! In-memory stand-ins for the database server, `pg_dump` and object storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::backup::db_dump::Dumper;
use crate::backup::s3_upload::{ObjectStore, StoreError, StoreFactory};
use crate::config::{GlobalConfig, RawJsonConfig, StorageSettings};
use crate::errors::{BackupError, Result};
use crate::utils::catalog::Catalog;

/// Builds a config from environment-style pairs only.
pub fn test_config(pairs: &[(&str, &str)]) -> GlobalConfig {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    GlobalConfig::from_sources(RawJsonConfig::default(), move |k: &str| map.get(k).cloned())
        .expect("test config")
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, String), Vec<u8>>,
    failing_puts: u32,
    failing_puts_transient: bool,
    put_calls: usize,
    fail_listing: bool,
    fail_deletes: BTreeSet<String>,
    deleted: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn fail_next_puts(&self, count: u32, transient: bool) {
        let mut state = self.state.lock().unwrap();
        state.failing_puts = count;
        state.failing_puts_transient = transient;
    }

    pub fn put_calls(&self) -> usize {
        self.state.lock().unwrap().put_calls
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.objects.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    pub fn insert(&self, bucket: &str, key: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), b"older backup".to_vec());
    }

    /// Keys of `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    pub fn fail_delete_of(&self, key: &str) {
        self.state.lock().unwrap().fail_deletes.insert(key.to_string());
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> std::result::Result<(), StoreError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::permanent(format!("read {}: {}", path.display(), e)))?;
        let mut state = self.state.lock().unwrap();
        state.put_calls += 1;
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(StoreError {
                message: "injected put failure".to_string(),
                transient: state.failing_puts_transient,
            });
        }
        state.objects.insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        if self.state.lock().unwrap().fail_listing {
            return Err(StoreError::permanent("injected list failure"));
        }
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn delete_key(&self, bucket: &str, key: &str) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes.contains(key) {
            return Err(StoreError::permanent("injected delete failure"));
        }
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        state.deleted.push(key.to_string());
        Ok(())
    }
}

/// Hands out the same [`MemoryStore`] for every connection.
pub struct MemoryStoreFactory {
    pub store: Arc<MemoryStore>,
    pub refuse: bool,
}

impl MemoryStoreFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        MemoryStoreFactory { store, refuse: false }
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn connect(&self, _settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
        if self.refuse {
            return Err(BackupError::Config("storage refused".to_string()));
        }
        Ok(self.store.clone())
    }
}

/// Writes a small file per database; fails for the configured names.
#[derive(Default)]
pub struct FakeDumper {
    failing: BTreeSet<String>,
    empty_handed: BTreeSet<String>,
    dumped: Mutex<Vec<String>>,
}

impl FakeDumper {
    pub fn failing(names: &[&str]) -> Self {
        FakeDumper {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..FakeDumper::default()
        }
    }

    /// Reports success for `names` without producing a file.
    pub fn without_output(names: &[&str]) -> Self {
        FakeDumper {
            empty_handed: names.iter().map(|n| n.to_string()).collect(),
            ..FakeDumper::default()
        }
    }

    pub fn dumped(&self) -> Vec<String> {
        self.dumped.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dumper for FakeDumper {
    async fn dump(&self, dsn: &Url, database: &str, output: &Path) -> Result<()> {
        assert_eq!(dsn.path(), format!("/{}", database), "dump must target the database itself");
        self.dumped.lock().unwrap().push(database.to_string());
        if self.failing.contains(database) {
            return Err(BackupError::Dump(format!(
                "pg_dump for database {} failed with status: exit status: 1",
                database
            )));
        }
        if self.empty_handed.contains(database) {
            return Ok(());
        }
        tokio::fs::write(output, format!("dump of {}", database)).await?;
        Ok(())
    }
}

pub struct FakeCatalog {
    databases: Vec<String>,
    reachable: bool,
    sessions: u64,
    terminations: AtomicUsize,
}

impl FakeCatalog {
    pub fn new(databases: &[&str]) -> Self {
        FakeCatalog {
            databases: databases.iter().map(|d| d.to_string()).collect(),
            reachable: true,
            sessions: 0,
            terminations: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        FakeCatalog { reachable: false, ..FakeCatalog::new(&[]) }
    }

    pub fn with_sessions(mut self, sessions: u64) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn list_databases(&self, dsn: &Url) -> Result<Vec<String>> {
        if !self.reachable {
            return Err(BackupError::Connection(format!(
                "failed to connect to {}",
                dsn.host_str().unwrap_or("localhost")
            )));
        }
        Ok(self.databases.clone())
    }

    async fn terminate_other_sessions(&self, _dsn: &Url) -> Result<u64> {
        if !self.reachable {
            return Err(BackupError::Termination("server unreachable".to_string()));
        }
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(self.sessions)
    }
}
