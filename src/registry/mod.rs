//! The named set of backend pools.
//!
//! Holds one [`BackendPools`] per shard plus an optional backup backend,
//! persists the set to `backend.json`, and hands out transactions bound to
//! a point-in-time snapshot of the pools.

use crate::config::ProxyConfig;
use crate::connection::config::{BackendConfig, BackendRole};
use crate::connection::{ConnectionPool, Driver, PoolStats};
use crate::core::{ProxyError, Result};
use crate::observability::{Observability, QueryDetail, TxnDetail};
use crate::recovery::BackendSource;
use crate::storage::persistence::{read_json, write_json_atomic};
use crate::transaction::{BackupTxn, TransactionManager, Txn};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{Level, event};

pub const BACKEND_FILE: &str = "backend.json";
pub const VERSION_FILE: &str = "version.json";

/// The pools serving one backend.
#[derive(Clone)]
pub struct BackendPools {
    pub config: BackendConfig,
    pub normal: ConnectionPool,
    pub replica: Option<ConnectionPool>,
}

impl BackendPools {
    fn all(&self) -> impl Iterator<Item = &ConnectionPool> {
        std::iter::once(&self.normal).chain(self.replica.iter())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendsFile {
    #[serde(default)]
    backends: Vec<BackendConfig>,
    #[serde(default)]
    backup: Option<BackendConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionFile {
    ts: i64,
}

#[derive(Default)]
struct SharedBackends {
    backends: Mutex<BTreeMap<String, BackendPools>>,
}

impl SharedBackends {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, BackendPools>> {
        match self.backends.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BackendSource for SharedBackends {
    fn pools(&self) -> Vec<ConnectionPool> {
        self.lock().values().map(|p| p.normal.clone()).collect()
    }
}

pub struct BackendRegistry {
    config: ProxyConfig,
    driver: Arc<dyn Driver>,
    observability: Arc<Observability>,
    backends: Arc<SharedBackends>,
    backup: Mutex<Option<BackendPools>>,
    txn_mgr: Arc<TransactionManager>,
}

impl BackendRegistry {
    /// Builds an empty registry and starts recovery of the journal found
    /// under the configured directory.
    ///
    /// The recovery loop is spawned on the current Tokio runtime; without
    /// one this fails with [`ProxyError::ConfigError`].
    pub fn open(config: ProxyConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate().map_err(ProxyError::ConfigError)?;
        let observability = Observability::new();
        let backends = Arc::new(SharedBackends::default());
        let txn_mgr = TransactionManager::open(
            config.clone(),
            backends.clone(),
            observability.clone(),
        )?;
        Ok(Self {
            config,
            driver,
            observability,
            backends,
            backup: Mutex::new(None),
            txn_mgr,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_mgr
    }

    fn build_pools(&self, config: BackendConfig) -> BackendPools {
        let normal = ConnectionPool::new(config.clone(), self.driver.clone(), self.observability.clone());
        normal.set_max_idle_time(self.config.pool_max_idle_time);
        let replica = config.replica.as_ref().map(|address| {
            let pool = ConnectionPool::with_address(
                config.clone(),
                address,
                self.driver.clone(),
                self.observability.clone(),
            );
            pool.set_max_idle_time(self.config.pool_max_idle_time);
            pool
        });
        BackendPools {
            config,
            normal,
            replica,
        }
    }

    /// Adds a shard. Names are unique across shards and the backup.
    pub fn add(&self, config: BackendConfig) -> Result<()> {
        config.validate().map_err(ProxyError::ConfigError)?;
        if config.role == BackendRole::Backup {
            return Err(ProxyError::ConfigError(format!(
                "backend '{}' has the backup role, use add_backup",
                config.name
            )));
        }
        if self.backup_name()?.as_deref() == Some(config.name.as_str()) {
            return Err(ProxyError::BackendExists(config.name));
        }

        let mut backends = self.backends.lock();
        if backends.contains_key(&config.name) {
            return Err(ProxyError::BackendExists(config.name));
        }
        event!(Level::INFO, backend = %config.name, url = %config.to_url(), "backend added");
        let name = config.name.clone();
        let pools = self.build_pools(config);
        backends.insert(name, pools);
        Ok(())
    }

    /// Removes a shard and closes its pools. Running transactions keep
    /// their snapshot but can no longer get connections from it.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let removed = self
            .backends
            .lock()
            .remove(name)
            .ok_or_else(|| ProxyError::BackendNotFound(name.to_string()))?;
        for pool in removed.all() {
            pool.close().await;
        }
        event!(Level::INFO, backend = name, "backend removed");
        Ok(())
    }

    pub fn add_backup(&self, config: BackendConfig) -> Result<()> {
        config.validate().map_err(ProxyError::ConfigError)?;
        if self.backends.lock().contains_key(&config.name) {
            return Err(ProxyError::BackendExists(config.name));
        }
        let mut backup = self.backup.lock()?;
        if let Some(existing) = backup.as_ref() {
            return Err(ProxyError::BackendExists(existing.config.name.clone()));
        }
        let config = config.role(BackendRole::Backup);
        event!(Level::INFO, backend = %config.name, url = %config.to_url(), "backup backend added");
        *backup = Some(self.build_pools(config));
        Ok(())
    }

    pub async fn remove_backup(&self, name: &str) -> Result<()> {
        let removed = {
            let mut backup = self.backup.lock()?;
            match backup.as_ref() {
                Some(pools) if pools.config.name == name => backup.take(),
                _ => None,
            }
        };
        let removed = removed.ok_or_else(|| ProxyError::BackendNotFound(name.to_string()))?;
        for pool in removed.all() {
            pool.close().await;
        }
        event!(Level::INFO, backend = name, "backup backend removed");
        Ok(())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.lock().keys().cloned().collect()
    }

    /// Names of the shards with the `normal` role
    pub fn normal_backend_names(&self) -> Vec<String> {
        self.backends
            .lock()
            .values()
            .filter(|p| p.config.role == BackendRole::Normal)
            .map(|p| p.config.name.clone())
            .collect()
    }

    pub fn backup_name(&self) -> Result<Option<String>> {
        Ok(self
            .backup
            .lock()?
            .as_ref()
            .map(|p| p.config.name.clone()))
    }

    pub fn all_configs(&self) -> Vec<BackendConfig> {
        self.backends
            .lock()
            .values()
            .map(|p| p.config.clone())
            .collect()
    }

    pub fn backup_config(&self) -> Result<Option<BackendConfig>> {
        Ok(self.backup.lock()?.as_ref().map(|p| p.config.clone()))
    }

    /// Point-in-time copy of the shard pools; usable without the registry
    /// lock for as long as a transaction needs it.
    pub fn pool_clone(&self) -> BTreeMap<String, BackendPools> {
        self.backends.lock().clone()
    }

    /// Applies a new long idle threshold to every pool.
    pub fn set_pool_max_idle_time(&self, max_idle: Duration) -> Result<()> {
        for pools in self.backends.lock().values() {
            pools.all().for_each(|pool| pool.set_max_idle_time(max_idle));
        }
        if let Some(pools) = self.backup.lock()?.as_ref() {
            pools.all().for_each(|pool| pool.set_max_idle_time(max_idle));
        }
        Ok(())
    }

    fn backend_file(&self) -> PathBuf {
        self.config.meta_dir.join(BACKEND_FILE)
    }

    fn version_file(&self) -> PathBuf {
        self.config.meta_dir.join(VERSION_FILE)
    }

    /// Writes `backend.json`, then bumps `version.json`.
    pub fn flush_config(&self) -> Result<()> {
        let file = BackendsFile {
            backends: self.all_configs(),
            backup: self.backup_config()?,
        };
        write_json_atomic(&self.backend_file(), &file)?;

        let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        write_json_atomic(&self.version_file(), &VersionFile { ts })?;
        event!(
            Level::INFO,
            backends = file.backends.len(),
            version = ts,
            "backend config flushed"
        );
        Ok(())
    }

    /// Adds every backend found in `backend.json`; returns how many were
    /// loaded. A missing file loads nothing.
    pub fn load_config(&self) -> Result<usize> {
        let Some(file) = read_json::<BackendsFile>(&self.backend_file())? else {
            return Ok(0);
        };
        let mut loaded = 0;
        for config in file.backends {
            self.add(config)?;
            loaded += 1;
        }
        if let Some(config) = file.backup {
            self.add_backup(config)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Last flush time in unix nanoseconds, 0 if never flushed.
    pub fn version(&self) -> Result<i64> {
        Ok(read_json::<VersionFile>(&self.version_file())?
            .map(|v| v.ts)
            .unwrap_or(0))
    }

    /// A transaction over the current shards.
    pub fn create_transaction(&self) -> Txn {
        self.txn_mgr.create_txn(self.pool_clone())
    }

    pub fn create_backup_transaction(&self) -> Result<BackupTxn> {
        let pool = self
            .backup
            .lock()?
            .as_ref()
            .map(|p| p.normal.clone())
            .ok_or_else(|| ProxyError::BackendNotFound("backup".to_string()))?;
        Ok(self.txn_mgr.create_backup_txn(pool))
    }

    /// Stats of every pool, replicas and backup included.
    pub fn stats(&self) -> Result<Vec<PoolStats>> {
        let mut stats: Vec<PoolStats> = self
            .backends
            .lock()
            .values()
            .flat_map(|p| p.all().map(ConnectionPool::stats).collect::<Vec<_>>())
            .collect();
        if let Some(pools) = self.backup.lock()?.as_ref() {
            stats.extend(pools.all().map(ConnectionPool::stats));
        }
        Ok(stats)
    }

    pub fn queryz(&self) -> Vec<QueryDetail> {
        self.observability.queries().snapshot()
    }

    pub fn txnz(&self) -> Vec<TxnDetail> {
        self.observability.txns().snapshot()
    }

    /// Stops recovery, then closes every pool.
    pub async fn close(&self) -> Result<()> {
        self.txn_mgr.close().await?;
        let shards: Vec<BackendPools> = self.backends.lock().values().cloned().collect();
        let backup = self.backup.lock()?.clone();
        for pools in shards.iter().chain(backup.iter()) {
            for pool in pools.all() {
                pool.close().await;
            }
        }
        event!(Level::INFO, "backend registry closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryDriver;
    use crate::transaction::Request;

    fn registry(dir: &std::path::Path) -> (Arc<MemoryDriver>, BackendRegistry) {
        let driver = MemoryDriver::new();
        let registry = BackendRegistry::open(ProxyConfig::new(dir), driver.clone()).unwrap();
        (driver, registry)
    }

    #[test]
    fn test_open_outside_runtime_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = BackendRegistry::open(ProxyConfig::new(dir.path()), MemoryDriver::new());
        assert!(matches!(result, Err(ProxyError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_add_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, registry) = registry(dir.path());

        registry.add(BackendConfig::new("b", "b:3306")).unwrap();
        registry
            .add(BackendConfig::new("a", "a:3306").role(BackendRole::Attach))
            .unwrap();
        assert_eq!(
            registry.add(BackendConfig::new("a", "x:1")).unwrap_err(),
            ProxyError::BackendExists("a".into())
        );
        assert_eq!(registry.backend_names(), vec!["a", "b"]);
        assert_eq!(registry.normal_backend_names(), vec!["b"]);

        registry.remove("a").await.unwrap();
        assert_eq!(
            registry.remove("a").await.unwrap_err(),
            ProxyError::BackendNotFound("a".into())
        );
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, registry) = registry(dir.path());
        registry.add(BackendConfig::new("s0", "s0:3306")).unwrap();

        assert!(registry.create_backup_transaction().is_err());
        assert!(registry.add_backup(BackendConfig::new("s0", "x:1")).is_err());
        registry.add_backup(BackendConfig::new("bk", "bk:3306")).unwrap();
        assert!(registry.add_backup(BackendConfig::new("bk2", "bk2:3306")).is_err());
        assert!(registry.add(BackendConfig::new("bk", "bk:3306")).is_err());
        assert_eq!(registry.backup_config().unwrap().unwrap().role, BackendRole::Backup);

        let mut txn = registry.create_backup_transaction().unwrap();
        txn.execute(None, "SELECT 1").await.unwrap();
        txn.finish().await;

        assert!(registry.remove_backup("nope").await.is_err());
        registry.remove_backup("bk").await.unwrap();
        assert_eq!(registry.backup_name().unwrap(), None);
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, registry) = registry(dir.path());
        registry
            .add(BackendConfig::new("s0", "s0:3306").replica("r0:3306"))
            .unwrap();
        registry
            .add(BackendConfig::new("s1", "s1:3306").max_connections(16))
            .unwrap();
        registry.add_backup(BackendConfig::new("bk", "bk:3306")).unwrap();
        assert_eq!(registry.version().unwrap(), 0);
        registry.flush_config().unwrap();
        assert!(registry.version().unwrap() > 0);

        let raw = std::fs::read_to_string(dir.path().join(BACKEND_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["backends"][1]["max-connections"], 16);
        assert_eq!(value["backup"]["role"], "backup");
        registry.close().await.unwrap();

        let reopened = BackendRegistry::open(ProxyConfig::new(dir.path()), driver).unwrap();
        assert_eq!(reopened.load_config().unwrap(), 3);
        assert_eq!(reopened.all_configs(), registry.all_configs());
        assert_eq!(reopened.backup_name().unwrap().as_deref(), Some("bk"));
        // s0, its replica, s1 and the backup
        assert_eq!(reopened.stats().unwrap().len(), 4);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_outlives_removal() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, registry) = registry(dir.path());
        registry.add(BackendConfig::new("s0", "s0:3306")).unwrap();
        registry.add(BackendConfig::new("s1", "s1:3306")).unwrap();

        let mut txn = registry.create_transaction();
        registry.remove("s1").await.unwrap();
        assert_eq!(txn.backend_names(), vec!["s0", "s1"]);

        let err = txn.execute(&Request::scatter("SELECT 1")).await.unwrap_err();
        assert_eq!(err, ProxyError::PoolClosed("s1".into()));
        txn.finish().await;
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_can_go_to_replica() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, registry) = registry(dir.path());
        registry
            .add(BackendConfig::new("s0", "s0:3306").replica("r0:3306"))
            .unwrap();

        let mut txn = registry.create_transaction();
        txn.execute(&Request::single("SELECT 1").on_replica()).await.unwrap();
        txn.execute(&Request::single("UPDATE t SET a = 1").write().on_replica())
            .await
            .unwrap();
        txn.finish().await;

        assert_eq!(driver.server("r0:3306").count_queries("SELECT 1"), 1);
        assert_eq!(driver.server("r0:3306").count_queries("UPDATE"), 0);
        assert_eq!(driver.server("s0:3306").count_queries("UPDATE"), 1);
        assert_eq!(registry.txnz().len(), 0);
        registry.close().await.unwrap();
    }
}
