// ============================================================================
// Transaction Manager
// ============================================================================

use super::backup::BackupTxn;
use super::state::TxnIdGenerator;
use super::txn::Txn;
use crate::config::ProxyConfig;
use crate::connection::ConnectionPool;
use crate::core::Result;
use crate::observability::Observability;
use crate::recovery::{BackendSource, XaCheck};
use crate::registry::BackendPools;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{Level, event};

/// Issues transactions and owns the state they share.
///
/// The commit lock is the process-wide read/write lock between cross-shard
/// reads (readers) and the second phase of 2PC (writer).
pub struct TransactionManager {
    ids: TxnIdGenerator,
    live: AtomicU64,
    commit_lock: RwLock<()>,
    xa_check: XaCheck,
    config: ProxyConfig,
    observability: Arc<Observability>,
}

impl TransactionManager {
    /// Loads the recovery journal and starts its resolver.
    ///
    /// Must be called inside a Tokio runtime; otherwise this returns
    /// [`ProxyError::ConfigError`](crate::core::ProxyError::ConfigError).
    pub fn open(
        config: ProxyConfig,
        backends: Arc<dyn BackendSource>,
        observability: Arc<Observability>,
    ) -> Result<Arc<Self>> {
        let xa_check = XaCheck::open(config.xa_check.clone(), backends, observability.clone())?;
        xa_check.start()?;
        Ok(Arc::new(Self {
            ids: TxnIdGenerator::default(),
            live: AtomicU64::new(0),
            commit_lock: RwLock::new(()),
            xa_check,
            config,
            observability,
        }))
    }

    /// A transaction over `backends`, a snapshot taken by the caller.
    pub fn create_txn(self: &Arc<Self>, backends: BTreeMap<String, BackendPools>) -> Txn {
        let id = self.register();
        Txn::new(id, Arc::clone(self), backends)
    }

    pub fn create_backup_txn(self: &Arc<Self>, pool: ConnectionPool) -> BackupTxn {
        let id = self.register();
        BackupTxn::new(id, Arc::clone(self), pool)
    }

    fn register(&self) -> u64 {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.observability.counters().inc("TxnCreate");
        self.ids.next()
    }

    pub(crate) fn deregister(&self, id: u64, counter: &str) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.observability.counters().inc(counter);
        event!(Level::DEBUG, txn_id = id, outcome = counter, "transaction deregistered");
    }

    /// Number of created transactions not yet finished or aborted.
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn commit_read(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_lock.read().await
    }

    pub async fn commit_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write().await
    }

    pub fn xa_check(&self) -> &XaCheck {
        &self.xa_check
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    /// Stops the recovery resolver after its current tick.
    pub async fn close(&self) -> Result<()> {
        self.xa_check.close().await
    }
}
