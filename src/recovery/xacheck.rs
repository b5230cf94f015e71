use super::BackendSource;
use super::journal::{XaCommitErr, XaJournal, XaRecoveryState};
use crate::config::XaCheckConfig;
use crate::connection::ConnectionPool;
use crate::core::{ProxyError, Result};
use crate::observability::Observability;
use crate::result::QueryResult;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Background resolver for the recovery journal.
///
/// Every tick asks each backend which prepared xids it still holds and
/// re-applies the recorded decision to those backends. An entry leaves the
/// journal only after every holder accepted it.
pub struct XaCheck {
    inner: Arc<XaCheckInner>,
    worker: std::sync::Mutex<Option<XaCheckWorker>>,
}

struct XaCheckInner {
    config: XaCheckConfig,
    journal: Mutex<XaJournal>,
    backends: Arc<dyn BackendSource>,
    observability: Arc<Observability>,
}

struct XaCheckWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl XaCheckWorker {
    async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| ProxyError::TransactionError(format!("xa check worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for XaCheckWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl XaCheck {
    /// Loads (or creates) the journal. The ticking loop is not started.
    pub fn open(
        config: XaCheckConfig,
        backends: Arc<dyn BackendSource>,
        observability: Arc<Observability>,
    ) -> Result<Self> {
        let journal = XaJournal::open(&config.dir)?;
        event!(
            Level::INFO,
            path = %journal.path().display(),
            outstanding = journal.len(),
            "xa check journal loaded"
        );
        Ok(Self {
            inner: Arc::new(XaCheckInner {
                config,
                journal: Mutex::new(journal),
                backends,
                observability,
            }),
            worker: std::sync::Mutex::new(None),
        })
    }

    /// Starts the ticking loop; a second call is a no-op.
    ///
    /// Fails with a config error when called outside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock()?;
        if worker.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            ProxyError::ConfigError(format!("xa check needs a tokio runtime: {}", err))
        })?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.interval;

        let join_handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let tick = info_span!("xa.check.tick");
                        if let Err(err) = inner.check_once().instrument(tick).await {
                            event!(Level::WARN, error = %err, "xa check tick failed");
                        }
                    }
                }
            }
        });

        *worker = Some(XaCheckWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        });
        Ok(())
    }

    pub fn config(&self) -> &XaCheckConfig {
        &self.inner.config
    }

    /// Journals a decision whose phase two ran out of retries.
    pub async fn write_failure_record(&self, xid: &str, state: XaRecoveryState) -> Result<()> {
        let mut journal = self.inner.journal.lock().await;
        journal.add(xid, state)?;
        self.inner.observability.counters().inc("XaCheckRecorded");
        event!(Level::WARN, xid = xid, state = %state, "xa decision handed to recovery");
        Ok(())
    }

    /// Runs one resolution pass and returns the number of entries left.
    pub async fn check_once(&self) -> Result<usize> {
        self.inner.check_once().await
    }

    pub async fn entries(&self) -> Vec<XaCommitErr> {
        self.inner.journal.lock().await.entries().to_vec()
    }

    /// Stops the loop, letting an in-flight tick finish first.
    pub async fn close(&self) -> Result<()> {
        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            worker.stop().await?;
        }
        Ok(())
    }
}

impl XaCheckInner {
    async fn check_once(&self) -> Result<usize> {
        let entries = self.journal.lock().await.entries().to_vec();
        if entries.is_empty() {
            return Ok(0);
        }

        let mut resolved = Vec::new();
        for entry in &entries {
            let span = info_span!("xa.recover", xid = %entry.xid, state = %entry.state);
            match self.resolve(entry).instrument(span).await {
                Ok(()) => resolved.push(entry.xid.clone()),
                Err(err) => {
                    self.observability.counters().inc("XaCheckRetry");
                    event!(Level::WARN, xid = %entry.xid, error = %err, "xa recovery attempt failed");
                }
            }
        }

        let mut journal = self.journal.lock().await;
        for xid in resolved {
            journal.remove(&xid)?;
            self.observability.counters().inc("XaRecoverResolved");
            event!(Level::INFO, xid = %xid, "xa recovery resolved");
        }
        Ok(journal.len())
    }

    /// Applies the decision on every backend still holding the xid.
    ///
    /// A single backend that cannot be inspected fails the whole entry, since
    /// it might be holding the branch.
    async fn resolve(&self, entry: &XaCommitErr) -> Result<()> {
        let pools = self.backends.pools();

        let mut holders = Vec::new();
        for pool in &pools {
            let recovered = recover(pool).await?;
            if holds_xid(&recovered, &entry.xid) {
                holders.push(pool.clone());
            }
        }

        let statement = entry.state.statement(&entry.xid);
        let mut first_error = None;
        for pool in holders {
            if let Err(err) = apply(&pool, &statement).await {
                event!(Level::WARN, backend = %pool.name(), error = %err, "xa recovery statement failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn recover(pool: &ConnectionPool) -> Result<QueryResult> {
    let mut conn = pool.get().await?;
    match conn.execute("XA RECOVER").await {
        Ok(result) => {
            conn.recycle().await;
            Ok(result)
        }
        Err(err) => {
            conn.close().await;
            Err(err)
        }
    }
}

async fn apply(pool: &ConnectionPool, statement: &str) -> Result<()> {
    let mut conn = pool.get().await?;
    match conn.execute(statement).await {
        Ok(_) => {
            conn.recycle().await;
            Ok(())
        }
        // resolved between RECOVER and now
        Err(err) if err.is_unknown_xid() => {
            conn.recycle().await;
            Ok(())
        }
        Err(err) => {
            conn.close().await;
            Err(err)
        }
    }
}

fn holds_xid(recovered: &QueryResult, xid: &str) -> bool {
    let column = recovered.field_index("data").unwrap_or(3);
    recovered
        .rows
        .iter()
        .any(|row| row.get(column).and_then(|v| v.as_str()) == Some(xid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::BackendConfig;
    use crate::connection::memory::{Fault, MemoryDriver};
    use std::time::Duration;

    fn setup(dir: &std::path::Path) -> (Arc<MemoryDriver>, Vec<ConnectionPool>, XaCheck) {
        let driver = MemoryDriver::new();
        let obs = Observability::new();
        let pools: Vec<ConnectionPool> = ["a:1", "b:1"]
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                ConnectionPool::new(
                    BackendConfig::new(&format!("shard{}", i), addr),
                    driver.clone(),
                    obs.clone(),
                )
            })
            .collect();
        let config = XaCheckConfig {
            dir: dir.to_path_buf(),
            interval: Duration::from_millis(50),
            ..XaCheckConfig::default()
        };
        let check = XaCheck::open(config, Arc::new(pools.clone()), obs).unwrap();
        (driver, pools, check)
    }

    #[tokio::test]
    async fn test_check_once_commits_held_branches() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _pools, check) = setup(dir.path());
        let holder = driver.server("b:1");
        holder.prepare_xid("X1");
        check.write_failure_record("X1", XaRecoveryState::Commit).await.unwrap();

        assert_eq!(check.check_once().await.unwrap(), 0);
        assert_eq!(holder.committed_xids(), vec!["X1".to_string()]);
        assert!(holder.prepared_xids().is_empty());
        // the non-holder is only asked, never told
        assert_eq!(driver.server("a:1").count_queries("XA COMMIT"), 0);
        assert!(XaJournal::open(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_with_no_holder_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, _pools, check) = setup(dir.path());
        check.write_failure_record("gone", XaRecoveryState::Rollback).await.unwrap();

        assert_eq!(check.check_once().await.unwrap(), 0);
        assert!(check.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _pools, check) = setup(dir.path());
        driver.server("b:1").prepare_xid("X2");
        driver.server("a:1").inject(
            "XA RECOVER",
            Fault::Error(ProxyError::ServerUnavailable("EOF".into())),
            Some(1),
        );
        check.write_failure_record("X2", XaRecoveryState::Commit).await.unwrap();

        assert_eq!(check.check_once().await.unwrap(), 1);
        assert_eq!(check.entries().await[0].xid, "X2");
        assert_eq!(XaJournal::open(dir.path()).unwrap().len(), 1);

        assert_eq!(check.check_once().await.unwrap(), 0);
        assert_eq!(driver.server("b:1").committed_xids(), vec!["X2".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_converges_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _pools, check) = setup(dir.path());
        driver.server("a:1").prepare_xid("X3");
        check.write_failure_record("X3", XaRecoveryState::Rollback).await.unwrap();

        check.start().unwrap();
        sleep(Duration::from_millis(300)).await;
        check.close().await.unwrap();

        assert!(check.entries().await.is_empty());
        assert_eq!(driver.server("a:1").rolled_back_xids(), vec!["X3".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, _pools, check) = setup(dir.path());
        check.write_failure_record("X4", XaRecoveryState::Commit).await.unwrap();
        let err = check
            .write_failure_record("X4", XaRecoveryState::Commit)
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::DuplicateXid("X4".into()));
    }
}
