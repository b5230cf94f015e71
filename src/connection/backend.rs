use super::Session;
use super::pool::{ConnectionPool, PoolShared};
use crate::core::{InterruptReason, ProxyError, Result, Row};
use crate::observability::{Observability, QueryRegistration};
use crate::result::QueryResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{Level, event};

/// A pooled physical connection to one backend.
///
/// Adds query timeout and result-size enforcement on top of a raw
/// [`Session`], and knows how to kill itself through a sibling connection
/// of the same pool. Ownership moves on `get`/`put`/`recycle`; there is no
/// internal lock.
pub struct BackendConnection {
    id: u64,
    backend: String,
    address: String,
    session: Box<dyn Session>,
    pool: Weak<PoolShared>,
    observability: Arc<Observability>,
    killed: Arc<AtomicBool>,
    last_error: Option<ProxyError>,
    timestamp: Instant,
    stream_registration: Option<QueryRegistration>,
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("address", &self.address)
            .field("killed", &self.is_killed())
            .finish()
    }
}

impl BackendConnection {
    pub(crate) fn new(
        session: Box<dyn Session>,
        backend: &str,
        address: &str,
        pool: Weak<PoolShared>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            id: session.id(),
            backend: backend.to_string(),
            address: address.to_string(),
            session,
            pool,
            observability,
            killed: Arc::new(AtomicBool::new(false)),
            last_error: None,
            timestamp: Instant::now(),
            stream_registration: None,
        }
    }

    /// Server-side connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the connection was last handed back to its pool.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn idle_time(&self) -> Duration {
        self.timestamp.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.timestamp = Instant::now();
    }

    pub fn last_error(&self) -> Option<&ProxyError> {
        self.last_error.as_ref()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.session.ping().await
    }

    pub async fn use_db(&mut self, database: &str) -> Result<()> {
        let result = self.session.use_db(database).await;
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Executes without timeout or size limits.
    pub async fn execute(&mut self, query: &str) -> Result<QueryResult> {
        self.execute_with_limits(query, 0, 0).await
    }

    /// Executes `query`, killing it after `timeout_ms` and aborting the fetch
    /// once the result grows past `max_bytes`. Zero disables either limit.
    pub async fn execute_with_limits(
        &mut self,
        query: &str,
        timeout_ms: u64,
        max_bytes: u64,
    ) -> Result<QueryResult> {
        let _registration = self
            .observability
            .queries()
            .register(self.id, &self.backend, query);

        // Dropping `done_tx` tells the watcher the query has returned.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        if timeout_ms > 0 {
            let handle = self.kill_handle();
            let timeout = Duration::from_millis(timeout_ms);
            tokio::spawn(watch_timeout(done_rx, timeout, handle));
        }

        let mut total: u64 = 0;
        let mut exceeded = false;
        let outcome = {
            let mut on_bytes = |n: usize| {
                if max_bytes == 0 {
                    return true;
                }
                total += n as u64;
                if total > max_bytes {
                    exceeded = true;
                    return false;
                }
                true
            };
            self.session.fetch(query, &mut on_bytes).await
        };
        drop(done_tx);

        let result = match outcome {
            Ok(result) => Ok(result),
            Err(_) if exceeded => Err(ProxyError::QueryInterrupted(InterruptReason::MaxMemory)),
            Err(_) if timeout_ms > 0 && self.is_killed() => {
                Err(ProxyError::QueryInterrupted(InterruptReason::Timeout))
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            event!(
                Level::DEBUG,
                backend = %self.backend,
                conn_id = self.id,
                error = %err,
                "backend query failed"
            );
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Runs a query straight on the session; used for the kill command so
    /// that killing never spawns another watcher.
    async fn execute_raw(&mut self, query: &str) -> Result<QueryResult> {
        let _registration = self
            .observability
            .queries()
            .register(self.id, &self.backend, query);
        let result = self.session.fetch(query, &mut |_: usize| true).await;
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Opens a streaming cursor and returns its field names.
    pub async fn stream_open(&mut self, query: &str) -> Result<Vec<String>> {
        self.stream_registration = Some(
            self.observability
                .queries()
                .register(self.id, &self.backend, query),
        );
        let result = self.session.stream_open(query).await;
        if let Err(err) = &result {
            self.stream_registration = None;
            self.last_error = Some(err.clone());
        }
        result
    }

    pub async fn stream_next(&mut self) -> Result<Option<Row>> {
        let result = self.session.stream_next().await;
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    pub async fn stream_close(&mut self) -> Result<()> {
        self.stream_registration = None;
        self.session.stream_close().await
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            id: self.id,
            backend: self.backend.clone(),
            pool: self.pool.clone(),
            killed: Arc::clone(&self.killed),
        }
    }

    /// Kills this connection's server session from a sibling connection.
    pub async fn kill(&self, reason: &str) -> Result<()> {
        self.kill_handle().kill(reason).await
    }

    /// Hands the connection back to its pool if the session is still open.
    ///
    /// A closed session is dropped instead; callers should `close` known-bad
    /// connections rather than recycle them.
    pub async fn recycle(self) {
        if self.session.is_closed() {
            event!(Level::DEBUG, backend = %self.backend, conn_id = self.id, "dropping closed connection");
            return;
        }
        match self.pool.upgrade() {
            Some(shared) => ConnectionPool::from_shared(shared).put(self).await,
            None => {
                let mut conn = self;
                conn.close().await;
            }
        }
    }

    pub async fn close(&mut self) {
        self.stream_registration = None;
        self.session.close().await;
    }
}

/// Detached kill capability for a connection.
///
/// Handed to timeout watchers so they can kill the session while the
/// connection itself is busy in a fetch.
#[derive(Clone)]
pub struct KillHandle {
    id: u64,
    backend: String,
    pool: Weak<PoolShared>,
    killed: Arc<AtomicBool>,
}

impl KillHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the connection killed and issues `KILL <id>` through another
    /// connection from the same pool.
    pub async fn kill(&self, reason: &str) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        event!(
            Level::WARN,
            backend = %self.backend,
            conn_id = self.id,
            reason = reason,
            "killing backend connection"
        );

        let pool = self
            .pool
            .upgrade()
            .map(ConnectionPool::from_shared)
            .ok_or_else(|| ProxyError::PoolClosed(self.backend.clone()))?;
        let mut helper = pool.get().await?;
        let result = helper.execute_raw(&format!("KILL {}", self.id)).await;
        helper.recycle().await;
        result.map(|_| ())
    }
}

/// Kills the query once `timeout` passes unless `done` resolves first.
///
/// A query that returns as the timer fires is not killed.
async fn watch_timeout(done: oneshot::Receiver<()>, timeout: Duration, handle: KillHandle) -> bool {
    tokio::select! {
        biased;
        _ = done => false,
        _ = sleep(timeout) => {
            if let Err(err) = handle.kill("query timeout").await {
                event!(Level::WARN, conn_id = handle.id, error = %err, "timeout kill failed");
            }
            true
        }
    }
}
