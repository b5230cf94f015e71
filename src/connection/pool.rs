use super::backend::BackendConnection;
use super::config::BackendConfig;
use super::Driver;
use crate::core::{ProxyError, Result};
use crate::observability::Observability;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{Level, event};

/// Idle connections older than this are pinged before reuse.
pub const PING_IDLE_THRESHOLD: Duration = Duration::from_secs(1);

/// Idle connections older than this are replaced without a ping.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(20);

/// Connection pool
///
/// A bounded cache of idle [`BackendConnection`]s to one backend address.
/// `get` never waits for a free slot: a miss dials a fresh connection, and
/// `put` closes whatever does not fit. Cloning the pool clones a handle to
/// the same shared state.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    config: BackendConfig,
    address: String,
    driver: Arc<dyn Driver>,
    observability: Arc<Observability>,
    idle: Mutex<IdleQueue>,
    max_idle_ms: AtomicU64,
    counters: PoolCounters,
}

struct IdleQueue {
    closed: bool,
    connections: VecDeque<BackendConnection>,
}

#[derive(Default)]
struct PoolCounters {
    get: AtomicU64,
    hit: AtomicU64,
    miss: AtomicU64,
    put: AtomicU64,
    put_full: AtomicU64,
    dial_error: AtomicU64,
    ping: AtomicU64,
    ping_broken: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ConnectionPool {
    /// Creates a pool dialling the backend's primary address.
    pub fn new(
        config: BackendConfig,
        driver: Arc<dyn Driver>,
        observability: Arc<Observability>,
    ) -> Self {
        let address = config.address.clone();
        Self::with_address(config, &address, driver, observability)
    }

    /// Creates a pool that uses the backend's credentials against another
    /// address (a replica).
    pub fn with_address(
        config: BackendConfig,
        address: &str,
        driver: Arc<dyn Driver>,
        observability: Arc<Observability>,
    ) -> Self {
        let capacity = config.max_connections;
        Self {
            shared: Arc::new(PoolShared {
                config,
                address: address.to_string(),
                driver,
                observability,
                idle: Mutex::new(IdleQueue {
                    closed: false,
                    connections: VecDeque::with_capacity(capacity.min(64)),
                }),
                max_idle_ms: AtomicU64::new(DEFAULT_MAX_IDLE_TIME.as_millis() as u64),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.max_connections
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.shared.max_idle_ms.load(Ordering::Relaxed))
    }

    /// Tunes the long idle threshold at runtime.
    pub fn set_max_idle_time(&self, max_idle: Duration) {
        self.shared
            .max_idle_ms
            .store(max_idle.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.lock_idle().closed
    }

    fn lock_idle(&self) -> MutexGuard<'_, IdleQueue> {
        // The queue holds no invariant a panicking holder could break.
        match self.shared.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Takes an idle connection or dials a new one.
    ///
    /// Connections idle longer than [`PING_IDLE_THRESHOLD`] are pinged first;
    /// a failed ping, or an idle time past the long threshold, replaces the
    /// connection with a freshly dialled one.
    pub async fn get(&self) -> Result<BackendConnection> {
        let counters = &self.shared.counters;
        bump(&counters.get);

        let candidate = {
            let mut idle = self.lock_idle();
            if idle.closed {
                return Err(ProxyError::PoolClosed(self.name().to_string()));
            }
            idle.connections.pop_front()
        };

        let Some(mut conn) = candidate else {
            bump(&counters.miss);
            return self.dial().await;
        };
        bump(&counters.hit);

        let idle_for = conn.idle_time();
        if idle_for > self.max_idle_time() {
            event!(
                Level::DEBUG,
                backend = %self.name(),
                conn_id = conn.id(),
                idle_ms = idle_for.as_millis() as u64,
                "idle connection expired, reconnecting"
            );
            conn.close().await;
            return self.dial().await;
        }

        if idle_for > PING_IDLE_THRESHOLD {
            bump(&counters.ping);
            if let Err(err) = conn.ping().await {
                bump(&counters.ping_broken);
                event!(
                    Level::WARN,
                    backend = %self.name(),
                    conn_id = conn.id(),
                    error = %err,
                    "ping failed on idle connection, reconnecting"
                );
                conn.close().await;
                return self.dial().await;
            }
        }

        Ok(conn)
    }

    async fn dial(&self) -> Result<BackendConnection> {
        let shared = &self.shared;
        match shared.driver.dial(&shared.config, &shared.address).await {
            Ok(session) => Ok(BackendConnection::new(
                session,
                &shared.config.name,
                &shared.address,
                Arc::downgrade(&self.shared),
                Arc::clone(&shared.observability),
            )),
            Err(err) => {
                bump(&shared.counters.dial_error);
                event!(
                    Level::WARN,
                    backend = %shared.config.name,
                    address = %shared.address,
                    error = %err,
                    "dial failed"
                );
                Err(match err {
                    ProxyError::ServerUnavailable(_) => err,
                    other => ProxyError::ServerUnavailable(format!(
                        "dial {}: {}",
                        shared.address, other
                    )),
                })
            }
        }
    }

    /// Returns a connection to the idle queue, closing it if the queue is
    /// full or the pool is closed.
    pub async fn put(&self, mut conn: BackendConnection) {
        bump(&self.shared.counters.put);

        let surplus = {
            let mut idle = self.lock_idle();
            if idle.closed {
                Some(conn)
            } else if idle.connections.len() < self.capacity() {
                conn.touch();
                idle.connections.push_back(conn);
                None
            } else {
                bump(&self.shared.counters.put_full);
                Some(conn)
            }
        };

        if let Some(mut conn) = surplus {
            conn.close().await;
        }
    }

    /// Marks the pool terminal and closes every idle connection.
    pub async fn close(&self) {
        let drained: Vec<BackendConnection> = {
            let mut idle = self.lock_idle();
            if idle.closed {
                return;
            }
            idle.closed = true;
            idle.connections.drain(..).collect()
        };

        event!(
            Level::INFO,
            backend = %self.name(),
            idle = drained.len(),
            "closing connection pool"
        );
        for mut conn in drained {
            conn.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, closed) = {
            let queue = self.lock_idle();
            (queue.connections.len(), queue.closed)
        };
        let c = &self.shared.counters;
        PoolStats {
            name: self.name().to_string(),
            address: self.address().to_string(),
            capacity: self.capacity(),
            idle,
            closed,
            get: c.get.load(Ordering::Relaxed),
            hit: c.hit.load(Ordering::Relaxed),
            miss: c.miss.load(Ordering::Relaxed),
            put: c.put.load(Ordering::Relaxed),
            put_full: c.put_full.load(Ordering::Relaxed),
            dial_error: c.dial_error.load(Ordering::Relaxed),
            ping: c.ping.load(Ordering::Relaxed),
            ping_broken: c.ping_broken.load(Ordering::Relaxed),
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub address: String,
    pub capacity: usize,
    pub idle: usize,
    pub closed: bool,
    pub get: u64,
    pub hit: u64,
    pub miss: u64,
    pub put: u64,
    pub put_full: u64,
    pub dial_error: u64,
    pub ping: u64,
    pub ping_broken: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool {}@{}: {}/{} idle, get {} (hit {}, miss {}), put {}, dial errors {}, ping {}/{} broken",
            self.name,
            self.address,
            self.idle,
            self.capacity,
            self.get,
            self.hit,
            self.miss,
            self.put,
            self.dial_error,
            self.ping,
            self.ping_broken
        )
    }
}
