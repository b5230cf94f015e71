pub mod backend;
pub mod config;
pub mod memory;
pub mod pool;

use crate::core::{Result, Row};
use crate::result::QueryResult;
use async_trait::async_trait;
use config::BackendConfig;

pub use backend::{BackendConnection, KillHandle};
pub use pool::{ConnectionPool, PoolStats};

/// Dials physical sessions to a backend server.
///
/// This is the seam to the wire-protocol driver; everything above it only
/// ever talks to a [`Session`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Opens and authenticates a new session against `address`.
    ///
    /// `address` is passed separately from the config so that replica pools
    /// can reuse the primary's credentials.
    async fn dial(&self, config: &BackendConfig, address: &str) -> Result<Box<dyn Session>>;
}

/// One physical session on a backend server.
///
/// A session is owned by exactly one [`BackendConnection`] and is never
/// used from two tasks at once.
#[async_trait]
pub trait Session: Send {
    /// Server-side connection id, the target of `KILL <id>`.
    fn id(&self) -> u64;

    fn is_closed(&self) -> bool;

    async fn ping(&mut self) -> Result<()>;

    async fn use_db(&mut self, database: &str) -> Result<()>;

    /// Runs `query` and buffers the whole result.
    ///
    /// `on_bytes` is called with the wire size of every row as it arrives;
    /// returning `false` aborts the fetch with an error.
    async fn fetch(
        &mut self,
        query: &str,
        on_bytes: &mut (dyn FnMut(usize) -> bool + Send),
    ) -> Result<QueryResult>;

    /// Opens a streaming cursor and returns its field names.
    async fn stream_open(&mut self, query: &str) -> Result<Vec<String>>;

    /// Next row of the open cursor, `None` once drained.
    async fn stream_next(&mut self) -> Result<Option<Row>>;

    async fn stream_close(&mut self) -> Result<()>;

    async fn close(&mut self);
}
