use super::manager::TransactionManager;
use super::state::TxnState;
use crate::connection::{BackendConnection, ConnectionPool};
use crate::core::{ProxyError, Result};
use crate::observability::TxnRegistration;
use crate::result::QueryResult;
use std::sync::Arc;
use tracing::{Level, event};

/// A single-connection, non-XA transaction on the backup backend.
pub struct BackupTxn {
    id: u64,
    mgr: Arc<TransactionManager>,
    pool: ConnectionPool,
    conn: Option<BackendConnection>,
    state: TxnState,
    errors: u64,
    timeout_ms: u64,
    max_result: u64,
    registration: Option<TxnRegistration>,
}

impl BackupTxn {
    pub(crate) fn new(id: u64, mgr: Arc<TransactionManager>, pool: ConnectionPool) -> Self {
        let registration = mgr
            .observability()
            .txns()
            .register(id, TxnState::Live.name(), "XA_NONE");
        let timeout_ms = mgr.config().query_timeout_ms;
        let max_result = mgr.config().max_result_size;
        Self {
            id,
            mgr,
            pool,
            conn: None,
            state: TxnState::Live,
            errors: 0,
            timeout_ms,
            max_result,
            registration: Some(registration),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn backend(&self) -> &str {
        self.pool.name()
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn set_max_result(&mut self, bytes: u64) {
        self.max_result = bytes;
    }

    fn set_state(&mut self, state: TxnState) {
        self.state = state;
        if let Some(registration) = &self.registration {
            registration.set_state(state.name());
        }
    }

    /// Runs `query`, switching to `database` first when one is given.
    pub async fn execute(&mut self, database: Option<&str>, query: &str) -> Result<QueryResult> {
        if self.state.is_terminal() {
            return Err(ProxyError::TransactionError(format!(
                "backup transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.set_state(TxnState::ExecutingNormal);

        let result = self.execute_inner(database, query).await;
        if let Err(err) = &result {
            self.errors += 1;
            event!(Level::WARN, txn_id = self.id, backend = %self.pool.name(), error = %err, "backup execute failed");
        }
        result
    }

    async fn execute_inner(&mut self, database: Option<&str>, query: &str) -> Result<QueryResult> {
        if self.conn.is_none() {
            self.conn = Some(self.pool.get().await?);
        }
        let (timeout_ms, max_result) = (self.timeout_ms, self.max_result);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::TransactionError("backup connection missing".into()))?;
        if let Some(database) = database.filter(|db| !db.is_empty()) {
            conn.use_db(database).await?;
        }
        conn.execute_with_limits(query, timeout_ms, max_result).await
    }

    pub async fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(TxnState::Finishing);
        if let Some(mut conn) = self.conn.take() {
            if self.errors > 0 {
                conn.close().await;
            } else {
                conn.recycle().await;
            }
        }
        self.registration = None;
        self.mgr.deregister(self.id, "TxnFinish");
    }

    pub async fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(TxnState::Aborting);
        if let Some(mut conn) = self.conn.take() {
            if let Err(err) = conn.kill("backup transaction aborted").await {
                event!(Level::WARN, txn_id = self.id, error = %err, "abort kill failed");
            }
            conn.close().await;
        }
        self.registration = None;
        self.mgr.deregister(self.id, "TxnAbort");
    }
}

impl Drop for BackupTxn {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.mgr.deregister(self.id, "TxnDropped");
        }
    }
}
