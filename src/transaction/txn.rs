// ============================================================================
// Txn: fan-out executor and XA coordinator
// ============================================================================
//
// A transaction spans the backends of a registry snapshot. Each execute
// groups its queries per backend, runs one branch per backend (inline for a
// single backend, on a JoinSet otherwise) and merges the results in
// completion order.
//
// In 2PC mode every backend keeps one connection for the whole transaction
// and write executes lazily open an XA branch on it. Commit and rollback run
// END/PREPARE and then the second phase under the manager's commit write
// lock; reads in 2PC mode hold the read lock.
//
// ============================================================================

use super::manager::TransactionManager;
use super::request::{FanoutMode, Request};
use super::state::{TxnState, XaState};
use crate::connection::{BackendConnection, ConnectionPool};
use crate::core::{ProxyError, Result, Row, estimated_row_bytes};
use crate::observability::TxnRegistration;
use crate::recovery::XaRecoveryState;
use crate::registry::BackendPools;
use crate::result::QueryResult;
use chrono::Local;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Rows buffered between stream producers and the consumer
pub const STREAM_CHANNEL_CAPACITY: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    TwoPc,
    Normal,
}

struct Branch {
    backend: String,
    slot: Slot,
    conn: BackendConnection,
    queries: Vec<String>,
}

struct BranchOutcome {
    backend: String,
    slot: Slot,
    conn: BackendConnection,
    result: Result<QueryResult>,
}

struct PhaseTwoJob {
    backend: String,
    conn: Option<BackendConnection>,
    pool: ConnectionPool,
    statement: String,
    retries: u32,
    backoff: Duration,
}

type PhaseTwoOutcome = (String, Option<BackendConnection>, Result<()>);

enum StreamItem {
    Fields(Vec<String>),
    Row(Row),
}

pub struct Txn {
    id: u64,
    xid: String,
    mgr: Arc<TransactionManager>,
    backends: BTreeMap<String, BackendPools>,
    twopc_connections: HashMap<String, BackendConnection>,
    normal_connections: Vec<BackendConnection>,
    xa_started: BTreeSet<String>,
    state: TxnState,
    xa_state: XaState,
    twopc: bool,
    multi_stmt: bool,
    errors: u64,
    timeout_ms: u64,
    max_result: u64,
    registration: Option<TxnRegistration>,
}

impl Txn {
    pub(crate) fn new(
        id: u64,
        mgr: Arc<TransactionManager>,
        backends: BTreeMap<String, BackendPools>,
    ) -> Self {
        let registration = mgr.observability().txns().register(
            id,
            TxnState::Live.name(),
            XaState::None.name(),
        );
        let timeout_ms = mgr.config().query_timeout_ms;
        let max_result = mgr.config().max_result_size;
        Self {
            id,
            xid: String::new(),
            mgr,
            backends,
            twopc_connections: HashMap::new(),
            normal_connections: Vec::new(),
            xa_started: BTreeSet::new(),
            state: TxnState::Live,
            xa_state: XaState::None,
            twopc: false,
            multi_stmt: false,
            errors: 0,
            timeout_ms,
            max_result,
            registration: Some(registration),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Empty until the transaction first enters XA.
    pub fn xid(&self) -> &str {
        &self.xid
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn xa_state(&self) -> XaState {
        self.xa_state
    }

    pub fn is_twopc(&self) -> bool {
        self.twopc
    }

    pub fn is_multi_stmt(&self) -> bool {
        self.multi_stmt
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
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

    fn set_xa_state(&mut self, state: XaState) {
        self.xa_state = state;
        if let Some(registration) = &self.registration {
            registration.set_xa_state(state.name());
        }
    }

    fn set_xid(&mut self, xid: String) {
        if let Some(registration) = &self.registration {
            registration.set_xid(&xid);
        }
        self.xid = xid;
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ProxyError::TransactionError(format!(
                "transaction {} is already {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Switches to two-phase commit; `XA START` waits for the first write.
    ///
    /// Does nothing when 2PC is disabled in the proxy configuration.
    pub fn begin(&mut self) {
        if !self.mgr.config().twopc_enable {
            event!(Level::DEBUG, txn_id = self.id, "twopc disabled, staying in normal mode");
            return;
        }
        self.twopc = true;
        self.set_state(TxnState::Beginning);
    }

    /// Begins a multi-statement transaction: XA branches are opened on
    /// every backend right away.
    pub async fn begin_scatter(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.begin();
        if !self.twopc {
            return Ok(());
        }
        self.multi_stmt = true;
        self.set_xid(make_xid("MULTRXID", self.id));
        let all = self.backend_names();
        self.xa_start(&all).await
    }

    /// Runs `req` and merges the per-backend results.
    ///
    /// Every branch runs to completion; the first failure is returned and
    /// the others are only logged.
    pub async fn execute(&mut self, req: &Request) -> Result<QueryResult> {
        self.ensure_usable()?;
        let plan = self.plan(req)?;
        if plan.is_empty() {
            return Ok(QueryResult::empty());
        }
        let replica = req.on_replica && !req.is_write();

        let mgr = Arc::clone(&self.mgr);
        let _read_guard = if self.twopc && !req.is_write() {
            Some(mgr.commit_read().await)
        } else {
            None
        };

        if self.twopc {
            self.set_state(TxnState::ExecutingTwoPc);
            if req.is_write() {
                let backends: Vec<String> = plan.iter().map(|(b, _)| b.clone()).collect();
                self.xa_start(&backends).await?;
            }
        } else {
            self.set_state(TxnState::ExecutingNormal);
        }

        let branches = self.checkout_all(plan, replica).await?;
        let (outcomes, lost) = run_branches(branches, self.timeout_ms, self.max_result).await;
        self.collect(outcomes, lost)
    }

    /// Streams `req` through `callback` in batches of about `buffer_bytes`.
    ///
    /// Each backend gets a fresh connection and a producer task; rows meet in
    /// a bounded channel so slow callbacks push back on the producers. Every
    /// batch carries the field list of the first cursor opened.
    pub async fn execute_stream_fetch<F>(
        &mut self,
        req: &Request,
        mut callback: F,
        buffer_bytes: usize,
    ) -> Result<()>
    where
        F: FnMut(&QueryResult) -> Result<()> + Send,
    {
        self.ensure_usable()?;
        let plan = self.plan(req)?;
        let replica = req.on_replica && !req.is_write();

        let mgr = Arc::clone(&self.mgr);
        let _read_guard = if self.twopc {
            Some(mgr.commit_read().await)
        } else {
            None
        };

        let mut cursors = Vec::with_capacity(plan.len());
        for (backend, queries) in plan {
            let pools = self.pools(&backend)?.clone();
            let pool = match (&pools.replica, replica) {
                (Some(replica_pool), true) => replica_pool.clone(),
                _ => pools.normal.clone(),
            };
            match pool.get().await {
                Ok(conn) => cursors.push((conn, queries)),
                Err(err) => {
                    self.errors += 1;
                    self.normal_connections
                        .extend(cursors.into_iter().map(|(conn, _)| conn));
                    return Err(err);
                }
            }
        }

        let (tx, mut rx) = mpsc::channel::<StreamItem>(STREAM_CHANNEL_CAPACITY);
        let mut producers = JoinSet::new();
        for (conn, queries) in cursors {
            producers.spawn(stream_cursor(conn, queries, tx.clone()));
        }
        drop(tx);

        let mut fields: Option<Vec<String>> = None;
        let mut batch = QueryResult::empty();
        let mut batch_bytes = 0usize;
        let mut delivered = false;
        let mut callback_error: Option<ProxyError> = None;

        while let Some(item) = rx.recv().await {
            if callback_error.is_some() {
                continue;
            }
            match item {
                StreamItem::Fields(names) => {
                    if fields.is_none() {
                        fields = Some(names);
                    }
                }
                StreamItem::Row(row) => {
                    batch_bytes += estimated_row_bytes(&row);
                    batch.rows.push(row);
                    if batch_bytes >= buffer_bytes {
                        batch.fields = fields.clone().unwrap_or_default();
                        delivered = true;
                        if let Err(err) = callback(&batch) {
                            // producers see the closed channel and stop
                            rx.close();
                            callback_error = Some(err);
                        }
                        batch.rows.clear();
                        batch_bytes = 0;
                    }
                }
            }
        }

        let mut first_error: Option<ProxyError> = None;
        while let Some(joined) = producers.join_next().await {
            match joined {
                Ok((conn, result)) => {
                    if let Err(err) = result {
                        self.errors += 1;
                        event!(Level::WARN, txn_id = self.id, backend = %conn.backend(), error = %err, "stream cursor failed");
                        first_error.get_or_insert(err);
                    }
                    self.normal_connections.push(conn);
                }
                Err(err) => {
                    self.errors += 1;
                    first_error.get_or_insert(ProxyError::TransactionError(format!(
                        "stream producer failed: {}",
                        err
                    )));
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if let Some(err) = callback_error {
            return Err(err);
        }
        if !batch.rows.is_empty() || !delivered {
            batch.fields = fields.unwrap_or_default();
            callback(&batch)?;
        }
        Ok(())
    }

    /// Ends, prepares and commits every open XA branch.
    ///
    /// A failed END or PREPARE rolls every branch back before the error is
    /// returned. A second phase that keeps failing is handed to the recovery
    /// journal and still counts as committed. Without open branches this is
    /// a no-op.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if !self.twopc || self.xa_started.is_empty() {
            return Ok(());
        }
        self.set_state(TxnState::Committing);
        let span = info_span!("txn.commit", txn_id = self.id, xid = %self.xid);
        self.two_phase_commit().instrument(span).await
    }

    async fn two_phase_commit(&mut self) -> Result<()> {
        let backends: Vec<String> = self.xa_started.iter().cloned().collect();
        let prepared = match self
            .xa_phase(XaState::End, XaState::EndFinished, "XA END", &backends)
            .await
        {
            Ok(()) => {
                self.xa_phase(
                    XaState::Prepare,
                    XaState::PrepareFinished,
                    "XA PREPARE",
                    &backends,
                )
                .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = prepared {
            event!(Level::WARN, txn_id = self.id, xid = %self.xid, error = %err, "xa prepare failed, rolling back");
            if let Err(rollback_err) = self.phase_two(XaRecoveryState::Rollback, &backends).await {
                event!(Level::ERROR, txn_id = self.id, xid = %self.xid, error = %rollback_err, "rollback after failed prepare failed");
            }
            return Err(err);
        }
        self.phase_two(XaRecoveryState::Commit, &backends).await
    }

    /// Rolls back branches an interrupted commit left prepared; the server
    /// keeps those past the end of the session.
    async fn rollback_prepared(&mut self) {
        if self.xa_state != XaState::PrepareFinished || self.xa_started.is_empty() {
            return;
        }
        let backends: Vec<String> = self.xa_started.iter().cloned().collect();
        if let Err(err) = self.phase_two(XaRecoveryState::Rollback, &backends).await {
            event!(Level::ERROR, txn_id = self.id, xid = %self.xid, error = %err, "rollback of prepared branches failed");
        }
    }

    /// Rolls back every open XA branch, ending them first if needed.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if !self.twopc || self.xa_started.is_empty() {
            return Ok(());
        }
        self.set_state(TxnState::Rollbacking);
        let span = info_span!("txn.rollback", txn_id = self.id, xid = %self.xid);
        self.two_phase_rollback().instrument(span).await
    }

    async fn two_phase_rollback(&mut self) -> Result<()> {
        let backends: Vec<String> = self.xa_started.iter().cloned().collect();
        if self.xa_state == XaState::StartFinished {
            if let Err(err) = self
                .xa_phase(XaState::End, XaState::EndFinished, "XA END", &backends)
                .await
            {
                event!(Level::WARN, txn_id = self.id, error = %err, "xa end before rollback failed");
            }
        }
        self.phase_two(XaRecoveryState::Rollback, &backends).await
    }

    /// Releases every held connection: back to the pools, or closed when the
    /// transaction saw errors. No-op after a previous finish or abort.
    pub async fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.rollback_prepared().await;
        self.set_state(TxnState::Finishing);

        let open_branches = std::mem::take(&mut self.xa_started);
        let twopc: Vec<(String, BackendConnection)> = self.twopc_connections.drain().collect();
        let normal: Vec<BackendConnection> = self.normal_connections.drain(..).collect();
        let close_all = self.errors > 0;

        for (backend, mut conn) in twopc {
            // the server discards unprepared branches with the session
            if close_all || open_branches.contains(&backend) {
                conn.close().await;
            } else {
                conn.recycle().await;
            }
        }
        for mut conn in normal {
            if close_all {
                conn.close().await;
            } else {
                conn.recycle().await;
            }
        }
        self.registration = None;
        self.mgr.deregister(self.id, "TxnFinish");
    }

    /// Kills every held connection. No-op after a previous finish or abort.
    pub async fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.rollback_prepared().await;
        self.set_state(TxnState::Aborting);

        let mut held: Vec<BackendConnection> =
            self.twopc_connections.drain().map(|(_, conn)| conn).collect();
        held.append(&mut self.normal_connections);
        self.xa_started.clear();

        for mut conn in held {
            if let Err(err) = conn.kill("transaction aborted").await {
                event!(Level::WARN, txn_id = self.id, backend = %conn.backend(), error = %err, "abort kill failed");
            }
            conn.close().await;
        }
        self.registration = None;
        self.mgr.deregister(self.id, "TxnAbort");
    }

    /// Groups the request into per-backend query lists.
    ///
    /// Normal mode keeps request order within a backend. Unknown backends
    /// fail the request before anything runs.
    fn plan(&self, req: &Request) -> Result<Vec<(String, Vec<String>)>> {
        match req.mode {
            FanoutMode::Single => {
                let backend = self.backends.keys().next().ok_or_else(|| {
                    ProxyError::TransactionError(format!("transaction {} has no backends", self.id))
                })?;
                Ok(vec![(backend.clone(), vec![req.raw_query.clone()])])
            }
            FanoutMode::Scatter => Ok(self
                .backends
                .keys()
                .map(|backend| (backend.clone(), vec![req.raw_query.clone()]))
                .collect()),
            FanoutMode::Normal => {
                let mut plan: Vec<(String, Vec<String>)> = Vec::new();
                for tuple in &req.querys {
                    if !self.backends.contains_key(&tuple.backend) {
                        return Err(ProxyError::BackendNotFound(tuple.backend.clone()));
                    }
                    match plan.iter_mut().find(|(backend, _)| *backend == tuple.backend) {
                        Some((_, queries)) => queries.push(tuple.query.clone()),
                        None => plan.push((tuple.backend.clone(), vec![tuple.query.clone()])),
                    }
                }
                Ok(plan)
            }
        }
    }

    fn pools(&self, backend: &str) -> Result<&BackendPools> {
        self.backends
            .get(backend)
            .ok_or_else(|| ProxyError::BackendNotFound(backend.to_string()))
    }

    async fn checkout(&mut self, backend: &str, replica: bool) -> Result<(Slot, BackendConnection)> {
        let pools = self.pools(backend)?.clone();
        if replica {
            if let Some(replica_pool) = &pools.replica {
                return Ok((Slot::Normal, replica_pool.get().await?));
            }
        }
        if self.twopc {
            if let Some(conn) = self.twopc_connections.remove(backend) {
                return Ok((Slot::TwoPc, conn));
            }
            return Ok((Slot::TwoPc, pools.normal.get().await?));
        }
        Ok((Slot::Normal, pools.normal.get().await?))
    }

    async fn checkout_all(
        &mut self,
        plan: Vec<(String, Vec<String>)>,
        replica: bool,
    ) -> Result<Vec<Branch>> {
        let mut branches = Vec::with_capacity(plan.len());
        for (backend, queries) in plan {
            match self.checkout(&backend, replica).await {
                Ok((slot, conn)) => branches.push(Branch {
                    backend,
                    slot,
                    conn,
                    queries,
                }),
                Err(err) => {
                    for branch in branches {
                        self.keep(branch.backend, branch.slot, branch.conn);
                    }
                    self.errors += 1;
                    return Err(err);
                }
            }
        }
        Ok(branches)
    }

    fn keep(&mut self, backend: String, slot: Slot, conn: BackendConnection) {
        match slot {
            Slot::TwoPc => {
                if let Some(previous) = self.twopc_connections.insert(backend, conn) {
                    self.normal_connections.push(previous);
                }
            }
            Slot::Normal => self.normal_connections.push(conn),
        }
    }

    fn collect(&mut self, outcomes: Vec<BranchOutcome>, lost: Vec<ProxyError>) -> Result<QueryResult> {
        let mut merged = QueryResult::empty();
        let mut first_error = None;
        for err in lost {
            self.errors += 1;
            first_error.get_or_insert(err);
        }
        for outcome in outcomes {
            match outcome.result {
                Ok(result) => merged.append(result),
                Err(err) => {
                    self.errors += 1;
                    event!(
                        Level::WARN,
                        txn_id = self.id,
                        backend = %outcome.backend,
                        error = %err,
                        "backend execute failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
            self.keep(outcome.backend, outcome.slot, outcome.conn);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }

    /// Runs one XA statement on the 2PC connection of each backend and
    /// returns the backends that accepted it.
    async fn xa_command(&mut self, backends: &[String], statement: &str) -> (Vec<String>, Option<ProxyError>) {
        let plan = backends
            .iter()
            .map(|backend| (backend.clone(), vec![statement.to_string()]))
            .collect();
        let branches = match self.checkout_all(plan, false).await {
            Ok(branches) => branches,
            Err(err) => return (Vec::new(), Some(err)),
        };
        let (outcomes, lost) = run_branches(branches, 0, 0).await;
        let accepted = outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .map(|outcome| outcome.backend.clone())
            .collect();
        (accepted, self.collect(outcomes, lost).err())
    }

    async fn xa_start(&mut self, backends: &[String]) -> Result<()> {
        let pending: Vec<String> = backends
            .iter()
            .filter(|backend| !self.xa_started.contains(*backend))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if self.xid.is_empty() {
            self.set_xid(make_xid("RXID", self.id));
        }

        self.set_xa_state(XaState::Start);
        let statement = format!("XA START '{}'", self.xid);
        let (started, err) = self.xa_command(&pending, &statement).await;
        self.xa_started.extend(started);
        self.set_xa_state(XaState::StartFinished);
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn xa_phase(
        &mut self,
        running: XaState,
        finished: XaState,
        verb: &str,
        backends: &[String],
    ) -> Result<()> {
        self.set_xa_state(running);
        let statement = format!("{} '{}'", verb, self.xid);
        let (_, err) = self.xa_command(backends, &statement).await;
        self.set_xa_state(finished);
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Second phase under the commit write lock, with per-backend retries.
    async fn phase_two(&mut self, decision: XaRecoveryState, backends: &[String]) -> Result<()> {
        let (running, finished, counter) = match decision {
            XaRecoveryState::Commit => (XaState::Commit, XaState::CommitFinished, "XaCommitErr"),
            XaRecoveryState::Rollback => {
                (XaState::Rollback, XaState::RollbackFinished, "XaRollbackErr")
            }
        };
        let statement = decision.statement(&self.xid);
        let retries = self.mgr.config().xa_check.max_retries;
        let backoff = self.mgr.config().xa_check.retry_backoff;

        let mut jobs = Vec::with_capacity(backends.len());
        for backend in backends {
            let pool = self.pools(backend)?.normal.clone();
            jobs.push(PhaseTwoJob {
                backend: backend.clone(),
                conn: self.twopc_connections.remove(backend),
                pool,
                statement: statement.clone(),
                retries,
                backoff,
            });
        }

        self.set_xa_state(running);
        let mgr = Arc::clone(&self.mgr);
        let outcomes = {
            let _write_guard = mgr.commit_write().await;
            run_phase_two(jobs).await
        };

        let mut failed = 0;
        for (backend, conn, result) in outcomes {
            if let Err(err) = result {
                self.errors += 1;
                failed += 1;
                self.mgr.observability().counters().inc(counter);
                event!(
                    Level::WARN,
                    txn_id = self.id,
                    xid = %self.xid,
                    backend = %backend,
                    error = %err,
                    "xa second phase failed"
                );
            }
            if let Some(conn) = conn {
                self.keep(backend, Slot::TwoPc, conn);
            }
        }
        self.xa_started.clear();
        self.set_xa_state(finished);

        if failed > 0 {
            self.mgr
                .xa_check()
                .write_failure_record(&self.xid, decision)
                .await?;
        }
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            event!(Level::WARN, txn_id = self.id, state = %self.state, "transaction dropped without finish or abort");
            self.mgr.deregister(self.id, "TxnDropped");
        }
    }
}

fn make_xid(prefix: &str, id: u64) -> String {
    format!("{}-{}-{}", prefix, Local::now().format("%Y%m%d%H%M%S"), id)
}

async fn run_branch(mut branch: Branch, timeout_ms: u64, max_result: u64) -> BranchOutcome {
    let mut merged = QueryResult::empty();
    let mut failure = None;
    for query in &branch.queries {
        match branch
            .conn
            .execute_with_limits(query, timeout_ms, max_result)
            .await
        {
            Ok(result) => merged.append(result),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    BranchOutcome {
        backend: branch.backend,
        slot: branch.slot,
        conn: branch.conn,
        result: match failure {
            Some(err) => Err(err),
            None => Ok(merged),
        },
    }
}

/// Runs every branch to completion; outcomes are in completion order.
async fn run_branches(
    branches: Vec<Branch>,
    timeout_ms: u64,
    max_result: u64,
) -> (Vec<BranchOutcome>, Vec<ProxyError>) {
    if branches.len() <= 1 {
        let mut outcomes = Vec::with_capacity(1);
        for branch in branches {
            outcomes.push(run_branch(branch, timeout_ms, max_result).await);
        }
        return (outcomes, Vec::new());
    }

    let mut set = JoinSet::new();
    for branch in branches {
        set.spawn(run_branch(branch, timeout_ms, max_result));
    }
    let mut outcomes = Vec::with_capacity(set.len());
    let mut lost = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => lost.push(ProxyError::TransactionError(format!(
                "fan-out task failed: {}",
                err
            ))),
        }
    }
    (outcomes, lost)
}

async fn run_phase_two(jobs: Vec<PhaseTwoJob>) -> Vec<PhaseTwoOutcome> {
    if jobs.len() <= 1 {
        let mut outcomes = Vec::with_capacity(1);
        for job in jobs {
            outcomes.push(phase_two_branch(job).await);
        }
        return outcomes;
    }

    let mut set = JoinSet::new();
    for job in jobs {
        set.spawn(phase_two_branch(job));
    }
    let mut outcomes = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => outcomes.push((
                String::new(),
                None,
                Err(ProxyError::TransactionError(format!("xa task failed: {}", err))),
            )),
        }
    }
    outcomes
}

/// Applies the decision on one backend.
///
/// The first attempt reuses the branch's connection; later attempts wait
/// `attempt * backoff` and dial a fresh one. `XAER_NOTA` means the branch is
/// already resolved and stops the loop.
async fn phase_two_branch(job: PhaseTwoJob) -> PhaseTwoOutcome {
    let PhaseTwoJob {
        backend,
        mut conn,
        pool,
        statement,
        retries,
        backoff,
    } = job;

    let mut last_error = None;
    for attempt in 0..retries {
        if attempt > 0 || conn.is_none() {
            if attempt > 0 {
                sleep(backoff * attempt).await;
            }
            if let Some(mut stale) = conn.take() {
                stale.close().await;
            }
            match pool.get().await {
                Ok(fresh) => conn = Some(fresh),
                Err(err) => {
                    event!(Level::WARN, backend = %backend, attempt = attempt, error = %err, "xa retry connection failed");
                    last_error = Some(err);
                    continue;
                }
            }
        }
        let Some(current) = conn.as_mut() else {
            continue;
        };
        match current.execute(&statement).await {
            Ok(_) => return (backend, conn, Ok(())),
            Err(err) if err.is_unknown_xid() => {
                event!(Level::INFO, backend = %backend, statement = %statement, "xa branch already resolved");
                return (backend, conn, Ok(()));
            }
            Err(err) => {
                event!(Level::WARN, backend = %backend, attempt = attempt, error = %err, "xa second phase attempt failed");
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| {
        ProxyError::TransactionError(format!("no attempt made for '{}'", statement))
    });
    (backend, conn, Err(err))
}

/// Feeds every row of `queries` into `tx`, one cursor at a time.
async fn stream_cursor(
    mut conn: BackendConnection,
    queries: Vec<String>,
    tx: mpsc::Sender<StreamItem>,
) -> (BackendConnection, Result<()>) {
    for query in &queries {
        let fields = match conn.stream_open(query).await {
            Ok(fields) => fields,
            Err(err) => return (conn, Err(err)),
        };
        if tx.send(StreamItem::Fields(fields)).await.is_err() {
            let _ = conn.stream_close().await;
            return (conn, Ok(()));
        }
        loop {
            match conn.stream_next().await {
                Ok(Some(row)) => {
                    if tx.send(StreamItem::Row(row)).await.is_err() {
                        let _ = conn.stream_close().await;
                        return (conn, Ok(()));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = conn.stream_close().await;
                    return (conn, Err(err));
                }
            }
        }
        if let Err(err) = conn.stream_close().await {
            return (conn, Err(err));
        }
    }
    (conn, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::connection::config::BackendConfig;
    use crate::connection::memory::{Fault, MemoryDriver};
    use crate::core::Value;
    use crate::observability::Observability;
    use crate::transaction::request::QueryTuple;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<MemoryDriver>,
        mgr: Arc<TransactionManager>,
        backends: BTreeMap<String, BackendPools>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver = MemoryDriver::new();
        let obs = Observability::new();
        let mut backends = BTreeMap::new();
        for name in names {
            let config = BackendConfig::new(name, &format!("{}:3306", name));
            let normal = ConnectionPool::new(config.clone(), driver.clone(), obs.clone());
            backends.insert(
                name.to_string(),
                BackendPools {
                    config,
                    normal,
                    replica: None,
                },
            );
        }
        let pools: Vec<ConnectionPool> = backends.values().map(|p| p.normal.clone()).collect();
        let config = ProxyConfig::new(dir.path())
            .xa_retry_backoff(Duration::from_millis(5))
            .xa_max_retries(3)
            .xa_check_interval(Duration::from_secs(60));
        let mgr = TransactionManager::open(config, Arc::new(pools), obs).unwrap();
        Fixture {
            _dir: dir,
            driver,
            mgr,
            backends,
        }
    }

    #[tokio::test]
    async fn test_single_uses_first_backend() {
        let f = fixture(&["b", "a"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.execute(&Request::single("SELECT 1")).await.unwrap();

        assert_eq!(f.driver.server("a:3306").count_queries("SELECT 1"), 1);
        assert_eq!(f.driver.server("b:3306").count_queries("SELECT 1"), 0);
        assert_eq!(txn.state(), TxnState::ExecutingNormal);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_normal_mode_keeps_order_per_backend() {
        let f = fixture(&["a", "b"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        let req = Request::normal(vec![
            QueryTuple::new("a", "INSERT INTO t VALUES (1)"),
            QueryTuple::new("b", "INSERT INTO t VALUES (2)"),
            QueryTuple::new("a", "INSERT INTO t VALUES (3)"),
        ])
        .write();
        let result = txn.execute(&req).await.unwrap();
        assert_eq!(result.rows_affected, 3);

        let log = f.driver.server("a:3306").query_log();
        let queries: Vec<&str> = log.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (3)"]);
        assert_eq!(log[0].session_id, log[1].session_id);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_before_running() {
        let f = fixture(&["a"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        let req = Request::normal(vec![
            QueryTuple::new("a", "SELECT 1"),
            QueryTuple::new("zz", "SELECT 1"),
        ]);
        let err = txn.execute(&req).await.unwrap_err();
        assert_eq!(err, ProxyError::BackendNotFound("zz".into()));
        assert_eq!(f.driver.server("a:3306").count_queries("SELECT"), 0);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_write_starts_xa_lazily_and_commits() {
        let f = fixture(&["a", "b"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        assert!(txn.xid().is_empty());

        let req = Request::normal(vec![QueryTuple::new("a", "UPDATE t SET x = 1")]).write();
        txn.execute(&req).await.unwrap();
        assert!(txn.xid().starts_with("RXID-"));
        assert_eq!(txn.xa_state(), XaState::StartFinished);

        txn.commit().await.unwrap();
        assert_eq!(txn.xa_state(), XaState::CommitFinished);
        assert_eq!(f.driver.server("a:3306").committed_xids(), vec![txn.xid().to_string()]);
        // b never took part
        assert_eq!(f.driver.server("b:3306").count_queries("XA"), 0);
        txn.finish().await;
        assert_eq!(f.mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn test_read_only_commit_is_noop() {
        let f = fixture(&["a"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        txn.execute(&Request::scatter("SELECT 1")).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(txn.xa_state(), XaState::None);
        assert_eq!(f.driver.server("a:3306").count_queries("XA"), 0);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_begin_scatter_starts_everywhere() {
        let f = fixture(&["a", "b"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin_scatter().await.unwrap();
        assert!(txn.xid().starts_with("MULTRXID-"));
        assert!(txn.is_multi_stmt());

        txn.execute(&Request::scatter("DELETE FROM t").write()).await.unwrap();
        assert_eq!(f.driver.server("a:3306").count_queries("XA START"), 1);

        txn.rollback().await.unwrap();
        assert_eq!(txn.xa_state(), XaState::RollbackFinished);
        assert_eq!(f.driver.server("b:3306").rolled_back_xids(), vec![txn.xid().to_string()]);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_prepare_failure_rolls_back_and_counts_error() {
        let f = fixture(&["a"]);
        f.driver.server("a:3306").inject(
            "XA PREPARE",
            Fault::Error(ProxyError::server(1402, "XA100", "rollback only")),
            Some(1),
        );
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
            .await
            .unwrap();

        assert!(txn.commit().await.is_err());
        assert_eq!(txn.xa_state(), XaState::RollbackFinished);
        assert_eq!(txn.errors(), 1);
        assert_eq!(f.driver.server("a:3306").rolled_back_xids(), vec![txn.xid().to_string()]);

        // nothing left to roll back
        txn.rollback().await.unwrap();
        assert_eq!(f.driver.server("a:3306").count_queries("XA ROLLBACK"), 1);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_abort_rolls_back_prepared_branches() {
        let f = fixture(&["a", "b"]);
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
            .await
            .unwrap();
        let backends = txn.backend_names();
        txn.xa_phase(XaState::End, XaState::EndFinished, "XA END", &backends)
            .await
            .unwrap();
        txn.xa_phase(XaState::Prepare, XaState::PrepareFinished, "XA PREPARE", &backends)
            .await
            .unwrap();
        assert_eq!(f.driver.server("a:3306").prepared_xids().len(), 1);

        txn.abort().await;
        for address in ["a:3306", "b:3306"] {
            let server = f.driver.server(address);
            assert!(server.prepared_xids().is_empty());
            assert_eq!(server.rolled_back_xids(), vec![txn.xid().to_string()]);
        }
        assert_eq!(txn.xa_state(), XaState::RollbackFinished);
        assert_eq!(f.mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_after_failed_end_retries_on_fresh_connection() {
        let f = fixture(&["a"]);
        let server = f.driver.server("a:3306");
        server.inject(
            "XA END",
            Fault::Error(ProxyError::ServerUnavailable("EOF".into())),
            Some(1),
        );
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
            .await
            .unwrap();

        txn.rollback().await.unwrap();
        // ACTIVE branch refuses the rollback; closing the session discards it
        assert_eq!(server.count_queries("XA ROLLBACK"), 2);
        assert!(server.rolled_back_xids().is_empty());
        assert!(server.prepared_xids().is_empty());
        assert!(f.mgr.xa_check().entries().await.is_empty());
        assert_eq!(f.mgr.observability().counters().get("XaRollbackErr"), 0);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_exhausted_commit_goes_to_journal() {
        let f = fixture(&["a", "b"]);
        let server = f.driver.server("b:3306");
        server.inject(
            "XA COMMIT",
            Fault::Error(ProxyError::ServerUnavailable("EOF".into())),
            None,
        );
        let mut txn = f.mgr.create_txn(f.backends.clone());
        txn.begin();
        txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
            .await
            .unwrap();

        txn.commit().await.unwrap();
        assert_eq!(server.count_queries("XA COMMIT"), 3);
        let entries = f.mgr.xa_check().entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].xid, txn.xid());
        assert_eq!(f.mgr.observability().counters().get("XaCommitErr"), 1);

        server.clear_faults();
        assert_eq!(f.mgr.xa_check().check_once().await.unwrap(), 0);
        assert_eq!(server.committed_xids(), vec![txn.xid().to_string()]);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_stream_fetch_batches_rows() {
        let f = fixture(&["a", "b"]);
        for name in ["a:3306", "b:3306"] {
            let rows = (0..50).map(|i| vec![Value::Integer(i)]).collect();
            f.driver
                .server(name)
                .set_result("SELECT id FROM t", QueryResult::new(vec!["id".into()], rows));
        }
        let mut txn = f.mgr.create_txn(f.backends.clone());
        let mut batches = 0;
        let mut rows = 0;
        txn.execute_stream_fetch(
            &Request::scatter("SELECT id FROM t"),
            |batch| {
                batches += 1;
                rows += batch.row_count();
                assert_eq!(batch.fields, vec!["id".to_string()]);
                Ok(())
            },
            80,
        )
        .await
        .unwrap();
        assert_eq!(rows, 100);
        assert!(batches > 1);
        txn.finish().await;
    }

    #[tokio::test]
    async fn test_stream_fetch_surfaces_cursor_error() {
        let f = fixture(&["a"]);
        let server = f.driver.server("a:3306");
        let rows = (0..10).map(|i| vec![Value::Integer(i)]).collect();
        server.set_result("SELECT id FROM t", QueryResult::new(vec!["id".into()], rows));
        server.inject(
            "SELECT id",
            Fault::ErrorAfterRows(4, ProxyError::ServerUnavailable("EOF".into())),
            Some(1),
        );
        let mut txn = f.mgr.create_txn(f.backends.clone());
        let err = txn
            .execute_stream_fetch(&Request::single("SELECT id FROM t"), |_| Ok(()), 1024)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(txn.errors(), 1);
        txn.finish().await;
    }
}
