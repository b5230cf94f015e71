//! In-memory backend driver.
//!
//! `MemoryServer` behaves like a MySQL server as far as the execution layer
//! can tell: numbered sessions, `KILL <id>`, `USE`, XA branch bookkeeping
//! with `XAER_NOTA` on unknown xids, and `XA RECOVER`. Results are scripted
//! per query and faults (errors, delays, broken streams, a downed server)
//! can be injected per query prefix. Every executed statement is logged
//! with its start and finish instant.

use super::config::BackendConfig;
use super::{Driver, Session};
use crate::core::{ProxyError, Result, Row, Value, estimated_row_bytes};
use crate::result::QueryResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::sleep;

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A fault injected into queries starting with a given prefix.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the statement with this error.
    Error(ProxyError),
    /// Hold the statement for this long; a `KILL` ends the wait early.
    Delay(Duration),
    /// Deliver this many rows, then fail the fetch or stream.
    ErrorAfterRows(usize, ProxyError),
}

struct FaultRule {
    prefix: String,
    fault: Fault,
    remaining: Option<usize>,
}

/// One executed statement.
#[derive(Debug, Clone)]
pub struct QueryLogEntry {
    pub session_id: u64,
    pub query: String,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Idle,
    Prepared,
}

struct XaBranch {
    session_id: u64,
    state: BranchState,
}

#[derive(Default)]
struct SessionFlag {
    killed: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    down: bool,
    next_session_id: u64,
    sessions: HashMap<u64, Arc<SessionFlag>>,
    dials: u64,
    kills: u64,
    results: HashMap<String, QueryResult>,
    faults: Vec<FaultRule>,
    branches: HashMap<String, XaBranch>,
    committed: Vec<String>,
    rolled_back: Vec<String>,
    streamed: u64,
    log: Vec<QueryLogEntry>,
}

impl ServerState {
    fn take_fault(&mut self, normalized: &str) -> Option<Fault> {
        let index = self
            .faults
            .iter()
            .position(|rule| normalized.starts_with(&rule.prefix))?;
        let rule = &mut self.faults[index];
        let fault = rule.fault.clone();
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(index);
        }
        Some(fault)
    }

    fn kill(&mut self, target: u64) -> Result<QueryResult> {
        let flag = self
            .sessions
            .remove(&target)
            .ok_or_else(|| ProxyError::server(1094, "HY000", format!("Unknown thread id: {}", target)))?;
        flag.killed.store(true, Ordering::SeqCst);
        self.kills += 1;
        self.drop_open_branches(target);
        Ok(QueryResult::empty())
    }

    /// A lost session takes its unprepared branches with it.
    fn drop_open_branches(&mut self, session_id: u64) {
        self.branches
            .retain(|_, b| b.state == BranchState::Prepared || b.session_id != session_id);
    }

    fn xa(&mut self, session_id: u64, normalized: &str, original: &str) -> Result<QueryResult> {
        if normalized.starts_with("XA RECOVER") {
            let mut xids: Vec<&String> = self
                .branches
                .iter()
                .filter(|(_, b)| b.state == BranchState::Prepared)
                .map(|(xid, _)| xid)
                .collect();
            xids.sort();
            let rows = xids
                .into_iter()
                .map(|xid| {
                    vec![
                        Value::Integer(1),
                        Value::Integer(xid.len() as i64),
                        Value::Integer(0),
                        Value::Text(xid.clone()),
                    ]
                })
                .collect();
            return Ok(QueryResult::new(
                vec![
                    "formatID".into(),
                    "gtrid_length".into(),
                    "bqual_length".into(),
                    "data".into(),
                ],
                rows,
            ));
        }

        let xid = parse_xid(original)
            .ok_or_else(|| ProxyError::server(1064, "42000", format!("bad XA statement: {}", original)))?;
        let state = self.branches.get(&xid).map(|b| (b.session_id, b.state));

        if normalized.starts_with("XA START") || normalized.starts_with("XA BEGIN") {
            if state.is_some() {
                return Err(ProxyError::server(1440, "XAE08", "XAER_DUPID: The XID already exists"));
            }
            self.branches.insert(
                xid,
                XaBranch {
                    session_id,
                    state: BranchState::Active,
                },
            );
        } else if normalized.starts_with("XA END") {
            match state {
                Some((owner, BranchState::Active)) if owner == session_id => {
                    self.set_branch(&xid, BranchState::Idle)
                }
                _ => return Err(unknown_xid(&xid)),
            }
        } else if normalized.starts_with("XA PREPARE") {
            match state {
                Some((owner, BranchState::Idle)) if owner == session_id => {
                    self.set_branch(&xid, BranchState::Prepared)
                }
                _ => return Err(unknown_xid(&xid)),
            }
        } else if normalized.starts_with("XA COMMIT") {
            let one_phase = normalized.ends_with("ONE PHASE");
            match state {
                Some((_, BranchState::Prepared)) => {}
                Some((_, BranchState::Idle)) if one_phase => {}
                _ => return Err(unknown_xid(&xid)),
            }
            self.branches.remove(&xid);
            self.committed.push(xid);
        } else if normalized.starts_with("XA ROLLBACK") {
            match state {
                Some((_, BranchState::Prepared | BranchState::Idle)) => {}
                Some((_, BranchState::Active)) => {
                    return Err(ProxyError::server(
                        1399,
                        "XAE07",
                        "XAER_RMFAIL: The command cannot be executed when global transaction is in the ACTIVE state",
                    ));
                }
                None => return Err(unknown_xid(&xid)),
            }
            self.branches.remove(&xid);
            self.rolled_back.push(xid);
        } else {
            return Err(ProxyError::server(1064, "42000", format!("bad XA statement: {}", original)));
        }
        Ok(QueryResult::empty())
    }

    fn set_branch(&mut self, xid: &str, state: BranchState) {
        if let Some(branch) = self.branches.get_mut(xid) {
            branch.state = state;
        }
    }
}

fn normalize(query: &str) -> String {
    query.trim().trim_end_matches(';').trim().to_uppercase()
}

fn parse_xid(query: &str) -> Option<String> {
    let start = query.find('\'')? + 1;
    let len = query[start..].find('\'')?;
    Some(query[start..start + len].to_string())
}

fn unknown_xid(xid: &str) -> ProxyError {
    ProxyError::server(1397, "XAE04", xid)
}

fn eof() -> ProxyError {
    ProxyError::ServerUnavailable("EOF".to_string())
}

/// Handle to one in-memory server; clones share state.
#[derive(Clone)]
pub struct MemoryServer {
    address: String,
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Scripts the result returned for `query` (case-insensitive).
    pub fn set_result(&self, query: &str, result: QueryResult) {
        self.lock().results.insert(normalize(query), result);
    }

    /// Injects a fault for statements starting with `prefix`; `times` limits
    /// how often it fires.
    pub fn inject(&self, prefix: &str, fault: Fault, times: Option<usize>) {
        self.lock().faults.push(FaultRule {
            prefix: normalize(prefix),
            fault,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// A downed server refuses dials and fails every statement with EOF.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Leaves `xid` prepared, as a crashed coordinator would.
    pub fn prepare_xid(&self, xid: &str) {
        self.lock().branches.insert(
            xid.to_string(),
            XaBranch {
                session_id: 0,
                state: BranchState::Prepared,
            },
        );
    }

    pub fn prepared_xids(&self) -> Vec<String> {
        let state = self.lock();
        let mut xids: Vec<String> = state
            .branches
            .iter()
            .filter(|(_, b)| b.state == BranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect();
        xids.sort();
        xids
    }

    pub fn committed_xids(&self) -> Vec<String> {
        self.lock().committed.clone()
    }

    pub fn rolled_back_xids(&self) -> Vec<String> {
        self.lock().rolled_back.clone()
    }

    pub fn dial_count(&self) -> u64 {
        self.lock().dials
    }

    pub fn kill_count(&self) -> u64 {
        self.lock().kills
    }

    /// Rows handed out by streaming cursors so far.
    pub fn streamed_rows(&self) -> u64 {
        self.lock().streamed
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.lock().log.clone()
    }

    /// Number of logged statements starting with `prefix`.
    pub fn count_queries(&self, prefix: &str) -> usize {
        let prefix = normalize(prefix);
        self.lock()
            .log
            .iter()
            .filter(|entry| normalize(&entry.query).starts_with(&prefix))
            .count()
    }

    fn open_session(&self, database: &str) -> Result<MemorySession> {
        let mut state = self.lock();
        if state.down {
            return Err(ProxyError::ServerUnavailable(format!(
                "dial tcp {}: connection refused",
                self.address
            )));
        }
        state.dials += 1;
        state.next_session_id += 1;
        let id = state.next_session_id;
        let flag = Arc::new(SessionFlag::default());
        state.sessions.insert(id, Arc::clone(&flag));
        Ok(MemorySession {
            id,
            server: self.clone(),
            flag,
            closed: false,
            database: database.to_string(),
            cursor: None,
        })
    }

    fn disconnect(&self, session_id: u64) {
        let mut state = self.lock();
        state.sessions.remove(&session_id);
        state.drop_open_branches(session_id);
    }

    fn is_down(&self) -> bool {
        self.lock().down
    }

    fn take_fault(&self, query: &str) -> Option<Fault> {
        self.lock().take_fault(&normalize(query))
    }

    fn respond(&self, session_id: u64, query: &str) -> Result<QueryResult> {
        let mut state = self.lock();
        if state.down {
            return Err(eof());
        }
        let normalized = normalize(query);
        if let Some(rest) = normalized.strip_prefix("KILL ") {
            let rest = rest.strip_prefix("QUERY ").unwrap_or(rest);
            let target: u64 = rest
                .trim()
                .parse()
                .map_err(|_| ProxyError::server(1064, "42000", format!("bad KILL: {}", query)))?;
            return state.kill(target);
        }
        if normalized.starts_with("XA ") {
            return state.xa(session_id, &normalized, query);
        }
        if let Some(result) = state.results.get(&normalized) {
            return Ok(result.clone());
        }
        if normalized.starts_with("SELECT") || normalized.starts_with("SHOW") {
            Ok(QueryResult::empty())
        } else {
            Ok(QueryResult::affected(1))
        }
    }

    fn log(&self, session_id: u64, query: &str, started: Instant, ok: bool) {
        self.lock().log.push(QueryLogEntry {
            session_id,
            query: query.to_string(),
            started,
            finished: Instant::now(),
            ok,
        });
    }
}

struct Cursor {
    rows: VecDeque<Row>,
    fail_after: Option<(usize, ProxyError)>,
    sent: usize,
}

pub struct MemorySession {
    id: u64,
    server: MemoryServer,
    flag: Arc<SessionFlag>,
    closed: bool,
    database: String,
    cursor: Option<Cursor>,
}

impl MemorySession {
    pub fn database(&self) -> &str {
        &self.database
    }

    fn check_alive(&self) -> Result<()> {
        if self.closed || self.flag.killed.load(Ordering::SeqCst) || self.server.is_down() {
            return Err(eof());
        }
        Ok(())
    }

    async fn wait_or_killed(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        loop {
            self.check_alive()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            sleep(KILL_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Applies an injected fault; returns a deferred row-count failure.
    async fn apply_fault(&self, query: &str) -> Result<Option<(usize, ProxyError)>> {
        match self.server.take_fault(query) {
            None => Ok(None),
            Some(Fault::Error(err)) => Err(err),
            Some(Fault::Delay(delay)) => {
                self.wait_or_killed(delay).await?;
                Ok(None)
            }
            Some(Fault::ErrorAfterRows(rows, err)) => Ok(Some((rows, err))),
        }
    }

    async fn fetch_inner(
        &mut self,
        query: &str,
        on_bytes: &mut (dyn FnMut(usize) -> bool + Send),
    ) -> Result<QueryResult> {
        self.check_alive()?;
        let fail_after = self.apply_fault(query).await?;
        let result = self.server.respond(self.id, query)?;
        for (index, row) in result.rows.iter().enumerate() {
            if let Some((limit, err)) = &fail_after {
                if index >= *limit {
                    return Err(err.clone());
                }
            }
            if !on_bytes(estimated_row_bytes(row)) {
                return Err(ProxyError::server(1317, "70100", "fetch aborted by client"));
            }
        }
        Ok(result)
    }

    async fn stream_open_inner(&mut self, query: &str) -> Result<Vec<String>> {
        self.check_alive()?;
        let fail_after = self.apply_fault(query).await?;
        let result = self.server.respond(self.id, query)?;
        self.cursor = Some(Cursor {
            rows: result.rows.into(),
            fail_after,
            sent: 0,
        });
        Ok(result.fields)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed || self.flag.killed.load(Ordering::SeqCst)
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_alive()?;
        self.apply_fault("PING").await?;
        Ok(())
    }

    async fn use_db(&mut self, database: &str) -> Result<()> {
        let query = format!("USE {}", database);
        let started = Instant::now();
        let result: Result<()> = async {
            self.check_alive()?;
            self.apply_fault(&query).await?;
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.database = database.to_string();
        }
        self.server.log(self.id, &query, started, result.is_ok());
        result
    }

    async fn fetch(
        &mut self,
        query: &str,
        on_bytes: &mut (dyn FnMut(usize) -> bool + Send),
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let result = self.fetch_inner(query, on_bytes).await;
        self.server.log(self.id, query, started, result.is_ok());
        result
    }

    async fn stream_open(&mut self, query: &str) -> Result<Vec<String>> {
        let started = Instant::now();
        let result = self.stream_open_inner(query).await;
        self.server.log(self.id, query, started, result.is_ok());
        result
    }

    async fn stream_next(&mut self) -> Result<Option<Row>> {
        self.check_alive()?;
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| ProxyError::server(2014, "HY000", "Commands out of sync"))?;
        if let Some((limit, err)) = &cursor.fail_after {
            if cursor.sent >= *limit {
                return Err(err.clone());
            }
        }
        let row = cursor.rows.pop_front();
        if row.is_some() {
            cursor.sent += 1;
            self.server.lock().streamed += 1;
        }
        Ok(row)
    }

    async fn stream_close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cursor = None;
            self.server.disconnect(self.id);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.server.disconnect(self.id);
        }
    }
}

/// Driver resolving addresses to [`MemoryServer`]s, created on first use.
#[derive(Default)]
pub struct MemoryDriver {
    servers: Mutex<HashMap<String, MemoryServer>>,
}

impl MemoryDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The server listening on `address`.
    pub fn server(&self, address: &str) -> MemoryServer {
        let mut servers = match self.servers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        servers
            .entry(address.to_string())
            .or_insert_with(|| MemoryServer::new(address))
            .clone()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn dial(&self, config: &BackendConfig, address: &str) -> Result<Box<dyn Session>> {
        let server = self.server(address);
        if let Some(fault) = server.take_fault("CONNECT") {
            match fault {
                Fault::Error(err) => return Err(err),
                Fault::Delay(delay) => sleep(delay).await,
                Fault::ErrorAfterRows(..) => {}
            }
        }
        let session = server.open_session(&config.database)?;
        Ok(Box::new(session))
    }
}
