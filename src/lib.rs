// ============================================================================
// shardxa: backend execution layer of a sharding SQL proxy
// ============================================================================
//
// Per-backend connection pools, a fan-out transaction executor with an XA
// two-phase commit coordinator, and a disk-backed journal that finishes
// second phases that did not reach every backend.
//
// ============================================================================

pub mod config;
pub mod connection;
pub mod core;
pub mod observability;
pub mod recovery;
pub mod registry;
pub mod result;
pub mod storage;
pub mod transaction;

pub use config::{ProxyConfig, XaCheckConfig};
pub use connection::config::{BackendConfig, BackendRole};
pub use connection::memory::{Fault, MemoryDriver, MemoryServer};
pub use connection::{BackendConnection, ConnectionPool, Driver, PoolStats, Session};
pub use core::{InterruptReason, ProxyError, Result, Row, Value};
pub use observability::Observability;
pub use recovery::{XaCheck, XaCommitErr, XaRecoveryState};
pub use registry::{BackendPools, BackendRegistry};
pub use result::QueryResult;
pub use transaction::{
    BackupTxn, FanoutMode, QueryTuple, Request, TransactionManager, Txn, TxnMode, TxnState,
    XaState,
};
