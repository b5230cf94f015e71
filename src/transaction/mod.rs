// ============================================================================
// Transaction Module
// ============================================================================
//
// Cross-backend transactions: a fan-out executor with an XA two-phase
// commit coordinator (`Txn`), a plain single-backend variant for the backup
// node (`BackupTxn`), and the manager that issues both and owns the commit
// lock and the recovery journal.
//
// ============================================================================

pub mod backup;
pub mod manager;
pub mod request;
pub mod state;
pub mod txn;

pub use backup::BackupTxn;
pub use manager::TransactionManager;
pub use request::{FanoutMode, QueryTuple, Request, TxnMode};
pub use state::{TxnState, XaState};
pub use txn::{STREAM_CHANNEL_CAPACITY, Txn};
