//! Durable resolution of two-phase commits whose second phase did not
//! reach every backend.

pub mod journal;
pub mod xacheck;

use crate::connection::ConnectionPool;

pub use journal::{XA_CHECK_FILE, XaCommitErr, XaJournal, XaRecoveryState};
pub use xacheck::XaCheck;

/// The backends recovery must consult; re-read on every tick so that
/// backends added or removed at runtime are picked up.
pub trait BackendSource: Send + Sync {
    fn pools(&self) -> Vec<ConnectionPool>;
}

impl BackendSource for Vec<ConnectionPool> {
    fn pools(&self) -> Vec<ConnectionPool> {
        self.clone()
    }
}
