// ============================================================================
// Transaction State Machines
// ============================================================================
//
// A transaction carries two independent enums: the lifecycle `TxnState` and
// the XA sub-protocol `XaState`. They advance separately; XA phases move to
// their `*Finished` marker whether the phase succeeded or not.
//
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of a transaction
///
/// ```text
/// Live -> Beginning -> ExecutingTwoPc | ExecutingNormal
///      -> Committing | Rollbacking -> Finishing | Aborting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Live,
    Beginning,
    ExecutingTwoPc,
    ExecutingNormal,
    Committing,
    Rollbacking,
    Finishing,
    Aborting,
}

impl TxnState {
    /// Finish or abort already happened
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Finishing | TxnState::Aborting)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxnState::Live => "LIVE",
            TxnState::Beginning => "BEGINNING",
            TxnState::ExecutingTwoPc => "EXECUTING_TWOPC",
            TxnState::ExecutingNormal => "EXECUTING_NORMAL",
            TxnState::Committing => "COMMITTING",
            TxnState::Rollbacking => "ROLLBACKING",
            TxnState::Finishing => "FINISHING",
            TxnState::Aborting => "ABORTING",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// XA sub-protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaState {
    None,
    Start,
    StartFinished,
    End,
    EndFinished,
    Prepare,
    PrepareFinished,
    Commit,
    CommitFinished,
    Rollback,
    RollbackFinished,
}

impl XaState {
    pub fn name(&self) -> &'static str {
        match self {
            XaState::None => "XA_NONE",
            XaState::Start => "XA_START",
            XaState::StartFinished => "XA_START_FINISHED",
            XaState::End => "XA_END",
            XaState::EndFinished => "XA_END_FINISHED",
            XaState::Prepare => "XA_PREPARE",
            XaState::PrepareFinished => "XA_PREPARE_FINISHED",
            XaState::Commit => "XA_COMMIT",
            XaState::CommitFinished => "XA_COMMIT_FINISHED",
            XaState::Rollback => "XA_ROLLBACK",
            XaState::RollbackFinished => "XA_ROLLBACK_FINISHED",
        }
    }
}

impl fmt::Display for XaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-wide monotonically increasing transaction ids
#[derive(Debug)]
pub struct TxnIdGenerator {
    next: AtomicU64,
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl TxnIdGenerator {
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
