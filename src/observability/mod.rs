//! In-process views of what the execution layer is doing.
//!
//! One [`Observability`] context is created by the registry and handed to
//! every pool, connection and transaction it builds; nothing here is a
//! process-wide global.

mod counters;
mod queryz;
mod txnz;

pub use counters::Counters;
pub use queryz::{MAX_QUERY_TEXT_BYTES, QueryDetail, QueryRegistration, QueryTracker};
pub use txnz::{TxnDetail, TxnRegistration, TxnTracker};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Elapsed-time bucket shown next to queries and transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElapsedColor {
    Low,
    Medium,
    High,
}

impl ElapsedColor {
    pub fn from_elapsed(elapsed: Duration) -> Self {
        if elapsed < Duration::from_millis(100) {
            ElapsedColor::Low
        } else if elapsed < Duration::from_secs(1) {
            ElapsedColor::Medium
        } else {
            ElapsedColor::High
        }
    }
}

#[derive(Default)]
pub struct Observability {
    queries: QueryTracker,
    txns: TxnTracker,
    counters: Counters,
}

impl Observability {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queries(&self) -> &QueryTracker {
        &self.queries
    }

    pub fn txns(&self) -> &TxnTracker {
        &self.txns
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}
