use super::ElapsedColor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct ProbeStatus {
    xid: String,
    state: String,
    xa_state: String,
}

struct TxnProbe {
    started_at: DateTime<Utc>,
    started: Instant,
    status: Mutex<ProbeStatus>,
}

/// Snapshot row of a live transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TxnDetail {
    pub id: u64,
    pub xid: String,
    pub state: String,
    pub xa_state: String,
    pub start: String,
    pub duration_ms: u64,
    pub color: ElapsedColor,
}

type ProbeMap = Arc<Mutex<HashMap<u64, Arc<TxnProbe>>>>;

/// Tracks transactions between creation and finish/abort.
#[derive(Default)]
pub struct TxnTracker {
    live: ProbeMap,
}

impl TxnTracker {
    pub fn register(&self, id: u64, state: &str, xa_state: &str) -> TxnRegistration {
        let probe = Arc::new(TxnProbe {
            started_at: Utc::now(),
            started: Instant::now(),
            status: Mutex::new(ProbeStatus {
                xid: String::new(),
                state: state.to_string(),
                xa_state: xa_state.to_string(),
            }),
        });
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, Arc::clone(&probe));
        }
        TxnRegistration {
            id,
            probe,
            live: Arc::clone(&self.live),
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest transaction first.
    pub fn snapshot(&self) -> Vec<TxnDetail> {
        let Ok(live) = self.live.lock() else {
            return Vec::new();
        };
        let mut details: Vec<TxnDetail> = live
            .iter()
            .filter_map(|(id, probe)| {
                let status = probe.status.lock().ok()?;
                let elapsed = probe.started.elapsed();
                Some(TxnDetail {
                    id: *id,
                    xid: status.xid.clone(),
                    state: status.state.clone(),
                    xa_state: status.xa_state.clone(),
                    start: probe.started_at.to_rfc3339(),
                    duration_ms: elapsed.as_millis() as u64,
                    color: ElapsedColor::from_elapsed(elapsed),
                })
            })
            .collect();
        details.sort_by_key(|d| d.id);
        details
    }
}

/// Live entry of one transaction; removed from the tracker on drop.
pub struct TxnRegistration {
    id: u64,
    probe: Arc<TxnProbe>,
    live: ProbeMap,
}

impl TxnRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_xid(&self, xid: &str) {
        if let Ok(mut status) = self.probe.status.lock() {
            status.xid = xid.to_string();
        }
    }

    pub fn set_state(&self, state: &str) {
        if let Ok(mut status) = self.probe.status.lock() {
            status.state = state.to_string();
        }
    }

    pub fn set_xa_state(&self, xa_state: &str) {
        if let Ok(mut status) = self.probe.status.lock() {
            status.xa_state = xa_state.to_string();
        }
    }
}

impl Drop for TxnRegistration {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&self.id);
        }
    }
}
