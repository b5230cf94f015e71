use super::ElapsedColor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Query text beyond this many bytes is cut off in snapshots.
pub const MAX_QUERY_TEXT_BYTES: usize = 256;

struct QueryEntry {
    conn_id: u64,
    backend: String,
    query: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Snapshot row of an in-flight backend query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryDetail {
    pub id: u64,
    pub conn_id: u64,
    pub backend: String,
    pub query: String,
    pub start: String,
    pub duration_ms: u64,
    pub color: ElapsedColor,
}

/// Tracks backend queries while they run.
#[derive(Default)]
pub struct QueryTracker {
    next_id: AtomicU64,
    live: Arc<Mutex<HashMap<u64, QueryEntry>>>,
}

impl QueryTracker {
    /// Registers a query; it disappears from snapshots when the returned
    /// registration is dropped.
    pub fn register(&self, conn_id: u64, backend: &str, query: &str) -> QueryRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = QueryEntry {
            conn_id,
            backend: backend.to_string(),
            query: truncate_query(query),
            started_at: Utc::now(),
            started: Instant::now(),
        };
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, entry);
        }
        QueryRegistration {
            id,
            live: Arc::clone(&self.live),
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Longest-running first.
    pub fn snapshot(&self) -> Vec<QueryDetail> {
        let Ok(live) = self.live.lock() else {
            return Vec::new();
        };
        let mut details: Vec<QueryDetail> = live
            .iter()
            .map(|(id, entry)| {
                let elapsed = entry.started.elapsed();
                QueryDetail {
                    id: *id,
                    conn_id: entry.conn_id,
                    backend: entry.backend.clone(),
                    query: entry.query.clone(),
                    start: entry.started_at.to_rfc3339(),
                    duration_ms: elapsed.as_millis() as u64,
                    color: ElapsedColor::from_elapsed(elapsed),
                }
            })
            .collect();
        details.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms).then(a.id.cmp(&b.id)));
        details
    }
}

pub struct QueryRegistration {
    id: u64,
    live: Arc<Mutex<HashMap<u64, QueryEntry>>>,
}

impl Drop for QueryRegistration {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&self.id);
        }
    }
}

fn truncate_query(query: &str) -> String {
    if query.len() <= MAX_QUERY_TEXT_BYTES {
        return query.to_string();
    }
    let mut end = MAX_QUERY_TEXT_BYTES;
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    query[..end].to_string()
}
