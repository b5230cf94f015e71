use std::collections::BTreeMap;
use std::sync::Mutex;

/// Named monotonically increasing counters.
#[derive(Default)]
pub struct Counters {
    values: Mutex<BTreeMap<String, u64>>,
}

impl Counters {
    pub fn add(&self, name: &str, delta: u64) {
        if let Ok(mut values) = self.values.lock() {
            *values.entry(name.to_string()).or_insert(0) += delta;
        }
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values
            .lock()
            .map(|values| values.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}
