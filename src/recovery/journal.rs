use crate::core::{ProxyError, Result};
use crate::storage::persistence::{read_json, write_json_atomic};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const XA_CHECK_FILE: &str = "xacheck.json";

/// The decided outcome of a two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XaRecoveryState {
    Commit,
    Rollback,
}

impl XaRecoveryState {
    /// The statement that applies this outcome to a prepared branch.
    pub fn statement(&self, xid: &str) -> String {
        match self {
            XaRecoveryState::Commit => format!("XA COMMIT '{}'", xid),
            XaRecoveryState::Rollback => format!("XA ROLLBACK '{}'", xid),
        }
    }
}

impl fmt::Display for XaRecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XaRecoveryState::Commit => write!(f, "commit"),
            XaRecoveryState::Rollback => write!(f, "rollback"),
        }
    }
}

/// A decided but unconfirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XaCommitErr {
    /// `YYYYMMDDHHMMSS`
    pub time: String,
    #[serde(rename = "xaid")]
    pub xid: String,
    pub state: XaRecoveryState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    #[serde(rename = "xacommit-errs", default)]
    entries: Vec<XaCommitErr>,
}

/// Outstanding recovery entries, mirrored to disk on every change.
#[derive(Debug)]
pub struct XaJournal {
    path: PathBuf,
    entries: Vec<XaCommitErr>,
}

impl XaJournal {
    /// Loads `dir/xacheck.json`, creating an empty journal if it is missing.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(XA_CHECK_FILE);
        match read_json::<JournalFile>(&path)? {
            Some(file) => Ok(Self {
                path,
                entries: file.entries,
            }),
            None => {
                let journal = Self {
                    path,
                    entries: Vec::new(),
                };
                journal.flush()?;
                Ok(journal)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[XaCommitErr] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, xid: &str) -> bool {
        self.entries.iter().any(|e| e.xid == xid)
    }

    /// Records a decision. An xid may only be outstanding once.
    pub fn add(&mut self, xid: &str, state: XaRecoveryState) -> Result<()> {
        if self.contains(xid) {
            return Err(ProxyError::DuplicateXid(xid.to_string()));
        }
        self.entries.push(XaCommitErr {
            time: Local::now().format("%Y%m%d%H%M%S").to_string(),
            xid: xid.to_string(),
            state,
        });
        if let Err(err) = self.flush() {
            self.entries.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Drops a resolved entry; returns whether it was present.
    ///
    /// If the file cannot be rewritten the entry is kept, so the next tick
    /// resolves it again.
    pub fn remove(&mut self, xid: &str) -> Result<bool> {
        let Some(index) = self.entries.iter().position(|e| e.xid == xid) else {
            return Ok(false);
        };
        let entry = self.entries.remove(index);
        if let Err(err) = self.flush() {
            self.entries.insert(index, entry);
            return Err(err);
        }
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        write_json_atomic(
            &self.path,
            &JournalFile {
                entries: self.entries.clone(),
            },
        )
    }
}
