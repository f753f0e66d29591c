use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use courtwatch_ops::write_atomic;
use courtwatch_types::{slot::SlotKey, CourtwatchError, Result};
use tracing::{debug, warn};

/// Persisted record of which slots have already been announced.
///
/// Stored as a flat JSON object of `SlotKey` string to first-notified time.
#[derive(Debug, Clone)]
pub struct NotificationLedger {
    path: PathBuf,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl NotificationLedger {
    /// Reads the ledger at `path`. Missing or corrupt files yield an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("Starting with an empty ledger, {:?} is unreadable: {err}", path);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notified_at(&self, key: &SlotKey) -> Option<DateTime<Utc>> {
        self.entries.get(&key.to_string()).copied()
    }

    /// True when `key` was announced within the retention window.
    pub fn contains_fresh(&self, key: &SlotKey, now: DateTime<Utc>, retention: Duration) -> bool {
        self.notified_at(key)
            .map(|at| now - at <= retention)
            .unwrap_or(false)
    }

    pub fn insert(&mut self, key: &SlotKey, at: DateTime<Utc>) {
        self.entries.insert(key.to_string(), at);
    }

    /// Drops entries older than the retention window and returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, at| now - *at <= retention);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Pruned {removed} ledger entries");
        }
        removed
    }

    pub fn save(&self) -> Result<()> {
        let doc = serde_json::to_vec_pretty(&self.entries).map_err(|err| {
            CourtwatchError::Storage(format!("failed to encode notification ledger: {err}"))
        })?;
        write_atomic(&self.path, &doc)
    }
}
