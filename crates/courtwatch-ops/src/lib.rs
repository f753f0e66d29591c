//! Operational helpers: logging, check history, atomic persistence, shutdown.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use courtwatch_types::{config::OpsConfig, history::CheckCycleResult, CourtwatchError, Result};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

pub fn ops_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Ops(message.into())
}

pub fn ensure_data_dir(path: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(path);
    fs::create_dir_all(&dir)
        .map_err(|err| CourtwatchError::Storage(format!("failed to create data dir: {err}")))?;
    info!("Data directory ready at {:?}", dir);
    Ok(dir)
}

/// Replaces `path` with `contents` via a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| CourtwatchError::Storage(format!("not a file path: {}", path.display())))?;
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&temp, contents).with_context(|| format!("failed to write {}", temp.display()))?;
    fs::rename(&temp, path)
        .with_context(|| format!("failed to move {} into place", temp.display()))?;
    Ok(())
}

/// Bounded log of recent cycle outcomes, most recent last.
#[derive(Clone)]
pub struct CheckHistory {
    path: PathBuf,
    capacity: usize,
    entries: Arc<Mutex<VecDeque<CheckCycleResult>>>,
}

impl CheckHistory {
    /// Opens the history at `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut entries: VecDeque<CheckCycleResult> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("Ignoring unreadable check history {:?}: {err}", path);
                VecDeque::new()
            }),
            Err(_) => VecDeque::new(),
        };
        while entries.len() > capacity {
            entries.pop_front();
        }
        Self {
            path,
            capacity,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub async fn record(&self, result: CheckCycleResult) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.push_back(result);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        let doc = serde_json::to_vec_pretty(&*entries)
            .map_err(|err| ops_error(format!("failed to encode check history: {err}")))?;
        write_atomic(&self.path, &doc)
    }

    pub async fn snapshot(&self) -> Vec<CheckCycleResult> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn last(&self) -> Option<CheckCycleResult> {
        self.entries.lock().await.back().cloned()
    }
}

/// Cooperative stop signal shared by the scheduler and its suspension points.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        if !self.is_triggered() {
            info!("Shutdown requested");
        }
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("courtwatch-ops-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn history_is_bounded_and_persisted() {
        let dir = temp_dir();
        let path = dir.join("check_history.json");
        let history = CheckHistory::load(&path, 3);
        for count in 0..5 {
            let mut result = CheckCycleResult::started(Utc::now());
            result.success = true;
            result.slots_found = count;
            history.record(result).await.expect("record");
        }
        let kept: Vec<usize> = history.snapshot().await.iter().map(|r| r.slots_found).collect();
        assert_eq!(kept, vec![2, 3, 4]);

        let reopened = CheckHistory::load(&path, 3);
        assert_eq!(reopened.last().await.map(|r| r.slots_found), Some(4));
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn corrupt_history_starts_empty() {
        let dir = temp_dir();
        let path = dir.join("check_history.json");
        write_atomic(&path, b"{not json").expect("write");
        let history = CheckHistory::load(&path, 10);
        assert!(history.snapshot().await.is_empty());
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = temp_dir();
        let path = dir.join("ledger.json");
        write_atomic(&path, b"{}").expect("first write");
        write_atomic(&path, b"{\"a\":1}").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "{\"a\":1}");
        assert!(!dir.join(".ledger.json.tmp").exists());
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter woke")
            .expect("join");
        assert!(shutdown.is_triggered());
    }
}
