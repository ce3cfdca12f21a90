//! In-memory registry of server-mode `Run`s (Section 3, Section 10.3).
//!
//! There is no database: a `Run`'s existence does not survive a process
//! restart, by design (Section 1 Non-goals). Terminal runs are swept from
//! the registry lazily after a retention window rather than on a
//! background timer, to avoid a long-lived task for best-effort cleanup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use alpine_core::types::{RunId, RunSnapshot, RunStatus};

/// How long a terminal run's snapshot stays queryable after it finishes.
pub const RETENTION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

struct RunEntry {
    snapshot: RunSnapshot,
    cancel: CancellationToken,
}

pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending run and return its cancellation token.
    pub fn insert(&self, run_id: RunId, task: String, work_dir: std::path::PathBuf) -> CancellationToken {
        let cancel = CancellationToken::new();
        let snapshot = RunSnapshot {
            run_id,
            task,
            work_dir,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.runs.lock().unwrap().insert(
            run_id,
            RunEntry {
                snapshot,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn set_status(&self, run_id: RunId, status: RunStatus) {
        if let Some(entry) = self.runs.lock().unwrap().get_mut(&run_id) {
            entry.snapshot.status = status;
        }
    }

    pub fn finish(&self, run_id: RunId, status: RunStatus, error: Option<String>) {
        self.sweep();
        if let Some(entry) = self.runs.lock().unwrap().get_mut(&run_id) {
            entry.snapshot.status = status;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.snapshot.error = error;
        }
    }

    pub fn get(&self, run_id: RunId) -> Option<RunSnapshot> {
        self.sweep();
        self.runs
            .lock()
            .unwrap()
            .get(&run_id)
            .map(|entry| entry.snapshot.clone())
    }

    pub fn cancel(&self, run_id: RunId) -> bool {
        if let Some(entry) = self.runs.lock().unwrap().get(&run_id) {
            entry.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.runs.lock().unwrap().values() {
            entry.cancel.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter(|e| matches!(e.snapshot.status, RunStatus::Pending | RunStatus::Running))
            .count()
    }

    /// Remove terminal runs whose retention window has elapsed.
    fn sweep(&self) {
        let now = Utc::now();
        self.runs.lock().unwrap().retain(|_, entry| {
            match entry.snapshot.finished_at {
                Some(finished_at) => {
                    let age = now.signed_duration_since(finished_at);
                    age.to_std().unwrap_or_default() < RETENTION_WINDOW
                }
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = RunRegistry::new();
        let run_id = RunId::new();
        registry.insert(run_id, "do it".to_string(), PathBuf::from("/tmp/x"));
        let snapshot = registry.get(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Pending);
        assert_eq!(snapshot.task, "do it");
    }

    #[test]
    fn finish_sets_terminal_status_and_error() {
        let registry = RunRegistry::new();
        let run_id = RunId::new();
        registry.insert(run_id, "t".to_string(), PathBuf::from("/tmp/x"));
        registry.finish(run_id, RunStatus::Failed, Some("boom".to_string()));
        let snapshot = registry.get(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert!(snapshot.finished_at.is_some());
    }

    #[test]
    fn cancel_unknown_run_returns_false() {
        let registry = RunRegistry::new();
        assert!(!registry.cancel(RunId::new()));
    }

    #[test]
    fn active_count_excludes_terminal_runs() {
        let registry = RunRegistry::new();
        let a = RunId::new();
        let b = RunId::new();
        registry.insert(a, "a".to_string(), PathBuf::from("/tmp/a"));
        registry.insert(b, "b".to_string(), PathBuf::from("/tmp/b"));
        registry.finish(a, RunStatus::Completed, None);
        assert_eq!(registry.active_count(), 1);
    }
}
