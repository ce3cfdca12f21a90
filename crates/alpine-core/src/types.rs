//! Core data types shared between the engine and the HTTP control plane.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier. A UUID v4, per the run-identity contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of the task state file, and (distinctly) of a server-mode `Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
}

/// The agent state file contract (Section 3, Section 6).
///
/// Rewritten atomically by the assistant subprocess; read-only from the
/// engine's perspective except for the final `delete` on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub current_step_description: String,
    pub next_step_prompt: String,
    pub status: TaskStatus,
}

impl TaskState {
    /// Structural equality over the three fields, per the State Store `equal` operation.
    pub fn equal(&self, other: &Self) -> bool {
        self == other
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Status of a server-mode `Run`. Distinct from `TaskStatus`: a run can be
/// `Pending` before the engine has even loaded the state file once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Server-mode run bookkeeping. Owned exclusively by the engine task that
/// executes it; status queries and SSE subscribers only read it through the
/// registry's mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub task: String,
    pub work_dir: PathBuf,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// An isolated working tree and the branch created for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub parent_repo: PathBuf,
}
