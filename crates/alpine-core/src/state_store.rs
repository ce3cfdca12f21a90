//! State Store (Section 4.1): atomic read/write/delete of the agent state file.
//!
//! The file is the single source of truth; this module holds no in-memory
//! state of its own between calls.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::types::{TaskState, TaskStatus};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state file not found")]
    NotFound,

    #[error("state file corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Read and parse the state file at `path`.
///
/// Distinguishes absence from corruption so callers can branch: the Engine
/// treats `Corrupt` as fatal, the Monitor treats it as "retry on next tick".
pub fn load(path: &Path) -> Result<TaskState, StateStoreError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StateStoreError::NotFound),
        Err(e) => return Err(StateStoreError::Io(e)),
    };

    let state: TaskState = serde_json::from_str(&content)
        .map_err(|e| StateStoreError::Corrupt(format!("invalid json: {e}")))?;

    if state.status == TaskStatus::Running && state.next_step_prompt.is_empty() {
        return Err(StateStoreError::Corrupt(
            "next_step_prompt must be non-empty while status=running".to_string(),
        ));
    }
    if state.status == TaskStatus::Completed && !state.next_step_prompt.is_empty() {
        return Err(StateStoreError::Corrupt(
            "next_step_prompt must be empty when status=completed".to_string(),
        ));
    }

    Ok(state)
}

/// Write `state` atomically: mkdir parent (0755), write to a sibling temp
/// file (0644), rename over the target. Rename is same-filesystem so the
/// reader never observes a partial write.
pub fn save(path: &Path, state: &TaskState) -> Result<(), StateStoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StateStoreError::Io(io::Error::other("state path has no parent")))?;
    fs::create_dir_all(parent)?;
    set_permissions(parent, 0o755)?;

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| StateStoreError::Io(io::Error::other(e.to_string())))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string())
    ));
    fs::write(&tmp_path, json)?;
    set_permissions(&tmp_path, 0o644)?;
    fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Unlink the state file if present. Absence is not an error.
pub fn delete(path: &Path) -> Result<(), StateStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateStoreError::Io(e)),
    }
}

/// Structural comparison over the three state fields.
pub fn equal(a: &TaskState, b: &TaskState) -> bool {
    a.equal(b)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), StateStoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), StateStoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn running(prompt: &str) -> TaskState {
        TaskState {
            current_step_description: "doing a thing".to_string(),
            next_step_prompt: prompt.to_string(),
            status: TaskStatus::Running,
        }
    }

    fn completed() -> TaskState {
        TaskState {
            current_step_description: "done".to_string(),
            next_step_prompt: String::new(),
            status: TaskStatus::Completed,
        }
    }

    #[test]
    fn round_trip_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        let state = running("next step");
        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.equal(&state));
    }

    #[test]
    fn round_trip_completed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        let state = completed();
        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.equal(&state));
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound));
    }

    #[test]
    fn load_invalid_json_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, StateStoreError::Corrupt(_)));
    }

    #[test]
    fn load_running_without_prompt_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"current_step_description":"x","next_step_prompt":"","status":"running"}"#,
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, StateStoreError::Corrupt(_)));
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        delete(&path).unwrap();
    }

    #[test]
    fn delete_present_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_state/agent_state.json");
        save(&path, &running("x")).unwrap();
        assert!(path.exists());
        delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn equal_compares_all_fields() {
        let a = running("x");
        let mut b = running("x");
        assert!(equal(&a, &b));
        b.current_step_description = "different".to_string();
        assert!(!equal(&a, &b));
    }
}
