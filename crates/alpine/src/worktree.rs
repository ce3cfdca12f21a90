//! Worktree Manager (Section 4.2): create/cleanup an isolated working tree
//! and branch for one task.

use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use alpine_core::types::Worktree;

use crate::git::{self, GitError};

const TOOL_PREFIX: &str = "alpine";
const MAX_SLUG_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0}")]
    NotAWorkingTree(String),
    #[error("worktree path already exists: {}", .0.display())]
    PathExists(PathBuf),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("cancelled")]
    Cancelled,
}

/// Collapse non-alphanumeric-or-hyphen runs to `-`, lowercase, trim, and
/// truncate to `MAX_SLUG_LEN` (Section 4.2).
pub fn slugify(task: &str) -> String {
    let mut slug = String::with_capacity(task.len());
    let mut last_was_sep = false;
    for ch in task.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if ch == '-' || ch.is_whitespace() || !ch.is_ascii() {
            if !last_was_sep && !slug.is_empty() {
                slug.push('-');
                last_was_sep = true;
            }
        } else if !last_was_sep && !slug.is_empty() {
            slug.push('-');
            last_was_sep = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    truncated.trim_matches('-').to_string()
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(u32::from(n), 16).unwrap()
        })
        .collect()
}

/// Create an isolated worktree for `task_name` under `parent_repo`, rooted
/// on `base_branch`. The path is a sibling of `parent_repo`.
pub async fn create(
    ctx: &CancellationToken,
    parent_repo: &Path,
    task_name: &str,
    base_branch: &str,
) -> Result<Worktree, WorktreeError> {
    if ctx.is_cancelled() {
        return Err(WorktreeError::Cancelled);
    }

    if !git::is_working_tree(parent_repo).await? {
        return Err(WorktreeError::NotAWorkingTree(format!(
            "{} is not a git working tree",
            parent_repo.display()
        )));
    }

    let parent_dir = parent_repo
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_slug = slugify(task_name);
    let mut slug = base_slug.clone();
    let mut branch = format!("{TOOL_PREFIX}/{slug}");
    let mut path = parent_dir.join(format!("{TOOL_PREFIX}-{slug}"));

    // Resolve collisions by appending a short random suffix and retrying.
    let mut attempts = 0;
    while path.exists() || git::branch_exists(parent_repo, &branch).await? {
        attempts += 1;
        if attempts > 20 {
            return Err(WorktreeError::PathExists(path));
        }
        slug = format!("{base_slug}-{}", random_suffix());
        branch = format!("{TOOL_PREFIX}/{slug}");
        path = parent_dir.join(format!("{TOOL_PREFIX}-{slug}"));
    }

    let create_fut = git::worktree_add(parent_repo, &path, &branch, base_branch);
    tokio::select! {
        result = create_fut => result?,
        () = ctx.cancelled() => return Err(WorktreeError::Cancelled),
    }

    Ok(Worktree {
        path,
        branch,
        parent_repo: parent_repo.to_path_buf(),
    })
}

/// Remove the worktree directory, then delete the branch. A failure to
/// delete the branch after the directory is gone is a warning, not an
/// error: the worktree is gone either way.
pub async fn cleanup(
    ctx: &CancellationToken,
    worktree: &Worktree,
) -> Result<(), WorktreeError> {
    if ctx.is_cancelled() {
        return Err(WorktreeError::Cancelled);
    }

    let remove_fut = git::worktree_remove(&worktree.parent_repo, &worktree.path, true);
    tokio::select! {
        result = remove_fut => result?,
        () = ctx.cancelled() => return Err(WorktreeError::Cancelled),
    }

    if let Err(e) = git::branch_delete(&worktree.parent_repo, &worktree.branch).await {
        warn!(branch = %worktree.branch, error = %e, "worktree removed but branch deletion failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::process::Command as TokioCommand;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            TokioCommand::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        TokioCommand::new("git")
            .args(["add", "."])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        TokioCommand::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[test]
    fn slugify_collapses_and_lowercases() {
        assert_eq!(slugify("Add Flag Parsing!!"), "add-flag-parsing");
        assert_eq!(slugify("  leading and trailing  "), "leading-and-trailing");
        assert_eq!(slugify("multi---dash"), "multi-dash");
    }

    #[test]
    fn slugify_is_idempotent() {
        let once = slugify("Implement X & Y (v2)");
        let twice = slugify(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn slugify_truncates_to_max_len() {
        let long_task = "a".repeat(200);
        let slug = slugify(&long_task);
        assert_eq!(slug.len(), MAX_SLUG_LEN);
    }

    #[tokio::test]
    async fn create_and_cleanup_round_trip() {
        let parent = tempdir().unwrap();
        init_repo(parent.path()).await;
        let ctx = CancellationToken::new();

        let worktree = create(&ctx, parent.path(), "add flag parsing", "main")
            .await
            .unwrap();
        assert!(worktree.path.exists());
        assert_eq!(worktree.branch, "alpine/add-flag-parsing");

        cleanup(&ctx, &worktree).await.unwrap();
        assert!(!worktree.path.exists());
    }

    #[tokio::test]
    async fn create_fails_when_not_a_repo() {
        let parent = tempdir().unwrap();
        let ctx = CancellationToken::new();
        let err = create(&ctx, parent.path(), "whatever", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::NotAWorkingTree(_)));
    }

    #[tokio::test]
    async fn create_resolves_collision_with_suffix() {
        let parent = tempdir().unwrap();
        init_repo(parent.path()).await;
        let ctx = CancellationToken::new();

        let first = create(&ctx, parent.path(), "same task", "main")
            .await
            .unwrap();
        let second = create(&ctx, parent.path(), "same task", "main")
            .await
            .unwrap();
        assert_ne!(first.path, second.path);
        assert_ne!(first.branch, second.branch);

        cleanup(&ctx, &first).await.unwrap();
        cleanup(&ctx, &second).await.unwrap();
    }
}
