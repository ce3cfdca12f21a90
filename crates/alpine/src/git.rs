//! Thin wrapper over the `git` CLI for worktree lifecycle management.
//!
//! Shells out rather than linking a git library, matching how the rest of
//! the orchestrator treats git: a side effect, not a dependency to embed.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git working tree: {0}")]
    NotARepo(String),
    #[error("git command failed: {command}: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        // If the caller drops this future on cancellation (worktree::create
        // / cleanup select against a cancellation token), make sure the
        // child doesn't outlive it as an orphan.
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Validate that `dir` is inside a git working tree.
pub async fn is_working_tree(dir: &Path) -> Result<bool, GitError> {
    match run_git(dir, &["rev-parse", "--is-inside-work-tree"]).await {
        Ok(out) => Ok(out == "true"),
        Err(GitError::CommandFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn branch_exists(dir: &Path, branch: &str) -> Result<bool, GitError> {
    let refname = format!("refs/heads/{branch}");
    match run_git(dir, &["show-ref", "--verify", "--quiet", &refname]).await {
        Ok(_) => Ok(true),
        Err(GitError::CommandFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// `git worktree add -b <branch> <path> <base_branch>`.
pub async fn worktree_add(
    parent_repo: &Path,
    path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<(), GitError> {
    run_git(
        parent_repo,
        &[
            "worktree",
            "add",
            "-b",
            branch,
            &path.to_string_lossy(),
            base_branch,
        ],
    )
    .await?;
    Ok(())
}

/// `git worktree remove [--force] <path>`.
pub async fn worktree_remove(parent_repo: &Path, path: &Path, force: bool) -> Result<(), GitError> {
    let path_str = path.to_string_lossy().to_string();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path_str);
    run_git(parent_repo, &args).await?;
    Ok(())
}

/// `git branch -D <branch>`.
pub async fn branch_delete(parent_repo: &Path, branch: &str) -> Result<(), GitError> {
    run_git(parent_repo, &["branch", "-D", branch]).await?;
    Ok(())
}
