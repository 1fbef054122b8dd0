//! Git plumbing: repository context collection and worktree provisioning.
//!
//! The Resource Allocator only computes a worktree's target path; the
//! Phase Runner's Plan phase is what actually materializes it, via
//! [`worktree_add`], and the Cleanup phase tears it down via
//! [`worktree_remove`]. Every function shells out to `git` (overridable
//! via `ADW_GIT_BIN` so tests can substitute a fake binary) rather than
//! linking a git library, matching how this pipeline treats every other
//! external tool.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

/// A snapshot of the enclosing repository's identity, attached to run
/// state for provenance (which commit/branch/tag a run was triggered
/// from).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub dirty: Option<bool>,
}

/// Collect git context for the current repository. Returns `None` if the
/// current directory is not inside a git repository.
pub fn collect_git_context() -> Option<GitContext> {
    let repo_root = std::env::current_dir().ok()?;

    let git_dir_check = Command::new(git_program())
        .arg("rev-parse")
        .arg("--git-dir")
        .current_dir(&repo_root)
        .output()
        .ok()?;

    if !git_dir_check.status.success() {
        return None;
    }

    Some(GitContext {
        commit: get_git_commit(&repo_root),
        branch: get_git_branch(&repo_root),
        tag: get_git_tag(&repo_root),
        dirty: get_git_dirty_status(&repo_root),
    })
}

fn get_git_commit(repo_root: &Path) -> Option<String> {
    let output = Command::new(git_program())
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(repo_root)
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

fn get_git_branch(repo_root: &Path) -> Option<String> {
    let output = Command::new(git_program())
        .arg("rev-parse")
        .arg("--abbrev-ref")
        .arg("HEAD")
        .current_dir(repo_root)
        .output()
        .ok()?;

    if output.status.success() {
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if branch == "HEAD" { None } else { Some(branch) }
    } else {
        None
    }
}

fn get_git_tag(repo_root: &Path) -> Option<String> {
    let output = Command::new(git_program())
        .arg("describe")
        .arg("--tags")
        .arg("--exact-match")
        .current_dir(repo_root)
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

fn get_git_dirty_status(repo_root: &Path) -> Option<bool> {
    let output = Command::new(git_program())
        .arg("status")
        .arg("--porcelain")
        .current_dir(repo_root)
        .output()
        .ok()?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(!stdout.trim().is_empty())
    } else {
        None
    }
}

pub fn is_git_clean(repo_root: &Path) -> Result<bool> {
    let out = Command::new(git_program())
        .arg("status")
        .arg("--porcelain")
        .current_dir(repo_root)
        .output()
        .context("failed to execute git status; is git installed?")?;

    if !out.status.success() {
        bail!(
            "git status failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().is_empty())
}

pub fn ensure_git_clean(repo_root: &Path) -> Result<()> {
    if !is_git_clean(repo_root)? {
        bail!("git working tree is not clean; commit/stash changes or use --allow-dirty");
    }
    Ok(())
}

/// Create a new worktree checked out at `branch` (created from `base_ref`
/// if it doesn't already exist) rooted at `worktree_path`. Used by the
/// Plan phase when provisioning a fresh run.
pub fn worktree_add(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_ref: &str,
) -> Result<()> {
    let out = Command::new(git_program())
        .arg("worktree")
        .arg("add")
        .arg("-b")
        .arg(branch)
        .arg(worktree_path)
        .arg(base_ref)
        .current_dir(repo_root)
        .output()
        .context("failed to execute git worktree add; is git installed?")?;

    if !out.status.success() {
        bail!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// Remove a previously-added worktree. Used by the Cleanup phase once a
/// run's resources are released. `force` matches `git worktree remove
/// --force`, needed when the worktree still has uncommitted changes the
/// run left behind.
pub fn worktree_remove(repo_root: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let mut cmd = Command::new(git_program());
    cmd.arg("worktree").arg("remove");
    if force {
        cmd.arg("--force");
    }
    cmd.arg(worktree_path).current_dir(repo_root);

    let out = cmd
        .output()
        .context("failed to execute git worktree remove; is git installed?")?;

    if !out.status.success() {
        bail!(
            "git worktree remove failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

fn git_program() -> String {
    env::var("ADW_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}
