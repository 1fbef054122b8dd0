//! Validator (C4).
//!
//! Checks a phase transition's legality and a phase's Requires/Produces
//! contract before the Phase Runner is allowed to execute it. The
//! legal-transitions-per-current-state table and the dependency-satisfied
//! check follow the DAG-validation shape used by the pack's orchestrator
//! mod (`validate_transition`/`check_dependencies_satisfied`), adapted from
//! a linear phase chain to the fixed ten-phase pipeline plus a queue
//! `status` axis instead of a single `current_phase` field.

use std::path::{Path, PathBuf};

use adw_types::{PhaseName, QueueStatus, RunStateDocument};

use crate::error::ValidatorError;
use crate::queue::is_legal_transition;

/// Checks that `attempted` may run given `current`, the highest phase
/// number already completed for this run (`0` if none has completed yet).
pub fn validate_phase_order(current: u8, attempted: u8) -> Result<(), ValidatorError> {
    if attempted > current + 1 {
        return Err(ValidatorError::OutOfOrder { current, attempted });
    }
    Ok(())
}

/// Checks that a queue status transition is one of the permitted DAG edges.
pub fn validate_status_transition(
    from: QueueStatus,
    to: QueueStatus,
) -> Result<(), ValidatorError> {
    if !is_legal_transition(from, to) {
        return Err(ValidatorError::IllegalTransition { from, to });
    }
    Ok(())
}

/// A phase's Requires/Produces contract, checked against the run's state
/// document and its worktree before the phase is allowed to start
/// (Requires) and after it finishes (Produces).
pub struct PhaseContract {
    pub phase: PhaseName,
}

impl PhaseContract {
    pub fn for_phase(phase: PhaseName) -> Self {
        Self { phase }
    }

    /// What this phase needs already present in `state` to start.
    pub fn check_requires(
        &self,
        state: &RunStateDocument,
        worktree: &Path,
    ) -> Result<(), ValidatorError> {
        match self.phase {
            PhaseName::Plan => Ok(()),
            PhaseName::Validate => {
                require_some(state.worktree_path.is_some(), "worktree_path")?;
                require_path_field_exists(&state.plan_file_path, "plan_file_path")
            }
            PhaseName::Build => {
                require_path_field_exists(&state.plan_file_path, "plan_file_path")?;
                require_some(!state.baseline_errors.is_empty(), "baseline_errors")?;
                require_path_exists(worktree, "worktree")
            }
            PhaseName::Lint => require_path_exists(worktree, "worktree"),
            PhaseName::Test => require_path_exists(worktree, "worktree"),
            PhaseName::Review => require_some(state.branch_name.is_some(), "branch_name"),
            PhaseName::Document => {
                require_path_field_exists(&state.plan_file_path, "plan_file_path")?;
                require_path_exists(worktree, "worktree")
            }
            PhaseName::Ship => {
                require_some(state.pr_url.is_some(), "pr_url")?;
                require_some(state.branch_name.is_some(), "branch_name")
            }
            PhaseName::Cleanup => require_path_exists(worktree, "worktree"),
            PhaseName::Verify => require_some(state.merge_commit_sha.is_some(), "merge_commit_sha"),
        }
    }

    /// What this phase must have written into `state` for its completion to
    /// be accepted.
    pub fn check_produces(&self, state: &RunStateDocument) -> Result<(), ValidatorError> {
        match self.phase {
            PhaseName::Plan => {
                require_some(state.plan_file_path.is_some(), "plan_file_path")?;
                require_some(state.branch_name.is_some(), "branch_name")?;
                require_some(state.worktree_path.is_some(), "worktree_path")
            }
            PhaseName::Validate => require_some(!state.baseline_errors.is_empty(), "baseline_errors"),
            PhaseName::Build => {
                require_some(!state.external_build_results.is_empty(), "build_results")
            }
            PhaseName::Lint => require_some(!state.lint_results.is_empty(), "lint_results"),
            PhaseName::Test => require_some(!state.test_results.is_empty(), "test_results"),
            PhaseName::Review => {
                require_some(state.pr_url.is_some(), "pr_url")?;
                require_some(!state.review_results.is_empty(), "review_results")
            }
            PhaseName::Document => require_some(!state.doc_files_paths.is_empty(), "doc_files_paths"),
            PhaseName::Ship => {
                require_some(state.shipped_at.is_some(), "shipped_at")?;
                require_some(state.merge_commit_sha.is_some(), "merge_commit_sha")
            }
            PhaseName::Cleanup => require_some(state.cleanup_summary.is_some(), "cleanup_summary"),
            PhaseName::Verify => {
                require_some(!state.verification_results.is_empty(), "verification_results")
            }
        }
    }
}

/// Backend/frontend ports must land within the fixed pools before a run is
/// allowed to proceed past Build.
pub fn validate_port_in_range(port: u16, range: std::ops::RangeInclusive<u16>) -> Result<(), ValidatorError> {
    if !range.contains(&port) {
        return Err(ValidatorError::ContractBreach(format!(
            "port {port} outside allowed range {}..={}",
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

fn require_some(present: bool, field: &str) -> Result<(), ValidatorError> {
    if present {
        Ok(())
    } else {
        Err(ValidatorError::ContractBreach(format!(
            "required field `{field}` missing"
        )))
    }
}

fn require_path_exists(path: &Path, label: &str) -> Result<(), ValidatorError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ValidatorError::PathNotFound(format!(
            "{label} path {} does not exist",
            path.display()
        )))
    }
}

/// Like [`require_path_exists`], but for an `Option<PathBuf>` Requires
/// field: missing entirely is a [`ValidatorError::ContractBreach`] (the
/// producing phase never ran), present but gone from disk is a distinct
/// [`ValidatorError::PathNotFound`] (something deleted it after the
/// producing phase recorded it) — spec E6 expects the latter specifically.
fn require_path_field_exists(path: &Option<PathBuf>, field: &str) -> Result<(), ValidatorError> {
    match path {
        None => Err(ValidatorError::ContractBreach(format!(
            "required field `{field}` missing"
        ))),
        Some(p) => require_path_exists(p, field),
    }
}
