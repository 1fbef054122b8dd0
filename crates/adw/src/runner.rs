//! Phase Runner (C6).
//!
//! Executes one phase's external tool invocation and resolves failures
//! through three escalating layers:
//!
//! 1. Retry the external tool itself, up to `max_external_attempts`.
//! 2. Once per distinct error fingerprint, hand the failure to a repair
//!    agent and retry after it reports success.
//! 3. If neither resolves it, surface the failure to the Orchestrator.
//!
//! An error fingerprint repeating `max_identical_error_repeats` times in a
//! row — including across repair attempts — breaks the loop with
//! [`RunnerError::Looping`] rather than retrying forever.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use adw_retry::{RetryStrategyConfig, calculate_delay};

use crate::error::RunnerError;
use crate::process::{CommandOutput, run_command_with_timeout};

/// A single external tool invocation a phase asks the runner to drive
/// through the cascading resolution policy.
pub struct ToolInvocation<'a> {
    pub tool: &'a str,
    pub args: &'a [&'a str],
    pub working_dir: &'a Path,
    pub timeout: Duration,
}

/// Attempts to repair a failure once its fingerprint has exhausted Layer-1
/// retries. Returns `Ok(())` if the repair believes the failure is
/// resolved and the tool should be retried; any `Err` is treated as the
/// repair itself failing.
pub trait RepairAgent {
    fn repair(&self, tool: &str, fingerprint: &str, last_output: &CommandOutput) -> anyhow::Result<()>;
}

/// A repair agent that never succeeds; used where no repair hook is
/// configured for a phase.
pub struct NoRepair;

impl RepairAgent for NoRepair {
    fn repair(&self, _tool: &str, _fingerprint: &str, _last_output: &CommandOutput) -> anyhow::Result<()> {
        anyhow::bail!("no repair agent configured")
    }
}

pub struct CascadePolicy {
    pub max_external_attempts: u32,
    pub max_identical_error_repeats: u32,
    pub backoff: RetryStrategyConfig,
}

impl Default for CascadePolicy {
    fn default() -> Self {
        Self {
            max_external_attempts: 3,
            max_identical_error_repeats: 4,
            backoff: RetryStrategyConfig::default(),
        }
    }
}

pub fn fingerprint_failure(tool: &str, output: &CommandOutput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"\0");
    hasher.update(output.exit_code.to_le_bytes());
    hasher.update(b"\0");
    hasher.update(output.stderr.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run `invocation` through the full cascading resolution policy,
/// sleeping between Layer-1 retries per `policy.backoff` and invoking
/// `repair` at most once per distinct error fingerprint.
pub fn run_with_recovery(
    invocation: &ToolInvocation,
    policy: &CascadePolicy,
    repair: &dyn RepairAgent,
) -> Result<CommandOutput, RunnerError> {
    let mut external_attempt: u32 = 1;
    let mut repeat_counts: HashMap<String, u32> = HashMap::new();
    let mut repaired_fingerprints: std::collections::HashSet<String> = std::collections::HashSet::new();

    loop {
        let output = run_command_with_timeout(
            invocation.tool,
            invocation.args,
            invocation.working_dir,
            Some(invocation.timeout),
        )
        .map_err(|e| RunnerError::ExternalToolFailure {
            tool: invocation.tool.to_string(),
            message: e.to_string(),
        })?;

        if output.timed_out {
            return Err(RunnerError::Timeout);
        }
        if output.exit_code == 0 {
            return Ok(output);
        }

        let fingerprint = fingerprint_failure(invocation.tool, &output);
        let repeats = repeat_counts.entry(fingerprint.clone()).or_insert(0);
        *repeats += 1;

        if *repeats >= policy.max_identical_error_repeats {
            return Err(RunnerError::Looping { attempts: *repeats });
        }

        if external_attempt < policy.max_external_attempts {
            let delay = calculate_delay(&policy.backoff, external_attempt);
            std::thread::sleep(delay);
            external_attempt += 1;
            continue;
        }

        // Layer-1 retries exhausted for this attempt window. Escalate to
        // the repair agent exactly once per fingerprint.
        if repaired_fingerprints.contains(&fingerprint) {
            return Err(RunnerError::ExternalToolFailure {
                tool: invocation.tool.to_string(),
                message: output.stderr,
            });
        }
        repaired_fingerprints.insert(fingerprint.clone());

        match repair.repair(invocation.tool, &fingerprint, &output) {
            Ok(()) => {
                external_attempt = 1;
                continue;
            }
            Err(e) => return Err(RunnerError::AgentFailure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    struct AlwaysRepairs;
    impl RepairAgent for AlwaysRepairs {
        fn repair(&self, _tool: &str, _fp: &str, _out: &CommandOutput) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn succeeds_immediately_when_tool_exits_zero() {
        let td = tempdir().unwrap();
        let script = write_script(td.path(), "ok.sh", "#!/usr/bin/env sh\nexit 0\n");
        let invocation = ToolInvocation {
            tool: script.to_str().unwrap(),
            args: &[],
            working_dir: td.path(),
            timeout: Duration::from_secs(5),
        };
        let policy = CascadePolicy {
            max_external_attempts: 1,
            ..Default::default()
        };
        let out = run_with_recovery(&invocation, &policy, &NoRepair).unwrap();
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn breaks_loop_on_identical_repeated_failure() {
        let td = tempdir().unwrap();
        let script = write_script(
            td.path(),
            "fail.sh",
            "#!/usr/bin/env sh\necho 'same error' >&2\nexit 1\n",
        );
        let invocation = ToolInvocation {
            tool: script.to_str().unwrap(),
            args: &[],
            working_dir: td.path(),
            timeout: Duration::from_secs(5),
        };
        let mut backoff = RetryStrategyConfig::default();
        backoff.base_delay = Duration::from_millis(1);
        backoff.max_delay = Duration::from_millis(1);
        let policy = CascadePolicy {
            max_external_attempts: 10,
            max_identical_error_repeats: 2,
            backoff,
        };
        let err = run_with_recovery(&invocation, &policy, &AlwaysRepairs).unwrap_err();
        assert!(matches!(err, RunnerError::Looping { attempts: 2 }));
    }

    #[test]
    fn escalates_to_repair_after_external_attempts_exhausted() {
        let td = tempdir().unwrap();
        // Fails once, succeeds on the second invocation (simulating a
        // repair having fixed something on disk).
        let marker = td.path().join("attempted");
        let script = write_script(
            td.path(),
            "flaky.sh",
            &format!(
                "#!/usr/bin/env sh\nif [ -f {0:?} ]; then\n  exit 0\nfi\ntouch {0:?}\necho boom >&2\nexit 1\n",
                marker
            ),
        );
        let invocation = ToolInvocation {
            tool: script.to_str().unwrap(),
            args: &[],
            working_dir: td.path(),
            timeout: Duration::from_secs(5),
        };
        let mut backoff = RetryStrategyConfig::default();
        backoff.base_delay = Duration::from_millis(1);
        backoff.max_delay = Duration::from_millis(1);
        let policy = CascadePolicy {
            max_external_attempts: 1,
            max_identical_error_repeats: 5,
            backoff,
        };
        let out = run_with_recovery(&invocation, &policy, &AlwaysRepairs).unwrap();
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn surfaces_failure_once_repair_already_tried_for_fingerprint() {
        let td = tempdir().unwrap();
        let script = write_script(
            td.path(),
            "fail.sh",
            "#!/usr/bin/env sh\necho 'persistent error' >&2\nexit 1\n",
        );
        let invocation = ToolInvocation {
            tool: script.to_str().unwrap(),
            args: &[],
            working_dir: td.path(),
            timeout: Duration::from_secs(5),
        };
        let mut backoff = RetryStrategyConfig::default();
        backoff.base_delay = Duration::from_millis(1);
        backoff.max_delay = Duration::from_millis(1);
        let policy = CascadePolicy {
            max_external_attempts: 1,
            max_identical_error_repeats: 100,
            backoff,
        };
        let err = run_with_recovery(&invocation, &policy, &AlwaysRepairs).unwrap_err();
        assert!(matches!(err, RunnerError::ExternalToolFailure { .. }));
    }

    #[test]
    fn fingerprint_is_stable_for_same_tool_and_output() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
            timed_out: false,
            duration: Duration::from_millis(1),
        };
        assert_eq!(fingerprint_failure("cargo", &out), fingerprint_failure("cargo", &out));
    }
}
