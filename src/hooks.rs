use serde::Deserialize;
use std::fmt;
use std::process::{Command, Stdio};

use crate::cancel::CancelToken;
use crate::config::string_list;
use crate::error::RalphError;
use crate::logger::{sanitize_log_value, Logger};
use crate::shell::{isolate_process_group, wait_for_exit, WaitOutcome};

pub(crate) const ENV_ITERATION: &str = "RALPH_ITERATION";
pub(crate) const ENV_ITERATIONS: &str = "RALPH_ITERATIONS";
pub(crate) const ENV_STORY_ID: &str = "RALPH_STORY_ID";
pub(crate) const ENV_STORIES_COMPLETED: &str = "RALPH_STORIES_COMPLETED";
pub(crate) const ENV_FAILURE_REASON: &str = "RALPH_FAILURE_REASON";
pub(crate) const ENV_HOOK: &str = "RALPH_HOOK";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HookPhase {
    Start,
    Iteration,
    Complete,
    Failure,
}

impl HookPhase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Start => "onStart",
            Self::Iteration => "onIteration",
            Self::Complete => "onComplete",
            Self::Failure => "onFailure",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle hook commands keyed by phase, as read from the `hooks` section
/// of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct HookSet {
    pub(crate) enabled: bool,
    #[serde(deserialize_with = "string_list")]
    pub(crate) on_start: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub(crate) on_iteration: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub(crate) on_complete: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub(crate) on_failure: Vec<String>,
}

impl Default for HookSet {
    fn default() -> Self {
        Self {
            enabled: true,
            on_start: Vec::new(),
            on_iteration: Vec::new(),
            on_complete: Vec::new(),
            on_failure: Vec::new(),
        }
    }
}

impl HookSet {
    pub(crate) fn commands(&self, phase: HookPhase) -> &[String] {
        match phase {
            HookPhase::Start => &self.on_start,
            HookPhase::Iteration => &self.on_iteration,
            HookPhase::Complete => &self.on_complete,
            HookPhase::Failure => &self.on_failure,
        }
    }

    pub(crate) fn has_hooks(&self) -> bool {
        [
            HookPhase::Start,
            HookPhase::Iteration,
            HookPhase::Complete,
            HookPhase::Failure,
        ]
        .into_iter()
        .any(|phase| !self.commands(phase).is_empty())
    }
}

/// A lifecycle event together with the state exported to its hook commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HookEvent<'a> {
    /// Always reported as iteration 0.
    Start { story_id: &'a str },
    Iteration { iteration: u32, story_id: &'a str },
    Complete {
        iterations: u32,
        stories_completed: usize,
    },
    Failure { iteration: u32, reason: &'a str },
}

impl HookEvent<'_> {
    pub(crate) fn phase(&self) -> HookPhase {
        match self {
            Self::Start { .. } => HookPhase::Start,
            Self::Iteration { .. } => HookPhase::Iteration,
            Self::Complete { .. } => HookPhase::Complete,
            Self::Failure { .. } => HookPhase::Failure,
        }
    }

    pub(crate) fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = match self {
            Self::Start { story_id } => vec![
                (ENV_ITERATION, "0".to_string()),
                (ENV_STORY_ID, story_id.to_string()),
            ],
            Self::Iteration {
                iteration,
                story_id,
            } => vec![
                (ENV_ITERATION, iteration.to_string()),
                (ENV_STORY_ID, story_id.to_string()),
            ],
            Self::Complete {
                iterations,
                stories_completed,
            } => vec![
                (ENV_ITERATIONS, iterations.to_string()),
                (ENV_STORIES_COMPLETED, stories_completed.to_string()),
            ],
            Self::Failure { iteration, reason } => vec![
                (ENV_ITERATION, iteration.to_string()),
                (ENV_FAILURE_REASON, reason.to_string()),
            ],
        };
        vars.push((ENV_HOOK, self.phase().as_str().to_string()));
        vars
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HookDispatcher {
    hooks: HookSet,
}

impl HookDispatcher {
    pub(crate) fn new(hooks: HookSet) -> Self {
        Self { hooks }
    }

    /// Runs every command of the event's phase in order. The first command
    /// that fails to launch, exits non-zero or is cancelled aborts the phase.
    pub(crate) fn run(
        &self,
        event: &HookEvent<'_>,
        cancel: &CancelToken,
        logger: &Logger,
    ) -> Result<(), RalphError> {
        if !self.hooks.enabled {
            return Ok(());
        }

        let phase = event.phase();
        let vars = event.env_vars();
        for command in self.hooks.commands(phase) {
            if command.trim().is_empty() {
                continue;
            }
            run_hook_command(phase, command, &vars, cancel, logger)?;
        }
        Ok(())
    }
}

fn run_hook_command(
    phase: HookPhase,
    command: &str,
    vars: &[(&'static str, String)],
    cancel: &CancelToken,
    logger: &Logger,
) -> Result<(), RalphError> {
    let failure = |reason: String| RalphError::HookFailure {
        phase,
        command: command.to_string(),
        reason,
    };

    logger.log_transition(&format!(
        "hook start phase={} command={}",
        phase,
        sanitize_log_value(command)
    ));

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    for (key, value) in vars {
        cmd.env(key, value);
    }
    isolate_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|err| failure(format!("failed to launch: {}", err)))?;
    let outcome = wait_for_exit(&mut child, cancel, None)
        .map_err(|err| failure(format!("failed to wait: {}", err)))?;

    let result = match outcome {
        WaitOutcome::Exited(status) if status.success() => Ok(()),
        WaitOutcome::Exited(status) => Err(failure(match status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        })),
        WaitOutcome::Cancelled => Err(failure("cancelled".to_string())),
        WaitOutcome::TimedOut => Err(failure("timed out".to_string())),
    };
    logger.log_transition(&format!(
        "hook exit phase={} ok={}",
        phase,
        result.is_ok()
    ));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn hook_set(phase: HookPhase, commands: &[&str]) -> HookSet {
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        let mut hooks = HookSet::default();
        match phase {
            HookPhase::Start => hooks.on_start = commands,
            HookPhase::Iteration => hooks.on_iteration = commands,
            HookPhase::Complete => hooks.on_complete = commands,
            HookPhase::Failure => hooks.on_failure = commands,
        }
        hooks
    }

    #[test]
    fn env_vars_follow_phase_contract() {
        let vars = HookEvent::Start { story_id: "US-001" }.env_vars();
        assert_eq!(
            vars,
            vec![
                (ENV_ITERATION, "0".to_string()),
                (ENV_STORY_ID, "US-001".to_string()),
                (ENV_HOOK, "onStart".to_string()),
            ]
        );

        let vars = HookEvent::Complete {
            iterations: 4,
            stories_completed: 3,
        }
        .env_vars();
        assert_eq!(
            vars,
            vec![
                (ENV_ITERATIONS, "4".to_string()),
                (ENV_STORIES_COMPLETED, "3".to_string()),
                (ENV_HOOK, "onComplete".to_string()),
            ]
        );

        let vars = HookEvent::Failure {
            iteration: 2,
            reason: "max iterations reached",
        }
        .env_vars();
        assert!(vars.contains(&(ENV_FAILURE_REASON, "max iterations reached".to_string())));
        assert!(vars.contains(&(ENV_HOOK, "onFailure".to_string())));
    }

    #[test]
    fn disabled_hooks_are_a_noop() {
        let mut hooks = hook_set(HookPhase::Start, &["exit 7"]);
        hooks.enabled = false;
        let dispatcher = HookDispatcher::new(hooks);
        dispatcher
            .run(
                &HookEvent::Start { story_id: "" },
                &CancelToken::new(),
                &Logger::new(None),
            )
            .expect("disabled hooks should not run");
    }

    #[test]
    fn commands_run_in_order_with_overlay_and_skip_blanks() {
        let temp = TempDir::new().expect("temp dir");
        let log = temp.path().join("hooks.log");
        let first = format!(
            "echo \"first $RALPH_HOOK $RALPH_ITERATION $RALPH_STORY_ID\" >> '{}'",
            log.display()
        );
        let second = format!("echo second >> '{}'", log.display());
        let dispatcher = HookDispatcher::new(hook_set(
            HookPhase::Iteration,
            &[&first, "   ", &second],
        ));

        dispatcher
            .run(
                &HookEvent::Iteration {
                    iteration: 3,
                    story_id: "US-007",
                },
                &CancelToken::new(),
                &Logger::new(None),
            )
            .expect("hooks should succeed");

        let contents = fs::read_to_string(&log).expect("read hook log");
        assert_eq!(contents, "first onIteration 3 US-007\nsecond\n");
    }

    #[test]
    fn failing_command_aborts_the_phase() {
        let temp = TempDir::new().expect("temp dir");
        let marker = temp.path().join("after.txt");
        let after = format!("touch '{}'", marker.display());
        let dispatcher =
            HookDispatcher::new(hook_set(HookPhase::Complete, &["exit 3", &after]));

        let err = dispatcher
            .run(
                &HookEvent::Complete {
                    iterations: 1,
                    stories_completed: 1,
                },
                &CancelToken::new(),
                &Logger::new(None),
            )
            .expect_err("hook should fail");

        match err {
            RalphError::HookFailure {
                phase,
                command,
                reason,
            } => {
                assert_eq!(phase, HookPhase::Complete);
                assert_eq!(command, "exit 3");
                assert_eq!(reason, "exited with code 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!marker.exists(), "later hooks must not run after a failure");
    }

    #[test]
    fn cancelled_token_stops_a_running_hook() {
        let dispatcher = HookDispatcher::new(hook_set(HookPhase::Start, &["sleep 30"]));
        let cancel = CancelToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let err = dispatcher
            .run(&HookEvent::Start { story_id: "" }, &cancel, &Logger::new(None))
            .expect_err("cancelled hook should fail");
        assert!(err.to_string().contains("cancelled"), "got: {err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
