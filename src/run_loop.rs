use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use crate::agent::{AgentExecution, AgentExit, AgentRunner, AgentSpec, RunContext};
use crate::cancel::CancelToken;
use crate::config::{format_duration, Config};
use crate::error::RalphError;
use crate::hooks::{HookDispatcher, HookEvent};
use crate::logger::{sanitize_log_value, Logger};
use crate::prd::Prd;
use crate::progress::Progress;
use crate::prompt;

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code.clamp(0, 255) as u8)
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.log_transition(&format!("quit reason={}", sanitized));
    Quit {
        code,
        reason: reason.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    Complete,
    MaxIterations,
    Cancelled,
    Error,
}

impl StopReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::MaxIterations => "max_iterations",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoopResult {
    pub(crate) success: bool,
    pub(crate) iterations: u32,
    pub(crate) stories_completed: usize,
    pub(crate) duration: Duration,
    pub(crate) reason: StopReason,
    pub(crate) error: Option<RalphError>,
}

/// Outcome of one iteration body. `execution` is `None` when the PRD was
/// already finished and no agent ran.
#[derive(Debug)]
pub(crate) struct IterationReport {
    pub(crate) complete: bool,
    pub(crate) story_id: Option<String>,
    pub(crate) execution: Option<AgentExecution>,
}

#[derive(Debug)]
struct IterationState {
    iteration: u32,
    max_iterations: u32,
    started_at: Instant,
    stories_completed: usize,
}

impl IterationState {
    fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            started_at: Instant::now(),
            stories_completed: 0,
        }
    }

    fn finish(&self, reason: StopReason, error: Option<RalphError>) -> LoopResult {
        LoopResult {
            success: reason == StopReason::Complete,
            iterations: self.iteration,
            stories_completed: self.stories_completed,
            duration: self.started_at.elapsed(),
            reason,
            error,
        }
    }
}

/// Drives the agent through the PRD until every story passes, the iteration
/// budget runs out, a fatal error occurs, or the run is cancelled.
#[derive(Debug)]
pub(crate) struct Supervisor {
    config: Config,
    runner: AgentRunner,
    hooks: HookDispatcher,
    logger: Logger,
    quiet: bool,
}

impl Supervisor {
    pub(crate) fn new(config: Config, logger: Logger, quiet: bool) -> Result<Self, String> {
        let spec = AgentSpec::resolve(&config.agent)?;
        Ok(Self {
            runner: AgentRunner::new(spec, !quiet),
            hooks: HookDispatcher::new(config.hooks.clone()),
            config,
            logger,
            quiet,
        })
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn run(&self, cancel: &CancelToken) -> LoopResult {
        let mut state = IterationState::new(self.config.run.max_iterations);
        self.logger.log_event(
            "loop start",
            &[
                ("max_iterations", &state.max_iterations.to_string()),
                ("agent", self.runner.spec().agent_type()),
            ],
        );

        let prd = match self.load_prd() {
            Ok(prd) => prd,
            Err(err) => return self.conclude(state.finish(StopReason::Error, Some(err))),
        };
        if prd.is_complete() {
            state.stories_completed = prd.stats().completed;
            self.say("All stories already complete!");
            return self.conclude(state.finish(StopReason::Complete, None));
        }

        let first_story = prd
            .next_story()
            .map(|story| story.id.clone())
            .unwrap_or_default();
        if let Err(err) = self.hooks.run(
            &HookEvent::Start {
                story_id: &first_story,
            },
            cancel,
            &self.logger,
        ) {
            return self.conclude(state.finish(StopReason::Error, Some(err)));
        }

        for iteration in 1..=state.max_iterations {
            if cancel.is_cancelled() {
                state.iteration = iteration - 1;
                return self.conclude(state.finish(StopReason::Cancelled, None));
            }
            state.iteration = iteration;

            let outcome = self
                .run_iteration(&mut state, cancel)
                .and_then(|report| self.check_agent_outcome(report));
            match outcome {
                Ok(report) if report.complete => {
                    self.fire_complete(&state, cancel);
                    return self.conclude(state.finish(StopReason::Complete, None));
                }
                Ok(_) => {}
                Err(err) => {
                    self.fire_failure(iteration, &err.to_string(), cancel);
                    return self.conclude(state.finish(StopReason::Error, Some(err)));
                }
            }

            if iteration < state.max_iterations {
                thread::sleep(self.config.run.sleep_between);
            }
        }

        // An interrupt during the final iteration is still an interrupt.
        if cancel.is_cancelled() {
            return self.conclude(state.finish(StopReason::Cancelled, None));
        }
        self.fire_failure(state.max_iterations, "max iterations reached", cancel);
        self.conclude(state.finish(StopReason::MaxIterations, None))
    }

    /// Runs a single iteration body as iteration 1, with no lifecycle hooks
    /// other than onIteration.
    pub(crate) fn run_once(&self, cancel: &CancelToken) -> Result<IterationReport, RalphError> {
        let mut state = IterationState::new(self.config.run.max_iterations);
        state.iteration = 1;
        self.run_iteration(&mut state, cancel)
    }

    fn run_iteration(
        &self,
        state: &mut IterationState,
        cancel: &CancelToken,
    ) -> Result<IterationReport, RalphError> {
        let paths = &self.config.paths;
        let prd = self.load_prd()?;
        let stats = prd.stats();
        let story = match prd.next_story() {
            Some(story) if !prd.is_complete() => story.clone(),
            _ => {
                state.stories_completed = state.stories_completed.max(stats.completed);
                return Ok(IterationReport {
                    complete: true,
                    story_id: None,
                    execution: None,
                });
            }
        };

        self.say(&format!(
            "\n=== Iteration {}/{} | Stories: {}/{} complete | Next: {} ===\n  {}: {}\n",
            state.iteration,
            state.max_iterations,
            stats.completed,
            stats.total,
            story.id,
            story.id,
            story.title
        ));
        self.logger.log_event(
            "iteration start",
            &[
                ("iteration", &state.iteration.to_string()),
                ("story", &story.id),
            ],
        );

        self.hooks.run(
            &HookEvent::Iteration {
                iteration: state.iteration,
                story_id: &story.id,
            },
            cancel,
            &self.logger,
        )?;

        let progress = Progress::load(&paths.progress).map_err(|reason| RalphError::StateReload {
            what: "progress log",
            reason,
        })?;
        let template = prompt::load(&paths.prompt).map_err(|reason| RalphError::StateReload {
            what: "prompt template",
            reason,
        })?;
        let data =
            prompt::build_template_data(&prd, &progress).map_err(RalphError::RenderFailure)?;
        let rendered = prompt::render(&template, &data)?;

        let context = RunContext {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            branch: prd.branch_name.clone(),
            prd_path: paths.prd.clone(),
            progress_path: paths.progress.clone(),
            prompt_path: paths.prompt.clone(),
            total_stories: stats.total,
            done_stories: stats.completed,
            pending_stories: stats.pending,
            agent_type: self.runner.spec().agent_type().to_string(),
        };
        let execution = self
            .runner
            .execute(cancel, &rendered, &context, &self.logger)?;

        if let Ok(updated) = Prd::load(&paths.prd) {
            state.stories_completed = state.stories_completed.max(updated.stats().completed);
        }
        if execution.saw_completion_marker {
            state.stories_completed = stats.total;
        }

        Ok(IterationReport {
            complete: execution.saw_completion_marker,
            story_id: Some(story.id),
            execution: Some(execution),
        })
    }

    /// Agent failures are reported and tolerated unless the loop is
    /// configured to stop on the first one.
    fn check_agent_outcome(&self, report: IterationReport) -> Result<IterationReport, RalphError> {
        let Some(execution) = &report.execution else {
            return Ok(report);
        };
        if report.complete {
            return Ok(report);
        }
        let Some(failure) = execution.failure() else {
            return Ok(report);
        };

        self.logger.log_event(
            "agent failure",
            &[
                ("story", report.story_id.as_deref().unwrap_or("")),
                ("error", &failure.to_string()),
            ],
        );
        if execution.exit == AgentExit::Cancelled {
            return Ok(report);
        }
        if self.config.run.stop_on_first_failure || failure.is_fatal() {
            return Err(failure);
        }
        eprintln!("Warning: {}; continuing with the next iteration.", failure);
        Ok(report)
    }

    fn load_prd(&self) -> Result<Prd, RalphError> {
        Prd::load(&self.config.paths.prd).map_err(|reason| RalphError::StateReload {
            what: "PRD",
            reason,
        })
    }

    fn fire_complete(&self, state: &IterationState, cancel: &CancelToken) {
        let event = HookEvent::Complete {
            iterations: state.iteration,
            stories_completed: state.stories_completed,
        };
        if let Err(err) = self.hooks.run(&event, cancel, &self.logger) {
            self.report_swallowed(&err);
        }
    }

    fn fire_failure(&self, iteration: u32, reason: &str, cancel: &CancelToken) {
        let event = HookEvent::Failure { iteration, reason };
        if let Err(err) = self.hooks.run(&event, cancel, &self.logger) {
            self.report_swallowed(&err);
        }
    }

    fn report_swallowed(&self, err: &RalphError) {
        eprintln!("Warning: {}", err);
        self.logger
            .log_event("hook ignored", &[("error", &err.to_string())]);
    }

    fn conclude(&self, result: LoopResult) -> LoopResult {
        let error = result
            .error
            .as_ref()
            .map(|err| err.to_string())
            .unwrap_or_default();
        self.logger.log_event(
            "loop end",
            &[
                ("reason", result.reason.as_str()),
                ("success", if result.success { "true" } else { "false" }),
                ("iterations", &result.iterations.to_string()),
                ("stories_completed", &result.stories_completed.to_string()),
                ("duration", &format_duration(&result.duration)),
                ("error", &error),
            ],
        );
        result
    }

    fn say(&self, message: &str) {
        if !self.quiet {
            println!("{}", message);
        }
    }
}
