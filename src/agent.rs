use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::{format_duration, AgentConfig, ENV_ACTIVE};
use crate::error::RalphError;
use crate::logger::Logger;
use crate::shell::{
    command_exists, exit_code, isolate_process_group, kill_process_group, render_args,
    wait_for_exit, WaitOutcome,
};

/// Literal an agent prints to declare every story done.
pub(crate) const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

const CUSTOM_AGENT: &str = "custom";

/// How the rendered prompt reaches the agent process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PromptConvention {
    /// Appended as `<flag> <prompt>` after the other arguments.
    Flag(&'static str),
    /// Written to the process's stdin, which is then closed.
    Stdin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BuiltinAgent {
    ClaudeCode,
    Amp,
    OpenCode,
    Codex,
}

impl BuiltinAgent {
    pub(crate) const ALL: [BuiltinAgent; 4] =
        [Self::ClaudeCode, Self::Amp, Self::OpenCode, Self::Codex];

    pub(crate) fn tag(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Amp => "amp",
            Self::OpenCode => "opencode",
            Self::Codex => "codex",
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::Amp => "amp",
            Self::OpenCode => "opencode",
            Self::Codex => "codex",
        }
    }

    fn base_args(self) -> &'static [&'static str] {
        match self {
            Self::ClaudeCode => &["--dangerously-skip-permissions"],
            Self::Amp => &["--dangerously-allow-all"],
            Self::OpenCode | Self::Codex => &[],
        }
    }

    fn convention(self) -> PromptConvention {
        match self {
            Self::Amp => PromptConvention::Stdin,
            Self::ClaudeCode | Self::OpenCode | Self::Codex => PromptConvention::Flag("-p"),
        }
    }

    /// Resolves a configured type name, accepting the common aliases.
    pub(crate) fn from_tag(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Some(Self::ClaudeCode),
            "amp" => Some(Self::Amp),
            "opencode" | "open-code" => Some(Self::OpenCode),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AgentKind {
    Builtin(BuiltinAgent),
    Custom,
}

impl AgentKind {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Self::Builtin(agent) => agent.tag(),
            Self::Custom => CUSTOM_AGENT,
        }
    }

    fn convention(&self) -> PromptConvention {
        match self {
            Self::Builtin(agent) => agent.convention(),
            Self::Custom => PromptConvention::Flag("-p"),
        }
    }
}

/// Agent invocation resolved once from configuration, before the loop starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AgentSpec {
    pub(crate) kind: AgentKind,
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) timeout: Option<Duration>,
}

impl AgentSpec {
    pub(crate) fn resolve(config: &AgentConfig) -> Result<Self, String> {
        let raw_type = config.agent_type.trim();
        if let Some(agent) = BuiltinAgent::from_tag(raw_type) {
            let mut args: Vec<String> = agent.base_args().iter().map(|a| a.to_string()).collect();
            args.extend(config.flags.iter().cloned());
            return Ok(Self {
                kind: AgentKind::Builtin(agent),
                program: agent.program().to_string(),
                args,
                timeout: config.timeout,
            });
        }

        if !raw_type.eq_ignore_ascii_case(CUSTOM_AGENT) {
            let known: Vec<&str> = BuiltinAgent::ALL.iter().map(|a| a.tag()).collect();
            return Err(format!(
                "Unknown agent.type '{}' (expected one of: {}, {})",
                raw_type,
                known.join(", "),
                CUSTOM_AGENT
            ));
        }

        let argv: Vec<String> = config
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let Some((program, rest)) = argv.split_first() else {
            return Err("agent.command must be set when agent.type is custom".to_string());
        };
        let mut args = rest.to_vec();
        args.extend(config.flags.iter().cloned());
        Ok(Self {
            program: program.clone(),
            args,
            timeout: config.timeout,
            kind: AgentKind::Custom,
        })
    }

    pub(crate) fn agent_type(&self) -> &'static str {
        self.kind.tag()
    }

    pub(crate) fn feeds_stdin(&self) -> bool {
        self.kind.convention() == PromptConvention::Stdin
    }

    pub(crate) fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if let PromptConvention::Flag(flag) = self.kind.convention() {
            args.push(flag.to_string());
            args.push(prompt.to_string());
        }
        args
    }

    /// Program and base arguments, shell-quoted for display.
    pub(crate) fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        render_args(&parts)
    }

    pub(crate) fn is_available(&self) -> bool {
        command_exists(&self.program)
    }
}

/// Per-iteration state exported to the agent as `RALPH_*` variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RunContext {
    pub(crate) iteration: u32,
    pub(crate) max_iterations: u32,
    pub(crate) story_id: String,
    pub(crate) story_title: String,
    pub(crate) branch: String,
    pub(crate) prd_path: PathBuf,
    pub(crate) progress_path: PathBuf,
    pub(crate) prompt_path: PathBuf,
    pub(crate) total_stories: usize,
    pub(crate) done_stories: usize,
    pub(crate) pending_stories: usize,
    pub(crate) agent_type: String,
}

impl RunContext {
    pub(crate) fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_ACTIVE, "true".to_string()),
            ("RALPH_ITERATION", self.iteration.to_string()),
            ("RALPH_MAX_ITERATIONS", self.max_iterations.to_string()),
            ("RALPH_STORY_ID", self.story_id.clone()),
            ("RALPH_STORY_TITLE", self.story_title.clone()),
            ("RALPH_BRANCH", self.branch.clone()),
            ("RALPH_PRD_PATH", self.prd_path.display().to_string()),
            (
                "RALPH_PROGRESS_PATH",
                self.progress_path.display().to_string(),
            ),
            ("RALPH_PROMPT_PATH", self.prompt_path.display().to_string()),
            ("RALPH_TOTAL_STORIES", self.total_stories.to_string()),
            ("RALPH_DONE_STORIES", self.done_stories.to_string()),
            ("RALPH_PENDING_STORIES", self.pending_stories.to_string()),
            ("RALPH_AGENT_TYPE", self.agent_type.clone()),
        ]
    }

    pub(crate) fn apply(&self, cmd: &mut Command) {
        for (key, value) in self.env_vars() {
            cmd.env(key, value);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AgentExit {
    /// Signal deaths are reported as code -1.
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct AgentExecution {
    pub(crate) output: String,
    pub(crate) exit: AgentExit,
    pub(crate) duration: Duration,
    pub(crate) saw_completion_marker: bool,
    pub(crate) timeout: Option<Duration>,
}

impl AgentExecution {
    /// Describes an unsuccessful run; `None` for a clean zero exit.
    pub(crate) fn failure(&self) -> Option<RalphError> {
        match self.exit {
            AgentExit::Exited(0) => None,
            AgentExit::Exited(code) => Some(RalphError::NonZeroExit {
                label: "agent".to_string(),
                code,
            }),
            AgentExit::TimedOut => Some(RalphError::Timeout {
                label: "agent".to_string(),
                timeout: self.timeout.unwrap_or_default(),
            }),
            AgentExit::Cancelled => Some(RalphError::Cancelled),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct AgentRunner {
    spec: AgentSpec,
    echo: bool,
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

impl AgentRunner {
    pub(crate) fn new(spec: AgentSpec, echo: bool) -> Self {
        Self { spec, echo }
    }

    pub(crate) fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    /// Runs the agent once and classifies how it ended. Only a failure to
    /// launch is returned as an error.
    pub(crate) fn execute(
        &self,
        cancel: &CancelToken,
        prompt: &str,
        context: &RunContext,
        logger: &Logger,
    ) -> Result<AgentExecution, RalphError> {
        let args = self.spec.build_args(prompt);
        let feeds_stdin = self.spec.feeds_stdin();

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&args);
        cmd.stdin(if feeds_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        context.apply(&mut cmd);
        isolate_process_group(&mut cmd);

        logger.log_event(
            "agent start",
            &[
                ("iteration", &context.iteration.to_string()),
                ("story", &context.story_id),
                ("command", &self.spec.command_line()),
                ("prompt_bytes", &prompt.len().to_string()),
            ],
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RalphError::LaunchFailure {
            program: self.spec.program.clone(),
            source,
        })?;

        let stdin_writer = if feeds_stdin {
            child.stdin.take().map(|mut stdin| {
                let prompt = prompt.to_string();
                thread::spawn(move || {
                    // The agent may exit without reading its input.
                    let _ = stdin.write_all(prompt.as_bytes());
                })
            })
        } else {
            None
        };

        let combined: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| spawn_tee(pipe, Arc::clone(&combined), self.echo.then(io::stdout)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| spawn_tee(pipe, Arc::clone(&combined), self.echo.then(io::stderr)));

        let waited = wait_for_exit(&mut child, cancel, self.spec.timeout);
        // Background descendants would otherwise keep the pipes open and hold
        // the readers past the deadline.
        kill_process_group(child.id());

        let mut saw_completion_marker = false;
        for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
            let stream = reader.join().unwrap_or_default();
            saw_completion_marker |= contains_marker(&stream);
        }
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }

        let outcome = waited.map_err(|err| {
            RalphError::io(format!("Failed to wait for {}", self.spec.program), err)
        })?;
        let exit = match outcome {
            WaitOutcome::Exited(status) => AgentExit::Exited(exit_code(status)),
            WaitOutcome::TimedOut => AgentExit::TimedOut,
            WaitOutcome::Cancelled => AgentExit::Cancelled,
        };

        let output = {
            let buffer = combined.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&buffer).into_owned()
        };
        let execution = AgentExecution {
            output,
            exit,
            duration: started.elapsed(),
            saw_completion_marker,
            timeout: self.spec.timeout,
        };

        logger.log_event(
            "agent exit",
            &[
                ("iteration", &context.iteration.to_string()),
                ("exit", &describe_exit(exit)),
                ("duration", &format_duration(&execution.duration)),
                ("marker", &saw_completion_marker.to_string()),
            ],
        );
        Ok(execution)
    }
}

fn describe_exit(exit: AgentExit) -> String {
    match exit {
        AgentExit::Exited(code) => code.to_string(),
        AgentExit::TimedOut => "timeout".to_string(),
        AgentExit::Cancelled => "cancelled".to_string(),
    }
}

/// Copies `pipe` into the shared buffer and, when given, the terminal.
/// Returns everything read from this stream alone so the marker scan never
/// sees bytes from the two streams interleaved.
fn spawn_tee<R, W>(mut pipe: R, combined: SharedBuffer, mut echo: Option<W>) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut own = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let bytes = &chunk[..read];
            if let Some(out) = echo.as_mut() {
                let _ = out.write_all(bytes);
                let _ = out.flush();
            }
            combined
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(bytes);
            own.extend_from_slice(bytes);
        }
        own
    })
}

fn contains_marker(bytes: &[u8]) -> bool {
    let marker = COMPLETION_MARKER.as_bytes();
    bytes.windows(marker.len()).any(|window| window == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(agent_type: &str, command: &str, flags: &[&str]) -> AgentConfig {
        AgentConfig {
            agent_type: agent_type.to_string(),
            command: command.to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            timeout: None,
        }
    }

    #[test]
    fn builtin_agents_resolve_with_aliases() {
        let spec = AgentSpec::resolve(&config("Claude", "", &["--verbose"])).expect("resolve");
        assert_eq!(spec.kind, AgentKind::Builtin(BuiltinAgent::ClaudeCode));
        assert_eq!(spec.program, "claude");
        assert_eq!(
            spec.build_args("do it"),
            vec!["--dangerously-skip-permissions", "--verbose", "-p", "do it"]
        );
        assert_eq!(spec.agent_type(), "claude-code");

        let spec = AgentSpec::resolve(&config("open-code", "", &[])).expect("resolve");
        assert_eq!(spec.kind, AgentKind::Builtin(BuiltinAgent::OpenCode));
    }

    #[test]
    fn amp_receives_prompt_on_stdin() {
        let spec = AgentSpec::resolve(&config("amp", "", &[])).expect("resolve");
        assert!(spec.feeds_stdin());
        assert_eq!(spec.build_args("do it"), vec!["--dangerously-allow-all"]);
    }

    #[test]
    fn custom_agent_splits_command() {
        let spec = AgentSpec::resolve(&config("custom", "./agent.sh --fast", &["--x"]))
            .expect("resolve");
        assert_eq!(spec.program, "./agent.sh");
        assert_eq!(spec.build_args("p"), vec!["--fast", "--x", "-p", "p"]);
        assert_eq!(spec.agent_type(), "custom");
        assert_eq!(spec.command_line(), "./agent.sh --fast --x");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = AgentSpec::resolve(&config("gpt-pilot", "", &[])).expect_err("unknown type");
        assert!(err.contains("gpt-pilot"), "got: {err}");
    }

    #[test]
    fn run_context_exports_every_variable() {
        let context = RunContext {
            iteration: 2,
            max_iterations: 5,
            story_id: "US-002".to_string(),
            agent_type: "custom".to_string(),
            ..RunContext::default()
        };
        let vars = context.env_vars();
        assert_eq!(vars.len(), 13);
        assert!(vars.contains(&("RALPH_ACTIVE", "true".to_string())));
        assert!(vars.contains(&("RALPH_ITERATION", "2".to_string())));
        assert!(vars.contains(&("RALPH_MAX_ITERATIONS", "5".to_string())));
        assert!(vars.contains(&("RALPH_STORY_ID", "US-002".to_string())));
    }

    #[test]
    fn failure_descriptions_follow_exit() {
        let mut execution = AgentExecution {
            output: String::new(),
            exit: AgentExit::Exited(0),
            duration: Duration::ZERO,
            saw_completion_marker: false,
            timeout: Some(Duration::from_secs(90)),
        };
        assert!(execution.failure().is_none());

        execution.exit = AgentExit::Exited(2);
        assert_eq!(
            execution.failure().map(|e| e.to_string()),
            Some("agent exited with code 2".to_string())
        );

        execution.exit = AgentExit::TimedOut;
        assert_eq!(
            execution.failure().map(|e| e.to_string()),
            Some("agent timed out after 1m30s".to_string())
        );
    }

    #[test]
    fn marker_scan_matches_literal_only() {
        assert!(contains_marker(b"done\n<promise>COMPLETE</promise>\n"));
        assert!(!contains_marker(b"<promise>COMPLETE"));
        assert!(!contains_marker(b""));
    }
}
