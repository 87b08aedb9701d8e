use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::agent::AgentSpec;
use crate::cancel::CancelToken;
use crate::cli::{Cli, CliCommand, ConfigOverrides};
use crate::commands::{self, LogAction, PromptAction, StatusFilter};
use crate::config::{
    apply_env_overrides, format_duration, load_config, validate_config, Config, LoadedConfig,
    CONFIG_FILE_NAME,
};
use crate::error::RalphError;
use crate::logger::Logger;
use crate::pidfile::{PidFile, StopOutcome, StopPolicy, StopSignal};
use crate::prd::Prd;
use crate::run_loop::{quit, LoopResult, Quit, StopReason, Supervisor};

const EXIT_INTERRUPTED: i32 = 130;

fn require_file(path: &Path, label: &str) -> Result<(), String> {
    if !path.is_file() {
        return Err(format!(
            "{} not found at {}. Run 'ralph init' first.",
            label,
            path.display()
        ));
    }
    Ok(())
}

fn fail(message: String) -> Quit {
    eprintln!("{}", message);
    Quit {
        code: 1,
        reason: message,
    }
}

/// Loads the configuration file (or defaults), then `RALPH_*` environment
/// overrides, then command-line overrides, and validates the result.
pub(crate) fn effective_config(overrides: &ConfigOverrides) -> Result<LoadedConfig, String> {
    let mut loaded = load_config(overrides.config.as_deref())?;
    for warning in &loaded.warnings {
        eprintln!("Warning: {}", warning);
    }
    let config = &mut loaded.config;
    apply_env_overrides(config, |key| env::var(key).ok())?;
    if let Some(agent) = &overrides.agent {
        config.agent.agent_type = agent.clone();
    }
    if let Some(max_iterations) = overrides.max_iterations {
        config.run.max_iterations = max_iterations;
    }
    if let Some(path) = &overrides.prd {
        config.paths.prd = path.clone();
    }
    if let Some(path) = &overrides.progress {
        config.paths.progress = path.clone();
    }
    if let Some(path) = &overrides.prompt {
        config.paths.prompt = path.clone();
    }
    validate_config(config)?;
    Ok(loaded)
}

/// Owns the PID record for the lifetime of a run and removes it on drop.
struct PidGuard {
    pidfile: PidFile,
}

impl PidGuard {
    fn acquire(pidfile: PidFile) -> Result<Self, RalphError> {
        pidfile.write()?;
        Ok(Self { pidfile })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(err) = self.pidfile.remove() {
            eprintln!("Warning: {}", err);
        }
    }
}

fn registry() -> PidFile {
    PidFile::new(Path::new("."))
}

fn run_command(loaded: LoadedConfig, once: bool, dry_run: bool, quiet: bool) -> Result<(), Quit> {
    let config = loaded.config;
    let logger = Logger::new(config.log_path.clone());
    require_file(&config.paths.prd, "PRD").map_err(|message| {
        eprintln!("{}", message);
        quit(&logger, &message, 1)
    })?;
    require_file(&config.paths.prompt, "Prompt").map_err(|message| {
        eprintln!("{}", message);
        quit(&logger, &message, 1)
    })?;
    let prd = Prd::load(&config.paths.prd).map_err(|message| {
        eprintln!("{}", message);
        quit(&logger, &message, 1)
    })?;
    let spec = AgentSpec::resolve(&config.agent).map_err(fail)?;

    if dry_run {
        print_dry_run(&config, loaded.path.as_deref(), &spec, &prd);
        return Ok(());
    }

    if !spec.is_available() {
        let message = format!("agent command '{}' not found in PATH", spec.program);
        eprintln!("{}", message);
        return Err(quit(&logger, &message, 1));
    }

    let _guard = match PidGuard::acquire(registry()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{}", err);
            return Err(quit(&logger, &err.to_string(), 1));
        }
    };

    let cancel = CancelToken::new();
    if let Err(err) = ctrlc::set_handler({
        let cancel = cancel.clone();
        move || cancel.cancel()
    }) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }

    if !quiet {
        print_startup(&config, &spec, &prd);
    }
    let supervisor = Supervisor::new(config, logger, quiet).map_err(fail)?;

    if once {
        return finish_once(&supervisor, &cancel);
    }
    let result = supervisor.run(&cancel);
    finish_run(&supervisor, &result)
}

fn finish_once(supervisor: &Supervisor, cancel: &CancelToken) -> Result<(), Quit> {
    println!("Running single iteration (human-in-the-loop mode)...");
    match supervisor.run_once(cancel) {
        Ok(report) if report.complete => {
            println!("\nAll stories complete!");
            Ok(())
        }
        Ok(report) => {
            if cancel.is_cancelled() {
                return Err(quit(supervisor.logger(), "interrupted", EXIT_INTERRUPTED));
            }
            if let Some(failure) = report.execution.as_ref().and_then(|e| e.failure()) {
                eprintln!("Warning: {}", failure);
            }
            println!("\nIteration complete");
            println!("  Run 'ralph status' to check progress");
            println!("  Run 'ralph run --once' for another iteration");
            Ok(())
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            Err(quit(supervisor.logger(), &err.to_string(), 1))
        }
    }
}

fn finish_run(supervisor: &Supervisor, result: &LoopResult) -> Result<(), Quit> {
    let logger = supervisor.logger();
    match result.reason {
        StopReason::Complete => {
            println!("\nAll stories complete!");
            println!("   Iterations: {}", result.iterations);
            println!("   Duration: {}", format_duration(&result.duration));
            Ok(())
        }
        StopReason::MaxIterations => {
            println!(
                "\nMax iterations reached ({}). Run 'ralph run' to continue.",
                result.iterations
            );
            Ok(())
        }
        StopReason::Cancelled => {
            eprintln!("\nInterrupted after {} iterations.", result.iterations);
            Err(quit(logger, "interrupted", EXIT_INTERRUPTED))
        }
        StopReason::Error => {
            let message = result
                .error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("Error: {}", message);
            Err(quit(logger, &message, 1))
        }
    }
}

fn print_startup(config: &Config, spec: &AgentSpec, prd: &Prd) {
    let stats = prd.stats();
    println!("\nStarting Ralph\n");
    println!("  Agent:      {}", spec.agent_type());
    println!("  Branch:     {}", prd.branch_name);
    println!(
        "  Stories:    {} total, {} pending, {} complete",
        stats.total, stats.pending, stats.completed
    );
    println!("  Max Iter:   {}", config.run.max_iterations);
    if config.hooks.enabled && config.hooks.has_hooks() {
        println!("  Hooks:      enabled");
    }
    if let Some(next) = prd.next_story() {
        println!("\n  First story: {} - {}", next.id, next.title);
    }
    println!();
}

fn print_dry_run(config: &Config, source: Option<&Path>, spec: &AgentSpec, prd: &Prd) {
    let stats = prd.stats();
    let timeout = config
        .agent
        .timeout
        .map(|timeout| format_duration(&timeout))
        .unwrap_or_else(|| "none".to_string());
    println!("\nDry Run - Ralph Configuration\n");
    match source {
        Some(path) => println!("Config: {}\n", path.display()),
        None => println!("Config: built-in defaults\n"),
    }
    println!("Agent:");
    println!("  Type:    {}", spec.agent_type());
    println!("  Command: {}", spec.command_line());
    println!("  Timeout: {}\n", timeout);
    println!("Loop:");
    println!("  Max Iterations: {}", config.run.max_iterations);
    println!(
        "  Sleep Between:  {}",
        format_duration(&config.run.sleep_between)
    );
    println!("  Stop On First Failure: {}\n", config.run.stop_on_first_failure);
    println!("Files:");
    for (label, path) in ["PRD", "Progress", "Prompt"]
        .into_iter()
        .zip(config.paths.all())
    {
        println!("  {:<9} {}", format!("{}:", label), path.display());
    }
    println!("\nPRD Status:");
    println!("  Branch:    {}", prd.branch_name);
    println!("  Total:     {} stories", stats.total);
    println!("  Completed: {} stories", stats.completed);
    println!("  Pending:   {} stories\n", stats.pending);

    if config.hooks.has_hooks() {
        println!("Hooks (enabled: {}):", config.hooks.enabled);
        for phase in [
            crate::hooks::HookPhase::Start,
            crate::hooks::HookPhase::Iteration,
            crate::hooks::HookPhase::Complete,
            crate::hooks::HookPhase::Failure,
        ] {
            let commands = config.hooks.commands(phase);
            if !commands.is_empty() {
                println!("  {:<12} {}", format!("{}:", phase), commands.join(" && "));
            }
        }
        println!();
    }

    match prd.next_story() {
        Some(next) => print!("Next Story:\n  {}", next.format_for_display()),
        None => println!("All stories complete!"),
    }
}

fn stop_command(force: bool) -> Result<(), Quit> {
    let pidfile = registry();
    let (running, pid) = pidfile.is_running();
    if !running {
        println!("Ralph is not running");
        return Ok(());
    }

    let signal = if force {
        StopSignal::Kill
    } else {
        StopSignal::Terminate
    };
    println!("Found Ralph process (PID {})", pid);
    println!("Sending {}...", signal.name());
    match pidfile.stop(signal, StopPolicy::default()) {
        Ok(StopOutcome::Stopped { .. }) => {
            println!("Ralph stopped successfully");
            Ok(())
        }
        Ok(StopOutcome::StillRunning { pid }) => {
            if force {
                println!("Failed to stop process {}", pid);
            } else {
                println!("Process {} still running. Use --force to kill immediately.", pid);
            }
            Ok(())
        }
        Err(RalphError::NotRunning) => {
            println!("Ralph is not running");
            Ok(())
        }
        Err(err) => Err(fail(format!("failed to stop Ralph: {}", err))),
    }
}

fn config_file_for_init(overrides: &ConfigOverrides) -> PathBuf {
    overrides
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    if let CliCommand::Stop { force } = cli.command {
        return stop_command(force);
    }

    let init_config_path = config_file_for_init(&cli.overrides);
    let loaded = match &cli.command {
        // A fresh project has no config file yet, so an explicit --config
        // path names the file to create.
        CliCommand::Init { .. } if !init_config_path.is_file() => {
            let overrides = ConfigOverrides {
                config: None,
                ..cli.overrides
            };
            effective_config(&overrides)
        }
        _ => effective_config(&cli.overrides),
    }
    .map_err(fail)?;
    let config = match cli.command {
        CliCommand::Run {
            once,
            dry_run,
            quiet,
        } => return run_command(loaded, once, dry_run, quiet),
        _ => loaded.config,
    };

    let outcome = match cli.command {
        CliCommand::Init {
            branch,
            force,
            minimal,
        } => commands::init_project(&config, &init_config_path, &branch, force, minimal)
            .map(|report| commands::print_init_report(&report)),
        CliCommand::Run { .. } | CliCommand::Stop { .. } => Ok(()),
        CliCommand::Status {
            json,
            pending,
            done,
        } => {
            let filter = if pending {
                StatusFilter::Pending
            } else if done {
                StatusFilter::Done
            } else {
                StatusFilter::All
            };
            commands::status(&config, json, filter)
        }
        CliCommand::Add(args) => commands::add_story(&config, args).map(|_| ()),
        CliCommand::Edit(args) => commands::edit_story(&config, args),
        CliCommand::Done { id } => commands::mark_done(&config, &id),
        CliCommand::Reset { id, all } => commands::reset(&config, id.as_deref(), all),
        CliCommand::Delete { id } => commands::delete(&config, &id),
        CliCommand::Log {
            append,
            patterns,
            clear,
            tail,
            story,
            files,
            learnings,
        } => {
            let action = if clear {
                LogAction::Clear
            } else if let Some(story_id) = story {
                LogAction::Entry {
                    story_id,
                    files,
                    learnings,
                }
            } else if let Some(note) = append {
                LogAction::Append(note)
            } else if patterns {
                LogAction::Patterns
            } else {
                LogAction::Show { tail }
            };
            commands::log(&config, action)
        }
        CliCommand::Prompt { render, reset } => {
            let action = if reset {
                PromptAction::Reset
            } else if render {
                PromptAction::Render
            } else {
                PromptAction::Show
            };
            commands::prompt_template(&config, action)
        }
    };
    outcome.map_err(fail)
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // Rendered by hand so test harnesses capture it like other output.
            eprintln!("{err}");
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    match run_with_args(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
