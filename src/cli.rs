use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::prd::DEFAULT_BRANCH;

#[derive(Debug, Parser)]
#[command(
    name = "ralph",
    about = "Ralph runs a coding agent in a loop until every story in the PRD passes.",
    long_about = "Ralph reads .ralph/prd.json, renders the prompt template for the highest priority pending story, runs the configured agent, and repeats until the agent prints <promise>COMPLETE</promise>, the iteration budget runs out, or the run is stopped.\n\nLoop state is provided to the agent and to hooks via RALPH_* environment variables.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) overrides: ConfigOverrides,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Options that override values from `ralph.yaml`.
#[derive(Debug, Default, Args)]
pub(crate) struct ConfigOverrides {
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load configuration from PATH instead of ./ralph.yaml or ./.ralph/ralph.yaml."
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long = "agent",
        global = true,
        value_name = "TYPE",
        help = "Agent type: claude-code, amp, opencode, codex or custom."
    )]
    pub(crate) agent: Option<String>,

    #[arg(
        long = "max-iterations",
        global = true,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Maximum loop iterations."
    )]
    pub(crate) max_iterations: Option<u32>,

    #[arg(long = "prd", global = true, value_name = "PATH", help = "Path to prd.json.")]
    pub(crate) prd: Option<PathBuf>,

    #[arg(
        long = "progress",
        global = true,
        value_name = "PATH",
        help = "Path to progress.txt."
    )]
    pub(crate) progress: Option<PathBuf>,

    #[arg(
        long = "prompt",
        global = true,
        value_name = "PATH",
        help = "Path to the prompt template."
    )]
    pub(crate) prompt: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Create ralph.yaml and the .ralph/ PRD, progress log and prompt template.
    Init {
        #[arg(short = 'b', long, default_value = DEFAULT_BRANCH, help = "Git branch name for the feature.")]
        branch: String,
        #[arg(short = 'f', long, help = "Overwrite existing files.")]
        force: bool,
        #[arg(short = 'm', long, help = "Create an empty PRD without the example story.")]
        minimal: bool,
    },
    /// Start the loop.
    Run {
        #[arg(long, help = "Run a single iteration (human-in-the-loop mode).")]
        once: bool,
        #[arg(long = "dry-run", help = "Show what would be executed without running.")]
        dry_run: bool,
        #[arg(short = 'q', long, help = "Do not echo agent output to the terminal.")]
        quiet: bool,
    },
    /// Stop a running loop started from this directory.
    Stop {
        #[arg(short = 'f', long, help = "Send SIGKILL instead of SIGTERM.")]
        force: bool,
    },
    /// Show PRD status and progress.
    Status {
        #[arg(long, help = "Print the PRD as JSON.")]
        json: bool,
        #[arg(long, conflicts_with = "done", help = "Show only pending stories.")]
        pending: bool,
        #[arg(long, help = "Show only completed stories.")]
        done: bool,
    },
    /// Add a user story to the PRD.
    Add(AddArgs),
    /// Edit an existing user story.
    Edit(EditArgs),
    /// Mark a story as passing.
    Done {
        #[arg(value_name = "STORY_ID")]
        id: String,
    },
    /// Mark a story (or every story) as pending.
    Reset {
        #[arg(value_name = "STORY_ID", required_unless_present = "all")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id", help = "Reset all stories to pending.")]
        all: bool,
    },
    /// Remove a story from the PRD.
    Delete {
        #[arg(value_name = "STORY_ID")]
        id: String,
    },
    /// View or append to the progress log.
    Log {
        #[arg(short = 'a', long, value_name = "NOTE", help = "Append a note to the log.")]
        append: Option<String>,
        #[arg(short = 'p', long, help = "Show the codebase patterns section.")]
        patterns: bool,
        #[arg(long, help = "Reset the log to its initial content.")]
        clear: bool,
        #[arg(short = 't', long, value_name = "N", help = "Show only the last N lines.")]
        tail: Option<usize>,
        #[arg(
            short = 's',
            long,
            value_name = "ID",
            conflicts_with_all = ["append", "patterns", "clear", "tail"],
            help = "Append a dated entry for a story."
        )]
        story: Option<String>,
        #[arg(short = 'f', long = "file", value_name = "PATH", requires = "story", help = "File changed for the story entry (repeatable).")]
        files: Vec<String>,
        #[arg(short = 'l', long = "learning", value_name = "TEXT", requires = "story", help = "Learning recorded in the story entry (repeatable).")]
        learnings: Vec<String>,
    },
    /// View, render or reset the prompt template.
    Prompt {
        #[arg(short = 'r', long, help = "Render the template with the current PRD and progress log.")]
        render: bool,
        #[arg(long, conflicts_with = "render", help = "Replace the template with the default.")]
        reset: bool,
    },
}

#[derive(Debug, Args)]
pub(crate) struct AddArgs {
    #[arg(short = 't', long, help = "Story title.")]
    pub(crate) title: String,
    #[arg(short = 'd', long, default_value = "", help = "Story description.")]
    pub(crate) description: String,
    #[arg(short = 'p', long, help = "Priority (lower runs first); defaults to the end of the list.")]
    pub(crate) priority: Option<i32>,
    #[arg(
        short = 'a',
        long = "acceptance",
        value_name = "CRITERION",
        action = clap::ArgAction::Append,
        help = "Acceptance criterion (repeatable)."
    )]
    pub(crate) acceptance: Vec<String>,
}

#[derive(Debug, Args)]
pub(crate) struct EditArgs {
    #[arg(value_name = "STORY_ID")]
    pub(crate) id: String,
    #[arg(short = 't', long, help = "New title.")]
    pub(crate) title: Option<String>,
    #[arg(short = 'd', long, help = "New description.")]
    pub(crate) description: Option<String>,
    #[arg(short = 'p', long, help = "New priority.")]
    pub(crate) priority: Option<i32>,
    #[arg(short = 'n', long, help = "New notes.")]
    pub(crate) notes: Option<String>,
}
