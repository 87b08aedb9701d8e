use std::path::Path;

use crate::cli::{AddArgs, EditArgs};
use crate::config::{Config, DEFAULT_CONFIG_YAML};
use crate::fs_util;
use crate::prd::{Prd, UserStory};
use crate::progress::Progress;
use crate::prompt;

const DEFAULT_CRITERIA: [&str; 2] = ["typecheck passes", "tests pass"];
const PROGRESS_BAR_WIDTH: usize = 40;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct InitReport {
    pub(crate) created: Vec<String>,
    pub(crate) skipped: Vec<String>,
}

/// Writes the config file and the three working files, leaving existing
/// files alone unless `force` is set.
pub(crate) fn init_project(
    config: &Config,
    config_path: &Path,
    branch: &str,
    force: bool,
    minimal: bool,
) -> Result<InitReport, String> {
    let mut report = InitReport::default();
    init_step(&mut report, config_path, force, |path| {
        fs_util::write(path, DEFAULT_CONFIG_YAML)
    })?;
    init_step(&mut report, &config.paths.prd, force, |path| {
        let mut prd = Prd::new(branch);
        if !minimal {
            prd.user_stories = Prd::default_example().user_stories;
        }
        prd.save(path)
    })?;
    init_step(&mut report, &config.paths.progress, force, |path| {
        Progress::create(path).map(|_| ())
    })?;
    init_step(&mut report, &config.paths.prompt, force, prompt::create_default)?;
    Ok(report)
}

fn init_step(
    report: &mut InitReport,
    path: &Path,
    force: bool,
    create: impl FnOnce(&Path) -> Result<(), String>,
) -> Result<(), String> {
    let label = path.display().to_string();
    if path.exists() && !force {
        report.skipped.push(label);
        return Ok(());
    }
    create(path)?;
    report.created.push(label);
    Ok(())
}

pub(crate) fn print_init_report(report: &InitReport) {
    println!("Initializing Ralph...\n");
    if !report.created.is_empty() {
        println!("Created:");
        for path in &report.created {
            println!("  - {}", path);
        }
    }
    if !report.skipped.is_empty() {
        println!("Skipped (already exists):");
        for path in &report.skipped {
            println!("  - {}", path);
        }
        println!("\n  Use --force to overwrite existing files");
    }
    println!("\nNext steps:");
    println!("  1. Edit the PRD to add your user stories");
    println!("  2. Customize the prompt template if needed");
    println!("  3. Run 'ralph status' to see your stories");
    println!("  4. Run 'ralph run' to start the loop");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StatusFilter {
    All,
    Pending,
    Done,
}

pub(crate) fn status(config: &Config, json: bool, filter: StatusFilter) -> Result<(), String> {
    if !config.paths.prd.is_file() {
        println!("No PRD found. Run 'ralph init' to get started.");
        return Ok(());
    }
    let prd = Prd::load(&config.paths.prd)?;
    if json {
        println!("{}", prd.to_json()?);
        return Ok(());
    }
    print!("{}", render_status(&prd, filter));
    Ok(())
}

pub(crate) fn render_status(prd: &Prd, filter: StatusFilter) -> String {
    let stats = prd.stats();
    let mut out = String::new();
    out.push_str("\n  Ralph Status\n\n");
    out.push_str(&format!("  Branch:  {}\n", prd.branch_name));
    out.push_str(&format!("  Total:   {} stories\n", stats.total));
    out.push_str(&format!("  Done:    {} stories\n", stats.completed));
    out.push_str(&format!("  Pending: {} stories\n", stats.pending));
    if stats.total > 0 {
        out.push_str(&format!(
            "\n  [{}] {}%\n",
            progress_bar(stats.completed, stats.total),
            stats.completed * 100 / stats.total
        ));
    }
    out.push('\n');

    let stories: Vec<&UserStory> = match filter {
        StatusFilter::All => prd.user_stories.iter().collect(),
        StatusFilter::Pending => prd.pending_stories().collect(),
        StatusFilter::Done => prd.completed_stories().collect(),
    };
    if stories.is_empty() {
        let message = match filter {
            StatusFilter::All => "No stories in PRD. Run 'ralph add' to add stories.",
            StatusFilter::Pending => "All stories complete!",
            StatusFilter::Done => "No completed stories yet.",
        };
        out.push_str(&format!("  {}\n", message));
        return out;
    }

    out.push_str("  Stories:\n");
    for story in stories {
        let mark = if story.passes { "x" } else { " " };
        out.push_str(&format!(
            "  [{}] [P{}] {}: {}\n",
            mark, story.priority, story.id, story.title
        ));
        if !story.passes {
            for criterion in &story.acceptance_criteria {
                out.push_str(&format!("      - {}\n", criterion));
            }
        }
    }
    if filter != StatusFilter::Done {
        if let Some(next) = prd.next_story() {
            out.push_str(&format!("\n  Next up: {} - {}\n", next.id, next.title));
        }
    }
    out
}

fn progress_bar(completed: usize, total: usize) -> String {
    let filled = completed * PROGRESS_BAR_WIDTH / total;
    format!(
        "{}{}",
        "#".repeat(filled),
        "-".repeat(PROGRESS_BAR_WIDTH - filled)
    )
}

fn load_existing_prd(config: &Config) -> Result<Prd, String> {
    if !config.paths.prd.is_file() {
        return Err(format!(
            "PRD not found at {}. Run 'ralph init' first.",
            config.paths.prd.display()
        ));
    }
    Prd::load(&config.paths.prd)
}

pub(crate) fn add_story(config: &Config, args: AddArgs) -> Result<UserStory, String> {
    if args.title.trim().is_empty() {
        return Err("title must not be empty (use -t or --title)".to_string());
    }
    let mut prd = load_existing_prd(config)?;
    let acceptance_criteria = if args.acceptance.is_empty() {
        DEFAULT_CRITERIA.iter().map(|c| c.to_string()).collect()
    } else {
        args.acceptance
    };
    let story = UserStory {
        id: String::new(),
        title: args.title,
        description: args.description,
        acceptance_criteria,
        priority: args
            .priority
            .unwrap_or(prd.user_stories.len() as i32 + 1),
        passes: false,
        notes: String::new(),
    };
    let id = prd.add_story(story);
    prd.save(&config.paths.prd)?;

    let added = prd
        .story(&id)
        .cloned()
        .ok_or_else(|| format!("story {} not found after adding it", id))?;
    println!("Added story: {}", added.id);
    println!("  Title: {}", added.title);
    println!("  Priority: {}", added.priority);
    println!(
        "  Acceptance Criteria: {} items",
        added.acceptance_criteria.len()
    );
    Ok(added)
}

pub(crate) fn edit_story(config: &Config, args: EditArgs) -> Result<(), String> {
    if args.title.is_none()
        && args.description.is_none()
        && args.priority.is_none()
        && args.notes.is_none()
    {
        return Err(
            "nothing to change; pass at least one of --title, --description, --priority, --notes"
                .to_string(),
        );
    }
    let mut prd = load_existing_prd(config)?;
    let mut story = prd
        .story(&args.id)
        .cloned()
        .ok_or_else(|| format!("story {} not found", args.id))?;
    if let Some(title) = args.title {
        story.title = title;
    }
    if let Some(description) = args.description {
        story.description = description;
    }
    if let Some(priority) = args.priority {
        story.priority = priority;
    }
    if let Some(notes) = args.notes {
        story.notes = notes;
    }
    let display = story.format_for_display();
    let id = story.id.clone();
    prd.update_story(story)?;
    prd.save(&config.paths.prd)?;

    println!("Updated story: {}", id);
    print!("{}", display);
    Ok(())
}

pub(crate) fn mark_done(config: &Config, id: &str) -> Result<(), String> {
    let mut prd = load_existing_prd(config)?;
    let story = prd
        .story(id)
        .cloned()
        .ok_or_else(|| format!("story {} not found", id))?;
    if story.passes {
        println!("Story {} is already marked as done", story.id);
        return Ok(());
    }
    prd.mark_done(id)?;
    prd.save(&config.paths.prd)?;

    let stats = prd.stats();
    println!("Marked {} as done: {}", story.id, story.title);
    println!("  Progress: {}/{} complete", stats.completed, stats.total);
    if prd.is_complete() {
        println!("\nAll stories complete!");
    }
    Ok(())
}

pub(crate) fn reset(config: &Config, id: Option<&str>, all: bool) -> Result<(), String> {
    let mut prd = load_existing_prd(config)?;
    if all {
        let count = prd.reset_all();
        prd.save(&config.paths.prd)?;
        if count == 0 {
            println!("No completed stories to reset");
        } else {
            println!("Reset {} stories to pending", count);
        }
        return Ok(());
    }

    let id = id.ok_or_else(|| "story ID required (or use --all)".to_string())?;
    let story = prd
        .story(id)
        .cloned()
        .ok_or_else(|| format!("story {} not found", id))?;
    if !story.passes {
        println!("Story {} is already pending", story.id);
        return Ok(());
    }
    prd.mark_pending(id)?;
    prd.save(&config.paths.prd)?;
    println!("Reset {} to pending: {}", story.id, story.title);
    Ok(())
}

pub(crate) fn delete(config: &Config, id: &str) -> Result<(), String> {
    let mut prd = load_existing_prd(config)?;
    let removed = prd.delete_story(id)?;
    prd.save(&config.paths.prd)?;
    println!("Deleted story: {} ({})", removed.id, removed.title);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogAction {
    Show { tail: Option<usize> },
    Append(String),
    Entry {
        story_id: String,
        files: Vec<String>,
        learnings: Vec<String>,
    },
    Patterns,
    Clear,
}

pub(crate) fn log(config: &Config, action: LogAction) -> Result<(), String> {
    let path = &config.paths.progress;
    if action == LogAction::Clear {
        Progress::create(path)?;
        println!("Progress log cleared");
        return Ok(());
    }
    if !Progress::exists(path) {
        println!("Progress log not found at {}", path.display());
        println!("Run 'ralph init' to create one");
        return Ok(());
    }

    let mut progress = Progress::load(path)?;
    match action {
        LogAction::Append(note) => {
            progress.append(&format!("\n**Note:** {}\n", note));
            progress.save()?;
            println!("Appended note to progress log");
        }
        LogAction::Entry {
            story_id,
            files,
            learnings,
        } => {
            let prd = load_existing_prd(config)?;
            let story = prd
                .story(&story_id)
                .ok_or_else(|| format!("story {} not found", story_id))?;
            progress.append_entry(&story.id, &story.title, &files, &learnings);
            progress.save()?;
            println!("Appended entry for {} to progress log", story.id);
        }
        LogAction::Patterns => {
            let patterns = progress.codebase_patterns();
            if patterns.is_empty() {
                println!("No codebase patterns found in progress log");
            } else {
                println!("## Codebase Patterns\n{}", patterns);
            }
        }
        LogAction::Show { tail: Some(lines) } => print!("{}", progress.tail(lines)),
        LogAction::Show { tail: None } => print!("{}", progress.content),
        LogAction::Clear => {}
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PromptAction {
    Show,
    Render,
    Reset,
}

pub(crate) fn prompt_template(config: &Config, action: PromptAction) -> Result<(), String> {
    let path = &config.paths.prompt;
    if action == PromptAction::Reset {
        prompt::create_default(path)?;
        println!("Reset prompt template to default");
        return Ok(());
    }
    if !path.is_file() {
        println!("Prompt template not found at {}", path.display());
        println!("Run 'ralph init' to create one, or 'ralph prompt --reset' to create the default");
        return Ok(());
    }

    let template = prompt::load(path)?;
    if action == PromptAction::Show {
        print!("{}", template);
        return Ok(());
    }
    let prd = load_existing_prd(config)?;
    let progress = Progress::load(&config.paths.progress)?;
    let data = prompt::build_template_data(&prd, &progress)?;
    let rendered = prompt::render(&template, &data).map_err(|err| err.to_string())?;
    print!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use std::fs;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> Config {
        Config {
            paths: PathsConfig {
                prd: dir.join(".ralph/prd.json"),
                progress: dir.join(".ralph/progress.txt"),
                prompt: dir.join(".ralph/prompt.md"),
            },
            ..Config::default()
        }
    }

    #[test]
    fn init_creates_then_skips_existing_files() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        let config_path = temp.path().join("ralph.yaml");

        let report =
            init_project(&config, &config_path, "ralph/login", false, false).expect("init");
        assert_eq!(report.created.len(), 4);
        assert!(report.skipped.is_empty());

        let prd = Prd::load(&config.paths.prd).expect("load prd");
        assert_eq!(prd.branch_name, "ralph/login");
        assert_eq!(prd.user_stories.len(), 1);
        assert_eq!(
            fs::read_to_string(&config_path).expect("read config"),
            DEFAULT_CONFIG_YAML
        );

        let again = init_project(&config, &config_path, "ralph/login", false, true).expect("init");
        assert!(again.created.is_empty());
        assert_eq!(again.skipped.len(), 4);
    }

    #[test]
    fn minimal_init_forced_overwrites_with_empty_prd() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        let config_path = temp.path().join("ralph.yaml");
        init_project(&config, &config_path, "a", false, false).expect("init");

        let report = init_project(&config, &config_path, "b", true, true).expect("force init");
        assert_eq!(report.created.len(), 4);
        let prd = Prd::load(&config.paths.prd).expect("load prd");
        assert_eq!(prd.branch_name, "b");
        assert!(prd.user_stories.is_empty());
    }

    #[test]
    fn add_defaults_priority_and_criteria() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        Prd::default_example().save(&config.paths.prd).expect("save");

        let added = add_story(
            &config,
            AddArgs {
                title: "Login form".to_string(),
                description: String::new(),
                priority: None,
                acceptance: Vec::new(),
            },
        )
        .expect("add");
        assert_eq!(added.id, "US-002");
        assert_eq!(added.priority, 2);
        assert_eq!(added.acceptance_criteria, vec!["typecheck passes", "tests pass"]);
    }

    #[test]
    fn edit_requires_a_change_and_an_existing_story() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        Prd::default_example().save(&config.paths.prd).expect("save");

        let empty = EditArgs {
            id: "US-001".to_string(),
            title: None,
            description: None,
            priority: None,
            notes: None,
        };
        assert!(edit_story(&config, empty).is_err());

        let missing = EditArgs {
            id: "US-404".to_string(),
            title: Some("x".to_string()),
            description: None,
            priority: None,
            notes: None,
        };
        let err = edit_story(&config, missing).expect_err("missing story");
        assert_eq!(err, "story US-404 not found");

        let rename = EditArgs {
            id: "us-001".to_string(),
            title: Some("Renamed".to_string()),
            description: None,
            priority: Some(5),
            notes: None,
        };
        edit_story(&config, rename).expect("edit");
        let story = Prd::load(&config.paths.prd)
            .expect("load")
            .story("US-001")
            .cloned()
            .expect("story");
        assert_eq!(story.title, "Renamed");
        assert_eq!(story.priority, 5);
    }

    #[test]
    fn done_reset_and_delete_round_through_the_file() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        Prd::default_example().save(&config.paths.prd).expect("save");

        mark_done(&config, "us-001").expect("done");
        assert!(Prd::load(&config.paths.prd).expect("load").is_complete());

        reset(&config, None, true).expect("reset all");
        assert!(!Prd::load(&config.paths.prd).expect("load").is_complete());

        delete(&config, "US-001").expect("delete");
        assert!(Prd::load(&config.paths.prd)
            .expect("load")
            .user_stories
            .is_empty());
        assert!(delete(&config, "US-001").is_err());
    }

    #[test]
    fn commands_need_an_initialized_prd() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        let err = mark_done(&config, "US-001").expect_err("no prd");
        assert!(err.contains("Run 'ralph init' first"), "got: {err}");
    }

    #[test]
    fn log_append_and_clear() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        Progress::create(&config.paths.progress).expect("create");

        log(&config, LogAction::Append("remember the cache".to_string())).expect("append");
        let content = fs::read_to_string(&config.paths.progress).expect("read");
        assert!(content.contains("**Note:** remember the cache"));

        log(&config, LogAction::Clear).expect("clear");
        let content = fs::read_to_string(&config.paths.progress).expect("read");
        assert!(!content.contains("remember the cache"));
    }

    #[test]
    fn log_entry_records_story_title_files_and_learnings() {
        let temp = TempDir::new().expect("temp dir");
        let config = config_in(temp.path());
        Prd::default_example().save(&config.paths.prd).expect("save");
        Progress::create(&config.paths.progress).expect("create");

        log(
            &config,
            LogAction::Entry {
                story_id: "us-001".to_string(),
                files: vec!["src/lib.rs".to_string()],
                learnings: vec!["run the linter first".to_string()],
            },
        )
        .expect("entry");
        let content = fs::read_to_string(&config.paths.progress).expect("read");
        assert!(content.contains(" - US-001\n**Example user story**"), "{content}");
        assert!(content.contains("Files changed:\n- src/lib.rs\n"), "{content}");
        assert!(content.contains("**Learnings:**\n- run the linter first\n"), "{content}");

        let err = log(
            &config,
            LogAction::Entry {
                story_id: "US-404".to_string(),
                files: Vec::new(),
                learnings: Vec::new(),
            },
        )
        .expect_err("unknown story");
        assert!(err.contains("US-404"), "got: {err}");
    }

    #[test]
    fn status_lists_pending_criteria_and_next_story() {
        let mut prd = Prd::default_example();
        prd.add_story(UserStory {
            title: "Shipped".to_string(),
            priority: 0,
            passes: true,
            ..UserStory::default()
        });

        let all = render_status(&prd, StatusFilter::All);
        assert!(all.contains("  Total:   2 stories"));
        assert!(all.contains("[ ] [P1] US-001: Example user story"));
        assert!(all.contains("      - typecheck passes"));
        assert!(all.contains("[x] [P0] US-002: Shipped"));
        assert!(all.contains("Next up: US-001 - Example user story"));
        assert!(all.contains("] 50%"));

        let done = render_status(&prd, StatusFilter::Done);
        assert!(!done.contains("US-001"));
        assert!(!done.contains("Next up"));
    }
}
