use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn ralph(dir: &Path, args: &[&str]) -> Output {
    ralph_with_env(dir, args, &[])
}

fn ralph_with_env(dir: &Path, args: &[&str], vars: &[(&str, &str)]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .args(args)
        .current_dir(dir)
        .env_remove("RALPH_ACTIVE")
        .envs(vars.iter().copied())
        .stdin(Stdio::null())
        .output()
        .expect("run ralph")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success, got {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        stdout(output),
        stderr(output)
    );
}

#[cfg(unix)]
fn write_agent(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write agent");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod agent");
    path.display().to_string()
}

fn write_config(dir: &Path, agent: &str, timeout: &str) {
    fs::write(
        dir.join("ralph.yaml"),
        format!(
            "agent:\n  type: custom\n  command: {agent}\n  timeout: {timeout}\n\
             loop:\n  maxIterations: 3\n  sleepBetween: 10ms\n"
        ),
    )
    .expect("write config");
}

#[test]
fn init_creates_project_files_and_skips_existing() {
    let temp = TempDir::new().expect("temp dir");

    let output = ralph(temp.path(), &["init", "--branch", "ralph/demo"]);
    assert_success(&output);
    assert!(stdout(&output).contains("Created:"));
    for file in [
        "ralph.yaml",
        ".ralph/prd.json",
        ".ralph/progress.txt",
        ".ralph/prompt.md",
    ] {
        assert!(temp.path().join(file).is_file(), "missing {file}");
    }
    let prd = fs::read_to_string(temp.path().join(".ralph/prd.json")).expect("prd");
    assert!(prd.contains("\"branchName\": \"ralph/demo\""), "{prd}");

    let again = ralph(temp.path(), &["init"]);
    assert_success(&again);
    assert!(stdout(&again).contains("Skipped (already exists):"));
}

#[test]
fn stop_reports_not_running() {
    let temp = TempDir::new().expect("temp dir");
    let output = ralph(temp.path(), &["stop"]);
    assert_success(&output);
    assert!(stdout(&output).contains("Ralph is not running"));
}

#[test]
fn run_without_init_fails() {
    let temp = TempDir::new().expect("temp dir");
    let output = ralph(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("Run 'ralph init' first."),
        "{}",
        stderr(&output)
    );
}

#[test]
fn story_commands_update_status() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(
        temp.path(),
        &["add", "--title", "Add login", "-a", "form renders"],
    ));
    assert_success(&ralph(temp.path(), &["add", "--title", "Add logout"]));
    assert_success(&ralph(temp.path(), &["done", "US-001"]));

    let status = ralph(temp.path(), &["status"]);
    assert_success(&status);
    let text = stdout(&status);
    assert!(text.contains("Total:   2 stories"), "{text}");
    assert!(text.contains("Done:    1 stories"), "{text}");
    assert!(text.contains("Next up: US-002 - Add logout"), "{text}");

    let missing = ralph(temp.path(), &["done", "US-404"]);
    assert_eq!(missing.status.code(), Some(1));
    assert!(stderr(&missing).contains("story US-404 not found"));
}

#[test]
fn log_story_entry_and_config_warnings() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(temp.path(), &["add", "--title", "Add login"]));

    let entry = ralph(
        temp.path(),
        &["log", "--story", "US-001", "-f", "src/login.rs", "-l", "forms need csrf"],
    );
    assert_success(&entry);
    let log = stdout(&ralph(temp.path(), &["log"]));
    assert!(log.contains("**Add login**"), "{log}");
    assert!(log.contains("- src/login.rs"), "{log}");
    assert!(log.contains("- forms need csrf"), "{log}");

    let orphan = ralph(temp.path(), &["log", "-f", "src/login.rs"]);
    assert_eq!(orphan.status.code(), Some(2));

    let config = temp.path().join("ralph.yaml");
    let mut contents = fs::read_to_string(&config).expect("read config");
    contents.push_str("\nnotifications: true\n");
    fs::write(&config, contents).expect("write config");
    let status = ralph(temp.path(), &["status"]);
    assert_success(&status);
    assert!(
        stderr(&status).contains("Warning: unknown config key: notifications"),
        "{}",
        stderr(&status)
    );
}

#[cfg(unix)]
#[test]
fn environment_overrides_sit_between_file_and_flags() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(temp.path(), &["add", "--title", "Never done"]));
    let agent = write_agent(temp.path(), "echo nothing to report");
    write_config(temp.path(), &agent, "1m");
    let env_one = [("RALPH_LOOP_MAXITERATIONS", "1")];

    let output = ralph_with_env(temp.path(), &["run", "--quiet"], &env_one);
    assert_success(&output);
    assert!(stdout(&output).contains("Max iterations reached (1)"), "{}", stdout(&output));

    let output = ralph_with_env(
        temp.path(),
        &["run", "--quiet", "--max-iterations", "2"],
        &env_one,
    );
    assert_success(&output);
    assert!(stdout(&output).contains("Max iterations reached (2)"), "{}", stdout(&output));

    let nested = [("RALPH_LOOP_MAXITERATIONS", "1"), ("RALPH_ACTIVE", "true")];
    let output = ralph_with_env(temp.path(), &["run", "--quiet"], &nested);
    assert_success(&output);
    assert!(stdout(&output).contains("Max iterations reached (3)"), "{}", stdout(&output));
}

#[test]
fn invalid_arguments_exit_with_usage_error() {
    let temp = TempDir::new().expect("temp dir");
    let output = ralph(temp.path(), &["run", "--max-iterations", "0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[cfg(unix)]
#[test]
fn run_completes_when_agent_prints_marker() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(temp.path(), &["add", "--title", "Only story"]));
    let agent = write_agent(
        temp.path(),
        "echo \"working on $RALPH_STORY_ID\"\necho '<promise>COMPLETE</promise>'",
    );
    write_config(temp.path(), &agent, "1m");

    let dry = ralph(temp.path(), &["run", "--dry-run"]);
    assert_success(&dry);
    assert!(stdout(&dry).contains("Type:    custom"), "{}", stdout(&dry));

    let output = ralph(temp.path(), &["run"]);
    assert_success(&output);
    let text = stdout(&output);
    assert!(text.contains("working on US-001"), "{text}");
    assert!(text.contains("All stories complete!"), "{text}");
    assert!(!temp.path().join(".ralph.pid").exists());
}

#[cfg(unix)]
#[test]
fn run_stops_after_max_iterations_without_marker() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(temp.path(), &["add", "--title", "Never done"]));
    let agent = write_agent(temp.path(), "echo nothing to report");
    write_config(temp.path(), &agent, "1m");

    let output = ralph(temp.path(), &["run", "--quiet", "--max-iterations", "2"]);
    assert_success(&output);
    assert!(
        stdout(&output).contains("Max iterations reached (2)"),
        "{}",
        stdout(&output)
    );
}

#[cfg(unix)]
#[test]
fn stop_terminates_running_loop() {
    let temp = TempDir::new().expect("temp dir");
    assert_success(&ralph(temp.path(), &["init", "--minimal"]));
    assert_success(&ralph(temp.path(), &["add", "--title", "Slow story"]));
    let agent = write_agent(temp.path(), "sleep 30");
    write_config(temp.path(), &agent, "5m");

    let child = Command::new(env!("CARGO_BIN_EXE_ralph"))
        .args(["run", "--quiet"])
        .current_dir(temp.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn ralph run");
    // Reap in the background so the stopped loop does not linger as a zombie.
    let runner = thread::spawn(move || child.wait_with_output());

    let pid_path = temp.path().join(".ralph.pid");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pid_path.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(pid_path.exists(), "ralph run never wrote its PID file");

    let second = ralph(temp.path(), &["run", "--quiet"]);
    assert_eq!(second.status.code(), Some(1));
    assert!(stderr(&second).contains("already running"), "{}", stderr(&second));

    let stop = ralph(temp.path(), &["stop"]);
    assert_success(&stop);
    assert!(
        stdout(&stop).contains("Ralph stopped successfully"),
        "{}",
        stdout(&stop)
    );

    let output = runner.join().expect("runner thread").expect("wait ralph");
    assert_eq!(output.status.code(), Some(130));
    assert!(!pid_path.exists());
}
