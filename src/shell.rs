use shell_escape::unix::escape;
use std::env;
use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Upper bound on how long a child wait blocks before re-checking the
/// cancellation token.
pub(crate) const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) fn render_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|path| {
        let full = path.join(name);
        full.is_file() || full.is_symlink()
    })
}

/// Puts the spawned child in its own process group so termination reaches
/// every descendant it forks.
pub(crate) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Waits for `child` until it exits, the deadline passes, or `cancel` is
/// set. In the last two cases the child's process group is killed and
/// reaped before returning.
pub(crate) fn wait_for_exit(
    child: &mut Child,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> io::Result<WaitOutcome> {
    // A deadline too far out to represent is no deadline at all.
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
    loop {
        if cancel.is_cancelled() {
            terminate(child)?;
            return Ok(WaitOutcome::Cancelled);
        }

        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    terminate(child)?;
                    return Ok(WaitOutcome::TimedOut);
                }
                remaining.min(WAIT_POLL_INTERVAL)
            }
            None => WAIT_POLL_INTERVAL,
        };

        if let Some(status) = child.wait_timeout(slice)? {
            return Ok(WaitOutcome::Exited(status));
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`. The leader itself may
/// already be reaped; descendants that still hold its pipes are not.
pub(crate) fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    if let Ok(pgid) = i32::try_from(pid) {
        // The group may already be gone.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

pub(crate) fn terminate(child: &mut Child) -> io::Result<()> {
    kill_process_group(child.id());
    match child.kill() {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
        Err(err) => return Err(err),
    }
    child.wait()?;
    Ok(())
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn_bash(script: &str) -> Child {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script).stdin(Stdio::null());
        isolate_process_group(&mut cmd);
        cmd.spawn().expect("spawn bash")
    }

    #[test]
    fn render_args_quotes_only_when_needed() {
        let args = vec![
            "-p".to_string(),
            "fix the bug".to_string(),
            "it's".to_string(),
        ];
        assert_eq!(render_args(&args), "-p 'fix the bug' 'it'\\''s'");
        assert_eq!(render_args(&[]), "");
    }

    #[test]
    fn command_exists_checks_path_and_explicit_paths() {
        assert!(command_exists("bash"));
        assert!(!command_exists("ralph-definitely-not-a-command"));
        assert!(!command_exists("/nonexistent/dir/agent"));
    }

    #[test]
    fn wait_reports_exit_status() {
        let mut child = spawn_bash("exit 4");
        let outcome = wait_for_exit(&mut child, &CancelToken::new(), None).expect("wait");
        match outcome {
            WaitOutcome::Exited(status) => assert_eq!(exit_code(status), 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn wait_kills_on_deadline() {
        let mut child = spawn_bash("sleep 30");
        let started = Instant::now();
        let outcome = wait_for_exit(
            &mut child,
            &CancelToken::new(),
            Some(Duration::from_millis(200)),
        )
        .expect("wait");
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn unrepresentable_deadline_waits_without_panicking() {
        let mut child = spawn_bash("exit 0");
        let outcome = wait_for_exit(
            &mut child,
            &CancelToken::new(),
            Some(Duration::from_secs(u64::MAX)),
        )
        .expect("wait");
        assert!(matches!(outcome, WaitOutcome::Exited(_)));
    }

    #[test]
    fn wait_kills_on_cancel() {
        let mut child = spawn_bash("sleep 30");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        let outcome = wait_for_exit(&mut child, &cancel, None).expect("wait");
        handle.join().expect("join cancel thread");
        assert!(matches!(outcome, WaitOutcome::Cancelled));
    }
}
