use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only transition log for a supervisor run.
///
/// Each line is `<utc timestamp> <event> key=value ...`. A logger without a
/// path swallows everything, and the first write failure disables it for the
/// rest of the run after a single warning on stderr.
#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    disabled: AtomicBool,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn log_transition(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} {}\n", ts, sanitize_log_value(message));
        if let Err(err) = append_line(path, &line) {
            self.disable_with_warning(path, &err);
        }
    }

    /// Logs `event` followed by sanitized `key=value` pairs.
    pub(crate) fn log_event(&self, event: &str, fields: &[(&str, &str)]) {
        if self.path.is_none() {
            return;
        }
        let mut message = event.to_string();
        for (key, value) in fields {
            message.push(' ');
            message.push_str(key);
            message.push('=');
            message.push_str(&sanitize_log_value(value));
        }
        self.log_transition(&message);
    }

    fn disable_with_warning(&self, path: &Path, err: &io::Error) {
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Written through the locked handle so fd-redirected stderr captures it.
            let mut stderr = io::stderr().lock();
            let _ = writeln!(
                stderr,
                "Warning: transition logging disabled log_path={} io_error={}",
                path.display(),
                err
            );
        }
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn event_fields_are_sanitized_onto_one_line() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("ralph.log");
        let logger = Logger::new(Some(path.clone()));

        logger.log_event("iteration_end", &[("iteration", "2"), ("error", "a\nb")]);

        let contents = fs::read_to_string(&path).expect("read log");
        assert_eq!(contents.lines().count(), 1);
        assert!(
            contents.trim_end().ends_with("iteration_end iteration=2 error=a\\nb"),
            "got: {contents}"
        );
    }

    #[test]
    fn unwritable_path_disables_logger() {
        let temp = TempDir::new().expect("temp dir");
        let logger = Logger::new(Some(temp.path().join("missing").join("ralph.log")));

        logger.log_transition("first");
        logger.log_transition("second");

        assert!(logger.disabled.load(Ordering::Relaxed));
    }
}
