use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::format_duration;
use crate::hooks::HookPhase;

#[derive(Debug, Error)]
pub(crate) enum RalphError {
    #[error("ralph is not running")]
    NotRunning,

    #[error("ralph is already running: PID {0}")]
    AlreadyRunning(i32),

    #[error("agent launch failed: {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{label} timed out after {}", format_duration(.timeout))]
    Timeout { label: String, timeout: Duration },

    #[error("{label} exited with code {code}")]
    NonZeroExit { label: String, code: i32 },

    #[error("{phase} hook failed: {command}: {reason}")]
    HookFailure {
        phase: HookPhase,
        command: String,
        reason: String,
    },

    #[error("failed to reload {what}: {reason}")]
    StateReload { what: &'static str, reason: String },

    #[error("failed to render prompt: {0}")]
    RenderFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("failed to signal PID {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl RalphError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Fatal errors stop the iteration loop; the rest describe agent outcomes
    /// the loop tolerates.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NonZeroExit { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }
}
