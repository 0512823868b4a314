//! Error taxonomy for the respin pipeline.
//!
//! Everything upstream of teardown is fail-fast: any of these errors aborts
//! the run, triggers teardown and ends the process with a non-zero status.
//! Teardown itself never produces a `RespinError`; it records
//! [`TeardownWarning`](crate::lifecycle::TeardownWarning)s instead.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a pipeline step.
#[derive(Debug, Error)]
pub enum RespinError {
    /// Bad input/output path or missing privilege. Raised before any
    /// resource is acquired.
    #[error("{message}")]
    Validation {
        /// Operator-facing description.
        message: String,
    },

    /// The workdir or one of its subdirectories could not be created or used.
    #[error("cannot provision workdir {}: {message}", .path.display())]
    Provision {
        /// Workdir (or subdirectory) being provisioned.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Loopback mount failed, or a second mount was attempted.
    #[error("mount at {} failed: {message}", .target.display())]
    Mount {
        /// Mount point.
        target: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// An external command exited non-zero (or could not be spawned).
    #[error("{}", format_command_failure(.command, .code, .stderr))]
    Command {
        /// Operator-facing prefix, usually the command line.
        command: String,
        /// Exit code, or -1 if the command was killed or never started.
        code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// An unpack/patch stage or the image author reported failure.
    #[error("stage '{stage}' failed: {message}")]
    Stage {
        /// Stage name.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The session marker could not be (de)serialized.
    #[error("session marker error: {source}")]
    Marker {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RespinError>;

impl RespinError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn provision(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Provision {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn mount(target: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Mount {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label for log lines and exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Provision { .. } => "provision",
            Self::Mount { .. } => "mount",
            Self::Command { .. } => "command",
            Self::Stage { .. } => "stage",
            Self::Io { .. } => "io",
            Self::Marker { .. } => "marker",
        }
    }
}

fn format_command_failure(command: &str, code: &i32, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("{} (exit code {})", command, code)
    } else {
        format!("{} (exit code {}):\n{}", command, code, stderr)
    }
}
