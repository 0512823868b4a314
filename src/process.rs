//! Centralized command execution with consistent error handling.
//!
//! Every external tool the pipeline touches (mount, umount, cp, unsquashfs)
//! goes through [`Cmd`]. Output is always captured. A non-zero exit is an
//! error unless the caller opts into [`Cmd::allow_fail`], which is how
//! teardown keeps going when an unmount fails.
//!
//! Children are registered in [`ChildRegistry::global`] while they run, so
//! a termination request can kill and reap them before the resources they
//! hold (the loop mount, the staging tree) are torn down.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{RespinError, Result};

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

static CHILDREN: ChildRegistry = ChildRegistry::new();

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

#[derive(Default)]
struct RegistryState {
    running: Vec<u32>,
    closed: bool,
}

/// PIDs of children a [`Cmd`] is currently waiting on.
///
/// Once shut down, no new tracked child may run: one that is spawned anyway
/// is killed before `run` returns.
#[derive(Default)]
pub struct ChildRegistry {
    state: Mutex<RegistryState>,
}

impl ChildRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                running: Vec::new(),
                closed: false,
            }),
        }
    }

    /// The registry every [`Cmd`] reports to.
    pub fn global() -> &'static ChildRegistry {
        &CHILDREN
    }

    /// Track `pid`. False once the registry has been shut down.
    pub fn register(&self, pid: u32) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.running.push(pid);
        true
    }

    /// Stop tracking `pid` after it was reaped.
    pub fn unregister(&self, pid: u32) {
        self.lock().running.retain(|p| *p != pid);
    }

    /// Currently tracked PIDs.
    pub fn running(&self) -> Vec<u32> {
        self.lock().running.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().closed
    }

    /// Refuse new children, then SIGKILL and reap every tracked one.
    /// Returns how many were stopped.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let running = std::mem::take(&mut state.running);
        for pid in &running {
            tracing::warn!("Stopping child process {}", pid);
            kill_and_reap(*pid);
        }
        running.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SIGKILL `pid` and wait until it is gone. The waiting `Cmd` may reap it
/// first; either way its open files are closed on return.
fn kill_and_reap(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory-safety preconditions. pid is a tracked
    // child, unregistered as soon as it has been reaped.
    unsafe { libc::kill(pid, libc::SIGKILL) };

    let deadline = Instant::now() + REAP_TIMEOUT;
    while Instant::now() < deadline {
        let mut status = 0;
        // SAFETY: status is a valid out-pointer; WNOHANG never blocks.
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        // pid: reaped here. -1: already reaped by the waiting thread.
        if rc != 0 {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    tracing::warn!("Child process {} did not exit after SIGKILL", pid);
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// If false, not registered and allowed after shutdown.
    tracked: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            allow_fail: false,
            tracked: true,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Allow non-zero exit codes without failing.
    ///
    /// The command still fails if it cannot be spawned at all.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run outside the child registry: not killed on shutdown and still
    /// allowed after it. For teardown's own commands.
    pub fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// The command line as it is logged.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let line = self.command_line();
        tracing::info!("Running: {}", line);

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(RespinError::Command {
                    command: self.error_prefix.unwrap_or_else(|| {
                        format!("Failed to execute '{}'. Is it installed?", self.program)
                    }),
                    code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                });
            }
        };

        let output = if self.tracked {
            wait_tracked(child, &line)?
        } else {
            child.wait_with_output()
        };
        let output = output.map_err(|e| RespinError::Command {
            command: format!("'{}' could not be waited on", line),
            code: -1,
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success() {
            tracing::debug!(code = result.code(), "{} finished", self.program);
            return Ok(result);
        }

        if self.allow_fail {
            tracing::debug!(
                code = result.code(),
                stderr = result.stderr_trimmed(),
                "{} failed (allowed)",
                self.program
            );
            return Ok(result);
        }

        // Surface everything the tool said before giving up on the run.
        if !result.stdout_trimmed().is_empty() {
            tracing::error!("{} stdout:\n{}", self.program, result.stdout_trimmed());
        }
        if !result.stderr_trimmed().is_empty() {
            tracing::error!("{} stderr:\n{}", self.program, result.stderr_trimmed());
        }

        let code = result.code();
        Err(RespinError::Command {
            command: self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", line)),
            code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

/// Wait for a registered child. A child spawned after shutdown is killed
/// straight away and reported as interrupted.
fn wait_tracked(
    mut child: Child,
    line: &str,
) -> Result<std::io::Result<std::process::Output>> {
    let registry = ChildRegistry::global();
    let pid = child.id();

    if !registry.register(pid) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(RespinError::Command {
            command: format!("'{}' interrupted", line),
            code: -1,
            stdout: String::new(),
            stderr: "exit requested".to_string(),
        });
    }

    let output = child.wait_with_output();
    registry.unregister(pid);
    Ok(output)
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Look a program up in PATH.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

// =============================================================================
// Tests
// =============================================================================
