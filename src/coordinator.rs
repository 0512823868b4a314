//! Signal and exit coordination.
//!
//! A single finalizer tears down the current workspace at most once per
//! process. It is reached three ways:
//! - a [`FinalizeGuard`] going out of scope (normal completion, `?` early
//!   return, panic unwinding)
//! - [`ExitCoordinator::request_exit`]
//! - SIGINT/SIGTERM/SIGHUP, via the `ctrlc` handler thread, which requests
//!   exit with [`SIGNAL_EXIT_CODE`]
//!
//! An exit request first kills and reaps the command the pipeline is
//! waiting on, so nothing holds the mount or writes into the workdir while
//! it is torn down.
//!
//! The OS-level signal handler installed by `ctrlc` only wakes a dedicated
//! thread; teardown runs on that thread, never in signal context. The
//! coordinator holds only a `Weak` reference to the workspace. It never
//! creates or deletes session state itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::lifecycle::{teardown_workspace, TeardownReport, Workspace};
use crate::process;

/// Exit status used when a termination signal ends the run.
pub const SIGNAL_EXIT_CODE: i32 = 130;

static GLOBAL: OnceLock<Arc<ExitCoordinator>> = OnceLock::new();

#[derive(Default)]
struct FinalizerState {
    target: Option<Weak<Workspace>>,
    finalized: bool,
}

/// Process-wide owner of the teardown finalizer.
#[derive(Default)]
pub struct ExitCoordinator {
    state: Mutex<FinalizerState>,
    exiting: AtomicBool,
    handler_installed: AtomicBool,
}

impl ExitCoordinator {
    /// A standalone coordinator. The binary uses [`ExitCoordinator::global`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The coordinator shared with the signal handler.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    /// Route SIGINT, SIGTERM and SIGHUP to [`ExitCoordinator::request_exit`].
    /// Installing twice is a no-op.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<(), ctrlc::Error> {
        if self.handler_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let coordinator = Arc::clone(self);
        ctrlc::set_handler(move || coordinator.on_signal()).inspect_err(|_| {
            self.handler_installed.store(false, Ordering::SeqCst);
        })
    }

    /// Make `workspace` the one torn down by the finalizer.
    pub fn watch(&self, workspace: &Arc<Workspace>) {
        let mut state = self.lock();
        if state.finalized {
            tracing::warn!(
                "Finalizer already ran; {} will not be cleaned up automatically",
                workspace.workdir().display()
            );
        }
        state.target = Some(Arc::downgrade(workspace));
    }

    /// Tear down the watched workspace if that has not happened yet.
    ///
    /// Returns the report of the run that did the work, `None` for every
    /// other call. A caller arriving while teardown is in progress on another
    /// thread blocks until it is done.
    pub fn finalize(&self) -> Option<TeardownReport> {
        let mut state = self.lock();
        if state.finalized {
            return None;
        }
        let workspace = state.target.as_ref().and_then(Weak::upgrade)?;
        state.finalized = true;
        Some(teardown_workspace(&workspace))
    }

    /// True once teardown has run.
    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// True once a signal (or explicit request) asked the process to exit.
    pub fn exit_requested(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Guard that finalizes on drop.
    pub fn guard(self: &Arc<Self>) -> FinalizeGuard {
        FinalizeGuard {
            coordinator: Arc::clone(self),
            armed: true,
        }
    }

    /// Stop in-flight commands, finalize, then exit the process with `code`.
    ///
    /// Only the first request acts. A later one, from another signal or
    /// thread, waits for the first to exit the process.
    pub fn request_exit(&self, code: i32) -> ! {
        if self.exiting.swap(true, Ordering::SeqCst) {
            tracing::warn!("Exit already in progress; ignoring exit request ({})", code);
            loop {
                std::thread::park();
            }
        }
        // No child may hold the mount or write into the workdir once
        // teardown starts.
        process::ChildRegistry::global().shutdown();
        self.finalize();
        std::process::exit(code)
    }

    fn on_signal(&self) {
        tracing::warn!("Termination signal received, aborting run");
        self.request_exit(SIGNAL_EXIT_CODE)
    }

    fn lock(&self) -> MutexGuard<'_, FinalizerState> {
        // Teardown never panics, but a panicking caller must not disable
        // cleanup for everyone else.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped finalizer bound to a session.
#[must_use = "dropping the guard immediately runs teardown"]
pub struct FinalizeGuard {
    coordinator: Arc<ExitCoordinator>,
    armed: bool,
}

impl FinalizeGuard {
    /// Finalize now and return the teardown report, if this call did the work.
    pub fn finish(mut self) -> Option<TeardownReport> {
        self.armed = false;
        self.coordinator.finalize()
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    fn owned_workspace(temp: &TempDir) -> Arc<Workspace> {
        let ws = Workspace::new(temp.path().join("respin-test"), true);
        ws.create_layout().unwrap();
        ws.write_marker(Path::new("/srv/base.iso")).unwrap();
        Arc::new(ws)
    }

    #[test]
    fn finalize_without_workspace_is_noop() {
        let coordinator = ExitCoordinator::new();
        assert!(coordinator.finalize().is_none());
        assert!(!coordinator.is_finalized());
    }

    #[test]
    fn finalize_runs_teardown_once() {
        let temp = TempDir::new().unwrap();
        let ws = owned_workspace(&temp);
        let coordinator = ExitCoordinator::new();
        coordinator.watch(&ws);

        let first = coordinator.finalize().expect("first call tears down");
        assert!(first.removed_workdir);
        assert!(!ws.workdir().exists());

        assert!(coordinator.finalize().is_none());
        assert!(coordinator.is_finalized());
    }

    #[test]
    fn guard_drop_finalizes() {
        let temp = TempDir::new().unwrap();
        let ws = owned_workspace(&temp);
        let coordinator = ExitCoordinator::new();
        coordinator.watch(&ws);

        {
            let _guard = coordinator.guard();
        }

        assert!(coordinator.is_finalized());
        assert!(!ws.workdir().exists());
    }

    #[test]
    fn guard_finish_returns_report() {
        let temp = TempDir::new().unwrap();
        let ws = owned_workspace(&temp);
        let coordinator = ExitCoordinator::new();
        coordinator.watch(&ws);

        let report = coordinator.guard().finish().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn dropped_workspace_is_not_resurrected() {
        let temp = TempDir::new().unwrap();
        let ws = owned_workspace(&temp);
        let workdir = ws.workdir().to_path_buf();
        let coordinator = ExitCoordinator::new();
        coordinator.watch(&ws);
        drop(ws);

        assert!(coordinator.finalize().is_none());
        assert!(workdir.exists());
    }

    #[test]
    fn concurrent_finalize_tears_down_exactly_once() {
        let temp = TempDir::new().unwrap();
        let ws = owned_workspace(&temp);
        let coordinator = ExitCoordinator::new();
        coordinator.watch(&ws);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || coordinator.finalize().is_some())
            })
            .collect();
        let ran = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ran| *ran)
            .count();

        assert_eq!(ran, 1);
        assert!(!ws.workdir().exists());
    }

    #[test]
    fn exit_not_requested_by_default() {
        assert!(!ExitCoordinator::new().exit_requested());
    }
}
