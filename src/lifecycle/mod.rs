//! Resource lifecycle manager.
//!
//! Owns the session's workdir and its loopback mount:
//! - [`Lifecycle::provision`] creates (or adopts) the workdir and its layout
//! - [`Lifecycle::acquire_mount`] / [`Lifecycle::release_mount`] manage the
//!   single image mount
//! - [`Lifecycle::teardown`] undoes all of it, idempotently
//!
//! Teardown is implemented once, in [`teardown::teardown_workspace`], and
//! shared with the exit coordinator and clean-only mode.

pub mod mountinfo;
pub mod teardown;
pub mod workspace;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::ExitCoordinator;
use crate::error::{RespinError, Result};
use crate::process::Cmd;

pub use teardown::{teardown_workspace, TeardownReport, TeardownStep, TeardownWarning};
pub use workspace::{SessionMarker, Workspace};

/// A live loopback mount created by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    source: PathBuf,
    target: PathBuf,
}

impl MountHandle {
    /// The mounted image file.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Where it is mounted.
    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Workdir and mount state for one session.
pub struct Lifecycle {
    config: Config,
    coordinator: Option<Arc<ExitCoordinator>>,
    workspace: Option<Arc<Workspace>>,
    mount: Option<MountHandle>,
}

impl Lifecycle {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            coordinator: None,
            workspace: None,
            mount: None,
        }
    }

    /// Register every provisioned workspace with `coordinator` so signal
    /// driven exits tear it down.
    pub fn with_coordinator(mut self, coordinator: Arc<ExitCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn workspace(&self) -> Option<&Arc<Workspace>> {
        self.workspace.as_ref()
    }

    pub fn mount_handle(&self) -> Option<&MountHandle> {
        self.mount.as_ref()
    }

    /// Create or adopt the workdir and its derived directories.
    ///
    /// A `requested` workdir is used as given (made absolute, created if
    /// missing) and is never deleted by teardown. Without one, a fresh
    /// `<tmp_dir>/<prefix>XXXXXX` directory is created and owned.
    pub fn provision(
        &mut self,
        requested: Option<&Path>,
        input_image: &Path,
    ) -> Result<Arc<Workspace>> {
        if let Some(existing) = &self.workspace {
            return Err(RespinError::provision(
                existing.workdir(),
                "workdir already provisioned for this session",
            ));
        }

        let workspace = match requested {
            Some(path) => Workspace::new(adopt_workdir(path)?, false),
            None => Workspace::new(self.create_owned_workdir()?, true),
        };
        let workspace = Arc::new(workspace);

        // Track the workdir before filling it in: a failure or a signal from
        // here on must still remove an owned directory.
        self.workspace = Some(Arc::clone(&workspace));
        if let Some(coordinator) = &self.coordinator {
            coordinator.watch(&workspace);
        }

        workspace.create_layout()?;
        workspace.write_marker(input_image)?;

        tracing::debug!(
            workdir = %workspace.workdir().display(),
            owned = workspace.owned(),
            "workdir provisioned"
        );
        Ok(workspace)
    }

    fn create_owned_workdir(&self) -> Result<PathBuf> {
        let parent = &self.config.tmp_dir;
        fs::create_dir_all(parent)
            .map_err(|e| RespinError::provision(parent.as_path(), e.to_string()))?;

        let dir = tempfile::Builder::new()
            .prefix(&self.config.workdir_prefix)
            .tempdir_in(parent)
            .map_err(|e| RespinError::provision(parent.as_path(), e.to_string()))?;
        Ok(dir.keep())
    }

    /// Loop-mount `image` read-only at the workspace mount point.
    ///
    /// Mounting twice is a caller bug and fails fast, whether the existing
    /// mount is known from this session's handle or only from the OS.
    pub fn acquire_mount(&mut self, image: &Path) -> Result<&MountHandle> {
        let workspace = self.workspace.as_ref().ok_or_else(|| {
            RespinError::mount(image, "no workdir provisioned before mounting")
        })?;
        let target = workspace.mount_point().to_path_buf();

        if let Some(handle) = &self.mount {
            return Err(RespinError::mount(
                &target,
                format!("{} is already mounted here", handle.source().display()),
            ));
        }
        if mountinfo::is_mounted(&target) {
            return Err(RespinError::mount(
                &target,
                "mount point is already in use according to the mount table",
            ));
        }

        Cmd::new("mount")
            .args(["-o", "loop,ro"])
            .arg_path(image)
            .arg_path(&target)
            .run()
            .map_err(|e| mount_error(&target, e))?;

        let handle = MountHandle {
            source: image.to_path_buf(),
            target,
        };
        Ok(&*self.mount.insert(handle))
    }

    /// Unmount the image once its contents have been staged.
    pub fn release_mount(&mut self) -> Result<()> {
        let Some(workspace) = &self.workspace else {
            return Ok(());
        };
        let target = workspace.mount_point().to_path_buf();

        if self.mount.is_none() && !mountinfo::is_mounted(&target) {
            return Ok(());
        }

        Cmd::new("umount")
            .arg_path(&target)
            .run()
            .map_err(|e| mount_error(&target, e))?;

        self.mount = None;
        Ok(())
    }

    /// Unmount and, if owned, delete the workdir. Safe to call repeatedly and
    /// before anything was provisioned. Never fails.
    pub fn teardown(&mut self) -> TeardownReport {
        self.mount = None;
        match &self.workspace {
            Some(workspace) => teardown_workspace(workspace),
            None => TeardownReport::default(),
        }
    }
}

/// Resolve a caller-supplied workdir and make sure it is a usable directory.
fn adopt_workdir(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .map_err(|e| RespinError::provision(path, e.to_string()))?;

    if path.exists() && !path.is_dir() {
        return Err(RespinError::provision(&path, "exists and is not a directory"));
    }
    fs::create_dir_all(&path).map_err(|e| RespinError::provision(&path, e.to_string()))?;
    Ok(path)
}

fn mount_error(target: &Path, err: RespinError) -> RespinError {
    match err {
        RespinError::Command { code, stderr, .. } => {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                RespinError::mount(target, format!("exit code {}", code))
            } else {
                RespinError::mount(target, format!("exit code {}: {}", code, stderr))
            }
        }
        other => other,
    }
}
