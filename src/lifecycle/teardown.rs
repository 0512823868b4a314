//! Best-effort teardown of a workspace.
//!
//! Teardown is the last line of defense: it usually runs while the process
//! is already failing or being signalled. Every step is independent, every
//! failure becomes a [`TeardownWarning`], and nothing here returns an error
//! or panics. Running it again after it succeeded is a no-op.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::mountinfo;
use super::workspace::Workspace;
use crate::process::Cmd;

/// Upper bound on unmount rounds. Each round unmounts everything currently
/// listed inside the derived directories; stacked mounts need one round per
/// layer.
const MAX_UNMOUNT_ROUNDS: usize = 4;

/// Which teardown step produced a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Unmount,
    Remove,
}

/// A teardown step that did not complete. Logged, never escalated.
#[derive(Debug, Clone)]
pub struct TeardownWarning {
    pub step: TeardownStep,
    pub path: PathBuf,
    pub message: String,
}

/// What a teardown run did.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Mount points that were unmounted.
    pub unmounted: Vec<PathBuf>,
    /// True if an owned workdir was removed (or was already gone).
    pub removed_workdir: bool,
    pub warnings: Vec<TeardownWarning>,
}

impl TeardownReport {
    /// True if every step completed.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, step: TeardownStep, path: &Path, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Cleanup: {} ({})", message, path.display());
        self.warnings.push(TeardownWarning {
            step,
            path: path.to_path_buf(),
            message,
        });
    }
}

/// Unmount whatever the OS still lists inside the workspace, then remove the
/// workdir if it is owned.
pub fn teardown_workspace(workspace: &Workspace) -> TeardownReport {
    tracing::info!("Running cleanup for {}...", workspace.workdir().display());
    let mut report = TeardownReport::default();

    unmount_all(workspace, &mut report);

    if workspace.owned() {
        remove_tree(workspace.workdir(), &mut report);
    } else {
        tracing::info!(
            "Leaving caller-supplied workdir {} in place",
            workspace.workdir().display()
        );
        match fs::remove_file(workspace.marker_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => report.warn(
                TeardownStep::Remove,
                &workspace.marker_path(),
                format!("cannot remove session marker: {}", e),
            ),
        }
    }

    if report.is_clean() {
        tracing::info!("Cleanup complete.");
    } else {
        tracing::warn!(
            "Cleanup finished with {} warning(s)",
            report.warnings.len()
        );
    }
    report
}

fn unmount_all(workspace: &Workspace, report: &mut TeardownReport) {
    for _ in 0..MAX_UNMOUNT_ROUNDS {
        let targets = match mountinfo::read_mount_table() {
            Ok(table) => owned_mounts(&table, workspace),
            Err(e) => {
                // Without a mount table, attempt the one mount we know about
                // and let umount decide.
                tracing::warn!("Cannot read mount table, unmounting blindly: {}", e);
                if workspace.mount_point().exists() {
                    unmount_one(workspace.mount_point(), report);
                }
                return;
            }
        };

        if targets.is_empty() {
            return;
        }

        let mut progressed = false;
        for target in &targets {
            progressed |= unmount_one(target, report);
        }
        if !progressed {
            break;
        }
    }

    if mountinfo::is_mounted(workspace.mount_point()) {
        report.warn(
            TeardownStep::Unmount,
            workspace.mount_point(),
            "mount point is still mounted",
        );
    }
}

/// Mounts this session may have created: the image mount and anything a
/// stage mounted inside the derived directories. Never the whole workdir, which
/// may be a caller-supplied directory with unrelated mounts below it.
fn owned_mounts(table: &[mountinfo::MountEntry], workspace: &Workspace) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = [
        workspace.mount_point(),
        workspace.staging_root(),
        workspace.chroot_dir(),
    ]
    .into_iter()
    .flat_map(|dir| mountinfo::mounts_below(table, dir))
    .collect();
    targets.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
    targets
}

/// Plain unmount first, lazy+force if that fails. Returns true if either
/// succeeded.
fn unmount_one(target: &Path, report: &mut TeardownReport) -> bool {
    let plain = Cmd::new("umount")
        .arg_path(target)
        .allow_fail()
        .untracked()
        .run();
    if matches!(&plain, Ok(r) if r.success()) {
        report.unmounted.push(target.to_path_buf());
        return true;
    }

    match Cmd::new("umount")
        .args(["-l", "-f"])
        .arg_path(target)
        .allow_fail()
        .untracked()
        .run()
    {
        Ok(r) if r.success() => {
            report.unmounted.push(target.to_path_buf());
            true
        }
        Ok(r) => {
            report.warn(
                TeardownStep::Unmount,
                target,
                format!("umount -l -f exited {}: {}", r.code(), r.stderr_trimmed()),
            );
            false
        }
        Err(e) => {
            report.warn(TeardownStep::Unmount, target, e.to_string());
            false
        }
    }
}

/// Remove `root` entry by entry, deepest first. Never crosses into another
/// filesystem, so a mount that survived unmounting is left alone instead of
/// having its contents deleted.
fn remove_tree(root: &Path, report: &mut TeardownReport) {
    if fs::symlink_metadata(root).is_err() {
        report.removed_workdir = true;
        return;
    }

    tracing::info!("Removing temporary workdir {}", root.display());

    for entry in WalkDir::new(root)
        .contents_first(true)
        .same_file_system(true)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                report.warn(TeardownStep::Remove, &path, e.to_string());
                continue;
            }
        };

        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };

        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            // A parent of something that could not be removed; the child
            // already produced a warning.
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {}
            Err(e) => report.warn(TeardownStep::Remove, entry.path(), e.to_string()),
        }
    }

    report.removed_workdir = fs::symlink_metadata(root).is_err();
    if !report.removed_workdir {
        report.warn(
            TeardownStep::Remove,
            root,
            "workdir could not be removed completely",
        );
    }
}
