//! Workdir layout and the session marker.
//!
//! A workdir always contains three fixed children:
//!
//! ```text
//! <workdir>/
//! ├── iso-mount/            # loopback mount of the input image (read-only)
//! ├── iso-root/             # writable copy of the image contents
//! ├── chroot/               # unpacked root filesystem
//! └── .respin-session.json  # session marker
//! ```
//!
//! The marker records whether respin created the workdir itself. Clean-only
//! mode runs in a later process and has no other way to know whether a
//! directory is safe to delete.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{RespinError, Result};

/// Mount point for the input image.
pub const MOUNT_DIR: &str = "iso-mount";
/// Writable copy of the mounted image.
pub const STAGING_DIR: &str = "iso-root";
/// Unpacked root filesystem.
pub const CHROOT_DIR: &str = "chroot";
/// Session marker file name.
pub const MARKER_FILE: &str = ".respin-session.json";

/// Path layout of one session's workdir.
///
/// Immutable once built. Teardown only ever reads these paths, which is what
/// makes it safe to run from the signal thread while the pipeline is still
/// blocked in an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    workdir: PathBuf,
    mount_point: PathBuf,
    staging_root: PathBuf,
    chroot_dir: PathBuf,
    owned: bool,
}

impl Workspace {
    /// Derive the layout for `workdir`. Nothing is created on disk.
    pub fn new(workdir: impl Into<PathBuf>, owned: bool) -> Self {
        let workdir = workdir.into();
        Self {
            mount_point: workdir.join(MOUNT_DIR),
            staging_root: workdir.join(STAGING_DIR),
            chroot_dir: workdir.join(CHROOT_DIR),
            workdir,
            owned,
        }
    }

    /// Rebuild the layout of an existing workdir from its marker.
    ///
    /// Without a readable marker the workdir is treated as not owned, so it
    /// is never deleted.
    pub fn open(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let owned = match SessionMarker::read(&workdir) {
            Ok(Some(marker)) => marker.owned,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable session marker in {}: {}",
                    workdir.display(),
                    e
                );
                false
            }
        };
        Self::new(workdir, owned)
    }

    /// Find workdirs under `parent` named `<prefix>*` whose marker names
    /// `input_image`.
    pub fn discover(parent: &Path, prefix: &str, input_image: &Path) -> Vec<Self> {
        if !parent.is_dir() {
            return Vec::new();
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(parent)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.starts_with(prefix) {
                continue;
            }
            match SessionMarker::read(entry.path()) {
                Ok(Some(marker)) if marker.input_image == input_image => {
                    found.push(Self::new(entry.path(), marker.owned));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping {}: {}", entry.path().display(), e),
            }
        }
        found
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_dir
    }

    /// True if respin created the workdir and teardown may delete it.
    pub fn owned(&self) -> bool {
        self.owned
    }

    pub fn marker_path(&self) -> PathBuf {
        self.workdir.join(MARKER_FILE)
    }

    /// Create the three derived directories. Existing directories are fine.
    pub fn create_layout(&self) -> Result<()> {
        for dir in [&self.mount_point, &self.staging_root, &self.chroot_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| RespinError::provision(dir.as_path(), e.to_string()))?;
        }
        Ok(())
    }

    /// Write the session marker. Doubles as the writability check for the
    /// workdir.
    pub fn write_marker(&self, input_image: &Path) -> Result<()> {
        let marker = SessionMarker {
            owned: self.owned,
            input_image: input_image.to_path_buf(),
            pid: std::process::id(),
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        marker.write(&self.workdir).map_err(|e| {
            RespinError::provision(&self.workdir, format!("workdir is not writable: {}", e))
        })
    }
}

/// Contents of `.respin-session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    /// Whether respin created the workdir.
    pub owned: bool,
    /// Canonical path of the input image.
    pub input_image: PathBuf,
    /// PID of the process that provisioned the workdir.
    pub pid: u32,
    /// Provisioning time, seconds since the Unix epoch.
    pub created_unix: u64,
}

impl SessionMarker {
    /// Read the marker from `workdir`. `Ok(None)` if there is none.
    pub fn read(workdir: &Path) -> Result<Option<Self>> {
        let path = workdir.join(MARKER_FILE);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RespinError::io(path, e)),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    pub fn write(&self, workdir: &Path) -> Result<()> {
        let path = workdir.join(MARKER_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| RespinError::io(path, e))
    }
}
