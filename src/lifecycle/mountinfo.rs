//! OS mount table queries.
//!
//! The kernel's view in `/proc/self/mountinfo` is the source of truth for
//! whether something is mounted. In-memory handles can be stale when a
//! signal interrupts the pipeline between a mount command finishing and its
//! result being recorded.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RespinError, Result};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Whether a path is currently a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Mounted,
    NotMounted,
    /// The mount table could not be read.
    Unknown,
}

/// Parse the contents of a mountinfo file. Malformed lines are skipped.
///
/// ```text
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// (0)(1)(2)   (3)   (4)      (5)      (6)   (7) (8)   (9)       (10)
/// ```
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split_whitespace();
    let mount_id = fields.next()?.parse().ok()?;
    let _parent_id = fields.next()?;
    let _dev = fields.next()?;
    let _root = fields.next()?;
    let mount_point = PathBuf::from(unescape(fields.next()?));

    // Optional fields run until the "-" separator.
    let mut fields = fields.skip(1).skip_while(|f| *f != "-").skip(1);
    let fs_type = fields.next()?.to_string();
    let source = unescape(fields.next().unwrap_or("none"));

    Some(MountEntry {
        mount_id,
        mount_point,
        fs_type,
        source,
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read and parse the current process's mount table.
pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let content =
        fs::read_to_string(MOUNTINFO).map_err(|e| RespinError::io(MOUNTINFO, e))?;
    Ok(parse_mountinfo(&content))
}

/// Resolve symlinks so the path can be compared against mountinfo, which
/// always reports canonical paths.
fn comparable(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Ask the OS whether `path` is a mount point.
pub fn mount_state(path: &Path) -> MountState {
    match read_mount_table() {
        Ok(table) => {
            let target = comparable(path);
            if table.iter().any(|m| m.mount_point == target) {
                MountState::Mounted
            } else {
                MountState::NotMounted
            }
        }
        Err(e) => {
            tracing::warn!("Cannot read mount table: {}", e);
            MountState::Unknown
        }
    }
}

pub fn is_mounted(path: &Path) -> bool {
    mount_state(path) == MountState::Mounted
}

/// Mount points at or below `root` in `table`, deepest first, so they can be
/// unmounted in order.
pub fn mounts_below(table: &[MountEntry], root: &Path) -> Vec<PathBuf> {
    let root = comparable(root);
    let mut found: Vec<PathBuf> = table
        .iter()
        .filter(|m| m.mount_point.starts_with(&root))
        .map(|m| m.mount_point.clone())
        .collect();
    found.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    // Stacked mounts on the same point show up once per layer; keep them,
    // each needs its own unmount.
    found
}
