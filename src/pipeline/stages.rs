//! Stages that run on the staged tree, after the image mount is released.
//!
//! The driver only knows these through [`Stage`] and [`ImageAuthor`]; it never
//! looks at what they do to the tree.

use std::path::{Path, PathBuf};

use crate::error::{RespinError, Result};
use crate::process::{self, Cmd};

/// Paths a stage may work on.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// Writable copy of the image contents.
    pub staging_root: &'a Path,
    /// Where the root filesystem is unpacked.
    pub chroot_dir: &'a Path,
    /// Final image path.
    pub output_image: &'a Path,
}

/// One named unpack/patch step.
pub trait Stage {
    fn name(&self) -> &str;
    fn run(&self, ctx: &StageContext<'_>) -> Result<()>;
}

/// Produces the final image from the staging root.
pub trait ImageAuthor {
    fn name(&self) -> &str;
    fn author(&self, staging_root: &Path, output_image: &Path) -> Result<()>;
}

/// Where live media keep their compressed root filesystem, most common first.
pub const ROOT_IMAGE_CANDIDATES: &[&str] = &[
    "LiveOS/squashfs.img",
    "casper/filesystem.squashfs",
    "live/filesystem.squashfs",
    "images/install.img",
];

/// First known root filesystem image inside `staging_root`.
pub fn find_root_image(staging_root: &Path) -> Option<PathBuf> {
    ROOT_IMAGE_CANDIDATES
        .iter()
        .map(|rel| staging_root.join(rel))
        .find(|path| path.is_file())
}

/// Unpacks the squashfs root filesystem into the chroot directory.
///
/// Images without a recognizable root filesystem are passed through.
pub struct SquashfsUnpack;

impl Stage for SquashfsUnpack {
    fn name(&self) -> &str {
        "unpack-rootfs"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<()> {
        let Some(image) = find_root_image(ctx.staging_root) else {
            tracing::info!(
                "No squashfs root filesystem in {}, nothing to unpack",
                ctx.staging_root.display()
            );
            return Ok(());
        };

        if !process::exists("unsquashfs") {
            return Err(RespinError::stage(
                self.name(),
                format!(
                    "{} needs unsquashfs. Install squashfs-tools.",
                    image.display()
                ),
            ));
        }

        tracing::info!("Unpacking {} into {}", image.display(), ctx.chroot_dir.display());
        Cmd::new("unsquashfs")
            .args(["-f", "-no-progress", "-d"])
            .arg_path(ctx.chroot_dir)
            .arg_path(&image)
            .error_msg("unsquashfs failed")
            .run()?;
        Ok(())
    }
}

/// Leaves image authoring to a later tool.
///
/// Nothing is written to the output path; the staged tree is handed off
/// as-is.
pub struct DeferredAuthor;

impl ImageAuthor for DeferredAuthor {
    fn name(&self) -> &str {
        "author-image"
    }

    fn author(&self, staging_root: &Path, output_image: &Path) -> Result<()> {
        tracing::info!(
            "Image authoring is not configured; {} staged for {}",
            staging_root.display(),
            output_image.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn finds_first_known_root_image() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("casper")).unwrap();
        fs::create_dir_all(temp.path().join("LiveOS")).unwrap();
        fs::write(temp.path().join("casper/filesystem.squashfs"), b"hsqs").unwrap();
        fs::write(temp.path().join("LiveOS/squashfs.img"), b"hsqs").unwrap();

        assert_eq!(
            find_root_image(temp.path()),
            Some(temp.path().join("LiveOS/squashfs.img"))
        );
    }

    #[test]
    fn directory_named_like_image_is_ignored() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("live/filesystem.squashfs")).unwrap();
        assert_eq!(find_root_image(temp.path()), None);
    }

    #[test]
    fn unpack_without_root_image_is_skipped() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("out.img");
        let ctx = StageContext {
            staging_root: temp.path(),
            chroot_dir: temp.path(),
            output_image: &output,
        };
        SquashfsUnpack.run(&ctx).unwrap();
    }

    #[test]
    fn deferred_author_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("out.img");
        DeferredAuthor.author(temp.path(), &output).unwrap();
        assert!(!output.exists());
    }
}
