//! Input validation: turning CLI options into a [`BuildRequest`].
//!
//! Everything here is read-only. A bad argument must never leave a workdir
//! or a mount behind, so all checks run before provisioning.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RespinError, Result};

/// Extension the output image must carry.
pub const OUTPUT_EXTENSION: &str = "img";
/// Appended to the input's file stem to name the default output.
pub const DEFAULT_OUTPUT_SUFFIX: &str = "-custom.img";

/// What the caller asked for, unvalidated.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub clean_only: bool,
}

/// A validated build request. All paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Canonical path of an existing regular file.
    pub input_image: PathBuf,
    /// Ends in `.img`; parent directory exists.
    pub output_image: PathBuf,
    /// Caller-supplied workdir, if any.
    pub workdir: Option<PathBuf>,
}

impl BuildRequest {
    /// Validate `options` for a build.
    pub fn resolve(options: &BuildOptions) -> Result<Self> {
        let input_image = resolve_input(&options.input)?;

        let output_image = match &options.output {
            Some(output) => absolute(output)?,
            None => default_output_for(&input_image),
        };
        validate_output(&input_image, &output_image)?;

        let workdir = match &options.workdir {
            Some(dir) => {
                let dir = absolute(dir)?;
                if dir.exists() && !dir.is_dir() {
                    return Err(RespinError::validation(format!(
                        "Workdir exists and is not a directory: {}",
                        dir.display()
                    )));
                }
                Some(dir)
            }
            None => None,
        };

        Ok(Self {
            input_image,
            output_image,
            workdir,
        })
    }
}

/// Resolve and check the input image: it must exist and be a regular file.
pub fn resolve_input(input: &Path) -> Result<PathBuf> {
    if input.as_os_str().is_empty() {
        return Err(RespinError::validation("Input ISO is required."));
    }

    let input = fs::canonicalize(input).map_err(|_| {
        RespinError::validation(format!("Input ISO not found: {}", display_abs(input)))
    })?;

    if !input.is_file() {
        return Err(RespinError::validation(format!(
            "Input ISO is not a regular file: {}",
            input.display()
        )));
    }
    Ok(input)
}

/// `<dir of input>/<stem of input>-custom.img`.
pub fn default_output_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .unwrap_or_else(|| OsStr::new("image"))
        .to_string_lossy();
    let name = format!("{}{}", stem, DEFAULT_OUTPUT_SUFFIX);
    match input.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// True if `path` ends in `.img` (ASCII case-insensitive).
pub fn has_required_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case(OUTPUT_EXTENSION))
}

fn validate_output(input: &Path, output: &Path) -> Result<()> {
    if !has_required_extension(output) {
        return Err(RespinError::validation(format!(
            "Output must end in .{}: {}",
            OUTPUT_EXTENSION,
            output.display()
        )));
    }

    if output == input {
        return Err(RespinError::validation(
            "Output image must not overwrite the input image.",
        ));
    }

    match output.parent() {
        Some(parent) if parent.is_dir() => Ok(()),
        _ => Err(RespinError::validation(format!(
            "Output directory does not exist: {}",
            output
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ))),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| {
        RespinError::validation(format!(
            "Failed to resolve absolute path {}: {}",
            path.display(),
            e
        ))
    })
}

fn display_abs(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(input: &Path) -> BuildOptions {
        BuildOptions {
            input: input.to_path_buf(),
            ..BuildOptions::default()
        }
    }

    #[test]
    fn default_output_sits_next_to_input() {
        assert_eq!(
            default_output_for(Path::new("/srv/isos/base.iso")),
            PathBuf::from("/srv/isos/base-custom.img")
        );
    }

    #[test]
    fn extension_check_is_case_insensitive_and_strict() {
        assert!(has_required_extension(Path::new("/o/out.img")));
        assert!(has_required_extension(Path::new("/o/OUT.IMG")));
        assert!(!has_required_extension(Path::new("/o/out.iso")));
        assert!(!has_required_extension(Path::new("/o/out.img.gz")));
        assert!(!has_required_extension(Path::new("/o/img")));
    }

    #[test]
    fn resolves_defaults() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("base.iso");
        fs::write(&input, b"iso").unwrap();

        let request = BuildRequest::resolve(&options(&input)).unwrap();
        let canonical = fs::canonicalize(&input).unwrap();
        assert_eq!(request.input_image, canonical);
        assert_eq!(
            request.output_image,
            canonical.parent().unwrap().join("base-custom.img")
        );
        assert!(request.workdir.is_none());
    }

    #[test]
    fn missing_input_is_rejected() {
        let err = BuildRequest::resolve(&options(Path::new("/nonexistent_path_12345.iso")))
            .unwrap_err();
        assert!(err.to_string().contains("Input ISO not found"));
    }

    #[test]
    fn directory_input_is_rejected() {
        let temp = TempDir::new().unwrap();
        let err = BuildRequest::resolve(&options(temp.path())).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn wrong_output_suffix_is_rejected() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("base.iso");
        fs::write(&input, b"iso").unwrap();

        let mut opts = options(&input);
        opts.output = Some(temp.path().join("out.iso"));
        let err = BuildRequest::resolve(&opts).unwrap_err();
        assert!(err.to_string().contains("Output must end in .img"));
    }

    #[test]
    fn output_in_missing_directory_is_rejected() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("base.iso");
        fs::write(&input, b"iso").unwrap();

        let mut opts = options(&input);
        opts.output = Some(temp.path().join("missing/out.img"));
        let err = BuildRequest::resolve(&opts).unwrap_err();
        assert!(err.to_string().contains("Output directory does not exist"));
    }

    #[test]
    fn output_equal_to_input_is_rejected() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("base.img");
        fs::write(&input, b"img").unwrap();

        let mut opts = options(&input);
        opts.output = Some(fs::canonicalize(&input).unwrap());
        let err = BuildRequest::resolve(&opts).unwrap_err();
        assert!(err.to_string().contains("must not overwrite"));
    }

    #[test]
    fn file_as_workdir_is_rejected() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("base.iso");
        fs::write(&input, b"iso").unwrap();

        let mut opts = options(&input);
        opts.workdir = Some(input.clone());
        let err = BuildRequest::resolve(&opts).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = BuildRequest::resolve(&BuildOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Input ISO is required.");
    }
}
