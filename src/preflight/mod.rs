//! Preflight checks run before any side effect.
//!
//! - privilege: mounting needs root, checked before anything else
//! - host tools: the external commands the pipeline shells out to

mod host_tools;
mod types;

use crate::error::{RespinError, Result};

pub use host_tools::{check_host_tools, BUILD_TOOLS, CLEAN_TOOLS, OPTIONAL_TOOLS};
pub use types::{CheckResult, CheckStatus, PreflightReport};

/// True if running with an effective UID of 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Fail fast unless running as root.
pub fn require_root() -> Result<()> {
    if is_root() {
        Ok(())
    } else {
        Err(RespinError::validation(
            "This program must be run as root (mounting loop devices is privileged).",
        ))
    }
}

/// Check the tools for a build (`clean_only == false`) or a clean-only run.
pub fn run_preflight(clean_only: bool) -> PreflightReport {
    let checks = if clean_only {
        check_host_tools(CLEAN_TOOLS, &[])
    } else {
        check_host_tools(BUILD_TOOLS, OPTIONAL_TOOLS)
    };
    PreflightReport { checks }
}

/// Run preflight and turn failures into a validation error.
pub fn run_preflight_or_fail(clean_only: bool) -> Result<()> {
    tracing::debug!("Running preflight checks...");
    let report = run_preflight(clean_only);
    report.log();

    if !report.all_passed() {
        return Err(RespinError::validation(format!(
            "Preflight failed: {} check(s) failed:\n{}",
            report.fail_count(),
            report.failures()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_root_matches_euid() {
        assert_eq!(require_root().is_ok(), is_root());
    }

    #[test]
    fn build_preflight_covers_required_tools() {
        let report = run_preflight(false);
        for (tool, _, _) in BUILD_TOOLS.iter().chain(OPTIONAL_TOOLS) {
            assert!(report.checks.iter().any(|c| c.name == *tool));
        }
    }

    #[test]
    fn clean_preflight_only_needs_umount() {
        let report = run_preflight(true);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "umount");
    }
}
