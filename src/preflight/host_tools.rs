//! Host tool availability checks.

use crate::process;

use super::types::CheckResult;

/// Tools every build needs: (tool, package, purpose).
pub const BUILD_TOOLS: &[(&str, &str, &str)] = &[
    ("mount", "util-linux", "Required to loop-mount the input image"),
    ("umount", "util-linux", "Required to release the image mount"),
    ("cp", "coreutils", "Required to stage the image contents"),
];

/// Tools clean-only mode needs.
pub const CLEAN_TOOLS: &[(&str, &str, &str)] = &[(
    "umount",
    "util-linux",
    "Required to release leftover mounts",
)];

/// Tools some stages use when the image calls for them.
pub const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[(
    "unsquashfs",
    "squashfs-tools",
    "Required to unpack a squashfs root filesystem",
)];

/// Check `required` and `optional` tools are installed.
pub fn check_host_tools(
    required: &[(&str, &str, &str)],
    optional: &[(&str, &str, &str)],
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for (tool, package, purpose) in required {
        results.push(check_tool_exists(tool, package, purpose, true));
    }

    for (tool, package, purpose) in optional {
        results.push(check_tool_exists(tool, package, purpose, false));
    }

    results
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.to_string_lossy()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn missing_required_tool_fails() {
        let results = check_host_tools(
            &[("nonexistent_program_12345", "nothing", "testing")],
            &[],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Fail);
        assert!(results[0]
            .details
            .as_deref()
            .unwrap()
            .contains("Install 'nothing'"));
    }

    #[test]
    fn missing_optional_tool_warns() {
        let results = check_host_tools(&[], &[("nonexistent_program_12345", "nothing", "testing")]);
        assert_eq!(results[0].status, CheckStatus::Warn);
    }

    #[test]
    fn present_tool_passes_with_path() {
        let results = check_host_tools(&[("sh", "dash", "testing")], &[]);
        assert_eq!(results[0].status, CheckStatus::Pass);
        assert!(results[0].details.as_deref().unwrap().ends_with("sh"));
    }
}
