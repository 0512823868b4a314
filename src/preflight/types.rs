//! Preflight check types and report.

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - the run cannot succeed.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }

    fn render(&self) -> String {
        let status_str = match self.status {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
        };
        match &self.details {
            Some(details) => format!("[{}] {}: {}", status_str, self.name, details),
            None => format!("[{}] {}", status_str, self.name),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    pub fn warn_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .count()
    }

    /// Failed checks, rendered one per line.
    pub fn failures(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(CheckResult::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log the report. Passing checks only show up with `--debug`.
    pub fn log(&self) {
        for check in &self.checks {
            match check.status {
                CheckStatus::Pass => tracing::debug!("  {}", check.render()),
                CheckStatus::Warn => tracing::warn!("  {}", check.render()),
                CheckStatus::Fail => tracing::error!("  {}", check.render()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_failures() {
        let report = PreflightReport {
            checks: vec![
                CheckResult::pass("mount"),
                CheckResult::fail("cp", "Not found"),
                CheckResult::warn("unsquashfs", "Not found"),
            ],
        };
        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 1);
        assert_eq!(report.warn_count(), 1);
        assert_eq!(report.failures(), "[FAIL] cp: Not found");
    }

    #[test]
    fn empty_report_passes() {
        let report = PreflightReport { checks: Vec::new() };
        assert!(report.all_passed());
        assert!(report.failures().is_empty());
    }
}
