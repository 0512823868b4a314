//! Configuration management for respin.
//!
//! Reads configuration from the environment. `main` loads a `.env` file into
//! the environment first (via dotenvy), so real environment variables take
//! precedence over `.env` entries.

use std::collections::HashMap;
use std::path::PathBuf;

/// Default prefix for generated workdir names.
pub const DEFAULT_WORKDIR_PREFIX: &str = "respin-";

/// Environment variable naming the parent of generated workdirs.
pub const ENV_TMPDIR: &str = "RESPIN_TMPDIR";
/// Environment variable overriding the workdir name prefix.
pub const ENV_WORKDIR_PREFIX: &str = "RESPIN_WORKDIR_PREFIX";
/// Environment variable holding a tracing filter directive.
pub const ENV_LOG: &str = "RESPIN_LOG";

/// Respin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Parent directory for system-generated (owned) workdirs.
    pub tmp_dir: PathBuf,
    /// Name prefix for system-generated workdirs. Clean-only mode scans
    /// `tmp_dir` for directories carrying this prefix.
    pub workdir_prefix: String,
    /// Tracing filter directive (e.g. `respin=trace`), overrides `--debug`.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            workdir_prefix: DEFAULT_WORKDIR_PREFIX.to_string(),
            log_filter: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Self {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build configuration from an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        let defaults = Self::default();

        let tmp_dir = vars
            .get(ENV_TMPDIR)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                let path = PathBuf::from(s);
                std::path::absolute(&path).unwrap_or(path)
            })
            .unwrap_or(defaults.tmp_dir);

        // An empty prefix would make clean-only mode match every directory
        // in tmp_dir.
        let workdir_prefix = vars
            .get(ENV_WORKDIR_PREFIX)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .unwrap_or(defaults.workdir_prefix);

        let log_filter = vars
            .get(ENV_LOG)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            tmp_dir,
            workdir_prefix,
            log_filter,
        }
    }

    /// Log configuration for debugging.
    pub fn print(&self) {
        tracing::debug!("Configuration:");
        tracing::debug!("  {}: {}", ENV_TMPDIR, self.tmp_dir.display());
        tracing::debug!("  {}: {}", ENV_WORKDIR_PREFIX, self.workdir_prefix);
        tracing::debug!(
            "  {}: {}",
            ENV_LOG,
            self.log_filter.as_deref().unwrap_or("(unset)")
        );
    }
}
