//! Clean command - tears down leftovers of an earlier session.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::coordinator::ExitCoordinator;
use crate::pipeline::{BuildOptions, Pipeline};

/// Execute the clean command.
///
/// Succeeds when nothing was left to clean. Teardown warnings are reported
/// but do not fail the command.
pub fn cmd_clean(
    options: &BuildOptions,
    config: &Config,
    coordinator: Arc<ExitCoordinator>,
) -> Result<()> {
    let mut pipeline = Pipeline::new(config, coordinator);
    let outcome = pipeline
        .clean(options)
        .context("Clean-only run failed")?;

    for (workdir, report) in &outcome.cleaned {
        if report.is_clean() {
            tracing::info!("Cleaned {}", workdir.display());
        } else {
            tracing::warn!(
                "Cleaned {} with {} warning(s)",
                workdir.display(),
                report.warnings.len()
            );
        }
    }
    Ok(())
}
