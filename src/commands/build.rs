//! Build command - respins a live image.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::coordinator::ExitCoordinator;
use crate::pipeline::{BuildOptions, Pipeline};
use crate::timing;

/// Execute the build command.
pub fn cmd_build(
    options: &BuildOptions,
    config: &Config,
    coordinator: Arc<ExitCoordinator>,
) -> Result<()> {
    let started = std::time::Instant::now();
    let mut pipeline = Pipeline::new(config, coordinator);

    let outcome = pipeline
        .run(options)
        .with_context(|| format!("Respin of {} failed", options.input.display()))?;

    if let Some(report) = &outcome.teardown {
        if !report.is_clean() {
            tracing::warn!(
                "{} was not fully cleaned up; rerun with --clean",
                outcome.workdir.display()
            );
        }
    }

    tracing::info!(
        "Done in {}: {}",
        timing::format_elapsed(started.elapsed()),
        outcome.request.output_image.display()
    );
    Ok(())
}
