//! Pipeline driver.
//!
//! Sequences one respin session:
//!
//! ```text
//! Start -> InputValidated -> WorkdirReady -> Mounted -> Staged
//!       -> Unpacked -> ImageWritten -> Done
//! Start -> CleanOnly
//! ```
//!
//! Every step is attempted once. Whatever happens after the workdir exists,
//! the session's [`FinalizeGuard`](crate::coordinator::FinalizeGuard) tears it
//! down before the result reaches the caller.

pub mod request;
pub mod stages;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::ExitCoordinator;
use crate::error::{RespinError, Result};
use crate::lifecycle::{teardown_workspace, Lifecycle, TeardownReport, Workspace};
use crate::preflight;
use crate::process::Cmd;
use crate::timing::Timer;

pub use request::{BuildOptions, BuildRequest};
pub use stages::{DeferredAuthor, ImageAuthor, SquashfsUnpack, Stage, StageContext};

/// Where a session is. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Start,
    InputValidated,
    WorkdirReady,
    Mounted,
    Staged,
    Unpacked,
    ImageWritten,
    Done,
    CleanOnly,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::InputValidated => "input-validated",
            Self::WorkdirReady => "workdir-ready",
            Self::Mounted => "mounted",
            Self::Staged => "staged",
            Self::Unpacked => "unpacked",
            Self::ImageWritten => "image-written",
            Self::Done => "done",
            Self::CleanOnly => "clean-only",
        };
        f.write_str(name)
    }
}

/// Result of a successful build.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub request: BuildRequest,
    /// The workdir the session used. Gone afterwards if it was owned.
    pub workdir: PathBuf,
    /// `None` if teardown had already run elsewhere.
    pub teardown: Option<TeardownReport>,
}

/// Result of a clean-only run.
#[derive(Debug, Default)]
pub struct CleanOutcome {
    /// One entry per workdir that was torn down.
    pub cleaned: Vec<(PathBuf, TeardownReport)>,
}

/// Drives a session through its states.
pub struct Pipeline {
    config: Config,
    coordinator: Arc<ExitCoordinator>,
    stages: Vec<Box<dyn Stage>>,
    author: Box<dyn ImageAuthor>,
    state: PipelineState,
}

impl Pipeline {
    /// A pipeline with the default stages: squashfs unpack and deferred
    /// authoring.
    pub fn new(config: &Config, coordinator: Arc<ExitCoordinator>) -> Self {
        Self {
            config: config.clone(),
            coordinator,
            stages: vec![Box::new(SquashfsUnpack)],
            author: Box::new(DeferredAuthor),
            state: PipelineState::Start,
        }
    }

    /// Replace the unpack/patch stages.
    pub fn with_stages(mut self, stages: Vec<Box<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    /// Replace the image author.
    pub fn with_author(mut self, author: Box<dyn ImageAuthor>) -> Self {
        self.author = author;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run a full build.
    ///
    /// Validation and preflight happen before any side effect. Once a workdir
    /// exists, success and failure both end in teardown.
    pub fn run(&mut self, options: &BuildOptions) -> Result<PipelineOutcome> {
        self.expect_state(PipelineState::Start)?;

        let request = BuildRequest::resolve(options)?;
        preflight::run_preflight_or_fail(false)?;
        self.advance(PipelineState::InputValidated);

        tracing::info!("Input:  {}", request.input_image.display());
        tracing::info!("Output: {}", request.output_image.display());

        let mut lifecycle =
            Lifecycle::new(&self.config).with_coordinator(Arc::clone(&self.coordinator));
        // Declared after `lifecycle` so it drops first, while the workspace is
        // still alive to be torn down.
        let guard = self.coordinator.guard();

        let result = self.drive(&request, &mut lifecycle);
        let workdir = lifecycle
            .workspace()
            .map(|ws| ws.workdir().to_path_buf())
            .unwrap_or_default();
        let teardown = guard.finish();

        result?;
        self.advance(PipelineState::Done);
        tracing::info!("Respin complete: {}", request.output_image.display());

        Ok(PipelineOutcome {
            request,
            workdir,
            teardown,
        })
    }

    fn drive(&mut self, request: &BuildRequest, lifecycle: &mut Lifecycle) -> Result<()> {
        let workspace = lifecycle.provision(request.workdir.as_deref(), &request.input_image)?;
        tracing::info!(
            "Workdir: {} (provided={})",
            workspace.workdir().display(),
            !workspace.owned()
        );
        self.advance(PipelineState::WorkdirReady);

        lifecycle.acquire_mount(&request.input_image)?;
        self.advance(PipelineState::Mounted);

        let timer = Timer::start("Stage image contents");
        stage_contents(&workspace)?;
        lifecycle.release_mount()?;
        timer.finish();
        self.advance(PipelineState::Staged);

        let ctx = StageContext {
            staging_root: workspace.staging_root(),
            chroot_dir: workspace.chroot_dir(),
            output_image: &request.output_image,
        };
        for stage in &self.stages {
            let timer = Timer::start(stage.name());
            stage.run(&ctx).inspect_err(|e| {
                tracing::error!(stage = stage.name(), "Stage failed: {}", e);
            })?;
            timer.finish();
        }
        self.advance(PipelineState::Unpacked);

        let timer = Timer::start(self.author.name());
        self.author
            .author(workspace.staging_root(), &request.output_image)?;
        timer.finish();
        self.advance(PipelineState::ImageWritten);

        Ok(())
    }

    /// Tear down leftovers of earlier sessions for `options.input`.
    ///
    /// With a workdir, only that one is cleaned; its marker decides whether
    /// it may be deleted. Without one, generated workdirs under the
    /// configured temp dir whose marker names the same input are cleaned.
    /// Finding nothing is not an error.
    pub fn clean(&mut self, options: &BuildOptions) -> Result<CleanOutcome> {
        self.expect_state(PipelineState::Start)?;

        let input = resolve_clean_input(&options.input)?;
        preflight::run_preflight_or_fail(true)?;

        let workspaces = match &options.workdir {
            Some(dir) => {
                let dir = std::path::absolute(dir).map_err(|e| RespinError::io(dir, e))?;
                if dir.exists() && !dir.is_dir() {
                    return Err(RespinError::validation(format!(
                        "Workdir exists and is not a directory: {}",
                        dir.display()
                    )));
                }
                vec![Workspace::open(dir)]
            }
            None => Workspace::discover(&self.config.tmp_dir, &self.config.workdir_prefix, &input),
        };

        let mut outcome = CleanOutcome::default();
        if workspaces.is_empty() {
            tracing::info!("Nothing to clean for {}", input.display());
        }
        for workspace in workspaces {
            let report = teardown_workspace(&workspace);
            outcome
                .cleaned
                .push((workspace.workdir().to_path_buf(), report));
        }

        self.advance(PipelineState::CleanOnly);
        Ok(outcome)
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(next > self.state, "{} -> {}", self.state, next);
        tracing::debug!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    fn expect_state(&self, expected: PipelineState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RespinError::validation(format!(
                "Pipeline already ran (state: {})",
                self.state
            )))
        }
    }
}

/// Copy everything under the mount point, metadata included, into the
/// staging root.
fn stage_contents(workspace: &Workspace) -> Result<()> {
    tracing::info!(
        "Copying image contents to {}...",
        workspace.staging_root().display()
    );
    Cmd::new("cp")
        .arg("-a")
        .arg_path(&workspace.mount_point().join("."))
        .arg_path(workspace.staging_root())
        .error_msg("Failed to copy image contents")
        .run()?;
    Ok(())
}

/// The input of a clean-only run may already be gone, so it is resolved but
/// not required to exist.
fn resolve_clean_input(input: &Path) -> Result<PathBuf> {
    if input.as_os_str().is_empty() {
        return Err(RespinError::validation("Input ISO is required."));
    }
    match fs::canonicalize(input) {
        Ok(path) => Ok(path),
        Err(_) => std::path::absolute(input).map_err(|e| RespinError::io(input, e)),
    }
}
