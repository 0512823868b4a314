//! Respin - live ISO respin pipeline.
//!
//! Loop-mounts a live image, stages a writable copy of it, unpacks the root
//! filesystem and hands the tree to an image author. Whatever happens, the
//! mount and the generated workdir are torn down before exit.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use respin::commands::{cmd_build, cmd_clean};
use respin::config::Config;
use respin::coordinator::{ExitCoordinator, SIGNAL_EXIT_CODE};
use respin::pipeline::BuildOptions;
use respin::preflight;

#[derive(Parser)]
#[command(name = "respin")]
#[command(about = "Respin a live ISO image")]
#[command(
    after_help = "EXAMPLES:\n  respin -i base.iso                 Build base-custom.img next to base.iso\n  respin -i base.iso -w /var/tmp/rs  Use a fixed workdir (kept afterwards)\n  respin -i base.iso --clean         Remove leftovers of an earlier run"
)]
struct Cli {
    /// Input live ISO image
    #[arg(short, long)]
    input: PathBuf,

    /// Output image (default: <input stem>-custom.img next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Working directory (default: a fresh directory under RESPIN_TMPDIR)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Only tear down leftovers of an earlier run, then exit
    #[arg(long)]
    clean: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    let config = Config::load();
    init_logging(&config, cli.debug);
    config.print();

    let coordinator = ExitCoordinator::global();
    match run(cli, &config, &coordinator) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            if coordinator.exit_requested() {
                ExitCode::from(SIGNAL_EXIT_CODE as u8)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli, config: &Config, coordinator: &std::sync::Arc<ExitCoordinator>) -> Result<()> {
    preflight::require_root()?;
    coordinator
        .install_signal_handler()
        .context("setting up signal handler")?;

    let options = BuildOptions {
        input: cli.input,
        output: cli.output,
        workdir: cli.workdir,
        clean_only: cli.clean,
    };

    if options.clean_only {
        cmd_clean(&options, config, coordinator.clone())
    } else {
        cmd_build(&options, config, coordinator.clone())
    }
}

fn init_logging(config: &Config, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
