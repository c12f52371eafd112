//! Binary entry point: parse arguments, load the configuration, run one
//! worker until a control signal stops it.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use switchyard::{Config, Worker};
use tracing_subscriber::EnvFilter;

/// Exit code for configuration problems.
const EX_CONFIG: u8 = 1;
/// Exit code for runtime failures.
const EX_RUNTIME: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about = "TCP reverse proxy and load balancer")]
struct Args {
    /// Configuration file (JSON).
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Log more (debug level).
    #[arg(short, long)]
    debug: bool,

    /// Log less (warnings only).
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,
}

fn init_logging(args: &Args) {
    let default = if args.debug {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "configuration rejected");
            return ExitCode::from(EX_CONFIG);
        }
    };
    if args.check {
        tracing::info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let mut worker = match Worker::new(&cfg) {
        Ok(w) => w,
        Err(e) if e.is_config() => {
            tracing::error!(error = %e, "configuration rejected");
            return ExitCode::from(EX_CONFIG);
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::from(EX_RUNTIME);
        }
    };
    if let Err(e) = worker.watch_control_signals() {
        tracing::error!(error = %e, "signal setup failed");
        return ExitCode::from(EX_RUNTIME);
    }

    match worker.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker died");
            ExitCode::from(EX_RUNTIME)
        }
    }
}
