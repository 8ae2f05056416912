//! ringwatchd - multi-camera surveillance daemon
//!
//! Loads the configuration, builds every supervised unit and runs the
//! supervisor until Ctrl-C / SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;

use ringwatch::notify::{ArmTarget, Command};
use ringwatch::{runtime, RingwatchConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera recording and detection daemon")]
struct Args {
    /// Configuration file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "RINGWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Force the system armed (or disarmed with `--armed=false`) at startup,
    /// overriding the persisted state.
    #[arg(long)]
    armed: Option<bool>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RingwatchConfig::load(args.config.as_deref()).context("load configuration")?;
    log::info!(
        "ringwatchd {}: {} camera(s), detector {}, data in {}",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len(),
        config.detection.backend,
        config.data_dir.display()
    );
    if args.check {
        println!("configuration ok");
        return Ok(());
    }

    let runtime = runtime::build(&config)?;
    if let Some(armed) = args.armed {
        let command = if armed {
            Command::Arm(ArmTarget::System)
        } else {
            Command::Disarm(ArmTarget::System)
        };
        runtime
            .commands
            .send(command)
            .context("queue startup arm command")?;
    }

    let shutdown = runtime.supervisor.shutdown_flag();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping units...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    runtime.supervisor.run()?;
    log::info!("ringwatchd stopped");
    Ok(())
}
