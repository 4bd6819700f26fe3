mod broker;
mod clock;
mod config;
mod container;
mod coordinator;
mod driver;
mod error;
mod link;
mod recorder;
mod sampling;
mod sensor;
#[cfg(test)]
mod testing;
mod transfer;
mod upload;

use clap::Parser;
use config::Config;
use driver::{Driver, DriverCommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::oneshot;

/// Record ECG and motion sessions and hand each one off to cloud storage
#[derive(Debug, Parser)]
#[command(name = "holter-relay", version, about)]
struct Args {
    /// Configuration file (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many capture/upload cycles
    #[arg(long)]
    cycles: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Device {} | broker {}:{} | sessions in {}",
        config.device.id,
        config.broker.endpoint,
        config.broker.port,
        config.capture.storage_dir.display()
    );

    let (driver, commands) = Driver::from_config(config, args.cycles);
    let (done_tx, mut done_rx) = oneshot::channel();

    // The poll loop and the blocking broker client stay off the async runtime
    std::thread::spawn(move || {
        let report = driver.run();
        let _ = done_tx.send(report);
    });

    let mut interrupted = false;
    let report = loop {
        tokio::select! {
            report = &mut done_rx => break report,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                log::info!("Interrupt received, stopping after the current tick");
                interrupted = true;
                let _ = commands.send(DriverCommand::Shutdown);
            }
        }
    };

    match report {
        Ok(report) if report.interrupted && report.completed + report.failed == 0 => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => {
            log::error!("Driver thread exited without a report");
            ExitCode::FAILURE
        }
    }
}
