//! PostgreSQL backup engine
//!
//! Dumps every database of the configured connections to S3-compatible
//! storage and prunes old backups. Meant to be triggered by cron.

// pgvault/src/main.rs
mod backup;
mod config;
mod errors;
mod logging;
mod utils;

use std::env;
use std::process::ExitCode;

use config::GlobalConfig;
use tracing::{error, info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Backup,
    Check,
}

fn parse_command(arg: Option<&str>) -> Option<Command> {
    match arg.map(str::trim) {
        None | Some("") | Some("backup") => Some(Command::Backup),
        Some("check") => Some(Command::Check),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenv::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env file: {}", e);
        }
    }

    let config = match GlobalConfig::from_process_env() {
        Ok(config) => config,
        Err(e) => {
            if logging::init(None).is_ok() {
                error!("Invalid configuration: {:#}", e);
            } else {
                eprintln!("Invalid configuration: {:#}", e);
            }
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = logging::init(config.log_file.as_deref()) {
        eprintln!("{:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let arg = env::args().nth(1);
    let Some(command) = parse_command(arg.as_deref()) else {
        error!("Unknown command {:?}. Usage: pgvault [backup|check]", arg.unwrap_or_default());
        return ExitCode::from(EXIT_CONFIG);
    };

    tokio::select! {
        code = run(command, config) => code,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning the current backup");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

async fn run(command: Command, config: GlobalConfig) -> ExitCode {
    match command {
        Command::Backup => {
            info!("Starting backup run");
            match backup::run_backup_flow(config).await {
                Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
                Ok(_) => ExitCode::from(EXIT_FAILURE),
                Err(e) => {
                    error!("Backup could not start: {:#}", e);
                    ExitCode::from(EXIT_CONFIG)
                }
            }
        }
        Command::Check => match backup::run_check_flow(config).await {
            Ok(report) if report.is_success() => ExitCode::SUCCESS,
            Ok(_) => ExitCode::from(EXIT_FAILURE),
            Err(e) => {
                error!("Check could not start: {:#}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        },
    }
}
