//! Config validation CLI tool
//!
//! Validates a habitlinkd configuration file and reports any errors.

use habitlink_config::{ConfigError, ReschedulePolicy, CURRENT_CONFIG_VERSION};
use habitlink_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a habitlinkd configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match habitlink_config::load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!("  Socket: {}", config.service.socket_path.display());
            println!("  Database: {}", config.service.database_path().display());
            println!("  Store timeout: {:?}", config.service.store_timeout);
            println!(
                "  Recurrence every {:?}, reminders every {:?} (autostart: {})",
                config.scheduler.recurrence_interval,
                config.scheduler.reminder_interval,
                config.scheduler.autostart
            );
            match config.reschedule {
                ReschedulePolicy::Frequency => println!("  Reschedule: by habit frequency"),
                ReschedulePolicy::Fixed(every) => println!("  Reschedule: fixed, every {:?}", every),
            }
            println!("  Leaderboard size: {}", config.leaderboard_limit);

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
