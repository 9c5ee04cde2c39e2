//! `keydeckd` binary entry point: parse flags, wire up logging and the
//! crash handler, build the daemon aggregate, and run the event loop
//! until a shutdown signal arrives (spec §4.13, §6 "CLI surface").

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use keydeck::cli::Cli;
use keydeck::daemon::Daemon;
use keydeck::logger::jsonl::default_log_path;
use keydeck::logger::{JsonlLogger, LogLevel};

fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "daemon")]
    if let Err(e) = keydeck::daemon::signals::install() {
        eprintln!("keydeckd: failed to install signal handlers: {e}");
        return ExitCode::from(1);
    }

    let min_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let logger = Arc::new(match std::fs::create_dir_all(&cli.state_dir) {
        Ok(()) => JsonlLogger::open(&default_log_path(&cli.state_dir), min_level),
        Err(_) => JsonlLogger::stderr_only(min_level),
    });

    if cli.dump_config {
        return match keydeck::core::config::loader::load(&cli.config) {
            Ok(config) => {
                let json = keydeck::render::config_to_json(&config);
                match serde_json::to_string_pretty(&json) {
                    Ok(text) => {
                        println!("{text}");
                        ExitCode::from(0)
                    }
                    Err(e) => {
                        eprintln!("keydeckd: failed to serialize resolved config: {e}");
                        ExitCode::from(1)
                    }
                }
            }
            Err(e) => {
                eprintln!("keydeckd: {e}");
                ExitCode::from(1)
            }
        };
    }

    let paths = cli.daemon_paths();
    let mut daemon = match Daemon::start(paths, Arc::clone(&logger)) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("keydeckd: fatal init error: {e}");
            return ExitCode::from(1);
        }
    };

    match daemon.run() {
        Ok(()) => {
            logger.info("shutdown complete");
            ExitCode::from(0)
        }
        Err(e) => {
            logger.error_code(&format!("fatal runtime error: {e}"), e.code());
            ExitCode::from(1)
        }
    }
}
