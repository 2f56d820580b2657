use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use viewsync_core::config::SyncConfig;
use viewsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use viewsync_core::metrics::init_metrics;

mod script;

use script::Script;

#[derive(Parser, Debug)]
#[command(name = "viewsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; defaults plus VIEWSYNC_* variables otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Replay a JSON script through a session and print what it sends
    Replay {
        script: PathBuf,

        /// Pretty-print each outgoing message
        #[arg(long)]
        pretty: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let requested = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = LogLevel::parse(requested).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', using 'info'", requested);
        LogLevel::Info
    });
    let log_config = LogConfig::new(log_level)
        .with_target(config.logging.with_target)
        .json_format(args.json_logs || config.logging.json_format);
    init_logging_with_config(log_config)?;

    if config.metrics.enabled {
        init_metrics();
    }

    match args.command {
        Some(Command::Replay { script, pretty }) => {
            info!(script = %script.display(), "replaying script");
            let messages = script::replay(Script::from_file(&script)?, &config)?;
            for message in &messages {
                let line = if pretty {
                    serde_json::to_string_pretty(message)?
                } else {
                    serde_json::to_string(message)?
                };
                println!("{}", line);
            }
            info!(messages = messages.len(), "replay finished");
        }
        Some(Command::Config) => {
            print!("{}", config.to_toml()?);
        }
        None => {
            warn!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}
