//! Command-line interface for tether.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for tether.
#[derive(Parser)]
#[command(name = "tether", version, author)]
#[command(
    about = "Fetches, caches, and supervises a release-distributed server binary",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for tether.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the server in the foreground; Ctrl-C stops it gracefully.
    Start {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = "tether.yaml")]
        config: String,
    },

    /// Download the latest release into the cache.
    Fetch {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = "tether.yaml")]
        config: String,

        /// Download even if the cached copy is still fresh.
        #[arg(long)]
        force: bool,
    },

    /// Register a deployment with the running server.
    Register {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = "tether.yaml")]
        config: String,

        /// Deployment URI (defaults to the configured `deployment_uri`).
        #[arg(short, long)]
        uri: Option<String>,

        /// Do not overwrite an existing deployment at the same URI.
        #[arg(long = "no-force")]
        no_force: bool,
    },

    /// Run a workload and register it once it reports readiness.
    Watch {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = "tether.yaml")]
        config: String,

        /// Start the server if registration finds none running.
        #[arg(long = "auto-start")]
        auto_start: bool,

        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
