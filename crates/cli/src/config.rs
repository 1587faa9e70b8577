//! Command-line configuration and process bootstrap.

use crate::commands::Command;
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "shardctl")]
#[command(about = "Virtual-shard planning, inspection and simulation")]
#[command(version)]
pub struct CliConfig {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Install the global tracing subscriber. `RUST_LOG` overrides the
    /// default `info` level.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        // A subscriber may already be installed (tests); keep that one.
        let _ = match self.log_format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    }

    /// Execute the selected command and print its output.
    pub fn run(self) -> anyhow::Result<()> {
        let output = self.command.execute()?;
        print!("{}", output);
        Ok(())
    }
}
