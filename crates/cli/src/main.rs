// Task queue CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: The binary only hosts the engine; all semantics live in taskqueue-engine.
// Design Decision: `run` uses the in-memory broker; real brokers plug in via BrokerConnection.

mod commands;
mod handlers;
mod output;
mod telemetry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "taskqueue")]
#[command(about = "Task queue - reserve jobs from a broker and run them on a worker pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print or write the default configuration
    Config {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Check that task files decode as job bodies
    Validate {
        /// Task files ({"name": ..., "payload": ...})
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run the engine on the given task files with the built-in handlers
    Run {
        /// JSON configuration file
        #[arg(long, short, env = "TASKQUEUE_CONFIG")]
        config: Option<PathBuf>,

        /// Stop once no job is ready or reserved instead of waiting for Ctrl-C
        #[arg(long)]
        until_drained: bool,

        /// Task files to put on the broker
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::from_env());
    let output_format = output::OutputFormat::parse(&cli.output);

    match cli.command {
        Commands::Config { output } => commands::config::run(output.as_deref()),
        Commands::Validate { files } => commands::validate::run(&files, output_format),
        Commands::Run {
            config,
            until_drained,
            files,
        } => {
            commands::run::run(
                commands::run::RunArgs {
                    config,
                    until_drained,
                    files,
                },
                output_format,
            )
            .await
        }
    }
}
