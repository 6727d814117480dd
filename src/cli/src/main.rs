//! modelsync CLI - inspect and exercise a running modelsync server.
//!
//! Provides health, statistics, one-shot request and configuration commands.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, request, stats};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";

/// modelsync - reactive model synchronization server CLI
#[derive(Parser)]
#[command(
    name = "modelsync",
    version,
    about = "modelsync - reactive model synchronization server",
    long_about = "CLI tool for checking a modelsync server and sending one-shot requests through its messenger.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "MODELSYNC_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health(health::HealthArgs),

    /// Show messenger statistics
    Stats,

    /// Send one read, write or delete request
    Request(request::RequestArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Stats => stats::execute(&client, format).await,
        Commands::Request(args) => request::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
