//! Health check command.
//!
//! Queries the `/health` endpoint.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Exit non-zero unless the server reports healthy
    #[arg(short, long)]
    strict: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;
    let status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    match format {
        OutputFormat::Table => {
            output::print_header("Server Health");
            output::print_detail("Status", &status);
            output::print_detail("API URL", client.base_url());

            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }
            if let Some(uptime) = health.get("uptime_secs").and_then(|v| v.as_u64()) {
                output::print_detail("Uptime", &format!("{}s", uptime));
            }
            if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
                output::print_detail("Timestamp", ts);
            }

            if status == "healthy" {
                output::print_success("Server operational");
            } else {
                output::print_error(&format!("Server status: {}", status));
            }
        }
        OutputFormat::Json => output::print_json(&health),
    }

    if args.strict && status != "healthy" {
        anyhow::bail!("server reported status {}", status);
    }
    Ok(())
}
