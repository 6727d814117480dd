//! Messenger statistics command.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

/// Mirrors the server's `MessengerStats`.
#[derive(Debug, Deserialize, Serialize)]
struct MessengerStats {
    connections: usize,
    cached_models: usize,
    bindings: usize,
    requests_handled: u64,
    connections_opened: u64,
    #[serde(default)]
    entity_types: Vec<String>,
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: MessengerStats = client.get("/api/v1/stats").await?;

    match format {
        OutputFormat::Table => {
            let rows = [
                ("Open connections", stats.connections.to_string()),
                ("Cached models", stats.cached_models.to_string()),
                ("Bindings", stats.bindings.to_string()),
                ("Requests handled", stats.requests_handled.to_string()),
                ("Connections opened", stats.connections_opened.to_string()),
                ("Entity types", stats.entity_types.join(", ")),
            ]
            .into_iter()
            .map(|(metric, value)| StatRow { metric, value })
            .collect::<Vec<_>>();
            output::print_table(&rows);
        }
        OutputFormat::Json => output::print_json(&stats),
    }
    Ok(())
}
