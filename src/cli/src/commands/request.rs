//! One-shot request command.
//!
//! Sends a single read, write or delete through `POST /api/v1/requests`.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tabled::{builder::Builder, settings::Style};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RequestArgs {
    /// Entity type, e.g. `task`
    entity: String,

    /// Method: read, write or delete
    method: String,

    /// Record id (JSON, bare strings accepted)
    #[arg(long, conflicts_with = "filter")]
    id: Option<String>,

    /// Filter object as JSON, e.g. '{"status":"open"}'
    #[arg(long)]
    filter: Option<String>,

    /// Order object as JSON, e.g. '{"id":"asc"}'
    #[arg(long, requires = "filter")]
    order: Option<String>,

    /// Payload as JSON
    #[arg(short, long)]
    data: Option<String>,

    /// Correlation id echoed by the server (random by default)
    #[arg(long)]
    correlation_id: Option<String>,
}

pub async fn execute(args: RequestArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let frame = build_frame(&args)?;
    let (status, reply) = client.post_json("/api/v1/requests", &frame).await?;

    if let Some(code) = reply.get("error").and_then(Value::as_str) {
        anyhow::bail!("{} {} rejected ({}): {}", args.entity, args.method, status, code);
    }
    if !status.is_success() {
        anyhow::bail!("API error ({}): {}", status, reply);
    }

    match format {
        OutputFormat::Table => print_reply(&reply),
        OutputFormat::Json => output::print_json(&reply),
    }
    Ok(())
}

fn build_frame(args: &RequestArgs) -> Result<Value> {
    let mut selector = Map::new();
    if let Some(id) = &args.id {
        selector.insert("id".into(), json_or_string(id));
    }
    if let Some(filter) = &args.filter {
        selector.insert("filter".into(), parse_json("--filter", filter)?);
    }
    if let Some(order) = &args.order {
        selector.insert("order".into(), parse_json("--order", order)?);
    }
    let payload = match &args.data {
        Some(data) => parse_json("--data", data)?,
        None => Value::Null,
    };
    let correlation_id = args
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(json!({
        "head": {"correlationId": correlation_id},
        "body": {
            "entityType": args.entity,
            "method": args.method,
            "selector": selector,
            "payload": payload,
        }
    }))
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))
}

/// `7` stays a number, `abc` becomes a string.
fn json_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_reply(reply: &Value) {
    let data = &reply["data"];
    output::print_header(&format!(
        "{} {}",
        data["name"].as_str().unwrap_or("?"),
        reply["method"].as_str().unwrap_or("?")
    ));
    output::print_detail("Correlation ID", &display(&reply["correlationId"]));

    match &data["result"] {
        Value::Array(rows) => print_rows(rows),
        Value::Object(record) => {
            for (key, value) in record {
                output::print_detail(key, &display(value));
            }
        }
        Value::Null => println!("  {}", "null".dimmed()),
        other => output::print_detail("Result", &display(other)),
    }
}

fn print_rows(rows: &[Value]) {
    if rows.is_empty() {
        println!("{}", "No results found.".dimmed());
        return;
    }

    let columns: BTreeSet<&str> = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();

    let mut builder = Builder::default();
    builder.push_record(columns.iter().copied());
    for row in rows {
        builder.push_record(columns.iter().map(|c| display(&row[*c])));
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{}", table);
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(id: Option<&str>, filter: Option<&str>, data: Option<&str>) -> RequestArgs {
        RequestArgs {
            entity: "task".into(),
            method: "read".into(),
            id: id.map(Into::into),
            filter: filter.map(Into::into),
            order: None,
            data: data.map(Into::into),
            correlation_id: Some("c-1".into()),
        }
    }

    #[test]
    fn test_frame_by_id() {
        let frame = build_frame(&args(Some("7"), None, None)).unwrap();
        assert_eq!(frame["head"]["correlationId"], "c-1");
        assert_eq!(frame["body"]["entityType"], "task");
        assert_eq!(frame["body"]["selector"], json!({"id": 7}));
        assert!(frame["body"]["payload"].is_null());
    }

    #[test]
    fn test_bare_id_becomes_string() {
        let frame = build_frame(&args(Some("abc-1"), None, None)).unwrap();
        assert_eq!(frame["body"]["selector"]["id"], "abc-1");
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let err = build_frame(&args(None, Some("{status"), None)).unwrap_err();
        assert!(err.to_string().contains("--filter"));
    }

    #[test]
    fn test_payload_is_parsed() {
        let frame = build_frame(&args(None, None, Some(r#"{"title":"x"}"#))).unwrap();
        assert_eq!(frame["body"]["payload"]["title"], "x");
        assert_eq!(frame["body"]["selector"], json!({}));
    }
}
