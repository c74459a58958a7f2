//! HORNET CLI
//!
//! Thin operator client over the HTTP API. Prints JSON (or a small table
//! for incident listings) and exits non-zero on any non-2xx response.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "hornet", about = "HORNET security-operations CLI", version)]
struct Cli {
    /// API base URL
    #[arg(long, env = "HORNET_URL", default_value = "http://localhost:8000")]
    url: String,

    /// Tenant API key
    #[arg(long, env = "HORNET_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// System health
    Health,
    /// List incidents
    Incidents {
        /// Filter by FSM state (e.g. CLOSED, ESCALATED)
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Fetch one incident with findings and actions
    Get { incident_id: String },
    /// Ingest an event
    Ingest {
        /// JSON file holding the event body
        #[arg(long, conflicts_with_all = ["event_type", "severity"])]
        file: Option<std::path::PathBuf>,
        /// Event type (e.g. auth.brute_force)
        #[arg(long = "type")]
        event_type: Option<String>,
        #[arg(long, default_value = "MEDIUM")]
        severity: String,
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Registered agents
    Agents,
    /// Registered playbooks
    Playbooks,
    /// Detection thresholds
    Thresholds,
    /// Prometheus metrics
    Metrics,
    /// Approve or reject a pending action
    Approve {
        incident_id: String,
        action_id: String,
        /// Reject instead of approving
        #[arg(long)]
        reject: bool,
        #[arg(long, default_value = "")]
        justification: String,
    },
}

struct Client {
    base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl Client {
    fn new(base: String, api_key: Option<String>) -> Self {
        Self {
            base,
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<(bool, Value)> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let ok = response.status().is_success();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((ok, body))
    }

    async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<(bool, Value)> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        let ok = response.status().is_success();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((ok, body))
    }
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn print_incident_table(body: &Value) {
    let Some(rows) = body.get("data").and_then(|d| d.as_array()) else {
        print_json(body);
        return;
    };
    println!(
        "{:<38} {:<12} {:<9} {:<6} {}",
        "ID", "STATE", "SEVERITY", "CONF", "CREATED"
    );
    for row in rows {
        println!(
            "{:<38} {:<12} {:<9} {:<6.2} {}",
            row.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
            row.get("state").and_then(|v| v.as_str()).unwrap_or("-"),
            row.get("severity").and_then(|v| v.as_str()).unwrap_or("-"),
            row.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0),
            row.get("created_at").and_then(|v| v.as_str()).unwrap_or("-"),
        );
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let client = Client::new(cli.url.clone(), cli.api_key.clone());

    let ok = match cli.command {
        Command::Health => {
            let (ok, body) = client.get_json("/api/v1/health").await?;
            print_json(&body);
            ok
        }
        Command::Incidents { state, limit } => {
            let mut path = format!("/api/v1/incidents?limit={limit}");
            if let Some(state) = state {
                path.push_str(&format!("&state={state}"));
            }
            let (ok, body) = client.get_json(&path).await?;
            if ok {
                print_incident_table(&body);
            } else {
                print_json(&body);
            }
            ok
        }
        Command::Get { incident_id } => {
            let (ok, body) = client
                .get_json(&format!("/api/v1/incidents/{incident_id}"))
                .await?;
            print_json(&body);
            ok
        }
        Command::Ingest {
            file,
            event_type,
            severity,
            source,
        } => {
            let body = match (file, event_type) {
                (Some(path), _) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?;
                    serde_json::from_str(&raw).context("event file is not valid JSON")?
                }
                (None, Some(event_type)) => json!({
                    "event_type": event_type,
                    "source": source,
                    "source_type": "cli",
                    "severity": severity.to_uppercase(),
                }),
                (None, None) => anyhow::bail!("either --file or --type is required"),
            };
            let (ok, body) = client.post_json("/api/v1/events", &body).await?;
            print_json(&body);
            ok
        }
        Command::Agents => {
            let (ok, body) = client.get_json("/api/v1/config/agents").await?;
            print_json(&body);
            ok
        }
        Command::Playbooks => {
            let (ok, body) = client.get_json("/api/v1/config/playbooks").await?;
            print_json(&body);
            ok
        }
        Command::Thresholds => {
            let (ok, body) = client.get_json("/api/v1/config/thresholds").await?;
            print_json(&body);
            ok
        }
        Command::Metrics => {
            let response = client
                .request(reqwest::Method::GET, "/metrics")
                .send()
                .await
                .context("GET /metrics failed")?;
            let ok = response.status().is_success();
            println!("{}", response.text().await.unwrap_or_default());
            ok
        }
        Command::Approve {
            incident_id,
            action_id,
            reject,
            justification,
        } => {
            let body = json!({
                "response_type": if reject { "REJECT" } else { "APPROVE" },
                "action_id": action_id,
                "justification": justification,
            });
            let (ok, body) = client
                .post_json(&format!("/api/v1/incidents/{incident_id}/action"), &body)
                .await?;
            print_json(&body);
            ok
        }
    };
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
