use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use request_lifecycle::client::{ApiClient, ApiResponse, ClientError};
use request_lifecycle::http::X_CORRELATION_ID;

#[derive(Parser)]
#[command(name = "lifecycle-cli")]
#[command(about = "Probe a request-lifecycle server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Correlation id to send with every request.
    #[arg(long)]
    correlation_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fire identical requests concurrently; they are coalesced into one
    Probe {
        #[arg(default_value = "/api/echo")]
        path: String,
        #[arg(short, long, default_value_t = 5)]
        concurrency: usize,
    },
    /// Send sequential requests and report the rate limit headers of each
    Burst {
        #[arg(default_value = "/api/echo")]
        path: String,
        #[arg(short, long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    if let Some(id) = &cli.correlation_id {
        headers.insert(X_CORRELATION_ID, HeaderValue::from_str(id)?);
    }
    let http = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .build()?;
    let client = ApiClient::with_client(&cli.url, http)?;

    match cli.command {
        Commands::Probe { path, concurrency } => {
            let calls = (0..concurrency).map(|_| client.get(&path));
            let results = futures_util::future::join_all(calls).await;
            for (i, result) in results.into_iter().enumerate() {
                print_result(json!({ "call": i }), result)?;
            }
        }
        Commands::Burst { path, count } => {
            for i in 0..count {
                let result = client.get(&path).await;
                print_result(json!({ "request": i }), result)?;
            }
        }
    }

    Ok(())
}

fn print_result(
    mut label: Value,
    result: Result<ApiResponse, ClientError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(response) => {
            label["status"] = json!(response.status);
            label["correlation_id"] = json!(response.correlation_id);
            label["rate_limit"] = serde_json::to_value(&response.rate_limit)?;
            println!("{}", serde_json::to_string(&label)?);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
        }
    }
    Ok(())
}
