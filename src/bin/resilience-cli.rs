use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "resilience-cli")]
#[command(about = "Management CLI for the resilience engine admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9091")]
    url: String,

    #[arg(short, long, default_value = "admin-secret-key")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check engine status
    Status,
    /// List circuit breakers with their state and metrics
    Breakers,
    /// Show one circuit breaker
    Breaker { name: String },
    /// Manually transition a circuit breaker
    Transition {
        name: String,
        /// CLOSED, OPEN, HALF_OPEN, DISABLED, FORCED_OPEN or METRICS_ONLY
        state: String,
        /// Keep an OPEN breaker open for this long, then allow trial calls
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Reset a circuit breaker to CLOSED with empty metrics
    Reset { name: String },
    /// List retry instances and their call counters
    Retries,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = cli.url.trim_end_matches('/');
    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Breakers => client.get(format!("{}/admin/circuit-breakers", base)),
        Commands::Breaker { name } => {
            client.get(format!("{}/admin/circuit-breakers/{}", base, name))
        }
        Commands::Transition {
            name,
            state,
            duration_ms,
        } => client
            .post(format!("{}/admin/circuit-breakers/{}/state", base, name))
            .json(&json!({ "state": state, "duration_ms": duration_ms })),
        Commands::Reset { name } => {
            client.post(format!("{}/admin/circuit-breakers/{}/reset", base, name))
        }
        Commands::Retries => client.get(format!("{}/admin/retries", base)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
