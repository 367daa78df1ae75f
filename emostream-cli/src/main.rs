//! emostream-cli: inspect the REST collaborators without starting a session
//!
//! # Subcommands
//! - `quota`: ask whether a new session may start
//! - `history [-n <limit>] [--json]`: recent sessions plus combined totals

use clap::{Parser, Subcommand};
use emostream_core::api::{QuotaDecision, SessionApi};
use emostream_core::models::TrendOverview;
use emostream_core::{EmostreamConfig, RestSessionApi, TrendRecord};
use serde::Serialize;

const DEFAULT_LIMIT: u32 = 10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "emostream-cli", version, about = "Emostream session quota and history")]
struct Cli {
    #[arg(short, long, default_value = "emostream.toml")]
    config: String,

    /// REST origin (overrides the config file)
    #[arg(long, env = "EMOSTREAM_REST_ORIGIN")]
    rest_origin: Option<String>,

    /// Bearer token (overrides the config file)
    #[arg(long, env = "EMOSTREAM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check whether a new session may start
    Quota,

    /// Show recent sessions
    History {
        /// Maximum number of sessions to fetch
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: u32,

        /// Output records and totals as JSON
        #[arg(long)]
        json: bool,
    },
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Serialize)]
struct HistoryReport<'a> {
    overview: TrendOverview,
    sessions: &'a [TrendRecord],
}

fn format_quota(decision: &QuotaDecision) -> String {
    match decision {
        QuotaDecision::Granted {
            remaining: Some(n),
        } => format!("Session allowed ({n} remaining)"),
        QuotaDecision::Granted { remaining: None } => "Session allowed".to_string(),
        QuotaDecision::Denied { reason } => format!("Session denied: {reason}"),
    }
}

fn format_record(record: &TrendRecord) -> String {
    let started = record
        .started_at
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let dominant = record
        .dominant()
        .map(|label| label.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<16} {:>5}s  {:<10} {:>4} results  {}",
        started,
        record.duration_seconds,
        dominant,
        record.emotion_tally.total(),
        record.session_id
    )
}

fn format_overview(overview: &TrendOverview) -> String {
    let mut line = format!(
        "{} sessions, {}s total",
        overview.sessions, overview.total_seconds
    );
    if let Some(dominant) = overview.combined_tally.dominant() {
        line.push_str(&format!(", mostly {dominant}"));
    }
    line
}

// ============================================================================
// Commands
// ============================================================================

async fn do_quota(api: &dyn SessionApi) -> anyhow::Result<bool> {
    let decision = api.check_quota().await?;
    println!("{}", format_quota(&decision));
    Ok(decision.is_granted())
}

async fn do_history(api: &dyn SessionApi, limit: u32, json: bool) -> anyhow::Result<()> {
    let records = api.fetch_trends(Some(limit)).await?;
    let overview = TrendOverview::from_records(&records);

    if json {
        let report = HistoryReport {
            overview,
            sessions: &records,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if records.is_empty() {
        eprintln!("No sessions recorded yet");
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    println!("\n{}", format_overview(&overview));
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match EmostreamConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("emostream-cli: failed to load config from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };
    if let Some(origin) = cli.rest_origin {
        config.endpoints.rest_origin = origin;
    }
    if let Some(token) = cli.token {
        config.auth.token = token;
    }

    let api = match RestSessionApi::from_config(&config) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("emostream-cli: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Quota => match do_quota(&api).await {
            Ok(true) => Ok(()),
            Ok(false) => std::process::exit(2),
            Err(e) => Err(e),
        },
        Commands::History { limit, json } => do_history(&api, limit, json).await,
    };

    if let Err(e) = result {
        eprintln!("emostream-cli: {}", e);
        std::process::exit(1);
    }
}
