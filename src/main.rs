use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trustgate::config::{LoggingConfig, TrustgateConfig};
use trustgate::ratelimit::{sort_by_priority, LimitCheckRequest, RateLimiter, RuleSet};
use trustgate::{CleanupScheduler, MemoryStore, ReputationManager};

#[derive(Parser)]
#[command(name = "trustgate", version, about = "Reputation-aware admission control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a rule file
    Validate {
        /// Path to a YAML rule file
        path: PathBuf,
    },
    /// Answer admission checks read as JSON lines from stdin
    Run {
        /// Configuration file (YAML, TOML or JSON)
        #[arg(short, long)]
        config: Option<String>,

        /// Rule file loaded at startup, overriding `rate_limiting.rules_path`
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => validate(path),
        Command::Run { config, rules } => run(config, rules).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    init_tracing(&LoggingConfig::default());

    let rule_set = RuleSet::from_file(&path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;

    let now = Utc::now();
    let mut rules = Vec::with_capacity(rule_set.len());
    for (index, definition) in rule_set.rules.into_iter().enumerate() {
        let mut rule = definition
            .into_rule(now)
            .with_context(|| format!("rule #{} is invalid", index + 1))?;
        rule.id = index as i64 + 1;
        rules.push(rule);
    }
    sort_by_priority(&mut rules);
    rules.sort_by(|a, b| a.system_id.cmp(&b.system_id));

    println!("{}: {} rules OK", path.display(), rules.len());
    for rule in &rules {
        println!(
            "  [{}] priority={} scope={} limit={} {}{}{}{}",
            rule.system_id,
            rule.priority,
            rule.scope,
            rule.limit,
            rule.limit_type,
            rule.scope_value
                .as_deref()
                .map(|v| format!(" value={}", v))
                .unwrap_or_default(),
            rule.resource_type
                .as_deref()
                .map(|r| format!(" resource={}", r))
                .unwrap_or_default(),
            if rule.enabled { "" } else { " (disabled)" },
        );
    }
    Ok(())
}

async fn run(config_path: Option<String>, rules_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = TrustgateConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Starting Trustgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    let reputation = Arc::new(ReputationManager::new(
        store.clone(),
        config.reputation.cache_ttl(),
    ));
    let limiter = Arc::new(
        RateLimiter::new(store.clone(), config.rate_limiting.clone())
            .with_reputation(reputation, &config.reputation),
    );

    let rules_path = rules_path.or_else(|| config.rate_limiting.rules_path.clone().map(PathBuf::from));
    if let Some(path) = rules_path {
        let rule_set = RuleSet::from_file(&path)
            .with_context(|| format!("failed to read rule file {}", path.display()))?;
        limiter.load_rules(rule_set).await?;
    }

    let scheduler = CleanupScheduler::start(limiter.clone(), config.cleanup.clone());

    tokio::select! {
        result = serve(limiter) => {
            if let Err(e) = result {
                warn!(error = %e, "Request loop failed");
            }
            info!("Input closed, shutting down");
        }
        _ = shutdown_signal() => {}
    }

    scheduler.stop().await;
    info!("Trustgate stopped");
    Ok(())
}

/// Read one `LimitCheckRequest` per line and write one decision per line.
async fn serve(limiter: Arc<RateLimiter>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<LimitCheckRequest>(line) {
            Ok(request) => match limiter.check_limit(&request).await {
                Ok(decision) => serde_json::to_string(&decision)?,
                Err(e) => error_line(&e.to_string()),
            },
            Err(e) => error_line(&format!("invalid request: {}", e)),
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn error_line(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
