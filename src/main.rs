use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig};
use gatekeeper::ratelimit::{HierarchicalLimiter, ScopeKey};
use gatekeeper::tenant::RequestMetadata;

/// Hierarchical multi-tenant admission control.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one admission check and print the decision
    Check {
        #[command(flatten)]
        tenant: TenantArgs,

        /// Tokens the request costs
        #[arg(long, default_value_t = 1)]
        cost: u32,
    },
    /// Fire a burst of checks and print every decision plus the metrics snapshot
    Simulate {
        #[command(flatten)]
        tenant: TenantArgs,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: u32,

        /// Tokens each request costs
        #[arg(long, default_value_t = 1)]
        cost: u32,

        /// Pause between requests
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Show the stored state of a bucket, e.g. `org:acme` or `region:acme:eu`
    Inspect {
        key: String,
    },
    /// Print the effective configuration
    Config,
}

/// Tenant metadata, passed through the configured tenant headers.
#[derive(Debug, Args)]
struct TenantArgs {
    /// Organization id
    #[arg(long)]
    org: Option<String>,

    /// Traffic-origin region
    #[arg(long)]
    region: Option<String>,

    /// Plan (free, pro, enterprise)
    #[arg(long)]
    plan: Option<String>,
}

impl TenantArgs {
    fn to_metadata(&self, config: &GatekeeperConfig) -> RequestMetadata {
        let tenant = &config.tenant;
        let mut metadata = RequestMetadata::new();

        if let (Some(org), Some(header)) = (&self.org, tenant.organization_headers.first()) {
            metadata.insert_header(header, org.clone());
        }
        if let Some(region) = &self.region {
            metadata.insert_header(&tenant.region_header, region.clone());
        }
        if let (Some(plan), Some(header)) = (&self.plan, tenant.plan_headers.first()) {
            metadata.insert_header(header, plan.clone());
        }
        metadata
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatekeeper");

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Check { tenant, cost } => {
            let limiter = HierarchicalLimiter::from_config(&config)?;
            let decision = limiter.admit(&tenant.to_metadata(&config), cost).await;
            let headers: serde_json::Map<String, serde_json::Value> = decision
                .rate_limit_headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into()))
                .collect();

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "decision": decision, "headers": headers }))?
            );
        }
        Command::Simulate {
            tenant,
            requests,
            cost,
            interval_ms,
        } => {
            let limiter = Arc::new(HierarchicalLimiter::from_config(&config)?);
            let sweeper = limiter.local().clone().spawn_sweeper(
                limiter.clock().clone(),
                Duration::from_secs(config.local.sweep_interval_secs),
            );
            let metadata = tenant.to_metadata(&config);

            let burst = async {
                for i in 1..=requests {
                    let decision = limiter.admit(&metadata, cost).await;
                    println!("{}", json!({ "request": i, "decision": decision }));

                    if interval_ms > 0 && i < requests {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                }
            };

            tokio::select! {
                _ = burst => {}
                _ = shutdown_signal() => {
                    warn!("Simulation interrupted");
                }
            }
            sweeper.abort();

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "metrics": limiter.metrics().snapshot(),
                    "fallbacks": limiter.fallback_count(),
                }))?
            );
        }
        Command::Inspect { key } => {
            let key = ScopeKey::parse(&key)
                .with_context(|| format!("Not a bucket key: {}", key))?;
            let limiter = HierarchicalLimiter::from_config(&config)?;

            let shared = match limiter.distributed() {
                Some(backend) => json!(backend.peek(&key).await?),
                None => serde_json::Value::Null,
            };
            let local = limiter.local().state(&key);

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "key": key.as_str(), "shared": shared, "local": local }))?
            );
        }
    }

    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
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
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
