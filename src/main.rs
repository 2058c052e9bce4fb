use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use llmgate::{Gateway, GatewayConfig, ProviderEndpoint};

#[derive(Parser)]
#[command(name = "llmgate", version, about = "Inspect and manage shared LLM provider quotas")]
struct Cli {
    /// YAML configuration file; LLMGATE_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print limiter stats as JSON
    Stats,
    /// Clear the counters of one limiter
    Reset {
        provider: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Resolve a logical model name
    Map {
        model: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Acquire and release one slot, reporting the wait
    Acquire {
        provider: String,
        #[arg(long)]
        endpoint: Option<String>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let gateway = Gateway::from_config(&config).await?;

    match cli.command {
        Command::Stats => {
            let stats = gateway.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reset { provider, endpoint } => {
            let target = ProviderEndpoint::new(&provider, endpoint.as_deref());
            let limiter = gateway
                .limiter(&target)
                .with_context(|| format!("No limiter configured for {}", target))?;
            limiter.clear_state().await?;
            println!("Cleared {}", target);
        }
        Command::Map { model, count } => {
            for _ in 0..count {
                let route = gateway.balancer().route(&model).await?;
                println!("{} -> {} ({})", route.logical, route.model, route.target);
            }
        }
        Command::Acquire {
            provider,
            endpoint,
            timeout_ms,
        } => {
            let target = ProviderEndpoint::new(&provider, endpoint.as_deref());
            let limiter = gateway
                .limiter(&target)
                .with_context(|| format!("No limiter configured for {}", target))?;

            let started = Instant::now();
            let permit = match timeout_ms {
                Some(ms) => limiter.acquire_timeout(Duration::from_millis(ms)).await?,
                None => limiter.acquire().await?,
            };
            let waited = started.elapsed();
            permit.release().await;
            println!("Admitted to {} after {} ms", target, waited.as_millis());
        }
    }

    Ok(())
}
