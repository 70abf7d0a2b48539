//! Zentinel Map Local Agent - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_agent_map_local::{Action, Exchange, Interceptor, MapLocalAgent, MapLocalConfig};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-agent-map-local",
    about = "Map Local agent for Zentinel proxy - serve local files in place of upstream responses",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "map-local.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Run a request for this URL through the rules and print the decision
    #[arg(long, value_name = "URL")]
    probe: Option<String>,

    /// HTTP method used with --probe
    #[arg(long, default_value = "GET", requires = "probe")]
    method: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MapLocalConfig::from_file(&args.config)?
    } else if args.validate || args.probe.is_some() {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no rules)");
        MapLocalConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} rules defined)",
            config.rules.len()
        );
        return Ok(());
    }

    let agent = MapLocalAgent::new(config)?;

    match args.probe {
        Some(url) => {
            let exchange = Exchange::new(args.method.as_str(), url.as_str());
            let decision = match agent.on_exchange(&exchange).await {
                Action::Passthrough => json!({ "action": "passthrough" }),
                Action::Replace(replacement) => json!({
                    "action": "replace",
                    "status": replacement.status,
                    "headers": replacement.headers,
                    "body_bytes": replacement.body.len(),
                }),
                Action::Block(block) => json!({
                    "action": "block",
                    "status": block.status,
                    "reason": block.reason,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        None => {
            let snapshot = agent.rules().snapshot();
            println!("mode: {:?}", snapshot.mode);
            for rule in &snapshot.rules {
                println!(
                    "{:>5}  {:<20} {:<9} {} -> {}{}",
                    rule.priority,
                    rule.id,
                    format!("{:?}", rule.kind).to_lowercase(),
                    rule.source,
                    rule.local_path.display(),
                    if rule.enabled { "" } else { "  (disabled)" },
                );
            }
        }
    }

    agent.on_shutdown().await;
    Ok(())
}
