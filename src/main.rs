//! chatrelay - OpenAI-compatible relay for chatpro-style streaming upstreams
//!
//! Accepts Chat Completions requests and answers them from an upstream that
//! streams full-text snapshots, re-prompting transparently when the upstream
//! truncates its reply.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::Config;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "OpenAI-compatible relay for chatpro-style streaming upstreams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file (built-in defaults when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Show the routing table and model catalog
    Models {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatrelay={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut cfg = Config::load(config.as_deref())?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = ?config, "Loaded configuration");

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            chatrelay::proxy::run_server(cfg).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            let cfg = Config::load(config.as_deref())?;
            println!(
                "Configuration OK: {} route(s), {} model(s), listen {}",
                cfg.upstream.routes.len(),
                cfg.catalog.models.len(),
                cfg.server.listen
            );
            Ok(())
        }

        Commands::Models { config } => {
            init_tracing("warn");
            let cfg = Config::load(config.as_deref())?;

            println!("Routes (first match wins):");
            for route in &cfg.upstream.routes {
                println!("  {:<10} {:<8} {}", format!("{}*", route.prefix), route.family, route.url);
            }

            println!("Models:");
            for model in &cfg.catalog.models {
                println!("  {}", model);
            }
            Ok(())
        }
    }
}
