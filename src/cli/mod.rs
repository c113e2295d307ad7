use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod chat;
pub mod migrate;
pub mod query;
pub mod serve;

use crate::chat::{HistoryStore, QueryService};
use crate::core::ConfigStore;
use crate::llm::RelayClient;

#[derive(Subcommand)]
enum Command {
    /// Create the history table if it doesn't exist
    Migrate {},
    /// Run the API server
    Serve {
        /// Override the configured server host address
        #[arg(long)]
        host: Option<String>,

        /// Override the configured server port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send a single prompt and print the reply
    Query {
        #[arg(long)]
        model: String,
        prompt: String,
    },
    /// Start an interactive chat session
    Chat {
        #[arg(long)]
        model: String,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(long, global = true, env = "RELAY_CONFIG", default_value = "./api.json")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // axum logs rejections from built-in extractors with the `axum::rejection`
                // target, at `TRACE` level. `axum::rejection=trace` enables showing those events
                format! {
                    "{}=debug,tower_http=debug,axum::rejection=trace",
                    env!("CARGO_CRATE_NAME")
                }
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load the config and wire up the query service with the history
/// reloaded from the store. A missing or malformed config is fatal.
pub async fn build_service(config_path: &str) -> Result<QueryService> {
    let config = ConfigStore::load(config_path)?;
    let store = HistoryStore::new(&config.config().api_db);
    let gateway = RelayClient::from_config(config.config())?;
    Ok(QueryService::restore(config, store, Box::new(gateway)).await)
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    // Handle each sub command
    match args.command {
        Some(Command::Migrate {}) => {
            migrate::run(&args.config).await?;
        }
        Some(Command::Serve { host, port }) => {
            serve::run(&args.config, host, port).await?;
        }
        Some(Command::Query { model, prompt }) => {
            query::run(&args.config, &model, &prompt).await?;
        }
        Some(Command::Chat { model }) => {
            chat::run(&args.config, &model).await?;
        }
        None => {}
    }

    Ok(())
}
