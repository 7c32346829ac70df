//! # Askgate CLI
//!
//! ```bash
//! askgate serve                      # start the gateway
//! askgate ask "status of CTT-21761"  # one-shot query, chunks to stdout
//! askgate init                       # create the stores
//! askgate cache stats                # vector cache statistics
//! askgate cache evict --target 50000
//! ```
//!
//! Configuration comes from `--config <toml>` plus the environment
//! (`BIND_ADDR`, `STORE_URL`, `VECTOR_DIR`, `LOG_LEVEL`, `CORS_ORIGINS`).
//!
//! Exit codes: `0` normal, `1` configuration error, `2` unrecoverable store
//! failure at startup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use askgate::config::{load_config, Config};
use askgate::core::Core;
use askgate::models::{Query, SourceId};
use askgate::pipeline;
use askgate::server;

#[derive(Parser)]
#[command(
    name = "askgate",
    about = "Askgate — a streaming retrieval-augmented answering gateway",
    version
)]
struct Cli {
    /// Path to a TOML configuration file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway.
    Serve,

    /// Run one query through the pipeline and print the answer.
    ///
    /// Uses the stored settings for `--user` (default `default`).
    Ask {
        /// The question.
        question: String,
        /// Settings owner.
        #[arg(long, default_value = "default")]
        user: String,
        /// Session for history threading.
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Create the store and vector cache databases.
    Init,

    /// Vector cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count and hit statistics.
    Stats,
    /// Evict least-recently-used entries down to a target size.
    Evict {
        #[arg(long)]
        target: usize,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };
    init_tracing(&config);

    let core = match Core::init(config).await {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!("startup failed: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Serve => server::run_server(Arc::clone(&core)).await,
        Commands::Ask {
            question,
            user,
            session,
        } => run_ask(&core, question, user, session).await,
        Commands::Init => {
            // Core::init already created both databases.
            println!("stores initialized");
            Ok(())
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                println!(
                    "entries: {}\ntotal hits: {}",
                    core.cache.len(),
                    core.cache.total_hits()
                );
                Ok(())
            }
            CacheAction::Evict { target } => match core.cache.evict(target).await {
                Ok(()) => {
                    println!("evicted to {} entries", core.cache.len());
                    Ok(())
                }
                Err(e) => Err(e),
            },
        },
    };

    core.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_ask(
    core: &Arc<Core>,
    question: String,
    user: String,
    session: String,
) -> anyhow::Result<()> {
    let Some(settings) = core.store.load_settings(&user).await? else {
        anyhow::bail!(
            "no settings stored for user '{}'; POST /settings first or pass --user",
            user
        );
    };

    let query = Query {
        text: question,
        session_id: session,
        user_id: user,
        deadline: Instant::now() + core.config.query_deadline(),
        options: core.query_options(&settings),
    };

    let outcome = pipeline::run_query_collected(core, query, settings)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.kind.as_str(), e.message))?;

    println!("{}", outcome.response);
    if !outcome.used_sources.is_empty() {
        let names: Vec<&str> = outcome
            .used_sources
            .iter()
            .map(SourceId::as_str)
            .collect();
        eprintln!("\n[sources: {}]", names.join(", "));
    }
    Ok(())
}
