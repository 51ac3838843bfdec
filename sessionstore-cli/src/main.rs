//! sessionstore: operate a session persistence store from the command line.
//!
//! # Subcommands
//! - `health`: connect and print the backend version
//! - `migrate`: create the sessions table and indexes
//! - `import <file.jsonl> [--preserve-updated-at]`: bulk upsert NDJSON session records
//! - `seed --count N [--agent-id X]`: bulk upsert synthetic sessions
//! - `get <id>`, `list`, `delete <id>`: single-record operations

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sessionstore_core::{CancellationToken, FilterField, ListFilter, Store, StoreConfig};
use sessionstore_ingest::{import_ndjson_cancellable, synthetic_sessions, ImportOptions};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sessionstore", author, version, about, long_about = None)]
struct Cli {
    /// Config file (TOML); SESSIONSTORE__* env vars override it
    #[arg(short, long, env = "SESSIONSTORE_CONFIG", default_value = "sessionstore.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check database connectivity
    Health,

    /// Create the sessions table and indexes if absent
    Migrate,

    /// Import newline-delimited JSON session records
    Import {
        file: PathBuf,

        /// Keep each record's updated_at instead of stamping the write time
        #[arg(long)]
        preserve_updated_at: bool,

        /// Records per bulk upsert call
        #[arg(long, default_value_t = 10_000)]
        chunk_size: usize,
    },

    /// Generate and bulk upsert synthetic sessions
    Seed {
        #[arg(short = 'n', long, default_value_t = 1_000)]
        count: usize,

        /// Assign every session to this agent
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Print one session as JSON
    Get { session_id: String },

    /// List sessions, newest first
    List {
        #[arg(long)]
        agent_id: Option<String>,

        #[arg(long)]
        user_id: Option<String>,

        #[arg(short = 'n', long)]
        limit: Option<u32>,

        /// Oldest first
        #[arg(long)]
        ascending: bool,
    },

    /// Delete one session
    Delete { session_id: String },
}

fn init_logging(level: &str) {
    let directive = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Interrupt received, stopping after the current window");
                token.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = StoreConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;
    init_logging(&config.logging.level);

    let store = Store::connect(&config)
        .await
        .context("Failed to open session store")?;

    let result = run(cli.command, &store).await;
    store.close().await.context("Failed to close session store")?;
    result
}

async fn run(command: Commands, store: &Store) -> anyhow::Result<()> {
    match command {
        Commands::Health => {
            let version = store.health_check().await.context("Health check failed")?;
            println!("✅ {} connected: {}", store.backend_name(), version);
        }

        Commands::Migrate => {
            store.ensure_schema().await.context("Schema bootstrap failed")?;
            println!("✅ Session schema ready");
        }

        Commands::Import {
            file,
            preserve_updated_at,
            chunk_size,
        } => {
            let opts = ImportOptions {
                chunk_size,
                preserve_updated_at,
            };
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let summary = import_ndjson_cancellable(store, &file, &opts, &cancel)
                .await
                .with_context(|| format!("Import of {} failed", file.display()))?;
            println!(
                "✓ Imported {} sessions from {} lines in {:?} ({:.0} records/sec, {} windows, {} shrinks)",
                summary.records,
                summary.lines,
                summary.elapsed,
                summary.records_per_sec(),
                summary.windows,
                summary.shrinks
            );
        }

        Commands::Seed { count, agent_id } => {
            let sessions = synthetic_sessions(count, agent_id.as_deref());
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let report = store
                .upsert_many_cancellable(&sessions, false, &cancel)
                .await
                .context("Seeding failed")?;
            let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
            println!(
                "✓ Seeded {} sessions in {:?} ({:.0} records/sec, {} windows, {} attempts)",
                report.records,
                report.elapsed,
                report.records as f64 / secs,
                report.windows,
                report.attempts
            );
        }

        Commands::Get { session_id } => {
            let session = store
                .get(&session_id)
                .await
                .with_context(|| format!("Failed to load session {session_id}"))?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }

        Commands::List {
            agent_id,
            user_id,
            limit,
            ascending,
        } => {
            let mut filter = ListFilter::new();
            if let Some(agent_id) = agent_id {
                filter = filter.with(FilterField::AgentId, agent_id);
            }
            if let Some(user_id) = user_id {
                filter = filter.with(FilterField::UserId, user_id);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            if ascending {
                filter = filter.ascending();
            }

            let sessions = store.list(&filter).await.context("Failed to list sessions")?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }

        Commands::Delete { session_id } => {
            store
                .delete(&session_id)
                .await
                .with_context(|| format!("Failed to delete session {session_id}"))?;
            println!("✓ Deleted {session_id}");
        }
    }

    Ok(())
}
