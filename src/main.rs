//! `fieldops`: inspect and drain the local mutation queue.
//!
//! Usage:
//!   fieldops demo [--seed 7]
//!   fieldops pending --db fieldops.db
//!   fieldops sync --db fieldops.db --api-url https://api.example.org --token ...
//!   fieldops clear-dead-letter --db fieldops.db 12
//!   fieldops requeue --db fieldops.db 12

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sync_engine::{
    describe, HttpProbe, HttpRemote, LocalStore, MutationQueue, PendingMutation, ReachabilityProbe, StaticToken,
    SyncConfig, SyncEngine, SyncTrigger,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fieldops")]
#[command(about = "Offline-first sync client for cooperative fleet data", long_about = None)]
struct Cli {
    /// JSON file overriding the sync tuning defaults
    #[arg(long, global = true, env = "FIELDOPS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Path of the local SQLite store
    #[arg(long, env = "FIELDOPS_DB", default_value = "fieldops.db")]
    db: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the offline scenario against an in-memory server
    Demo {
        #[arg(long)]
        seed: Option<u64>,
    },
    /// List queued mutations and dead letters
    Pending {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Drain the queue once against the remote service
    Sync {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long, env = "FIELDOPS_API_URL")]
        api_url: String,
        /// Bearer token; without one the drain is deferred
        #[arg(long, env = "FIELDOPS_TOKEN")]
        token: Option<String>,
    },
    /// Discard a dead-lettered mutation
    ClearDeadLetter {
        #[command(flatten)]
        store: StoreArgs,
        sequence_id: u64,
    },
    /// Move a dead-lettered mutation back into the queue
    Requeue {
        #[command(flatten)]
        store: StoreArgs,
        sequence_id: u64,
    },
}

fn print_mutation(m: &PendingMutation) {
    println!(
        "#{:<5} {:<40} {}  attempts={}{}",
        m.sequence_id,
        describe(m),
        m.created_at.format("%Y-%m-%d %H:%M:%S"),
        m.attempts,
        m.last_error.as_deref().map(|e| format!("  error: {}", e)).unwrap_or_default()
    );
}

fn open_store(args: &StoreArgs) -> anyhow::Result<LocalStore<sync_engine::SqliteStorage>> {
    LocalStore::open(&args.db).with_context(|| format!("opening store {}", args.db))
}

async fn sync_once(config: SyncConfig, store: &StoreArgs, api_url: &str, token: Option<String>) -> anyhow::Result<()> {
    let queue = MutationQueue::new(open_store(store)?);
    let remote = HttpRemote::new(api_url, config.request_timeout)?;
    let auth = match token {
        Some(token) => StaticToken::new(token),
        None => StaticToken::empty(),
    };
    let probe = HttpProbe::new(api_url, config.request_timeout)?;
    let engine = SyncEngine::new(queue, Arc::new(remote), Arc::new(auth), config);

    engine.set_online(probe.check().await);
    let report = engine.sync_now(SyncTrigger::Manual).await?;
    println!(
        "{:?}: {} acked, {} remapped, {} dead-lettered",
        report.outcome, report.acked, report.remapped, report.dead_lettered
    );
    if let Some(delay) = report.retry_after {
        println!("retry suggested in {:?}", delay);
    }
    let cursor = engine.cursor()?;
    if let Some(seq) = cursor.lowest_unacked {
        println!("next unacked mutation: #{}", seq);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldops_sync=info,sync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Command::Demo { seed } => fieldops_sync::demo::run(seed).await?,
        Command::Pending { store } => {
            let store = open_store(&store)?;
            let pending = store.pending_mutations()?;
            println!("{} pending", pending.len());
            pending.iter().for_each(print_mutation);
            let dead = store.dead_letters()?;
            if !dead.is_empty() {
                println!("{} awaiting review", dead.len());
                dead.iter().for_each(print_mutation);
            }
        }
        Command::Sync { store, api_url, token } => sync_once(config, &store, &api_url, token).await?,
        Command::ClearDeadLetter { store, sequence_id } => {
            if open_store(&store)?.clear_dead_letter(sequence_id)? {
                println!("cleared #{}", sequence_id);
            } else {
                println!("#{} is not a dead letter", sequence_id);
            }
        }
        Command::Requeue { store, sequence_id } => {
            if open_store(&store)?.requeue_dead_letter(sequence_id)? {
                println!("requeued #{}", sequence_id);
            } else {
                println!("#{} is not a dead letter", sequence_id);
            }
        }
    }
    Ok(())
}
