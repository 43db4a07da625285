//! Operator tool for inspecting and exercising an index commit log.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_index::{
    EventRecord, IndexApplier, IndexQueue, IndexQueueConfig, MembershipEvent, MembershipSubscriber,
};

#[derive(Parser)]
#[command(name = "indexctl")]
#[command(about = "Inspect and drive a holo_index commit log", long_about = None)]
struct Args {
    /// Host data directory; the queue lives in its `commit-logs` subdirectory.
    #[arg(long, env = "HOLO_INDEX_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print queue and consumer statistics as JSON.
    Stats,
    /// Durably publish one event and print its write generation.
    Publish {
        key: String,
        /// Row payload; ignored with `--delete`.
        #[arg(default_value = "")]
        payload: String,
        /// Source table tag used by `by_source` fan-out.
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = false)]
        delete: bool,
    },
    /// Apply pending events with a logging index until caught up.
    Drain {
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

/// Index that only logs what it is given.
#[derive(Default)]
struct LoggingIndex {
    applied: AtomicU64,
}

impl IndexApplier for LoggingIndex {
    fn index_name(&self) -> &str {
        "indexctl-log"
    }

    fn apply(&self, event: &EventRecord) -> anyhow::Result<()> {
        self.applied.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            kind = ?event.kind(),
            key = %String::from_utf8_lossy(event.key()),
            payload_len = event.payload().len(),
            source = ?event.source(),
            "drained index event"
        );
        Ok(())
    }

    fn live_size(&self) -> Option<u64> {
        Some(self.applied.load(Ordering::Relaxed))
    }
}

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holo_index=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = IndexQueueConfig::from_env(&args.data_dir).context("load index queue config")?;
    let queue = IndexQueue::open(config).context("open index queue")?;

    match args.command {
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&queue.stats())?);
        }
        Command::Publish {
            key,
            payload,
            source,
            delete,
        } => {
            let record = if delete {
                EventRecord::delete(key)?
            } else {
                EventRecord::upsert(key, payload)?
            };
            let record = match source {
                Some(source) => record.with_source(source)?,
                None => record,
            };
            let generation = queue.publish_event(record)?;
            println!("{generation}");
        }
        Command::Drain { timeout_ms } => {
            let target = queue.write_generation();
            queue.register(Arc::new(LoggingIndex::default()));
            queue.on_membership_event(&MembershipEvent::Joined(queue.config().local_node));
            queue
                .catch_up_timeout(target, Duration::from_millis(timeout_ms))
                .context("drain index commit log")?;
            println!("{}", serde_json::to_string_pretty(&queue.stats())?);
        }
    }

    queue.shutdown()?;
    Ok(())
}
