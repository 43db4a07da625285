//! Runtime configuration for the index queue.
//!
//! Defaults are usable as-is; `from_env` layers `HOLO_INDEX_*` overrides on
//! top so operators can tune durability and retry behavior without a rebuild.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::lifecycle::NodeId;

/// Default wait between queue polls while the consumer checks for stop requests.
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
/// Default first retry delay after an applier failure.
const DEFAULT_RETRY_MIN_MS: u64 = 10;
/// Default cap on the retry delay.
const DEFAULT_RETRY_MAX_MS: u64 = 5_000;
/// Truncate a drained log once it grows past this many bytes.
const DEFAULT_COMPACT_BYTES: u64 = 64 * 1024 * 1024;

/// Sync strategy used when persisting queue records and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Rely on OS buffering; a crash may lose the most recent appends.
    None,
    Data,
    All,
}

impl SyncMode {
    /// Parse the persistence mode string; unset or unknown values pick the safest mode.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("none") | Some("buffer") => SyncMode::None,
            Some("sync_data") => SyncMode::Data,
            Some("sync_all") => SyncMode::All,
            Some(other) => {
                tracing::warn!(mode = other, "unknown sync mode, using sync_all");
                SyncMode::All
            }
            None => SyncMode::All,
        }
    }

    /// Fjall persist mode for this sync mode; `None` skips the explicit persist.
    pub(crate) fn persist_mode(self) -> Option<fjall::PersistMode> {
        match self {
            SyncMode::None => None,
            SyncMode::Data => Some(fjall::PersistMode::SyncData),
            SyncMode::All => Some(fjall::PersistMode::SyncAll),
        }
    }
}

/// Which registered appliers receive a given event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FanOut {
    /// Every event is applied by every registered applier.
    #[default]
    Broadcast,
    /// Events tagged with a source table only reach appliers for that table;
    /// untagged events still go to everyone.
    BySource,
}

impl std::str::FromStr for FanOut {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "broadcast" | "all" => Ok(FanOut::Broadcast),
            "by_source" | "source" => Ok(FanOut::BySource),
            other => anyhow::bail!("invalid fan-out rule: {other}"),
        }
    }
}

/// Configuration for one [`crate::IndexQueue`].
#[derive(Clone, Debug)]
pub struct IndexQueueConfig {
    /// Host data directory; the queue lives under `<data_dir>/commit-logs`.
    pub data_dir: PathBuf,
    /// Identity of the local node in membership notifications.
    pub local_node: NodeId,
    pub sync_mode: SyncMode,
    pub fan_out: FanOut,
    /// How long the consumer blocks on an empty queue before re-checking its state.
    pub poll_interval: Duration,
    /// First delay between retries of a failing applier.
    pub retry_backoff_min: Duration,
    /// Upper bound for the doubling retry delay.
    pub retry_backoff_max: Duration,
    /// Log size at which a fully drained log is truncated (`0` disables).
    pub compact_threshold_bytes: u64,
}

impl IndexQueueConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            local_node: 1,
            sync_mode: SyncMode::All,
            fan_out: FanOut::Broadcast,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_backoff_min: Duration::from_millis(DEFAULT_RETRY_MIN_MS),
            retry_backoff_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            compact_threshold_bytes: DEFAULT_COMPACT_BYTES,
        }
    }

    /// Load defaults and apply `HOLO_INDEX_*` environment overrides.
    pub fn from_env(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = Self::new(data_dir);
        cfg.local_node = parse_u64(std::env::var("HOLO_INDEX_NODE_ID").ok(), cfg.local_node)?;
        if let Ok(raw) = std::env::var("HOLO_INDEX_SYNC_MODE") {
            cfg.sync_mode = SyncMode::parse(Some(&raw));
        }
        if let Ok(raw) = std::env::var("HOLO_INDEX_FAN_OUT") {
            cfg.fan_out = raw.parse().context("parse HOLO_INDEX_FAN_OUT")?;
        }
        cfg.poll_interval = Duration::from_millis(
            parse_u64(
                std::env::var("HOLO_INDEX_POLL_INTERVAL_MS").ok(),
                DEFAULT_POLL_INTERVAL_MS,
            )?
            .max(1),
        );
        cfg.retry_backoff_min = Duration::from_millis(parse_u64(
            std::env::var("HOLO_INDEX_RETRY_MIN_MS").ok(),
            DEFAULT_RETRY_MIN_MS,
        )?);
        cfg.retry_backoff_max = Duration::from_millis(parse_u64(
            std::env::var("HOLO_INDEX_RETRY_MAX_MS").ok(),
            DEFAULT_RETRY_MAX_MS,
        )?)
        .max(cfg.retry_backoff_min);
        cfg.compact_threshold_bytes = parse_u64(
            std::env::var("HOLO_INDEX_COMPACT_BYTES").ok(),
            DEFAULT_COMPACT_BYTES,
        )?;
        Ok(cfg)
    }

    /// Directory holding the commit log and the generation counters.
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join(crate::COMMIT_LOGS)
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> anyhow::Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
