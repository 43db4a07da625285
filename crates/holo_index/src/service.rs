//! Host-facing entry point: publish, catch-up, registration and management.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::IndexQueueConfig;
use crate::consumer::{Consumer, ConsumerOptions, ConsumerState};
use crate::error::{IndexError, Result};
use crate::event::EventRecord;
use crate::lifecycle::{LifecycleController, MembershipEvent, MembershipSubscriber, NodeId};
use crate::queue::{DurableQueue, QueueOptions};
use crate::registry::{IndexApplier, IndexRegistry};

/// Per-index section of [`IndexQueueStats`].
#[derive(Clone, Debug, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub source: Option<String>,
    pub live_size: Option<u64>,
    pub shards: Option<Vec<String>>,
    pub description: Option<String>,
}

/// Point-in-time view of the queue for operators.
#[derive(Clone, Debug, Serialize)]
pub struct IndexQueueStats {
    pub queue_dir: String,
    pub local_node: NodeId,
    pub live: bool,
    pub write_generation: u64,
    pub read_generation: u64,
    pub pending: usize,
    pub log_bytes: u64,
    pub consumer_state: ConsumerState,
    pub applied_events: u64,
    pub last_error: Option<String>,
    pub indexes: Vec<IndexStats>,
}

/// The asynchronous secondary-index pipeline of one node.
///
/// Writers `publish` row mutations, a background consumer applies them to the
/// registered indexes, and readers `catch_up` to a previously returned
/// generation before querying an index.
pub struct IndexQueue {
    config: IndexQueueConfig,
    queue: Arc<DurableQueue>,
    registry: Arc<IndexRegistry>,
    consumer: Arc<Consumer>,
    lifecycle: LifecycleController,
}

impl std::fmt::Debug for IndexQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexQueue")
            .field("queue", &self.queue)
            .field("indexes", &self.registry.list())
            .field("consumer", &self.consumer.state())
            .finish()
    }
}

impl IndexQueue {
    /// Open the queue under `config.data_dir` and recover its state.
    ///
    /// The consumer stays stopped until the local node is reported live.
    pub fn open(config: IndexQueueConfig) -> Result<Arc<Self>> {
        let queue_dir = config.queue_dir();
        let queue = DurableQueue::open(
            &queue_dir,
            QueueOptions {
                sync_mode: config.sync_mode,
                compact_threshold_bytes: config.compact_threshold_bytes,
            },
        )
        .map_err(IndexError::Construction)?;
        let queue = Arc::new(queue);
        let registry = Arc::new(IndexRegistry::new(config.fan_out));
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            registry.clone(),
            ConsumerOptions {
                poll_interval: config.poll_interval,
                retry_backoff_min: config.retry_backoff_min,
                retry_backoff_max: config.retry_backoff_max,
            },
        ));
        let lifecycle =
            LifecycleController::new(config.local_node, consumer.clone(), registry.clone());

        tracing::info!(
            path = %queue_dir.display(),
            node = config.local_node,
            write_generation = queue.write_generation(),
            read_generation = queue.read_generation(),
            pending = queue.len(),
            fan_out = ?config.fan_out,
            "index queue opened"
        );
        Ok(Arc::new(Self {
            config,
            queue,
            registry,
            consumer,
            lifecycle,
        }))
    }

    /// Configuration the queue was opened with.
    pub fn config(&self) -> &IndexQueueConfig {
        &self.config
    }

    /// Durably enqueue an upsert of `key` and return its write generation.
    pub fn publish(&self, key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<u64> {
        self.publish_event(EventRecord::upsert(key, payload)?)
    }

    /// Durably enqueue a delete of `key` and return its write generation.
    pub fn publish_delete(&self, key: impl Into<Vec<u8>>) -> Result<u64> {
        self.publish_event(EventRecord::delete(key)?)
    }

    /// Durably enqueue a prepared record and return its write generation.
    pub fn publish_event(&self, record: EventRecord) -> Result<u64> {
        let kind = record.kind();
        let generation = self.queue.enqueue(record)?;
        tracing::debug!(generation, ?kind, "published index event");
        Ok(generation)
    }

    /// Block until every event up to `target` has been applied.
    pub fn catch_up(&self, target: u64) {
        self.queue.reads().wait_at_least(target, None);
    }

    /// Like [`catch_up`](Self::catch_up) but gives up after `timeout`.
    pub fn catch_up_timeout(&self, target: u64, timeout: Duration) -> Result<()> {
        if self.queue.reads().wait_at_least(target, Some(timeout)) {
            return Ok(());
        }
        Err(IndexError::CatchUpTimeout {
            target,
            read_generation: self.queue.read_generation(),
        })
    }

    /// Register an index applier; starts the consumer when the node is live.
    ///
    /// Returns `false` if an index with the same name already exists.
    pub fn register(&self, applier: Arc<dyn IndexApplier>) -> bool {
        let added = self.registry.register(applier);
        if added {
            if let Err(err) = self.lifecycle.maybe_start() {
                tracing::error!(error = %err, "failed to start index consumer after registration");
            }
        }
        added
    }

    /// Operator restart of a halted consumer; see
    /// [`LifecycleController::restart_consumer`].
    pub fn restart_consumer(&self) -> Result<bool> {
        self.lifecycle.restart_consumer()
    }

    /// Membership-driven controller of the consumer.
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// The background consumer.
    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Sorted names of the registered indexes.
    pub fn list_indexes(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Generation of the last published event.
    pub fn write_generation(&self) -> u64 {
        self.queue.write_generation()
    }

    /// Generation of the last applied event.
    pub fn read_generation(&self) -> u64 {
        self.queue.read_generation()
    }

    /// Events published but not yet applied.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Current consumer state.
    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer.state()
    }

    /// Live entry count reported by the named index.
    pub fn index_size(&self, name: &str) -> Option<u64> {
        self.registry.get(name)?.live_size()
    }

    /// Shard descriptions reported by the named index.
    pub fn index_shards(&self, name: &str) -> Option<Vec<String>> {
        self.registry.get(name)?.shards()
    }

    /// Free-form description reported by the named index.
    pub fn describe_index(&self, name: &str) -> Option<String> {
        self.registry.get(name)?.describe()
    }

    /// Snapshot of counters, consumer state and per-index reports.
    pub fn stats(&self) -> IndexQueueStats {
        let indexes = self
            .registry
            .list()
            .into_iter()
            .filter_map(|name| self.registry.get(&name))
            .map(|applier| IndexStats {
                name: applier.index_name().to_string(),
                source: applier.source().map(str::to_string),
                live_size: applier.live_size(),
                shards: applier.shards(),
                description: applier.describe(),
            })
            .collect();
        IndexQueueStats {
            queue_dir: self.queue.dir().display().to_string(),
            local_node: self.lifecycle.local_node(),
            live: self.lifecycle.is_live(),
            write_generation: self.queue.write_generation(),
            read_generation: self.queue.read_generation(),
            pending: self.queue.len(),
            log_bytes: self.queue.log_bytes(),
            consumer_state: self.consumer.state(),
            applied_events: self.consumer.applied_events(),
            last_error: self.consumer.last_error(),
            indexes,
        }
    }

    /// Stop the consumer, then flush and close the queue.
    pub fn shutdown(&self) -> Result<()> {
        self.consumer.shutdown();
        self.queue.close()
    }
}

impl MembershipSubscriber for IndexQueue {
    fn on_membership_event(&self, event: &MembershipEvent) {
        self.lifecycle.on_membership_event(event);
    }
}
