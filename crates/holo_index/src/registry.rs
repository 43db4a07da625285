//! Registry of index appliers the consumer fans events out to.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::FanOut;
use crate::event::EventRecord;

/// An index that knows how to absorb row mutation events.
///
/// Implementations are supplied by the index builders; the queue only needs
/// a stable name and an `apply` operation.
pub trait IndexApplier: Send + Sync + 'static {
    /// Unique name of the index.
    fn index_name(&self) -> &str;

    /// Apply one event to the index.
    fn apply(&self, event: &EventRecord) -> anyhow::Result<()>;

    /// Table this index is built over, used by [`FanOut::BySource`].
    fn source(&self) -> Option<&str> {
        None
    }

    /// Number of live entries, when the index can report it.
    fn live_size(&self) -> Option<u64> {
        None
    }

    /// Shard descriptions, when the index is sharded.
    fn shards(&self) -> Option<Vec<String>> {
        None
    }

    /// Human-readable description of the index definition.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Name-keyed set of registered appliers.
pub struct IndexRegistry {
    fan_out: FanOut,
    appliers: RwLock<BTreeMap<String, Arc<dyn IndexApplier>>>,
}

impl IndexRegistry {
    /// Empty registry routing events by `fan_out`.
    pub fn new(fan_out: FanOut) -> Self {
        Self {
            fan_out,
            appliers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Routing rule in effect.
    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    /// Register `applier` under its name.
    ///
    /// Returns `false` (and keeps the existing applier) if the name is taken.
    pub fn register(&self, applier: Arc<dyn IndexApplier>) -> bool {
        let name = applier.index_name().to_string();
        let mut appliers = self
            .appliers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if appliers.contains_key(&name) {
            tracing::debug!(index = %name, "index already registered");
            return false;
        }
        tracing::info!(index = %name, source = ?applier.source(), "registered index");
        appliers.insert(name, applier);
        true
    }

    /// Sorted names of every registered index.
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Applier registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn IndexApplier>> {
        self.read().get(name).cloned()
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when no index is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the appliers that should receive `event`, in name order.
    ///
    /// The lock is released before the caller applies anything.
    pub fn targets(&self, event: &EventRecord) -> Vec<Arc<dyn IndexApplier>> {
        let appliers = self.read();
        appliers
            .values()
            .filter(|applier| match (self.fan_out, event.source()) {
                (FanOut::Broadcast, _) | (FanOut::BySource, None) => true,
                (FanOut::BySource, Some(source)) => applier.source() == Some(source),
            })
            .cloned()
            .collect()
    }

    /// Poison-tolerant read guard.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<dyn IndexApplier>>> {
        self.appliers.read().unwrap_or_else(PoisonError::into_inner)
    }
}
