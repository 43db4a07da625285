//! Durable named generation counters.
//!
//! Counters live in a fjall partition keyed by name with a big-endian `u64`
//! value. Each counter keeps its current value in memory for lock-free reads
//! and wakes waiters through a condition variable whenever it advances, which
//! is what catch-up waits on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::config::SyncMode;

/// Partition holding every counter of one store.
const GENERATIONS_PARTITION: &str = "generations";

/// Poison-tolerant mutex guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StoreInner {
    keyspace: Keyspace,
    partition: PartitionHandle,
    sync_mode: SyncMode,
    // Weak so dropping every handle releases the keyspace.
    counters: Mutex<HashMap<String, Weak<CounterInner>>>,
}

/// Fjall-backed home of the durable counters.
#[derive(Clone)]
pub struct GenerationStore {
    inner: Arc<StoreInner>,
}

impl GenerationStore {
    /// Open or create the counter keyspace at `dir`.
    pub fn open(dir: impl AsRef<Path>, sync_mode: SyncMode) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let keyspace = fjall::Config::new(dir)
            .open()
            .with_context(|| format!("open generation keyspace {}", dir.display()))?;
        let partition = keyspace
            .open_partition(GENERATIONS_PARTITION, PartitionCreateOptions::default())
            .context("open generations partition")?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                keyspace,
                partition,
                sync_mode,
                counters: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Open the counter called `name`, creating it at zero if it was never persisted.
    ///
    /// Repeated calls with the same name share one in-memory counter.
    pub fn counter(&self, name: &str) -> anyhow::Result<Counter> {
        let mut counters = lock(&self.inner.counters);
        if let Some(inner) = counters.get(name).and_then(Weak::upgrade) {
            return Ok(Counter { inner });
        }

        let value = match self
            .inner
            .partition
            .get(name.as_bytes())
            .with_context(|| format!("read counter {name}"))?
        {
            Some(bytes) => {
                decode_value(&bytes).with_context(|| format!("decode counter {name}"))?
            }
            None => {
                self.inner
                    .partition
                    .insert(name.as_bytes(), 0u64.to_be_bytes().to_vec())
                    .with_context(|| format!("create counter {name}"))?;
                self.sync()?;
                tracing::debug!(counter = name, "created generation counter");
                0
            }
        };

        let counter = Counter {
            inner: Arc::new(CounterInner {
                name: name.to_string(),
                value: AtomicU64::new(value),
                update: Mutex::new(()),
                changed: Condvar::new(),
                store: self.clone(),
            }),
        };
        counters.insert(name.to_string(), Arc::downgrade(&counter.inner));
        Ok(counter)
    }

    /// Atomically persist new values for several counters in one write batch.
    ///
    /// Counter locks are taken in slice order; callers must use a consistent order.
    pub fn commit(&self, updates: &[(&Counter, u64)]) -> anyhow::Result<()> {
        let guards: Vec<MutexGuard<'_, ()>> = updates
            .iter()
            .map(|(counter, _)| lock(&counter.inner.update))
            .collect();

        let mut batch = self.inner.keyspace.batch();
        for (counter, value) in updates {
            batch.insert(
                &self.inner.partition,
                counter.name().as_bytes(),
                value.to_be_bytes().to_vec(),
            );
        }
        batch.commit().context("commit generation batch")?;
        self.sync()?;

        for (counter, value) in updates {
            counter.inner.value.store(*value, Ordering::Release);
            counter.inner.changed.notify_all();
        }
        drop(guards);
        Ok(())
    }

    /// Flush and fsync the keyspace regardless of the configured mode.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.inner
            .keyspace
            .persist(fjall::PersistMode::SyncAll)
            .context("persist generation keyspace")
    }

    /// Persist according to the configured sync mode.
    fn sync(&self) -> anyhow::Result<()> {
        if let Some(mode) = self.inner.sync_mode.persist_mode() {
            self.inner
                .keyspace
                .persist(mode)
                .context("sync generation keyspace")?;
        }
        Ok(())
    }

    /// Write one counter value and sync it.
    fn write_value(&self, name: &str, value: u64) -> anyhow::Result<()> {
        self.inner
            .partition
            .insert(name.as_bytes(), value.to_be_bytes().to_vec())
            .with_context(|| format!("write counter {name}"))?;
        self.sync()
    }
}

struct CounterInner {
    name: String,
    value: AtomicU64,
    // Serializes updates and pairs with `changed` for waiters.
    update: Mutex<()>,
    changed: Condvar,
    store: GenerationStore,
}

/// A durable, monotonic `u64` counter.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.inner.name)
            .field("value", &self.get())
            .finish()
    }
}

impl Counter {
    /// Key the counter is stored under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value; never blocks.
    pub fn get(&self) -> u64 {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Persist `value + 1` and return it.
    pub fn increment(&self) -> anyhow::Result<u64> {
        let _guard = lock(&self.inner.update);
        let next = self.get().saturating_add(1);
        self.inner.store.write_value(&self.inner.name, next)?;
        self.inner.value.store(next, Ordering::Release);
        self.inner.changed.notify_all();
        Ok(next)
    }

    /// Persist an explicit value. Used for cursor resets and recovery repair.
    pub(crate) fn set(&self, value: u64) -> anyhow::Result<()> {
        let _guard = lock(&self.inner.update);
        self.inner.store.write_value(&self.inner.name, value)?;
        self.inner.value.store(value, Ordering::Release);
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Block until the counter reaches `target`.
    ///
    /// Returns `false` if `timeout` elapses first; `None` waits indefinitely.
    pub fn wait_at_least(&self, target: u64, timeout: Option<Duration>) -> bool {
        if self.get() >= target {
            return true;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = lock(&self.inner.update);
        loop {
            if self.get() >= target {
                return true;
            }
            match deadline {
                None => {
                    guard = self
                        .inner
                        .changed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .inner
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = next;
                }
            }
        }
    }
}

/// Decode a stored big-endian counter value.
fn decode_value(buf: &[u8]) -> anyhow::Result<u64> {
    anyhow::ensure!(buf.len() == 8, "counter value is {} bytes", buf.len());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(buf);
    Ok(u64::from_be_bytes(raw))
}
