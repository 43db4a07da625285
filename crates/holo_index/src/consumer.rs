//! Background worker that drains the queue into the registered indexes.
//!
//! The worker takes the head record without removing it, applies it to every
//! targeted index, and only then acknowledges it, which advances the read
//! generation. Applier failures are retried with capped exponential backoff;
//! indexes that already applied the in-flight record are not called again.
//! Queue failures halt the worker.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{IndexError, Result};
use crate::event::EventRecord;
use crate::queue::{DurableQueue, QueuedEvent};
use crate::registry::{IndexApplier, IndexRegistry};

/// Poison-tolerant mutex guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    Running = 1,
    /// Stop requested; the in-flight record is being finished.
    Draining = 2,
    /// Stopped by a queue failure until an operator restarts it.
    Halted = 3,
}

impl ConsumerState {
    /// Inverse of the `repr(u8)` discriminant; unknown values read as stopped.
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConsumerState::Running,
            2 => ConsumerState::Draining,
            3 => ConsumerState::Halted,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Timing knobs for the consumer loop.
#[derive(Clone, Copy, Debug)]
pub struct ConsumerOptions {
    pub poll_interval: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            retry_backoff_min: Duration::from_millis(10),
            retry_backoff_max: Duration::from_secs(5),
        }
    }
}

struct Shared {
    queue: Arc<DurableQueue>,
    registry: Arc<IndexRegistry>,
    options: ConsumerOptions,
    state: AtomicU8,
    applied: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Single background consumer of the index event queue.
pub struct Consumer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Build a stopped consumer over `queue` feeding `registry`.
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<IndexRegistry>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                registry,
                options,
                state: AtomicU8::new(ConsumerState::Stopped as u8),
                applied: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    /// Start the worker thread unless it is already running.
    ///
    /// A worker that is still draining is joined first. Also restarts a
    /// halted consumer. Returns whether a new worker was started.
    pub fn start(&self) -> Result<bool> {
        self.start_if(|_| true)
    }

    /// Like [`start`](Self::start), but only if `allow` accepts the state left
    /// behind once any previous worker has been joined.
    ///
    /// `allow` runs under the worker lock, so a condition it checks cannot be
    /// invalidated by a concurrent start.
    pub(crate) fn start_if(&self, allow: impl FnOnce(ConsumerState) -> bool) -> Result<bool> {
        let mut worker = lock(&self.worker);
        if self.state() == ConsumerState::Running {
            return Ok(false);
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!("previous index consumer thread panicked");
            }
        }
        if !allow(self.state()) {
            return Ok(false);
        }

        self.shared
            .state
            .store(ConsumerState::Running as u8, Ordering::SeqCst);
        *lock(&self.shared.last_error) = None;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("index-consumer".to_string())
            .spawn(move || shared.run())
            .map_err(|err| {
                self.shared
                    .state
                    .store(ConsumerState::Stopped as u8, Ordering::SeqCst);
                IndexError::Construction(
                    anyhow::Error::new(err).context("spawn index consumer thread"),
                )
            })?;
        *worker = Some(handle);
        Ok(true)
    }

    /// Ask a running worker to wind down after its in-flight record.
    ///
    /// Returns `false` if the worker was not running.
    pub fn stop(&self) -> bool {
        let stopped = self
            .shared
            .state
            .compare_exchange(
                ConsumerState::Running as u8,
                ConsumerState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if stopped {
            tracing::info!("index consumer stop requested");
        }
        stopped
    }

    /// Move a halted consumer back to `Stopped` so it can be started again.
    ///
    /// Returns `false` if the consumer was not halted. The halting error stays
    /// in [`last_error`](Self::last_error) until a new worker starts.
    pub fn clear_halt(&self) -> bool {
        let cleared = self
            .shared
            .state
            .compare_exchange(
                ConsumerState::Halted as u8,
                ConsumerState::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if cleared {
            tracing::info!("index consumer halt cleared");
        }
        cleared
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&self) {
        self.stop();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("index consumer thread panicked");
            }
        }
    }

    /// Records applied and acknowledged by this process.
    pub fn applied_events(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// Error that halted the worker, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }
}

#[cfg(test)]
impl Consumer {
    /// Halt the worker as a queue failure would.
    pub(crate) fn halt_with(&self, err: IndexError) {
        self.shared.halt(err);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Decoded state word.
    fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while no stop or halt has been requested.
    fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    /// Worker loop body.
    fn run(&self) {
        tracing::info!(
            read_generation = self.queue.read_generation(),
            pending = self.queue.len(),
            "index consumer started"
        );
        while self.is_running() {
            let Some(event) = self.queue.peek(Some(self.options.poll_interval)) else {
                if self.queue.is_closed() {
                    tracing::info!("index queue closed, consumer exiting");
                    break;
                }
                continue;
            };
            // Stop requested while waiting; leave the record at the head.
            if !self.is_running() {
                break;
            }
            if !self.apply_with_retry(&event) {
                break;
            }
            match self.queue.ack(&event) {
                Ok(read_generation) => {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(read_generation, "index event applied");
                }
                Err(err) => {
                    self.halt(err);
                    return;
                }
            }
        }

        // Running only remains here when the queue closed underneath us.
        for from in [ConsumerState::Draining, ConsumerState::Running] {
            let _ = self.state.compare_exchange(
                from as u8,
                ConsumerState::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        tracing::info!(
            read_generation = self.queue.read_generation(),
            "index consumer stopped"
        );
    }

    /// Apply `event` to every targeted index, retrying failures until they
    /// succeed. Returns `false` if a stop was requested before completion.
    fn apply_with_retry(&self, event: &QueuedEvent) -> bool {
        let targets = self.registry.targets(event.record());
        let mut done = BTreeSet::new();
        let mut backoff = self.options.retry_backoff_min;
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let mut failed = 0usize;
            for applier in &targets {
                let name = applier.index_name();
                if done.contains(name) {
                    continue;
                }
                match apply_one(applier.as_ref(), event.record()) {
                    Ok(()) => {
                        done.insert(name.to_string());
                    }
                    Err(source) => {
                        failed += 1;
                        let err = IndexError::IndexApply {
                            index: name.to_string(),
                            generation: event.generation(),
                            source,
                        };
                        tracing::warn!(
                            error = %err,
                            attempt,
                            retry_in_ms = backoff.as_millis() as u64,
                            "index apply failed"
                        );
                    }
                }
            }
            if failed == 0 {
                return true;
            }
            if !self.sleep_while_running(backoff) {
                tracing::info!(
                    generation = event.generation(),
                    "stop requested during apply retry, event left at queue head"
                );
                return false;
            }
            backoff = backoff
                .saturating_mul(2)
                .min(self.options.retry_backoff_max)
                .max(Duration::from_millis(1));
        }
    }

    /// Sleep for `total`, waking early if the consumer leaves `Running`.
    fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = self.options.poll_interval.max(Duration::from_millis(1));
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(slice));
        }
        false
    }

    /// Record `err` and leave the worker halted.
    fn halt(&self, err: IndexError) {
        tracing::error!(
            error = %err,
            read_generation = self.queue.read_generation(),
            "index consumer halted on queue failure"
        );
        *lock(&self.last_error) = Some(err.to_string());
        self.state
            .store(ConsumerState::Halted as u8, Ordering::SeqCst);
    }
}

/// Run one applier, turning panics into errors.
fn apply_one(applier: &dyn IndexApplier, record: &EventRecord) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| applier.apply(record))) {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("index applier panicked: {msg}"))
        }
    }
}
