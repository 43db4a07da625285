//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use holo_index::{EventKind, EventRecord, IndexApplier, IndexQueue, IndexQueueConfig, SyncMode};

/// Upper bound for anything that waits on the consumer.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Node id used by every test queue.
pub const LOCAL_NODE: u64 = 1;

/// Fast-polling config rooted at `dir`.
pub fn test_config(dir: &Path) -> IndexQueueConfig {
    let mut cfg = IndexQueueConfig::new(dir);
    cfg.local_node = LOCAL_NODE;
    cfg.sync_mode = SyncMode::Data;
    cfg.poll_interval = Duration::from_millis(5);
    cfg.retry_backoff_min = Duration::from_millis(1);
    cfg.retry_backoff_max = Duration::from_millis(8);
    cfg
}

pub fn open_queue(dir: &Path) -> Arc<IndexQueue> {
    IndexQueue::open(test_config(dir)).expect("open index queue")
}

/// Index that remembers every event it applied, in order.
pub struct RecordingIndex {
    name: String,
    source: Option<String>,
    seen: Mutex<Vec<(EventKind, Vec<u8>, Vec<u8>)>>,
}

impl RecordingIndex {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn for_source(name: &str, source: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source: Some(source.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key, _)| key.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<(EventKind, Vec<u8>, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl IndexApplier for RecordingIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn apply(&self, event: &EventRecord) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((
            event.kind(),
            event.key().to_vec(),
            event.payload().to_vec(),
        ));
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn live_size(&self) -> Option<u64> {
        Some(self.count() as u64)
    }
}

/// Index that fails its first `failures` apply calls.
pub struct FlakyIndex {
    failures: usize,
    calls: AtomicUsize,
    inner: Arc<RecordingIndex>,
}

impl FlakyIndex {
    pub fn new(name: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: RecordingIndex::new(name),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.keys()
    }
}

impl IndexApplier for FlakyIndex {
    fn index_name(&self) -> &str {
        self.inner.index_name()
    }

    fn apply(&self, event: &EventRecord) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("injected apply failure #{call}");
        }
        self.inner.apply(event)
    }
}

/// Index that blocks inside `apply` on one key until released.
pub struct GatedIndex {
    gate_key: Vec<u8>,
    // (entered, released)
    gate: Mutex<(bool, bool)>,
    changed: Condvar,
    inner: Arc<RecordingIndex>,
}

impl GatedIndex {
    pub fn new(name: &str, gate_key: &str) -> Arc<Self> {
        Arc::new(Self {
            gate_key: gate_key.as_bytes().to_vec(),
            gate: Mutex::new((false, false)),
            changed: Condvar::new(),
            inner: RecordingIndex::new(name),
        })
    }

    /// Wait until the consumer is blocked on the gated key.
    pub fn wait_entered(&self) -> bool {
        let gate = self.gate.lock().unwrap();
        let (gate, _) = self
            .changed
            .wait_timeout_while(gate, WAIT_TIMEOUT, |(entered, _)| !*entered)
            .unwrap();
        gate.0
    }

    pub fn release(&self) {
        self.gate.lock().unwrap().1 = true;
        self.changed.notify_all();
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.keys()
    }
}

impl IndexApplier for GatedIndex {
    fn index_name(&self) -> &str {
        self.inner.index_name()
    }

    fn apply(&self, event: &EventRecord) -> anyhow::Result<()> {
        if event.key() == self.gate_key.as_slice() {
            let mut gate = self.gate.lock().unwrap();
            gate.0 = true;
            self.changed.notify_all();
            while !gate.1 {
                gate = self.changed.wait(gate).unwrap();
            }
        }
        self.inner.apply(event)
    }
}

/// Poll `check` until it holds or [`WAIT_TIMEOUT`] passes.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
