//! Crash-recoverable FIFO queue of index events.
//!
//! Records are appended to a single log file using the same framing as the
//! node WAL (`len:u32 | crc32:u32 | payload`), where the payload is the
//! record's write generation (`u64`) followed by the encoded event. The queue
//! directory also holds the generation keyspace with three counters:
//! - `commit-logs.writes`: records ever enqueued (the publish sequence number),
//! - `commit-logs.reads`: generation of the last record acknowledged by the consumer,
//! - `commit-logs.head`: byte offset of the first unacknowledged record.
//!
//! `reads` and `head` are always written in one batch, so a crash can at worst
//! replay the event that was being applied (at-least-once delivery).
//! On open the log is memory-mapped and scanned from `head`; a torn tail is
//! truncated and a checksum mismatch is reported as corruption.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use crc32fast::Hasher;
use memmap2::Mmap;

use crate::config::SyncMode;
use crate::error::{IndexError, Result};
use crate::event::EventRecord;
use crate::generation::{Counter, GenerationStore};

/// File name used for the log within the queue directory.
pub const LOG_FILE: &str = "log";
/// Subdirectory of the queue directory holding the counter keyspace.
const GENERATIONS_DIR: &str = "generations";

/// Counter holding the last assigned write generation.
pub const WRITES_COUNTER: &str = "commit-logs.writes";
/// Counter holding the generation of the last acknowledged record.
pub const READS_COUNTER: &str = "commit-logs.reads";
/// Counter holding the byte offset of the first unacknowledged record.
const HEAD_COUNTER: &str = "commit-logs.head";

/// Bytes of framing in front of every record payload.
const RECORD_HEADER_LEN: u64 = 8;

/// Poison-tolerant mutex guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tuning for [`DurableQueue::open`].
#[derive(Clone, Copy, Debug)]
pub struct QueueOptions {
    pub sync_mode: SyncMode,
    /// Truncate the log once it is drained and at least this large (`0` disables).
    pub compact_threshold_bytes: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::All,
            compact_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A record waiting at (or behind) the head of the queue.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    record: Arc<EventRecord>,
    /// Write generation assigned to this record.
    generation: u64,
    offset: u64,
    end_offset: u64,
}

impl QueuedEvent {
    /// The event itself.
    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    /// Write generation assigned at enqueue.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct QueueState {
    file: Option<File>,
    pending: VecDeque<QueuedEvent>,
    /// End of the last complete record in the log.
    tail: u64,
    closed: bool,
}

/// Durable single-consumer event queue with its generation counters.
pub struct DurableQueue {
    dir: PathBuf,
    log_path: PathBuf,
    store: GenerationStore,
    writes: Counter,
    reads: Counter,
    head: Counter,
    options: QueueOptions,
    state: Mutex<QueueState>,
    available: Condvar,
    #[cfg(test)]
    fail_head_reset: AtomicBool,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("log_path", &self.log_path)
            .field("writes", &self.writes.get())
            .field("reads", &self.reads.get())
            .field("pending", &self.len())
            .finish()
    }
}

impl DurableQueue {
    /// Open or create the queue under `dir` and replay unacknowledged records.
    pub fn open(dir: impl AsRef<Path>, options: QueueOptions) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let dir_created = !dir.exists();
        fs::create_dir_all(&dir).context("create index commit log dir")?;
        tracing::info!(
            path = %dir.display(),
            created_new = dir_created,
            "index commit log directory"
        );

        let log_path = dir.join(LOG_FILE);
        let file_created = !log_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .context("open index commit log")?;
        tracing::info!(
            path = %log_path.display(),
            created_new = file_created,
            "index commit log file"
        );

        let store = GenerationStore::open(dir.join(GENERATIONS_DIR), options.sync_mode)?;
        let writes = store.counter(WRITES_COUNTER)?;
        let reads = store.counter(READS_COUNTER)?;
        let head = store.counter(HEAD_COUNTER)?;

        let file_len = file.metadata().context("stat index commit log")?.len();
        let mut head_offset = head.get();
        if head_offset > file_len {
            // Crash between log truncation and cursor reset.
            tracing::warn!(
                head = head_offset,
                file_len,
                "commit log head beyond end of log, resetting"
            );
            head.set(0)?;
            head_offset = 0;
        }

        let replay = if file_len > head_offset {
            // SAFETY: the log is private to this queue and nothing writes to it
            // until the map is dropped at the end of this block.
            let map = unsafe { Mmap::map(&file) }.context("map index commit log")?;
            scan_log(&map, head_offset)?
        } else {
            Replay {
                records: Vec::new(),
                valid_end: file_len,
            }
        };

        let tail = if replay.valid_end < file_len {
            tracing::warn!(
                valid_end = replay.valid_end,
                file_len,
                "truncating torn commit log tail"
            );
            file.set_len(replay.valid_end)
                .context("truncate torn commit log tail")?;
            replay.valid_end
        } else {
            file_len
        };

        let pending: VecDeque<QueuedEvent> = replay.records.into();
        reconcile_generations(&writes, &reads, pending.back().map(QueuedEvent::generation))?;
        if !pending.is_empty() {
            tracing::info!(
                pending = pending.len(),
                read_generation = reads.get(),
                write_generation = writes.get(),
                "replaying unapplied index events"
            );
        }

        Ok(Self {
            dir,
            log_path,
            store,
            writes,
            reads,
            head,
            options,
            state: Mutex::new(QueueState {
                file: Some(file),
                pending,
                tail,
                closed: false,
            }),
            available: Condvar::new(),
            #[cfg(test)]
            fail_head_reset: AtomicBool::new(false),
        })
    }

    /// Durably append `record` and return its write generation.
    ///
    /// The record only becomes visible to [`peek`](Self::peek) after the write
    /// generation has been persisted, so the consumer can never acknowledge
    /// past the write generation.
    pub fn enqueue(&self, record: EventRecord) -> Result<u64> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(IndexError::Closed);
        }
        // Only this path increments `writes`, and it holds the state lock.
        let generation = self.writes.get() + 1;
        let payload = encode_entry(generation, &record);
        let prev_tail = state.tail;
        let sync_mode = self.options.sync_mode;
        let Some(file) = state.file.as_mut() else {
            return Err(IndexError::Closed);
        };

        if let Err(err) = append_record(file, &payload, sync_mode) {
            rollback(file, prev_tail);
            return Err(IndexError::Durability(
                anyhow::Error::new(err).context("append index commit log record"),
            ));
        }
        if let Err(err) = self.writes.increment() {
            rollback(file, prev_tail);
            return Err(IndexError::Durability(err));
        }

        let end_offset = prev_tail + RECORD_HEADER_LEN + payload.len() as u64;
        state.tail = end_offset;
        state.pending.push_back(QueuedEvent {
            record: Arc::new(record),
            generation,
            offset: prev_tail,
            end_offset,
        });
        drop(state);
        self.available.notify_all();
        Ok(generation)
    }

    /// Wait for the head record without removing it.
    ///
    /// Returns `None` on timeout or once the queue is closed.
    pub fn peek(&self, timeout: Option<Duration>) -> Option<QueuedEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);
        loop {
            if let Some(front) = state.pending.front() {
                return Some(front.clone());
            }
            if state.closed {
                return None;
            }
            match deadline {
                None => {
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (next, _) = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = next;
                }
            }
        }
    }

    /// Destructively remove the head record once it has been applied.
    ///
    /// Advances the read generation to the record's generation and moves the
    /// head cursor in one atomic batch; returns the new read generation.
    /// A failed compaction of the drained log is reported even though the
    /// acknowledgement itself is already durable.
    pub fn ack(&self, event: &QueuedEvent) -> Result<u64> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(IndexError::Closed);
        }
        match state.pending.front() {
            Some(front) if front.offset == event.offset => {}
            _ => {
                return Err(IndexError::invalid(format!(
                    "event at generation {} is not the queue head",
                    event.generation
                )))
            }
        }

        let read_generation = event.generation.max(self.reads.get());
        self.store
            .commit(&[(&self.reads, read_generation), (&self.head, event.end_offset)])
            .context("acknowledge index event")?;
        state.pending.pop_front();

        let threshold = self.options.compact_threshold_bytes;
        if state.pending.is_empty() && threshold > 0 && state.tail >= threshold {
            self.compact_locked(&mut state)
                .context("compact drained index commit log")?;
        }
        Ok(read_generation)
    }

    /// Block until a record is available, then remove and return it.
    pub fn dequeue(&self) -> Result<EventRecord> {
        match self.dequeue_timeout(None)? {
            Some(record) => Ok(record),
            None => Err(IndexError::Closed),
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Option<Duration>) -> Result<Option<EventRecord>> {
        let Some(event) = self.peek(timeout) else {
            if self.is_closed() {
                return Err(IndexError::Closed);
            }
            return Ok(None);
        };
        self.ack(&event)?;
        Ok(Some((*event.record).clone()))
    }

    /// Truncate a drained log and reset the head cursor.
    ///
    /// If the log was truncated but the cursor could not be reset, the queue
    /// is closed: appends would otherwise land below a stale head.
    fn compact_locked(&self, state: &mut QueueState) -> anyhow::Result<()> {
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };
        let reclaimed = state.tail;
        file.set_len(0).context("truncate drained commit log")?;
        state.tail = 0;
        // A crash before the cursor write leaves head past the end of the log, which open() resets.
        let reset = sync_file(file, self.options.sync_mode)
            .context("sync truncated commit log")
            .and_then(|()| self.reset_head());
        if let Err(err) = reset {
            tracing::error!(
                error = ?err,
                stale_head = self.head.get(),
                "commit log truncated without resetting its head, closing queue"
            );
            state.closed = true;
            state.file = None;
            self.available.notify_all();
            return Err(err);
        }
        tracing::info!(reclaimed_bytes = reclaimed, "compacted index commit log");
        Ok(())
    }

    /// Persist a zero head cursor.
    fn reset_head(&self) -> anyhow::Result<()> {
        #[cfg(test)]
        anyhow::ensure!(
            !self.fail_head_reset.load(Ordering::SeqCst),
            "injected head cursor write failure"
        );
        self.head.set(0)
    }

    /// Flush the log and counters and stop accepting records. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let file = state.file.take();
        drop(state);
        self.available.notify_all();

        if let Some(mut file) = file {
            file.flush().context("flush index commit log")?;
            file.sync_all().context("sync index commit log")?;
        }
        self.store.persist()?;
        tracing::info!(
            write_generation = self.writes.get(),
            read_generation = self.reads.get(),
            "index commit log closed"
        );
        Ok(())
    }

    /// True once [`close`](Self::close) ran or a compaction failure closed the queue.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Records enqueued but not yet acknowledged.
    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// True when every enqueued record has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the log file in bytes.
    pub fn log_bytes(&self) -> u64 {
        lock(&self.state).tail
    }

    /// Generation of the last enqueued record.
    pub fn write_generation(&self) -> u64 {
        self.writes.get()
    }

    /// Generation of the last acknowledged record.
    pub fn read_generation(&self) -> u64 {
        self.reads.get()
    }

    /// Read-generation counter, for catch-up waits.
    pub(crate) fn reads(&self) -> &Counter {
        &self.reads
    }

    /// Directory holding the log and the counter keyspace.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DurableQueue {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing index commit log on drop failed");
        }
    }
}

/// Bring the write generation in line with what the log actually holds.
fn reconcile_generations(
    writes: &Counter,
    reads: &Counter,
    last_pending: Option<u64>,
) -> anyhow::Result<()> {
    let write = writes.get();
    let last_logged = last_pending.unwrap_or_else(|| reads.get());
    if write < last_logged {
        // Record appended but the write generation never reached disk.
        tracing::warn!(
            write_generation = write,
            repaired = last_logged,
            "raising write generation to cover replayed records"
        );
        writes.set(last_logged)?;
    } else if write > last_logged {
        // Unsynced tail records were lost; their generations are only passed
        // once a later record is applied.
        tracing::error!(
            write_generation = write,
            last_logged,
            lost = write - last_logged,
            "index commit log lost records from its tail"
        );
    }
    Ok(())
}

/// Result of scanning the mapped log.
struct Replay {
    records: Vec<QueuedEvent>,
    /// End of the last complete record.
    valid_end: u64,
}

/// Decode every complete record from `start` to the end of `data`.
fn scan_log(data: &[u8], start: u64) -> anyhow::Result<Replay> {
    let mut records = Vec::new();
    let mut offset = start as usize;
    loop {
        let remaining = data.len().saturating_sub(offset);
        if remaining == 0 {
            break;
        }
        if remaining < RECORD_HEADER_LEN as usize {
            // Partial header at the tail.
            break;
        }
        let len = read_u32(&data[offset..offset + 4]) as usize;
        let expected_crc = read_u32(&data[offset + 4..offset + 8]);
        let body_start = offset + RECORD_HEADER_LEN as usize;
        if data.len() - body_start < len {
            // Partial payload at the tail.
            break;
        }
        let payload = &data[body_start..body_start + len];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        anyhow::ensure!(
            hasher.finalize() == expected_crc,
            "index commit log checksum mismatch at offset {offset}"
        );
        let (generation, record) = decode_entry(payload)
            .with_context(|| format!("decode index event at offset {offset}"))?;
        let end = body_start + len;
        records.push(QueuedEvent {
            record: Arc::new(record),
            generation,
            offset: offset as u64,
            end_offset: end as u64,
        });
        offset = end;
    }
    Ok(Replay {
        records,
        valid_end: offset as u64,
    })
}

/// Prefix the encoded event with its write generation.
fn encode_entry(generation: u64, record: &EventRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + record.encoded_len());
    out.extend_from_slice(&generation.to_be_bytes());
    out.extend_from_slice(&record.encode());
    out
}

/// Split a log payload into its generation and event.
fn decode_entry(buf: &[u8]) -> anyhow::Result<(u64, EventRecord)> {
    anyhow::ensure!(buf.len() >= 8, "index event entry short generation");
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    Ok((u64::from_be_bytes(raw), EventRecord::decode(&buf[8..])?))
}

/// Big-endian `u32` from a four-byte slice.
fn read_u32(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(buf);
    u32::from_be_bytes(raw)
}

/// Write a single length-prefixed record with CRC32 checksum, then flush and sync.
fn append_record(file: &mut File, payload: &[u8], mode: SyncMode) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    let mut frame = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(payload);
    file.write_all(&frame)?;
    file.flush()?;
    sync_file(file, mode)
}

/// Drop a partially written or uncounted record.
fn rollback(file: &mut File, tail: u64) {
    if let Err(err) = file.set_len(tail) {
        tracing::error!(error = ?err, tail, "rolling back index commit log append failed");
    }
}

/// Perform the configured fsync mode on the log file.
fn sync_file(file: &File, mode: SyncMode) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}
