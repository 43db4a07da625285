//! Durable, generation-tracked event queue feeding asynchronous secondary indexes.
//!
//! Writers publish row mutations into an on-disk commit log and get back a
//! write generation. A single background consumer applies each record to the
//! registered [`IndexApplier`]s and then advances the read generation, so a
//! reader holding generation `g` can call [`IndexQueue::catch_up`] and observe
//! every mutation up to `g` in the indexes. The consumer runs only while the
//! local node is live according to membership notifications.

pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod generation;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod service;

/// Name of the queue directory inside the host data directory.
pub const COMMIT_LOGS: &str = "commit-logs";

pub use config::{FanOut, IndexQueueConfig, SyncMode};
pub use consumer::{Consumer, ConsumerState};
pub use error::{IndexError, Result};
pub use event::{EventKind, EventRecord};
pub use lifecycle::{LifecycleController, MembershipEvent, MembershipSubscriber, NodeId};
pub use registry::{IndexApplier, IndexRegistry};
pub use service::{IndexQueue, IndexQueueStats, IndexStats};
