//! Membership-driven start and stop of the index consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::consumer::{Consumer, ConsumerState};
use crate::error::Result;
use crate::registry::IndexRegistry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cluster node identifier as carried in membership notifications.
pub type NodeId = u64;

/// Membership change delivered by the host's gossip layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    TokensChanged(NodeId),
    Alive(NodeId),
    Dead(NodeId),
    Removed(NodeId),
    Restarted(NodeId),
}

impl MembershipEvent {
    /// Node the notification is about.
    pub fn node(&self) -> NodeId {
        match *self {
            MembershipEvent::Joined(node)
            | MembershipEvent::TokensChanged(node)
            | MembershipEvent::Alive(node)
            | MembershipEvent::Dead(node)
            | MembershipEvent::Removed(node)
            | MembershipEvent::Restarted(node) => node,
        }
    }
}

/// Receiver of membership notifications, invoked on arbitrary threads.
pub trait MembershipSubscriber: Send + Sync {
    fn on_membership_event(&self, event: &MembershipEvent);
}

/// Tracks local liveness and drives the consumer from membership changes.
///
/// A halted consumer is never restarted by membership changes or
/// registration; only [`restart_consumer`](Self::restart_consumer) does that.
pub struct LifecycleController {
    local: NodeId,
    live: AtomicBool,
    // Serializes start and stop decisions against each other.
    transitions: Mutex<()>,
    consumer: Arc<Consumer>,
    registry: Arc<IndexRegistry>,
}

impl LifecycleController {
    /// Controller for node `local`; the node starts out not live.
    pub fn new(local: NodeId, consumer: Arc<Consumer>, registry: Arc<IndexRegistry>) -> Self {
        Self {
            local,
            live: AtomicBool::new(false),
            transitions: Mutex::new(()),
            consumer,
            registry,
        }
    }

    /// Node id whose notifications drive this controller.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Whether the local node has joined and not been declared dead since.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Start the consumer if the node is live and there is something to feed.
    pub(crate) fn maybe_start(&self) -> Result<bool> {
        let _guard = lock(&self.transitions);
        self.start_locked()
    }

    /// Clear a halted consumer and start it again if the node is live.
    ///
    /// Returns whether a worker was started.
    pub fn restart_consumer(&self) -> Result<bool> {
        let _guard = lock(&self.transitions);
        if self.consumer.clear_halt() {
            tracing::info!(node = self.local, "operator restart of halted index consumer");
        }
        self.start_locked()
    }

    fn start_locked(&self) -> Result<bool> {
        if !self.is_live() || self.registry.is_empty() {
            return Ok(false);
        }
        // Liveness is re-read after any draining worker has been joined, so a
        // death reported during the join is honored.
        let started = self
            .consumer
            .start_if(|state| state != ConsumerState::Halted && self.is_live())?;
        if started {
            tracing::info!(node = self.local, "index consumer started on live node");
        } else if self.consumer.state() == ConsumerState::Halted {
            tracing::warn!(
                node = self.local,
                last_error = ?self.consumer.last_error(),
                "index consumer halted, waiting for operator restart"
            );
        }
        Ok(started)
    }

    fn mark_live(&self) {
        let _guard = lock(&self.transitions);
        if !self.live.swap(true, Ordering::SeqCst) {
            tracing::info!(node = self.local, "local node live");
        }
        if let Err(err) = self.start_locked() {
            tracing::error!(error = %err, node = self.local, "failed to start index consumer");
        }
    }

    fn mark_dead(&self) {
        // Cleared before taking the lock so a start blocked on a join sees it.
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::info!(node = self.local, "local node dead");
        }
        let _guard = lock(&self.transitions);
        self.consumer.stop();
    }
}

impl MembershipSubscriber for LifecycleController {
    fn on_membership_event(&self, event: &MembershipEvent) {
        if event.node() != self.local {
            tracing::trace!(?event, "ignoring membership event for remote node");
            return;
        }
        match event {
            MembershipEvent::Joined(_) | MembershipEvent::TokensChanged(_) => self.mark_live(),
            MembershipEvent::Dead(_) => self.mark_dead(),
            MembershipEvent::Alive(_)
            | MembershipEvent::Removed(_)
            | MembershipEvent::Restarted(_) => {
                tracing::trace!(?event, "ignoring membership event");
            }
        }
    }
}
