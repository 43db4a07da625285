//! Error taxonomy for the index event queue.
//!
//! Internals propagate `anyhow::Error` with context, the same way the storage
//! and WAL code does; the public surface converts into [`IndexError`] so
//! callers can tell synchronous argument errors apart from durability faults.

use thiserror::Error;

/// Errors surfaced by the index queue, its consumer and its counters.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The caller supplied a malformed event (empty key, oversized field).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The durable queue or a generation counter could not complete a
    /// persisted operation.
    #[error("durable storage failure: {0:#}")]
    Durability(#[source] anyhow::Error),

    /// The subsystem failed to initialize.
    #[error("index queue construction failed: {0:#}")]
    Construction(#[source] anyhow::Error),

    /// A registered applier failed to apply one event.
    #[error("index `{index}` failed to apply event at generation {generation}: {source:#}")]
    IndexApply {
        index: String,
        generation: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A bounded catch-up wait expired before the read generation reached the target.
    #[error("catch-up to generation {target} timed out at read generation {read_generation}")]
    CatchUpTimeout { target: u64, read_generation: u64 },

    /// The queue has been closed.
    #[error("index queue closed")]
    Closed,
}

impl IndexError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        IndexError::InvalidArgument(msg.into())
    }

    /// True for failures that leave the durable state unusable for the consumer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexError::Durability(_) | IndexError::Construction(_) | IndexError::Closed
        )
    }
}

impl From<anyhow::Error> for IndexError {
    fn from(err: anyhow::Error) -> Self {
        IndexError::Durability(err)
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Durability(err.into())
    }
}

impl From<fjall::Error> for IndexError {
    fn from(err: fjall::Error) -> Self {
        IndexError::Durability(err.into())
    }
}

/// Result alias for the public API.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(IndexError::Closed.is_fatal());
        assert!(IndexError::Durability(anyhow::anyhow!("disk gone")).is_fatal());
        assert!(!IndexError::invalid("empty key").is_fatal());
        assert!(!IndexError::CatchUpTimeout {
            target: 3,
            read_generation: 2
        }
        .is_fatal());
    }

    #[test]
    fn durability_message_keeps_context_chain() {
        let err = anyhow::anyhow!("no space left").context("append commit log record");
        let msg = IndexError::from(err).to_string();
        assert!(msg.contains("append commit log record"));
        assert!(msg.contains("no space left"));
    }
}
