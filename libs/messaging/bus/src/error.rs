//! Error types for the bus abstraction

/// Result alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Failures surfaced by any bus implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Operation requires a started bus
    #[error("bus not started")]
    NotStarted,

    /// Topic does not exist
    #[error("topic missing: {0}")]
    TopicMissing(String),

    /// A subscription for this (topic, group) already exists
    #[error("group {group} already subscribed to topic {topic}")]
    GroupExists {
        /// Topic name
        topic: String,
        /// Consumer group
        group: String,
    },

    /// Publish could not complete within the configured deadline
    #[error("publish to {topic} timed out after {deadline_ms}ms")]
    PublishTimeout {
        /// Topic name
        topic: String,
        /// Deadline that elapsed
        deadline_ms: u64,
    },

    /// The consumer side of a subscription has shut down
    #[error("consumer closed for topic {0}")]
    ConsumerClosed(String),

    /// Configured bus type is not one of the supported implementations
    #[error("unsupported bus type: {0}")]
    UnsupportedBusType(String),

    /// Message exceeds the producer's size limit
    #[error("message too large: {size}B exceeds limit of {limit}B")]
    MessageTooLarge {
        /// Actual size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Broker connection failure
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// I/O failure on the broker transport
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl BusError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::PublishTimeout { .. }
                | BusError::ConnectionFailed(_)
                | BusError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(BusError::PublishTimeout {
            topic: "t".into(),
            deadline_ms: 5
        }
        .is_recoverable());
        assert!(!BusError::TopicMissing("t".into()).is_recoverable());
        assert!(!BusError::UnsupportedBusType("pigeon".into()).is_recoverable());
    }
}
