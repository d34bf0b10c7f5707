use std::time::Duration;

use thiserror::Error;

/// Delay before retrying a failed group join, long enough to avoid a tight error loop.
pub const JOIN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Delay before retrying a failed metadata fetch.
pub const METADATA_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The surrounding context was cancelled by close or by rebalance. Not a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("consumer group is closed")]
    Closed,

    #[error("consume is already running for this consumer group")]
    AlreadyConsuming,

    #[error("message source for {topic}/{partition} closed unexpectedly")]
    SourceClosed { topic: String, partition: i32 },

    #[error("handler failed for {topic}/{partition}: {source}")]
    Handler {
        topic: String,
        partition: i32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("partition consumer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker client is closed")]
    ClientClosed,

    #[error("Failed to create consumer: {reason}")]
    ClientCreation { reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to join consumer group: {reason}")]
    Join { reason: String },

    #[error("Failed to fetch topic metadata: {reason}")]
    Metadata { reason: String },

    #[error("Failed to commit offset {offset} for {topic}/{partition}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },
}

/// Outcome of a failed handler invocation.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid topic pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("malformed trace header {header}: {value:?}")]
    Malformed { header: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::LoadFailed {
            origin: "yaml".to_string(),
            error: Box::new(err),
        }
    }
}

impl ConsumerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumerError::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Broker(e) => e.is_retryable(),
            ConsumerError::Cancelled => false,
            ConsumerError::Closed => false,
            ConsumerError::AlreadyConsuming => false,
            ConsumerError::SourceClosed { .. } => false,
            ConsumerError::Handler { .. } => false,
            ConsumerError::Config(_) => false,
            ConsumerError::Task(_) => false,
        }
    }
}

impl BrokerError {
    pub fn is_client_closed(&self) -> bool {
        matches!(self, BrokerError::ClientClosed)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::ClientClosed => false,
            BrokerError::ClientCreation { .. } => false,
            BrokerError::Subscription { .. } => true,
            BrokerError::Join { .. } => true,
            BrokerError::Metadata { .. } => true,
            BrokerError::Commit { .. } => true,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        match self {
            BrokerError::Metadata { .. } => METADATA_RETRY_DELAY,
            _ => JOIN_RETRY_DELAY,
        }
    }
}

impl HandlerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        assert!(BrokerError::ClientClosed.is_client_closed());
        assert!(!BrokerError::ClientClosed.is_retryable());

        let join = BrokerError::Join {
            reason: "coordinator not available".to_string(),
        };
        assert!(join.is_retryable());
        assert_eq!(join.retry_delay(), JOIN_RETRY_DELAY);

        let metadata = BrokerError::Metadata {
            reason: "timed out".to_string(),
        };
        assert_eq!(metadata.retry_delay(), METADATA_RETRY_DELAY);
    }

    #[test]
    fn test_consumer_error_wraps_broker_error() {
        let err: ConsumerError = BrokerError::Join {
            reason: "rebalance in progress".to_string(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(!err.is_cancelled());
        assert!(ConsumerError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_handler_error_from_anyhow() {
        let err: HandlerError = anyhow::anyhow!("downstream unavailable").into();
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "downstream unavailable");
        assert!(HandlerError::Cancelled.is_cancelled());
    }
}
