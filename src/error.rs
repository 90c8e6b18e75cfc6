//! Error types returned by the service-api, producer, consumer and
//! checkpointer layers.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the `StreamServiceApi` boundary and the
/// checkpointer backends.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream does not exist: {name}")]
    StreamDoesNotExist { name: String },

    #[error("stream already exists: {name}")]
    StreamExists { name: String },

    #[error("shard limit exceeded creating stream {name}")]
    StreamShardLimit { name: String },

    #[error("record of {size} bytes exceeds the {limit}-byte put limit")]
    ExceededPutLimit { size: usize, limit: usize },

    #[error("throttled by the service")]
    Throttled { retry_after: Option<Duration> },

    #[error("service internal error: {message}")]
    ServiceInternal { message: String },

    #[error("checkpoint contested for shard {shard_id}")]
    CheckpointContested { shard_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("json error: {message}")]
    Json { message: String },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl StreamError {
    /// Whether a caller should retry the operation that produced this
    /// error (after backing off).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Throttled { .. }
                | StreamError::ServiceInternal { .. }
                | StreamError::Transport(_)
        )
    }

    /// Whether retrying this operation can never succeed (the stream or
    /// configuration itself is the problem, not transient load).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::StreamDoesNotExist { .. } | StreamError::StreamShardLimit { .. }
        )
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Transport(err)
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Json {
            message: err.to_string(),
        }
    }
}

/// Producer-specific errors. Cloneable so the same failure can be handed
/// to an `on_error` callback and recorded in producer stats without
/// re-deriving it from a moved `StreamError`.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("producer is closed")]
    Closed,

    #[error("record of {size} bytes exceeds the {limit}-byte put limit")]
    ExceededPutLimit { size: usize, limit: usize },

    #[error("stream error: {message}")]
    Stream { message: String },
}

impl From<StreamError> for ProducerError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ExceededPutLimit { size, limit } => {
                ProducerError::ExceededPutLimit { size, limit }
            }
            other => ProducerError::Stream {
                message: other.to_string(),
            },
        }
    }
}
