//! Client library for partitioned, shard-based streaming message
//! services (the same shape as AWS Kinesis): a batching producer, a
//! shard-fetching consumer, and a pluggable checkpointer for
//! coordinating shard ownership across consumer processes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use shardflow::{Consumer, Producer, Record};
//! use shardflow::service_http::HttpStreamServiceApi;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Arc::new(HttpStreamServiceApi::new("https://streams.example.com")?);
//!
//!     let producer = Producer::builder(service.clone(), "my-stream").build();
//!     producer.create_stream(1).await?;
//!     producer.put(Record::new("partition-key", b"hello world".to_vec())).await?;
//!     producer.flush().await?;
//!
//!     let consumer = Consumer::builder(service, "my-stream").build();
//!     let records = consumer.drain().await;
//!     for record in records {
//!         println!("got {} bytes", record.data.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

mod backoff;
mod checkpointer;
mod checkpointer_distributed;
mod checkpointer_memory;
mod consumer;
mod error;
mod producer;
mod ratelimit;
pub mod service;
pub mod service_fake;
pub mod service_http;
mod shard;
mod types;

pub use backoff::{BackoffConfig, JitterMode};
pub use checkpointer::{AllocationResult, Checkpointer};
pub use checkpointer_distributed::DistributedCheckpointer;
pub use checkpointer_memory::MemoryCheckpointer;
pub use consumer::{Consumer, ConsumerBuilder};
pub use error::{ProducerError, StreamError};
pub use producer::{OnErrorCallback, Producer, ProducerBuilder, ProducerStatsSnapshot};
pub use ratelimit::RateLimiter;
pub use shard::{ShardState, ShardStatsSnapshot};
pub use service::StreamServiceApi;
pub use types::{
    ConsumerRecord, IteratorPosition, Record, SequenceNumber, ShardId, MAX_BATCH_BYTES,
    MAX_BATCH_COUNT, MAX_RECORD_BYTES,
};
