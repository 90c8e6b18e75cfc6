//! The boundary between this crate and the remote streaming service.
//!
//! `StreamServiceApi` captures exactly the handful of RPCs a partitioned,
//! shard-based streaming service exposes. Production code talks to
//! [`crate::service_http::HttpStreamServiceApi`]; tests and local
//! development talk to [`crate::service_fake::FakeStreamServiceApi`].

use crate::error::StreamError;
use crate::types::{IteratorPosition, SequenceNumber, ShardId};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;

/// A record to publish, paired with its partition key, as sent over the
/// wire in a `put_records` call.
#[derive(Clone, Debug)]
pub struct PutRecordEntry {
    pub partition_key: String,
    pub data: Bytes,
}

/// Per-record outcome of a `put_records` call. The service reports
/// partial failure per record rather than failing the whole batch.
#[derive(Clone, Debug)]
pub struct PutRecordResult {
    pub sequence_number: Option<SequenceNumber>,
    pub shard_id: Option<ShardId>,
    pub error: Option<PutRecordError>,
}

#[derive(Clone, Debug)]
pub struct PutRecordError {
    pub code: PutRecordErrorCode,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutRecordErrorCode {
    ProvisionedThroughputExceeded,
    InternalFailure,
}

impl PutRecordError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            PutRecordErrorCode::ProvisionedThroughputExceeded | PutRecordErrorCode::InternalFailure
        )
    }
}

/// Description of one shard, as returned by `list_shards`.
#[derive(Clone, Debug)]
pub struct ShardDescription {
    pub shard_id: ShardId,
    pub parent_shard_id: Option<ShardId>,
    pub adjacent_parent_shard_id: Option<ShardId>,
    pub is_open: bool,
}

/// Top-level stream metadata, as returned by `describe_stream`.
#[derive(Clone, Debug)]
pub struct StreamDescription {
    pub name: String,
    pub status: StreamStatus,
    pub shard_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Creating,
    Active,
    Deleting,
}

/// An opaque cursor over one shard's records. Only the service
/// implementation knows how to interpret its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IteratorHandle(pub String);

/// One record fetched from a shard.
#[derive(Clone, Debug)]
pub struct FetchedRecord {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: Bytes,
    pub arrival_timestamp: SystemTime,
}

/// Result of a `get_records` call.
#[derive(Clone, Debug)]
pub struct GetRecordsOutcome {
    pub records: Vec<FetchedRecord>,
    /// `None` means the shard is closed and fully drained: there is
    /// nothing more to read, ever.
    pub next_iterator: Option<IteratorHandle>,
    pub millis_behind_latest: u64,
}

/// The remote streaming service, as seen by the producer and consumer.
///
/// Every method is fallible with [`StreamError`]; callers decide whether
/// to retry based on [`StreamError::is_retryable`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamServiceApi: Send + Sync {
    async fn create_stream(&self, name: &str, shard_count: u32) -> Result<(), StreamError>;

    async fn delete_stream(&self, name: &str) -> Result<(), StreamError>;

    async fn describe_stream(&self, name: &str) -> Result<StreamDescription, StreamError>;

    async fn list_shards(&self, name: &str) -> Result<Vec<ShardDescription>, StreamError>;

    async fn put_records(
        &self,
        name: &str,
        records: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordResult>, StreamError>;

    async fn get_shard_iterator(
        &self,
        name: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<IteratorHandle, StreamError>;

    async fn get_records(
        &self,
        iterator: &IteratorHandle,
        limit: u32,
    ) -> Result<GetRecordsOutcome, StreamError>;
}
