//! Core data types shared by the producer, consumer, checkpointer and
//! service-api layers.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::time::SystemTime;

/// A record payload may not exceed this many bytes.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// A single `put_records` call may not carry more bytes than this.
pub const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;

/// A single `put_records` call may not carry more records than this.
pub const MAX_BATCH_COUNT: usize = 500;

/// Identifies one shard within a stream. Opaque from the caller's
/// perspective; only the service implementation assigns meaning to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An opaque, service-assigned sequence number.
///
/// Sequence numbers are compared as strings, not parsed as integers: the
/// service is free to use any monotonically increasing lexicographic
/// scheme (real Kinesis zero-pads to a fixed width; a fake or test
/// service may use plain decimal counters, which only sort correctly
/// while every value shares a digit count). Callers must not assume
/// numeric semantics beyond "greater/less when compared as strings".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SequenceNumber(pub String);

impl SequenceNumber {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Where a shard iterator should start reading from.
///
/// Mirrors the `Offset` enum this crate started from: a small set of
/// named starting points plus an opaque string-valued anchor, with the
/// anchor compared lexicographically rather than parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Read from the oldest record still retained by the shard.
    TrimHorizon,
    /// Read only records produced after the iterator is created.
    Latest,
    /// Read starting at (and including) the given sequence number.
    AtSequence(SequenceNumber),
    /// Read starting strictly after the given sequence number.
    AfterSequence(SequenceNumber),
}

impl IteratorPosition {
    /// Resume position to use after a checkpoint: always read strictly
    /// after the last committed sequence number.
    pub fn after(sequence: SequenceNumber) -> Self {
        IteratorPosition::AfterSequence(sequence)
    }
}

/// A record to be published, as submitted to a producer.
#[derive(Clone, Debug)]
pub struct Record {
    pub partition_key: String,
    pub data: Bytes,
}

impl Record {
    pub fn new(partition_key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            partition_key: partition_key.into(),
            data: data.into(),
        }
    }
}

/// A record as delivered to a consumer.
#[derive(Clone, Debug)]
pub struct ConsumerRecord {
    pub shard_id: ShardId,
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: Bytes,
    pub arrival_timestamp: SystemTime,
}

impl ConsumerRecord {
    /// Decode the payload as JSON. Requires the `json` feature.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::StreamError> {
        serde_json::from_slice(&self.data).map_err(|source| crate::error::StreamError::Json {
            message: source.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_compare_lexicographically() {
        let a = SequenceNumber::new("49590338271490256608559692538361571095921575989136588898");
        let b = SequenceNumber::new("49590338271490256608559692538361571095921575989136588899");
        assert!(a < b);
    }

    #[test]
    fn sequence_numbers_do_not_compare_numerically_across_digit_counts() {
        // fake/test sequence numbers are plain decimal counters and only
        // sort correctly within a shared digit width; this documents that
        // the type makes no attempt to paper over it.
        let nine = SequenceNumber::new("9");
        let ten = SequenceNumber::new("10");
        assert!(ten < nine);
    }
}
