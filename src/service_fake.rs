//! In-memory `StreamServiceApi` used by tests and local development.
//!
//! Sequence numbers are plain zero-padded decimal counters, scoped per
//! shard, so lexicographic comparison (see [`crate::types::SequenceNumber`])
//! agrees with arrival order without needing real Kinesis's wide numeric
//! encoding.

use crate::error::StreamError;
use crate::service::{
    FetchedRecord, GetRecordsOutcome, IteratorHandle, PutRecordEntry, PutRecordError,
    PutRecordErrorCode, PutRecordResult, ShardDescription, StreamDescription, StreamServiceApi,
    StreamStatus,
};
use crate::types::{IteratorPosition, SequenceNumber, ShardId, MAX_RECORD_BYTES};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::Mutex;

const MAX_SHARDS: u32 = 500;

struct FakeRecord {
    sequence: u64,
    partition_key: String,
    data: bytes::Bytes,
    arrival: SystemTime,
}

struct FakeShard {
    id: ShardId,
    parent_shard_id: Option<ShardId>,
    adjacent_parent_shard_id: Option<ShardId>,
    records: Vec<FakeRecord>,
    is_open: bool,
}

struct FakeStream {
    shards: Vec<FakeShard>,
}

/// Injectable per-call failure used to drive retry/throttle tests without
/// timing a real rate limiter.
#[derive(Clone, Copy, Debug)]
pub enum InjectedFailure {
    Throttled,
    Internal,
    /// Fails the first `n` records of the next `put_records` call with a
    /// per-record `ProvisionedThroughputExceeded` error instead of
    /// rejecting the whole call, for exercising partial-batch retry.
    PartialThrottle(usize),
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, FakeStream>,
    put_failures: Vec<InjectedFailure>,
}

/// A fully in-process implementation of [`StreamServiceApi`].
///
/// Cloning shares the same backing store (it is an `Arc` internally), so
/// a producer and consumer can be pointed at the same `FakeStreamServiceApi`
/// instance within a test the way they'd share a real endpoint.
#[derive(Clone, Default)]
pub struct FakeStreamServiceApi {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl FakeStreamServiceApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up failures that the next N `put_records` calls should
    /// return (consumed in order, one per call).
    pub async fn inject_put_failures(&self, failures: Vec<InjectedFailure>) {
        self.inner.lock().await.put_failures = failures;
    }

    /// Directly seed a shard with records, bypassing `put_records`. Useful
    /// for constructing a consumer-only test fixture.
    pub async fn seed(&self, stream: &str, shard_id: &str, partition_key: &str, data: &[u8]) {
        let mut guard = self.inner.lock().await;
        let stream = guard
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| FakeStream {
                shards: vec![new_shard(shard_id, None, None)],
            });
        let shard = stream
            .shards
            .iter_mut()
            .find(|s| s.id.as_str() == shard_id)
            .expect("seeded shard must exist");
        let sequence = shard.records.len() as u64 + 1;
        shard.records.push(FakeRecord {
            sequence,
            partition_key: partition_key.to_string(),
            data: bytes::Bytes::copy_from_slice(data),
            arrival: SystemTime::now(),
        });
    }

    /// Split a shard into two children, closing the parent. Models a
    /// resharding event for consumer tests.
    pub async fn split_shard(&self, stream: &str, parent_id: &str, child_a: &str, child_b: &str) {
        let mut guard = self.inner.lock().await;
        let stream = guard.streams.get_mut(stream).expect("stream must exist");
        if let Some(parent) = stream.shards.iter_mut().find(|s| s.id.as_str() == parent_id) {
            parent.is_open = false;
        }
        let parent = ShardId::new(parent_id);
        stream
            .shards
            .push(new_shard(child_a, Some(parent.clone()), None));
        stream.shards.push(new_shard(child_b, None, Some(parent)));
    }
}

fn new_shard(id: &str, parent: Option<ShardId>, adjacent_parent: Option<ShardId>) -> FakeShard {
    FakeShard {
        id: ShardId::new(id),
        parent_shard_id: parent,
        adjacent_parent_shard_id: adjacent_parent,
        records: Vec::new(),
        is_open: true,
    }
}

fn encode_sequence(shard_id: &str, index: u64) -> SequenceNumber {
    SequenceNumber::new(format!("{shard_id}:{index:020}"))
}

fn decode_iterator(handle: &IteratorHandle) -> Option<(String, u64)> {
    let (shard_id, cursor) = handle.0.split_once(':')?;
    let cursor = cursor.parse().ok()?;
    Some((shard_id.to_string(), cursor))
}

#[async_trait]
impl StreamServiceApi for FakeStreamServiceApi {
    async fn create_stream(&self, name: &str, shard_count: u32) -> Result<(), StreamError> {
        if shard_count == 0 || shard_count > MAX_SHARDS {
            return Err(StreamError::StreamShardLimit {
                name: name.to_string(),
            });
        }
        let mut guard = self.inner.lock().await;
        if guard.streams.contains_key(name) {
            return Err(StreamError::StreamExists {
                name: name.to_string(),
            });
        }
        let shards = (0..shard_count)
            .map(|i| new_shard(&format!("shardId-{i:012}"), None, None))
            .collect();
        guard.streams.insert(name.to_string(), FakeStream { shards });
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> Result<(), StreamError> {
        let mut guard = self.inner.lock().await;
        guard
            .streams
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StreamError::StreamDoesNotExist {
                name: name.to_string(),
            })
    }

    async fn describe_stream(&self, name: &str) -> Result<StreamDescription, StreamError> {
        let guard = self.inner.lock().await;
        let stream = guard
            .streams
            .get(name)
            .ok_or_else(|| StreamError::StreamDoesNotExist {
                name: name.to_string(),
            })?;
        Ok(StreamDescription {
            name: name.to_string(),
            status: StreamStatus::Active,
            shard_count: stream.shards.len(),
        })
    }

    async fn list_shards(&self, name: &str) -> Result<Vec<ShardDescription>, StreamError> {
        let guard = self.inner.lock().await;
        let stream = guard
            .streams
            .get(name)
            .ok_or_else(|| StreamError::StreamDoesNotExist {
                name: name.to_string(),
            })?;
        Ok(stream
            .shards
            .iter()
            .map(|s| ShardDescription {
                shard_id: s.id.clone(),
                parent_shard_id: s.parent_shard_id.clone(),
                adjacent_parent_shard_id: s.adjacent_parent_shard_id.clone(),
                is_open: s.is_open,
            })
            .collect())
    }

    async fn put_records(
        &self,
        name: &str,
        records: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordResult>, StreamError> {
        let mut guard = self.inner.lock().await;

        let partial_throttle_count = match guard.put_failures.pop() {
            Some(InjectedFailure::Throttled) => {
                return Err(StreamError::Throttled { retry_after: None })
            }
            Some(InjectedFailure::Internal) => {
                return Err(StreamError::ServiceInternal {
                    message: "injected failure".to_string(),
                })
            }
            Some(InjectedFailure::PartialThrottle(n)) => n,
            None => 0,
        };

        for record in &records {
            if record.data.len() >= MAX_RECORD_BYTES {
                return Err(StreamError::ExceededPutLimit {
                    size: record.data.len(),
                    limit: MAX_RECORD_BYTES,
                });
            }
        }

        let stream = guard
            .streams
            .get_mut(name)
            .ok_or_else(|| StreamError::StreamDoesNotExist {
                name: name.to_string(),
            })?;

        let shard_count = stream.shards.iter().filter(|s| s.is_open).count().max(1);
        let mut results = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            if index < partial_throttle_count {
                results.push(PutRecordResult {
                    sequence_number: None,
                    shard_id: None,
                    error: Some(PutRecordError {
                        code: PutRecordErrorCode::ProvisionedThroughputExceeded,
                        message: "injected partial throttle".to_string(),
                    }),
                });
                continue;
            }
            let shard_index = partition_to_shard(&record.partition_key, shard_count);
            let shard = stream
                .shards
                .iter_mut()
                .filter(|s| s.is_open)
                .nth(shard_index)
                .expect("shard_index in range");
            let sequence = shard.records.len() as u64 + 1;
            shard.records.push(FakeRecord {
                sequence,
                partition_key: record.partition_key.clone(),
                data: record.data.clone(),
                arrival: SystemTime::now(),
            });
            results.push(PutRecordResult {
                sequence_number: Some(encode_sequence(shard.id.as_str(), sequence)),
                shard_id: Some(shard.id.clone()),
                error: None,
            });
        }
        Ok(results)
    }

    async fn get_shard_iterator(
        &self,
        name: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<IteratorHandle, StreamError> {
        let guard = self.inner.lock().await;
        let stream = guard
            .streams
            .get(name)
            .ok_or_else(|| StreamError::StreamDoesNotExist {
                name: name.to_string(),
            })?;
        let shard = stream
            .shards
            .iter()
            .find(|s| &s.id == shard_id)
            .ok_or_else(|| StreamError::ServiceInternal {
                message: format!("unknown shard {shard_id}"),
            })?;

        let cursor = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => shard.records.len() as u64,
            IteratorPosition::AtSequence(seq) => sequence_cursor(seq, shard_id).saturating_sub(1),
            IteratorPosition::AfterSequence(seq) => sequence_cursor(seq, shard_id),
        };
        Ok(IteratorHandle(format!("{shard_id}:{cursor}")))
    }

    async fn get_records(
        &self,
        iterator: &IteratorHandle,
        limit: u32,
    ) -> Result<GetRecordsOutcome, StreamError> {
        let (shard_id, cursor) =
            decode_iterator(iterator).ok_or_else(|| StreamError::ServiceInternal {
                message: "malformed iterator".to_string(),
            })?;

        let guard = self.inner.lock().await;
        // Linear scan across streams since the fake has no stream->shard
        // index; fine for test-sized fixtures.
        let shard = guard
            .streams
            .values()
            .flat_map(|s| s.shards.iter())
            .find(|s| s.id.as_str() == shard_id)
            .ok_or_else(|| StreamError::ServiceInternal {
                message: format!("unknown shard {shard_id}"),
            })?;

        let start = cursor as usize;
        let take = (limit as usize).min(shard.records.len().saturating_sub(start));
        let records = shard.records[start..start + take]
            .iter()
            .map(|r| FetchedRecord {
                sequence_number: encode_sequence(&shard_id, r.sequence),
                partition_key: r.partition_key.clone(),
                data: r.data.clone(),
                arrival_timestamp: r.arrival,
            })
            .collect();

        let new_cursor = start + take;
        let next_iterator = if !shard.is_open && new_cursor >= shard.records.len() {
            None
        } else {
            Some(IteratorHandle(format!("{shard_id}:{new_cursor}")))
        };

        // Caught up to the tip: no lag. Otherwise report a synthetic but
        // deterministic non-zero lag (1ms per unread record) so a reader
        // can tell more data is waiting without depending on wall-clock
        // gaps between this in-memory shard's writes.
        let remaining = shard.records.len() - new_cursor;
        let millis_behind_latest = remaining as u64;

        Ok(GetRecordsOutcome {
            records,
            next_iterator,
            millis_behind_latest,
        })
    }
}

fn sequence_cursor(seq: &SequenceNumber, shard_id: &ShardId) -> u64 {
    seq.as_str()
        .strip_prefix(&format!("{shard_id}:"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn partition_to_shard(partition_key: &str, shard_count: usize) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_stream_rejects_excessive_shard_count() {
        let api = FakeStreamServiceApi::new();
        let err = api.create_stream("s", MAX_SHARDS + 1).await.unwrap_err();
        assert!(matches!(err, StreamError::StreamShardLimit { .. }));
    }

    #[tokio::test]
    async fn create_stream_twice_reports_exists() {
        let api = FakeStreamServiceApi::new();
        api.create_stream("s", 1).await.unwrap();
        let err = api.create_stream("s", 1).await.unwrap_err();
        assert!(matches!(err, StreamError::StreamExists { .. }));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_a_record() {
        let api = FakeStreamServiceApi::new();
        api.create_stream("s", 1).await.unwrap();
        let shards = api.list_shards("s").await.unwrap();
        let shard_id = &shards[0].shard_id;

        api.put_records(
            "s",
            vec![PutRecordEntry {
                partition_key: "pk".to_string(),
                data: bytes::Bytes::from_static(b"test"),
            }],
        )
        .await
        .unwrap();

        let iterator = api
            .get_shard_iterator("s", shard_id, &IteratorPosition::TrimHorizon)
            .await
            .unwrap();
        let outcome = api.get_records(&iterator, 10).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(&outcome.records[0].data[..], b"test");
    }

    #[tokio::test]
    async fn partial_throttle_fails_only_the_leading_records() {
        let api = FakeStreamServiceApi::new();
        api.create_stream("s", 1).await.unwrap();
        api.inject_put_failures(vec![InjectedFailure::PartialThrottle(2)])
            .await;

        let results = api
            .put_records(
                "s",
                vec![
                    PutRecordEntry {
                        partition_key: "a".to_string(),
                        data: bytes::Bytes::from_static(b"a"),
                    },
                    PutRecordEntry {
                        partition_key: "b".to_string(),
                        data: bytes::Bytes::from_static(b"b"),
                    },
                    PutRecordEntry {
                        partition_key: "c".to_string(),
                        data: bytes::Bytes::from_static(b"c"),
                    },
                ],
            )
            .await
            .unwrap();

        assert!(results[0].error.is_some());
        assert!(results[1].error.is_some());
        assert!(results[2].error.is_none());
    }

    #[tokio::test]
    async fn put_above_record_limit_is_rejected() {
        let api = FakeStreamServiceApi::new();
        api.create_stream("s", 1).await.unwrap();
        let oversized = bytes::Bytes::from(vec![0u8; MAX_RECORD_BYTES]);
        let err = api
            .put_records(
                "s",
                vec![PutRecordEntry {
                    partition_key: "pk".to_string(),
                    data: oversized,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::ExceededPutLimit { .. }));
    }
}
