//! Redis-backed checkpointer for coordinating shard ownership across
//! multiple consumer processes.
//!
//! Ownership is a lock key holding `"<consumer_id>:<fencing_token>"` with
//! a TTL; a heartbeat task refreshes the TTL on an interval, guarded by a
//! compare-and-set script so a consumer that has already lost the lock
//! (e.g. paused long enough for another consumer to steal it) cannot
//! resurrect it. Checkpoint writes are conditioned on both still holding
//! the lock and the new sequence number being lexicographically
//! no smaller than the stored one.

use crate::checkpointer::{AllocationResult, Checkpointer};
use crate::error::StreamError;
use crate::types::{SequenceNumber, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

// Steal a lock only if its heartbeat is missing or stale, or take it
// uncontested if nobody holds it. Returns 1 on success, 0 otherwise.
const TRY_ACQUIRE_SCRIPT: &str = r#"
local lock = redis.call('GET', KEYS[1])
if lock == false then
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
    return 1
end
local heartbeat = redis.call('GET', KEYS[2])
if heartbeat == false then
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

// Refresh a heartbeat only if we still hold the lock under our token.
const HEARTBEAT_SCRIPT: &str = r#"
local lock = redis.call('GET', KEYS[1])
if lock ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
return 1
"#;

// Write a checkpoint only if we still hold the lock and the new
// sequence number is not lexicographically smaller than the stored one.
const CHECKPOINT_SCRIPT: &str = r#"
local lock = redis.call('GET', KEYS[1])
if lock ~= ARGV[1] then
    return 0
end
local current = redis.call('GET', KEYS[2])
if current ~= false and ARGV[2] < current then
    return -1
end
redis.call('SET', KEYS[2], ARGV[2])
return 1
"#;

// Release a lock only if we still hold it under our token.
const RELEASE_SCRIPT: &str = r#"
local lock = redis.call('GET', KEYS[1])
if lock == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('DEL', KEYS[2])
    return 1
end
return 0
"#;

struct OwnedShard {
    token: String,
    heartbeat_task: JoinHandle<()>,
}

struct State {
    owned: HashMap<ShardId, OwnedShard>,
    known_sequences: HashMap<ShardId, Option<SequenceNumber>>,
}

/// A [`Checkpointer`] backed by Redis, usable from multiple consumer
/// processes sharing the same Redis instance and stream name.
pub struct DistributedCheckpointer {
    conn: ConnectionManager,
    stream_name: String,
    consumer_id: String,
    heartbeat_frequency: Duration,
    heartbeat_expiry: Duration,
    /// How long `allocate`'s caller is willing to wait for a single
    /// Redis round trip before treating the call as failed. Held here
    /// rather than threaded through every method so callers configure it
    /// once, at `connect` time.
    session_timeout: Duration,
    state: Arc<SyncMutex<State>>,
    fence_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl DistributedCheckpointer {
    /// Connect to `redis_url` and build a checkpointer for `stream_name`.
    /// `consumer_id` should be stable across process restarts if the
    /// caller wants deterministic reallocation behavior, but any unique
    /// string works.
    pub async fn connect(
        redis_url: &str,
        stream_name: impl Into<String>,
        consumer_id: impl Into<String>,
        heartbeat_frequency: Duration,
        heartbeat_expiry: Duration,
        session_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url).map_err(|e| StreamError::ServiceInternal {
            message: format!("invalid redis url: {e}"),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StreamError::ServiceInternal {
                message: format!("redis connection failed: {e}"),
            })?;
        Ok(Self {
            conn,
            stream_name: stream_name.into(),
            consumer_id: consumer_id.into(),
            heartbeat_frequency,
            heartbeat_expiry,
            session_timeout,
            state: Arc::new(SyncMutex::new(State {
                owned: HashMap::new(),
                known_sequences: HashMap::new(),
            })),
            fence_counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        })
    }

    /// Connect using the default timings: 15 s heartbeats, 60 s heartbeat
    /// expiry, 10 s session timeout.
    pub async fn connect_with_defaults(
        redis_url: &str,
        stream_name: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Result<Self, StreamError> {
        Self::connect(
            redis_url,
            stream_name,
            consumer_id,
            Duration::from_secs(15),
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
        .await
    }

    fn lock_key(&self, shard_id: &ShardId) -> String {
        format!("lock:{}:{}", self.stream_name, shard_id)
    }

    fn heartbeat_key(&self, shard_id: &ShardId) -> String {
        format!("heartbeat:{}:{}", self.stream_name, shard_id)
    }

    fn sequence_key(&self, shard_id: &ShardId) -> String {
        format!("seq:{}:{}", self.stream_name, shard_id)
    }

    fn next_fence_token(&self) -> String {
        let n = self
            .fence_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}:{}", self.consumer_id, n)
    }

    fn spawn_heartbeat(&self, shard_id: ShardId, token: String) -> JoinHandle<()> {
        let mut conn = self.conn.clone();
        let heartbeat_key = self.heartbeat_key(&shard_id);
        let lock_key = self.lock_key(&shard_id);
        let frequency = self.heartbeat_frequency;
        let expiry_ms = self.heartbeat_expiry.as_millis() as u64;
        let state = self.state.clone();
        tokio::spawn(async move {
            let script = Script::new(HEARTBEAT_SCRIPT);
            loop {
                tokio::time::sleep(frequency).await;
                let result: redis::RedisResult<i32> = script
                    .key(&lock_key)
                    .key(&heartbeat_key)
                    .arg(&token)
                    .arg(&token)
                    .arg(expiry_ms)
                    .invoke_async(&mut conn)
                    .await;
                match result {
                    Ok(1) => continue,
                    Ok(_) => {
                        warn!(shard = %shard_id, "lost checkpoint lock, stopping heartbeat");
                        state.lock().owned.remove(&shard_id);
                        break;
                    }
                    Err(e) => {
                        warn!(shard = %shard_id, error = %e, "heartbeat refresh failed");
                    }
                }
            }
        })
    }

    /// Bounds a single Redis round trip to `session_timeout`, surfacing a
    /// timeout the same way as any other backing-store failure.
    async fn with_session_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StreamError> {
        match tokio::time::timeout(self.session_timeout, fut).await {
            Ok(result) => result.map_err(|e| StreamError::ServiceInternal {
                message: format!("redis error: {e}"),
            }),
            Err(_) => Err(StreamError::ServiceInternal {
                message: format!(
                    "redis call exceeded session_timeout ({:?})",
                    self.session_timeout
                ),
            }),
        }
    }
}

#[async_trait]
impl Checkpointer for DistributedCheckpointer {
    async fn allocate(&self, shard_id: &ShardId) -> Result<AllocationResult, StreamError> {
        if self.state.lock().owned.contains_key(shard_id) {
            return Ok(AllocationResult {
                acquired: false,
                resume_sequence: None,
            });
        }

        let token = self.next_fence_token();
        let mut conn = self.conn.clone();
        let acquired: i32 = self
            .with_session_timeout(
                Script::new(TRY_ACQUIRE_SCRIPT)
                    .key(self.lock_key(shard_id))
                    .key(self.heartbeat_key(shard_id))
                    .arg(&token)
                    .arg(&token)
                    .arg(self.heartbeat_expiry.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;

        if acquired != 1 {
            return Ok(AllocationResult {
                acquired: false,
                resume_sequence: None,
            });
        }

        let resume_sequence: Option<String> = self
            .with_session_timeout(conn.get(self.sequence_key(shard_id)))
            .await?;
        let resume_sequence = resume_sequence.map(SequenceNumber::new);

        let heartbeat_task = self.spawn_heartbeat(shard_id.clone(), token.clone());
        let mut state = self.state.lock();
        state.owned.insert(
            shard_id.clone(),
            OwnedShard {
                token,
                heartbeat_task,
            },
        );
        state
            .known_sequences
            .insert(shard_id.clone(), resume_sequence.clone());

        Ok(AllocationResult {
            acquired: true,
            resume_sequence,
        })
    }

    async fn checkpoint(
        &self,
        shard_id: &ShardId,
        sequence: SequenceNumber,
    ) -> Result<(), StreamError> {
        let token = {
            let state = self.state.lock();
            state
                .owned
                .get(shard_id)
                .map(|owned| owned.token.clone())
                .ok_or_else(|| StreamError::CheckpointContested {
                    shard_id: shard_id.to_string(),
                })?
        };

        let mut conn = self.conn.clone();
        let result: i32 = self
            .with_session_timeout(
                Script::new(CHECKPOINT_SCRIPT)
                    .key(self.lock_key(shard_id))
                    .key(self.sequence_key(shard_id))
                    .arg(&token)
                    .arg(sequence.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        if result != 1 {
            return Err(StreamError::CheckpointContested {
                shard_id: shard_id.to_string(),
            });
        }

        self.state
            .lock()
            .known_sequences
            .insert(shard_id.clone(), Some(sequence));
        Ok(())
    }

    async fn deallocate(&self, shard_id: &ShardId) -> Result<(), StreamError> {
        let owned = self.state.lock().owned.remove(shard_id);
        let Some(owned) = owned else {
            return Ok(());
        };
        owned.heartbeat_task.abort();

        let mut conn = self.conn.clone();
        let _: i32 = self
            .with_session_timeout(
                Script::new(RELEASE_SCRIPT)
                    .key(self.lock_key(shard_id))
                    .key(self.heartbeat_key(shard_id))
                    .arg(&owned.token)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        let owned_shards: Vec<ShardId> = self.state.lock().owned.keys().cloned().collect();
        for shard_id in owned_shards {
            self.deallocate(&shard_id).await?;
        }
        let mut state = self.state.lock();
        state.owned.clear();
        state.known_sequences.clear();
        Ok(())
    }

    async fn get_all_checkpoints(&self) -> HashMap<ShardId, Option<SequenceNumber>> {
        self.state.lock().known_sequences.clone()
    }

    fn is_owner(&self, shard_id: &ShardId) -> bool {
        self.state.lock().owned.contains_key(shard_id)
    }
}

// These tests need a real Redis instance reachable at `REDIS_URL` (defaults
// to redis://127.0.0.1/); run with `cargo test -- --ignored` against one.
#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_allocate_for_the_same_shard_grants_exactly_one_winner() {
        let name = format!("test-{}", Uuid::new_v4());
        let shard = ShardId::new("shard-0");

        let a = DistributedCheckpointer::connect_with_defaults(&redis_url(), &name, "proc-1")
            .await
            .unwrap();
        let b = DistributedCheckpointer::connect_with_defaults(&redis_url(), &name, "proc-2")
            .await
            .unwrap();

        let (ra, rb) = tokio::join!(a.allocate(&shard), b.allocate(&shard));
        let acquired = [ra.unwrap().acquired, rb.unwrap().acquired];
        assert_eq!(acquired.iter().filter(|x| **x).count(), 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn checkpoint_survives_deallocate_and_reallocation_by_another_process() {
        let name = format!("test-{}", Uuid::new_v4());
        let shard = ShardId::new("shard-0");

        let a = DistributedCheckpointer::connect_with_defaults(&redis_url(), &name, "proc-1")
            .await
            .unwrap();
        a.allocate(&shard).await.unwrap();
        a.checkpoint(&shard, SequenceNumber::new("123")).await.unwrap();
        a.deallocate(&shard).await.unwrap();

        let b = DistributedCheckpointer::connect_with_defaults(&redis_url(), &name, "proc-2")
            .await
            .unwrap();
        let result = b.allocate(&shard).await.unwrap();
        assert!(result.acquired);
        assert_eq!(result.resume_sequence, Some(SequenceNumber::new("123")));

        b.close().await.unwrap();
        assert!(b.get_all_checkpoints().await.is_empty());

        a.close().await.unwrap();
    }
}
