//! Pluggable checkpoint storage for consumers.
//!
//! A checkpointer arbitrates which consumer instance owns which shard
//! (so two consumer processes sharing a checkpointer never double-read a
//! shard) and records how far each shard has been consumed.

use crate::error::StreamError;
use crate::types::{SequenceNumber, ShardId};
use async_trait::async_trait;
use std::collections::HashMap;

/// Result of attempting to take ownership of a shard.
#[derive(Clone, Debug)]
pub struct AllocationResult {
    pub acquired: bool,
    /// The sequence number to resume from, if this shard was previously
    /// checkpointed (by this consumer or a prior owner).
    pub resume_sequence: Option<SequenceNumber>,
}

/// Coordinates shard ownership and checkpoint state across one or more
/// consumer instances.
///
/// Implementations must make [`Checkpointer::allocate`] race-safe: when
/// two consumers call it concurrently for the same shard, exactly one
/// may receive `acquired: true`.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Attempt to take ownership of `shard_id`. Never blocks waiting for
    /// another owner to release it; returns immediately with
    /// `acquired: false` instead.
    async fn allocate(&self, shard_id: &ShardId) -> Result<AllocationResult, StreamError>;

    /// Record that `shard_id` has been consumed up to and including
    /// `sequence`. Rejects sequence numbers that are not monotonically
    /// increasing relative to the last recorded value.
    async fn checkpoint(
        &self,
        shard_id: &ShardId,
        sequence: SequenceNumber,
    ) -> Result<(), StreamError>;

    /// Release ownership of `shard_id` without discarding its recorded
    /// sequence number, so a future `allocate` (by this or another
    /// consumer) resumes from where it left off.
    async fn deallocate(&self, shard_id: &ShardId) -> Result<(), StreamError>;

    /// Release every shard this instance owns and forget local state.
    /// After `close`, [`Checkpointer::get_all_checkpoints`] observes
    /// nothing.
    async fn close(&self) -> Result<(), StreamError>;

    /// The sequence numbers this instance has recorded, keyed by shard.
    async fn get_all_checkpoints(&self) -> HashMap<ShardId, Option<SequenceNumber>>;

    /// Local-state check of whether this instance still owns `shard_id`,
    /// for a fetch loop to poll between checkpoints so a shard that never
    /// produces a record still notices it lost the lock. Never contacts
    /// the backing store: `true` can go stale the instant after it's
    /// read. `checkpoint`'s own compare-and-set is the source of truth;
    /// this is only a liveness signal to stop polling a shard promptly.
    fn is_owner(&self, shard_id: &ShardId) -> bool;
}
