//! Per-shard fetch state tracked by a running consumer.

use crate::ratelimit::RateLimiter;
use crate::service::IteratorHandle;
use crate::types::{SequenceNumber, ShardId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle of one shard's fetch loop within a single consumer process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardState {
    /// Discovered but not yet allocated via the checkpointer.
    Unallocated,
    /// Allocated; obtaining the initial shard iterator.
    Starting,
    /// Actively polling `get_records`.
    Fetching,
    /// Backing off after a throttling response.
    Throttled,
    /// The shard has been fully drained (no more records, ever).
    Closed,
    /// Ownership released; the fetch task is winding down.
    Deallocated,
}

/// Point-in-time counters for one shard, safe to read from any task
/// without locking (relaxed loads only; these are for observability,
/// not coordination).
#[derive(Default)]
pub struct ShardStats {
    pub records_fetched: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub throttles: AtomicU64,
    pub errors: AtomicU64,
    /// Times `record_limit` was hit while more records were already
    /// available on the service side (non-zero `millis_behind_latest`):
    /// the client, not the service, is the limiting factor.
    pub client_throttles: AtomicU64,
}

/// A snapshot of [`ShardStats`] at one instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShardStatsSnapshot {
    pub records_fetched: u64,
    pub bytes_fetched: u64,
    pub throttles: u64,
    pub errors: u64,
    pub client_throttles: u64,
}

impl ShardStats {
    pub fn snapshot(&self) -> ShardStatsSnapshot {
        ShardStatsSnapshot {
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            client_throttles: self.client_throttles.load(Ordering::Relaxed),
        }
    }
}

/// Everything the consumer's fetch loop needs for one shard.
pub struct ShardHandle {
    pub id: ShardId,
    pub parent_shard_id: Option<ShardId>,
    pub adjacent_parent_shard_id: Option<ShardId>,
    pub rate_limiter: RateLimiter,
    pub stats: Arc<ShardStats>,
    state: Mutex<ShardState>,
    iterator: Mutex<Option<IteratorHandle>>,
    last_sequence: Mutex<Option<SequenceNumber>>,
}

impl ShardHandle {
    pub fn new(
        id: ShardId,
        parent_shard_id: Option<ShardId>,
        adjacent_parent_shard_id: Option<ShardId>,
        fetch_rate_per_second: f64,
    ) -> Self {
        Self {
            id,
            parent_shard_id,
            adjacent_parent_shard_id,
            rate_limiter: RateLimiter::per_second(fetch_rate_per_second),
            stats: Arc::new(ShardStats::default()),
            state: Mutex::new(ShardState::Unallocated),
            iterator: Mutex::new(None),
            last_sequence: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ShardState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ShardState) {
        *self.state.lock() = state;
    }

    pub fn iterator(&self) -> Option<IteratorHandle> {
        self.iterator.lock().clone()
    }

    pub fn set_iterator(&self, iterator: Option<IteratorHandle>) {
        *self.iterator.lock() = iterator;
    }

    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence.lock().clone()
    }

    pub fn set_last_sequence(&self, sequence: SequenceNumber) {
        *self.last_sequence.lock() = Some(sequence);
    }
}
