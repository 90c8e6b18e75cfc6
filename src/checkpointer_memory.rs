//! In-process checkpointer. Coordinates shard ownership between
//! consumer instances that share the same `Arc<MemoryCheckpointer>` (a
//! single process, or a test harness simulating several consumers).

use crate::checkpointer::{AllocationResult, Checkpointer};
use crate::error::StreamError;
use crate::types::{SequenceNumber, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct State {
    owned: HashSet<ShardId>,
    sequences: HashMap<ShardId, Option<SequenceNumber>>,
}

/// A [`Checkpointer`] backed by an in-memory mutex. Ownership and
/// sequence state are only visible to instances that share this
/// `Arc`-wrapped value; it does not survive process restart.
pub struct MemoryCheckpointer {
    state: Mutex<State>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn allocate(&self, shard_id: &ShardId) -> Result<AllocationResult, StreamError> {
        let mut state = self.state.lock();
        if state.owned.contains(shard_id) {
            return Ok(AllocationResult {
                acquired: false,
                resume_sequence: None,
            });
        }
        state.owned.insert(shard_id.clone());
        let resume_sequence = state
            .sequences
            .entry(shard_id.clone())
            .or_insert(None)
            .clone();
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
        let mut state = self.state.lock();
        if !state.owned.contains(shard_id) {
            return Err(StreamError::CheckpointContested {
                shard_id: shard_id.to_string(),
            });
        }
        if let Some(Some(current)) = state.sequences.get(shard_id) {
            if sequence < *current {
                return Err(StreamError::CheckpointContested {
                    shard_id: shard_id.to_string(),
                });
            }
        }
        state.sequences.insert(shard_id.clone(), Some(sequence));
        Ok(())
    }

    async fn deallocate(&self, shard_id: &ShardId) -> Result<(), StreamError> {
        self.state.lock().owned.remove(shard_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        state.owned.clear();
        state.sequences.clear();
        Ok(())
    }

    async fn get_all_checkpoints(&self) -> HashMap<ShardId, Option<SequenceNumber>> {
        self.state.lock().sequences.clone()
    }

    fn is_owner(&self, shard_id: &ShardId) -> bool {
        self.state.lock().owned.contains(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_allocate_is_refused_while_first_owner_holds_it() {
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let shard = ShardId::new("shard-0");

        let first = checkpointer.allocate(&shard).await.unwrap();
        assert!(first.acquired);

        let second = checkpointer.allocate(&shard).await.unwrap();
        assert!(!second.acquired);
    }

    #[tokio::test]
    async fn checkpoint_persists_across_deallocate_and_reallocate() {
        let checkpointer = MemoryCheckpointer::new();
        let shard = ShardId::new("shard-0");

        checkpointer.allocate(&shard).await.unwrap();
        checkpointer
            .checkpoint(&shard, SequenceNumber::new("5"))
            .await
            .unwrap();
        checkpointer.deallocate(&shard).await.unwrap();

        let result = checkpointer.allocate(&shard).await.unwrap();
        assert!(result.acquired);
        assert_eq!(result.resume_sequence, Some(SequenceNumber::new("5")));
    }

    #[tokio::test]
    async fn close_clears_all_local_state() {
        let checkpointer = MemoryCheckpointer::new();
        let shard = ShardId::new("shard-0");
        checkpointer.allocate(&shard).await.unwrap();
        checkpointer
            .checkpoint(&shard, SequenceNumber::new("1"))
            .await
            .unwrap();

        checkpointer.close().await.unwrap();

        assert!(checkpointer.get_all_checkpoints().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_rejects_a_sequence_number_lower_than_the_current_one() {
        // sequence numbers compare lexicographically as strings, so these
        // must share a digit count for "lower" to mean what it says.
        let checkpointer = MemoryCheckpointer::new();
        let shard = ShardId::new("shard-0");
        checkpointer.allocate(&shard).await.unwrap();
        checkpointer
            .checkpoint(&shard, SequenceNumber::new("9"))
            .await
            .unwrap();

        let err = checkpointer
            .checkpoint(&shard, SequenceNumber::new("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::CheckpointContested { .. }));

        // the accepted checkpoint is unchanged by the rejected attempt.
        let checkpoints = checkpointer.get_all_checkpoints().await;
        assert_eq!(
            checkpoints.get(&shard).cloned().flatten(),
            Some(SequenceNumber::new("9"))
        );
    }

    #[tokio::test]
    async fn checkpoint_rejects_non_owner() {
        let checkpointer = MemoryCheckpointer::new();
        let shard = ShardId::new("shard-0");
        let err = checkpointer
            .checkpoint(&shard, SequenceNumber::new("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::CheckpointContested { .. }));
    }
}
