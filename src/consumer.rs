//! Shard-fetching consumer.
//!
//! A [`Consumer`] discovers a stream's shards, claims them through a
//! [`Checkpointer`], and runs one fetch loop per claimed shard, each
//! rate-limited independently. Fetched records land in a single bounded
//! queue; [`Consumer::drain`] empties whatever is currently buffered
//! without waiting for more to arrive: a bounded channel with drain-now
//! semantics, fed here by many per-shard fetch tasks instead of one
//! reader for a single stream.

use crate::backoff::BackoffConfig;
use crate::checkpointer::Checkpointer;
use crate::error::StreamError;
use crate::service::StreamServiceApi;
use crate::shard::{ShardHandle, ShardState};
use crate::types::{ConsumerRecord, IteratorPosition, ShardId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builder for configuring a [`Consumer`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ConsumerBuilder {
    service: Arc<dyn StreamServiceApi>,
    stream_name: String,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    iterator_type: IteratorPosition,
    max_shard_consumers: Option<usize>,
    record_limit: u32,
    shard_fetch_rate: f64,
    sleep_time_no_records: Duration,
    checkpoint_interval: Duration,
    max_queue_size: usize,
    discovery_interval: Duration,
}

impl ConsumerBuilder {
    pub(crate) fn new(service: Arc<dyn StreamServiceApi>, stream_name: String) -> Self {
        Self {
            service,
            stream_name,
            checkpointer: None,
            iterator_type: IteratorPosition::TrimHorizon,
            max_shard_consumers: None,
            record_limit: 10_000,
            shard_fetch_rate: 1.0,
            sleep_time_no_records: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(60),
            max_queue_size: 10_000,
            discovery_interval: Duration::from_secs(30),
        }
    }

    /// Coordinate shard ownership through `checkpointer`. Without one,
    /// this consumer claims every shard it discovers and tracks no
    /// durable checkpoint.
    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Where newly claimed shards (with no prior checkpoint) start
    /// reading from. Defaults to `TrimHorizon`.
    pub fn iterator_type(mut self, position: IteratorPosition) -> Self {
        self.iterator_type = position;
        self
    }

    /// Cap on how many shards this instance claims at once. `None` means
    /// unbounded (claim every shard this checkpointer will grant).
    pub fn max_shard_consumers(mut self, max: usize) -> Self {
        self.max_shard_consumers = Some(max);
        self
    }

    /// Records requested per `get_records` call.
    pub fn record_limit(mut self, limit: u32) -> Self {
        self.record_limit = limit;
        self
    }

    /// `get_records` calls per second, per shard. Capped at 5/s.
    pub fn shard_fetch_rate(mut self, rate: f64) -> Self {
        self.shard_fetch_rate = rate.min(5.0);
        self
    }

    /// How long a shard's fetch loop sleeps after an empty poll.
    pub fn sleep_time_no_records(mut self, duration: Duration) -> Self {
        self.sleep_time_no_records = duration;
        self
    }

    /// Upper bound on how long a shard goes without a checkpoint write
    /// while idle (a checkpoint is always attempted right after a
    /// non-empty fetch, regardless of this interval).
    pub fn checkpoint_interval(mut self, duration: Duration) -> Self {
        self.checkpoint_interval = duration;
        self
    }

    /// Capacity of the shared record queue drained by [`Consumer::drain`].
    pub fn max_queue_size(mut self, count: usize) -> Self {
        self.max_queue_size = count;
        self
    }

    pub fn build(self) -> Consumer {
        let (tx, rx) = mpsc::channel(self.max_queue_size.max(1));
        let inner = Arc::new(ConsumerInner {
            service: self.service,
            stream_name: self.stream_name,
            checkpointer: self.checkpointer,
            iterator_type: self.iterator_type,
            max_shard_consumers: self.max_shard_consumers,
            record_limit: self.record_limit,
            shard_fetch_rate: self.shard_fetch_rate,
            sleep_time_no_records: self.sleep_time_no_records,
            checkpoint_interval: self.checkpoint_interval,
            discovery_interval: self.discovery_interval,
            shards: RwLock::new(HashMap::new()),
            closed_shard_ids: RwLock::new(HashSet::new()),
            queue_tx: tx,
            queue_rx: tokio::sync::Mutex::new(rx),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            discovery_task: Mutex::new(None),
        });

        Consumer { inner }
    }
}

struct ConsumerInner {
    service: Arc<dyn StreamServiceApi>,
    stream_name: String,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    iterator_type: IteratorPosition,
    max_shard_consumers: Option<usize>,
    record_limit: u32,
    shard_fetch_rate: f64,
    sleep_time_no_records: Duration,
    checkpoint_interval: Duration,
    discovery_interval: Duration,
    shards: RwLock<HashMap<ShardId, Arc<ShardHandle>>>,
    closed_shard_ids: RwLock<HashSet<ShardId>>,
    queue_tx: mpsc::Sender<ConsumerRecord>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<ConsumerRecord>>,
    cancel: CancellationToken,
    started: AtomicBool,
    discovery_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConsumerInner {
    async fn discovery_loop(self: Arc<Self>) {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.discovery_interval) => {}
                }
            }
            first = false;

            match self.service.list_shards(&self.stream_name).await {
                Ok(descriptions) => self.reconcile(descriptions).await,
                Err(e) => warn!(stream = %self.stream_name, error = %e, "list_shards failed"),
            }
        }
    }

    async fn reconcile(self: &Arc<Self>, descriptions: Vec<crate::service::ShardDescription>) {
        for closed in descriptions.iter().filter(|d| !d.is_open) {
            let owned = self.shards.read().contains_key(&closed.shard_id);
            if !owned {
                self.closed_shard_ids.write().insert(closed.shard_id.clone());
            }
        }

        for desc in &descriptions {
            if self.shards.read().contains_key(&desc.shard_id) {
                continue;
            }
            if let Some(max) = self.max_shard_consumers {
                if self.shards.read().len() >= max {
                    continue;
                }
            }
            if !self.parents_drained(desc) {
                continue;
            }

            let (acquired, resume_sequence) = match &self.checkpointer {
                Some(checkpointer) => match checkpointer.allocate(&desc.shard_id).await {
                    Ok(result) => (result.acquired, result.resume_sequence),
                    Err(e) => {
                        warn!(shard = %desc.shard_id, error = %e, "checkpointer allocate failed");
                        continue;
                    }
                },
                None => (true, None),
            };

            if !acquired {
                continue;
            }

            self.start_shard(desc.clone(), resume_sequence).await;
        }
    }

    fn parents_drained(&self, desc: &crate::service::ShardDescription) -> bool {
        let closed = self.closed_shard_ids.read();
        let parent_ok = desc
            .parent_shard_id
            .as_ref()
            .map(|p| closed.contains(p))
            .unwrap_or(true);
        let adjacent_ok = desc
            .adjacent_parent_shard_id
            .as_ref()
            .map(|p| closed.contains(p))
            .unwrap_or(true);
        parent_ok && adjacent_ok
    }

    async fn start_shard(
        self: &Arc<Self>,
        desc: crate::service::ShardDescription,
        resume_sequence: Option<crate::types::SequenceNumber>,
    ) {
        let position = match resume_sequence {
            Some(seq) => IteratorPosition::after(seq),
            None => self.iterator_type.clone(),
        };

        let iterator = match self
            .service
            .get_shard_iterator(&self.stream_name, &desc.shard_id, &position)
            .await
        {
            Ok(it) => it,
            Err(e) => {
                warn!(shard = %desc.shard_id, error = %e, "get_shard_iterator failed");
                if let Some(checkpointer) = &self.checkpointer {
                    let _ = checkpointer.deallocate(&desc.shard_id).await;
                }
                return;
            }
        };

        let handle = Arc::new(ShardHandle::new(
            desc.shard_id.clone(),
            desc.parent_shard_id.clone(),
            desc.adjacent_parent_shard_id.clone(),
            self.shard_fetch_rate,
        ));
        handle.set_iterator(Some(iterator));
        handle.set_state(ShardState::Fetching);

        self.shards.write().insert(desc.shard_id.clone(), handle.clone());
        debug!(shard = %desc.shard_id, "claimed shard");

        let inner = self.clone();
        tokio::spawn(async move { inner.fetch_shard_loop(handle).await });
    }

    async fn fetch_shard_loop(self: Arc<Self>, handle: Arc<ShardHandle>) {
        let backoff = BackoffConfig::default();
        let mut cursor = backoff.cursor();
        let mut last_checkpoint = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(checkpointer) = &self.checkpointer {
                if !checkpointer.is_owner(&handle.id) {
                    warn!(shard = %handle.id, "lost checkpoint ownership, releasing shard");
                    handle.set_state(ShardState::Deallocated);
                    self.shards.write().remove(&handle.id);
                    break;
                }
            }

            handle.rate_limiter.acquire().await;

            let Some(iterator) = handle.iterator() else {
                break;
            };

            match self.service.get_records(&iterator, self.record_limit).await {
                Ok(outcome) => {
                    cursor = backoff.cursor();
                    handle.set_state(ShardState::Fetching);

                    let record_count = outcome.records.len();
                    let millis_behind_latest = outcome.millis_behind_latest;
                    if record_count as u64 >= self.record_limit as u64 && millis_behind_latest > 0
                    {
                        handle
                            .stats
                            .client_throttles
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    for record in outcome.records {
                        let sequence = record.sequence_number.clone();
                        let consumer_record = ConsumerRecord {
                            shard_id: handle.id.clone(),
                            sequence_number: record.sequence_number,
                            partition_key: record.partition_key,
                            data: record.data,
                            arrival_timestamp: record.arrival_timestamp,
                        };
                        handle
                            .stats
                            .bytes_fetched
                            .fetch_add(consumer_record.data.len() as u64, Ordering::Relaxed);
                        if self.queue_tx.send(consumer_record).await.is_err() {
                            return; // consumer dropped
                        }
                        handle.stats.records_fetched.fetch_add(1, Ordering::Relaxed);
                        handle.set_last_sequence(sequence);
                    }

                    match outcome.next_iterator {
                        Some(next) => handle.set_iterator(Some(next)),
                        None => {
                            handle.set_state(ShardState::Closed);
                            self.close_shard(&handle).await;
                            break;
                        }
                    }

                    let should_checkpoint =
                        record_count > 0 || last_checkpoint.elapsed() >= self.checkpoint_interval;
                    if should_checkpoint {
                        if let Some(sequence) = handle.last_sequence() {
                            if !self.checkpoint_shard(&handle, sequence).await {
                                break;
                            }
                        }
                        last_checkpoint = Instant::now();
                    }

                    if record_count == 0 {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.sleep_time_no_records) => {}
                        }
                    }
                }
                Err(StreamError::Throttled { .. }) => {
                    handle.stats.throttles.fetch_add(1, Ordering::Relaxed);
                    handle.set_state(ShardState::Throttled);
                    tokio::time::sleep(cursor.next()).await;
                }
                Err(e) if e.is_retryable() => {
                    handle.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(cursor.next()).await;
                }
                Err(e) => {
                    warn!(shard = %handle.id, error = %e, "shard fetch failed, releasing");
                    handle.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.close_shard(&handle).await;
                    break;
                }
            }
        }
    }

    /// Writes a checkpoint; returns false if the shard was lost and the
    /// caller should stop its fetch loop.
    async fn checkpoint_shard(
        &self,
        handle: &Arc<ShardHandle>,
        sequence: crate::types::SequenceNumber,
    ) -> bool {
        let Some(checkpointer) = &self.checkpointer else {
            return true;
        };
        match checkpointer.checkpoint(&handle.id, sequence).await {
            Ok(()) => true,
            Err(StreamError::CheckpointContested { .. }) => {
                warn!(shard = %handle.id, "checkpoint contested, releasing shard");
                handle.set_state(ShardState::Deallocated);
                self.shards.write().remove(&handle.id);
                false
            }
            Err(e) => {
                warn!(shard = %handle.id, error = %e, "checkpoint write failed");
                true
            }
        }
    }

    async fn close_shard(&self, handle: &Arc<ShardHandle>) {
        self.closed_shard_ids.write().insert(handle.id.clone());
        if let Some(checkpointer) = &self.checkpointer {
            let _ = checkpointer.deallocate(&handle.id).await;
        }
        self.shards.write().remove(&handle.id);
    }
}

/// A shard-fetching consumer for one stream.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn builder(
        service: Arc<dyn StreamServiceApi>,
        stream_name: impl Into<String>,
    ) -> ConsumerBuilder {
        ConsumerBuilder::new(service, stream_name.into())
    }

    /// Begin discovering and fetching shards. Idempotent: subsequent
    /// calls are no-ops once the discovery loop is running.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.discovery_loop().await });
        *self.inner.discovery_task.lock() = Some(handle);
    }

    /// Return every record currently buffered, without waiting for more.
    /// Starts the consumer on first call if it hasn't been started yet.
    pub async fn drain(&self) -> Vec<ConsumerRecord> {
        self.start().await;
        let mut rx = self.inner.queue_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    /// Snapshot of per-shard stats, keyed by shard id, for shards
    /// currently owned by this consumer.
    pub fn shard_stats(&self) -> HashMap<ShardId, crate::shard::ShardStatsSnapshot> {
        self.inner
            .shards
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.stats.snapshot()))
            .collect()
    }

    /// Stop fetching and release every owned shard.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.discovery_task.lock().take() {
            let _ = task.await;
        }
        if let Some(checkpointer) = &self.inner.checkpointer {
            let _ = checkpointer.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_fake::FakeStreamServiceApi;
    use crate::types::Record;
    use crate::Producer;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn consumer_reads_a_record_written_before_it_starts() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api.clone(), "s").build();
        producer
            .put(Record::new("pk", b"test".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let consumer = Consumer::builder(api, "s").build();

        let mut records = Vec::new();
        for _ in 0..20 {
            records = consumer.drain().await;
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].data[..], b"test");
        consumer.close().await;
    }

    #[tokio::test]
    async fn max_shard_consumers_limits_claims_across_two_instances() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 2).await.unwrap();
        let checkpointer: Arc<dyn Checkpointer> =
            Arc::new(crate::checkpointer_memory::MemoryCheckpointer::new());

        let consumer_a = Consumer::builder(api.clone(), "s")
            .checkpointer(checkpointer.clone())
            .max_shard_consumers(1)
            .build();
        let consumer_b = Consumer::builder(api, "s")
            .checkpointer(checkpointer)
            .max_shard_consumers(1)
            .build();

        consumer_a.start().await;
        consumer_b.start().await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let owned_a = consumer_a.shard_stats().len();
        let owned_b = consumer_b.shard_stats().len();
        assert_eq!(owned_a + owned_b, 2);
        assert_eq!(owned_a, 1);
        assert_eq!(owned_b, 1);

        consumer_a.close().await;
        consumer_b.close().await;
    }

    #[tokio::test]
    async fn latest_iterator_skips_records_already_present_at_start() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api.clone(), "s").build();
        producer
            .put(Record::new("pk", b"test.A".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let checkpointer_a: Arc<dyn Checkpointer> =
            Arc::new(crate::checkpointer_memory::MemoryCheckpointer::new());
        let consumer_a = Consumer::builder(api.clone(), "s")
            .checkpointer(checkpointer_a.clone())
            .iterator_type(IteratorPosition::Latest)
            .build();
        consumer_a.start().await;
        for _ in 0..20 {
            if !consumer_a.shard_stats().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(consumer_a.drain().await.is_empty());

        let checkpoints = checkpointer_a.get_all_checkpoints().await;
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints.values().next().unwrap().is_none());
        consumer_a.close().await;

        // A fresh consumer, with its own checkpointer, whose shard
        // iterator is created before the next record lands.
        let checkpointer_b: Arc<dyn Checkpointer> =
            Arc::new(crate::checkpointer_memory::MemoryCheckpointer::new());
        let consumer_b = Consumer::builder(api, "s")
            .checkpointer(checkpointer_b.clone())
            .iterator_type(IteratorPosition::Latest)
            .build();
        consumer_b.start().await;
        for _ in 0..20 {
            if !consumer_b.shard_stats().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        producer
            .put(Record::new("pk", b"test.B".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let mut records = Vec::new();
        for _ in 0..20 {
            records = consumer_b.drain().await;
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].data[..], b"test.B");

        // the delivered record was checkpointed before the consumer is
        // torn down (teardown itself clears all local checkpoint state).
        let checkpoints = checkpointer_b.get_all_checkpoints().await;
        assert!(checkpoints.values().next().unwrap().is_some());

        consumer_b.close().await;
    }

    #[tokio::test]
    async fn drain_never_delivers_more_than_the_queue_capacity_at_once() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api.clone(), "s").build();
        for i in 0..100 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();

        let consumer = Consumer::builder(api, "s").max_queue_size(20).build();
        consumer.start().await;
        // A single `get_records` call reads all 100 seeded records; the
        // fetch task blocks on the 21st channel send until this drain
        // makes room, so the first drain sees exactly the queue capacity.
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let records = consumer.drain().await;

        assert_eq!(records.len(), 20);
        consumer.close().await;
    }

    #[tokio::test]
    async fn shard_fetch_rate_bounds_poll_cadence() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api.clone(), "s").build();
        for i in 0..200 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();

        let consumer = Consumer::builder(api, "s")
            .shard_fetch_rate(2.0)
            .record_limit(10)
            .build();
        consumer.start().await;

        let mut total = 0usize;
        let deadline = tokio::time::Instant::now() + StdDuration::from_millis(3050);
        while tokio::time::Instant::now() < deadline {
            total += consumer.drain().await.len();
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        // At 2 polls/sec * 10 records/poll over ~3s, expect 50-70 records,
        // bounded well clear of the 200 available.
        assert!(total >= 50 && total <= 70, "total was {total}");
        consumer.close().await;
    }

    #[tokio::test]
    async fn record_limit_hit_with_more_available_counts_as_a_client_throttle() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api.clone(), "s").build();
        for i in 0..50 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();

        let consumer = Consumer::builder(api, "s").record_limit(10).build();
        consumer.start().await;

        // The first poll returns exactly `record_limit` records while 40
        // more sit unread on the shard, so it should count as a client
        // throttle rather than a real service-side throttle.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        consumer.drain().await;

        let stats = consumer.shard_stats();
        let snapshot = stats.values().next().unwrap();
        assert!(snapshot.client_throttles >= 1, "{snapshot:?}");
        assert_eq!(snapshot.throttles, 0);

        consumer.close().await;
    }

    // Needs a real Redis instance reachable at `REDIS_URL` (defaults to
    // redis://127.0.0.1/); run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn latest_iterator_resumes_only_records_written_after_the_prior_consumer_checkpointed() {
        use crate::checkpointer_distributed::DistributedCheckpointer;
        use uuid::Uuid;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let stream = format!("latest-resume-{}", Uuid::new_v4());

        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream(&stream, 1).await.unwrap();
        let producer = Producer::builder(api.clone(), &stream).build();
        producer
            .put(Record::new("pk", b"before".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let checkpointer_a: Arc<dyn Checkpointer> = Arc::new(
            DistributedCheckpointer::connect_with_defaults(&redis_url, &stream, "proc-1")
                .await
                .unwrap(),
        );
        let consumer_a = Consumer::builder(api.clone(), &stream)
            .checkpointer(checkpointer_a)
            .iterator_type(IteratorPosition::Latest)
            .build();
        consumer_a.start().await;
        // Let the shard iterator get created (capturing "now") before the
        // next record lands, so Latest actually skips `before`.
        for _ in 0..20 {
            if !consumer_a.shard_stats().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        producer
            .put(Record::new("pk", b"during".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let mut seen_a = Vec::new();
        for _ in 0..20 {
            seen_a = consumer_a.drain().await;
            if !seen_a.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert_eq!(seen_a.len(), 1);
        assert_eq!(&seen_a[0].data[..], b"during");
        consumer_a.close().await;

        producer
            .put(Record::new("pk", b"after".to_vec()))
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let checkpointer_b: Arc<dyn Checkpointer> = Arc::new(
            DistributedCheckpointer::connect_with_defaults(&redis_url, &stream, "proc-2")
                .await
                .unwrap(),
        );
        let consumer_b = Consumer::builder(api, &stream)
            .checkpointer(checkpointer_b)
            .iterator_type(IteratorPosition::Latest)
            .build();

        let mut seen_b = Vec::new();
        for _ in 0..20 {
            seen_b = consumer_b.drain().await;
            if !seen_b.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert_eq!(seen_b.len(), 1);
        assert_eq!(&seen_b[0].data[..], b"after");
        consumer_b.close().await;
    }
}
