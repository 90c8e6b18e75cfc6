//! Batching producer.
//!
//! Records are queued with [`Producer::put`] and flushed in the
//! background either when a batch fills up or after `buffer_time`
//! elapses, whichever comes first. Partial batch failures are retried
//! with backoff; records that exhaust their retry budget are dropped
//! and reported through the `on_error` callback rather than failing the
//! call that queued them, since by then that call has long since
//! returned.

use crate::backoff::BackoffConfig;
use crate::error::{ProducerError, StreamError};
use crate::ratelimit::RateLimiter;
use crate::service::{PutRecordEntry, StreamServiceApi};
use crate::types::{Record, MAX_BATCH_BYTES, MAX_BATCH_COUNT, MAX_RECORD_BYTES};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Type alias for the failure-sink callback.
pub type OnErrorCallback = Arc<dyn Fn(ProducerError) + Send + Sync>;

/// Point-in-time producer counters.
#[derive(Default)]
pub struct ProducerStats {
    pub submitted: AtomicU64,
    pub acknowledged: AtomicU64,
    pub permanently_failed: AtomicU64,
    pub retries: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProducerStatsSnapshot {
    pub submitted: u64,
    pub acknowledged: u64,
    pub permanently_failed: u64,
    pub retries: u64,
}

impl ProducerStats {
    fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

struct QueuedRecord {
    record: Record,
    attempts: u32,
}

/// Builder for configuring a [`Producer`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ProducerBuilder {
    service: Arc<dyn StreamServiceApi>,
    stream_name: String,
    buffer_time: Duration,
    batch_size: usize,
    max_queue_size: usize,
    put_rate_limit_per_shard: f64,
    retry_limit: u32,
    on_error: Option<OnErrorCallback>,
}

impl ProducerBuilder {
    pub(crate) fn new(service: Arc<dyn StreamServiceApi>, stream_name: String) -> Self {
        Self {
            service,
            stream_name,
            buffer_time: Duration::from_millis(500),
            batch_size: 500,
            max_queue_size: 10_000,
            put_rate_limit_per_shard: 1000.0,
            retry_limit: 3,
            on_error: None,
        }
    }

    /// How long to wait for a batch to fill before sending it anyway.
    pub fn buffer_time(mut self, duration: Duration) -> Self {
        self.buffer_time = duration;
        self
    }

    /// Target record count per `put_records` call. Shrinks automatically
    /// on partial failure and grows back toward this ceiling on success.
    pub fn batch_size(mut self, count: usize) -> Self {
        self.batch_size = count.min(MAX_BATCH_COUNT);
        self
    }

    /// Maximum number of records allowed to sit in the internal queue.
    pub fn max_queue_size(mut self, count: usize) -> Self {
        self.max_queue_size = count;
        self
    }

    /// Rate limit for `put_records` calls, in operations per second.
    pub fn put_rate_limit_per_shard(mut self, rate: f64) -> Self {
        self.put_rate_limit_per_shard = rate;
        self
    }

    /// How many times a failed record is retried before being dropped
    /// and reported through `on_error`.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Callback invoked for records that exhaust their retry budget, or
    /// for whole-batch failures the producer judged non-retryable.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProducerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Producer {
        let configured_batch_size = self.batch_size.max(1);
        let inner = Arc::new(ProducerInner {
            service: self.service,
            stream_name: self.stream_name,
            pending: Mutex::new(VecDeque::new()),
            capacity: Semaphore::new(self.max_queue_size),
            effective_batch_size: AtomicUsize::new(configured_batch_size),
            configured_batch_size,
            put_rate_limiter: RateLimiter::per_second(self.put_rate_limit_per_shard),
            retry_limit: self.retry_limit,
            buffer_time: self.buffer_time,
            stats: Arc::new(ProducerStats::default()),
            on_error: self.on_error,
            in_flight_batches: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            oldest_pending_since: Mutex::new(None),
            fatal: Mutex::new(None),
        });

        let ticker = inner.clone();
        tokio::spawn(async move { ticker.buffer_timer_loop().await });

        Producer { inner }
    }
}

struct ProducerInner {
    service: Arc<dyn StreamServiceApi>,
    stream_name: String,
    pending: Mutex<VecDeque<QueuedRecord>>,
    capacity: Semaphore,
    effective_batch_size: AtomicUsize,
    configured_batch_size: usize,
    put_rate_limiter: RateLimiter,
    retry_limit: u32,
    buffer_time: Duration,
    stats: Arc<ProducerStats>,
    on_error: Option<OnErrorCallback>,
    in_flight_batches: AtomicUsize,
    cancel: CancellationToken,
    closed: AtomicBool,
    oldest_pending_since: Mutex<Option<Instant>>,
    /// A whole-batch, non-retryable failure (stream missing, shard quota
    /// exceeded, ...), as opposed to per-record failures, which are
    /// counted and reported without halting the producer. Once set, it
    /// is surfaced to every subsequent `put()`/`flush()` caller; it is
    /// never cleared, since the stream-level condition it represents
    /// does not resolve itself.
    fatal: Mutex<Option<ProducerError>>,
}

impl ProducerInner {
    async fn buffer_timer_loop(self: Arc<Self>) {
        let tick = self.buffer_time.min(Duration::from_millis(100)).max(Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }
            let due = {
                let oldest = self.oldest_pending_since.lock();
                oldest.is_some_and(|since| since.elapsed() >= self.buffer_time)
            };
            if due {
                self.trigger_send_batch();
            }
        }
    }

    /// Drain up to the effective batch size/bytes from the front of the
    /// pending queue and spawn a task to send it. No-op if the queue is
    /// empty. Never holds `pending`'s lock across an `.await`.
    fn trigger_send_batch(self: &Arc<Self>) {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let limit = self.effective_batch_size.load(Ordering::Relaxed).max(1);
            let mut batch = Vec::with_capacity(limit.min(pending.len()));
            let mut bytes = 0usize;
            while batch.len() < limit && bytes < MAX_BATCH_BYTES {
                let Some(next) = pending.front() else { break };
                let next_bytes = next.record.data.len();
                if !batch.is_empty() && bytes + next_bytes > MAX_BATCH_BYTES {
                    break;
                }
                bytes += next_bytes;
                batch.push(pending.pop_front().unwrap());
            }
            if pending.is_empty() {
                *self.oldest_pending_since.lock() = None;
            } else {
                *self.oldest_pending_since.lock() = Some(Instant::now());
            }
            batch
        };

        if batch.is_empty() {
            return;
        }

        self.capacity.add_permits(batch.len());
        self.in_flight_batches.fetch_add(1, Ordering::SeqCst);

        let inner = self.clone();
        tokio::spawn(async move {
            inner.send_batch_with_retry(batch).await;
            inner.in_flight_batches.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn send_batch_with_retry(self: &Arc<Self>, mut remaining: Vec<QueuedRecord>) {
        let backoff = BackoffConfig::default();
        let mut cursor = backoff.cursor();

        loop {
            self.put_rate_limiter.acquire().await;

            let entries: Vec<PutRecordEntry> = remaining
                .iter()
                .map(|q| PutRecordEntry {
                    partition_key: q.record.partition_key.clone(),
                    data: q.record.data.clone(),
                })
                .collect();

            match self.service.put_records(&self.stream_name, entries).await {
                Ok(results) => {
                    let total = remaining.len();
                    let mut retry_batch = Vec::new();
                    let mut failed_count = 0usize;

                    for (mut queued, result) in remaining.into_iter().zip(results) {
                        match result.error {
                            None => {
                                self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
                            }
                            Some(err) => {
                                failed_count += 1;
                                queued.attempts += 1;
                                if err.is_retryable() && queued.attempts <= self.retry_limit {
                                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                                    retry_batch.push(queued);
                                } else {
                                    self.stats.permanently_failed.fetch_add(1, Ordering::Relaxed);
                                    self.report_error(ProducerError::Stream {
                                        message: err.message,
                                    });
                                }
                            }
                        }
                    }

                    self.rebalance_batch_size(failed_count, total);

                    if retry_batch.is_empty() {
                        return;
                    }
                    remaining = retry_batch;
                    tokio::time::sleep(cursor.next()).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(stream = %self.stream_name, error = %e, "put_records failed, retrying");
                    tokio::time::sleep(cursor.next()).await;
                }
                Err(e) => {
                    self.stats
                        .permanently_failed
                        .fetch_add(remaining.len() as u64, Ordering::Relaxed);
                    let err = ProducerError::from(e);
                    self.set_fatal(err.clone());
                    self.report_error(err);
                    return;
                }
            }
        }
    }

    fn rebalance_batch_size(&self, failed: usize, total: usize) {
        if total == 0 {
            return;
        }
        if failed * 2 > total {
            let current = self.effective_batch_size.load(Ordering::Relaxed);
            let shrunk = (current / 2).max(1);
            self.effective_batch_size.store(shrunk, Ordering::Relaxed);
        } else if failed == 0 {
            let current = self.effective_batch_size.load(Ordering::Relaxed);
            if current < self.configured_batch_size {
                let grown = (current + (self.configured_batch_size - current).div_ceil(10))
                    .min(self.configured_batch_size);
                self.effective_batch_size.store(grown, Ordering::Relaxed);
            }
        }
    }

    fn report_error(&self, err: ProducerError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    /// Records a fatal, whole-batch failure, keeping the first one seen.
    fn set_fatal(&self, err: ProducerError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn take_fatal(&self) -> Option<ProducerError> {
        self.fatal.lock().clone()
    }
}

/// A batching producer for one stream.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub fn builder(service: Arc<dyn StreamServiceApi>, stream_name: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(service, stream_name.into())
    }

    /// Create the backing stream, with `shard_count` shards. Treats the
    /// stream already existing as success.
    pub async fn create_stream(&self, shard_count: u32) -> Result<(), StreamError> {
        match self
            .inner
            .service
            .create_stream(&self.inner.stream_name, shard_count)
            .await
        {
            Ok(()) | Err(StreamError::StreamExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Queue a record for publication. Returns once the record is
    /// accepted into the internal queue; this may suspend the caller if
    /// the queue is at capacity.
    pub async fn put(&self, record: Record) -> Result<(), ProducerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ProducerError::Closed);
        }
        if let Some(err) = self.inner.take_fatal() {
            return Err(err);
        }
        if record.data.len() >= MAX_RECORD_BYTES {
            return Err(ProducerError::ExceededPutLimit {
                size: record.data.len(),
                limit: MAX_RECORD_BYTES,
            });
        }

        let permit = tokio::select! {
            permit = self.inner.capacity.acquire() => permit,
            _ = self.inner.cancel.cancelled() => return Err(ProducerError::Closed),
        };
        let Ok(permit) = permit else {
            return Err(ProducerError::Closed);
        };
        permit.forget();

        {
            let mut pending = self.inner.pending.lock();
            if pending.is_empty() {
                *self.inner.oldest_pending_since.lock() = Some(Instant::now());
            }
            pending.push_back(QueuedRecord { record, attempts: 0 });
        }
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let count = self.inner.pending.lock().len();
        let threshold = self.inner.effective_batch_size.load(Ordering::Relaxed);
        if count >= threshold {
            self.inner.trigger_send_batch();
        }

        Ok(())
    }

    /// Encode `value` as JSON and queue it. Requires the `json` feature.
    #[cfg(feature = "json")]
    pub async fn put_json<T: serde::Serialize>(
        &self,
        partition_key: impl Into<String>,
        value: &T,
    ) -> Result<(), ProducerError> {
        let data = serde_json::to_vec(value).map_err(|e| ProducerError::Stream {
            message: e.to_string(),
        })?;
        self.put(Record::new(partition_key, data)).await
    }

    /// Send everything currently queued and wait for it to be
    /// acknowledged or permanently failed. Returns the first fatal,
    /// whole-batch error encountered (stream missing, shard quota
    /// exceeded, ...); individual record failures are counted in
    /// [`Producer::stats`] instead and do not cause `flush` to fail.
    pub async fn flush(&self) -> Result<(), ProducerError> {
        loop {
            let has_pending = !self.inner.pending.lock().is_empty();
            if has_pending {
                self.inner.trigger_send_batch();
            }
            let in_flight = self.inner.in_flight_batches.load(Ordering::SeqCst);
            if !has_pending && in_flight == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        match self.inner.take_fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush, then stop accepting new records.
    pub async fn close(&self) -> Result<(), ProducerError> {
        let result = self.flush().await;
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cancel.cancel();
        result
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_fake::FakeStreamServiceApi;

    #[tokio::test]
    async fn put_above_limit_is_rejected_before_queueing() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api, "s").build();

        let oversized = vec![0u8; MAX_RECORD_BYTES];
        let err = producer
            .put(Record::new("pk", oversized))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::ExceededPutLimit { .. }));
    }

    #[tokio::test]
    async fn put_then_flush_acknowledges_all_records() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api, "s")
            .buffer_time(Duration::from_millis(10))
            .build();

        for i in 0..50 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();

        assert_eq!(producer.stats().acknowledged, 50);
        assert_eq!(producer.stats().permanently_failed, 0);
    }

    #[tokio::test]
    async fn create_stream_treats_already_exists_as_success() {
        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        let producer = Producer::builder(api, "s").build();
        producer.create_stream(1).await.unwrap();
    }

    #[tokio::test]
    async fn batch_size_shrinks_on_heavy_partial_failure_and_all_records_eventually_land() {
        use crate::service_fake::InjectedFailure;

        let api = Arc::new(FakeStreamServiceApi::new());
        api.create_stream("s", 1).await.unwrap();
        // Configured batch size is clamped to MAX_BATCH_COUNT (500); the
        // first batch throttles most of its records, forcing a shrink.
        api.inject_put_failures(vec![InjectedFailure::PartialThrottle(400)])
            .await;

        let producer = Producer::builder(api, "s")
            .batch_size(600)
            .buffer_time(Duration::from_millis(10))
            .build();

        for i in 0..1000 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();

        let stats = producer.stats();
        assert_eq!(stats.submitted, 1000);
        assert_eq!(stats.acknowledged, 1000);
        assert_eq!(stats.permanently_failed, 0);
        assert!(stats.retries > 0);
    }

    #[tokio::test]
    async fn fatal_put_records_error_reports_every_queued_record_exactly_once() {
        use crate::service::MockStreamServiceApi;
        use std::sync::atomic::AtomicUsize as StdAtomicUsize;

        let mut mock = MockStreamServiceApi::new();
        mock.expect_put_records().times(1).returning(|_, entries| {
            Err(StreamError::StreamDoesNotExist {
                name: format!("gone (had {} records queued)", entries.len()),
            })
        });

        let call_count = Arc::new(StdAtomicUsize::new(0));
        let counted = call_count.clone();
        let producer = Producer::builder(Arc::new(mock), "s")
            .buffer_time(Duration::from_millis(10))
            .on_error(move |_| {
                counted.fetch_add(1, Ordering::Relaxed);
            })
            .build();

        for i in 0..5 {
            producer
                .put(Record::new(format!("pk-{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        let flush_err = producer.flush().await.unwrap_err();
        assert!(matches!(flush_err, ProducerError::Stream { .. }));

        // A fatal whole-batch error is reported once, not once per record.
        assert_eq!(call_count.load(Ordering::Relaxed), 1);
        assert_eq!(producer.stats().permanently_failed, 5);
        assert_eq!(producer.stats().acknowledged, 0);

        // the fatal condition is sticky: further puts are rejected too.
        let err = producer
            .put(Record::new("pk-late", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::Stream { .. }));
    }
}
