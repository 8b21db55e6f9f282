//! In-process fetch source reading straight from an [`OutputBufferManager`].

use crate::buffer::{BufferData, OutputBufferManager};
use crate::error::{ExchangeError, Result};
use crate::exchange::queue::ExchangeQueue;
use crate::exchange::source::{
    register_factory, ExchangeSource, RetryPolicy, SourceContext, SourceFactory, SourceResponse,
};
use crate::exchange::stats::{ExchangeStats, RuntimeMetric};
use crate::memory::MemoryPool;
use crate::page::Page;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Scheme of task ids served by [`LocalExchangeSource`].
pub const LOCAL_SCHEME: &str = "local";

#[derive(Debug, Default)]
struct LocalState {
    /// Sequence number of the next page to ask for
    sequence: u64,
    at_end: bool,
    closed: bool,
}

/// Fetch source for a producer task living in the same process.
pub struct LocalExchangeSource {
    task_id: String,

    /// Task id as known to the buffer manager (scheme stripped)
    producer_task_id: String,
    destination: u32,
    manager: Arc<OutputBufferManager>,
    queue: Weak<ExchangeQueue>,
    pool: Arc<MemoryPool>,
    retry: RetryPolicy,
    state: Mutex<LocalState>,

    num_pages: AtomicU64,
    num_timeouts: AtomicU64,
    num_retries: AtomicU64,
}

impl LocalExchangeSource {
    pub fn new(ctx: &SourceContext, manager: Arc<OutputBufferManager>) -> Self {
        let producer_task_id = ctx
            .task_id
            .split_once("://")
            .map_or(ctx.task_id.as_str(), |(_, rest)| rest)
            .to_string();
        Self {
            task_id: ctx.task_id.clone(),
            producer_task_id,
            destination: ctx.destination,
            manager,
            queue: ctx.queue.clone(),
            pool: Arc::clone(&ctx.pool),
            retry: RetryPolicy::new(ctx.retry.clone()),
            state: Mutex::new(LocalState::default()),
            num_pages: AtomicU64::new(0),
            num_timeouts: AtomicU64::new(0),
            num_retries: AtomicU64::new(0),
        }
    }

    /// Factory building local sources over `manager`.
    pub fn factory(manager: Arc<OutputBufferManager>) -> SourceFactory {
        Arc::new(move |ctx: &SourceContext| -> Result<Arc<dyn ExchangeSource>> {
            Ok(Arc::new(LocalExchangeSource::new(ctx, Arc::clone(&manager))))
        })
    }

    /// Register [`factory`](Self::factory) under the `local` scheme.
    pub fn register(manager: Arc<OutputBufferManager>) {
        register_factory(LOCAL_SCHEME, Self::factory(manager));
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch from the producer, retrying transient failures. `None` means
    /// the wait ran out.
    async fn fetch_with_retry(
        &self,
        max_bytes: u64,
        sequence: u64,
        max_wait: Duration,
    ) -> Result<Option<BufferData>> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .manager
                .fetch(&self.producer_task_id, self.destination, max_bytes, sequence, max_wait)
                .await;
            match result {
                Ok(data) => return Ok(data),
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    let delay = self.retry.backoff(attempt);
                    self.num_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %self.task_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying exchange fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(ExchangeError::source_failed(
                        &self.task_id,
                        format!("giving up after {} retries: {err}", self.retry.max_retries()),
                    ));
                }
                Err(err) => return Err(ExchangeError::source_failed(&self.task_id, err.to_string())),
            }
        }
    }
}

#[async_trait]
impl ExchangeSource for LocalExchangeSource {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn request(&self, max_bytes: u64, max_wait: Duration) -> Result<SourceResponse> {
        let sequence = {
            let st = self.lock();
            if st.closed || st.at_end {
                return Ok(SourceResponse {
                    at_end: true,
                    ..Default::default()
                });
            }
            st.sequence
        };

        let Some(data) = self.fetch_with_retry(max_bytes, sequence, max_wait).await? else {
            self.num_timeouts.fetch_add(1, Ordering::Relaxed);
            trace!(task_id = %self.task_id, max_bytes, "exchange fetch timed out");
            return Ok(SourceResponse::default());
        };

        let Some(queue) = self.queue.upgrade() else {
            // The client is gone; nobody will read what we fetch.
            return Ok(SourceResponse {
                at_end: true,
                ..Default::default()
            });
        };

        let next_sequence = data.next_sequence();
        let mut pages: Vec<Page> = Vec::with_capacity(data.pages.len());
        for mut page in data.pages {
            page.transfer_to(&self.pool)?;
            pages.push(page);
        }
        let bytes: u64 = pages.iter().map(Page::size).sum();
        let num_pages = pages.len() as u64;

        {
            let mut st = self.lock();
            if st.closed {
                return Ok(SourceResponse {
                    at_end: true,
                    ..Default::default()
                });
            }
            st.sequence = next_sequence;
            st.at_end = data.at_end;
        }
        for page in pages {
            queue.enqueue(Some(page));
        }
        self.num_pages.fetch_add(num_pages, Ordering::Relaxed);

        if data.at_end {
            self.manager
                .delete_results(&self.producer_task_id, self.destination)?;
            queue.enqueue(None);
            debug!(task_id = %self.task_id, pages = num_pages, "exchange source at end");
        } else if num_pages > 0 {
            self.acknowledge().await?;
        }

        Ok(SourceResponse {
            bytes,
            at_end: data.at_end,
            remaining_bytes: data.remaining_bytes,
        })
    }

    async fn acknowledge(&self) -> Result<()> {
        let sequence = self.lock().sequence;
        self.manager
            .acknowledge(&self.producer_task_id, self.destination, sequence)
    }

    fn close(&self) {
        {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        if let Err(err) = self
            .manager
            .delete_results(&self.producer_task_id, self.destination)
        {
            debug!(task_id = %self.task_id, error = %err, "delete_results on close failed");
        }
        debug!(task_id = %self.task_id, "exchange source closed");
    }

    fn stats(&self) -> ExchangeStats {
        let mut stats = ExchangeStats::new();
        stats.insert(
            "numPages".into(),
            RuntimeMetric::new(self.num_pages.load(Ordering::Relaxed)),
        );
        stats.insert(
            "numTimeouts".into(),
            RuntimeMetric::new(self.num_timeouts.load(Ordering::Relaxed)),
        );
        stats.insert(
            "numRetries".into(),
            RuntimeMetric::new(self.num_retries.load(Ordering::Relaxed)),
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OutputKind;
    use crate::config::{OutputBufferConfig, RetryConfig};

    fn setup() -> (Arc<OutputBufferManager>, Arc<ExchangeQueue>, LocalExchangeSource) {
        let manager = OutputBufferManager::new(OutputBufferConfig::default());
        manager
            .initialize_task("producer", OutputKind::Partitioned, 1)
            .unwrap();
        let queue = Arc::new(ExchangeQueue::new());
        queue.add_source();
        let ctx = SourceContext {
            task_id: "local://producer".to_string(),
            destination: 0,
            queue: Arc::downgrade(&queue),
            pool: MemoryPool::new_root("consumer"),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
        };
        let source = LocalExchangeSource::new(&ctx, Arc::clone(&manager));
        (manager, queue, source)
    }

    #[tokio::test]
    async fn test_probe_then_fetch_then_end() {
        let (manager, queue, source) = setup();
        manager.enqueue("producer", 0, Page::zeroed(10)).unwrap();
        manager.enqueue("producer", 0, Page::zeroed(20)).unwrap();

        let probe = source.request(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(probe.bytes, 0);
        assert_eq!(probe.remaining_bytes, vec![10, 20]);
        assert_eq!(queue.num_pages(), 0);

        let resp = source.request(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.bytes, 10);
        assert_eq!(resp.remaining_bytes, vec![20]);
        assert_eq!(queue.total_bytes(), 10);
        // Acknowledged: the producer no longer holds the first page.
        assert_eq!(manager.stats("producer").unwrap().buffered_bytes, 20);

        manager.no_more_data("producer").unwrap();
        let resp = source.request(100, Duration::from_secs(1)).await.unwrap();
        assert!(resp.at_end);
        assert_eq!(resp.bytes, 20);

        queue.no_more_sources();
        assert_eq!(queue.next(1_000).unwrap().pages.len(), 2);
        assert!(queue.at_end());
        assert_eq!(source.stats()["numPages"].sum, 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_failure() {
        let (_manager, _queue, source) = setup();
        let resp = source.request(0, Duration::from_millis(10)).await.unwrap();
        assert_eq!(resp, SourceResponse::default());
        assert_eq!(source.stats()["numTimeouts"].sum, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_then_exhausted() {
        let (manager, _queue, source) = setup();
        manager.enqueue("producer", 0, Page::zeroed(10)).unwrap();

        manager.testing_fail_next_fetches("producer", 2).unwrap();
        let resp = source.request(100, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.bytes, 10);
        assert_eq!(source.stats()["numRetries"].sum, 2);

        manager.testing_fail_next_fetches("producer", 3).unwrap();
        let err = source.request(100, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::SourceFailed { .. }));
    }

    #[tokio::test]
    async fn test_consumer_pool_limit_is_fatal() {
        let (manager, _queue, _source) = setup();
        let queue = Arc::new(ExchangeQueue::new());
        let ctx = SourceContext {
            task_id: "local://producer".to_string(),
            destination: 0,
            queue: Arc::downgrade(&queue),
            pool: MemoryPool::new_root_with_capacity("small", 5),
            retry: RetryConfig::default(),
        };
        let source = LocalExchangeSource::new(&ctx, Arc::clone(&manager));
        manager.enqueue("producer", 0, Page::zeroed(10)).unwrap();

        let err = source.request(100, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::AllocationFailed { .. }));
        assert_eq!(queue.num_pages(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_producer_pages() {
        let (manager, _queue, source) = setup();
        manager.enqueue("producer", 0, Page::zeroed(10)).unwrap();
        source.close();
        assert_eq!(manager.stats("producer").unwrap().buffered_bytes, 0);

        let resp = source.request(100, Duration::from_secs(1)).await.unwrap();
        assert!(resp.at_end);
    }
}
