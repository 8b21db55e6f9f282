//! Consumer-facing exchange client.
//!
//! The client owns one [`ExchangeQueue`] and one source per remote producer
//! task. Every call to [`ExchangeClient::next`] and every finished request
//! re-runs flow control, which decides which idle sources may fetch next:
//!
//! - A source whose remaining page sizes are unknown gets a size probe
//!   (`max_bytes == 0`). Probes carry no data, are always admitted and do
//!   not count against `max_concurrent_requests`.
//! - A source with known sizes gets a data request for as many leading
//!   pages as fit in `max_queued_bytes - queued - in flight`.
//! - If nothing is queued and nothing is in flight, one source is admitted
//!   for its first page even when that page alone exceeds the ceiling.
//! - Sources are visited round-robin, and no more than
//!   `max_concurrent_requests` data requests run at once.
//!
//! Closing the client aborts every request still in flight.

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::exchange::queue::{ExchangeQueue, NextBatch};
use crate::exchange::source::{create_source, ExchangeSource, SourceContext, SourceResponse};
use crate::exchange::stats::{merge_stats, ExchangeStats};
use crate::memory::MemoryPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Idle,
    Requesting,
    AtEnd,
    Failed,
}

struct SourceEntry {
    source: Arc<dyn ExchangeSource>,
    state: SourceState,

    /// Sizes of pages the producer holds for us; empty when unknown
    remaining_bytes: Vec<u64>,
}

struct ClientState {
    sources: Vec<SourceEntry>,
    task_ids: HashSet<String>,

    /// Bytes asked for by data requests still in flight
    pending_bytes: u64,

    /// Data requests in flight; probes are not counted
    in_flight: usize,

    /// Spawned requests, aborted on close
    tasks: Vec<AbortHandle>,

    /// Index of the source flow control looks at first
    cursor: usize,
    closed: bool,
}

/// A request flow control decided to issue.
struct Request {
    index: usize,
    source: Arc<dyn ExchangeSource>,
    max_bytes: u64,
}

struct ClientInner {
    /// Consumer task id, for logs
    task_id: String,
    destination: u32,
    config: ExchangeConfig,
    queue: Arc<ExchangeQueue>,
    pool: Arc<MemoryPool>,
    runtime: Handle,
    state: Mutex<ClientState>,
}

/// Pulls pages for one consumer from any number of remote producers.
///
/// Dropping the client closes it.
pub struct ExchangeClient {
    inner: Arc<ClientInner>,
}

impl ExchangeClient {
    /// Create a client whose requests run on the current tokio runtime.
    pub fn new(
        task_id: impl Into<String>,
        destination: u32,
        config: ExchangeConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ExchangeError::Config(format!("exchange client needs a tokio runtime: {e}"))
        })?;
        Self::with_runtime(task_id, destination, config, pool, runtime)
    }

    /// Create a client whose requests are spawned on `runtime`.
    pub fn with_runtime(
        task_id: impl Into<String>,
        destination: u32,
        config: ExchangeConfig,
        pool: Arc<MemoryPool>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                task_id: task_id.into(),
                destination,
                config,
                queue: Arc::new(ExchangeQueue::new()),
                pool,
                runtime,
                state: Mutex::new(ClientState {
                    sources: Vec::new(),
                    task_ids: HashSet::new(),
                    pending_bytes: 0,
                    in_flight: 0,
                    tasks: Vec::new(),
                    cursor: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Start reading from `task_id`. Ids already added are ignored, as are
    /// calls after close.
    pub fn add_remote_task_id(&self, task_id: &str) -> Result<()> {
        let inner = &self.inner;
        {
            let st = inner.lock();
            if st.closed || st.task_ids.contains(task_id) {
                return Ok(());
            }
        }
        // Factories are user code; they run without the client lock.
        let source = create_source(&SourceContext {
            task_id: task_id.to_string(),
            destination: inner.destination,
            queue: Arc::downgrade(&inner.queue),
            pool: Arc::clone(&inner.pool),
            retry: inner.config.retry.clone(),
        })?;

        let requests = {
            let mut st = inner.lock();
            // Lost a race with close or with another add of the same id.
            if st.closed || st.task_ids.contains(task_id) {
                return Ok(());
            }
            inner.queue.add_source();
            st.task_ids.insert(task_id.to_string());
            st.sources.push(SourceEntry {
                source,
                state: SourceState::Idle,
                remaining_bytes: Vec::new(),
            });
            debug!(
                consumer = %inner.task_id,
                task_id,
                sources = st.sources.len(),
                "remote task added"
            );
            inner.pick_sources(&mut st)
        };
        inner.issue(requests);
        Ok(())
    }

    /// No more remote tasks will be added; the exchange can now end.
    pub fn no_more_remote_tasks(&self) {
        self.inner.queue.no_more_sources();
    }

    /// Take received pages totalling at most `max_bytes` (always at least
    /// one page if any is queued).
    ///
    /// With nothing to return and more to come, the batch holds a future
    /// that resolves when calling again is worthwhile. After close this
    /// returns no pages, `at_end` and an invalid future.
    pub fn next(&self, max_bytes: u64) -> Result<NextBatch> {
        let inner = &self.inner;
        if inner.lock().closed {
            return Ok(NextBatch::closed());
        }
        let batch = inner.queue.next(max_bytes);
        let requests = {
            let mut st = inner.lock();
            inner.pick_sources(&mut st)
        };
        inner.issue(requests);
        batch
    }

    /// Queue metrics merged with the metrics of every source.
    pub fn stats(&self) -> ExchangeStats {
        let sources: Vec<Arc<dyn ExchangeSource>> = self
            .inner
            .lock()
            .sources
            .iter()
            .map(|e| Arc::clone(&e.source))
            .collect();
        let mut stats = self.inner.queue.stats();
        for source in sources {
            merge_stats(&mut stats, &source.stats());
        }
        stats
    }

    /// Queue the sources push received pages into.
    pub fn queue(&self) -> &Arc<ExchangeQueue> {
        &self.inner.queue
    }

    /// Pool charged for pages held by this client.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.inner.pool
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stop fetching, close every source and the queue. Waiting consumers
    /// wake up and see the exchange at end. Safe to call more than once.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        let (sources, tasks) = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let sources: Vec<Arc<dyn ExchangeSource>> =
                st.sources.iter().map(|e| Arc::clone(&e.source)).collect();
            (sources, std::mem::take(&mut st.tasks))
        };
        for task in &tasks {
            task.abort();
        }
        for source in &sources {
            source.close();
        }
        self.queue.close();
        info!(
            consumer = %self.task_id,
            sources = sources.len(),
            "exchange client closed"
        );
    }

    /// Decide which idle sources may fetch now and mark them requesting.
    fn pick_sources(&self, st: &mut ClientState) -> Vec<Request> {
        let mut requests = Vec::new();
        if st.closed || st.sources.is_empty() {
            return requests;
        }

        let queued = self.queue.total_bytes();
        let max_queued = self.config.max_queued_bytes;
        let num_sources = st.sources.len();
        let start = st.cursor % num_sources;

        for offset in 0..num_sources {
            let index = (start + offset) % num_sources;
            let entry = &st.sources[index];
            if entry.state != SourceState::Idle {
                continue;
            }

            let max_bytes = if entry.remaining_bytes.is_empty() {
                0
            } else {
                if st.in_flight >= self.config.max_concurrent_requests {
                    continue;
                }
                let budget = max_queued.saturating_sub(queued + st.pending_bytes);
                let mut bytes = 0u64;
                for size in &entry.remaining_bytes {
                    if bytes + size > budget {
                        break;
                    }
                    bytes += size;
                }
                if bytes == 0 {
                    if queued > 0 || st.pending_bytes > 0 {
                        continue;
                    }
                    // Nothing buffered anywhere: let one oversized page through.
                    bytes = entry.remaining_bytes[0].max(1);
                }
                bytes
            };

            let entry = &mut st.sources[index];
            entry.state = SourceState::Requesting;
            requests.push(Request {
                index,
                source: Arc::clone(&entry.source),
                max_bytes,
            });
            if max_bytes > 0 {
                st.pending_bytes += max_bytes;
                st.in_flight += 1;
            }
            st.cursor = index + 1;
        }

        if !requests.is_empty() {
            trace!(
                consumer = %self.task_id,
                requests = requests.len(),
                queued,
                pending_bytes = st.pending_bytes,
                in_flight = st.in_flight,
                "flow control admitted requests"
            );
        }
        requests
    }

    fn issue(self: &Arc<Self>, requests: Vec<Request>) {
        if requests.is_empty() {
            return;
        }
        let max_wait = self.config.request_data_sizes_max_wait();
        let tasks: Vec<AbortHandle> = requests
            .into_iter()
            .map(|request| {
                let inner = Arc::clone(self);
                self.runtime
                    .spawn(async move {
                        let result = request.source.request(request.max_bytes, max_wait).await;
                        inner.on_response(request.index, request.max_bytes, result);
                    })
                    .abort_handle()
            })
            .collect();

        let mut st = self.lock();
        if st.closed {
            // Close ran between picking and spawning.
            drop(st);
            for task in &tasks {
                task.abort();
            }
            return;
        }
        st.tasks.retain(|task| !task.is_finished());
        st.tasks.extend(tasks);
    }

    fn on_response(self: &Arc<Self>, index: usize, requested: u64, result: Result<SourceResponse>) {
        let requests = {
            let mut st = self.lock();
            if requested > 0 {
                st.pending_bytes = st.pending_bytes.saturating_sub(requested);
                st.in_flight = st.in_flight.saturating_sub(1);
            }

            let entry = &mut st.sources[index];
            match result {
                Ok(response) => {
                    entry.remaining_bytes = response.remaining_bytes;
                    entry.state = if response.at_end {
                        SourceState::AtEnd
                    } else {
                        SourceState::Idle
                    };
                }
                Err(err) => {
                    entry.state = SourceState::Failed;
                    let task_id = entry.source.task_id().to_string();
                    warn!(
                        consumer = %self.task_id,
                        task_id = %task_id,
                        error = %err,
                        "exchange source failed"
                    );
                    let message = match err {
                        ExchangeError::SourceFailed { message, .. } => message,
                        other => other.to_string(),
                    };
                    self.queue.set_error(&task_id, message);
                }
            }
            self.pick_sources(&mut st)
        };
        self.issue(requests);
    }
}
