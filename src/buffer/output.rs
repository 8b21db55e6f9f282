//! Output buffer of one producer task.

use crate::buffer::destination::{BufferData, BufferedPage, DestinationBuffer};
use crate::config::OutputBufferConfig;
use crate::continuation::{ContinueFuture, ContinuePromise};
use crate::error::{ExchangeError, Result};
use crate::memory::MemoryPool;
use crate::page::Page;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// How a task's output is spread over its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Each page goes to the destination it was enqueued for
    Partitioned,
    /// Every destination receives every page
    Broadcast,
    /// Pages go to whichever destination asks first
    Arbitrary,
}

/// Outcome of enqueueing a page.
#[derive(Debug)]
pub enum EnqueueStatus {
    /// Buffer has room; keep producing
    Ready,
    /// Buffer is at its ceiling; wait on the future before producing more
    Blocked(ContinueFuture),
}

impl EnqueueStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    /// The future to wait on. Empty (already satisfied) when not blocked.
    pub fn into_future(self) -> ContinueFuture {
        match self {
            Self::Ready => ContinueFuture::empty(),
            Self::Blocked(future) => future,
        }
    }
}

/// Point-in-time view of an output buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputBufferStats {
    pub kind: OutputKind,
    pub num_destinations: u32,
    pub buffered_bytes: u64,
    pub buffered_pages: u64,
    pub pages_enqueued: u64,
    pub bytes_enqueued: u64,
    pub blocked_producers: usize,
    pub no_more_data: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    destinations: Vec<DestinationBuffer>,

    /// Pages not yet claimed by any destination (arbitrary output only)
    arbitrary: VecDeque<Arc<BufferedPage>>,

    /// Bytes of distinct pages still held; broadcast pages count once
    buffered_bytes: u64,
    buffered_pages: u64,

    pages_enqueued: u64,
    bytes_enqueued: u64,

    no_more_data: bool,
    aborted: bool,

    /// Producers waiting for room, oldest first
    blocked: VecDeque<ContinuePromise>,

    /// Fetches that fail with a transient error before any real work
    fail_next_fetches: u32,
}

pub(crate) struct OutputBuffer {
    task_id: String,
    kind: OutputKind,
    config: OutputBufferConfig,
    pool: Arc<MemoryPool>,
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    pub(crate) fn new(
        task_id: String,
        kind: OutputKind,
        num_destinations: u32,
        config: OutputBufferConfig,
        pool: Arc<MemoryPool>,
    ) -> Self {
        let destinations = (0..num_destinations)
            .map(|_| DestinationBuffer::default())
            .collect();
        Self {
            task_id,
            kind,
            config,
            pool,
            state: Mutex::new(BufferState {
                destinations,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_destination(&self, st: &BufferState, destination: u32) -> Result<()> {
        if destination as usize >= st.destinations.len() {
            return Err(ExchangeError::InvalidDestination {
                task_id: self.task_id.clone(),
                destination,
                num_destinations: st.destinations.len() as u32,
            });
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, destination: u32, mut page: Page) -> Result<EnqueueStatus> {
        let size = page.size();
        page.transfer_to(&self.pool)?;

        let mut st = self.lock();
        if st.aborted {
            return Err(ExchangeError::TaskAborted(self.task_id.clone()));
        }
        if st.no_more_data {
            return Err(ExchangeError::NoMoreData(self.task_id.clone()));
        }
        self.check_destination(&st, destination)?;

        let entry = Arc::new(BufferedPage::new(page));
        match self.kind {
            OutputKind::Partitioned => st.destinations[destination as usize].push(Arc::clone(&entry)),
            OutputKind::Broadcast => {
                for dest in st.destinations.iter_mut() {
                    dest.push(Arc::clone(&entry));
                }
            }
            OutputKind::Arbitrary => st.arbitrary.push_back(Arc::clone(&entry)),
        }
        if Arc::strong_count(&entry) == 1 {
            // Every target destination already finished; nobody will read it.
            trace!(task_id = %self.task_id, destination, "dropping page for finished destination");
            return Ok(EnqueueStatus::Ready);
        }

        st.buffered_bytes += size;
        st.buffered_pages += 1;
        st.pages_enqueued += 1;
        st.bytes_enqueued += size;

        if st.buffered_bytes >= self.config.max_buffer_size {
            let (promise, future) = ContinuePromise::new();
            st.blocked.push_back(promise);
            debug!(
                task_id = %self.task_id,
                buffered_bytes = st.buffered_bytes,
                max_buffer_size = self.config.max_buffer_size,
                blocked = st.blocked.len(),
                "producer blocked on full output buffer"
            );
            return Ok(EnqueueStatus::Blocked(future));
        }
        Ok(EnqueueStatus::Ready)
    }

    /// Settle accounting for pages a destination let go of. Returns the
    /// producers to wake; the caller resolves them after unlocking.
    fn release(&self, st: &mut BufferState, removed: Vec<Arc<BufferedPage>>) -> Vec<ContinuePromise> {
        for page in removed {
            // Other holders all live under this lock, so the count is stable.
            if Arc::strong_count(&page) == 1 {
                st.buffered_bytes -= page.size();
                st.buffered_pages -= 1;
            }
        }
        if !st.blocked.is_empty() && st.buffered_bytes < self.config.continue_size() {
            debug!(
                task_id = %self.task_id,
                buffered_bytes = st.buffered_bytes,
                released = st.blocked.len(),
                "releasing blocked producers"
            );
            return st.blocked.drain(..).collect();
        }
        Vec::new()
    }

    pub(crate) fn get_data(&self, destination: u32, max_bytes: u64, sequence: u64) -> Result<BufferData> {
        let (data, promises) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.aborted {
                return Err(ExchangeError::TaskAborted(self.task_id.clone()));
            }
            if st.fail_next_fetches > 0 {
                st.fail_next_fetches -= 1;
                return Err(ExchangeError::Transient(format!(
                    "injected fetch failure for task {}",
                    self.task_id
                )));
            }
            self.check_destination(st, destination)?;

            let dest = &mut st.destinations[destination as usize];
            let removed = dest.acknowledge(sequence);

            if self.kind == OutputKind::Arbitrary
                && max_bytes > 0
                && !dest.is_finished()
                && dest.available_from(sequence) == 0
            {
                let mut bytes = 0u64;
                while let Some(front) = st.arbitrary.front() {
                    if bytes > 0 && bytes + front.size() > max_bytes {
                        break;
                    }
                    bytes += front.size().max(1);
                    if let Some(page) = st.arbitrary.pop_front() {
                        dest.push(page);
                    }
                }
            }

            let mut data = dest.get_data(max_bytes, sequence);
            data.at_end = dest.is_finished();
            if self.kind == OutputKind::Arbitrary {
                data.remaining_bytes
                    .extend(st.arbitrary.iter().map(|p| p.size()));
            }
            data.at_end |= st.no_more_data && data.remaining_bytes.is_empty();

            let promises = self.release(st, removed);
            (data, promises)
        };
        resolve(promises);
        Ok(data)
    }

    pub(crate) fn acknowledge(&self, destination: u32, sequence: u64) -> Result<()> {
        let promises = {
            let mut st = self.lock();
            self.check_destination(&st, destination)?;
            let removed = st.destinations[destination as usize].acknowledge(sequence);
            self.release(&mut st, removed)
        };
        resolve(promises);
        Ok(())
    }

    pub(crate) fn delete_results(&self, destination: u32) -> Result<()> {
        let promises = {
            let mut st = self.lock();
            self.check_destination(&st, destination)?;
            let removed = st.destinations[destination as usize].finish();
            self.release(&mut st, removed)
        };
        resolve(promises);
        Ok(())
    }

    pub(crate) fn no_more_data(&self) {
        let mut st = self.lock();
        st.no_more_data = true;
    }

    /// Drop every buffered page and wake every blocked producer.
    pub(crate) fn abort(&self) {
        let (pages, promises) = {
            let mut st = self.lock();
            st.aborted = true;
            let mut pages: Vec<Arc<BufferedPage>> = st.arbitrary.drain(..).collect();
            for dest in st.destinations.iter_mut() {
                pages.extend(dest.finish());
            }
            st.buffered_bytes = 0;
            st.buffered_pages = 0;
            let promises: Vec<ContinuePromise> = st.blocked.drain(..).collect();
            (pages, promises)
        };
        debug!(
            task_id = %self.task_id,
            pages = pages.len(),
            woken = promises.len(),
            "output buffer aborted"
        );
        drop(pages);
        resolve(promises);
    }

    pub(crate) fn utilization(&self) -> f64 {
        let st = self.lock();
        st.buffered_bytes as f64 / self.config.max_buffer_size as f64
    }

    pub(crate) fn fail_next_fetches(&self, count: u32) {
        self.lock().fail_next_fetches = count;
    }

    pub(crate) fn stats(&self) -> OutputBufferStats {
        let st = self.lock();
        OutputBufferStats {
            kind: self.kind,
            num_destinations: st.destinations.len() as u32,
            buffered_bytes: st.buffered_bytes,
            buffered_pages: st.buffered_pages,
            pages_enqueued: st.pages_enqueued,
            bytes_enqueued: st.bytes_enqueued,
            blocked_producers: st.blocked.len(),
            no_more_data: st.no_more_data,
        }
    }
}

fn resolve(promises: Vec<ContinuePromise>) {
    for promise in promises {
        promise.set_value();
    }
}
