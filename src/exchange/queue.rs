//! Consumer-side queue of pages received from every source of one client.

use crate::continuation::{ContinueFuture, ContinuePromise};
use crate::error::{ExchangeError, Result};
use crate::exchange::stats::{ExchangeStats, RuntimeMetric};
use crate::page::Page;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Result of one [`ExchangeQueue::next`] call.
#[derive(Debug, Default)]
pub struct NextBatch {
    pub pages: Vec<Page>,

    /// Every source has ended and nothing is left to read
    pub at_end: bool,

    /// Resolves when it is worth calling `next` again. Empty when pages were
    /// returned or the queue is at end.
    pub future: ContinueFuture,
}

impl NextBatch {
    /// What `next` returns once the exchange is closed.
    pub fn closed() -> Self {
        Self {
            pages: Vec::new(),
            at_end: true,
            future: ContinueFuture::empty(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pages: VecDeque<Page>,

    /// Bytes of pages currently queued
    total_bytes: u64,
    peak_bytes: u64,

    received_pages: u64,
    received_bytes: u64,

    num_sources: usize,
    no_more_sources: bool,
    completed_sources: usize,

    /// First terminal failure reported by a source: (task id, message)
    error: Option<(String, String)>,

    /// Consumers waiting for data, oldest first
    promises: VecDeque<ContinuePromise>,

    closed: bool,
}

impl QueueState {
    fn all_sources_done(&self) -> bool {
        self.no_more_sources && self.completed_sources >= self.num_sources
    }

    fn at_end(&self) -> bool {
        self.closed || (self.all_sources_done() && self.pages.is_empty())
    }
}

/// Pages received from all sources of one exchange client.
///
/// All state sits behind one mutex. A `None` enqueue is the end-of-stream
/// marker of one source; the queue reaches its end once every registered
/// source has sent one, [`no_more_sources`](Self::no_more_sources) was
/// called and the last page was read.
#[derive(Debug, Default)]
pub struct ExchangeQueue {
    state: Mutex<QueueState>,
}

impl ExchangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_source(&self) {
        self.lock().num_sources += 1;
    }

    pub fn no_more_sources(&self) {
        let promises = {
            let mut st = self.lock();
            st.no_more_sources = true;
            if st.at_end() {
                std::mem::take(&mut st.promises)
            } else {
                VecDeque::new()
            }
        };
        resolve(promises);
    }

    /// Append a page, or the end marker of one source when `page` is `None`.
    /// Pages enqueued after close are dropped.
    pub fn enqueue(&self, page: Option<Page>) {
        let promises = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            match page {
                Some(page) => {
                    let size = page.size();
                    st.received_pages += 1;
                    st.received_bytes += size;
                    st.total_bytes += size;
                    st.peak_bytes = st.peak_bytes.max(st.total_bytes);
                    st.pages.push_back(page);
                    st.promises.pop_front().into_iter().collect()
                }
                None => {
                    st.completed_sources += 1;
                    if st.at_end() {
                        std::mem::take(&mut st.promises)
                    } else {
                        VecDeque::new()
                    }
                }
            }
        };
        resolve(promises);
    }

    /// Record a terminal source failure. Waiting consumers wake up and see
    /// the error on their next call.
    pub fn set_error(&self, task_id: &str, message: impl Into<String>) {
        let promises = {
            let mut st = self.lock();
            if st.error.is_none() {
                st.error = Some((task_id.to_string(), message.into()));
            }
            std::mem::take(&mut st.promises)
        };
        resolve(promises);
    }

    /// Take pages totalling at most `max_bytes`. At least one page is
    /// returned whenever any is queued; a page is never split.
    pub fn next(&self, max_bytes: u64) -> Result<NextBatch> {
        let mut st = self.lock();
        if st.closed {
            return Ok(NextBatch::closed());
        }
        if let Some((task_id, message)) = &st.error {
            return Err(ExchangeError::source_failed(task_id, message.clone()));
        }

        let mut pages = Vec::new();
        let mut bytes = 0u64;
        while let Some(front) = st.pages.front() {
            if !pages.is_empty() && bytes + front.size() > max_bytes {
                break;
            }
            bytes += front.size();
            if let Some(page) = st.pages.pop_front() {
                pages.push(page);
            }
        }
        st.total_bytes -= bytes;

        let at_end = st.at_end();
        if !pages.is_empty() || at_end {
            return Ok(NextBatch {
                pages,
                at_end,
                future: ContinueFuture::empty(),
            });
        }

        let (promise, future) = ContinuePromise::new();
        st.promises.push_back(promise);
        Ok(NextBatch {
            pages,
            at_end: false,
            future,
        })
    }

    /// Drop queued pages and resolve every waiting consumer. The queue
    /// reports at end from now on.
    pub fn close(&self) {
        let (pages, promises) = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.total_bytes = 0;
            (std::mem::take(&mut st.pages), std::mem::take(&mut st.promises))
        };
        debug!(
            dropped_pages = pages.len(),
            woken = promises.len(),
            "exchange queue closed"
        );
        drop(pages);
        resolve(promises);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn at_end(&self) -> bool {
        self.lock().at_end()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn num_pages(&self) -> usize {
        self.lock().pages.len()
    }

    pub fn peak_bytes(&self) -> u64 {
        self.lock().peak_bytes
    }

    pub fn received_pages(&self) -> u64 {
        self.lock().received_pages
    }

    /// `peakBytes`, `numReceivedPages` and `averageReceivedPageBytes`. The
    /// average rounds down.
    pub fn stats(&self) -> ExchangeStats {
        let st = self.lock();
        let mut stats = ExchangeStats::new();
        stats.insert("peakBytes".into(), RuntimeMetric::new(st.peak_bytes));
        stats.insert(
            "numReceivedPages".into(),
            RuntimeMetric::new(st.received_pages),
        );
        let average = st.received_bytes.checked_div(st.received_pages).unwrap_or(0);
        stats.insert(
            "averageReceivedPageBytes".into(),
            RuntimeMetric::new(average),
        );
        stats
    }
}

fn resolve(promises: VecDeque<ContinuePromise>) {
    for promise in promises {
        promise.set_value();
    }
}
