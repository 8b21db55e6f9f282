//! Registry of producer output buffers, keyed by task id.

use crate::buffer::destination::BufferData;
use crate::buffer::output::{EnqueueStatus, OutputBuffer, OutputBufferStats, OutputKind};
use crate::config::OutputBufferConfig;
use crate::error::{ExchangeError, Result};
use crate::memory::MemoryPool;
use crate::page::Page;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Holds the output buffers of every producer task in this process.
///
/// Fetchers long-poll through [`OutputBufferManager::fetch`], which sleeps
/// until the buffer changes or the wait expires.
pub struct OutputBufferManager {
    config: OutputBufferConfig,
    pool: Arc<MemoryPool>,
    buffers: Mutex<HashMap<String, Arc<OutputBuffer>>>,

    /// Signaled on every change a fetcher might be waiting for
    data_ready: Notify,
}

impl OutputBufferManager {
    pub fn new(config: OutputBufferConfig) -> Arc<Self> {
        Self::with_pool(config, MemoryPool::new_root("output buffers"))
    }

    pub fn with_pool(config: OutputBufferConfig, pool: Arc<MemoryPool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            buffers: Mutex::new(HashMap::new()),
            data_ready: Notify::new(),
        })
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, Arc<OutputBuffer>>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self, task_id: &str) -> Option<Arc<OutputBuffer>> {
        self.buffers().get(task_id).cloned()
    }

    fn buffer_or_err(&self, task_id: &str) -> Result<Arc<OutputBuffer>> {
        self.buffer(task_id)
            .ok_or_else(|| ExchangeError::TaskNotFound(task_id.to_string()))
    }

    /// Register a task's output with the manager's default ceiling.
    pub fn initialize_task(
        &self,
        task_id: &str,
        kind: OutputKind,
        num_destinations: u32,
    ) -> Result<()> {
        self.initialize_task_with_config(task_id, kind, num_destinations, self.config.clone())
    }

    pub fn initialize_task_with_config(
        &self,
        task_id: &str,
        kind: OutputKind,
        num_destinations: u32,
        config: OutputBufferConfig,
    ) -> Result<()> {
        config.validate()?;
        {
            let mut buffers = self.buffers();
            if buffers.contains_key(task_id) {
                return Err(ExchangeError::TaskAlreadyExists(task_id.to_string()));
            }
            let pool = MemoryPool::new_child(format!("output buffer {task_id}"), &self.pool);
            buffers.insert(
                task_id.to_string(),
                Arc::new(OutputBuffer::new(
                    task_id.to_string(),
                    kind,
                    num_destinations,
                    config,
                    pool,
                )),
            );
        }
        debug!(task_id, ?kind, num_destinations, "output buffer initialized");
        self.data_ready.notify_waiters();
        Ok(())
    }

    /// Add a page for `destination`. A `Blocked` result carries the future
    /// the producer must wait on before enqueueing more.
    pub fn enqueue(&self, task_id: &str, destination: u32, page: Page) -> Result<EnqueueStatus> {
        let status = self.buffer_or_err(task_id)?.enqueue(destination, page)?;
        self.data_ready.notify_waiters();
        Ok(status)
    }

    /// Non-blocking read of pages starting at `sequence`. Pages before
    /// `sequence` are acknowledged implicitly.
    pub fn get_data(
        &self,
        task_id: &str,
        destination: u32,
        max_bytes: u64,
        sequence: u64,
    ) -> Result<BufferData> {
        self.buffer_or_err(task_id)?
            .get_data(destination, max_bytes, sequence)
    }

    /// Like [`get_data`](Self::get_data), but waits up to `max_wait` for
    /// something to report: pages, sizes of buffered pages, or end of data.
    /// Returns `None` when the wait expires. An unknown task is waited for,
    /// since its producer may not have registered yet; a task removed while
    /// this call holds it fails with [`ExchangeError::TaskAborted`].
    pub async fn fetch(
        &self,
        task_id: &str,
        destination: u32,
        max_bytes: u64,
        sequence: u64,
        max_wait: Duration,
    ) -> Result<Option<BufferData>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut buffer: Option<Arc<OutputBuffer>> = None;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if buffer.is_none() {
                buffer = self.buffer(task_id);
            }
            match buffer.as_ref() {
                Some(buffer) => {
                    let data = buffer.get_data(destination, max_bytes, sequence)?;
                    if !data.pages.is_empty() || !data.remaining_bytes.is_empty() || data.at_end {
                        return Ok(Some(data));
                    }
                }
                None => trace!(task_id, "waiting for output buffer to be created"),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Release pages of `destination` before `sequence`. Unknown tasks are
    /// ignored: acknowledgements can race with task removal.
    pub fn acknowledge(&self, task_id: &str, destination: u32, sequence: u64) -> Result<()> {
        match self.buffer(task_id) {
            Some(buffer) => buffer.acknowledge(destination, sequence),
            None => Ok(()),
        }
    }

    /// The consumer of `destination` is done; drop whatever it still holds.
    pub fn delete_results(&self, task_id: &str, destination: u32) -> Result<()> {
        let Some(buffer) = self.buffer(task_id) else {
            return Ok(());
        };
        buffer.delete_results(destination)?;
        // A fetch parked on this destination now sees it at end.
        self.data_ready.notify_waiters();
        Ok(())
    }

    /// The producer will enqueue nothing more.
    pub fn no_more_data(&self, task_id: &str) -> Result<()> {
        self.buffer_or_err(task_id)?.no_more_data();
        debug!(task_id, "output buffer has no more data");
        self.data_ready.notify_waiters();
        Ok(())
    }

    /// Forget a task, freeing its pages and waking its blocked producers.
    /// Returns whether the task was known.
    pub fn remove_task(&self, task_id: &str) -> bool {
        let removed = self.buffers().remove(task_id);
        match removed {
            Some(buffer) => {
                buffer.abort();
                self.data_ready.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Buffered bytes over the ceiling, in `[0, 1]` unless oversized pages
    /// pushed it above.
    pub fn utilization(&self, task_id: &str) -> Option<f64> {
        self.buffer(task_id).map(|b| b.utilization())
    }

    pub fn stats(&self, task_id: &str) -> Option<OutputBufferStats> {
        self.buffer(task_id).map(|b| b.stats())
    }

    pub fn num_tasks(&self) -> usize {
        self.buffers().len()
    }

    /// Make the next `count` reads of `task_id` fail with a transient error.
    pub fn testing_fail_next_fetches(&self, task_id: &str, count: u32) -> Result<()> {
        self.buffer_or_err(task_id)?.fail_next_fetches(count);
        Ok(())
    }
}
