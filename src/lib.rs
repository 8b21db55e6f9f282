//! Pull-based page exchange for distributed vectorized query execution.
//!
//! A consuming stage pulls serialized pages from many producer tasks under
//! one shared memory ceiling.
//!
//! # Architecture
//!
//! ```text
//! producer task                         consumer task
//! +---------------------+   fetch    +----------------+   next()   +-----------+
//! | OutputBufferManager | <--------- | ExchangeSource | ---------> | Exchange  |
//! |  (per task buffer)  |    ack     |  (per producer)|   pages    |  Queue    |
//! +---------------------+ <--------- +----------------+            +-----------+
//!            ^                                ^                          |
//!            | blocked producers              | flow control             |
//!            +--- ContinueFuture              +------ ExchangeClient ----+
//! ```
//!
//! - [`buffer`]: producer side. Pages wait per destination until the
//!   consumer acknowledges them; producers block when the buffer is full.
//! - [`exchange`]: consumer side. Sources fetch into a shared queue; the
//!   client decides which sources may fetch so buffered bytes stay near
//!   `max_queued_bytes`.
//! - [`continuation`]: one-shot suspend/resume handles used on both sides.
//!
//! Fetch sources are picked by the scheme of the remote task id through a
//! process-wide registry. `local://` serves producers in the same process:
//!
//! ```no_run
//! use shuffle_exchange::{ExchangeClient, ExchangeConfig, LocalExchangeSource};
//! use shuffle_exchange::{MemoryPool, OutputBufferConfig, OutputBufferManager};
//!
//! # async fn run() -> shuffle_exchange::Result<()> {
//! let manager = OutputBufferManager::new(OutputBufferConfig::default());
//! LocalExchangeSource::register(manager.clone());
//!
//! let client = ExchangeClient::new(
//!     "consumer",
//!     0,
//!     ExchangeConfig::default(),
//!     MemoryPool::new_root("exchange"),
//! )?;
//! client.add_remote_task_id("local://producer-0")?;
//! client.no_more_remote_tasks();
//! let batch = client.next(1 << 20)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod continuation;
pub mod error;
pub mod exchange;
pub mod memory;
pub mod page;

pub use buffer::{BufferData, EnqueueStatus, OutputBufferManager, OutputBufferStats, OutputKind};
pub use codec::{BincodeCodec, PageCodec};
pub use config::{ExchangeConfig, OutputBufferConfig, RetryConfig};
pub use continuation::{ContinueFuture, ContinuePromise};
pub use error::{ExchangeError, Result, MAX_TASK_ID_DISPLAY_LEN};
pub use exchange::{
    ExchangeClient, ExchangeQueue, ExchangeSource, ExchangeStats, LocalExchangeSource, NextBatch,
    RuntimeMetric, SourceResponse,
};
pub use memory::{MemoryPool, Reservation};
pub use page::Page;
