//! Producer-side page buffers.
//!
//! A producer task enqueues pages per destination; consumers pull them with
//! a sequence number and acknowledge what they have safely received.
//! Producers block once a task's buffered bytes reach its ceiling and are
//! released as acknowledgements free space.
//!
//! ```text
//! producer --enqueue--> OutputBuffer[task] --get_data/fetch--> fetch source
//!     ^                        |                                   |
//!     +---- ContinueFuture ----+<----------- acknowledge ----------+
//! ```

pub mod destination;
pub mod manager;
pub mod output;

pub use destination::BufferData;
pub use manager::OutputBufferManager;
pub use output::{EnqueueStatus, OutputBufferStats, OutputKind};
