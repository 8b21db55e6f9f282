//! Consumer side of the exchange: queue, fetch sources and the client.

pub mod client;
pub mod local;
pub mod queue;
pub mod source;
pub mod stats;

pub use client::ExchangeClient;
pub use local::{LocalExchangeSource, LOCAL_SCHEME};
pub use queue::{ExchangeQueue, NextBatch};
pub use source::{
    clear_factories, create_source, register_default_factory, register_factory, scheme_of,
    ExchangeSource, RetryPolicy, SourceContext, SourceFactory, SourceResponse,
};
pub use stats::{merge_stats, ExchangeStats, RuntimeMetric};
