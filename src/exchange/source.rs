//! Fetch source abstraction and the process-wide factory registry.
//!
//! A source pulls pages from one remote producer task into the
//! [`ExchangeQueue`] of its client. The transport is chosen by the scheme
//! prefix of the remote task id (`local://producer-7`), so the client never
//! knows how pages travel.

use crate::config::RetryConfig;
use crate::error::{ExchangeError, Result};
use crate::exchange::queue::ExchangeQueue;
use crate::exchange::stats::ExchangeStats;
use crate::memory::MemoryPool;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::debug;

/// Outcome of one [`ExchangeSource::request`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceResponse {
    /// Bytes of pages pushed into the queue by this request
    pub bytes: u64,

    /// The producer is done and the end marker was pushed
    pub at_end: bool,

    /// Sizes of pages the producer still holds, in order. Empty when unknown.
    pub remaining_bytes: Vec<u64>,
}

/// Puller for one remote producer task.
///
/// The client keeps at most one request in flight per source.
#[async_trait]
pub trait ExchangeSource: Send + Sync {
    /// Remote task id this source reads from, scheme included.
    fn task_id(&self) -> &str;

    /// Fetch pages totalling about `max_bytes` and push them into the queue.
    ///
    /// `max_bytes == 0` asks only for the sizes of buffered pages, waiting up
    /// to `max_wait` for the producer to have any. Running out of `max_wait`
    /// is not an error: the response is empty and the caller asks again.
    /// An `Err` is terminal for the source.
    async fn request(&self, max_bytes: u64, max_wait: Duration) -> Result<SourceResponse>;

    /// Tell the producer everything pushed so far has been received.
    async fn acknowledge(&self) -> Result<()>;

    /// Stop fetching and let the producer drop what it holds for us.
    fn close(&self);

    fn stats(&self) -> ExchangeStats;
}

/// Everything a factory needs to build a source.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub task_id: String,

    /// Destination of the remote task this consumer reads
    pub destination: u32,

    pub queue: Weak<ExchangeQueue>,

    /// Pool received pages are charged to
    pub pool: Arc<MemoryPool>,

    pub retry: RetryConfig,
}

pub type SourceFactory =
    Arc<dyn Fn(&SourceContext) -> Result<Arc<dyn ExchangeSource>> + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Registry {
    by_scheme: HashMap<String, SourceFactory>,
    fallback: Option<SourceFactory>,
}

static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

fn read_registry() -> RwLockReadGuard<'static, Registry> {
    registry().read().unwrap_or_else(|e| e.into_inner())
}

fn write_registry() -> RwLockWriteGuard<'static, Registry> {
    registry().write().unwrap_or_else(|e| e.into_inner())
}

/// Scheme of a remote task id: the part before `://`, if any.
pub fn scheme_of(task_id: &str) -> Option<&str> {
    task_id.split_once("://").map(|(scheme, _)| scheme)
}

/// Route task ids with `scheme://` prefix to `factory`, replacing any
/// factory registered for the same scheme.
pub fn register_factory(scheme: impl Into<String>, factory: SourceFactory) {
    let scheme = scheme.into();
    debug!(scheme = %scheme, "exchange source factory registered");
    write_registry().by_scheme.insert(scheme, factory);
}

/// Factory used when no scheme-specific one matches.
pub fn register_default_factory(factory: SourceFactory) {
    write_registry().fallback = Some(factory);
}

/// Forget every registered factory. Meant for use between tests.
pub fn clear_factories() {
    let mut registry = write_registry();
    registry.by_scheme.clear();
    registry.fallback = None;
}

/// Build a source for `ctx.task_id` with the matching factory. Any failure
/// comes back as [`ExchangeError::SourceCreation`] naming the task.
pub fn create_source(ctx: &SourceContext) -> Result<Arc<dyn ExchangeSource>> {
    let factory = {
        let registry = read_registry();
        scheme_of(&ctx.task_id)
            .and_then(|scheme| registry.by_scheme.get(scheme))
            .or(registry.fallback.as_ref())
            .cloned()
    };
    let Some(factory) = factory else {
        return Err(ExchangeError::source_creation(
            &ctx.task_id,
            "no exchange source factory registered",
        ));
    };

    match factory(ctx) {
        Ok(source) => {
            debug!(task_id = %ctx.task_id, "exchange source created");
            Ok(source)
        }
        Err(err @ ExchangeError::SourceCreation { .. }) => Err(err),
        Err(err) => Err(ExchangeError::source_creation(&ctx.task_id, err.to_string())),
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff for transient fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether a request that already failed `attempt + 1` times with
    /// `err` should be tried again.
    pub fn should_retry(&self, attempt: u32, err: &ExchangeError) -> bool {
        err.is_transient() && attempt < self.config.max_retries
    }

    /// Delay before retry number `attempt` (0-based): the initial backoff,
    /// doubled per attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct NullSource(String);

    #[async_trait]
    impl ExchangeSource for NullSource {
        fn task_id(&self) -> &str {
            &self.0
        }

        async fn request(&self, _max_bytes: u64, _max_wait: Duration) -> Result<SourceResponse> {
            Ok(SourceResponse::default())
        }

        async fn acknowledge(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}

        fn stats(&self) -> ExchangeStats {
            ExchangeStats::new()
        }
    }

    fn ctx(task_id: &str) -> SourceContext {
        SourceContext {
            task_id: task_id.to_string(),
            destination: 0,
            queue: Weak::new(),
            pool: MemoryPool::new_root("test"),
            retry: RetryConfig::default(),
        }
    }

    fn null_factory() -> SourceFactory {
        Arc::new(|ctx: &SourceContext| -> Result<Arc<dyn ExchangeSource>> {
            Ok(Arc::new(NullSource(ctx.task_id.clone())))
        })
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("local://t1"), Some("local"));
        assert_eq!(scheme_of("http://host:8080/v1/task/t1"), Some("http"));
        assert_eq!(scheme_of("task.1.2.3"), None);
    }

    #[test]
    #[serial]
    fn test_scheme_dispatch_and_fallback() {
        clear_factories();
        assert!(create_source(&ctx("local://a")).is_err());

        register_factory("local", null_factory());
        assert_eq!(create_source(&ctx("local://a")).unwrap().task_id(), "local://a");
        assert!(create_source(&ctx("other://a")).is_err());

        register_default_factory(null_factory());
        assert!(create_source(&ctx("other://a")).is_ok());
        assert!(create_source(&ctx("plain")).is_ok());

        clear_factories();
    }

    #[test]
    #[serial]
    fn test_factory_error_names_task() {
        clear_factories();
        register_default_factory(Arc::new(
            |_: &SourceContext| -> Result<Arc<dyn ExchangeSource>> {
                Err(ExchangeError::Transient("connection refused".into()))
            },
        ));

        let err = create_source(&ctx("task.1.2.3")).err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("task.1.2.3"), "{msg}");
        assert!(msg.contains("connection refused"), "{msg}");

        clear_factories();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 35,
        });
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(35));
        assert_eq!(policy.backoff(80), Duration::from_millis(35));

        let transient = ExchangeError::Transient("x".into());
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(0, &ExchangeError::TaskAborted("t".into())));
    }
}
