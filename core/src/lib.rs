pub mod broker;
pub mod claim;
pub mod collector;
pub mod config;
pub mod context;
pub mod errors;
pub mod group;
pub mod handler;
pub mod interceptor;
pub mod message;
pub mod telemetry;
pub mod topics;
pub mod tracer;
pub mod watcher;

pub use broker::{BrokerClient, CommitMode, Generation, KafkaBroker, MemoryBroker, PartitionClaim, TopicLister};
pub use config::{ConsumerConfig, ConsumerOptions, InitialOffset, RebalanceStrategy, load_config};
pub use context::ConsumeContext;
pub use errors::{BrokerError, ConfigError, ConsumerError, HandlerError, Result};
pub use group::{ConsumerGroup, GroupState};
pub use handler::{MessageHandler, handler_fn};
pub use interceptor::{Interceptor, InterceptorChain};
pub use message::{Batch, Header, Message};
pub use topics::{TopicChange, TopicSet, TopicUpdater};
pub use tracer::{LogTracer, NoopTracer, Tracer};
pub use watcher::{ConsumerDynamic, ConsumerWatcher};

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
