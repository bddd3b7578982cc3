//! Core orchestration services - cache, pool, scheduling, memory, workers
//!
//! These modules are host-agnostic; the host is reached only through the
//! traits in `entities::host` and `entities::engine`.

pub mod batch_renderer;
pub mod bindings;
pub mod cache_man;
pub mod event_bus;
pub mod instance;
pub mod instance_pool;
pub mod loader;
pub mod manager;
pub mod memory_manager;
pub mod perf_monitor;
pub mod rate_limit;
pub mod workers;

// Re-exports for convenience
pub use batch_renderer::{BatchRenderer, BatchStats, FrameReport};
pub use bindings::ElementBindings;
pub use cache_man::{CacheManager, CacheSnapshot, CacheStats};
pub use event_bus::{EventBus, SubscriptionId};
pub use instance::{InstanceContext, PlaybackInstance, SharedInstance};
pub use instance_pool::{InstancePool, PoolStats};
pub use loader::{FsFetcher, LoadError, PayloadFetcher, PayloadLoader};
pub use manager::{AnimationManager, GlobalStats, ManagerServices, TickReport};
pub use memory_manager::{MemoryManager, MemoryManagerStats, MemoryStats, MemoryStatus, PressureAction, PressureEvent, PressureTarget};
pub use perf_monitor::{MetricsDelivery, MetricsDisposer, PerformanceMonitor};
pub use rate_limit::RateLimiter;
pub use workers::{PayloadTransforms, TaskError, TaskHandle, TaskKind, TaskOptions, TaskProcessor, WorkerManager, WorkerStats};
