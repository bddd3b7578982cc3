//! Lottie Orchestra - lifecycle and resource orchestration for many
//! concurrent animation players
//!
//! Re-exports all modules for use by the binary target.

// Core services (cache, pool, scheduling, memory, workers)
pub mod core;

// Shared domain types and host boundary
pub mod entities;

// App modules
pub mod cli;
pub mod config;
pub mod headless;

// Re-export commonly used types from core
pub use core::cache_man::CacheManager;
pub use core::instance::{PlaybackInstance, SharedInstance};
pub use core::manager::{AnimationManager, GlobalStats, ManagerServices};
pub use core::memory_manager::{MemoryManager, MemoryStatus};
pub use core::workers::WorkerManager;

// Re-export entities
pub use entities::{AnimationPayload, InstanceConfig, InstanceEvent, InstanceState, LoadStrategy};
