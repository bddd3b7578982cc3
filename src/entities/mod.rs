//! Entities module - domain types shared by all orchestration services
//!
//! - `host`: clock, viewport, containers, memory probe (host abstraction)
//! - `engine`: rendering engine boundary traits
//! - `payload`: animation payload contract
//! - `config`: per-instance configuration snapshot
//! - `events`: instance state and event stream payloads

pub mod config;
pub mod engine;
pub mod events;
pub mod host;
pub mod payload;

pub use config::{InstanceConfig, LoadStrategy, PerformanceConfig};
pub use engine::{
    AnimationEngine, AnimationHandle, EngineError, EngineEvent, Quality, RendererKind, RendererOptions,
};
pub use events::{InstanceEvent, InstanceEventKind, InstanceState, PerformanceMetrics, WarningReason};
pub use host::{
    Clock, ClockDeadline, Container, FixedMemoryProbe, IdleDeadline, ManualClock, MemoryProbe, Rect,
    SharedViewport, SystemClock, SystemMemoryProbe, Viewport,
};
pub use payload::{AnimationPayload, PayloadError, PayloadSource};
