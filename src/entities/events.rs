//! Instance state and the per-instance event stream payloads.

use serde::{Deserialize, Serialize};

/// Playback instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Not loaded yet, or destroyed (terminal)
    #[default]
    Idle,
    Loading,
    Loaded,
    Playing,
    Paused,
    Stopped,
    Error,
}

impl InstanceState {
    /// An engine handle exists in this state
    pub fn has_handle(&self) -> bool {
        matches!(
            self,
            InstanceState::Loaded | InstanceState::Playing | InstanceState::Paused | InstanceState::Stopped
        )
    }
}

/// Latest performance sample for one instance
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Time from load() start to engine handle ready
    pub load_time_ms: f64,
    pub fps: f64,
    pub memory_mb: f64,
    pub duration_ms: f64,
    pub total_frames: f64,
}

/// Why a performance warning fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningReason {
    LowFps,
    HighMemory,
}

/// Event delivered to instance subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    StateChange { from: InstanceState, to: InstanceState },
    DataReady,
    DataFailed { reason: String },
    Complete,
    LoopComplete,
    EnterFrame { frame: f64 },
    PerformanceWarning { metrics: PerformanceMetrics, reason: WarningReason },
    Destroyed,
}

/// Subscription key for `InstanceEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceEventKind {
    StateChange,
    #[serde(rename = "data_ready")]
    DataReady,
    #[serde(rename = "data_failed")]
    DataFailed,
    Complete,
    LoopComplete,
    EnterFrame,
    PerformanceWarning,
    #[serde(rename = "destroy")]
    Destroyed,
}

impl InstanceEvent {
    pub fn kind(&self) -> InstanceEventKind {
        match self {
            InstanceEvent::StateChange { .. } => InstanceEventKind::StateChange,
            InstanceEvent::DataReady => InstanceEventKind::DataReady,
            InstanceEvent::DataFailed { .. } => InstanceEventKind::DataFailed,
            InstanceEvent::Complete => InstanceEventKind::Complete,
            InstanceEvent::LoopComplete => InstanceEventKind::LoopComplete,
            InstanceEvent::EnterFrame { .. } => InstanceEventKind::EnterFrame,
            InstanceEvent::PerformanceWarning { .. } => InstanceEventKind::PerformanceWarning,
            InstanceEvent::Destroyed => InstanceEventKind::Destroyed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let ev = InstanceEvent::StateChange { from: InstanceState::Idle, to: InstanceState::Loading };
        assert_eq!(ev.kind(), InstanceEventKind::StateChange);
        assert_eq!(InstanceEvent::EnterFrame { frame: 3.0 }.kind(), InstanceEventKind::EnterFrame);
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&InstanceEventKind::LoopComplete).unwrap();
        assert_eq!(json, "\"loopComplete\"");
        let json = serde_json::to_string(&InstanceEventKind::DataReady).unwrap();
        assert_eq!(json, "\"data_ready\"");
    }

    #[test]
    fn test_states_with_handle() {
        assert!(!InstanceState::Idle.has_handle());
        assert!(!InstanceState::Error.has_handle());
        assert!(InstanceState::Paused.has_handle());
    }
}
