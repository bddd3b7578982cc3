//! Rendering engine boundary.
//!
//! The orchestration core never decodes or paints payloads itself. It drives an
//! engine through these traits, the same way `entities::traits` lets nodes use a
//! cache or worker pool without knowing the implementation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::host::Container;
use super::payload::AnimationPayload;

/// Renderer backend requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    #[default]
    Svg,
    Canvas,
    Html,
}

impl RendererKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RendererKind::Svg => "svg",
            RendererKind::Canvas => "canvas",
            RendererKind::Html => "html",
        }
    }
}

/// Render quality. Degradation only ever moves down this ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    /// Next lower level, None when already at the bottom
    pub fn step_down(self) -> Option<Quality> {
        match self {
            Quality::High => Some(Quality::Medium),
            Quality::Medium => Some(Quality::Low),
            Quality::Low => None,
        }
    }
}

/// Options passed to `AnimationEngine::load`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererOptions {
    pub renderer: RendererKind,
    pub quality: Quality,
    pub loop_playback: bool,
    /// Engine-side autoplay. The core always passes false and calls play() itself.
    pub autoplay: bool,
}

/// Events emitted by an engine handle
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Ready,
    Complete,
    LoopComplete,
    EnterFrame { frame: f64 },
    Destroy,
}

/// Engine failure (load or a single render/update call)
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Load(String),
    Render(String),
    Destroyed,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Load(e) => write!(f, "Engine load error: {}", e),
            EngineError::Render(e) => write!(f, "Engine render error: {}", e),
            EngineError::Destroyed => write!(f, "Engine handle already destroyed"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Engine-native animation handle.
///
/// `advance()` moves the engine's internal time; `render()` is the actual
/// paint. Degraded instances call `advance()` every frame but `render()` only
/// every Nth frame.
pub trait AnimationHandle: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn destroy(&mut self) -> Result<(), EngineError>;

    fn set_speed(&mut self, speed: f64);
    fn set_direction(&mut self, direction: i8);
    fn go_to_and_stop(&mut self, frame: f64);
    fn go_to_and_play(&mut self, frame: f64);
    fn play_segments(&mut self, segments: &[(f64, f64)], force: bool);
    fn resize(&mut self);
    fn set_quality(&mut self, quality: Quality);

    fn current_frame(&self) -> f64;
    fn total_frames(&self) -> f64;
    fn is_paused(&self) -> bool;

    /// Advance internal time by `elapsed_ms` of wall-clock
    fn advance(&mut self, elapsed_ms: f64);

    /// Paint the current frame
    fn render(&mut self) -> Result<(), EngineError>;

    /// Events produced since the last call
    fn drain_events(&mut self) -> Vec<EngineEvent>;
}

/// Factory for animation handles.
pub trait AnimationEngine: Send + Sync {
    fn load(
        &self,
        container: &Container,
        payload: Arc<AnimationPayload>,
        options: &RendererOptions,
    ) -> Result<Box<dyn AnimationHandle>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_only_steps_down() {
        assert_eq!(Quality::High.step_down(), Some(Quality::Medium));
        assert_eq!(Quality::Medium.step_down(), Some(Quality::Low));
        assert_eq!(Quality::Low.step_down(), None);
        assert!(Quality::High > Quality::Low);
    }

    #[test]
    fn test_renderer_serde_names() {
        let json = serde_json::to_string(&RendererKind::Canvas).unwrap();
        assert_eq!(json, "\"canvas\"");
        let kind: RendererKind = serde_json::from_str("\"html\"").unwrap();
        assert_eq!(kind, RendererKind::Html);
    }
}
