//! Per-instance configuration snapshot.
//!
//! Built once by the caller and frozen inside the instance; only the active
//! renderer can change later (through a rate-limited switch).

use serde::{Deserialize, Serialize};

use super::engine::{Quality, RendererKind};
use super::host::Container;
use super::payload::PayloadSource;

/// When an instance fetches and parses its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Load as soon as the instance is created
    #[default]
    Eager,
    /// Wait for an explicit `load()` from the caller
    Lazy,
    /// Wait until the container enters the viewport, then load eagerly
    Intersection,
}

/// Performance sampling and degradation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Attach a PerformanceMonitor on load
    pub enabled: bool,
    pub min_fps: f64,
    pub max_memory_mb: f64,
    pub auto_degrade: bool,
    /// Frame rate the frame-skip ratio is computed against
    pub target_fps: f64,
    pub sample_interval_ms: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_fps: 30.0,
            max_memory_mb: 100.0,
            auto_degrade: true,
            target_fps: 60.0,
            sample_interval_ms: 1000.0,
        }
    }
}

/// Immutable configuration for one playback instance
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub container: Option<Container>,
    pub source: Option<PayloadSource>,
    pub renderer: RendererKind,
    pub loop_playback: bool,
    pub autoplay: bool,
    pub speed: f64,
    /// 1 forward, -1 backward
    pub direction: i8,
    pub load_strategy: LoadStrategy,
    pub quality: Quality,
    /// Render priority handed to the BatchRenderer (higher renders first)
    pub priority: i32,
    pub performance: PerformanceConfig,
    /// Renderer switches allowed per instance lifetime
    pub max_renderer_switches: u32,
    /// Refill one switch token every N ms (None = hard lifetime cap)
    pub renderer_switch_refill_ms: Option<f64>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: String::from("animation"),
            container: None,
            source: None,
            renderer: RendererKind::default(),
            loop_playback: true,
            autoplay: false,
            speed: 1.0,
            direction: 1,
            load_strategy: LoadStrategy::default(),
            quality: Quality::default(),
            priority: 0,
            performance: PerformanceConfig::default(),
            max_renderer_switches: 3,
            renderer_switch_refill_ms: None,
        }
    }
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_source(mut self, source: impl Into<PayloadSource>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.source = Some(PayloadSource::Path(path.into()));
        self
    }

    pub fn with_renderer(mut self, renderer: RendererKind) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn with_loop(mut self, loop_playback: bool) -> Self {
        self.loop_playback = loop_playback;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_direction(mut self, direction: i8) -> Self {
        self.direction = if direction < 0 { -1 } else { 1 };
        self
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.load_strategy = strategy;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_max_renderer_switches(mut self, max: u32) -> Self {
        self.max_renderer_switches = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::host::Rect;

    #[test]
    fn test_builder_defaults() {
        let config = InstanceConfig::new("hero")
            .with_container(Container::new("c", Rect::new(0.0, 0.0, 10.0, 10.0)))
            .with_path("anims/hero.json")
            .with_direction(-5);

        assert_eq!(config.name, "hero");
        assert_eq!(config.direction, -1);
        assert_eq!(config.load_strategy, LoadStrategy::Eager);
        assert_eq!(config.max_renderer_switches, 3);
        assert_eq!(config.source.as_ref().and_then(|s| s.cache_key()), Some("anims/hero.json"));
    }

    #[test]
    fn test_performance_config_partial_json() {
        let perf: PerformanceConfig = serde_json::from_str(r#"{"min_fps": 24}"#).unwrap();
        assert_eq!(perf.min_fps, 24.0);
        assert_eq!(perf.target_fps, 60.0);
        assert!(perf.auto_degrade);
    }
}
