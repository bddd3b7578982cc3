//! Playback instance: per-animation lifecycle state machine
//!
//! ```text
//! idle -> loading -> loaded -> playing <-> paused -> stopped
//!            \-> error
//! destroy(): any state -> idle (terminal, resources released)
//! ```
//!
//! **Loading strategies** (chosen in `InstanceConfig`):
//! - Eager: `init()` loads immediately
//! - Lazy: nothing happens until the caller invokes `load()`
//! - Intersection: `check_visibility()` loads once the container is on screen
//!
//! **Adaptive degradation**: each completed PerformanceMonitor sample is checked
//! against `min_fps` / `max_memory_mb`. Low FPS steps quality down one level
//! (never back up) and sets a frame-skip ratio `ceil(target_fps / fps)`: time
//! still advances every frame but only every Nth frame is painted.
//!
//! **Renderer switching** destroys and reloads the engine handle, restoring the
//! current frame and play state. Guarded by a `RateLimiter`.
//!
//! Instances are only mutated through their own methods. Events are queued on
//! the instance's `EventBus` and delivered by `events().dispatch()`, which the
//! manager calls after releasing the instance lock.

use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::core::event_bus::EventBus;
use crate::core::loader::{LoadError, PayloadLoader};
use crate::core::perf_monitor::{MetricsDelivery, PerformanceMonitor};
use crate::core::rate_limit::RateLimiter;
use crate::entities::{
    AnimationEngine, AnimationHandle, AnimationPayload, Clock, Container, EngineError, EngineEvent,
    InstanceConfig, InstanceEvent, InstanceState, LoadStrategy, MemoryProbe, PerformanceMetrics, Quality,
    RendererKind, RendererOptions, Viewport, WarningReason,
};

/// Instance shared between manager, pool and batch renderer
pub type SharedInstance = Arc<Mutex<PlaybackInstance>>;

/// Services an instance needs to load and sample itself
#[derive(Clone)]
pub struct InstanceContext {
    pub engine: Arc<dyn AnimationEngine>,
    pub loader: Arc<PayloadLoader>,
    pub clock: Arc<dyn Clock>,
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,
}

pub struct PlaybackInstance {
    id: Uuid,
    name: String,
    state: InstanceState,
    handle: Option<Box<dyn AnimationHandle>>,
    container: Option<Container>,
    config: Arc<InstanceConfig>,
    renderer: RendererKind,
    quality: Quality,
    payload: Option<Arc<AnimationPayload>>,
    events: EventBus,
    monitor: Option<PerformanceMonitor>,
    ctx: InstanceContext,
    switch_limiter: RateLimiter,
    /// Paint every Nth frame (1 = every frame)
    frame_skip: u32,
    frame_counter: u64,
    last_advance_at: Option<f64>,
    awaiting_visibility: bool,
    destroyed: bool,
}

impl PlaybackInstance {
    pub fn new(config: InstanceConfig, ctx: InstanceContext) -> Self {
        let now = ctx.clock.now_ms();
        let switch_limiter = match config.renderer_switch_refill_ms {
            Some(interval) => RateLimiter::refilling(config.max_renderer_switches, interval, now),
            None => RateLimiter::lifetime(config.max_renderer_switches),
        };
        let id = Uuid::new_v4();
        debug!("PlaybackInstance {} '{}' created ({:?})", id, config.name, config.load_strategy);

        Self {
            id,
            name: config.name.clone(),
            state: InstanceState::Idle,
            handle: None,
            container: config.container.clone(),
            renderer: config.renderer,
            quality: config.quality,
            awaiting_visibility: config.load_strategy == LoadStrategy::Intersection,
            config: Arc::new(config),
            payload: None,
            events: EventBus::new(),
            monitor: None,
            ctx,
            switch_limiter,
            frame_skip: 1,
            frame_counter: 0,
            last_advance_at: None,
            destroyed: false,
        }
    }

    /// Wrap into the shared form used by the services
    pub fn into_shared(self) -> SharedInstance {
        Arc::new(Mutex::new(self))
    }

    // ========== Accessors ==========

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn renderer(&self) -> RendererKind {
        self.renderer
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn payload(&self) -> Option<&Arc<AnimationPayload>> {
        self.payload.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state == InstanceState::Playing
    }

    pub fn is_awaiting_visibility(&self) -> bool {
        self.awaiting_visibility
    }

    pub fn current_frame(&self) -> Option<f64> {
        self.handle.as_ref().map(|h| h.current_frame())
    }

    /// Latest performance sample, if a monitor is attached
    pub fn metrics(&self) -> Option<PerformanceMetrics> {
        self.monitor.as_ref().map(|m| m.metrics())
    }

    /// Monitor for registering metric callbacks (exists after load)
    pub fn monitor_mut(&mut self) -> Option<&mut PerformanceMonitor> {
        self.monitor.as_mut()
    }

    /// Completed samples whose metrics callbacks have not run yet.
    /// The caller runs them after releasing the instance.
    pub fn take_metrics_deliveries(&mut self) -> Vec<MetricsDelivery> {
        self.monitor
            .as_mut()
            .map(|m| m.take_deliveries())
            .unwrap_or_default()
    }

    pub fn renderer_switches_remaining(&self) -> u32 {
        self.switch_limiter.remaining()
    }

    /// Whether the container currently intersects the viewport
    pub fn is_visible(&self, viewport: &dyn Viewport) -> bool {
        self.container.as_ref().map(|c| viewport.is_visible(c)).unwrap_or(false)
    }

    fn set_state(&mut self, to: InstanceState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        trace!("Instance {} state: {:?} -> {:?}", self.id, from, to);
        self.events.emit(InstanceEvent::StateChange { from, to });
    }

    // ========== Loading ==========

    /// Apply the configured load strategy (called once after creation)
    pub fn init(&mut self) -> Result<(), LoadError> {
        match self.config.load_strategy {
            LoadStrategy::Eager => self.load(),
            LoadStrategy::Lazy | LoadStrategy::Intersection => Ok(()),
        }
    }

    /// Load the payload and create the engine handle.
    ///
    /// No-op when already loading or loaded. On failure the instance moves to
    /// `Error` and a `DataFailed` event is queued.
    pub fn load(&mut self) -> Result<(), LoadError> {
        let autoplay = self.config.autoplay;
        self.load_with(autoplay)
    }

    fn load_with(&mut self, autoplay: bool) -> Result<(), LoadError> {
        if self.destroyed {
            return Err(LoadError::Destroyed);
        }
        if self.state == InstanceState::Loading || self.handle.is_some() {
            return Ok(());
        }

        self.awaiting_visibility = false;
        let started = self.ctx.clock.now_ms();
        self.set_state(InstanceState::Loading);

        match self.create_handle(started) {
            Ok(()) => {
                self.set_state(InstanceState::Loaded);
                self.events.emit(InstanceEvent::DataReady);
                info!(
                    "Instance '{}' loaded ({}, {:.1} ms)",
                    self.name,
                    self.renderer.as_str(),
                    self.ctx.clock.now_ms() - started
                );
                if autoplay {
                    self.play();
                }
                Ok(())
            }
            Err(e) => {
                warn!("Instance '{}' failed to load: {}", self.name, e);
                self.set_state(InstanceState::Error);
                self.events.emit(InstanceEvent::DataFailed { reason: e.to_string() });
                Err(e)
            }
        }
    }

    fn create_handle(&mut self, started: f64) -> Result<(), LoadError> {
        let container = self.container.clone().ok_or(LoadError::MissingContainer)?;
        let payload = match &self.payload {
            Some(payload) => Arc::clone(payload),
            None => {
                let source = self.config.source.as_ref().ok_or(LoadError::MissingPayload)?;
                self.ctx.loader.resolve(source)?
            }
        };

        let options = RendererOptions {
            renderer: self.renderer,
            quality: self.quality,
            loop_playback: self.config.loop_playback,
            autoplay: false,
        };
        let mut handle = self.ctx.engine.load(&container, Arc::clone(&payload), &options)?;
        handle.set_speed(self.config.speed);
        handle.set_direction(self.config.direction);
        handle.set_quality(self.quality);
        // Ready is reported as DataReady by load_with()
        handle.drain_events();

        let perf = &self.config.performance;
        if perf.enabled && self.monitor.is_none() {
            let mut monitor =
                PerformanceMonitor::new(payload.total_frames(), payload.duration_ms(), perf.sample_interval_ms);
            if let Some(probe) = &self.ctx.memory_probe {
                monitor = monitor.with_probe(Arc::clone(probe));
            }
            self.monitor = Some(monitor);
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.set_load_time(self.ctx.clock.now_ms() - started);
        }

        self.handle = Some(handle);
        self.payload = Some(payload);
        Ok(())
    }

    /// Intersection strategy: load once the container becomes visible.
    /// Returns true if a load was triggered.
    pub fn check_visibility(&mut self, viewport: &dyn Viewport) -> Result<bool, LoadError> {
        if !self.awaiting_visibility || self.destroyed || !self.is_visible(viewport) {
            return Ok(false);
        }
        debug!("Instance '{}' entered viewport, loading", self.name);
        self.load().map(|_| true)
    }

    // ========== Playback ==========

    /// Start playback. No-op (false) before a successful load.
    pub fn play(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        handle.play();
        let now = self.ctx.clock.now_ms();
        self.last_advance_at = Some(now);
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.start(now);
        }
        self.set_state(InstanceState::Playing);
        true
    }

    pub fn pause(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        handle.pause();
        self.halt_sampling();
        self.set_state(InstanceState::Paused);
        true
    }

    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        handle.stop();
        self.halt_sampling();
        self.set_state(InstanceState::Stopped);
        true
    }

    fn halt_sampling(&mut self) {
        self.last_advance_at = None;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
    }

    pub fn set_speed(&mut self, speed: f64) -> bool {
        self.with_handle(|h| h.set_speed(speed))
    }

    pub fn set_direction(&mut self, direction: i8) -> bool {
        self.with_handle(|h| h.set_direction(direction))
    }

    pub fn go_to_and_stop(&mut self, frame: f64) -> bool {
        if !self.with_handle(|h| h.go_to_and_stop(frame)) {
            return false;
        }
        self.halt_sampling();
        self.set_state(InstanceState::Paused);
        true
    }

    pub fn go_to_and_play(&mut self, frame: f64) -> bool {
        if !self.with_handle(|h| h.go_to_and_play(frame)) {
            return false;
        }
        self.play()
    }

    pub fn play_segments(&mut self, segments: &[(f64, f64)], force: bool) -> bool {
        if !self.with_handle(|h| h.play_segments(segments, force)) {
            return false;
        }
        self.play()
    }

    pub fn resize(&mut self) -> bool {
        self.with_handle(|h| h.resize())
    }

    fn with_handle(&mut self, f: impl FnOnce(&mut dyn AnimationHandle)) -> bool {
        match self.handle.as_mut() {
            Some(handle) => {
                f(handle.as_mut());
                true
            }
            None => false,
        }
    }

    // ========== Per-frame ==========

    /// Advance engine time to `now_ms`, forward engine events and feed the
    /// performance monitor. Only acts while playing.
    pub fn advance(&mut self, now_ms: f64) {
        if self.state != InstanceState::Playing {
            return;
        }
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        let elapsed = now_ms - self.last_advance_at.unwrap_or(now_ms);
        self.last_advance_at = Some(now_ms);
        handle.advance(elapsed.max(0.0));

        let finished = handle.is_paused();
        for event in handle.drain_events() {
            match event {
                EngineEvent::Complete => self.events.emit(InstanceEvent::Complete),
                EngineEvent::LoopComplete => self.events.emit(InstanceEvent::LoopComplete),
                EngineEvent::EnterFrame { frame } => self.events.emit(InstanceEvent::EnterFrame { frame }),
                EngineEvent::Ready | EngineEvent::Destroy => {}
            }
        }
        if finished {
            // Non-looping animation reached its end
            self.halt_sampling();
            self.set_state(InstanceState::Stopped);
            return;
        }

        let sample = self.monitor.as_mut().and_then(|m| m.on_frame(now_ms));
        if let Some(metrics) = sample {
            self.evaluate_metrics(metrics);
        }
    }

    /// Check a sample against thresholds and degrade if needed
    fn evaluate_metrics(&mut self, metrics: PerformanceMetrics) {
        let perf = self.config.performance.clone();

        if metrics.fps < perf.min_fps {
            self.events.emit(InstanceEvent::PerformanceWarning {
                metrics,
                reason: WarningReason::LowFps,
            });
            if perf.auto_degrade {
                self.degrade(metrics.fps, perf.target_fps);
            }
        }
        if metrics.memory_mb > perf.max_memory_mb {
            self.events.emit(InstanceEvent::PerformanceWarning {
                metrics,
                reason: WarningReason::HighMemory,
            });
        }
    }

    fn degrade(&mut self, fps: f64, target_fps: f64) {
        if let Some(lower) = self.quality.step_down() {
            self.quality = lower;
            if let Some(handle) = self.handle.as_mut() {
                handle.set_quality(lower);
            }
            info!("Instance '{}' degraded to {:?} quality ({:.1} fps)", self.name, lower, fps);
        }
        if fps > 0.0 {
            self.frame_skip = (target_fps / fps).ceil().max(1.0) as u32;
            debug!("Instance '{}' frame skip = {}", self.name, self.frame_skip);
        }
    }

    /// Paint the current frame, honoring the frame-skip ratio.
    ///
    /// Returns Ok(true) if the engine painted, Ok(false) if skipped or unloaded.
    pub fn render_frame(&mut self) -> Result<bool, EngineError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(false);
        };
        self.frame_counter += 1;
        if self.frame_skip > 1 && self.frame_counter % self.frame_skip as u64 != 0 {
            return Ok(false);
        }
        handle.render()?;
        Ok(true)
    }

    // ========== Renderer switching ==========

    /// Switch renderer backend, preserving current frame and play state.
    ///
    /// Returns Ok(false) when nothing changed (same renderer, or the switch
    /// budget is exhausted).
    pub fn switch_renderer(&mut self, renderer: RendererKind) -> Result<bool, LoadError> {
        if self.destroyed {
            return Err(LoadError::Destroyed);
        }
        if renderer == self.renderer {
            return Ok(false);
        }
        if self.handle.is_none() {
            // Nothing to rebuild yet, next load uses the new renderer
            self.renderer = renderer;
            return Ok(true);
        }
        if !self.switch_limiter.try_acquire(self.ctx.clock.now_ms()) {
            warn!(
                "Instance '{}': renderer switch to {} refused (limit {} reached)",
                self.name,
                renderer.as_str(),
                self.switch_limiter.capacity()
            );
            return Ok(false);
        }

        let previous_state = self.state;
        let frame = self.current_frame().unwrap_or(0.0);
        info!(
            "Instance '{}': switching renderer {} -> {} at frame {:.1}",
            self.name,
            self.renderer.as_str(),
            renderer.as_str(),
            frame
        );

        self.release_handle();
        self.renderer = renderer;
        self.state = InstanceState::Idle;
        self.load_with(false)?;

        if let Some(handle) = self.handle.as_mut() {
            handle.go_to_and_stop(frame);
        }
        match previous_state {
            InstanceState::Playing => {
                self.play();
            }
            InstanceState::Paused | InstanceState::Stopped => self.set_state(previous_state),
            _ => {}
        }
        Ok(true)
    }

    fn release_handle(&mut self) {
        self.halt_sampling();
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.destroy() {
                warn!("Instance '{}': engine destroy failed: {}", self.name, e);
            }
        }
    }

    // ========== Teardown ==========

    /// Release engine handle, monitor and subscribers; state returns to Idle.
    ///
    /// Idempotent. The final `StateChange`/`Destroyed` events are delivered
    /// synchronously here, so `Destroyed` callbacks must not lock this instance.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.release_handle();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.destroy();
        }
        self.payload = None;
        self.awaiting_visibility = false;
        self.destroyed = true;
        self.set_state(InstanceState::Idle);
        self.events.emit(InstanceEvent::Destroyed);
        self.events.dispatch();
        self.events.clear();
        debug!("Instance {} '{}' destroyed", self.id, self.name);
    }
}

impl Drop for PlaybackInstance {
    fn drop(&mut self) {
        if !self.destroyed {
            self.release_handle();
        }
    }
}

impl std::fmt::Debug for PlaybackInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("renderer", &self.renderer)
            .field("quality", &self.quality)
            .field("frame_skip", &self.frame_skip)
            .finish()
    }
}
