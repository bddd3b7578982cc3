//! Headless animation engine.
//!
//! Keeps frame timing, looping and event semantics of a real engine but never
//! paints. Used by the CLI simulation and by tests, where a synthetic clock
//! drives the same orchestration code a browser host would.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::entities::{
    AnimationEngine, AnimationHandle, AnimationPayload, Container, EngineError, EngineEvent, Quality,
    RendererOptions,
};

/// Counters shared by the engine and every handle it created
#[derive(Debug, Default)]
pub struct HeadlessStats {
    loads: AtomicU64,
    renders: AtomicU64,
    destroys: AtomicU64,
    fail_loads: AtomicBool,
    fail_renders: AtomicBool,
    /// Container labels in paint order
    render_log: Mutex<Vec<String>>,
}

impl HeadlessStats {
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    pub fn destroys(&self) -> u64 {
        self.destroys.load(Ordering::Relaxed)
    }

    /// Make every subsequent load() fail
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent render() fail
    pub fn set_fail_renders(&self, fail: bool) {
        self.fail_renders.store(fail, Ordering::Relaxed);
    }

    /// Take the paint log
    pub fn take_render_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.render_log.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Default)]
pub struct HeadlessEngine {
    stats: Arc<HeadlessStats>,
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<HeadlessStats> {
        Arc::clone(&self.stats)
    }
}

impl AnimationEngine for HeadlessEngine {
    fn load(
        &self,
        container: &Container,
        payload: Arc<AnimationPayload>,
        options: &RendererOptions,
    ) -> Result<Box<dyn AnimationHandle>, EngineError> {
        if self.stats.fail_loads.load(Ordering::Relaxed) {
            return Err(EngineError::Load(format!("refused to load '{}'", payload.name())));
        }
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        trace!(
            "HeadlessEngine: load '{}' into {} ({})",
            payload.name(),
            container.label(),
            options.renderer.as_str()
        );

        Ok(Box::new(HeadlessHandle {
            label: container.label().to_string(),
            frame_rate: payload.fr,
            total_frames: payload.total_frames(),
            current_frame: 0.0,
            speed: 1.0,
            direction: 1,
            playing: options.autoplay,
            loop_playback: options.loop_playback,
            segment: None,
            quality: options.quality,
            destroyed: false,
            events: vec![EngineEvent::Ready],
            stats: Arc::clone(&self.stats),
        }))
    }
}

pub struct HeadlessHandle {
    label: String,
    frame_rate: f64,
    total_frames: f64,
    current_frame: f64,
    speed: f64,
    direction: i8,
    playing: bool,
    loop_playback: bool,
    segment: Option<(f64, f64)>,
    quality: Quality,
    destroyed: bool,
    events: Vec<EngineEvent>,
    stats: Arc<HeadlessStats>,
}

impl HeadlessHandle {
    fn range(&self) -> (f64, f64) {
        self.segment.unwrap_or((0.0, self.total_frames))
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }
}

impl AnimationHandle for HeadlessHandle {
    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn stop(&mut self) {
        self.playing = false;
        self.current_frame = self.range().0;
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        self.destroyed = true;
        self.playing = false;
        self.events.push(EngineEvent::Destroy);
        self.stats.destroys.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
    }

    fn set_direction(&mut self, direction: i8) {
        self.direction = if direction < 0 { -1 } else { 1 };
    }

    fn go_to_and_stop(&mut self, frame: f64) {
        self.current_frame = frame.clamp(0.0, self.total_frames);
        self.playing = false;
    }

    fn go_to_and_play(&mut self, frame: f64) {
        self.current_frame = frame.clamp(0.0, self.total_frames);
        self.playing = true;
    }

    fn play_segments(&mut self, segments: &[(f64, f64)], force: bool) {
        let Some(&(start, end)) = segments.first() else {
            return;
        };
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        self.segment = Some((lo.max(0.0), hi.min(self.total_frames)));
        if force || !self.playing {
            self.current_frame = if start <= end { lo } else { hi };
        }
        if start > end {
            self.direction = -1;
        }
        self.playing = true;
    }

    fn resize(&mut self) {}

    fn set_quality(&mut self, quality: Quality) {
        self.quality = quality;
    }

    fn current_frame(&self) -> f64 {
        self.current_frame
    }

    fn total_frames(&self) -> f64 {
        self.total_frames
    }

    fn is_paused(&self) -> bool {
        !self.playing
    }

    fn advance(&mut self, elapsed_ms: f64) {
        if !self.playing || self.destroyed {
            return;
        }
        let (start, end) = self.range();
        let len = (end - start).max(f64::EPSILON);
        let delta = elapsed_ms / 1000.0 * self.frame_rate * self.speed * self.direction as f64;
        let mut frame = self.current_frame + delta;

        if frame >= end {
            if self.loop_playback {
                frame = start + (frame - start) % len;
                self.events.push(EngineEvent::LoopComplete);
            } else {
                frame = end;
                self.playing = false;
                self.events.push(EngineEvent::Complete);
            }
        } else if frame < start {
            if self.loop_playback {
                frame = end - (start - frame) % len;
                self.events.push(EngineEvent::LoopComplete);
            } else {
                frame = start;
                self.playing = false;
                self.events.push(EngineEvent::Complete);
            }
        }

        self.current_frame = frame;
        self.events.push(EngineEvent::EnterFrame { frame });
    }

    fn render(&mut self) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        if self.stats.fail_renders.load(Ordering::Relaxed) {
            return Err(EngineError::Render(format!("paint failed for {}", self.label)));
        }
        self.stats.renders.fetch_add(1, Ordering::Relaxed);
        self.stats
            .render_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.label.clone());
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Rect, RendererKind};

    fn handle(loop_playback: bool) -> Box<dyn AnimationHandle> {
        let engine = HeadlessEngine::new();
        let container = Container::new("c", Rect::new(0.0, 0.0, 10.0, 10.0));
        let payload = Arc::new(AnimationPayload::synthetic("t", 10.0, 20.0, 10, 10));
        let options = RendererOptions {
            renderer: RendererKind::Svg,
            quality: Quality::High,
            loop_playback,
            autoplay: false,
        };
        engine.load(&container, payload, &options).unwrap()
    }

    #[test]
    fn test_ready_then_loop() {
        let mut h = handle(true);
        assert_eq!(h.drain_events(), vec![EngineEvent::Ready]);

        h.play();
        h.advance(1000.0); // 10 frames
        assert_eq!(h.current_frame(), 10.0);
        h.advance(1500.0); // 25 -> wraps to 5
        assert_eq!(h.current_frame(), 5.0);
        let events = h.drain_events();
        assert!(events.contains(&EngineEvent::LoopComplete));
    }

    #[test]
    fn test_complete_without_loop() {
        let mut h = handle(false);
        h.play();
        h.advance(5000.0);
        assert_eq!(h.current_frame(), 20.0);
        assert!(h.is_paused());
        assert!(h.drain_events().contains(&EngineEvent::Complete));
    }

    #[test]
    fn test_paused_handle_does_not_advance() {
        let mut h = handle(true);
        h.advance(1000.0);
        assert_eq!(h.current_frame(), 0.0);
    }

    #[test]
    fn test_destroy_twice_errors() {
        let mut h = handle(true);
        assert!(h.destroy().is_ok());
        assert_eq!(h.destroy(), Err(EngineError::Destroyed));
        assert_eq!(h.render(), Err(EngineError::Destroyed));
    }
}
