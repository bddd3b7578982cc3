//! Cross-instance frame render scheduler
//!
//! Coalesces per-instance render requests into one batch per host frame:
//! - `schedule_render()` upserts a task keyed by instance id and requests a frame
//! - `on_frame()` sorts pending tasks by `(priority desc, visible desc, age)`
//! - high tasks (priority > 0 or visible) render now, at most `max_batch_size`;
//!   the rest stay pending for the next frame
//! - low tasks spill onto the idle queue, drained by `on_idle(deadline)` while
//!   the deadline has time left (or render immediately without idle support)
//!
//! Visibility is a rect intersection against the viewport at render time.
//! Render errors are logged and counted; they never abort the batch.
//!
//! The renderer lock is never held while an instance is locked.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use log::{trace, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::core::instance::SharedInstance;
use crate::entities::{Clock, IdleDeadline, Viewport};

#[derive(Clone)]
pub struct RenderTask {
    pub id: Uuid,
    pub instance: SharedInstance,
    pub priority: i32,
    pub timestamp: f64,
    /// Submission order, breaks timestamp ties
    seq: u64,
}

impl std::fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub frames: u64,
    /// Engine paints (frame batch + idle)
    pub rendered: u64,
    /// Render calls skipped by frame-skip or unloaded instances
    pub skipped: u64,
    pub failed: u64,
    pub deferred_to_idle: u64,
    pub idle_rendered: u64,
    pub pending: usize,
    pub idle_queued: usize,
}

/// What one `on_frame()` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub carried_over: usize,
    pub deferred: usize,
}

enum Outcome {
    Painted,
    Skipped,
    Failed,
}

#[derive(Default)]
struct State {
    pending: IndexMap<Uuid, RenderTask>,
    idle_queue: VecDeque<RenderTask>,
    frame_requested: bool,
    next_seq: u64,
    stats: BatchStats,
}

pub struct BatchRenderer {
    state: Mutex<State>,
    max_batch_size: usize,
    idle_callbacks: bool,
    clock: Arc<dyn Clock>,
    viewport: Arc<dyn Viewport>,
}

impl BatchRenderer {
    pub fn new(
        max_batch_size: usize,
        idle_callbacks: bool,
        clock: Arc<dyn Clock>,
        viewport: Arc<dyn Viewport>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_batch_size: max_batch_size.max(1),
            idle_callbacks,
            clock,
            viewport,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upsert a render request. Re-scheduling supersedes the previous request.
    pub fn schedule_render(&self, id: Uuid, instance: SharedInstance, priority: i32) {
        let timestamp = self.clock.now_ms();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.idle_queue.retain(|t| t.id != id);
        state.pending.insert(
            id,
            RenderTask {
                id,
                instance,
                priority,
                timestamp,
                seq,
            },
        );
        state.frame_requested = true;
    }

    /// Drop any queued request for an instance (destroyed)
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        let in_pending = state.pending.shift_remove(&id).is_some();
        let before = state.idle_queue.len();
        state.idle_queue.retain(|t| t.id != id);
        in_pending || state.idle_queue.len() != before
    }

    /// Host should call `on_frame()` on its next frame callback
    pub fn frame_requested(&self) -> bool {
        self.lock().frame_requested
    }

    /// Host should call `on_idle()` when it has idle time
    pub fn idle_requested(&self) -> bool {
        !self.lock().idle_queue.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn is_visible(&self, instance: &SharedInstance) -> bool {
        instance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_visible(self.viewport.as_ref())
    }

    /// Render one batch. Called from the host's per-frame callback.
    pub fn on_frame(&self) -> FrameReport {
        let tasks: Vec<RenderTask> = {
            let mut state = self.lock();
            state.frame_requested = false;
            state.stats.frames += 1;
            state.pending.drain(..).map(|(_, task)| task).collect()
        };
        let mut report = FrameReport::default();
        if tasks.is_empty() {
            return report;
        }

        let mut ranked: Vec<(RenderTask, bool)> = tasks
            .into_iter()
            .map(|task| {
                let visible = self.is_visible(&task.instance);
                (task, visible)
            })
            .collect();
        ranked.sort_by(|(a, a_vis), (b, b_vis)| {
            b.priority
                .cmp(&a.priority)
                .then(b_vis.cmp(a_vis))
                .then(a.timestamp.partial_cmp(&b.timestamp).unwrap_or(CmpOrdering::Equal))
                .then(a.seq.cmp(&b.seq))
        });

        let (high, low): (Vec<_>, Vec<_>) = ranked.into_iter().partition(|(t, visible)| t.priority > 0 || *visible);

        let mut high = high.into_iter().map(|(t, _)| t);
        for task in high.by_ref().take(self.max_batch_size) {
            match self.render_task(&task) {
                Outcome::Painted => report.rendered += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        let leftover: Vec<RenderTask> = high.collect();
        report.carried_over = leftover.len();

        let low: Vec<RenderTask> = low.into_iter().map(|(t, _)| t).collect();
        if !self.idle_callbacks {
            for task in &low {
                match self.render_task(task) {
                    Outcome::Painted => report.rendered += 1,
                    Outcome::Skipped => report.skipped += 1,
                    Outcome::Failed => report.failed += 1,
                }
            }
        }

        let mut state = self.lock();
        for task in leftover {
            // A newer request scheduled during this frame wins
            state.pending.entry(task.id).or_insert(task);
        }
        if self.idle_callbacks {
            for task in low {
                if state.pending.contains_key(&task.id) {
                    continue;
                }
                state.idle_queue.retain(|t| t.id != task.id);
                state.idle_queue.push_back(task);
                report.deferred += 1;
            }
        }
        if !state.pending.is_empty() {
            state.frame_requested = true;
        }
        state.stats.rendered += report.rendered as u64;
        state.stats.skipped += report.skipped as u64;
        state.stats.failed += report.failed as u64;
        state.stats.deferred_to_idle += report.deferred as u64;

        trace!(
            "BatchRenderer frame: rendered={} skipped={} failed={} carried={} deferred={}",
            report.rendered, report.skipped, report.failed, report.carried_over, report.deferred
        );
        report
    }

    /// Render low-priority work while the deadline has time left.
    /// Whatever does not fit stays queued for the next idle period.
    pub fn on_idle(&self, deadline: &dyn IdleDeadline) -> usize {
        let mut painted = 0;
        while deadline.time_remaining_ms() > 0.0 {
            let Some(task) = self.lock().idle_queue.pop_front() else {
                break;
            };
            let outcome = self.render_task(&task);
            let mut state = self.lock();
            match outcome {
                Outcome::Painted => {
                    painted += 1;
                    state.stats.rendered += 1;
                    state.stats.idle_rendered += 1;
                }
                Outcome::Skipped => state.stats.skipped += 1,
                Outcome::Failed => state.stats.failed += 1,
            }
        }
        painted
    }

    fn render_task(&self, task: &RenderTask) -> Outcome {
        let mut instance = task.instance.lock().unwrap_or_else(|e| e.into_inner());
        if instance.is_destroyed() {
            return Outcome::Skipped;
        }
        match instance.render_frame() {
            Ok(true) => Outcome::Painted,
            Ok(false) => Outcome::Skipped,
            Err(e) => {
                warn!("Render failed for '{}': {}", instance.name(), e);
                Outcome::Failed
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.idle_queue.clear();
        state.frame_requested = false;
    }

    pub fn get_stats(&self) -> BatchStats {
        let state = self.lock();
        BatchStats {
            pending: state.pending.len(),
            idle_queued: state.idle_queue.len(),
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::tests::test_context;
    use crate::core::instance::PlaybackInstance;
    use crate::entities::{
        AnimationPayload, ClockDeadline, Container, InstanceConfig, ManualClock, Rect, SharedViewport,
    };
    use crate::headless::HeadlessStats;
    use std::cell::Cell;

    struct Fixture {
        renderer: BatchRenderer,
        stats: Arc<HeadlessStats>,
        clock: Arc<ManualClock>,
        instances: Vec<(Uuid, SharedInstance)>,
    }

    /// `visible[i]` places instance i inside or far outside the viewport
    fn fixture(visible: &[bool], max_batch: usize, idle_callbacks: bool) -> Fixture {
        let (ctx, clock, stats) = test_context();
        let viewport = Arc::new(SharedViewport::new(Rect::new(0.0, 0.0, 800.0, 600.0)));
        let instances = visible
            .iter()
            .enumerate()
            .map(|(i, vis)| {
                let name = format!("i{}", i);
                let y = if *vis { 10.0 } else { 5000.0 };
                let config = InstanceConfig::new(name.as_str())
                    .with_container(Container::new(name.as_str(), Rect::new(0.0, y, 100.0, 100.0)))
                    .with_source(AnimationPayload::synthetic(&name, 30.0, 60.0, 100, 100));
                let mut instance = PlaybackInstance::new(config, ctx.clone());
                instance.load().unwrap();
                (instance.id(), instance.into_shared())
            })
            .collect();
        let renderer = BatchRenderer::new(max_batch, idle_callbacks, clock.clone(), viewport);
        Fixture {
            renderer,
            stats,
            clock,
            instances,
        }
    }

    /// Allows a fixed number of idle renders
    struct CountdownDeadline(Cell<u32>);

    impl IdleDeadline for CountdownDeadline {
        fn time_remaining_ms(&self) -> f64 {
            let left = self.0.get();
            if left == 0 {
                return 0.0;
            }
            self.0.set(left - 1);
            1.0
        }
    }

    #[test]
    fn test_priority_then_visibility_order() {
        // X: priority 5 hidden, Y: priority 0 hidden, Z: priority 5 visible
        let f = fixture(&[false, false, true], 10, false);
        let (x, y, z) = (&f.instances[0], &f.instances[1], &f.instances[2]);
        f.renderer.schedule_render(x.0, x.1.clone(), 5);
        f.renderer.schedule_render(y.0, y.1.clone(), 0);
        f.renderer.schedule_render(z.0, z.1.clone(), 5);

        let report = f.renderer.on_frame();
        assert_eq!(report.rendered, 3);
        assert_eq!(f.stats.take_render_log(), vec!["i2", "i0", "i1"]);
        assert!(!f.renderer.frame_requested());
    }

    #[test]
    fn test_low_priority_spills_to_idle() {
        let f = fixture(&[false, false, true], 10, true);
        for (i, (id, inst)) in f.instances.iter().enumerate() {
            let priority = if i == 1 { 0 } else { 5 };
            f.renderer.schedule_render(*id, inst.clone(), priority);
        }

        let report = f.renderer.on_frame();
        assert_eq!(report.rendered, 2);
        assert_eq!(report.deferred, 1);
        assert!(f.renderer.idle_requested());

        assert_eq!(f.renderer.on_idle(&CountdownDeadline(Cell::new(5))), 1);
        assert!(!f.renderer.idle_requested());
        assert_eq!(f.stats.take_render_log(), vec!["i2", "i0", "i1"]);
    }

    #[test]
    fn test_idle_budget_leaves_remainder() {
        let f = fixture(&[false; 4], 10, true);
        for (id, inst) in &f.instances {
            f.renderer.schedule_render(*id, inst.clone(), 0);
        }
        f.renderer.on_frame();

        assert_eq!(f.renderer.on_idle(&CountdownDeadline(Cell::new(3))), 3);
        assert!(f.renderer.idle_requested());
        assert_eq!(f.renderer.on_idle(&ClockDeadline::new(f.clock.as_ref(), 0.0)), 0);
        assert_eq!(f.renderer.on_idle(&CountdownDeadline(Cell::new(3))), 1);
        assert_eq!(f.renderer.get_stats().idle_rendered, 4);
    }

    #[test]
    fn test_batch_size_carries_over() {
        let f = fixture(&[true; 15], 10, true);
        for (id, inst) in &f.instances {
            f.renderer.schedule_render(*id, inst.clone(), 0);
        }

        let first = f.renderer.on_frame();
        assert_eq!(first.rendered, 10);
        assert_eq!(first.carried_over, 5);
        assert!(f.renderer.frame_requested());

        let second = f.renderer.on_frame();
        assert_eq!(second.rendered, 5);
        assert!(!f.renderer.frame_requested());
    }

    #[test]
    fn test_reschedule_overwrites() {
        let f = fixture(&[true], 10, true);
        let (id, inst) = &f.instances[0];
        f.renderer.schedule_render(*id, inst.clone(), 0);
        f.clock.advance(5.0);
        f.renderer.schedule_render(*id, inst.clone(), 3);
        assert_eq!(f.renderer.pending_len(), 1);

        f.renderer.on_frame();
        assert_eq!(f.stats.renders(), 1);
    }

    #[test]
    fn test_ties_prefer_older_request() {
        let f = fixture(&[true, true], 10, false);
        let (a, b) = (&f.instances[0], &f.instances[1]);
        f.renderer.schedule_render(b.0, b.1.clone(), 1);
        f.clock.advance(1.0);
        f.renderer.schedule_render(a.0, a.1.clone(), 1);

        f.renderer.on_frame();
        assert_eq!(f.stats.take_render_log(), vec!["i1", "i0"]);
    }

    #[test]
    fn test_render_failure_does_not_abort_batch() {
        let f = fixture(&[true; 3], 10, false);
        for (id, inst) in &f.instances {
            f.renderer.schedule_render(*id, inst.clone(), 1);
        }
        f.stats.set_fail_renders(true);

        let report = f.renderer.on_frame();
        assert_eq!(report.failed, 3);
        assert_eq!(f.renderer.get_stats().failed, 3);
    }

    #[test]
    fn test_cancel() {
        let f = fixture(&[true], 10, true);
        let (id, inst) = &f.instances[0];
        f.renderer.schedule_render(*id, inst.clone(), 0);
        assert!(f.renderer.cancel(*id));
        assert!(!f.renderer.cancel(*id));
        assert_eq!(f.renderer.on_frame(), FrameReport::default());
    }
}
