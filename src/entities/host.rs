//! Host abstraction: clock, viewport geometry, containers, memory probe, idle deadlines.
//!
//! Everything time- or geometry-dependent in `core` goes through these types so a
//! non-browser host (headless harness, tests) can drive the same logic with a
//! synthetic clock and a fake viewport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::trace;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use uuid::Uuid;

// ============================================================================
// Clock
// ============================================================================

/// Millisecond clock used by every scheduler in the crate.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> f64;
}

/// Wall-clock backed by a monotonic `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Synthetic clock. Time only moves when `advance()`/`set()` is called.
///
/// Stored as microseconds in an atomic so it can be shared across services.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create clock starting at `ms`
    pub fn starting_at(ms: f64) -> Self {
        let clock = Self::new();
        clock.set(ms);
        clock
    }

    pub fn advance(&self, ms: f64) {
        let delta = (ms.max(0.0) * 1000.0) as u64;
        self.micros.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, ms: f64) {
        self.micros.store((ms.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Axis-aligned rectangle in viewport coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Strict overlap test. Touching edges do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Source of the current viewport rectangle.
pub trait Viewport: Send + Sync {
    fn rect(&self) -> Rect;

    /// O(1) visibility test for a container
    fn is_visible(&self, container: &Container) -> bool {
        let rect = container.rect();
        rect.area() > 0.0 && rect.intersects(&self.rect())
    }
}

/// Viewport whose rectangle is updated by the host (scroll/resize).
#[derive(Debug)]
pub struct SharedViewport {
    rect: Mutex<Rect>,
}

impl SharedViewport {
    pub fn new(rect: Rect) -> Self {
        Self { rect: Mutex::new(rect) }
    }

    pub fn set_rect(&self, rect: Rect) {
        *self.rect.lock().unwrap_or_else(|e| e.into_inner()) = rect;
    }

    /// Shift viewport by (dx, dy), e.g. on scroll
    pub fn scroll_by(&self, dx: f32, dy: f32) {
        let mut rect = self.rect.lock().unwrap_or_else(|e| e.into_inner());
        rect.x += dx;
        rect.y += dy;
    }
}

impl Viewport for SharedViewport {
    fn rect(&self) -> Rect {
        *self.rect.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Container
// ============================================================================

/// DOM-like element that an animation renders into.
///
/// Cheap to clone; clones share the same identity and bounding rect.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    id: Uuid,
    label: String,
    rect: Mutex<Rect>,
}

impl Container {
    pub fn new(label: impl Into<String>, rect: Rect) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id: Uuid::new_v4(),
                label: label.into(),
                rect: Mutex::new(rect),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current bounding rect
    pub fn rect(&self) -> Rect {
        *self.inner.rect.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rect(&self, rect: Rect) {
        trace!("Container {} moved to {:?}", self.inner.label, rect);
        *self.inner.rect.lock().unwrap_or_else(|e| e.into_inner()) = rect;
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Container {}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("rect", &self.rect())
            .finish()
    }
}

// ============================================================================
// Memory probe
// ============================================================================

/// Host-reported memory usage.
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use, or None when the host does not expose it.
    fn used_bytes(&self) -> Option<u64>;

    /// Best-effort garbage collection hint. Returns true if the host accepted it.
    fn request_gc(&self) -> bool {
        false
    }
}

/// Resident memory of the current process, read through `sysinfo`.
pub struct SystemMemoryProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        Self {
            sys: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        sys.process(pid).map(|p| p.memory())
    }
}

/// Probe that reports a fixed, host-controlled value (synthetic hosts).
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
    gc_requests: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
            gc_requests: AtomicU64::new(0),
        }
    }

    pub fn set_mb(&self, mb: f64) {
        self.bytes
            .store((mb.max(0.0) * 1024.0 * 1024.0) as u64, Ordering::Relaxed);
    }

    pub fn gc_requests(&self) -> u64 {
        self.gc_requests.load(Ordering::Relaxed)
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::Relaxed))
    }

    fn request_gc(&self) -> bool {
        self.gc_requests.fetch_add(1, Ordering::Relaxed);
        true
    }
}

// ============================================================================
// Idle deadline
// ============================================================================

/// Time budget handed to an idle-time callback.
pub trait IdleDeadline {
    fn time_remaining_ms(&self) -> f64;
}

/// Deadline measured against a `Clock`.
pub struct ClockDeadline<'a> {
    clock: &'a dyn Clock,
    deadline_ms: f64,
}

impl<'a> ClockDeadline<'a> {
    pub fn new(clock: &'a dyn Clock, budget_ms: f64) -> Self {
        Self {
            clock,
            deadline_ms: clock.now_ms() + budget_ms,
        }
    }
}

impl IdleDeadline for ClockDeadline<'_> {
    fn time_remaining_ms(&self) -> f64 {
        (self.deadline_ms - self.clock.now_ms()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at(100.0);
        assert_eq!(clock.now_ms(), 100.0);
        clock.advance(16.5);
        assert_eq!(clock.now_ms(), 116.5);
    }

    #[test]
    fn test_rect_intersection() {
        let viewport = Rect::new(0.0, 0.0, 800.0, 600.0);
        assert!(Rect::new(700.0, 500.0, 200.0, 200.0).intersects(&viewport));
        assert!(!Rect::new(0.0, 600.0, 100.0, 100.0).intersects(&viewport)); // touching edge
        assert!(!Rect::new(-300.0, 0.0, 200.0, 100.0).intersects(&viewport));
    }

    #[test]
    fn test_container_visibility_follows_scroll() {
        let viewport = SharedViewport::new(Rect::new(0.0, 0.0, 800.0, 600.0));
        let container = Container::new("below-fold", Rect::new(0.0, 1000.0, 200.0, 200.0));
        assert!(!viewport.is_visible(&container));

        viewport.scroll_by(0.0, 700.0);
        assert!(viewport.is_visible(&container));
    }

    #[test]
    fn test_zero_sized_container_never_visible() {
        let viewport = SharedViewport::new(Rect::new(0.0, 0.0, 800.0, 600.0));
        let container = Container::new("hidden", Rect::new(10.0, 10.0, 0.0, 0.0));
        assert!(!viewport.is_visible(&container));
    }

    #[test]
    fn test_clock_deadline() {
        let clock = ManualClock::new();
        let deadline = ClockDeadline::new(&clock, 10.0);
        assert_eq!(deadline.time_remaining_ms(), 10.0);
        clock.advance(4.0);
        assert_eq!(deadline.time_remaining_ms(), 6.0);
        clock.advance(20.0);
        assert_eq!(deadline.time_remaining_ms(), 0.0);
    }
}
