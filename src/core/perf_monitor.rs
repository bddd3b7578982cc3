//! Per-instance FPS / memory sampler.
//!
//! Cooperative: the owner calls `on_frame(now)` once per host frame while the
//! animation plays. Every `sample_interval_ms` of wall-clock the monitor
//! computes `fps = frames * 1000 / elapsed` and reads host memory (0 when the
//! host exposes none).
//!
//! Subscribers are not called from `on_frame`. Each sample is queued as a
//! [`MetricsDelivery`] and the owner hands it out with `take_deliveries()`,
//! so callbacks run outside whatever lock guards the monitor.

use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use log::trace;

use crate::entities::{MemoryProbe, PerformanceMetrics};

pub type MetricsCallback = Arc<dyn Fn(&PerformanceMetrics) + Send + Sync>;

type CallbackMap = Mutex<IndexMap<u64, MetricsCallback>>;

/// Unregisters one metrics callback. Dropping it without calling
/// `dispose()` keeps the callback registered.
#[derive(Debug)]
pub struct MetricsDisposer {
    callbacks: Weak<CallbackMap>,
    id: u64,
}

impl MetricsDisposer {
    /// Returns false if the callback or the monitor is already gone
    pub fn dispose(self) -> bool {
        match self.callbacks.upgrade() {
            Some(callbacks) => callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .shift_remove(&self.id)
                .is_some(),
            None => false,
        }
    }
}

/// One completed sample and the callbacks registered when it was taken
pub struct MetricsDelivery {
    metrics: PerformanceMetrics,
    callbacks: Vec<MetricsCallback>,
}

impl MetricsDelivery {
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    pub fn deliver(self) {
        for cb in &self.callbacks {
            cb(&self.metrics);
        }
    }
}

impl std::fmt::Debug for MetricsDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsDelivery")
            .field("metrics", &self.metrics)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

pub struct PerformanceMonitor {
    sample_interval_ms: f64,
    running: bool,
    last_sample_at: f64,
    frames_since_sample: u64,
    metrics: PerformanceMetrics,
    callbacks: Arc<CallbackMap>,
    outbox: Vec<MetricsDelivery>,
    next_id: u64,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl PerformanceMonitor {
    pub fn new(total_frames: f64, duration_ms: f64, sample_interval_ms: f64) -> Self {
        Self {
            sample_interval_ms: sample_interval_ms.max(1.0),
            running: false,
            last_sample_at: 0.0,
            frames_since_sample: 0,
            metrics: PerformanceMetrics {
                total_frames,
                duration_ms,
                ..Default::default()
            },
            callbacks: Arc::new(Mutex::new(IndexMap::new())),
            outbox: Vec::new(),
            next_id: 1,
            probe: None,
        }
    }

    /// Attach a host memory probe
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn set_load_time(&mut self, load_time_ms: f64) {
        self.metrics.load_time_ms = load_time_ms;
    }

    /// Begin sampling. Restarting resets the current sample window.
    pub fn start(&mut self, now_ms: f64) {
        self.running = true;
        self.last_sample_at = now_ms;
        self.frames_since_sample = 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Count one frame; returns the new sample when an interval completed.
    /// Subscribers get the sample through `take_deliveries()`.
    pub fn on_frame(&mut self, now_ms: f64) -> Option<PerformanceMetrics> {
        if !self.running {
            return None;
        }
        self.frames_since_sample += 1;

        let elapsed = now_ms - self.last_sample_at;
        if elapsed < self.sample_interval_ms {
            return None;
        }

        self.metrics.fps = self.frames_since_sample as f64 * 1000.0 / elapsed;
        self.metrics.memory_mb = self
            .probe
            .as_ref()
            .and_then(|p| p.used_bytes())
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        self.frames_since_sample = 0;
        self.last_sample_at = now_ms;

        trace!(
            "PerformanceMonitor sample: fps={:.1} mem={:.1} MB",
            self.metrics.fps, self.metrics.memory_mb
        );

        let callbacks: Vec<MetricsCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        if !callbacks.is_empty() {
            self.outbox.push(MetricsDelivery {
                metrics: self.metrics,
                callbacks,
            });
        }

        Some(self.metrics)
    }

    /// Samples waiting for their subscribers, oldest first
    pub fn take_deliveries(&mut self) -> Vec<MetricsDelivery> {
        std::mem::take(&mut self.outbox)
    }

    /// Latest sample, without waiting for the next interval
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    /// Register a callback for every completed sample
    pub fn on_metrics<F>(&mut self, callback: F) -> MetricsDisposer
    where
        F: Fn(&PerformanceMetrics) + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));
        MetricsDisposer {
            callbacks: Arc::downgrade(&self.callbacks),
            id,
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop sampling and drop all callbacks. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        self.running = false;
        self.outbox.clear();
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("running", &self.running)
            .field("sample_interval_ms", &self.sample_interval_ms)
            .field("metrics", &self.metrics)
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::FixedMemoryProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Feed frames every `step` ms from `from` until `until`, return last sample
    fn run(monitor: &mut PerformanceMonitor, from: f64, until: f64, step: f64) -> Option<PerformanceMetrics> {
        let mut t = from;
        let mut last = None;
        while t < until {
            t += step;
            if let Some(m) = monitor.on_frame(t) {
                last = Some(m);
            }
            for delivery in monitor.take_deliveries() {
                delivery.deliver();
            }
        }
        last
    }

    #[test]
    fn test_fps_sample() {
        let mut monitor = PerformanceMonitor::new(90.0, 3000.0, 1000.0);
        monitor.start(0.0);
        // 50 frames at 20ms -> last frame lands exactly on 1000ms
        let sample = run(&mut monitor, 0.0, 1000.0, 20.0).unwrap();
        assert!((sample.fps - 50.0).abs() < 1e-9);
        assert_eq!(sample.total_frames, 90.0);
        assert_eq!(sample.duration_ms, 3000.0);
        assert_eq!(sample.memory_mb, 0.0);
        assert_eq!(monitor.metrics(), sample);
    }

    #[test]
    fn test_not_running_no_samples() {
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0);
        assert!(run(&mut monitor, 0.0, 500.0, 10.0).is_none());

        monitor.start(500.0);
        monitor.stop();
        assert!(run(&mut monitor, 500.0, 1000.0, 10.0).is_none());
    }

    #[test]
    fn test_memory_from_probe() {
        let probe = Arc::new(FixedMemoryProbe::new(0));
        probe.set_mb(42.0);
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0).with_probe(probe);
        monitor.start(0.0);
        let sample = run(&mut monitor, 0.0, 100.0, 10.0).unwrap();
        assert!((sample.memory_mb - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_callbacks_and_disposer() {
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a2 = Arc::clone(&a);
        let b2 = Arc::clone(&b);
        let da = monitor.on_metrics(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let _db = monitor.on_metrics(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        monitor.start(0.0);
        run(&mut monitor, 0.0, 100.0, 10.0);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        assert!(da.dispose());
        run(&mut monitor, 100.0, 200.0, 10.0);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callbacks_wait_for_delivery() {
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        monitor.on_metrics(move |m| {
            assert!(m.fps > 0.0);
            c.fetch_add(1, Ordering::SeqCst);
        });

        monitor.start(0.0);
        for i in 1..=20 {
            monitor.on_frame(i as f64 * 10.0);
        }
        // Two samples taken, nobody called yet
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let deliveries = monitor.take_deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(monitor.take_deliveries().is_empty());
        for delivery in deliveries {
            delivery.deliver();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_deliveries_without_callbacks() {
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0);
        monitor.start(0.0);
        assert!(run(&mut monitor, 0.0, 300.0, 10.0).is_some());
        assert!(monitor.take_deliveries().is_empty());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut monitor = PerformanceMonitor::new(10.0, 100.0, 100.0);
        let disposer = monitor.on_metrics(|_| {});
        monitor.start(0.0);
        monitor.destroy();
        monitor.destroy();
        assert!(!monitor.is_running());
        assert_eq!(monitor.callback_count(), 0);
        assert!(!disposer.dispose());
    }
}
