//! Global memory-pressure monitor
//!
//! `stopped <-> monitoring`. While monitoring, `tick()` polls every
//! `monitor_interval_ms` and compares `used / limit` with the thresholds:
//!
//! | ratio              | status   | action             |
//! |--------------------|----------|--------------------|
//! | < warning          | healthy  | none               |
//! | >= warning         | warning  | `cleanup()`        |
//! | >= danger          | danger   | `emergency_cleanup()` |
//! | >= 1.0             | critical | `emergency_cleanup()` |
//!
//! Cleanups share one cooldown window (`cleanup_cooldown_ms`); pressure
//! callbacks are notified on every crossing, cooldown or not.
//!
//! Usage comes from the host `MemoryProbe`; without one, from the sum of the
//! per-instance size registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MemorySettings;
use crate::entities::{Clock, MemoryProbe};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fraction of idle pooled instances destroyed by an emergency cleanup
pub const EMERGENCY_IDLE_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Healthy,
    Warning,
    Danger,
    Critical,
}

/// Derived on every poll, never stored as truth
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub used_mb: f64,
    pub limit_mb: f64,
    /// 0..100 (may exceed 100)
    pub percentage: f64,
    pub status: MemoryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureAction {
    Cleanup,
    Emergency,
}

/// Delivered to pressure callbacks on every threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureEvent {
    pub stats: MemoryStats,
    pub action: PressureAction,
    /// False when the cooldown suppressed the cleanup
    pub executed: bool,
}

pub type PressureCallback = Arc<dyn Fn(&PressureEvent) + Send + Sync>;

/// Whoever owns evictable resources (the manager). Each hook returns the
/// number of actions taken.
pub trait PressureTarget: Send + Sync {
    fn clear_caches(&self) -> usize;
    fn optimize(&self) -> usize;
    fn stop_offscreen(&self) -> usize;
    fn evict_idle(&self, fraction: f64) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryManagerStats {
    pub monitoring: bool,
    pub polls: u64,
    pub cleanups: u64,
    pub emergency_cleanups: u64,
    pub suppressed_by_cooldown: u64,
    pub registered_instances: usize,
    pub last: Option<MemoryStats>,
}

#[derive(Default)]
struct State {
    monitoring: bool,
    next_poll_at: f64,
    last_cleanup_at: Option<f64>,
    callbacks: IndexMap<u64, PressureCallback>,
    next_callback_id: u64,
    target: Option<Weak<dyn PressureTarget>>,
    /// Estimated bytes per instance
    registry: HashMap<Uuid, u64>,
    stats: MemoryManagerStats,
}

pub struct MemoryManager {
    state: Mutex<State>,
    settings: MemorySettings,
    clock: Arc<dyn Clock>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl MemoryManager {
    pub fn new(settings: &MemorySettings, clock: Arc<dyn Clock>, probe: Option<Arc<dyn MemoryProbe>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            settings: settings.clone(),
            clock,
            probe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Install the cleanup target. Held weakly; a dropped target turns the
    /// cleanup hooks into no-ops.
    pub fn set_target(&self, target: Weak<dyn PressureTarget>) {
        self.lock().target = Some(target);
    }

    fn target(&self) -> Option<Arc<dyn PressureTarget>> {
        self.lock().target.as_ref().and_then(|t| t.upgrade())
    }

    // ========== Monitoring ==========

    pub fn start_monitoring(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if state.monitoring {
            return;
        }
        state.monitoring = true;
        state.stats.monitoring = true;
        state.next_poll_at = now;
        info!(
            "MemoryManager: monitoring started (limit {} MB, every {} ms)",
            self.settings.memory_limit_mb, self.settings.monitor_interval_ms
        );
    }

    pub fn stop_monitoring(&self) {
        let mut state = self.lock();
        if state.monitoring {
            state.monitoring = false;
            state.stats.monitoring = false;
            info!("MemoryManager: monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock().monitoring
    }

    /// Timer step: polls when the interval elapsed. Returns the action
    /// triggered by this poll, if any.
    pub fn tick(&self) -> Option<PressureAction> {
        let now = self.clock.now_ms();
        {
            let mut state = self.lock();
            if !state.monitoring || now < state.next_poll_at {
                return None;
            }
            state.next_poll_at = now + self.settings.monitor_interval_ms;
        }
        self.check_pressure()
    }

    /// Poll once and respond to the current pressure level
    pub fn check_pressure(&self) -> Option<PressureAction> {
        let stats = self.get_memory_stats();
        let now = self.clock.now_ms();

        let action = match stats.status {
            MemoryStatus::Healthy => None,
            MemoryStatus::Warning => Some(PressureAction::Cleanup),
            MemoryStatus::Danger | MemoryStatus::Critical => Some(PressureAction::Emergency),
        };

        let (executed, callbacks) = {
            let mut state = self.lock();
            state.stats.polls += 1;
            state.stats.last = Some(stats);
            if action.is_none() {
                trace!("MemoryManager: {:.1}% healthy", stats.percentage);
                return None;
            }
            let cooled = state
                .last_cleanup_at
                .map(|at| now - at >= self.settings.cleanup_cooldown_ms)
                .unwrap_or(true);
            if cooled {
                state.last_cleanup_at = Some(now);
            } else {
                state.stats.suppressed_by_cooldown += 1;
            }
            let callbacks: Vec<PressureCallback> = state.callbacks.values().cloned().collect();
            (cooled, callbacks)
        };

        let action = action?;
        if executed {
            warn!(
                "Memory pressure {:?}: {:.1} / {:.0} MB ({:.1}%)",
                stats.status, stats.used_mb, stats.limit_mb, stats.percentage
            );
            match action {
                PressureAction::Cleanup => {
                    self.cleanup();
                }
                PressureAction::Emergency => {
                    self.emergency_cleanup();
                }
            }
        } else {
            debug!("Memory pressure {:?}: cleanup in cooldown", stats.status);
        }

        let event = PressureEvent {
            stats,
            action,
            executed,
        };
        for cb in callbacks {
            cb(&event);
        }
        Some(action)
    }

    // ========== Stats ==========

    /// Compute fresh usage stats
    pub fn get_memory_stats(&self) -> MemoryStats {
        let used_bytes = self
            .probe
            .as_ref()
            .and_then(|p| p.used_bytes())
            .unwrap_or_else(|| self.registered_bytes());
        let used_mb = used_bytes as f64 / BYTES_PER_MB;
        let limit_mb = self.settings.memory_limit_mb.max(f64::EPSILON);
        let ratio = used_mb / limit_mb;

        let status = if ratio >= 1.0 {
            MemoryStatus::Critical
        } else if ratio >= self.settings.danger_threshold {
            MemoryStatus::Danger
        } else if ratio >= self.settings.warning_threshold {
            MemoryStatus::Warning
        } else {
            MemoryStatus::Healthy
        };

        MemoryStats {
            used_mb,
            limit_mb: self.settings.memory_limit_mb,
            percentage: ratio * 100.0,
            status,
        }
    }

    pub fn get_stats(&self) -> MemoryManagerStats {
        let state = self.lock();
        MemoryManagerStats {
            registered_instances: state.registry.len(),
            ..state.stats
        }
    }

    // ========== Instance size registry ==========

    pub fn register_instance(&self, id: Uuid, bytes: u64) {
        self.lock().registry.insert(id, bytes);
    }

    pub fn unregister_instance(&self, id: Uuid) -> bool {
        self.lock().registry.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: Uuid) -> bool {
        self.lock().registry.contains_key(&id)
    }

    pub fn registered_bytes(&self) -> u64 {
        self.lock().registry.values().sum()
    }

    // ========== Callbacks ==========

    pub fn on_pressure<F>(&self, callback: F) -> u64
    where
        F: Fn(&PressureEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_callback_id += 1;
        let id = state.next_callback_id;
        state.callbacks.insert(id, Arc::new(callback));
        id
    }

    pub fn remove_pressure_callback(&self, id: u64) -> bool {
        self.lock().callbacks.shift_remove(&id).is_some()
    }

    // ========== Cleanup tiers ==========

    /// Clear caches, optimize the target, hint a host GC.
    pub fn cleanup(&self) -> usize {
        let mut actions = 0;
        if let Some(target) = self.target() {
            actions += target.clear_caches();
            actions += target.optimize();
        }
        if self.probe.as_ref().map(|p| p.request_gc()).unwrap_or(false) {
            actions += 1;
        }
        self.lock().stats.cleanups += 1;
        info!("MemoryManager cleanup: {} actions", actions);
        actions
    }

    /// `cleanup()` plus stop off-screen playback and evict idle instances.
    pub fn emergency_cleanup(&self) -> usize {
        let mut actions = self.cleanup();
        if let Some(target) = self.target() {
            actions += target.stop_offscreen();
            actions += target.evict_idle(EMERGENCY_IDLE_FRACTION);
        }
        self.lock().stats.emergency_cleanups += 1;
        warn!("MemoryManager emergency cleanup: {} actions", actions);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FixedMemoryProbe, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        clears: AtomicUsize,
        optimizes: AtomicUsize,
        stops: AtomicUsize,
        evictions: AtomicUsize,
    }

    impl PressureTarget for CountingTarget {
        fn clear_caches(&self) -> usize {
            self.clears.fetch_add(1, Ordering::SeqCst);
            1
        }
        fn optimize(&self) -> usize {
            self.optimizes.fetch_add(1, Ordering::SeqCst);
            1
        }
        fn stop_offscreen(&self) -> usize {
            self.stops.fetch_add(1, Ordering::SeqCst);
            2
        }
        fn evict_idle(&self, fraction: f64) -> usize {
            assert_eq!(fraction, EMERGENCY_IDLE_FRACTION);
            self.evictions.fetch_add(1, Ordering::SeqCst);
            3
        }
    }

    fn settings() -> MemorySettings {
        MemorySettings {
            memory_limit_mb: 100.0,
            warning_threshold: 0.7,
            danger_threshold: 0.85,
            monitor_interval_ms: 1000.0,
            cleanup_cooldown_ms: 5000.0,
        }
    }

    fn setup() -> (MemoryManager, Arc<ManualClock>, Arc<FixedMemoryProbe>, Arc<CountingTarget>) {
        let clock = Arc::new(ManualClock::new());
        let probe = Arc::new(FixedMemoryProbe::new(0));
        let manager = MemoryManager::new(&settings(), clock.clone(), Some(probe.clone()));
        let target = Arc::new(CountingTarget::default());
        let weak: Weak<dyn PressureTarget> = Arc::downgrade(&target) as Weak<dyn PressureTarget>;
        manager.set_target(weak);
        (manager, clock, probe, target)
    }

    #[test]
    fn test_status_classification() {
        let (manager, _, probe, _) = setup();
        let cases = [
            (10.0, MemoryStatus::Healthy),
            (70.0, MemoryStatus::Warning),
            (85.0, MemoryStatus::Danger),
            (120.0, MemoryStatus::Critical),
        ];
        for (mb, status) in cases {
            probe.set_mb(mb);
            let stats = manager.get_memory_stats();
            assert_eq!(stats.status, status, "{} MB", mb);
            assert!((stats.percentage - mb).abs() < 1e-9);
        }
    }

    #[test]
    fn test_emergency_once_per_cooldown() {
        let (manager, clock, probe, target) = setup();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        manager.on_pressure(move |event| {
            assert_eq!(event.action, PressureAction::Emergency);
            n.fetch_add(1, Ordering::SeqCst);
        });

        probe.set_mb(90.0);
        manager.start_monitoring();
        // Polls at 0, 1000, 2000, 3000, 4000 all inside the 5s cooldown
        for _ in 0..5 {
            assert_eq!(manager.tick(), Some(PressureAction::Emergency));
            clock.advance(1000.0);
        }
        assert_eq!(manager.get_stats().emergency_cleanups, 1);
        assert_eq!(target.evictions.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 5);
        assert_eq!(manager.get_stats().suppressed_by_cooldown, 4);

        // t = 5000: cooldown over
        manager.tick();
        assert_eq!(manager.get_stats().emergency_cleanups, 2);
    }

    #[test]
    fn test_warning_runs_cleanup_only() {
        let (manager, _, probe, target) = setup();
        probe.set_mb(75.0);
        assert_eq!(manager.check_pressure(), Some(PressureAction::Cleanup));

        assert_eq!(target.clears.load(Ordering::SeqCst), 1);
        assert_eq!(target.optimizes.load(Ordering::SeqCst), 1);
        assert_eq!(target.stops.load(Ordering::SeqCst), 0);
        assert_eq!(target.evictions.load(Ordering::SeqCst), 0);
        assert_eq!(probe.gc_requests(), 1);
    }

    #[test]
    fn test_cooldown_shared_between_tiers() {
        let (manager, clock, probe, _) = setup();
        probe.set_mb(75.0);
        manager.check_pressure();
        clock.advance(100.0);
        probe.set_mb(95.0);
        manager.check_pressure();

        let stats = manager.get_stats();
        assert_eq!(stats.cleanups, 1);
        assert_eq!(stats.emergency_cleanups, 0);
    }

    #[test]
    fn test_emergency_counts_actions() {
        let (manager, _, _, target) = setup();
        // clear 1 + optimize 1 + gc 1 + stop 2 + evict 3
        assert_eq!(manager.emergency_cleanup(), 8);
        assert_eq!(target.evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emergency_after_target_dropped() {
        let (manager, _, probe, target) = setup();
        drop(target);
        // Only the host GC request remains
        assert_eq!(manager.emergency_cleanup(), 1);
        assert_eq!(probe.gc_requests(), 1);
        assert_eq!(manager.get_stats().emergency_cleanups, 1);
    }

    #[test]
    fn test_tick_respects_interval_and_stop() {
        let (manager, clock, probe, _) = setup();
        probe.set_mb(10.0);
        assert_eq!(manager.tick(), None);
        assert_eq!(manager.get_stats().polls, 0);

        manager.start_monitoring();
        manager.tick();
        clock.advance(500.0);
        manager.tick();
        assert_eq!(manager.get_stats().polls, 1);
        clock.advance(500.0);
        manager.tick();
        assert_eq!(manager.get_stats().polls, 2);

        manager.stop_monitoring();
        clock.advance(5000.0);
        manager.tick();
        assert_eq!(manager.get_stats().polls, 2);
    }

    #[test]
    fn test_registry_fallback_without_probe() {
        let clock = Arc::new(ManualClock::new());
        let manager = MemoryManager::new(&settings(), clock, None);
        let a = Uuid::new_v4();
        manager.register_instance(a, 40 * 1024 * 1024);
        manager.register_instance(Uuid::new_v4(), 35 * 1024 * 1024);

        let stats = manager.get_memory_stats();
        assert!((stats.used_mb - 75.0).abs() < 1e-9);
        assert_eq!(stats.status, MemoryStatus::Warning);

        assert!(manager.unregister_instance(a));
        assert_eq!(manager.get_memory_stats().status, MemoryStatus::Healthy);
        assert_eq!(manager.get_stats().registered_instances, 1);
    }

    #[test]
    fn test_dropped_target_is_noop() {
        let clock = Arc::new(ManualClock::new());
        let manager = MemoryManager::new(&settings(), clock, None);
        {
            let target = Arc::new(CountingTarget::default());
            let weak: Weak<dyn PressureTarget> = Arc::downgrade(&target) as Weak<dyn PressureTarget>;
            manager.set_target(weak);
        }
        assert_eq!(manager.emergency_cleanup(), 0);
    }
}
