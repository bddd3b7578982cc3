//! AnimationManager - facade over all orchestration services
//!
//! Owns the registry of every created instance (pooled or standalone) and
//! routes control calls to them. Services are injected through
//! `ManagerServices`; there is no global state.
//!
//! Locking order: an instance lock is never held while calling into the pool,
//! renderer or memory manager hooks that lock instances. Events queued by an
//! instance are dispatched after its lock is released.
//!
//! Unknown ids are no-ops returning false/None.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::core::batch_renderer::{BatchRenderer, FrameReport};
use crate::core::bindings::ElementBindings;
use crate::core::cache_man::CacheManager;
use crate::core::event_bus::SubscriptionId;
use crate::core::instance::{InstanceContext, PlaybackInstance, SharedInstance};
use crate::core::instance_pool::InstancePool;
use crate::core::loader::{LoadError, PayloadFetcher, PayloadLoader};
use crate::core::memory_manager::{MemoryManager, PressureAction, PressureTarget};
use crate::core::perf_monitor::MetricsDisposer;
use crate::core::workers::{TaskKind, TaskOptions, WorkerManager};
use crate::entities::{
    AnimationEngine, AnimationPayload, Clock, Container, IdleDeadline, InstanceConfig, InstanceEvent,
    InstanceEventKind, InstanceState, MemoryProbe, PerformanceMetrics, RendererKind, Viewport,
};

/// Explicitly constructed, process-wide services
#[derive(Clone)]
pub struct ManagerServices {
    pub cache: Arc<CacheManager<AnimationPayload>>,
    pub pool: Arc<InstancePool>,
    pub renderer: Arc<BatchRenderer>,
    pub memory: Arc<MemoryManager>,
    pub workers: Arc<WorkerManager>,
    pub engine: Arc<dyn AnimationEngine>,
    pub fetcher: Arc<dyn PayloadFetcher>,
    pub clock: Arc<dyn Clock>,
    pub viewport: Arc<dyn Viewport>,
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,
}

impl ManagerServices {
    /// Build the standard service set from settings and host bindings
    pub fn from_settings(
        settings: &Settings,
        engine: Arc<dyn AnimationEngine>,
        fetcher: Arc<dyn PayloadFetcher>,
        clock: Arc<dyn Clock>,
        viewport: Arc<dyn Viewport>,
        memory_probe: Option<Arc<dyn MemoryProbe>>,
    ) -> Self {
        let cache = Arc::new(CacheManager::new(
            settings.cache.max_size_bytes as usize,
            settings.cache.ttl_ms,
            Arc::clone(&clock),
        ));
        let pool = Arc::new(InstancePool::new(settings.pool.max_size));
        let renderer = Arc::new(BatchRenderer::new(
            settings.batch.max_batch_size,
            settings.batch.idle_callbacks,
            Arc::clone(&clock),
            Arc::clone(&viewport),
        ));
        let memory = Arc::new(MemoryManager::new(
            &settings.memory,
            Arc::clone(&clock),
            memory_probe.clone(),
        ));
        let workers = Arc::new(WorkerManager::from_settings(&settings.workers));

        Self {
            cache,
            pool,
            renderer,
            memory,
            workers,
            engine,
            fetcher,
            clock,
            viewport,
            memory_probe,
        }
    }
}

/// Aggregate view across all instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total_instances: usize,
    pub active_instances: usize,
    /// Mean of the latest FPS samples of playing instances
    pub average_fps: f64,
    /// MB, as reported by the memory manager
    pub total_memory: f64,
    pub cache_hit_rate: f64,
}

/// What one `tick()` did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    pub advanced: usize,
    /// Intersection-strategy instances loaded this tick
    pub loaded: usize,
    pub frame: FrameReport,
    pub pressure: Option<PressureAction>,
}

/// Instance state captured under its lock
struct Snapshot {
    state: InstanceState,
    loaded: bool,
    payload_bytes: Option<u64>,
}

pub struct AnimationManager {
    services: ManagerServices,
    ctx: InstanceContext,
    instances: Mutex<IndexMap<Uuid, SharedInstance>>,
    bindings: ElementBindings,
    shut_down: AtomicBool,
}

impl AnimationManager {
    /// Create the manager and register it as the memory manager's cleanup target
    pub fn new(services: ManagerServices) -> Arc<Self> {
        let loader = Arc::new(PayloadLoader::new(
            Some(Arc::clone(&services.cache)),
            Arc::clone(&services.fetcher),
        ));
        let ctx = InstanceContext {
            engine: Arc::clone(&services.engine),
            loader,
            clock: Arc::clone(&services.clock),
            memory_probe: services.memory_probe.clone(),
        };

        let manager = Arc::new(Self {
            services,
            ctx,
            instances: Mutex::new(IndexMap::new()),
            bindings: ElementBindings::new(),
            shut_down: AtomicBool::new(false),
        });

        let target: Weak<dyn PressureTarget> = Arc::downgrade(&manager) as Weak<dyn PressureTarget>;
        manager.services.memory.set_target(target);
        manager.services.memory.start_monitoring();
        info!(
            "AnimationManager ready (pool {}, cache {} bytes)",
            manager.services.pool.max_size(),
            manager.services.cache.max_size()
        );
        manager
    }

    pub fn services(&self) -> &ManagerServices {
        &self.services
    }

    pub fn bindings(&self) -> &ElementBindings {
        &self.bindings
    }

    fn registry(&self) -> MutexGuard<'_, IndexMap<Uuid, SharedInstance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<(Uuid, SharedInstance)> {
        self.registry().iter().map(|(id, inst)| (*id, Arc::clone(inst))).collect()
    }

    pub fn instance(&self, id: Uuid) -> Option<SharedInstance> {
        self.registry().get(&id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.registry().keys().copied().collect()
    }

    pub fn instance_state(&self, id: Uuid) -> Option<InstanceState> {
        self.inspect(id, |i| i.state())
    }

    /// Instance attached to a container, via the binding side-table
    pub fn instance_for_element(&self, container: &Container) -> Option<Uuid> {
        self.bindings.instance_for(container)
    }

    /// Read-only access; no events dispatched
    fn inspect<R>(&self, id: Uuid, f: impl FnOnce(&PlaybackInstance) -> R) -> Option<R> {
        let shared = self.instance(id)?;
        let instance = shared.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&instance))
    }

    /// Run a mutation, then dispatch its events and sync pool/memory state
    fn apply<R>(&self, id: Uuid, f: impl FnOnce(&mut PlaybackInstance) -> R) -> Option<R> {
        let shared = self.instance(id)?;
        Some(self.apply_shared(id, &shared, f))
    }

    fn apply_shared<R>(&self, id: Uuid, shared: &SharedInstance, f: impl FnOnce(&mut PlaybackInstance) -> R) -> R {
        let (result, events, deliveries, snapshot) = {
            let mut instance = shared.lock().unwrap_or_else(|e| e.into_inner());
            let result = f(&mut instance);
            let deliveries = instance.take_metrics_deliveries();
            let loaded = instance.is_loaded();
            let payload_bytes = if loaded && !self.services.memory.is_registered(id) {
                instance
                    .payload()
                    .and_then(|p| CacheManager::<AnimationPayload>::estimate_size(p.as_ref()))
                    .map(|b| b as u64)
            } else {
                None
            };
            let snapshot = Snapshot {
                state: instance.state(),
                loaded,
                payload_bytes,
            };
            (result, instance.events().clone(), deliveries, snapshot)
        };
        events.dispatch();
        for delivery in deliveries {
            delivery.deliver();
        }
        self.sync_services(id, &snapshot);
        result
    }

    fn sync_services(&self, id: Uuid, snapshot: &Snapshot) {
        if snapshot.state == InstanceState::Playing {
            self.services.pool.activate(id);
        } else {
            self.services.pool.deactivate(id);
        }
        if let Some(bytes) = snapshot.payload_bytes {
            self.services.memory.register_instance(id, bytes);
        }
        if !snapshot.loaded {
            self.services.memory.unregister_instance(id);
        }
    }

    // ========== Lifecycle ==========

    /// Create an instance and apply its load strategy.
    ///
    /// The instance is always reachable by the returned id; when the pool is
    /// full it simply runs unpooled.
    pub fn create(&self, config: InstanceConfig) -> Uuid {
        let instance = PlaybackInstance::new(config, self.ctx.clone());
        let id = instance.id();
        let name = instance.name().to_string();
        let container = instance.container().cloned();
        let shared = instance.into_shared();

        self.registry().insert(id, Arc::clone(&shared));
        if let Some(container) = &container {
            self.bindings.bind(container, id);
        }
        if !self.services.pool.add(id, Arc::clone(&shared)) {
            warn!(
                "Pool full ({}), '{}' runs standalone",
                self.services.pool.max_size(),
                name
            );
        }

        // Load failures leave the instance in Error and emit DataFailed
        let _ = self.apply_shared(id, &shared, |i| i.init());
        debug!("Created instance {} '{}'", id, name);
        id
    }

    /// Trigger loading (lazy strategy). Ok(false) for unknown ids.
    pub fn load(&self, id: Uuid) -> Result<bool, LoadError> {
        match self.apply(id, |i| i.load()) {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    /// Fetch and parse a payload on the worker pool, then cache it
    pub fn preload(&self, path: &str) -> Result<Arc<AnimationPayload>, LoadError> {
        if let Some(cached) = self.services.cache.get(path) {
            return Ok(cached);
        }
        let text = self
            .services
            .fetcher
            .fetch(path)
            .map_err(|e| LoadError::Fetch(format!("{:#}", e)))?;
        let value = self
            .services
            .workers
            .run(TaskKind::Parse, serde_json::Value::String(text), TaskOptions::default())
            .map_err(|e| LoadError::Parse(e.to_string()))?;
        let payload: AnimationPayload = serde_json::from_value(value).map_err(|e| LoadError::Parse(e.to_string()))?;
        payload.validate()?;

        let payload = Arc::new(payload);
        self.services.cache.set(path, Arc::clone(&payload));
        info!("Preloaded {} ('{}')", path, payload.name());
        Ok(payload)
    }

    pub fn play(&self, id: Uuid) -> bool {
        self.apply(id, |i| i.play()).unwrap_or(false)
    }

    pub fn pause(&self, id: Uuid) -> bool {
        self.apply(id, |i| i.pause()).unwrap_or(false)
    }

    pub fn stop(&self, id: Uuid) -> bool {
        self.apply(id, |i| i.stop()).unwrap_or(false)
    }

    /// Destroy and forget an instance. False for unknown ids.
    pub fn destroy_animation(&self, id: Uuid) -> bool {
        let Some(shared) = self.registry().shift_remove(&id) else {
            return false;
        };
        self.services.renderer.cancel(id);
        self.services.memory.unregister_instance(id);
        self.bindings.unbind_instance(id);
        if !self.services.pool.remove(id) {
            // Standalone
            shared.lock().unwrap_or_else(|e| e.into_inner()).destroy();
        }
        debug!("Destroyed instance {}", id);
        true
    }

    pub fn pause_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|(id, shared)| {
                self.apply_shared(*id, shared, |i| i.state() == InstanceState::Playing && i.pause())
            })
            .count()
    }

    pub fn resume_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|(id, shared)| {
                self.apply_shared(*id, shared, |i| i.state() == InstanceState::Paused && i.play())
            })
            .count()
    }

    // ========== Playback controls ==========

    pub fn set_speed(&self, id: Uuid, speed: f64) -> bool {
        self.apply(id, |i| i.set_speed(speed)).unwrap_or(false)
    }

    pub fn set_direction(&self, id: Uuid, direction: i8) -> bool {
        self.apply(id, |i| i.set_direction(direction)).unwrap_or(false)
    }

    pub fn go_to_and_stop(&self, id: Uuid, frame: f64) -> bool {
        self.apply(id, |i| i.go_to_and_stop(frame)).unwrap_or(false)
    }

    pub fn go_to_and_play(&self, id: Uuid, frame: f64) -> bool {
        self.apply(id, |i| i.go_to_and_play(frame)).unwrap_or(false)
    }

    pub fn play_segments(&self, id: Uuid, segments: &[(f64, f64)], force: bool) -> bool {
        self.apply(id, |i| i.play_segments(segments, force)).unwrap_or(false)
    }

    pub fn resize(&self, id: Uuid) -> bool {
        self.apply(id, |i| i.resize()).unwrap_or(false)
    }

    /// Ok(false) for unknown ids, unchanged renderer, or exhausted switch budget
    pub fn switch_renderer(&self, id: Uuid, renderer: RendererKind) -> Result<bool, LoadError> {
        self.apply(id, |i| i.switch_renderer(renderer)).unwrap_or(Ok(false))
    }

    // ========== Events ==========

    pub fn subscribe<F>(&self, id: Uuid, kind: InstanceEventKind, callback: F) -> Option<SubscriptionId>
    where
        F: Fn(&InstanceEvent) + Send + Sync + 'static,
    {
        self.inspect(id, |i| i.events().subscribe(kind, callback))
    }

    pub fn unsubscribe(&self, id: Uuid, subscription: SubscriptionId) -> bool {
        self.inspect(id, |i| i.events().unsubscribe(subscription)).unwrap_or(false)
    }

    /// Events dispatched since the last poll (bounded queue)
    pub fn poll_events(&self, id: Uuid) -> Vec<InstanceEvent> {
        self.inspect(id, |i| i.events().poll()).unwrap_or_default()
    }

    /// Register a performance-sample callback (instance must be loaded).
    /// Callbacks run after the instance is released and may call back into
    /// the manager.
    pub fn on_metrics<F>(&self, id: Uuid, callback: F) -> Option<MetricsDisposer>
    where
        F: Fn(&PerformanceMetrics) + Send + Sync + 'static,
    {
        let shared = self.instance(id)?;
        let mut instance = shared.lock().unwrap_or_else(|e| e.into_inner());
        instance.monitor_mut().map(|m| m.on_metrics(callback))
    }

    // ========== Stats ==========

    pub fn get_global_stats(&self) -> GlobalStats {
        let mut total = 0;
        let mut active = 0;
        let mut fps_sum = 0.0;
        let mut fps_count = 0;

        for (_, shared) in self.snapshot() {
            let instance = shared.lock().unwrap_or_else(|e| e.into_inner());
            total += 1;
            if instance.is_playing() {
                active += 1;
                if let Some(fps) = instance.metrics().map(|m| m.fps).filter(|fps| *fps > 0.0) {
                    fps_sum += fps;
                    fps_count += 1;
                }
            }
        }

        GlobalStats {
            total_instances: total,
            active_instances: active,
            average_fps: if fps_count > 0 { fps_sum / fps_count as f64 } else { 0.0 },
            total_memory: self.services.memory.get_memory_stats().used_mb,
            cache_hit_rate: self.services.cache.hit_rate(),
        }
    }

    // ========== Scheduling ==========

    /// Host frame callback: load newly visible instances, advance playing
    /// ones, render a batch, poll memory.
    pub fn tick(&self) -> TickReport {
        let now = self.services.clock.now_ms();
        let viewport = Arc::clone(&self.services.viewport);
        let mut report = TickReport::default();

        for (id, shared) in self.snapshot() {
            let (loaded, advanced, priority) = self.apply_shared(id, &shared, |i| {
                let loaded = match i.check_visibility(viewport.as_ref()) {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        debug!("Deferred load of '{}' failed: {}", i.name(), e);
                        false
                    }
                };
                let advanced = i.is_playing();
                if advanced {
                    i.advance(now);
                }
                let priority = i.is_playing().then(|| i.config().priority);
                (loaded, advanced, priority)
            });
            report.loaded += loaded as usize;
            report.advanced += advanced as usize;
            if let Some(priority) = priority {
                self.services.renderer.schedule_render(id, shared, priority);
            }
        }

        if self.services.renderer.frame_requested() {
            report.frame = self.services.renderer.on_frame();
        }
        report.pressure = self.services.memory.tick();
        report
    }

    /// Host idle callback: drain low-priority renders within the deadline
    pub fn idle(&self, deadline: &dyn IdleDeadline) -> usize {
        self.services.renderer.on_idle(deadline)
    }

    /// Sweep expired cache entries and release stopped/errored idle instances
    pub fn optimize(&self) -> usize {
        let expired = self.services.cache.clean_expired();
        let releasable: Vec<Uuid> = self
            .snapshot()
            .into_iter()
            .filter(|(id, shared)| {
                let state = shared.lock().unwrap_or_else(|e| e.into_inner()).state();
                matches!(state, InstanceState::Stopped | InstanceState::Error) && !self.services.pool.is_active(*id)
            })
            .map(|(id, _)| id)
            .collect();
        let released = releasable.into_iter().filter(|id| self.destroy_animation(*id)).count();
        if expired + released > 0 {
            debug!("optimize: {} expired payloads, {} instances released", expired, released);
        }
        expired + released
    }

    /// Destroy everything and stop background services. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.services.memory.stop_monitoring();
        self.services.renderer.clear();
        let ids = self.instance_ids();
        let count = ids.len();
        for id in ids {
            self.destroy_animation(id);
        }
        self.services.pool.clear();
        self.services.workers.shutdown();
        info!("AnimationManager shut down ({} instances destroyed)", count);
    }
}

impl PressureTarget for AnimationManager {
    fn clear_caches(&self) -> usize {
        self.services.cache.clear()
    }

    fn optimize(&self) -> usize {
        AnimationManager::optimize(self)
    }

    fn stop_offscreen(&self) -> usize {
        let viewport = Arc::clone(&self.services.viewport);
        let stopped = self
            .snapshot()
            .into_iter()
            .filter(|(id, shared)| {
                self.apply_shared(*id, shared, |i| i.is_playing() && !i.is_visible(viewport.as_ref()) && i.stop())
            })
            .count();
        if stopped > 0 {
            info!("Stopped {} off-screen instances", stopped);
        }
        stopped
    }

    fn evict_idle(&self, fraction: f64) -> usize {
        let idle = self.services.pool.idle_ids();
        let count = (idle.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let evicted = idle
            .into_iter()
            .take(count)
            .filter(|id| self.destroy_animation(*id))
            .count();
        if evicted > 0 {
            info!("Evicted {} idle instances", evicted);
        }
        evicted
    }
}
