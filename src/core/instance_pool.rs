//! Capacity-bounded registry of playback instances
//!
//! Structure:
//! - `instances`: IndexMap<Uuid, SharedInstance> (registration order)
//! - `active` / `idle`: disjoint id sets, every pooled id is in exactly one
//!
//! New entries start idle. Eviction here is purely capacity-driven: `add()`
//! beyond `max_size` is refused. Pressure eviction is requested by the memory
//! manager through `clean_idle()`.
//!
//! Instances are destroyed after the pool lock is released, so destroy hooks
//! never run while the pool is locked.

use std::collections::HashSet;
use std::sync::Mutex;

use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};
use serde::Serialize;
use uuid::Uuid;

use crate::core::instance::SharedInstance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    /// High-water mark of `total`, never decreases
    pub peak: usize,
}

#[derive(Default)]
struct PoolState {
    instances: IndexMap<Uuid, SharedInstance>,
    active: HashSet<Uuid>,
    idle: IndexSet<Uuid>,
    peak: usize,
}

impl PoolState {
    fn take(&mut self, id: &Uuid) -> Option<SharedInstance> {
        let instance = self.instances.shift_remove(id)?;
        self.active.remove(id);
        self.idle.shift_remove(id);
        Some(instance)
    }
}

pub struct InstancePool {
    state: Mutex<PoolState>,
    max_size: usize,
}

impl InstancePool {
    pub fn new(max_size: usize) -> Self {
        debug!("InstancePool created: max_size={}", max_size);
        Self {
            state: Mutex::new(PoolState::default()),
            max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an instance as idle. False if the pool is full or the id is
    /// already pooled.
    pub fn add(&self, id: Uuid, instance: SharedInstance) -> bool {
        let mut state = self.lock();
        if state.instances.contains_key(&id) {
            return false;
        }
        if state.instances.len() >= self.max_size {
            debug!("InstancePool full ({}), refusing {}", self.max_size, id);
            return false;
        }
        state.instances.insert(id, instance);
        state.idle.insert(id);
        state.peak = state.peak.max(state.instances.len());
        trace!("InstancePool: added {} (total {})", id, state.instances.len());
        true
    }

    /// Move id to the active set. False for unknown ids.
    pub fn activate(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.instances.contains_key(&id) {
            return false;
        }
        state.idle.shift_remove(&id);
        state.active.insert(id);
        true
    }

    /// Move id to the idle set. False for unknown ids.
    pub fn deactivate(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.instances.contains_key(&id) {
            return false;
        }
        state.active.remove(&id);
        state.idle.insert(id);
        true
    }

    /// Destroy and unregister. False if the id is not pooled.
    pub fn remove(&self, id: Uuid) -> bool {
        let taken = self.lock().take(&id);
        match taken {
            Some(instance) => {
                destroy_instance(id, &instance);
                debug!("InstancePool: removed {}", id);
                true
            }
            None => false,
        }
    }

    /// Destroy up to `count` idle instances (all when None).
    ///
    /// Returns the removed ids. Longest-idle entries go first.
    pub fn clean_idle(&self, count: Option<usize>) -> Vec<Uuid> {
        let removed: Vec<(Uuid, SharedInstance)> = {
            let mut state = self.lock();
            let n = count.unwrap_or(state.idle.len()).min(state.idle.len());
            let ids: Vec<Uuid> = state.idle.iter().take(n).copied().collect();
            ids.into_iter()
                .filter_map(|id| state.take(&id).map(|inst| (id, inst)))
                .collect()
        };

        for (id, instance) in &removed {
            destroy_instance(*id, instance);
        }
        if !removed.is_empty() {
            debug!("InstancePool: cleaned {} idle instances", removed.len());
        }
        removed.into_iter().map(|(id, _)| id).collect()
    }

    /// Destroy everything (shutdown)
    pub fn clear(&self) -> usize {
        let drained: Vec<(Uuid, SharedInstance)> = {
            let mut state = self.lock();
            state.active.clear();
            state.idle.clear();
            state.instances.drain(..).collect()
        };
        for (id, instance) in &drained {
            destroy_instance(*id, instance);
        }
        drained.len()
    }

    pub fn get(&self, id: Uuid) -> Option<SharedInstance> {
        self.lock().instances.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().instances.contains_key(&id)
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.lock().active.contains(&id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().instances.keys().copied().collect()
    }

    pub fn idle_ids(&self) -> Vec<Uuid> {
        self.lock().idle.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get_stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total: state.instances.len(),
            active: state.active.len(),
            idle: state.idle.len(),
            peak: state.peak,
        }
    }
}

fn destroy_instance(id: Uuid, instance: &SharedInstance) {
    trace!("InstancePool: destroying {}", id);
    instance.lock().unwrap_or_else(|e| e.into_inner()).destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::tests::{test_config, test_context};
    use crate::core::instance::PlaybackInstance;
    use crate::entities::InstanceState;

    fn make(n: usize) -> Vec<(Uuid, SharedInstance)> {
        let (ctx, _, _) = test_context();
        (0..n)
            .map(|i| {
                let instance = PlaybackInstance::new(test_config(&format!("i{}", i)), ctx.clone());
                (instance.id(), instance.into_shared())
            })
            .collect()
    }

    fn assert_partition(pool: &InstancePool) {
        let stats = pool.get_stats();
        assert_eq!(stats.total, stats.active + stats.idle);
        let state = pool.lock();
        for id in state.instances.keys() {
            assert!(state.active.contains(id) ^ state.idle.contains(id));
        }
    }

    #[test]
    fn test_capacity() {
        let pool = InstancePool::new(2);
        let items = make(3);
        assert!(pool.add(items[0].0, items[0].1.clone()));
        assert!(pool.add(items[1].0, items[1].1.clone()));
        assert!(!pool.add(items[2].0, items[2].1.clone()));
        assert!(!pool.add(items[0].0, items[0].1.clone()));

        let stats = pool.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.peak, 2);
        assert!(!pool.contains(items[2].0));
    }

    #[test]
    fn test_activate_deactivate() {
        let pool = InstancePool::new(10);
        let items = make(3);
        for (id, inst) in &items {
            pool.add(*id, inst.clone());
        }

        assert!(pool.activate(items[0].0));
        assert!(pool.activate(items[0].0));
        assert!(pool.activate(items[1].0));
        assert_partition(&pool);
        assert_eq!(pool.get_stats().active, 2);

        assert!(pool.deactivate(items[1].0));
        assert_partition(&pool);
        assert_eq!(pool.get_stats().active, 1);

        assert!(!pool.activate(Uuid::new_v4()));
        assert!(!pool.deactivate(Uuid::new_v4()));
    }

    #[test]
    fn test_remove_destroys_and_is_idempotent() {
        let pool = InstancePool::new(10);
        let items = make(2);
        for (id, inst) in &items {
            pool.add(*id, inst.clone());
        }
        pool.activate(items[0].0);

        assert!(pool.remove(items[0].0));
        assert!(!pool.remove(items[0].0));
        assert!(!pool.remove(Uuid::new_v4()));

        let removed = items[0].1.lock().unwrap();
        assert!(removed.is_destroyed());
        assert_eq!(removed.state(), InstanceState::Idle);
        assert_eq!(pool.get_stats().total, 1);
        assert_partition(&pool);
    }

    #[test]
    fn test_clean_idle_count() {
        let pool = InstancePool::new(10);
        let items = make(5);
        for (id, inst) in &items {
            pool.add(*id, inst.clone());
        }
        pool.activate(items[4].0);

        let removed = pool.clean_idle(Some(2));
        assert_eq!(removed.len(), 2);
        assert_eq!(pool.get_stats().idle, 2);

        // Only two idle left, asking for more removes what is available
        assert_eq!(pool.clean_idle(Some(10)).len(), 2);
        assert_eq!(pool.clean_idle(None).len(), 0);

        let stats = pool.get_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.peak, 5);
    }

    #[test]
    fn test_peak_never_decreases() {
        let pool = InstancePool::new(10);
        let items = make(4);
        for (id, inst) in &items {
            pool.add(*id, inst.clone());
        }
        pool.clean_idle(None);
        assert_eq!(pool.get_stats().peak, 4);
        pool.add(items[0].0, items[0].1.clone());
        assert_eq!(pool.get_stats().peak, 4);
        assert_eq!(pool.clear(), 1);
        assert!(pool.is_empty());
    }
}
