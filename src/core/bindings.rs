//! Element → instance side-table for framework bindings
//!
//! Directive-style bindings look up "the animation attached to this element"
//! here instead of storing anything on the element itself.

use std::collections::HashMap;
use std::sync::Mutex;

use log::trace;
use uuid::Uuid;

use crate::entities::Container;

#[derive(Debug, Default)]
pub struct ElementBindings {
    map: Mutex<HashMap<Uuid, Uuid>>,
}

impl ElementBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instance to a container. Returns the instance it replaced.
    pub fn bind(&self, container: &Container, instance_id: Uuid) -> Option<Uuid> {
        trace!("bind {} -> {}", container.label(), instance_id);
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container.id(), instance_id)
    }

    pub fn unbind(&self, container: &Container) -> Option<Uuid> {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).remove(&container.id())
    }

    /// Drop every binding pointing at an instance (it was destroyed)
    pub fn unbind_instance(&self, instance_id: Uuid) -> usize {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, bound| *bound != instance_id);
        before - map.len()
    }

    pub fn instance_for(&self, container: &Container) -> Option<Uuid> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&container.id())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
