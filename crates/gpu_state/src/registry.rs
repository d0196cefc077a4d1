//! The process-wide record of each resource's state as of the last committed
//! submission.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};

use crate::state::{ResourceId, ResourceState, ResourceStates};

/// Maps every live resource to its committed state.
///
/// A resource must be registered (usually right after creation) before any
/// context transitions it, and should be removed when it is destroyed.
///
/// Batch resolution takes the lock for the duration of barrier resolution,
/// submission and commit, which makes submissions from different threads
/// totally ordered with respect to state.
#[derive(Default)]
pub struct ResourceStateRegistry {
    states: Mutex<HashMap<ResourceId, ResourceState>>,
}

impl ResourceStateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resource` as being in `state` as a whole, replacing any
    /// previous record.
    ///
    /// Takes the lock, so it must not be called while a [`RegistryGuard`] is
    /// held on the same thread.
    pub fn set_resource_state(&self, resource: ResourceId, state: ResourceStates) {
        self.states.lock().insert(resource, ResourceState::new(state));
    }

    pub fn remove_resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.states.lock().remove(&resource)
    }

    /// A snapshot of the committed state of `resource`.
    #[must_use]
    pub fn find_resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.states.lock().get(&resource).cloned()
    }

    /// Locks the registry. The lock is not reentrant.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            states: self.states.lock(),
        }
    }
}

/// Exclusive access to the registry, released on drop.
pub struct RegistryGuard<'a> {
    states: MutexGuard<'a, HashMap<ResourceId, ResourceState>>,
}

impl RegistryGuard<'_> {
    #[must_use]
    pub fn find(&self, resource: ResourceId) -> Option<&ResourceState> {
        self.states.get(&resource)
    }

    pub fn find_mut(&mut self, resource: ResourceId) -> Option<&mut ResourceState> {
        self.states.get_mut(&resource)
    }

    pub fn set(&mut self, resource: ResourceId, state: ResourceState) {
        self.states.insert(resource, state);
    }

    pub fn remove(&mut self, resource: ResourceId) -> Option<ResourceState> {
        self.states.remove(&resource)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Subresource;

    fn id(raw: usize) -> ResourceId {
        ResourceId::new(raw).unwrap()
    }

    #[test]
    fn register_find_remove() {
        let registry = ResourceStateRegistry::new();
        registry.set_resource_state(id(1), ResourceStates::COPY_DEST);

        assert_eq!(
            registry.find_resource_state(id(1)),
            Some(ResourceState::new(ResourceStates::COPY_DEST))
        );
        assert_eq!(registry.find_resource_state(id(2)), None);

        assert!(registry.remove_resource_state(id(1)).is_some());
        assert_eq!(registry.find_resource_state(id(1)), None);
    }

    #[test]
    fn guard_edits_in_place() {
        let registry = ResourceStateRegistry::new();
        registry.set_resource_state(id(1), ResourceStates::COMMON);

        {
            let mut guard = registry.lock();
            guard
                .find_mut(id(1))
                .unwrap()
                .set(Subresource::Index(3), ResourceStates::RENDER_TARGET);
            assert_eq!(guard.len(), 1);
        }

        let state = registry.find_resource_state(id(1)).unwrap();
        assert_eq!(state.get(Subresource::Index(3)), ResourceStates::RENDER_TARGET);
        assert_eq!(state.whole(), ResourceStates::COMMON);
    }
}
