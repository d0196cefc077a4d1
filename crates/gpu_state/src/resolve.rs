use std::collections::{HashMap, HashSet};

use crate::{
    registry::RegistryGuard,
    state::{Barrier, ResourceId, ResourceState, ResourceStates, Subresource, TransitionBarrier},
    tracker::{PendingTransition, ResourceStateTracker},
};

struct BatchEntry {
    state: ResourceState,
    /// The entry's last change was an implicit promotion from `COMMON` and
    /// nothing else; the resource is back in `COMMON` once the batch is done.
    decays: bool,
}

/// Resolves the pending transitions of a batch of contexts against the
/// registry, in submission order.
///
/// Each context is resolved against the state left by the contexts resolved
/// before it in the same batch, falling back to the registry for resources
/// the batch has not touched yet. Nothing is written to the registry until
/// [`Self::commit`].
pub struct BatchResolver<'a> {
    registry: RegistryGuard<'a>,
    running: HashMap<ResourceId, BatchEntry>,
}

impl<'a> BatchResolver<'a> {
    #[must_use]
    pub fn new(registry: RegistryGuard<'a>) -> Self {
        Self {
            registry,
            running: HashMap::new(),
        }
    }

    fn current(&self, resource: ResourceId) -> &ResourceState {
        match self.running.get(&resource) {
            Some(entry) => &entry.state,
            None => self.registry.find(resource).unwrap_or_else(|| {
                panic!("{resource:?} was transitioned without being registered first")
            }),
        }
    }

    /// Drains the pending transitions of `tracker` and returns the barriers
    /// that have to execute before its command list. Then folds the
    /// tracker's final states into the batch.
    ///
    /// Transitions from `COMMON` to an implicitly promotable state are not
    /// returned.
    ///
    /// ## Panics
    ///
    /// Panics if a pending transition names a resource that is not in the
    /// registry.
    pub fn resolve(&mut self, tracker: &mut ResourceStateTracker) -> Vec<Barrier> {
        let pending = tracker.take_pending();
        let mut barriers = Vec::with_capacity(pending.len());
        let mut promoted = HashSet::new();

        // A whole-resource transition requested after some subresources were
        // touched individually can only be expressed as a single barrier
        // while the resource is uniform. It is issued first and the earlier
        // subresource transitions start from its result.
        let mut rebased = HashMap::new();
        for transition in pending.iter().filter(|t| !t.skip.is_empty()) {
            let current = self.current(transition.resource);
            if !current.has_subresource_states() {
                barriers.push(Barrier::Transition(TransitionBarrier {
                    resource: transition.resource,
                    subresource: Subresource::All,
                    before: current.whole(),
                    after: transition.after,
                    flags: transition.flags,
                }));
                rebased.insert(transition.resource, transition.after);
            }
        }

        for transition in &pending {
            let PendingTransition {
                resource,
                subresource,
                after,
                flags,
                ref skip,
            } = *transition;

            let current = self.current(resource);
            let barrier = |subresource, before| {
                Barrier::Transition(TransitionBarrier {
                    resource,
                    subresource,
                    before,
                    after,
                    flags,
                })
            };

            match subresource {
                Subresource::All if !skip.is_empty() => {
                    if rebased.contains_key(&resource) {
                        continue;
                    }

                    let mut any = false;
                    for (index, before) in current.subresource_states() {
                        if !skip.contains(&index) {
                            barriers.push(barrier(Subresource::Index(index), before));
                            any = true;
                        }
                    }

                    if !any {
                        log::warn!(
                            target: "gpu_state::resolve",
                            "cannot transition the untracked subresources of {resource:?} to {after:?}"
                        );
                    }
                }
                Subresource::All if current.has_subresource_states() => {
                    for (index, before) in current.subresource_states() {
                        barriers.push(barrier(Subresource::Index(index), before));
                    }
                }
                Subresource::All => {
                    let before = current.whole();
                    if before == ResourceStates::COMMON && after.is_implicitly_promotable() {
                        promoted.insert(resource);
                    } else {
                        barriers.push(barrier(Subresource::All, before));
                    }
                }
                Subresource::Index(_) => {
                    let before = rebased
                        .get(&resource)
                        .copied()
                        .unwrap_or_else(|| current.get(subresource));
                    barriers.push(barrier(subresource, before));
                }
            }
        }

        log::trace!(
            target: "gpu_state::resolve",
            "resolved {} pending transitions into {} barriers ({} promoted)",
            pending.len(),
            barriers.len(),
            promoted.len()
        );

        self.fold(tracker, &promoted);
        barriers
    }

    fn fold(&mut self, tracker: &ResourceStateTracker, promoted: &HashSet<ResourceId>) {
        for (resource, local) in tracker.final_states() {
            let registry = &self.registry;
            let entry = self.running.entry(resource).or_insert_with(|| BatchEntry {
                state: registry.find(resource).cloned().unwrap_or_default(),
                decays: false,
            });

            if let Some(whole) = local.whole() {
                entry.state.set(Subresource::All, whole);
            }
            for (index, state) in local.subresource_states() {
                entry.state.set(Subresource::Index(index), state);
            }

            entry.decays = promoted.contains(&resource) && tracker.is_first_touch_only(resource);
        }
    }

    /// The state a resource is in after everything resolved so far.
    #[must_use]
    pub fn state(&self, resource: ResourceId) -> Option<&ResourceState> {
        self.running
            .get(&resource)
            .map(|entry| &entry.state)
            .or_else(|| self.registry.find(resource))
    }

    /// Writes the batch's final states to the registry and releases the lock.
    /// Resources that were only implicitly promoted are recorded as `COMMON`.
    pub fn commit(mut self) {
        for (resource, entry) in self.running.drain() {
            let state = if entry.decays {
                ResourceState::new(ResourceStates::COMMON)
            } else {
                entry.state
            };
            self.registry.set(resource, state);
        }
    }
}
