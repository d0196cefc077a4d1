//! Resource identities, states and barrier descriptions.
//!
//! State and flag bit values match their D3D12 counterparts so that the
//! D3D12 backend can pass them through unchanged.

use std::{collections::BTreeMap, num::NonZeroUsize};

/// Opaque identity of a GPU resource.
///
/// The backend decides what the value means (the D3D12 backend uses the
/// address of the `ID3D12Resource`). It is only a key: holding a
/// `ResourceId` does not keep the resource alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(NonZeroUsize);

impl ResourceId {
    /// Returns `None` for 0.
    #[must_use]
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    #[must_use]
    pub fn raw(self) -> usize {
        self.0.get()
    }
}

bitflags::bitflags! {
    /// The access mode(s) a resource is validated for on the GPU timeline.
    #[derive(Default)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const RAYTRACING_ACCELERATION_STRUCTURE = 0x40_0000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits
            | Self::INDEX_BUFFER.bits
            | Self::NON_PIXEL_SHADER_RESOURCE.bits
            | Self::PIXEL_SHADER_RESOURCE.bits
            | Self::INDIRECT_ARGUMENT.bits
            | Self::COPY_SOURCE.bits;
        const PRESENT = 0;
    }
}

impl ResourceStates {
    /// States a resource enters from `COMMON` on first GPU access without an
    /// explicit barrier, and decays back from once `ExecuteCommandLists`
    /// completes.
    const IMPLICITLY_PROMOTABLE: [Self; 8] = [
        Self::COPY_DEST,
        Self::COPY_SOURCE,
        Self::VERTEX_AND_CONSTANT_BUFFER,
        Self::INDEX_BUFFER,
        Self::INDIRECT_ARGUMENT,
        Self::NON_PIXEL_SHADER_RESOURCE,
        Self::PIXEL_SHADER_RESOURCE,
        Self::GENERIC_READ,
    ];

    /// Whether a `COMMON -> self` transition is performed implicitly by the
    /// driver. Only exact matches count; combinations of promotable states
    /// other than `GENERIC_READ` are not promoted.
    #[must_use]
    pub fn is_implicitly_promotable(self) -> bool {
        Self::IMPLICITLY_PROMOTABLE.contains(&self)
    }
}

/// Which part of a resource a transition applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Subresource {
    #[default]
    All,
    Index(u32),
}

/// The tracked state of one resource: a whole-resource state plus sparse
/// per-subresource overrides.
///
/// While the override map is non-empty, the whole-resource state only applies
/// to subresources that are not in the map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceState {
    whole: ResourceStates,
    subresources: BTreeMap<u32, ResourceStates>,
}

impl ResourceState {
    #[must_use]
    pub fn new(state: ResourceStates) -> Self {
        Self {
            whole: state,
            subresources: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn whole(&self) -> ResourceStates {
        self.whole
    }

    #[must_use]
    pub fn has_subresource_states(&self) -> bool {
        !self.subresources.is_empty()
    }

    /// Iterates over the per-subresource overrides in index order.
    pub fn subresource_states(&self) -> impl Iterator<Item = (u32, ResourceStates)> + '_ {
        self.subresources.iter().map(|(index, state)| (*index, *state))
    }

    /// The state of `subresource`, falling back to the whole-resource state
    /// for subresources without an override.
    #[must_use]
    pub fn get(&self, subresource: Subresource) -> ResourceStates {
        match subresource {
            Subresource::All => self.whole,
            Subresource::Index(index) => self.subresources.get(&index).copied().unwrap_or(self.whole),
        }
    }

    /// Sets the state of `subresource`. `Subresource::All` discards every
    /// override.
    pub fn set(&mut self, subresource: Subresource, state: ResourceStates) {
        match subresource {
            Subresource::All => {
                self.whole = state;
                self.subresources.clear();
            }
            Subresource::Index(index) => {
                self.subresources.insert(index, state);
            }
        }
    }
}

bitflags::bitflags! {
    /// Split-barrier flags.
    #[derive(Default)]
    pub struct BarrierFlags: u32 {
        const NONE = 0;
        const BEGIN_ONLY = 0x1;
        const END_ONLY = 0x2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub resource: ResourceId,
    pub subresource: Subresource,
    pub before: ResourceStates,
    pub after: ResourceStates,
    pub flags: BarrierFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Transition(TransitionBarrier),
    /// Orders unordered-access writes. `None` applies to every UAV access.
    UnorderedAccess(Option<ResourceId>),
    Aliasing {
        before: Option<ResourceId>,
        after: Option<ResourceId>,
    },
}

impl Barrier {
    #[must_use]
    pub fn transition(
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Self {
        Self::Transition(TransitionBarrier {
            resource,
            subresource,
            before,
            after,
            flags: BarrierFlags::NONE,
        })
    }

    #[must_use]
    pub fn as_transition(&self) -> Option<&TransitionBarrier> {
        match self {
            Self::Transition(transition) => Some(transition),
            _ => None,
        }
    }
}
