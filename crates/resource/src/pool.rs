//! Resource pools
//!
//! A pool holds the resources eligible for one profile and decides which one
//! an allocation gets. It is plain data: the registry serializes every call
//! under its lock.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::profile::{Profile, ProfileMatch, matches};
use crate::reader::{ReaderDescriptor, ReaderKey};
use crate::resource::{LeaseId, ResourceState};

/// How a pool picks among its free resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Stable order, first free resource wins
    #[default]
    FirstMatch,
    /// Round robin, starting after the last allocated resource
    Cyclic,
    /// Random order
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Allocated(LeaseId),
    Removed(LeaseId),
}

impl From<Slot> for ResourceState {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Free => Self::Free,
            Slot::Allocated(_) => Self::Allocated,
            Slot::Removed(_) => Self::Removed,
        }
    }
}

#[derive(Debug, Clone)]
struct PooledResource {
    key: ReaderKey,
    found: ProfileMatch,
    slot: Slot,
}

/// Snapshot of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Reader name
    pub reader: String,
    /// Plugin name
    pub plugin: String,
    /// Current state
    pub state: ResourceState,
}

/// Resource handed out by [`ResourcePool::try_allocate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Allocated {
    pub(crate) key: ReaderKey,
    pub(crate) power_on_data: Option<Vec<u8>>,
}

/// Outcome of [`ResourcePool::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Released {
    /// Back to free
    Freed,
    /// Hardware was gone, the resource is dropped
    Purged,
}

/// Resources eligible for one profile
#[derive(Debug)]
pub(crate) struct ResourcePool {
    profile: Arc<Profile>,
    resources: Vec<PooledResource>,
    /// Next scan start for cyclic allocation
    cursor: usize,
}

impl ResourcePool {
    pub(crate) const fn new(profile: Arc<Profile>) -> Self {
        Self {
            profile,
            resources: Vec::new(),
            cursor: 0,
        }
    }

    pub(crate) const fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    fn scan_order(&self) -> Vec<usize> {
        let len = self.resources.len();
        match self.profile.strategy() {
            AllocationStrategy::FirstMatch => (0..len).collect(),
            AllocationStrategy::Cyclic => {
                let start = if len == 0 { 0 } else { self.cursor % len };
                (start..len).chain(0..start).collect()
            }
            AllocationStrategy::Random => {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(&mut rand::rng());
                order
            }
        }
    }

    /// Allocate the first free resource in strategy order whose reader is
    /// `available`
    pub(crate) fn try_allocate(
        &mut self,
        lease: LeaseId,
        available: impl Fn(&ReaderKey) -> bool,
    ) -> Option<Allocated> {
        let index = self.scan_order().into_iter().find(|&i| {
            let resource = &self.resources[i];
            resource.slot == Slot::Free && available(&resource.key)
        })?;

        if self.profile.strategy() == AllocationStrategy::Cyclic {
            self.cursor = index + 1;
        }

        let resource = &mut self.resources[index];
        resource.slot = Slot::Allocated(lease);
        Some(Allocated {
            key: resource.key.clone(),
            power_on_data: resource.found.power_on_data.clone(),
        })
    }

    /// Hand back the resource held under `lease`, `None` if this pool does
    /// not hold it
    pub(crate) fn release(&mut self, lease: LeaseId) -> Option<Released> {
        let index = self.resources.iter().position(|resource| {
            matches!(resource.slot, Slot::Allocated(l) | Slot::Removed(l) if l == lease)
        })?;

        match self.resources[index].slot {
            Slot::Removed(_) => {
                self.delete(index);
                Some(Released::Purged)
            }
            _ => {
                self.resources[index].slot = Slot::Free;
                Some(Released::Freed)
            }
        }
    }

    /// Add the reader if it satisfies the profile, returns whether a resource
    /// was added
    ///
    /// A reader already represented keeps its resource; only the extracted
    /// match data is refreshed.
    pub(crate) fn add_if_matches(&mut self, reader: &ReaderDescriptor) -> bool {
        let Some(found) = matches(reader, &self.profile) else {
            return false;
        };

        let key = reader.key();
        if let Some(resource) = self
            .resources
            .iter_mut()
            .find(|resource| resource.key == key && resource.is_live())
        {
            resource.found = found;
            return false;
        }

        self.resources.push(PooledResource {
            key,
            found,
            slot: Slot::Free,
        });
        true
    }

    /// Drop the reader's free resource, or mark an allocated one removed.
    /// Returns whether anything changed.
    pub(crate) fn remove_reader(&mut self, reader: &ReaderKey) -> bool {
        let mut changed = false;
        let mut index = 0;

        while index < self.resources.len() {
            if self.resources[index].key != *reader {
                index += 1;
                continue;
            }
            match self.resources[index].slot {
                Slot::Free => {
                    self.delete(index);
                    changed = true;
                    continue;
                }
                Slot::Allocated(lease) => {
                    self.resources[index].slot = Slot::Removed(lease);
                    changed = true;
                }
                Slot::Removed(_) => {}
            }
            index += 1;
        }

        changed
    }

    /// Whether the pool has a live resource for the reader
    pub(crate) fn is_member(&self, reader: &ReaderKey) -> bool {
        self.resources
            .iter()
            .any(|resource| resource.key == *reader && resource.is_live())
    }

    /// Whether the pool holds any resource for the reader, removed ones
    /// included
    pub(crate) fn references(&self, reader: &ReaderKey) -> bool {
        self.resources.iter().any(|resource| resource.key == *reader)
    }

    pub(crate) fn snapshot(&self) -> Vec<ResourceStatus> {
        self.resources
            .iter()
            .map(|resource| ResourceStatus {
                reader: resource.key.name.clone(),
                plugin: resource.key.plugin.clone(),
                state: resource.slot.into(),
            })
            .collect()
    }

    fn delete(&mut self, index: usize) {
        self.resources.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
    }
}

impl PooledResource {
    const fn is_live(&self) -> bool {
        !matches!(self.slot, Slot::Removed(_))
    }
}
