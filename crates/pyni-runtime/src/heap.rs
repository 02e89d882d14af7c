//! Heap handles: generation-checked keys bound to host-managed storage sites.
//!
//! The store is shared by every session of a runtime. One lock covers slot and site maps so a
//! store, load or clear on a site is atomic; the objects themselves remain the object model's
//! concern.

use std::collections::HashMap;

use parking_lot::Mutex;
use pyni_core::handle::next_generation;
use pyni_core::{Handle, HandleKind, ObjectRef, PyniError};
use serde::{Deserialize, Serialize};

/// Host-managed location a heap handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "site", rename_all = "snake_case")]
pub enum StorageSite {
    /// Slot of a host object, e.g. an instance attribute written by an extension type.
    Field { owner: ObjectRef, slot: u32 },
    /// Per-extension module state.
    Module { extension: u32, slot: u32 },
}

impl StorageSite {
    pub fn owner(&self) -> Option<ObjectRef> {
        match self {
            StorageSite::Field { owner, .. } => Some(*owner),
            StorageSite::Module { .. } => None,
        }
    }
}

/// Outcome of [`HeapStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub handle: Handle,
    /// Reference previously held by the site; the caller releases it.
    pub replaced: Option<ObjectRef>,
}

#[derive(Debug)]
struct HeapSlot {
    generation: u32,
    backing: Option<ObjectRef>,
    site: Option<StorageSite>,
}

#[derive(Debug, Default)]
struct HeapSlots {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    sites: HashMap<StorageSite, u32>,
}

impl HeapSlots {
    fn slot(&self, handle: Handle) -> Result<(u32, &HeapSlot), PyniError> {
        if handle.is_null() || handle.kind() != HandleKind::Heap {
            return Err(PyniError::invalid_handle(format!(
                "{handle:?} is not a heap handle"
            )));
        }
        let index = handle.index();
        match self.slots.get(index as usize) {
            Some(slot) if slot.generation == handle.generation() && slot.backing.is_some() => {
                Ok((index, slot))
            }
            _ => Err(PyniError::invalid_handle(format!(
                "{handle:?} no longer refers to its storage site"
            ))),
        }
    }

    fn vacate(&mut self, index: u32) -> Option<ObjectRef> {
        let slot = &mut self.slots[index as usize];
        slot.generation = next_generation(slot.generation);
        let backing = slot.backing.take();
        if let Some(site) = slot.site.take() {
            self.sites.remove(&site);
        }
        self.free.push(index);
        backing
    }
}

/// Process-wide table of heap handles.
#[derive(Debug, Default)]
pub struct HeapStore {
    inner: Mutex<HeapSlots>,
}

impl HeapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `backing` to `site`, taking over the reference. An occupied site is overwritten and
    /// every heap handle issued for its previous value stops resolving.
    pub fn store(&self, site: StorageSite, backing: ObjectRef) -> Result<Stored, PyniError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(&index) = inner.sites.get(&site) {
            let slot = &mut inner.slots[index as usize];
            slot.generation = next_generation(slot.generation);
            let replaced = slot.backing.replace(backing);
            return Ok(Stored {
                handle: Handle::pack(HandleKind::Heap, slot.generation, index),
                replaced,
            });
        }
        let (index, generation) = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.generation = next_generation(slot.generation);
                slot.backing = Some(backing);
                slot.site = Some(site);
                (index, slot.generation)
            }
            None => {
                let index = u32::try_from(inner.slots.len())
                    .map_err(|_| PyniError::invalid_handle("heap handle table exhausted"))?;
                inner.slots.push(HeapSlot {
                    generation: 1,
                    backing: Some(backing),
                    site: Some(site),
                });
                (index, 1)
            }
        };
        inner.sites.insert(site, index);
        Ok(Stored {
            handle: Handle::pack(HandleKind::Heap, generation, index),
            replaced: None,
        })
    }

    /// Backing of a heap handle. The reference stays owned by the store.
    pub fn load(&self, handle: Handle) -> Result<ObjectRef, PyniError> {
        let inner = self.inner.lock();
        let (_, slot) = inner.slot(handle)?;
        slot.backing
            .ok_or_else(|| PyniError::invalid_handle(format!("{handle:?} is empty")))
    }

    pub fn site_of(&self, handle: Handle) -> Option<StorageSite> {
        let inner = self.inner.lock();
        inner.slot(handle).ok().and_then(|(_, slot)| slot.site)
    }

    pub fn lookup_site(&self, site: StorageSite) -> Option<(Handle, ObjectRef)> {
        let inner = self.inner.lock();
        let index = *inner.sites.get(&site)?;
        let slot = &inner.slots[index as usize];
        let backing = slot.backing?;
        Some((
            Handle::pack(HandleKind::Heap, slot.generation, index),
            backing,
        ))
    }

    /// Unbinds a site and returns the reference it held.
    pub fn clear(&self, site: StorageSite) -> Option<ObjectRef> {
        let mut inner = self.inner.lock();
        let index = *inner.sites.get(&site)?;
        inner.vacate(index)
    }

    /// Unbinds the site of a heap handle and returns the reference it held.
    pub fn release(&self, handle: Handle) -> Result<ObjectRef, PyniError> {
        let mut inner = self.inner.lock();
        let (index, _) = inner.slot(handle)?;
        inner
            .vacate(index)
            .ok_or_else(|| PyniError::invalid_handle(format!("{handle:?} is empty")))
    }

    fn vacate_where(&self, matches: impl Fn(&StorageSite) -> bool) -> Vec<ObjectRef> {
        let mut inner = self.inner.lock();
        let mut indices: Vec<u32> = inner
            .sites
            .iter()
            .filter(|(site, _)| matches(site))
            .map(|(_, index)| *index)
            .collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|index| inner.vacate(index))
            .collect()
    }

    /// Unbinds every field site of `owner`; called when the object model drops the owner.
    pub fn release_owner(&self, owner: ObjectRef) -> Vec<ObjectRef> {
        self.vacate_where(|site| site.owner() == Some(owner))
    }

    /// Unbinds every module state slot of one extension.
    pub fn release_extension(&self, extension: u32) -> Vec<ObjectRef> {
        self.vacate_where(|site| {
            matches!(site, StorageSite::Module { extension: id, .. } if *id == extension)
        })
    }

    /// Unbinds every site; used when the runtime shuts down.
    pub fn drain(&self) -> Vec<ObjectRef> {
        let mut inner = self.inner.lock();
        let occupied: Vec<u32> = inner.sites.values().copied().collect();
        occupied
            .into_iter()
            .filter_map(|index| inner.vacate(index))
            .collect()
    }

    /// Number of occupied sites.
    pub fn len(&self) -> usize {
        self.inner.lock().sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
