//! Tracking of regions mapped into the kernel half of the address space.
//!
//! The registry is handed to each kernel region explicitly rather than being
//! a global, so an address space (or a test) decides which set a region
//! belongs to.

use super::region::{Region, RegionId};
use crate::{memory::address::VA, sync::SpinLock};
use alloc::{
    collections::btree_map::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};

pub trait KernelRegionRegistry: Send + Sync {
    fn register(&self, region: &Arc<Region>);
    fn unregister(&self, region: &Region);
}

/// The set of live kernel regions.
#[derive(Default)]
pub struct KernelRegionSet {
    regions: SpinLock<BTreeMap<RegionId, Weak<Region>>>,
}

impl KernelRegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    pub fn contains(&self, region: &Region) -> bool {
        self.regions.lock().contains_key(&region.id())
    }

    /// Find the registered region covering `addr`, as the trap handler does
    /// for faults taken in kernel space.
    pub fn find_region_containing(&self, addr: VA) -> Option<Arc<Region>> {
        // Upgrade outside the lock: dropping the last reference to a region
        // unregisters it.
        let candidates: Vec<Weak<Region>> = self.regions.lock().values().cloned().collect();

        candidates
            .iter()
            .filter_map(Weak::upgrade)
            .find(|region| region.contains(addr))
    }
}

impl KernelRegionRegistry for KernelRegionSet {
    fn register(&self, region: &Arc<Region>) {
        self.regions
            .lock()
            .insert(region.id(), Arc::downgrade(region));
    }

    fn unregister(&self, region: &Region) {
        self.regions.lock().remove(&region.id());
    }
}
