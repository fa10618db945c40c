//! Regions, the VM objects backing them, and page-fault resolution.

pub mod arch;
pub mod fault;
pub mod object;
pub mod region;
pub mod registry;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_utils;

pub use fault::{AccessKind, FaultKind, FaultResponse, PageFault};
pub use object::{AllocationStrategy, VMObject};
pub use region::{Access, Region, RegionFlags, ShouldFlushTlb};
pub use registry::{KernelRegionRegistry, KernelRegionSet};
pub use thread::{FaultingThread, ThreadFaultCounters};
