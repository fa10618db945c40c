//! Per-thread fault accounting.

use core::sync::atomic::{AtomicUsize, Ordering};

/// The thread on whose behalf a fault is being resolved.
///
/// Only used for statistics and for checking the calling context.
pub trait FaultingThread: Send + Sync {
    fn did_zero_fault(&self) {}
    fn did_cow_fault(&self) {}
    fn did_inode_fault(&self) {}

    /// Fault handling may block, so it must never run under the scheduler
    /// lock.
    fn holds_scheduler_lock(&self) -> bool {
        false
    }
}

/// Fault counters kept by a thread.
#[derive(Debug, Default)]
pub struct ThreadFaultCounters {
    zero: AtomicUsize,
    cow: AtomicUsize,
    inode: AtomicUsize,
}

impl ThreadFaultCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zero_faults(&self) -> usize {
        self.zero.load(Ordering::Relaxed)
    }

    pub fn cow_faults(&self) -> usize {
        self.cow.load(Ordering::Relaxed)
    }

    pub fn inode_faults(&self) -> usize {
        self.inode.load(Ordering::Relaxed)
    }
}

impl FaultingThread for ThreadFaultCounters {
    fn did_zero_fault(&self) {
        self.zero.fetch_add(1, Ordering::Relaxed);
    }

    fn did_cow_fault(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    fn did_inode_fault(&self) {
        self.inode.fetch_add(1, Ordering::Relaxed);
    }
}
