//! Fakes shared by the VM tests.

use super::{
    fault::{AccessKind, FaultResponse, PageFault},
    object::{AllocationStrategy, VMObject},
    region::{Access, Region, RegionId},
    registry::KernelRegionRegistry,
    thread::ThreadFaultCounters,
};
use crate::{
    error::{IoError, KernelError, Result},
    fs::{Inode, InodeId},
    memory::{
        PAGE_SIZE,
        address::{PA, VA},
        page_alloc::FrameAllocator,
        page_directory::{MemoryType, PageDirectory},
        range::VirtRange,
    },
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub const USER_BASE: usize = 0x40_0000;

/// Faults a single access may take before the MMU gives up.
const MAX_FAULT_RETRIES: usize = 4;

pub fn user_range(base: usize, pages: usize) -> VirtRange {
    VirtRange::new(VA::from_value(base), pages * PAGE_SIZE)
}

pub fn anon_object(
    allocator: &Arc<FrameAllocator>,
    pages: usize,
    strategy: AllocationStrategy,
) -> Arc<VMObject> {
    VMObject::create_anonymous(allocator, pages * PAGE_SIZE, strategy).unwrap()
}

pub fn anon_region(
    allocator: &Arc<FrameAllocator>,
    pages: usize,
    access: Access,
    shared: bool,
) -> Arc<Region> {
    Region::create_placed(
        user_range(USER_BASE, pages),
        anon_object(allocator, pages, AllocationStrategy::None),
        0,
        None,
        access,
        MemoryType::Normal,
        shared,
    )
}

/// An in-memory file that counts the I/O it serves.
pub struct TestInode {
    id: InodeId,
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    read_only: AtomicBool,
    write_limit: AtomicUsize,
    read_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TestInode {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

        Arc::new(Self {
            id: InodeId::from_fsid_and_inodeid(0, NEXT_ID.fetch_add(1, Ordering::Relaxed) as u64),
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            write_limit: AtomicUsize::new(usize::MAX),
            read_hook: Mutex::new(None),
        })
    }

    /// A file of `len` bytes where byte `i` is `i as u8`.
    pub fn patterned(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|i| i as u8).collect())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Accept at most `limit` bytes per `write_bytes` call.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.write_limit
            .store(limit.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Run `hook` once, at the start of the next `read_bytes`, with no
    /// internal lock held. The hook may read from this inode again.
    pub fn on_next_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.read_hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Inode for TestInode {
    fn id(&self) -> InodeId {
        self.id
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let hook = self.read_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(KernelError::Io(IoError::DeviceError));
        }

        let data = self.data.lock().unwrap();
        let offset = offset as usize;

        if offset >= data.len() {
            return Ok(0);
        }

        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);

        Ok(len)
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(KernelError::Io(IoError::ReadOnly));
        }

        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;

        if offset > data.len() {
            return Err(KernelError::Io(IoError::OutOfBounds));
        }

        let buf = &buf[..buf.len().min(self.write_limit.load(Ordering::SeqCst))];

        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }

        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(buf.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOp {
    Register(RegionId),
    Unregister(RegionId),
}

/// A kernel-region registry that records the calls made to it.
#[derive(Default)]
pub struct RecordingRegistry {
    pub ops: Mutex<Vec<RegistryOp>>,
}

impl KernelRegionRegistry for RecordingRegistry {
    fn register(&self, region: &Arc<Region>) {
        self.ops
            .lock()
            .unwrap()
            .push(RegistryOp::Register(region.id()));
    }

    fn unregister(&self, region: &Region) {
        self.ops
            .lock()
            .unwrap()
            .push(RegistryOp::Unregister(region.id()));
    }
}

/// A software MMU: performs loads and stores through a page directory and
/// raises page faults into the owning region like a trap handler would.
pub struct Mmu {
    pub page_directory: Arc<PageDirectory>,
    pub allocator: Arc<FrameAllocator>,
    pub thread: ThreadFaultCounters,
    regions: Mutex<Vec<Arc<Region>>>,
}

impl Mmu {
    pub fn new(allocator: &Arc<FrameAllocator>) -> Self {
        Self::with_page_directory(allocator, Arc::new(PageDirectory::new()))
    }

    pub fn with_page_directory(
        allocator: &Arc<FrameAllocator>,
        page_directory: Arc<PageDirectory>,
    ) -> Self {
        Self {
            page_directory,
            allocator: allocator.clone(),
            thread: ThreadFaultCounters::new(),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Make `region` visible to the fault path. Does not map it.
    pub fn add(&self, region: &Arc<Region>) {
        self.regions.lock().unwrap().push(region.clone());
    }

    fn region_for(&self, va: VA) -> Option<Arc<Region>> {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|region| region.contains(va))
            .cloned()
    }

    /// Translate `va` for `access`, resolving faults on the way.
    pub fn access(&self, va: VA, access: AccessKind) -> std::result::Result<PA, FaultResponse> {
        for _ in 0..MAX_FAULT_RETRIES {
            let pte = self.page_directory.lock().translate(va);

            let allowed = pte.is_some_and(|pte| match access {
                AccessKind::Read => true,
                AccessKind::Write => pte.is_writable(),
                AccessKind::Execute => !pte.is_execute_disabled(),
            });

            if let (true, Some(pte)) = (allowed, pte) {
                return Ok(pte.physical_page_base().add_bytes(va.page_offset()));
            }

            let fault = PageFault::from_access_only(va, access, &self.page_directory);
            let Some(region) = self.region_for(va) else {
                return Err(FaultResponse::ShouldCrash);
            };

            match region.handle_fault(&fault, Some(&self.thread)) {
                FaultResponse::Continue => continue,
                response => return Err(response),
            }
        }

        panic!("{access:?} access to {va} still faulting after {MAX_FAULT_RETRIES} attempts");
    }

    pub fn read_u8(&self, va: usize) -> std::result::Result<u8, FaultResponse> {
        let pa = self.access(VA::from_value(va), AccessKind::Read)?;
        let mut byte = [0];
        self.allocator.read_phys(pa, &mut byte);
        Ok(byte[0])
    }

    pub fn write_u8(&self, va: usize, value: u8) -> std::result::Result<(), FaultResponse> {
        let pa = self.access(VA::from_value(va), AccessKind::Write)?;
        self.allocator.write_phys(pa, &[value]);
        Ok(())
    }

    /// Read a whole page starting at page-aligned `va`.
    pub fn read_page(&self, va: usize) -> std::result::Result<Vec<u8>, FaultResponse> {
        assert_eq!(va % PAGE_SIZE, 0);

        let pa = self.access(VA::from_value(va), AccessKind::Read)?;
        let mut buf = vec![0; PAGE_SIZE];
        self.allocator.read_phys(pa, &mut buf);
        Ok(buf)
    }

    pub fn fetch(&self, va: usize) -> std::result::Result<(), FaultResponse> {
        self.access(VA::from_value(va), AccessKind::Execute)
            .map(|_| ())
    }
}
