use super::*;
use crate::{
    memory::{
        page_alloc::FrameAllocator,
        page_directory::CpuFeatures,
    },
    vm::{
        AllocationStrategy,
        fault::{AccessKind, FaultKind, FaultResponse, PageFault},
        registry::KernelRegionSet,
        test_utils::{Mmu, RecordingRegistry, RegistryOp, USER_BASE, anon_object, anon_region, user_range},
    },
};
use proptest::prelude::*;
use std::{sync::mpsc, thread, time::Duration};

fn placed(vmobject: &Arc<VMObject>, range: VirtRange, access: Access, shared: bool) -> Arc<Region> {
    Region::create_placed(
        range,
        vmobject.clone(),
        0,
        Some(String::from("test")),
        access,
        MemoryType::Normal,
        shared,
    )
}

proptest! {
    #[test]
    fn placement_requires_aligned_nonempty_range(base_page in 0x10usize..0x1000, offset in 0usize..PAGE_SIZE, size in 0usize..(8 * PAGE_SIZE)) {
        let alloc = FrameAllocator::new(0);
        let obj = anon_object(&alloc, 8, AllocationStrategy::None);
        let range = VirtRange::new(VA::from_value(base_page * PAGE_SIZE + offset), size);

        let valid = offset == 0 && size > 0 && size % PAGE_SIZE == 0;
        let result = Region::try_create_placed(range, obj.clone(), 0, None, Access::RW, MemoryType::Normal, false);

        prop_assert_eq!(result.is_ok(), valid);
        prop_assert_eq!(obj.region_count(), usize::from(valid));
    }
}

#[test]
fn try_create_placed_reports_the_problem() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);

    let unaligned = VirtRange::new(VA::from_value(USER_BASE + 1), PAGE_SIZE);
    assert_eq!(
        Region::try_create_placed(unaligned, obj.clone(), 0, None, Access::RW, MemoryType::Normal, false)
            .err(),
        Some(KernelError::MappingError(MapError::VirtNotAligned))
    );

    let empty = VirtRange::new(VA::from_value(USER_BASE), 0);
    assert_eq!(
        Region::try_create_placed(empty, obj.clone(), 0, None, Access::RW, MemoryType::Normal, false)
            .err(),
        Some(KernelError::MappingError(MapError::BadSize))
    );
}

#[test]
#[should_panic]
fn create_placed_rejects_partial_pages() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    placed(&obj, VirtRange::new(VA::from_value(USER_BASE), PAGE_SIZE / 2), Access::RW, false);
}

#[test]
fn unplaced_and_unbacked_regions() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 2, AllocationStrategy::None);

    let region = Region::create_unplaced(obj.clone(), 0, None, Access::READ, MemoryType::Normal, false);
    assert!(region.range().is_empty());
    assert_eq!(obj.region_count(), 1);

    region.set_range(user_range(USER_BASE, 2));
    assert_eq!(region.page_count(), 2);

    let unbacked = Region::create_unbacked();
    assert!(unbacked.vmobject().is_none());
    assert_eq!(unbacked.size(), 0);
    assert!(unbacked.try_clone().is_err());
}

#[test]
fn access_bits_are_sticky() {
    let alloc = FrameAllocator::new(0);
    let region = anon_region(&alloc, 1, Access::READ, false);

    assert!(region.has_been_readable());
    assert!(!region.has_been_writable());

    region.set_writable(true);
    region.set_writable(false);
    assert!(!region.is_writable());
    assert!(region.has_been_writable());
    assert_eq!(region.access().current(), Access::READ);
}

#[test]
fn metadata_setters() {
    let alloc = FrameAllocator::new(0);
    let region = anon_region(&alloc, 1, Access::READ, false);

    assert!(region.is_user());
    assert_eq!(region.name(), None);
    region.set_name(Some(String::from("heap")));
    assert_eq!(region.name().as_deref(), Some("heap"));

    region.set_executable(true);
    region.set_readable(false);
    assert_eq!(region.access().current(), Access::EXECUTE);
    assert!(region.has_been_executable());
    assert!(region.has_been_readable());

    region.set_shared(true);
    assert!(region.is_shared());

    region.set_stack(true);
    region.set_syscall_region(true);
    assert_eq!(region.flags(), RegionFlags::STACK | RegionFlags::SYSCALL_REGION);
}

#[test]
fn page_index_translation() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 8, AllocationStrategy::None);
    let region = Region::create_placed(
        user_range(USER_BASE, 2),
        obj,
        3 * PAGE_SIZE,
        None,
        Access::RW,
        MemoryType::Normal,
        false,
    );

    assert_eq!(region.first_page_index(), 3);
    assert_eq!(region.page_index_from_address(VA::from_value(USER_BASE + PAGE_SIZE + 8)), 1);
    assert_eq!(region.translate_to_vmobject_page(1), 4);
    assert_eq!(region.translate_vmobject_page(4), Some(1));
    assert_eq!(region.translate_vmobject_page(2), None);
    assert_eq!(region.translate_vmobject_page(5), None);
}

#[test]
fn map_installs_every_page() {
    let alloc = FrameAllocator::new(1);
    let pd = Arc::new(PageDirectory::new());
    let region = anon_region(&alloc, 3, Access::RW, false);

    region.map(&pd, ShouldFlushTlb::Yes).unwrap();

    let tables = pd.lock();
    assert_eq!(tables.present_entries_in(region.range()), 3);
    assert_eq!(tables.flushes().last(), Some(&region.range()));

    // Shared-zero pages are mapped read-only.
    let pte = tables.translate(VA::from_value(USER_BASE)).unwrap();
    assert_eq!(pte.physical_page_base(), alloc.zero_page_address());
    assert!(!pte.is_writable());
    assert!(pte.is_user_allowed());
    assert!(pte.is_execute_disabled());
}

#[test]
fn map_stops_at_first_failure() {
    let alloc = FrameAllocator::new(0);
    let pd = Arc::new(PageDirectory::new().with_table_budget(1));
    let obj = anon_object(&alloc, 4, AllocationStrategy::None);

    // Straddle an intermediate-table boundary: two pages on each side.
    let base = 2 * ENTRIES_PER_TABLE * PAGE_SIZE - 2 * PAGE_SIZE;
    let region = placed(&obj, user_range(base, 4), Access::RW, false);

    assert_eq!(region.map(&pd, ShouldFlushTlb::Yes).unwrap_err(), KernelError::NoMemory);

    let tables = pd.lock();
    assert_eq!(tables.present_entries_in(region.range()), 2);
    assert!(tables.translate(VA::from_value(base)).is_some());
    assert!(tables.translate(VA::from_value(base + PAGE_SIZE)).is_some());
    assert!(tables.translate(VA::from_value(base + 2 * PAGE_SIZE)).is_none());
    assert_eq!(tables.flushes().last().unwrap().size(), 2 * PAGE_SIZE);
}

#[test]
fn zero_page_region_maps_trivially() {
    let alloc = FrameAllocator::new(0);
    let pd = Arc::new(PageDirectory::new());
    let region = Region::create_unplaced(
        anon_object(&alloc, 1, AllocationStrategy::None),
        0,
        None,
        Access::RW,
        MemoryType::Normal,
        false,
    );

    region.map(&pd, ShouldFlushTlb::Yes).unwrap();
    assert!(pd.lock().flushes().is_empty());
}

#[test]
fn unmap_then_map_round_trip() {
    let alloc = FrameAllocator::new(0);
    let pd = Arc::new(PageDirectory::new());
    let region = anon_region(&alloc, 2, Access::RW, false);

    region.map(&pd, ShouldFlushTlb::Yes).unwrap();
    region.unmap(ShouldFlushTlb::Yes);

    assert!(region.page_directory().is_none());
    {
        let tables = pd.lock();
        assert_eq!(tables.entries_in(region.range()), 0);
        assert_eq!(tables.table_count(), 0);
    }

    region.map(&pd, ShouldFlushTlb::Yes).unwrap();
    assert_eq!(pd.lock().present_entries_in(region.range()), 2);

    // Unmapping an unmapped region does nothing.
    region.unmap(ShouldFlushTlb::Yes);
    region.unmap(ShouldFlushTlb::Yes);
}

#[test]
#[should_panic]
fn map_into_second_directory_panics() {
    let alloc = FrameAllocator::new(0);
    let region = anon_region(&alloc, 1, Access::RW, false);

    region.map(&Arc::new(PageDirectory::new()), ShouldFlushTlb::No).unwrap();
    let _ = region.map(&Arc::new(PageDirectory::new()), ShouldFlushTlb::No);
}

#[test]
#[should_panic]
fn mmap_region_at_kernel_address_panics() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&obj, user_range(KERNEL_BASE, 1), Access::RW, false);
    region.set_mmap(true, true, true);

    let _ = region.map(&Arc::new(PageDirectory::new()), ShouldFlushTlb::No);
}

#[test]
fn kernel_pages_are_not_user_accessible() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&obj, user_range(KERNEL_BASE, 1), Access::RW, false);
    let pd = Arc::new(PageDirectory::new());

    assert!(region.is_kernel());
    region.map(&pd, ShouldFlushTlb::No).unwrap();
    assert!(!pd.lock().translate(VA::from_value(KERNEL_BASE)).unwrap().is_user_allowed());
}

#[test]
fn execute_disable_follows_cpu_support() {
    let alloc = FrameAllocator::new(0);

    let region = anon_region(&alloc, 1, Access::READ, false);
    let pd = Arc::new(PageDirectory::new().with_cpu_features(CpuFeatures { no_execute: false }));
    region.map(&pd, ShouldFlushTlb::No).unwrap();
    assert!(!pd.lock().translate(region.vaddr()).unwrap().is_execute_disabled());

    let data = anon_region(&alloc, 1, Access::READ, false);
    let code = anon_region(&alloc, 1, Access::RX, false);
    let (data_pd, code_pd) = (Arc::new(PageDirectory::new()), Arc::new(PageDirectory::new()));
    data.map(&data_pd, ShouldFlushTlb::No).unwrap();
    code.map(&code_pd, ShouldFlushTlb::No).unwrap();

    assert!(data_pd.lock().translate(data.vaddr()).unwrap().is_execute_disabled());
    assert!(!code_pd.lock().translate(code.vaddr()).unwrap().is_execute_disabled());
}

#[test]
fn prot_none_region_clears_ptes() {
    let alloc = FrameAllocator::new(0);
    let pd = Arc::new(PageDirectory::new());
    let region = anon_region(&alloc, 2, Access::empty(), false);

    region.map(&pd, ShouldFlushTlb::Yes).unwrap();
    assert_eq!(pd.lock().present_entries_in(region.range()), 0);

    region.destroy();
    assert!(region.page_directory().is_none());
}

#[test]
fn mmio_region_maps_device_frames() {
    let alloc = FrameAllocator::new(0);
    let base = PA::from_value(0x900_0000);
    let obj = VMObject::create_mmio(&alloc, base, 2 * PAGE_SIZE).unwrap();
    let region = Region::create_placed(
        user_range(USER_BASE, 2),
        obj,
        0,
        None,
        Access::RW,
        MemoryType::IO,
        false,
    );
    let pd = Arc::new(PageDirectory::new());

    region.map(&pd, ShouldFlushTlb::No).unwrap();
    region.remap();

    let pte = pd.lock().translate(VA::from_value(USER_BASE + PAGE_SIZE)).unwrap();
    assert_eq!(pte.physical_page_base(), base.add_pages(1));
    assert_eq!(pte.memory_type(), MemoryType::IO);
    assert!(pte.is_writable());
}

#[test]
fn clear_to_zero_resets_pages() {
    let alloc = FrameAllocator::new(4);
    let mmu = Mmu::new(&alloc);
    let region = anon_region(&alloc, 2, Access::RW, false);
    region.map(&mmu.page_directory, ShouldFlushTlb::Yes).unwrap();
    mmu.add(&region);

    mmu.write_u8(USER_BASE, 7).unwrap();
    mmu.write_u8(USER_BASE + PAGE_SIZE, 8).unwrap();
    assert_eq!(alloc.allocated_frames(), 2);
    assert_eq!(region.amount_resident(), 2 * PAGE_SIZE);

    region.clear_to_zero();

    assert_eq!(alloc.allocated_frames(), 0);
    assert_eq!(region.amount_resident(), 0);
    assert_eq!(mmu.read_u8(USER_BASE).unwrap(), 0);
    assert_eq!(
        mmu.page_directory
            .lock()
            .translate(VA::from_value(USER_BASE))
            .unwrap()
            .physical_page_base(),
        alloc.zero_page_address()
    );
}

#[test]
fn set_vmobject_moves_registration() {
    let alloc = FrameAllocator::new(0);
    let a = anon_object(&alloc, 1, AllocationStrategy::None);
    let b = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&a, user_range(USER_BASE, 1), Access::RW, false);

    region.set_vmobject(b.clone());
    assert_eq!(a.region_count(), 0);
    assert_eq!(b.region_count(), 1);

    region.set_vmobject(b.clone());
    assert_eq!(b.region_count(), 1);
}

#[test]
fn shared_clone_keeps_object_and_flags() {
    let alloc = FrameAllocator::new(2);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&obj, user_range(USER_BASE, 1), Access::RW, true);
    region.set_mmap(true, true, false);
    region.set_syscall_region(true);

    let clone = region.try_clone().unwrap();

    assert!(Arc::ptr_eq(&clone.vmobject().unwrap(), &obj));
    assert!(clone.is_shared());
    assert!(clone.is_mmap());
    assert!(clone.mmapped_from_readable());
    assert!(!clone.mmapped_from_writable());
    assert!(clone.is_syscall_region());
    assert_eq!(clone.name().as_deref(), Some("test"));
    assert_eq!(clone.range(), region.range());
    assert_eq!(obj.region_count(), 2);
}

#[test]
fn private_clone_write_protects_parent() {
    let alloc = FrameAllocator::new(4);
    let mmu = Mmu::new(&alloc);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&obj, user_range(USER_BASE, 1), Access::RW, false);
    region.set_stack(true);
    region.map(&mmu.page_directory, ShouldFlushTlb::Yes).unwrap();
    mmu.add(&region);

    mmu.write_u8(USER_BASE, 1).unwrap();
    assert!(mmu.page_directory.lock().translate(region.vaddr()).unwrap().is_writable());

    let clone = region.try_clone().unwrap();

    assert!(!Arc::ptr_eq(&clone.vmobject().unwrap(), &obj));
    assert!(clone.is_stack());
    assert!(!mmu.page_directory.lock().translate(region.vaddr()).unwrap().is_writable());
}

#[test]
#[should_panic]
fn shared_clone_of_private_file_mapping_panics() {
    let alloc = FrameAllocator::new(0);
    let inode = crate::vm::test_utils::TestInode::patterned(PAGE_SIZE);
    let obj = VMObject::create_private_inode(&alloc, inode, PAGE_SIZE);
    let region = placed(&obj, user_range(USER_BASE, 1), Access::READ, true);

    let _ = region.try_clone();
}

#[test]
fn kernel_region_leaves_registry_on_destroy() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 1, AllocationStrategy::None);
    let region = placed(&obj, user_range(KERNEL_BASE, 1), Access::RW, false);
    let recorder = Arc::new(RecordingRegistry::default());
    let registry: Arc<dyn KernelRegionRegistry> = recorder.clone();

    region.register_kernel(&registry);
    region.destroy();
    region.destroy();

    assert_eq!(
        *recorder.ops.lock().unwrap(),
        [RegistryOp::Register(region.id()), RegistryOp::Unregister(region.id())]
    );
}

#[test]
fn kernel_region_set_finds_regions() {
    let alloc = FrameAllocator::new(0);
    let set = Arc::new(KernelRegionSet::new());
    let registry: Arc<dyn KernelRegionRegistry> = set.clone();

    let obj = anon_object(&alloc, 2, AllocationStrategy::None);
    let region = placed(&obj, user_range(KERNEL_BASE, 2), Access::RW, false);
    region.register_kernel(&registry);

    let found = set
        .find_region_containing(VA::from_value(KERNEL_BASE + PAGE_SIZE))
        .unwrap();
    assert_eq!(found.id(), region.id());
    drop(found);

    drop(region);
    assert!(set.is_empty());
}

#[test]
fn destroy_unmaps_and_deregisters() {
    let alloc = FrameAllocator::new(2);
    let mmu = Mmu::new(&alloc);
    let obj = anon_object(&alloc, 2, AllocationStrategy::None);
    let region = placed(&obj, user_range(USER_BASE, 2), Access::RW, false);
    region.map(&mmu.page_directory, ShouldFlushTlb::Yes).unwrap();
    mmu.add(&region);
    mmu.write_u8(USER_BASE, 3).unwrap();

    region.destroy();

    assert_eq!(obj.region_count(), 0);
    assert!(region.page_directory().is_none());
    assert_eq!(mmu.page_directory.lock().entries_in(region.range()), 0);

    // Faults arriving after destruction has begun are refused.
    let fault = PageFault::new(region.vaddr(), FaultKind::NotPresent, AccessKind::Read);
    assert_eq!(region.handle_fault(&fault, None), FaultResponse::ShouldCrash);
}

#[test]
fn destroy_waits_for_in_progress_faults() {
    let alloc = FrameAllocator::new(1);
    let pd = Arc::new(PageDirectory::new());
    let region = anon_region(&alloc, 1, Access::RW, false);
    region.map(&pd, ShouldFlushTlb::Yes).unwrap();

    // Stand in for a fault handler that has entered but not yet finished.
    region.fault_counter().fetch_add(1, Ordering::SeqCst);

    let (tx, rx) = mpsc::channel();
    let destroyer = {
        let region = region.clone();
        thread::spawn(move || {
            region.destroy();
            tx.send(()).unwrap();
        })
    };

    while !region.is_dying() {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(50));

    assert!(rx.try_recv().is_err());
    assert_eq!(pd.lock().present_entries_in(region.range()), 1);

    region.fault_counter().fetch_sub(1, Ordering::SeqCst);

    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    destroyer.join().unwrap();
    assert_eq!(pd.lock().present_entries_in(region.range()), 0);
}

#[test]
fn remap_racing_unmap_installs_nothing() {
    let alloc = FrameAllocator::new(0);
    let obj = anon_object(&alloc, 2, AllocationStrategy::None);
    let pd = Arc::new(PageDirectory::new());
    let region = placed(&obj, user_range(USER_BASE, 2), Access::RW, false);
    region.map(&pd, ShouldFlushTlb::Yes).unwrap();

    // The remap reads the binding, then stalls on the page lock.
    let pages = obj.lock_pages();
    let remapper = {
        let region = region.clone();
        thread::spawn(move || region.remap())
    };
    thread::sleep(Duration::from_millis(50));

    region.unmap(ShouldFlushTlb::Yes);
    drop(pages);
    remapper.join().unwrap();

    assert!(region.page_directory().is_none());
    assert_eq!(pd.lock().present_entries_in(region.range()), 0);

    // Remap follows the new binding and leaves the old directory empty.
    let other = Arc::new(PageDirectory::new());
    region.map(&other, ShouldFlushTlb::Yes).unwrap();
    region.remap();
    assert!(region.is_bound_to(&other));
    assert_eq!(pd.lock().present_entries_in(region.range()), 0);
    assert_eq!(other.lock().present_entries_in(region.range()), 2);
}

#[test]
fn shared_file_region_flushes_on_destroy() {
    let alloc = FrameAllocator::new(2);
    let inode = crate::vm::test_utils::TestInode::patterned(PAGE_SIZE);
    let obj = VMObject::create_shared_inode(&alloc, inode.clone(), PAGE_SIZE);
    let mmu = Mmu::new(&alloc);
    let region = placed(&obj, user_range(USER_BASE, 1), Access::RW, true);
    region.map(&mmu.page_directory, ShouldFlushTlb::Yes).unwrap();
    mmu.add(&region);

    mmu.write_u8(USER_BASE + 9, 0x99).unwrap();
    assert_eq!(inode.writes(), 0);

    region.destroy();

    assert_eq!(inode.writes(), 1);
    assert_eq!(inode.contents()[9], 0x99);
}

#[test]
fn failed_flush_does_not_stop_destruction() {
    let alloc = FrameAllocator::new(2);
    let inode = crate::vm::test_utils::TestInode::patterned(PAGE_SIZE);
    let obj = VMObject::create_shared_inode(&alloc, inode.clone(), PAGE_SIZE);
    let mmu = Mmu::new(&alloc);
    let region = placed(&obj, user_range(USER_BASE, 1), Access::RW, true);
    region.map(&mmu.page_directory, ShouldFlushTlb::Yes).unwrap();
    mmu.add(&region);

    mmu.write_u8(USER_BASE, 0x01).unwrap();
    inode.set_read_only(true);

    region.destroy();

    assert_eq!(obj.region_count(), 0);
    assert!(region.page_directory().is_none());
}
