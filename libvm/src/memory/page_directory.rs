//! A software page table.
//!
//! Entries are kept per virtual page. Every [`ENTRIES_PER_TABLE`] pages share
//! one intermediate table, which must be allocated before any entry inside it
//! can exist and which may be reclaimed once all of its entries are released.
//! All access goes through [`PageDirectory::lock`].

use super::{
    address::{PA, VA},
    range::VirtRange,
};
use crate::sync::{SpinLock, SpinLockGuard};
use alloc::{collections::btree_map::BTreeMap, vec::Vec};
use bitflags::bitflags;

/// Number of PTEs covered by one intermediate table.
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const EXECUTE_DISABLE = 1 << 3;
    }
}

/// Caching attribute applied to a mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryType {
    #[default]
    Normal,
    NonCacheable,
    /// Device memory: uncached and strictly ordered.
    IO,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    flags: PteFlags,
    pa: PA,
    memory_type: MemoryType,
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self {
            flags: PteFlags::empty(),
            pa: PA::null(),
            memory_type: MemoryType::Normal,
        }
    }
}

impl PageTableEntry {
    /// Reset the entry to the not-present state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    pub fn set_present(&mut self, value: bool) {
        self.flags.set(PteFlags::PRESENT, value);
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, value: bool) {
        self.flags.set(PteFlags::WRITABLE, value);
    }

    pub fn is_user_allowed(&self) -> bool {
        self.flags.contains(PteFlags::USER)
    }

    pub fn set_user_allowed(&mut self, value: bool) {
        self.flags.set(PteFlags::USER, value);
    }

    pub fn is_execute_disabled(&self) -> bool {
        self.flags.contains(PteFlags::EXECUTE_DISABLE)
    }

    pub fn set_execute_disabled(&mut self, value: bool) {
        self.flags.set(PteFlags::EXECUTE_DISABLE, value);
    }

    pub fn physical_page_base(&self) -> PA {
        self.pa
    }

    pub fn set_physical_page_base(&mut self, pa: PA) {
        debug_assert!(pa.is_page_aligned());
        self.pa = pa;
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn set_memory_type(&mut self, memory_type: MemoryType) {
        self.memory_type = memory_type;
    }
}

/// Features of the processor the tables are built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuFeatures {
    /// The execute-disable PTE bit is honoured.
    pub no_execute: bool,
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self { no_execute: true }
    }
}

/// Page tables of one address space, reachable only through the directory
/// lock.
pub struct PageTables {
    entries: BTreeMap<VA, PageTableEntry>,
    tables: BTreeMap<usize, usize>,
    table_budget: Option<usize>,
    flushes: Vec<VirtRange>,
}

fn table_index(va: VA) -> usize {
    va.page_number() / ENTRIES_PER_TABLE
}

impl PageTables {
    /// Return the entry for `va`, allocating its intermediate table if
    /// needed. Returns `None` if the table cannot be allocated.
    pub fn ensure_pte(&mut self, va: VA) -> Option<&mut PageTableEntry> {
        let va = va.page_aligned();
        let table = table_index(va);

        if !self.tables.contains_key(&table) {
            if self
                .table_budget
                .is_some_and(|budget| self.tables.len() >= budget)
            {
                log::debug!("page table budget exhausted mapping {va}");
                return None;
            }

            self.tables.insert(table, 0);
        }

        if !self.entries.contains_key(&va) {
            self.entries.insert(va, PageTableEntry::default());

            if let Some(live) = self.tables.get_mut(&table) {
                *live += 1;
            }
        }

        self.entries.get_mut(&va)
    }

    /// Release the entry for `va`.
    ///
    /// When `is_last` is set the caller is done releasing entries in this
    /// table, and the table is reclaimed if nothing in it remains.
    pub fn release_pte(&mut self, va: VA, is_last: bool) {
        let va = va.page_aligned();
        let table = table_index(va);

        if self.entries.remove(&va).is_some() {
            if let Some(live) = self.tables.get_mut(&table) {
                *live -= 1;
            }
        }

        if is_last && self.tables.get(&table) == Some(&0) {
            self.tables.remove(&table);
        }
    }

    /// Invalidate cached translations for `range`.
    pub fn flush_tlb(&mut self, range: VirtRange) {
        log::trace!(
            "tlb flush {}..{}",
            range.start_address(),
            range.end_address()
        );
        self.flushes.push(range);
    }

    /// The entry currently installed for `va`, if it is present.
    pub fn translate(&self, va: VA) -> Option<PageTableEntry> {
        self.entries
            .get(&va.page_aligned())
            .filter(|pte| pte.is_present())
            .copied()
    }

    /// The raw entry for `va`, present or not.
    pub fn entry(&self, va: VA) -> Option<&PageTableEntry> {
        self.entries.get(&va.page_aligned())
    }

    /// Number of present entries inside `range`.
    pub fn present_entries_in(&self, range: VirtRange) -> usize {
        if range.is_empty() {
            return 0;
        }

        self.entries
            .range(range.start_address()..range.end_address())
            .filter(|(_, pte)| pte.is_present())
            .count()
    }

    /// Number of entries, present or not, inside `range`.
    pub fn entries_in(&self, range: VirtRange) -> usize {
        if range.is_empty() {
            return 0;
        }

        self.entries
            .range(range.start_address()..range.end_address())
            .count()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Every flush issued so far, oldest first.
    pub fn flushes(&self) -> &[VirtRange] {
        &self.flushes
    }
}

/// The root of an address space's page tables.
pub struct PageDirectory {
    tables: SpinLock<PageTables>,
    features: CpuFeatures,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            tables: SpinLock::new(PageTables {
                entries: BTreeMap::new(),
                tables: BTreeMap::new(),
                table_budget: None,
                flushes: Vec::new(),
            }),
            features: CpuFeatures::default(),
        }
    }

    /// Limit the number of intermediate tables that may exist at once.
    pub fn with_table_budget(self, budget: usize) -> Self {
        self.tables.lock().table_budget = Some(budget);
        self
    }

    pub fn with_cpu_features(mut self, features: CpuFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.features
    }

    pub fn lock(&self) -> SpinLockGuard<'_, PageTables> {
        self.tables.lock()
    }
}
