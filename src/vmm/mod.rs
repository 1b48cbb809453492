//! Virtual memory builder: constructs 4-level (48-bit) and 5-level (57-bit)
//! page tables for the kernel to be handed over into.
//!
//! Grounded in `original_source/Loader/VirtualMemory.cpp`'s `table_at`/
//! `do_map_page`/`map_page(s)`/`map_huge_page(s)`/`map_critical_*`, and in
//! the teacher's `x86/paging/page_table/mod.rs` for the
//! `modular_bitfield`-based entry/flags encoding.
//!
//! **Fix, not replication**: the original's `map_pages`/`map_huge_pages`
//! advance `virtual_base` by the page size *twice* per loop iteration and
//! never advance `physical_base` at all, so every mapped page after the
//! first aliases the same physical frame two virtual pages further along
//! than intended. Both cursors here advance by exactly one page (or huge
//! page) per iteration.

use modular_bitfield::bitfield;
use modular_bitfield::prelude::{B3, B51};

use crate::firmware::Memory;
use crate::mem::map::RangeKind;
use crate::mem::{PhyAddr, VirtAddr, HUGE_PAGE_SIZE, PAGE_SIZE};

const ENTRIES_PER_TABLE: usize = 512;

/// Flags stored alongside the physical address in every page table entry.
///
/// Field layout grounded on the teacher's `PageTableFlags`
/// (`x86/paging/page_table/mod.rs`); this crate only ever sets `present`,
/// `write` and `huge_page`, but keeps the full 64-bit layout so a stored
/// entry round-trips through [`PageTableFlags::from`] without losing the
/// reserved/protection-key bits a later page-table consumer might set.
#[bitfield]
#[derive(Clone, Copy)]
#[repr(u64)]
pub struct PageTableFlags {
    pub present: bool,
    pub write: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge_page: bool,
    pub global: bool,
    #[skip]
    __: B51,
    pub pke: B3,
    pub nxe: bool,
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A set of paging structures rooted at a physical page.
///
/// Grounded on the original's `PageTable { u64* root; size_t levels; }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTable {
    pub root: PhyAddr,
    /// 4 (48-bit addressing) or 5 (57-bit, with the top-level PML5).
    pub levels: u8,
}

impl PageTable {
    #[must_use]
    pub fn new(root: PhyAddr, levels: u8) -> Self {
        debug_assert!(levels == 4 || levels == 5);
        Self { root, levels }
    }
}

unsafe fn read_entry(table: PhyAddr, index: usize) -> u64 {
    debug_assert!(index < ENTRIES_PER_TABLE);
    table.as_mut_ptr::<u64>().add(index).read()
}

unsafe fn write_entry(table: PhyAddr, index: usize, value: u64) {
    debug_assert!(index < ENTRIES_PER_TABLE);
    table.as_mut_ptr::<u64>().add(index).write(value);
}

/// Descends one level: returns the physical address of the child table at
/// `index` within `table`, allocating and zeroing a fresh one from `memory`
/// if none is present yet.
///
/// Panics if the entry at `index` is present but marked as a huge-page leaf
/// — walking further down from a leaf is a programming error, not a
/// recoverable condition, matching the original's `ASSERT(!(entry &
/// PAGE_HUGE))`.
fn table_at(table: PhyAddr, index: usize, memory: &mut dyn Memory) -> Option<PhyAddr> {
    // SAFETY: `table` is always either the caller-supplied page table root
    // or a table physical address this function itself allocated and
    // zeroed below; the loader runs with an identity mapping covering all
    // firmware-reported RAM.
    let raw = unsafe { read_entry(table, index) };
    let flags = PageTableFlags::from(raw & !ADDR_MASK);

    if flags.present() {
        if flags.huge_page() {
            crate::loader_panic!("vmm: attempted to descend through a huge-page leaf entry");
        }
        return Some(PhyAddr::new(raw & ADDR_MASK));
    }

    let page = memory.allocate_pages(1, PhyAddr::new(u64::MAX), RangeKind::KernelBinary, false)?;

    // SAFETY: `page` was just allocated exclusively for this table and is
    // identity-accessible, as above.
    unsafe {
        core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }

    let entry_flags = PageTableFlags::new().with_present(true).with_write(true);
    let entry = page.as_u64() | u64::from(entry_flags);

    // SAFETY: see above.
    unsafe {
        write_entry(table, index, entry);
    }

    Some(page)
}

fn do_map_page(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr, huge: bool) -> bool {
    let lvl5_index = virt.index_bits(48);
    let lvl4_index = virt.index_bits(39);
    let lvl3_index = virt.index_bits(30);
    let lvl2_index = virt.index_bits(21);
    let lvl1_index = virt.index_bits(12);

    let lvl4_table = if pt.levels == 5 {
        match table_at(pt.root, lvl5_index, memory) {
            Some(table) => table,
            None => return false,
        }
    } else {
        pt.root
    };

    let lvl3_table = match table_at(lvl4_table, lvl4_index, memory) {
        Some(table) => table,
        None => return false,
    };
    let lvl2_table = match table_at(lvl3_table, lvl3_index, memory) {
        Some(table) => table,
        None => return false,
    };

    let leaf_flags = PageTableFlags::new().with_present(true).with_write(true).with_huge_page(huge);
    let entry = phys.as_u64() | u64::from(leaf_flags);

    if huge {
        // SAFETY: see `table_at`.
        unsafe { write_entry(lvl2_table, lvl2_index, entry) };
        return true;
    }

    let lvl1_table = match table_at(lvl2_table, lvl2_index, memory) {
        Some(table) => table,
        None => return false,
    };

    // SAFETY: see `table_at`.
    unsafe { write_entry(lvl1_table, lvl1_index, entry) };
    true
}

/// Maps one 4 KiB page.
pub fn map_page(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr) -> bool {
    do_map_page(pt, memory, virt, phys, false)
}

/// Maps `pages` consecutive 4 KiB pages, advancing both the virtual and
/// physical cursor by exactly one page size each iteration.
pub fn map_pages(pt: &PageTable, memory: &mut dyn Memory, mut virt: VirtAddr, mut phys: PhyAddr, pages: usize) -> bool {
    for _ in 0..pages {
        if !do_map_page(pt, memory, virt, phys, false) {
            return false;
        }
        virt += PAGE_SIZE;
        phys += PAGE_SIZE;
    }
    true
}

/// Maps one 2 MiB huge page.
pub fn map_huge_page(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr) -> bool {
    do_map_page(pt, memory, virt, phys, true)
}

/// Maps `pages` consecutive 2 MiB huge pages, advancing both cursors by
/// exactly one huge-page size each iteration.
pub fn map_huge_pages(pt: &PageTable, memory: &mut dyn Memory, mut virt: VirtAddr, mut phys: PhyAddr, pages: usize) -> bool {
    for _ in 0..pages {
        if !do_map_page(pt, memory, virt, phys, true) {
            return false;
        }
        virt += HUGE_PAGE_SIZE;
        phys += HUGE_PAGE_SIZE;
    }
    true
}

/// Maps one 4 KiB page, halting the machine if the Memory Manager is out of
/// pages for a new table level.
pub fn map_critical_page(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr) {
    if !map_page(pt, memory, virt, phys) {
        crate::unrecoverable!("out of memory while mapping critical page at {virt} (physical {phys})");
    }
}

pub fn map_critical_pages(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr, pages: usize) {
    if !map_pages(pt, memory, virt, phys, pages) {
        crate::unrecoverable!("out of memory while mapping {pages} critical pages at {virt} (physical {phys})");
    }
}

pub fn map_critical_huge_page(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr) {
    if !map_huge_page(pt, memory, virt, phys) {
        crate::unrecoverable!("out of memory while mapping critical huge page at {virt} (physical {phys})");
    }
}

pub fn map_critical_huge_pages(pt: &PageTable, memory: &mut dyn Memory, virt: VirtAddr, phys: PhyAddr, pages: usize) {
    if !map_huge_pages(pt, memory, virt, phys, pages) {
        crate::unrecoverable!("out of memory while mapping {pages} critical huge pages at {virt} (physical {phys})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::map::CopyMapOutcome;
    use crate::protocol::MemoryMapEntry;
    use alloc::vec;
    use alloc::vec::Vec;

    struct FakeMemory {
        scratch: Vec<u8>,
        next_free: usize,
    }

    impl FakeMemory {
        fn new(pages: usize) -> Self {
            Self { scratch: vec![0u8; pages * PAGE_SIZE as usize], next_free: 0 }
        }

        fn base(&self) -> u64 {
            self.scratch.as_ptr() as u64
        }
    }

    impl Memory for FakeMemory {
        fn allocate_pages(&mut self, count: usize, _upper_limit: PhyAddr, _kind: RangeKind, _top_down: bool) -> Option<PhyAddr> {
            let bytes = count * PAGE_SIZE as usize;
            if self.next_free + bytes > self.scratch.len() {
                return None;
            }
            let addr = self.base() + self.next_free as u64;
            self.next_free += bytes;
            Some(PhyAddr::new(addr))
        }

        fn allocate_pages_at(&mut self, _address: PhyAddr, count: usize, kind: RangeKind) -> Option<PhyAddr> {
            self.allocate_pages(count, PhyAddr::new(u64::MAX), kind, false)
        }

        fn free_pages(&mut self, _address: PhyAddr, _count: usize) {}

        fn copy_map(&self, _into: &mut [MemoryMapEntry]) -> CopyMapOutcome {
            CopyMapOutcome::Copied { key: 0 }
        }

        fn handover(&mut self, _key: u64) -> bool {
            true
        }
    }

    fn fresh_table(memory: &mut FakeMemory, levels: u8) -> PageTable {
        let root = memory.allocate_pages(1, PhyAddr::new(u64::MAX), RangeKind::KernelBinary, false).unwrap();
        unsafe { core::ptr::write_bytes(root.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
        PageTable::new(root, levels)
    }

    fn leaf_entry(pt: &PageTable, memory: &mut FakeMemory, virt: VirtAddr, huge: bool) -> u64 {
        let lvl4 = if pt.levels == 5 {
            table_at(pt.root, virt.index_bits(48), memory).unwrap()
        } else {
            pt.root
        };
        let lvl3 = table_at(lvl4, virt.index_bits(39), memory).unwrap();
        let lvl2 = table_at(lvl3, virt.index_bits(30), memory).unwrap();
        if huge {
            return unsafe { read_entry(lvl2, virt.index_bits(21)) };
        }
        let lvl1 = table_at(lvl2, virt.index_bits(21), memory).unwrap();
        unsafe { read_entry(lvl1, virt.index_bits(12)) }
    }

    #[test]
    fn maps_a_single_page_and_sets_present_write_bits() {
        let mut memory = FakeMemory::new(16);
        let pt = fresh_table(&mut memory, 4);
        let virt = VirtAddr::new(0x1234_5000);
        let phys = PhyAddr::new(0xAB00_0000);

        assert!(map_page(&pt, &mut memory, virt, phys));

        let entry = leaf_entry(&pt, &mut memory, virt, false);
        assert_eq!(entry & ADDR_MASK, phys.as_u64());
        let flags = PageTableFlags::from(entry & !ADDR_MASK);
        assert!(flags.present());
        assert!(flags.write());
        assert!(!flags.huge_page());
    }

    #[test]
    fn map_pages_advances_both_cursors_exactly_once_per_page() {
        let mut memory = FakeMemory::new(32);
        let pt = fresh_table(&mut memory, 4);
        let virt_base = VirtAddr::new(0x2000_0000);
        let phys_base = PhyAddr::new(0x9000_0000);

        assert!(map_pages(&pt, &mut memory, virt_base, phys_base, 4));

        for i in 0..4u64 {
            let virt = virt_base + i * PAGE_SIZE;
            let entry = leaf_entry(&pt, &mut memory, virt, false);
            let mapped_phys = entry & ADDR_MASK;
            assert_eq!(mapped_phys, phys_base.as_u64() + i * PAGE_SIZE, "page {i} mapped to wrong physical address");
        }
    }

    #[test]
    fn map_huge_pages_advances_both_cursors_by_huge_page_size() {
        let mut memory = FakeMemory::new(32);
        let pt = fresh_table(&mut memory, 4);
        let virt_base = VirtAddr::new(0x4000_0000);
        let phys_base = PhyAddr::new(0x1_0000_0000);

        assert!(map_huge_pages(&pt, &mut memory, virt_base, phys_base, 3));

        for i in 0..3u64 {
            let virt = virt_base + i * HUGE_PAGE_SIZE;
            let entry = leaf_entry(&pt, &mut memory, virt, true);
            let mapped_phys = entry & ADDR_MASK;
            assert_eq!(mapped_phys, phys_base.as_u64() + i * HUGE_PAGE_SIZE, "huge page {i} mapped to wrong physical address");
            let flags = PageTableFlags::from(entry & !ADDR_MASK);
            assert!(flags.huge_page());
        }
    }

    #[test]
    fn five_level_paging_descends_through_the_extra_pml5_table() {
        let mut memory = FakeMemory::new(16);
        let pt = fresh_table(&mut memory, 5);
        let virt = VirtAddr::new(0x0001_0000_0000_0000);
        let phys = PhyAddr::new(0x2000_0000);

        assert!(map_page(&pt, &mut memory, virt, phys));
        let entry = leaf_entry(&pt, &mut memory, virt, false);
        assert_eq!(entry & ADDR_MASK, phys.as_u64());
    }

    #[test]
    #[should_panic(expected = "unrecoverable error")]
    fn descending_through_a_huge_leaf_panics() {
        let mut memory = FakeMemory::new(16);
        let pt = fresh_table(&mut memory, 4);
        let virt = VirtAddr::new(0x4000_0000);

        assert!(map_huge_page(&pt, &mut memory, virt, PhyAddr::new(0x1000_0000)));
        // `virt` is already mapped as a 2 MiB leaf at the lvl2 slot; mapping
        // a 4 KiB page at the same address must walk one level further and
        // hit that leaf where it expects a table.
        map_page(&pt, &mut memory, virt, PhyAddr::new(0x2000_0000));
    }
}
