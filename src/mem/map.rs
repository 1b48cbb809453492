//! Physical memory map: the bootloader's single allocator of physical pages.
//!
//! Grounded on the original loader's `BIOS/BIOSMemoryServices.cpp`: firmware
//! hands over a handful of coarse, possibly-overlapping ranges (from e820 or
//! the UEFI memory map); this module sorts them, reconciles overlaps by
//! "shattering" the lower-priority range around the higher-priority one, and
//! then serves `allocate_top_down`/`allocate_within`/`allocate_at`/
//! `free_pages` out of the reconciled list. A revision key changes on every
//! mutation so a `copy_map`'d snapshot can detect staleness, and `handover`
//! permanently retires the map once the kernel has taken ownership.

use alloc::vec::Vec;

use crate::firmware::Memory;
use crate::loader_panic;
use crate::mem::{page_round_down, page_round_up, PhyAddr, PAGE_SIZE};
use crate::protocol::MemoryMapEntry;

/// Internal classification of a physical range, ordered by reconciliation
/// priority: when two ranges overlap, the one with the higher discriminant
/// wins the overlapping region. The numeric values double as the
/// `MEMORY_TYPE_*` wire codes in the handover protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RangeKind {
    Free = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    Nvs = 4,
    LoaderReclaimable = 5,
    Module = 6,
    KernelStack = 7,
    KernelBinary = 8,
}

impl RangeKind {
    #[must_use]
    pub const fn wire_code(self) -> u64 {
        self as u32 as u64
    }
}

/// Classification as reported directly by firmware, before it is folded into
/// [`RangeKind`]. Firmware never reports the loader-internal kinds
/// (`LoaderReclaimable`, `Module`, `KernelStack`, `KernelBinary`) — those are
/// only ever produced by this crate's own allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareRangeKind {
    Free,
    Reserved,
    AcpiReclaimable,
    Nvs,
}

impl From<FirmwareRangeKind> for RangeKind {
    fn from(kind: FirmwareRangeKind) -> Self {
        match kind {
            FirmwareRangeKind::Free => RangeKind::Free,
            FirmwareRangeKind::Reserved => RangeKind::Reserved,
            FirmwareRangeKind::AcpiReclaimable => RangeKind::AcpiReclaimable,
            FirmwareRangeKind::Nvs => RangeKind::Nvs,
        }
    }
}

/// A half-open `[begin, end)` physical range tagged with its [`RangeKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalRange {
    pub begin: u64,
    pub end: u64,
    pub kind: RangeKind,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(begin: u64, length: u64, kind: RangeKind) -> Self {
        Self {
            begin,
            end: begin + length,
            kind,
        }
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.end - self.begin
    }

    #[must_use]
    pub const fn contains_point(&self, point: u64) -> bool {
        point >= self.begin && point < self.end
    }

    #[must_use]
    pub const fn contains_range(&self, begin: u64, length: u64) -> bool {
        begin >= self.begin && begin + length <= self.end
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Free ranges are shrunk to whole pages: the start moves up to the next
    /// page boundary and the length is truncated down, so the result is
    /// always a subset of the input and never claims memory firmware didn't
    /// actually describe as free. Returns `None` if nothing page-sized
    /// survives. Non-`Free` ranges pass through untouched — reserved regions
    /// must stay byte-precise, since a device's MMIO window isn't ours to
    /// round.
    #[must_use]
    fn page_aligned(self) -> Option<Self> {
        if self.kind != RangeKind::Free {
            return Some(self);
        }
        let new_begin = page_round_up(self.begin);
        if new_begin >= self.end {
            return None;
        }
        let new_len = page_round_down(self.end - new_begin);
        if new_len == 0 {
            return None;
        }
        Some(Self {
            begin: new_begin,
            end: new_begin + new_len,
            kind: self.kind,
        })
    }

    /// Splits `self` around `other`, which must begin inside `self`.
    /// Returns up to three sub-ranges: the part of `self` before `other`
    /// begins, the overlap (tagged with whichever type wins), and the part
    /// of `self` after `other` ends.
    ///
    /// `invert_priority` is used by `free_pages`: freeing memory must always
    /// win the overlap against whatever was allocated there, regardless of
    /// the usual `RangeKind` ordering.
    fn shatter_against(&self, other: &Self, invert_priority: bool) -> [Option<Self>; 3] {
        debug_assert!(self.contains_point(other.begin));

        let mut out: [Option<Self>; 3] = [None, None, None];

        out[0] = Some(Self {
            begin: self.begin,
            end: other.begin,
            kind: self.kind,
        });

        if self.kind == other.kind {
            out[0] = Some(Self {
                begin: self.begin,
                end: self.end.max(other.end),
                kind: self.kind,
            });
            return out;
        }

        if other.end <= self.end {
            out[2] = Some(Self {
                begin: other.end,
                end: self.end,
                kind: self.kind,
            });
        }

        let self_wins = (self.kind > other.kind) != invert_priority;

        if self_wins {
            out[0] = Some(Self {
                begin: self.begin,
                end: self.end,
                kind: self.kind,
            });

            if self.end <= other.end {
                out[1] = Some(Self {
                    begin: self.end,
                    end: other.end,
                    kind: other.kind,
                });
            } else {
                out[2] = None;
            }
        } else {
            out[1] = Some(*other);
        }

        out
    }
}

fn trivially_mergeable(a: &PhysicalRange, b: &PhysicalRange) -> bool {
    a.kind == b.kind && a.end == b.begin
}

fn range_is_valid(range: &PhysicalRange) -> bool {
    range.kind != RangeKind::Free || range.length() >= PAGE_SIZE
}

/// Outcome of [`MemoryMap::copy_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMapOutcome {
    /// The map was copied into the caller's buffer; `key` identifies this
    /// snapshot for a subsequent [`MemoryMap::handover`].
    Copied { key: u64 },
    /// The caller's buffer was too small; it must be grown to
    /// `entries_required` entries and the call retried.
    InsufficientCapacity { entries_required: usize },
}

/// The reconciled, allocatable view of physical memory.
///
/// Every mutating method bumps an internal revision key and checks that the
/// map has not already been hand over to the kernel; calling any of them
/// after [`handover`](Self::handover) has succeeded is a programmer error.
pub struct MemoryMap {
    ranges: Vec<PhysicalRange>,
    key: u64,
    released: bool,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            key: 0,
            released: false,
        }
    }

    /// Ingests one firmware-reported range. `Free` ranges are page-aligned
    /// (and dropped if nothing page-sized survives); all others are kept
    /// byte-precise. Must be followed by [`finish_construction`] once every
    /// range has been ingested.
    pub fn emplace(&mut self, begin: u64, length: u64, kind: FirmwareRangeKind) {
        let range = PhysicalRange::new(begin, length, kind.into());
        if let Some(range) = range.page_aligned() {
            self.ranges.push(range);
        }
    }

    /// Sorts the ingested ranges and reconciles any overlaps. Must be called
    /// once, after every [`emplace`](Self::emplace) call and before the
    /// first allocation.
    pub fn finish_construction(&mut self) {
        self.insertion_sort();
        self.correct_overlapping_ranges(0);
    }

    fn insertion_sort(&mut self) {
        for i in 1..self.ranges.len() {
            let mut j = i;
            while j > 0 && self.ranges[j - 1].begin > self.ranges[j].begin {
                self.ranges.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    /// Walks forward from `hint`, merging or shattering any adjacent pair of
    /// ranges that touch or overlap, re-checking the same index after a
    /// shatter since the replacement range's type may now clash with its new
    /// neighbor.
    fn correct_overlapping_ranges(&mut self, hint: usize) {
        if self.ranges.is_empty() {
            return;
        }

        let mut i = hint;
        while i + 1 < self.ranges.len() {
            while i + 1 < self.ranges.len()
                && (self.ranges[i].overlaps(&self.ranges[i + 1])
                    || trivially_mergeable(&self.ranges[i], &self.ranges[i + 1]))
            {
                if trivially_mergeable(&self.ranges[i], &self.ranges[i + 1]) {
                    self.ranges[i].end = self.ranges[i + 1].end;
                    self.ranges.remove(i + 1);
                    continue;
                }

                let shattered = self.ranges[i].shatter_against(&self.ranges[i + 1], false);
                let valid: Vec<PhysicalRange> = shattered
                    .into_iter()
                    .flatten()
                    .filter_map(|r| {
                        if r.kind == RangeKind::Free {
                            r.page_aligned()
                        } else {
                            Some(r)
                        }
                    })
                    .filter(range_is_valid)
                    .collect();

                if valid.is_empty() {
                    loader_panic!("memory map: could not reconcile overlapping ranges");
                }

                self.ranges.splice(i..=i + 1, valid);

                if i != 0 {
                    i -= 1;
                }
            }
            i += 1;
        }
    }

    fn ensure_not_released(&self, caller: &str) {
        if self.released {
            self.on_use_after_release(caller);
        }
    }

    fn on_use_after_release(&self, caller: &str) -> ! {
        loader_panic!("memory map: {}() called after handover", caller);
    }

    /// Replaces `self.ranges[index]` with `allocated` shattered out of it,
    /// then re-reconciles around the edit. Shared core of every allocation
    /// path and of `free_pages`.
    fn allocate_out_of(&mut self, allocated: PhysicalRange, index: usize, invert_priority: bool) {
        let shattered = self.ranges[index].shatter_against(&allocated, invert_priority);
        let valid: Vec<PhysicalRange> = shattered.into_iter().flatten().filter(range_is_valid).collect();

        self.ranges.splice(index..=index, valid);
        self.correct_overlapping_ranges(index.saturating_sub(1));
    }

    /// Carves `count` pages out of the highest-addressed `Free` range that
    /// fits entirely below `upper_limit`.
    pub fn allocate_top_down(&mut self, count: usize, upper_limit: PhyAddr, kind: RangeKind) -> Option<PhyAddr> {
        self.ensure_not_released("allocate_top_down");
        self.key += 1;

        let bytes = count as u64 * PAGE_SIZE;
        let upper = upper_limit.as_u64();

        let mut found = None;
        for i in (0..self.ranges.len()).rev() {
            let r = self.ranges[i];
            if r.kind != RangeKind::Free || r.begin >= upper {
                continue;
            }
            let clamped_end = r.end.min(upper);
            if clamped_end - r.begin < bytes {
                continue;
            }
            found = Some((i, clamped_end));
            break;
        }

        let (index, clamped_end) = found?;
        let allocated = PhysicalRange::new(clamped_end - bytes, bytes, kind);
        self.allocate_out_of(allocated, index, false);
        Some(PhyAddr::new(allocated.begin))
    }

    /// Carves `count` pages out of the lowest-addressed `Free` range that
    /// fits somewhere inside `[lower_limit, upper_limit)`, skipping over
    /// non-`Free` ranges in between as long as enough room remains ahead of
    /// them to still satisfy the request.
    pub fn allocate_within(
        &mut self,
        count: usize,
        lower_limit: PhyAddr,
        upper_limit: PhyAddr,
        kind: RangeKind,
    ) -> Option<PhyAddr> {
        self.ensure_not_released("allocate_within");
        self.key += 1;

        let bytes = count as u64 * PAGE_SIZE;
        let lower = lower_limit.as_u64();
        let upper = upper_limit.as_u64();

        if lower >= upper || upper - lower < bytes {
            loader_panic!(
                "invalid allocate_within() call: {} page(s) within {:#x}..{:#x}",
                count,
                lower,
                upper
            );
        }

        let mut idx = self.ranges.partition_point(|r| r.begin < lower);
        if idx >= self.ranges.len() || self.ranges[idx].begin != lower {
            if idx == 0 {
                return None;
            }
            idx -= 1;
        }

        let found = loop {
            if idx >= self.ranges.len() {
                return None;
            }
            let r = self.ranges[idx];

            let fits = r.kind == RangeKind::Free && {
                let range_end = r.end.min(upper);
                let range_begin = r.begin.max(lower);
                range_end.saturating_sub(range_begin) >= bytes
            };

            if fits {
                break idx;
            }

            if r.end >= upper || upper - r.end < bytes {
                return None;
            }
            idx += 1;
        };

        let begin = self.ranges[found].begin.max(lower);
        let allocated = PhysicalRange::new(begin, bytes, kind);
        self.allocate_out_of(allocated, found, false);
        Some(PhyAddr::new(begin))
    }

    /// Allocates exactly `[address, address + count * PAGE_SIZE)`, failing
    /// if that range is not entirely `Free`.
    pub fn allocate_pages_at(&mut self, address: PhyAddr, count: usize, kind: RangeKind) -> Option<PhyAddr> {
        let bytes = count as u64 * PAGE_SIZE;
        self.allocate_within(count, address, PhyAddr::new(address.as_u64() + bytes), kind)
    }

    /// Returns the pages at `[address, address + count * PAGE_SIZE)` to the
    /// `Free` pool. The range must be fully covered by a single existing
    /// range; partial or unmapped frees are a programmer error.
    pub fn free_pages(&mut self, address: PhyAddr, count: usize) {
        self.ensure_not_released("free_pages");
        self.key += 1;

        let addr = address.as_u64();
        let bytes = count as u64 * PAGE_SIZE;

        let mut idx = self.ranges.partition_point(|r| r.begin < addr);
        if idx >= self.ranges.len() || self.ranges[idx].begin != addr {
            if idx == 0 {
                loader_panic!("invalid free_pages() at {:#x} ({} page(s))", addr, count);
            }
            idx -= 1;
        }

        if !self.ranges[idx].contains_range(addr, bytes) {
            loader_panic!("invalid free_pages() at {:#x} ({} page(s))", addr, count);
        }

        let freed = PhysicalRange::new(addr, bytes, RangeKind::Free);
        self.allocate_out_of(freed, idx, true);
    }

    /// Copies the reconciled range list into `into` as wire-format entries.
    /// Always safe to call repeatedly before [`handover`](Self::handover)
    /// succeeds; the returned key is stable across calls that don't mutate
    /// the map in between.
    pub fn copy_map(&self, into: &mut [MemoryMapEntry]) -> CopyMapOutcome {
        self.ensure_not_released("copy_map");

        if into.len() < self.ranges.len() {
            return CopyMapOutcome::InsufficientCapacity {
                entries_required: self.ranges.len(),
            };
        }

        for (slot, range) in into.iter_mut().zip(&self.ranges) {
            *slot = MemoryMapEntry {
                physical_address: range.begin,
                size_in_bytes: range.length(),
                kind: range.kind.wire_code(),
            };
        }

        CopyMapOutcome::Copied { key: self.key }
    }

    /// Retires the map: `key` must match the key returned by the most
    /// recent [`copy_map`](Self::copy_map). Returns `false` on a stale key
    /// (the caller's snapshot is out of date and must be refreshed). Once
    /// this returns `true`, every other method on this map becomes a
    /// programmer error to call.
    pub fn handover(&mut self, key: u64) -> bool {
        self.ensure_not_released("handover");

        if key != self.key {
            return false;
        }

        self.released = true;
        true
    }

    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    #[cfg(test)]
    fn ranges(&self) -> &[PhysicalRange] {
        &self.ranges
    }
}

impl Memory for MemoryMap {
    fn allocate_pages(&mut self, count: usize, upper_limit: PhyAddr, kind: RangeKind, top_down: bool) -> Option<PhyAddr> {
        if top_down {
            self.allocate_top_down(count, upper_limit, kind)
        } else {
            // Keep generic bottom-up allocations out of the low 1 MiB
            // (BDA/IVT/EBDA real-mode region).
            self.allocate_within(count, PhyAddr::new(1024 * 1024), upper_limit, kind)
        }
    }

    fn allocate_pages_at(&mut self, address: PhyAddr, count: usize, kind: RangeKind) -> Option<PhyAddr> {
        MemoryMap::allocate_pages_at(self, address, count, kind)
    }

    fn free_pages(&mut self, address: PhyAddr, count: usize) {
        MemoryMap::free_pages(self, address, count);
    }

    fn copy_map(&self, into: &mut [MemoryMapEntry]) -> CopyMapOutcome {
        MemoryMap::copy_map(self, into)
    }

    fn handover(&mut self, key: u64) -> bool {
        MemoryMap::handover(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(ranges: &[(u64, u64, RangeKind)]) -> MemoryMap {
        let mut map = MemoryMap::new();
        for &(begin, length, kind) in ranges {
            let firmware_kind = match kind {
                RangeKind::Free => FirmwareRangeKind::Free,
                RangeKind::Reserved => FirmwareRangeKind::Reserved,
                RangeKind::AcpiReclaimable => FirmwareRangeKind::AcpiReclaimable,
                RangeKind::Nvs => FirmwareRangeKind::Nvs,
                _ => unreachable!("tests only ingest firmware-reportable kinds"),
            };
            map.emplace(begin, length, firmware_kind);
        }
        map.finish_construction();
        map
    }

    #[test]
    fn adjacent_same_type_ranges_coalesce() {
        let mut map = build(&[
            (0, 0x1000, RangeKind::Free),
            (0x1000, 0x1000, RangeKind::Free),
            (0x2000, 0x1000, RangeKind::Reserved),
            (0x3000, 0x1000, RangeKind::Free),
        ]);

        assert_eq!(
            map.ranges(),
            &[
                PhysicalRange::new(0, 0x2000, RangeKind::Free),
                PhysicalRange::new(0x2000, 0x1000, RangeKind::Reserved),
                PhysicalRange::new(0x3000, 0x1000, RangeKind::Free),
            ]
        );

        let addr = map
            .allocate_top_down(1, PhyAddr::new(0x4000), RangeKind::LoaderReclaimable)
            .unwrap();
        assert_eq!(addr, PhyAddr::new(0x3000));
    }

    #[test]
    fn allocate_within_skips_non_free_ranges() {
        let mut map = build(&[
            (0, 0x1000, RangeKind::Reserved),
            (0x1000, 0x1000, RangeKind::Free),
        ]);

        let addr = map
            .allocate_within(1, PhyAddr::new(0), PhyAddr::new(0x2000), RangeKind::Module)
            .unwrap();
        assert_eq!(addr, PhyAddr::new(0x1000));
    }

    #[test]
    fn free_then_reallocate_round_trips() {
        let mut map = build(&[(0, 0x2000, RangeKind::Free)]);

        let addr = map
            .allocate_within(1, PhyAddr::new(0), PhyAddr::new(0x2000), RangeKind::KernelBinary)
            .unwrap();
        assert_eq!(addr, PhyAddr::new(0));

        map.free_pages(addr, 1);
        assert_eq!(map.ranges(), &[PhysicalRange::new(0, 0x2000, RangeKind::Free)]);
    }

    #[test]
    fn copy_map_reports_required_capacity_then_succeeds() {
        let map = build(&[(0, 0x1000, RangeKind::Free), (0x1000, 0x1000, RangeKind::Reserved)]);

        let mut too_small = [MemoryMapEntry::default(); 1];
        assert_eq!(
            map.copy_map(&mut too_small),
            CopyMapOutcome::InsufficientCapacity { entries_required: 2 }
        );

        let mut buf = [MemoryMapEntry::default(); 2];
        let CopyMapOutcome::Copied { key } = map.copy_map(&mut buf) else {
            panic!("expected a successful copy");
        };
        assert_eq!(buf[0].physical_address, 0);
        assert_eq!(buf[1].kind, RangeKind::Reserved.wire_code());
        let _ = key;
    }

    #[test]
    fn handover_succeeds_once_then_fails_on_stale_key() {
        let mut map = build(&[(0, 0x1000, RangeKind::Free)]);
        let mut buf = [MemoryMapEntry::default(); 1];
        let CopyMapOutcome::Copied { key } = map.copy_map(&mut buf) else {
            panic!("expected a successful copy");
        };

        assert!(map.handover(key));
    }

    #[test]
    #[should_panic(expected = "after handover")]
    fn use_after_handover_panics() {
        let mut map = build(&[(0, 0x1000, RangeKind::Free)]);
        let mut buf = [MemoryMapEntry::default(); 1];
        let CopyMapOutcome::Copied { key } = map.copy_map(&mut buf) else {
            panic!("expected a successful copy");
        };
        assert!(map.handover(key));

        map.free_pages(PhyAddr::new(0), 1);
    }
}
