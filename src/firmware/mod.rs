//! Firmware capability traits.
//!
//! The loader core never talks to a BIOS or UEFI directly: it only knows
//! about these four capability sets, and a concrete entry point (out of this
//! crate's scope — see the design notes) wires up implementations backed by
//! INT 13h / INT 10h on legacy BIOS, or the respective UEFI protocols, and
//! drives [`crate::boot::run`] with them.
//!
//! [`Memory`] is the one capability implemented inside this crate: once the
//! firmware's raw memory map has been ingested into a
//! [`MemoryMap`](crate::mem::map::MemoryMap), that structure *becomes* the
//! system's memory service for the remainder of the boot.

use alloc::vec::Vec;

use crate::mem::map::{CopyMapOutcome, RangeKind};
use crate::mem::PhyAddr;
use crate::protocol::{Framebuffer, MemoryMapEntry};

/// One disk visible to firmware, as reported by disk enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskInfo {
    pub handle: u32,
    pub bytes_per_sector: u16,
    pub total_sectors: u64,
}

/// Raw block-device access. Implemented by the firmware entry point over
/// INT 13h extended reads (BIOS) or `EFI_BLOCK_IO_PROTOCOL` (UEFI); the
/// filesystem and partition-table code in this crate only ever calls
/// through this trait, never talks to hardware directly.
pub trait Disk {
    fn list_disks(&self) -> &[DiskInfo];

    /// Reads `buffer.len()` bytes starting at `byte_offset` on `handle`.
    /// Returns `false` on any I/O failure. Implementations must handle
    /// arbitrary byte offsets/lengths by internally buffering aligned block
    /// reads.
    fn read(&self, handle: u32, byte_offset: u64, buffer: &mut [u8]) -> bool;

    /// Reads `sector_count` sectors starting at `first_sector` on `handle`
    /// into `buffer`. `buffer` must be at least `sector_count *
    /// bytes_per_sector` bytes. Returns `false` on any I/O failure.
    fn read_blocks(&self, handle: u32, buffer: &mut [u8], first_sector: u64, sector_count: u64) -> bool;
}

/// The physical memory allocator's public surface, as handed to the rest of
/// the boot sequence. Implemented by
/// [`MemoryMap`](crate::mem::map::MemoryMap).
pub trait Memory {
    /// Allocates `count` pages below `upper_limit`. `top_down` selects
    /// between carving from the highest-addressed fit (used for kernel
    /// structures that want to stay out of low memory) and the
    /// lowest-addressed fit starting at address zero.
    fn allocate_pages(&mut self, count: usize, upper_limit: PhyAddr, kind: RangeKind, top_down: bool) -> Option<PhyAddr>;

    fn allocate_pages_at(&mut self, address: PhyAddr, count: usize, kind: RangeKind) -> Option<PhyAddr>;

    fn free_pages(&mut self, address: PhyAddr, count: usize);

    fn copy_map(&self, into: &mut [MemoryMapEntry]) -> CopyMapOutcome;

    fn handover(&mut self, key: u64) -> bool;
}

/// A video mode firmware is able to set before handover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub bpp: u16,
}

/// Graphics mode enumeration/selection. Implemented over VESA BIOS
/// Extensions on legacy BIOS, or `EFI_GRAPHICS_OUTPUT_PROTOCOL` on UEFI.
pub trait Video {
    fn list_modes(&self) -> Vec<VideoMode>;

    /// Sets `mode` and returns the resulting framebuffer description, or
    /// `None` if the mode could not be set.
    fn set_mode(&mut self, mode: VideoMode) -> Option<Framebuffer>;
}

/// Early text output, available before a framebuffer has been set up.
pub trait Console {
    fn write_str(&self, text: &str);
}
