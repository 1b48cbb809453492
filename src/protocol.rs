//! Boot handover wire format.
//!
//! Grounded on the original loader's `Protocol.h`: a `boot_context` header
//! followed by a packed sequence of variable-length attributes, each
//! prefixed by an `attribute_header { type, size_in_bytes }`. A consumer
//! walks the sequence with [`AttributeHeader::next`] and never needs to know
//! the whole set of attribute kinds up front — unrecognized types are simply
//! skipped via `size_in_bytes`.
//!
//! Every struct here is `#[repr(C)]` plus [`bytemuck::Pod`]/[`Zeroable`], so
//! the handover buffer can be built and read by reinterpreting byte slices
//! directly, with no serialization step, matching how a bootloader and the
//! kernel it hands off to must agree on a format without sharing a parser.

use bytemuck::{Pod, Zeroable};

/// Magic value identifying a valid [`BootContext`] to the kernel. ASCII
/// `"ULTB"`, read little-endian.
pub const ULTRA_MAGIC: u32 = 0x554c_5442;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum AttributeType {
    #[default]
    Invalid = 0,
    PlatformInfo = 1,
    MemoryMap = 2,
    ModuleInfo = 3,
    CommandLine = 4,
    FramebufferInfo = 5,
    End = 6,
}

impl AttributeType {
    #[must_use]
    pub const fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::PlatformInfo),
            2 => Some(Self::MemoryMap),
            3 => Some(Self::ModuleInfo),
            4 => Some(Self::CommandLine),
            5 => Some(Self::FramebufferInfo),
            6 => Some(Self::End),
            _ => None,
        }
    }
}

/// Common header prefixing every attribute in the handover buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AttributeHeader {
    pub attribute_type: u32,
    pub size_in_bytes: u32,
}

impl AttributeHeader {
    /// Byte offset, relative to this header, at which the next attribute
    /// begins. Callers walking a buffer add this to the current header's
    /// address; this module doesn't perform the pointer arithmetic itself
    /// since it has no notion of the backing allocation's lifetime.
    #[must_use]
    pub const fn next_offset(&self) -> u32 {
        self.size_in_bytes
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum PlatformType {
    #[default]
    Invalid = 0,
    Bios = 1,
    Uefi = 2,
}

/// Longest loader name (including NUL) embedded in [`PlatformInfoAttribute`].
pub const LOADER_NAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PlatformInfoAttribute {
    pub header: AttributeHeader,
    pub platform_type: u32,

    pub loader_major: u16,
    pub loader_minor: u16,
    pub loader_name: [u8; LOADER_NAME_LEN],

    pub acpi_rsdp_address: u64,
}

/// One entry of a [`MemoryMap`](crate::mem::map::MemoryMap) snapshot, as
/// copied out by `copy_map`. `kind` is a `RangeKind::wire_code()` value
/// (`MEMORY_TYPE_*` in the original header).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub physical_address: u64,
    pub size_in_bytes: u64,
    pub kind: u64,
}

pub const MEMORY_TYPE_INVALID: u64 = 0;
pub const MEMORY_TYPE_FREE: u64 = 1;
pub const MEMORY_TYPE_RESERVED: u64 = 2;
pub const MEMORY_TYPE_ACPI_RECLAIMABLE: u64 = 3;
pub const MEMORY_TYPE_NVS: u64 = 4;
pub const MEMORY_TYPE_LOADER_RECLAIMABLE: u64 = 5;
pub const MEMORY_TYPE_MODULE: u64 = 6;
pub const MEMORY_TYPE_KERNEL_STACK: u64 = 7;
pub const MEMORY_TYPE_KERNEL_BINARY: u64 = 8;

/// Header for the memory map attribute: `entry_count` entries of
/// [`MemoryMapEntry`] follow immediately afterwards in the buffer, mirroring
/// [`BootContextHeader`]'s own trailing-sequence convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemoryMapAttribute {
    pub header: AttributeHeader,
    pub entry_count: u64,
}

/// Header for the kernel command line attribute: a NUL-terminated byte
/// string follows immediately afterwards, sized by
/// `header.size_in_bytes - size_of::<CommandLineAttribute>()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CommandLineAttribute {
    pub header: AttributeHeader,
}

/// Longest module name (including NUL) embedded in [`ModuleInfoAttribute`].
pub const MODULE_NAME_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ModuleInfoAttribute {
    pub header: AttributeHeader,
    pub name: [u8; MODULE_NAME_LEN],
    pub physical_address: u64,
    pub length: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum FramebufferFormat {
    #[default]
    Invalid = 0,
    Rgb = 1,
    Rgba = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u16,
    pub format: u16,
    pub physical_address: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FramebufferAttribute {
    pub header: AttributeHeader,
    pub framebuffer: Framebuffer,
}

/// Root of the handover buffer: an attribute count followed immediately by
/// `attribute_count` variable-length, `AttributeHeader`-prefixed records.
/// The trailing sequence is not modeled as a Rust slice field (its element
/// size varies per attribute) — callers walk it by hand using
/// [`AttributeHeader::next_offset`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BootContextHeader {
    pub attribute_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn attribute_header_is_two_u32s() {
        assert_eq!(size_of::<AttributeHeader>(), 8);
    }

    #[test]
    fn memory_map_entry_round_trips_wire_codes() {
        let entry = MemoryMapEntry {
            physical_address: 0x1000,
            size_in_bytes: 0x2000,
            kind: MEMORY_TYPE_LOADER_RECLAIMABLE,
        };
        assert_eq!(entry.kind, 5);
    }

    #[test]
    fn attribute_type_round_trips_through_wire_codes() {
        for (value, expected) in [
            (0, AttributeType::Invalid),
            (1, AttributeType::PlatformInfo),
            (2, AttributeType::MemoryMap),
            (3, AttributeType::ModuleInfo),
            (4, AttributeType::CommandLine),
            (5, AttributeType::FramebufferInfo),
            (6, AttributeType::End),
        ] {
            assert_eq!(AttributeType::from_wire(value), Some(expected));
        }
        assert_eq!(AttributeType::from_wire(7), None);
    }

    #[test]
    fn ultra_magic_matches_ascii_ultb_little_endian() {
        assert_eq!(ULTRA_MAGIC.to_le_bytes(), *b"BTLU");
    }
}
