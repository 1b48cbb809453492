//! Boot Driver: the orchestration that ties every other module into a
//! single boot attempt.
//!
//! Grounded in `original_source/Loader/Loader.cpp`'s `loader_entry`: that
//! function enumerates disks, detects a filesystem on each, and locates the
//! configuration file — then the available source stops short, ending in an
//! unconditional `for(;;);` before it ever selects a kernel or hands over.
//! The disk-enumeration and config-discovery half of [`run`] below is a
//! direct port of that function (including `detect_all_filesystems` and
//! `find_config_file`, both implemented in [`crate::fs`]); the kernel
//! selection, loading, paging and handover-assembly half has no literal
//! source to port and is instead grounded in this crate's own `elf`, `vmm`
//! and `protocol` modules, composed the way the original's headers describe
//! the full contract.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::config::{Config, MustBeUnique};
use crate::elf::{self, AllocateAnywhere, UseVirtualAddress};
use crate::firmware::{Disk, Memory};
use crate::fs::{self, File, FilesystemTable};
use crate::mem::map::RangeKind;
use crate::mem::{page_round_up, PhyAddr, VirtAddr, PAGE_SIZE};
use crate::protocol::{
    AttributeHeader, AttributeType, BootContextHeader, CommandLineAttribute, MemoryMapAttribute, MemoryMapEntry,
    PlatformInfoAttribute, PlatformType, LOADER_NAME_LEN,
};
use crate::vmm::{self, PageTable};

/// Low memory identity-mapped for the kernel's own early setup (IDT, APIC,
/// legacy BIOS structures it may still need to poke at). Matches the 16 MiB
/// the original reserves for this in `VirtualMemory.cpp`.
const IDENTITY_MAP_BYTES: u64 = 16 * 1024 * 1024;

/// Kernel stack size absent a `stack_pages` override in the selected
/// loadable entry.
const DEFAULT_KERNEL_STACK_PAGES: usize = 16;

/// Page table levels absent a `paging_levels` override. 5-level (57-bit)
/// paging is supported by [`crate::vmm`] but never selected unless asked
/// for, since it requires hardware (LA57) this crate cannot itself probe.
const DEFAULT_PAGING_LEVELS: u8 = 4;

/// Everything a firmware-specific entry point needs to perform the actual
/// privilege/paging switch and jump into the kernel. Assembling this is as
/// far as this crate goes — crossing into the kernel is architecture-specific
/// assembly with no home in a `no_std` core crate (`spec.md` §9 design note).
#[derive(Clone, Copy, Debug)]
pub struct HandoverInfo {
    pub entrypoint: u64,
    pub stack_top: PhyAddr,
    pub page_table: PageTable,
    pub boot_context: PhyAddr,
}

/// Optional overrides normally read from the environment a real firmware
/// entry point has access to (e.g. the BIOS drive number the loader itself
/// was read from). `requested_entry` lets a caller force a particular
/// `[name]` loadable entry instead of the configuration's `default` key.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootOptions<'a> {
    pub requested_entry: Option<&'a str>,
}

fn find_file(disk: &dyn Disk, table: &mut FilesystemTable, path: &str) -> Option<Box<dyn File>> {
    for entry in table.iter_mut() {
        if let Some(file) = entry.filesystem.open(disk, path) {
            return Some(file);
        }
    }
    None
}

fn read_whole_file(disk: &dyn Disk, file: &mut dyn File, what: &str) -> Vec<u8> {
    let size = usize::try_from(file.size()).unwrap_or_else(|_| crate::unrecoverable!("{} is implausibly large", what));
    let mut buffer = vec![0u8; size];
    if !file.read(disk, &mut buffer, 0) {
        crate::unrecoverable!("failed to read {}", what);
    }
    buffer
}

fn push_pod<T: bytemuck::Pod>(buffer: &mut Vec<u8>, value: &T) {
    buffer.extend_from_slice(bytemuck::bytes_of(value));
}

/// Serializes the platform-info, memory-map, optional command-line and
/// terminating attributes into a single leaked buffer, and returns its
/// physical address. Leaking is deliberate: the buffer must outlive `run`
/// and is never freed by this crate — the kernel owns it from handover on.
fn build_boot_context(map_entries: &[MemoryMapEntry], cmdline: Option<&str>) -> PhyAddr {
    let mut attributes = Vec::new();
    let mut attribute_count: u64 = 0;

    let mut loader_name = [0u8; LOADER_NAME_LEN];
    let name = b"ultraboot";
    loader_name[..name.len()].copy_from_slice(name);
    push_pod(
        &mut attributes,
        &PlatformInfoAttribute {
            header: AttributeHeader {
                attribute_type: AttributeType::PlatformInfo as u32,
                size_in_bytes: size_of::<PlatformInfoAttribute>() as u32,
            },
            platform_type: PlatformType::Bios as u32,
            loader_major: 1,
            loader_minor: 0,
            loader_name,
            acpi_rsdp_address: 0,
        },
    );
    attribute_count += 1;

    push_pod(
        &mut attributes,
        &MemoryMapAttribute {
            header: AttributeHeader {
                attribute_type: AttributeType::MemoryMap as u32,
                size_in_bytes: (size_of::<MemoryMapAttribute>() + map_entries.len() * size_of::<MemoryMapEntry>()) as u32,
            },
            entry_count: map_entries.len() as u64,
        },
    );
    for entry in map_entries {
        push_pod(&mut attributes, entry);
    }
    attribute_count += 1;

    if let Some(cmdline) = cmdline {
        push_pod(
            &mut attributes,
            &CommandLineAttribute {
                header: AttributeHeader {
                    attribute_type: AttributeType::CommandLine as u32,
                    size_in_bytes: (size_of::<CommandLineAttribute>() + cmdline.len() + 1) as u32,
                },
            },
        );
        attributes.extend_from_slice(cmdline.as_bytes());
        attributes.push(0);
        attribute_count += 1;
    }

    push_pod(
        &mut attributes,
        &AttributeHeader {
            attribute_type: AttributeType::End as u32,
            size_in_bytes: size_of::<AttributeHeader>() as u32,
        },
    );
    attribute_count += 1;

    let mut context = Vec::with_capacity(size_of::<BootContextHeader>() + attributes.len());
    push_pod(&mut context, &BootContextHeader { attribute_count });
    context.extend_from_slice(&attributes);

    let leaked: &'static mut [u8] = context.leak();
    PhyAddr::new(leaked.as_ptr() as u64)
}

/// Runs the full boot sequence to completion and returns what the
/// firmware-specific trampoline needs to jump into the kernel. Every
/// recoverable failure along the way (`spec.md` §4.7: "Fatal if ...") halts
/// through [`crate::unrecoverable`] rather than returning an error, matching
/// the original's own "there is no path back from a failed boot" design.
pub fn run(disk: &dyn Disk, memory: &mut dyn Memory, options: BootOptions<'_>) -> HandoverInfo {
    // Step 1: enumerate disks and detect a filesystem on each. Partition
    // identification (MBR/EBR walk, GPT skip) happens inside this call.
    let mut table = FilesystemTable::new();
    fs::detect_all_filesystems(disk, &mut table);

    // Step 2 (the original's "identify the origin partition") has no
    // counterpart here: no firmware trait surfaces which disk/drive the
    // loader itself was read from (a BIOS drive number or a UEFI
    // LoadedImageProtocol handle), and `find_config_file` — like the
    // original — searches every detected filesystem regardless, so the
    // origin partition is never actually load-bearing for this step.

    // Step 3: search the fixed candidate paths across every filesystem.
    let (_origin_index, mut config_file) =
        fs::find_config_file(disk, &mut table).unwrap_or_else(|| crate::unrecoverable!("no configuration file found on any detected filesystem"));

    // Step 4: read the whole file and parse it.
    let config_bytes = read_whole_file(disk, config_file.as_mut(), "the configuration file");
    let config_text =
        core::str::from_utf8(&config_bytes).unwrap_or_else(|_| crate::unrecoverable!("configuration file is not valid UTF-8"));
    let config = Config::parse(config_text)
        .unwrap_or_else(|e| crate::unrecoverable!("configuration parse error at line {}, column {}: {}", e.line, e.column, e.message));

    // Step 5: select a loadable entry (explicit override, else the
    // configured `default`, else the first one in the file), then locate
    // and load its kernel image.
    let selected_name = options
        .requested_entry
        .or_else(|| config.get("default", MustBeUnique::No).and_then(|v| v.as_string()));

    let entry = selected_name
        .and_then(|name| config.get_loadable_entry(name))
        .or_else(|| config.loadable_entries().next())
        .unwrap_or_else(|| crate::unrecoverable!("configuration has no loadable entries"));

    let kernel_path = entry
        .get("path", MustBeUnique::Yes)
        .and_then(|v| v.as_string())
        .unwrap_or_else(|| crate::unrecoverable!("loadable entry \"{}\" has no \"path\" key", entry.name()));

    let mut kernel_file =
        find_file(disk, &mut table, kernel_path).unwrap_or_else(|| crate::unrecoverable!("kernel image \"{}\" not found", kernel_path));
    let kernel_bytes = read_whole_file(disk, kernel_file.as_mut(), "the kernel image");

    let info = elf::load(&kernel_bytes, UseVirtualAddress::Yes, AllocateAnywhere::Yes, memory)
        .unwrap_or_else(|e| crate::unrecoverable!("failed to load kernel image \"{}\": {:?}", kernel_path, e));

    // Step 6: allocate a kernel stack and paging structures, then map the
    // low-memory identity region, the kernel's own virtual range, and the
    // stack (identity-mapped, since the kernel has not yet told us a
    // preferred virtual layout for it).
    let stack_pages = entry
        .get("stack_pages", MustBeUnique::Yes)
        .and_then(|v| v.as_unsigned())
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_KERNEL_STACK_PAGES);
    let stack_base = memory
        .allocate_pages(stack_pages, PhyAddr::new(u64::MAX), RangeKind::KernelStack, true)
        .unwrap_or_else(|| crate::unrecoverable!("out of memory allocating a {}-page kernel stack", stack_pages));
    let stack_top = stack_base + (stack_pages as u64) * PAGE_SIZE;

    let levels = entry
        .get("paging_levels", MustBeUnique::Yes)
        .and_then(|v| v.as_unsigned())
        .map(|v| v as u8)
        .filter(|&l| l == 4 || l == 5)
        .unwrap_or(DEFAULT_PAGING_LEVELS);

    let root = memory
        .allocate_pages(1, PhyAddr::new(u64::MAX), RangeKind::KernelBinary, false)
        .unwrap_or_else(|| crate::unrecoverable!("out of memory allocating the root page table"));
    unsafe {
        core::ptr::write_bytes(root.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    let page_table = PageTable::new(root, levels);

    let identity_pages = (IDENTITY_MAP_BYTES / PAGE_SIZE) as usize;
    vmm::map_critical_pages(&page_table, memory, VirtAddr::new(0), PhyAddr::new(0), identity_pages);

    if info.physical_valid {
        let hull_bytes = page_round_up(info.virtual_ceiling - info.virtual_base);
        let kernel_pages = (hull_bytes / PAGE_SIZE) as usize;
        vmm::map_critical_pages(&page_table, memory, VirtAddr::new(info.virtual_base), info.physical_base, kernel_pages);
    }

    vmm::map_critical_pages(&page_table, memory, VirtAddr::new(stack_base.as_u64()), stack_base, stack_pages);

    // Step 7: snapshot the memory map, assemble the handover buffer, and
    // hand the memory map over so no further allocation is possible.
    let mut map_entries: Vec<MemoryMapEntry> = Vec::new();
    let handover_key = loop {
        match memory.copy_map(&mut map_entries) {
            crate::mem::map::CopyMapOutcome::Copied { key } => break key,
            crate::mem::map::CopyMapOutcome::InsufficientCapacity { entries_required } => {
                map_entries.resize(entries_required, MemoryMapEntry::default());
            }
        }
    };

    let cmdline = entry.get("cmdline", MustBeUnique::Yes).and_then(|v| v.as_string());
    let boot_context = build_boot_context(&map_entries, cmdline);

    if !memory.handover(handover_key) {
        crate::unrecoverable!("memory map handover rejected: stale key {}", handover_key);
    }

    HandoverInfo {
        entrypoint: info.entrypoint,
        stack_top,
        page_table,
        boot_context,
    }
}
