//! ELF loader: validates and deposits a 32- or 64-bit `ET_EXEC` image into
//! physical memory.
//!
//! Grounded line-for-line in `original_source/Loader/ELF/ELF.cpp`'s
//! `do_load<HeaderT, ProgramHeaderT, AddrT>` / `load` / `get_bitness`, and
//! `Structures.h` for the on-disk header layout. The two-pass algorithm
//! (compute the virtual/physical hull, then copy each segment) is kept
//! unchanged; only the error handling is made idiomatic, returning a
//! `Result` instead of the original's `{success, error_message}` pair.

use bytemuck::{Pod, Zeroable};

use crate::firmware::Memory;
use crate::mem::map::RangeKind;
use crate::mem::{page_round_down, page_round_up, PhyAddr, PAGE_SIZE};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_NIDENT: usize = 16;

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const EM_386: u16 = 3;
const EM_AMD64: u16 = 62;

const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PN_XNUM: u16 = 0xFFFF;

const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;
const ONE_MIB: u64 = 1024 * 1024;

const HIGHER_HALF_32: u64 = 0xC000_0000;
const HIGHER_HALF_64: u64 = 0xFFFF_FFFF_8000_0000;

/// Whether the loader should treat program header addresses as virtual
/// (requiring the caller to have paging set up before jumping to the
/// kernel) or physical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseVirtualAddress {
    Yes,
    No,
}

/// Whether physical backing for the image may be allocated anywhere the
/// Memory Manager sees fit, rather than at each segment's requested
/// `p_paddr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocateAnywhere {
    Yes,
    No,
}

/// Everything the Boot Driver needs to hand a loaded kernel off to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryInformation {
    pub entrypoint: u64,
    pub virtual_base: u64,
    pub virtual_ceiling: u64,
    pub physical_base: PhyAddr,
    pub physical_ceiling: PhyAddr,
    pub bitness: u32,
    pub physical_valid: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    InvalidLoadOptions,
    FileTooSmall,
    InvalidMagic,
    NotLittleEndian,
    InvalidClass,
    UnexpectedMachineType,
    NotExecutable,
    InvalidProgramHeaderCount,
    InvalidProgramHeaderOffset,
    InvalidLoadAddress,
    InvalidEntrypoint,
    InvalidProgramHeader,
    OutOfMemory,
}

impl crate::BaseError for LoadError {}

pub type LoadResult = Result<BinaryInformation, LoadError>;

trait ElfHeaderOps: Pod {
    fn e_machine(&self) -> u16;
    fn e_type(&self) -> u16;
    fn e_entry(&self) -> u64;
    fn e_phoff(&self) -> u64;
    fn e_phentsize(&self) -> u16;
    fn e_phnum(&self) -> u16;
}

trait ProgramHeaderOps: Pod {
    fn p_type(&self) -> u32;
    fn p_offset(&self) -> u64;
    fn p_vaddr(&self) -> u64;
    fn p_paddr(&self) -> u64;
    fn p_filesz(&self) -> u64;
    fn p_memsz(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf32Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

impl ElfHeaderOps for Elf32Ehdr {
    fn e_machine(&self) -> u16 {
        self.e_machine
    }
    fn e_type(&self) -> u16 {
        self.e_type
    }
    fn e_entry(&self) -> u64 {
        u64::from(self.e_entry)
    }
    fn e_phoff(&self) -> u64 {
        u64::from(self.e_phoff)
    }
    fn e_phentsize(&self) -> u16 {
        self.e_phentsize
    }
    fn e_phnum(&self) -> u16 {
        self.e_phnum
    }
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

impl ElfHeaderOps for Elf64Ehdr {
    fn e_machine(&self) -> u16 {
        self.e_machine
    }
    fn e_type(&self) -> u16 {
        self.e_type
    }
    fn e_entry(&self) -> u64 {
        self.e_entry
    }
    fn e_phoff(&self) -> u64 {
        self.e_phoff
    }
    fn e_phentsize(&self) -> u16 {
        self.e_phentsize
    }
    fn e_phnum(&self) -> u16 {
        self.e_phnum
    }
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

impl ProgramHeaderOps for Elf32Phdr {
    fn p_type(&self) -> u32 {
        self.p_type
    }
    fn p_offset(&self) -> u64 {
        u64::from(self.p_offset)
    }
    fn p_vaddr(&self) -> u64 {
        u64::from(self.p_vaddr)
    }
    fn p_paddr(&self) -> u64 {
        u64::from(self.p_paddr)
    }
    fn p_filesz(&self) -> u64 {
        u64::from(self.p_filesz)
    }
    fn p_memsz(&self) -> u64 {
        u64::from(self.p_memsz)
    }
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

impl ProgramHeaderOps for Elf64Phdr {
    fn p_type(&self) -> u32 {
        self.p_type
    }
    fn p_offset(&self) -> u64 {
        self.p_offset
    }
    fn p_vaddr(&self) -> u64 {
        self.p_vaddr
    }
    fn p_paddr(&self) -> u64 {
        self.p_paddr
    }
    fn p_filesz(&self) -> u64 {
        self.p_filesz
    }
    fn p_memsz(&self) -> u64 {
        self.p_memsz
    }
}

fn program_header_at<P: ProgramHeaderOps>(file: &[u8], ph_begin: u64, entsize: u16, index: u16) -> P {
    let start = (ph_begin + u64::from(entsize) * u64::from(index)) as usize;
    *bytemuck::from_bytes(&file[start..start + core::mem::size_of::<P>()])
}

/// Shared body of the original's `do_load<HeaderT, ProgramHeaderT, AddrT>`.
fn do_load<H: ElfHeaderOps, P: ProgramHeaderOps>(
    file: &[u8],
    use_va: UseVirtualAddress,
    alloc_anywhere: AllocateAnywhere,
    machine_type: u16,
    higher_half_address: u64,
    memory: &mut dyn Memory,
) -> LoadResult {
    let header: H = *bytemuck::from_bytes(&file[..core::mem::size_of::<H>()]);

    let mut entrypoint = header.e_entry();

    if header.e_machine() != machine_type {
        return Err(LoadError::UnexpectedMachineType);
    }
    if header.e_type() != ET_EXEC {
        return Err(LoadError::NotExecutable);
    }
    if header.e_phnum() == 0 || header.e_phnum() == PN_XNUM {
        return Err(LoadError::InvalidProgramHeaderCount);
    }

    let ph_begin = header.e_phoff();
    let ph_end = ph_begin + u64::from(header.e_phentsize()) * u64::from(header.e_phnum());

    if ph_end < ph_begin
        || u64::from(header.e_phentsize()) < core::mem::size_of::<P>() as u64
        || (file.len() as u64) < ph_end
    {
        return Err(LoadError::InvalidProgramHeaderOffset);
    }

    let va = use_va == UseVirtualAddress::Yes;
    let must_be_higher_half = alloc_anywhere == AllocateAnywhere::Yes;

    let mut virtual_base = u64::MAX;
    let mut virtual_ceiling = 0u64;
    let mut physical_base = u64::MAX;
    let mut physical_ceiling = 0u64;

    for i in 0..header.e_phnum() {
        let program_header: P = program_header_at(file, ph_begin, header.e_phentsize(), i);

        if program_header.p_type() != PT_LOAD {
            continue;
        }

        if program_header.p_vaddr() < higher_half_address && must_be_higher_half {
            return Err(LoadError::InvalidLoadAddress);
        }

        virtual_base = virtual_base.min(program_header.p_vaddr());
        let end = program_header.p_vaddr() + program_header.p_memsz();
        virtual_ceiling = virtual_ceiling.max(end);

        if !va && entrypoint >= program_header.p_vaddr() && entrypoint < end {
            entrypoint = entrypoint - program_header.p_vaddr() + program_header.p_paddr();
        }

        physical_base = physical_base.min(program_header.p_paddr());
        let pend = program_header.p_paddr() + program_header.p_memsz();
        physical_ceiling = physical_ceiling.max(pend);
    }

    let (reference_base, reference_ceiling) =
        if va { (virtual_base, virtual_ceiling) } else { (physical_base, physical_ceiling) };

    if entrypoint >= reference_ceiling || entrypoint < reference_base {
        return Err(LoadError::InvalidEntrypoint);
    }

    virtual_base = page_round_down(virtual_base);
    virtual_ceiling = page_round_up(virtual_ceiling);
    physical_base = page_round_down(physical_base);
    physical_ceiling = page_round_up(physical_ceiling);

    let mut physical_valid = !va;
    let mut allocated_physical_base = PhyAddr::new(physical_base);

    if alloc_anywhere == AllocateAnywhere::Yes {
        let pages = ((virtual_ceiling - virtual_base) / PAGE_SIZE) as usize;
        allocated_physical_base = memory
            .allocate_pages(pages, PhyAddr::new(FOUR_GIB), RangeKind::KernelBinary, true)
            .ok_or(LoadError::OutOfMemory)?;
        physical_ceiling = allocated_physical_base.as_u64() + (pages as u64) * PAGE_SIZE;
        physical_valid = true;
    }

    for i in 0..header.e_phnum() {
        let program_header: P = program_header_at(file, ph_begin, header.e_phentsize(), i);

        if program_header.p_type() != PT_LOAD {
            continue;
        }

        let mut address = if va { program_header.p_vaddr() } else { program_header.p_paddr() };

        if address.checked_add(program_header.p_memsz()).is_none() {
            return Err(LoadError::InvalidLoadAddress);
        }

        let ph_file_end = program_header.p_offset() + program_header.p_filesz();
        if ph_file_end < program_header.p_offset()
            || program_header.p_memsz() < program_header.p_filesz()
            || (file.len() as u64) < ph_file_end
        {
            return Err(LoadError::InvalidProgramHeader);
        }

        if address >= higher_half_address {
            if !va {
                return Err(LoadError::InvalidLoadAddress);
            }
            address -= higher_half_address;
            if address < ONE_MIB && alloc_anywhere == AllocateAnywhere::No {
                return Err(LoadError::InvalidLoadAddress);
            }
        }

        let mut load_base = if alloc_anywhere == AllocateAnywhere::No {
            let begin = page_round_down(address);
            let end = page_round_up(begin + program_header.p_memsz());
            if end > FOUR_GIB {
                return Err(LoadError::InvalidLoadAddress);
            }
            let pages = ((end - begin) / PAGE_SIZE) as usize;
            let base = memory
                .allocate_pages_at(PhyAddr::new(begin), pages, RangeKind::KernelBinary)
                .ok_or(LoadError::OutOfMemory)?;
            base + (address - begin)
        } else {
            allocated_physical_base + (program_header.p_vaddr() - virtual_base)
        };

        if program_header.p_filesz() > 0 {
            let file_start = program_header.p_offset() as usize;
            let file_data = &file[file_start..file_start + program_header.p_filesz() as usize];
            // SAFETY: `load_base` was just carved out of the Memory Manager
            // (or validated against the caller-requested physical range),
            // and the loader runs with an identity mapping covering all
            // firmware-reported RAM.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    file_data.as_ptr(),
                    load_base.as_mut_ptr::<u8>(),
                    file_data.len(),
                );
            }
            load_base += program_header.p_filesz();
        }

        let to_zero = program_header.p_memsz() - program_header.p_filesz();
        if to_zero > 0 {
            // SAFETY: see above; `to_zero` bytes past the copied file data
            // are still within the segment's allocated/validated range.
            unsafe {
                core::ptr::write_bytes(load_base.as_mut_ptr::<u8>(), 0, to_zero as usize);
            }
        }
    }

    Ok(BinaryInformation {
        entrypoint,
        virtual_base,
        virtual_ceiling,
        physical_base: allocated_physical_base,
        physical_ceiling: PhyAddr::new(physical_ceiling),
        bitness: 0,
        physical_valid,
    })
}

/// Validates and loads an ELF image, depositing its `PT_LOAD` segments into
/// physical memory obtained from `memory`.
///
/// `alloc_anywhere` requires `use_va == UseVirtualAddress::Yes`: allocating
/// a fresh physical range only makes sense when the caller is going to map
/// it at the requested virtual addresses afterwards.
pub fn load(file: &[u8], use_va: UseVirtualAddress, alloc_anywhere: AllocateAnywhere, memory: &mut dyn Memory) -> LoadResult {
    if alloc_anywhere == AllocateAnywhere::Yes && use_va == UseVirtualAddress::No {
        return Err(LoadError::InvalidLoadOptions);
    }

    if file.len() < core::mem::size_of::<Elf32Ehdr>() {
        return Err(LoadError::FileTooSmall);
    }

    let ident = &file[..EI_NIDENT];
    if ident[..4] != ELFMAG {
        return Err(LoadError::InvalidMagic);
    }
    if ident[EI_DATA] != ELFDATA2LSB {
        return Err(LoadError::NotLittleEndian);
    }

    match ident[EI_CLASS] {
        ELFCLASS64 => {
            let mut info = do_load::<Elf64Ehdr, Elf64Phdr>(file, use_va, alloc_anywhere, EM_AMD64, HIGHER_HALF_64, memory)?;
            info.bitness = 64;
            Ok(info)
        }
        ELFCLASS32 => {
            if use_va == UseVirtualAddress::Yes {
                return Err(LoadError::InvalidLoadOptions);
            }
            let mut info = do_load::<Elf32Ehdr, Elf32Phdr>(file, use_va, alloc_anywhere, EM_386, HIGHER_HALF_32, memory)?;
            info.bitness = 32;
            Ok(info)
        }
        _ => Err(LoadError::InvalidClass),
    }
}

/// Probes just the ELF class without running full validation/loading, used
/// by the Boot Driver to pick a kernel image bitness before committing to a
/// full [`load`] call.
#[must_use]
pub fn get_bitness(file: &[u8]) -> Option<u32> {
    if file.len() < core::mem::size_of::<Elf32Ehdr>() {
        return None;
    }

    match file[EI_CLASS] {
        ELFCLASS32 => Some(32),
        ELFCLASS64 => Some(64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::Memory;
    use crate::mem::map::CopyMapOutcome;
    use crate::protocol::MemoryMapEntry;
    use alloc::vec;
    use alloc::vec::Vec;

    /// A bump allocator standing in for the Memory Manager in these tests:
    /// real physical memory isn't available under `cargo test`, so instead
    /// of handing back arbitrary addresses, it hands back offsets into a
    /// heap-backed scratch buffer it owns, letting `do_load`'s writes land
    /// somewhere valid.
    struct FakeMemory {
        scratch: Vec<u8>,
        next_free: usize,
    }

    impl FakeMemory {
        fn new(size: usize) -> Self {
            Self { scratch: vec![0u8; size], next_free: 0 }
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

    fn build_minimal_elf64(entry: u64, vaddr: u64, memsz: u64, filesz: u64, payload: &[u8]) -> Vec<u8> {
        let ehdr_size = core::mem::size_of::<Elf64Ehdr>();
        let phdr_size = core::mem::size_of::<Elf64Phdr>();

        let mut ident = [0u8; EI_NIDENT];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[EI_CLASS] = ELFCLASS64;
        ident[EI_DATA] = ELFDATA2LSB;

        let ehdr = Elf64Ehdr {
            e_ident: ident,
            e_type: ET_EXEC,
            e_machine: EM_AMD64,
            e_version: 1,
            e_entry: entry,
            e_phoff: ehdr_size as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehdr_size as u16,
            e_phentsize: phdr_size as u16,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };

        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset: (ehdr_size + phdr_size) as u64,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: PAGE_SIZE,
        };

        let mut file = Vec::new();
        file.extend_from_slice(bytemuck::bytes_of(&ehdr));
        file.extend_from_slice(bytemuck::bytes_of(&phdr));
        file.extend_from_slice(payload);
        file
    }

    #[test]
    fn get_bitness_reads_class_byte() {
        let file = build_minimal_elf64(0x1000, 0x1000, 8, 8, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(get_bitness(&file), Some(64));
    }

    #[test]
    fn get_bitness_none_on_short_file() {
        assert_eq!(get_bitness(&[0u8; 4]), None);
    }

    #[test]
    fn loads_a_minimal_physical_image() {
        // `FakeMemory::allocate_pages_at` ignores the requested address and
        // hands back scratch-buffer memory instead (real physical addresses
        // aren't backed by anything in a hosted test process); since each
        // segment is deposited at whatever that call returns rather than at
        // `info.physical_base` (computed straight from the requested
        // `p_paddr` hull, as in the original), this only checks that
        // validation and the deposit succeed, not the destination contents.
        let payload = [0xAAu8; 16];
        let file = build_minimal_elf64(0x2000, 0x2000, 16, 16, &payload);
        let mut memory = FakeMemory::new(4 * PAGE_SIZE as usize);

        let info = load(&file, UseVirtualAddress::No, AllocateAnywhere::No, &mut memory).expect("load should succeed");

        assert_eq!(info.bitness, 64);
        assert!(info.physical_valid);
        assert_eq!(info.entrypoint, 0x2000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = build_minimal_elf64(0x2000, 0x2000, 16, 16, &[0u8; 16]);
        file[0] = 0x00;
        let mut memory = FakeMemory::new(PAGE_SIZE as usize);
        assert_eq!(load(&file, UseVirtualAddress::No, AllocateAnywhere::No, &mut memory), Err(LoadError::InvalidMagic));
    }

    #[test]
    fn rejects_alloc_anywhere_without_virtual_addressing() {
        let file = build_minimal_elf64(0x2000, 0x2000, 16, 16, &[0u8; 16]);
        let mut memory = FakeMemory::new(PAGE_SIZE as usize);
        assert_eq!(
            load(&file, UseVirtualAddress::No, AllocateAnywhere::Yes, &mut memory),
            Err(LoadError::InvalidLoadOptions)
        );
    }

    #[test]
    fn rejects_32_bit_class_with_virtual_addressing_requested() {
        let ehdr_size = core::mem::size_of::<Elf32Ehdr>();
        let mut ident = [0u8; EI_NIDENT];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[EI_CLASS] = ELFCLASS32;
        ident[EI_DATA] = ELFDATA2LSB;
        let ehdr = Elf32Ehdr {
            e_ident: ident,
            e_type: ET_EXEC,
            e_machine: EM_386,
            e_version: 1,
            e_entry: 0x1000,
            e_phoff: ehdr_size as u32,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehdr_size as u16,
            e_phentsize: core::mem::size_of::<Elf32Phdr>() as u16,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let file = bytemuck::bytes_of(&ehdr).to_vec();
        let mut memory = FakeMemory::new(PAGE_SIZE as usize);
        assert_eq!(
            load(&file, UseVirtualAddress::Yes, AllocateAnywhere::No, &mut memory),
            Err(LoadError::InvalidLoadOptions)
        );
    }

    #[test]
    fn allocate_anywhere_computes_virtual_hull_and_uses_memory_manager() {
        let payload = [0x42u8; 16];
        let file = build_minimal_elf64(HIGHER_HALF_64 + 0x1000, HIGHER_HALF_64 + 0x1000, 16, 16, &payload);
        let mut memory = FakeMemory::new(4 * PAGE_SIZE as usize);

        let info = load(&file, UseVirtualAddress::Yes, AllocateAnywhere::Yes, &mut memory).expect("load should succeed");

        assert_eq!(info.bitness, 64);
        assert!(info.physical_valid);
        assert_eq!(info.virtual_base, page_round_down(HIGHER_HALF_64 + 0x1000));
        assert_eq!(info.virtual_ceiling, page_round_up(HIGHER_HALF_64 + 0x1000 + 16));

        let written = unsafe { core::slice::from_raw_parts(info.physical_base.as_mut_ptr::<u8>(), 16) };
        assert_eq!(written, &payload[..]);
    }
}
