//! MBR (Master Boot Record) partition table parsing.
//!
//! Grounded on the teacher's `fs/partitions/mbr.rs` (packed entry struct,
//! bit-packed CHS fields, `From<u8> for PartitionType`) and on
//! `original_source/Loader/Loader.cpp`'s `initialize_from_mbr`, which this
//! module's [`initialize_from_mbr`] is a direct, recursive-EBR-chain-aware
//! port of.

use bytemuck::{Pod, Zeroable};

use crate::firmware::Disk;
use crate::fs::{self, FileSystemEntry, FilesystemTable, LbaRange};

/// Signature string at byte 512 of a GPT-protective MBR's first sector,
/// used by [`fs::detect_all_filesystems`] to recognize and skip GPT disks
/// before ever looking at the legacy MBR partition table.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// The two-byte `0xAA55` signature at the end of a valid boot sector.
pub const BOOT_SIGNATURE: u16 = 0xAA55;

const OFFSET_TO_PARTITIONS: usize = 0x01BE;
const EMPTY_PARTITION_TYPE: u8 = 0x00;
const EBR_PARTITION_TYPE: u8 = 0x05;

/// One raw 16-byte MBR partition table entry.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct MbrPartitionEntry {
    pub status: u8,
    pub chs_begin: [u8; 3],
    pub partition_type: u8,
    pub chs_end: [u8; 3],
    pub first_block: u32,
    pub block_count: u32,
}

const _: () = assert!(core::mem::size_of::<MbrPartitionEntry>() == 16);

impl MbrPartitionEntry {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status & 0x80 != 0
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.partition_type != EMPTY_PARTITION_TYPE
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.partition_type == EBR_PARTITION_TYPE
    }
}

fn read_entries(block: &[u8]) -> [MbrPartitionEntry; 4] {
    let mut entries = [MbrPartitionEntry::zeroed(); 4];
    for (i, entry) in entries.iter_mut().enumerate() {
        let start = OFFSET_TO_PARTITIONS + i * 16;
        *entry = *bytemuck::from_bytes(&block[start..start + 16]);
    }
    entries
}

/// Walks an MBR (and any chained EBRs) found in `block`, registering a
/// filesystem entry for each partition a filesystem is detected on.
///
/// `base_index` numbers partitions across the whole chain (0-3 for the
/// primary table, continuing upward through each EBR link); `sector_offset`
/// is added to every `first_block` found, since EBR entries store offsets
/// relative to the EBR that contains them, not the disk origin.
pub fn initialize_from_mbr(
    disk: &dyn Disk,
    disk_handle: u32,
    table: &mut FilesystemTable,
    block: &[u8],
    base_index: u32,
    sector_offset: u64,
) {
    let entries = read_entries(block);
    let is_ebr = base_index != 0;
    let max_partitions = if is_ebr { 2 } else { 4 };

    for (i, partition) in entries.iter().take(max_partitions).enumerate() {
        if !partition.is_used() {
            continue;
        }

        let real_offset = sector_offset + u64::from(partition.first_block);

        if partition.is_extended() {
            if is_ebr && i == 0 {
                crate::warnln!("disk {:#x}: EBR with chain at index 0", disk_handle);
                break;
            }

            let mut ebr_block = [0u8; 512];
            if disk.read(disk_handle, real_offset * 512, &mut ebr_block) {
                initialize_from_mbr(
                    disk,
                    disk_handle,
                    table,
                    &ebr_block,
                    base_index + if is_ebr { 1 } else { 4 },
                    real_offset,
                );
            }

            continue;
        }

        if i == 1 && is_ebr {
            crate::warnln!("disk {:#x}: EBR with a non-EBR entry at index 1", disk_handle);
            break;
        }

        let mut first_partition_block = [0u8; 4096];
        let range = LbaRange::new(real_offset, u64::from(partition.block_count));

        if !disk.read_blocks(disk_handle, &mut first_partition_block, range.begin(), 4096 / 512) {
            continue;
        }

        if let Some(filesystem) = fs::try_detect(disk_handle, range, &first_partition_block) {
            table.add(FileSystemEntry {
                disk_handle,
                partition_kind: fs::PartitionKind::Mbr,
                partition_index: Some(base_index + i as u32),
                filesystem,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    use crate::firmware::DiskInfo;

    /// A disk backed by a flat byte buffer, addressed in 512-byte sectors,
    /// used to exercise [`initialize_from_mbr`]'s EBR-chain traversal without
    /// a real block device.
    struct FakeDisk {
        info: [DiskInfo; 1],
        bytes: Vec<u8>,
    }

    impl Disk for FakeDisk {
        fn list_disks(&self) -> &[DiskInfo] {
            &self.info
        }

        fn read(&self, handle: u32, byte_offset: u64, buffer: &mut [u8]) -> bool {
            if handle != self.info[0].handle {
                return false;
            }
            let start = byte_offset as usize;
            let end = start + buffer.len();
            if end > self.bytes.len() {
                buffer.fill(0);
                return true;
            }
            buffer.copy_from_slice(&self.bytes[start..end]);
            true
        }

        fn read_blocks(&self, handle: u32, buffer: &mut [u8], first_sector: u64, sector_count: u64) -> bool {
            self.read(handle, first_sector * 512, &mut buffer[..(sector_count * 512) as usize])
        }
    }

    fn write_entry(sector: &mut [u8], index: usize, entry: MbrPartitionEntry) {
        let start = OFFSET_TO_PARTITIONS + index * 16;
        sector[start..start + 16].copy_from_slice(bytemuck::bytes_of(&entry));
    }

    fn blank_sector() -> Vec<u8> {
        let mut sector = alloc::vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn entry(partition_type: u8, first_block: u32, block_count: u32) -> MbrPartitionEntry {
        MbrPartitionEntry {
            status: 0,
            chs_begin: [0; 3],
            partition_type,
            chs_end: [0; 3],
            first_block,
            block_count,
        }
    }

    /// Builds a disk with a primary MBR linking to a two-level EBR chain:
    /// MBR -> EBR at LBA 100 (data partition + link) -> EBR at LBA 150 (data
    /// partition, end of chain).
    fn two_level_ebr_chain_disk() -> FakeDisk {
        let disk_bytes_len = 200 * 512;
        let mut bytes = alloc::vec![0u8; disk_bytes_len];

        let mut mbr = blank_sector();
        write_entry(&mut mbr, 1, entry(EBR_PARTITION_TYPE, 100, 1));
        bytes[0..512].copy_from_slice(&mbr);

        let mut ebr1 = blank_sector();
        write_entry(&mut ebr1, 0, entry(0x0c, 1, 10));
        write_entry(&mut ebr1, 1, entry(EBR_PARTITION_TYPE, 50, 1));
        bytes[100 * 512..100 * 512 + 512].copy_from_slice(&ebr1);

        let mut ebr2 = blank_sector();
        write_entry(&mut ebr2, 0, entry(0x0c, 1, 5));
        bytes[150 * 512..150 * 512 + 512].copy_from_slice(&ebr2);

        FakeDisk {
            info: [DiskInfo { handle: 0, bytes_per_sector: 512, total_sectors: 200 }],
            bytes,
        }
    }

    #[test]
    fn walks_a_two_level_ebr_chain_without_registering_unrecognized_filesystems() {
        let disk = two_level_ebr_chain_disk();
        let mut table = FilesystemTable::new();
        let mut mbr_with_link = blank_sector();
        write_entry(&mut mbr_with_link, 1, entry(EBR_PARTITION_TYPE, 100, 1));

        initialize_from_mbr(&disk, 0, &mut table, &mbr_with_link, 0, 0);

        // Neither EBR-linked data partition carries a FAT32 signature, so no
        // filesystem is registered — but no panic and no infinite recursion
        // means the chain was walked to its end.
        assert!(table.is_empty());
    }

    #[test]
    fn ebr_with_extended_entry_at_index_zero_is_malformed_and_stops() {
        let mut bytes = alloc::vec![0u8; 200 * 512];
        let mut ebr = blank_sector();
        // Index 0 extended inside an EBR is invalid: the chain link must sit
        // at index 1.
        write_entry(&mut ebr, 0, entry(EBR_PARTITION_TYPE, 1, 1));
        bytes[100 * 512..100 * 512 + 512].copy_from_slice(&ebr);

        let disk = FakeDisk { info: [DiskInfo { handle: 0, bytes_per_sector: 512, total_sectors: 200 }], bytes };
        let mut table = FilesystemTable::new();

        initialize_from_mbr(&disk, 0, &mut table, &ebr, 4, 100);

        assert!(table.is_empty());
    }

    #[test]
    fn ebr_with_non_extended_entry_at_index_one_is_malformed_and_stops() {
        let mut ebr = blank_sector();
        write_entry(&mut ebr, 0, entry(0x0c, 1, 10));
        // Index 1 inside an EBR must be empty or another link; a plain data
        // partition there is malformed.
        write_entry(&mut ebr, 1, entry(0x0c, 2, 10));

        let disk =
            FakeDisk { info: [DiskInfo { handle: 0, bytes_per_sector: 512, total_sectors: 200 }], bytes: alloc::vec![0u8; 200 * 512] };
        let mut table = FilesystemTable::new();

        initialize_from_mbr(&disk, 0, &mut table, &ebr, 4, 100);

        // The index-0 partition has no FAT32 signature, so it adds nothing;
        // the index-1 entry then trips the malformed-chain check and breaks
        // the loop without reading anything further.
        assert!(table.is_empty());
    }
}
