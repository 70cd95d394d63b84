// Partition-table decoding for raw disk images.
//
// A `DiskImage` answers exactly one question: "give me a byte window over
// partition N". Both MBR (with EBR-chained logical partitions) and GPT
// layouts are understood. Partition numbers start at 1; under MBR the four
// primary slots are 1..=4 and logical partitions count from 5, under GPT the
// number is simply the entry's position in the table.

use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::io;
use std::path::Path;

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{FromBytes, FromZeroes, Unaligned};

use crate::image::{ByteWindow, WindowError};

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const MBR_TABLE_OFFSET: u64 = 446;

// MBR types marking an extended partition containing an EBR chain.
const EXTENDED_CHS: u8 = 0x05;
const EXTENDED_LBA: u8 = 0x0F;

/// The highest partition number a request may name.
pub const MAX_PARTITION: u32 = 128;

#[derive(Debug)]
pub enum DiskError {
    Io(io::Error),
    Window(WindowError),
    /// Neither an MBR boot signature nor a GPT header was found.
    UnknownScheme,
    /// The table was recognized but is internally inconsistent.
    Corrupt(String),
    NoSuchPartition(u32),
}

impl error::Error for DiskError {}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiskError::Io(e) => write!(f, "disk image I/O error: {e}"),
            DiskError::Window(e) => write!(f, "{e}"),
            DiskError::UnknownScheme => {
                write!(f, "unable to determine partitioning scheme")
            }
            DiskError::Corrupt(msg) => write!(f, "corrupt partition table: {msg}"),
            DiskError::NoSuchPartition(n) => write!(f, "no partition numbered {n}"),
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(e: io::Error) -> Self {
        DiskError::Io(e)
    }
}

impl From<WindowError> for DiskError {
    fn from(e: WindowError) -> Self {
        DiskError::Window(e)
    }
}

#[derive(FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
struct MbrEntry {
    status: u8,
    chs_first: [u8; 3],
    part_type: u8,
    chs_last: [u8; 3],
    first_lba: U32<LittleEndian>,
    sectors: U32<LittleEndian>,
}

#[derive(FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
struct GptHeader {
    signature: [u8; 8],
    revision: U32<LittleEndian>,
    header_size: U32<LittleEndian>,
    header_crc: U32<LittleEndian>,
    reserved: [u8; 4],
    current_lba: U64<LittleEndian>,
    backup_lba: U64<LittleEndian>,
    first_usable: U64<LittleEndian>,
    last_usable: U64<LittleEndian>,
    disk_guid: [u8; 16],
    entries_lba: U64<LittleEndian>,
    entry_count: U32<LittleEndian>,
    entry_size: U32<LittleEndian>,
    entries_crc: U32<LittleEndian>,
}

#[derive(FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
struct GptEntry {
    type_guid: [u8; 16],
    part_guid: [u8; 16],
    first_lba: U64<LittleEndian>,
    last_lba: U64<LittleEndian>,
    flags: U64<LittleEndian>,
    name: [u8; 72],
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: u64,
}

/// A partitioned disk image.
#[derive(Debug)]
pub struct DiskImage {
    window: ByteWindow,
    sector_size: u64,
    partitions: BTreeMap<u32, Extent>,
}

impl DiskImage {
    /// Opens the image file at *path* and decodes its partition table.
    pub fn open(path: &Path) -> Result<DiskImage, DiskError> {
        DiskImage::from_window(ByteWindow::open(path)?)
    }

    /// Decodes the partition table found in *window*. GPT is probed first;
    /// a GPT disk carries a protective MBR which must not win the probe.
    pub fn from_window(window: ByteWindow) -> Result<DiskImage, DiskError> {
        let sector_size = 512;
        let partitions = match read_gpt(&window, sector_size)? {
            Some(parts) => parts,
            None => read_mbr(&window, sector_size)?.ok_or(DiskError::UnknownScheme)?,
        };
        Ok(DiskImage {
            window,
            sector_size,
            partitions,
        })
    }

    /// Returns a byte window over partition *num* (numbered from 1).
    pub fn partition(&self, num: u32) -> Result<ByteWindow, DiskError> {
        if num < 1 || num > MAX_PARTITION {
            return Err(DiskError::NoSuchPartition(num));
        }
        let extent = self
            .partitions
            .get(&num)
            .ok_or(DiskError::NoSuchPartition(num))?;
        Ok(self.window.subwindow(extent.offset, extent.len)?)
    }

    /// The partition numbers present in the image, in ascending order.
    pub fn partition_numbers(&self) -> Vec<u32> {
        self.partitions.keys().copied().collect()
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }
}

fn read_gpt(window: &ByteWindow, ss: u64) -> Result<Option<BTreeMap<u32, Extent>>, DiskError> {
    if window.len() < ss * 2 {
        return Ok(None);
    }
    let raw = window.read_vec(ss, 92)?;
    let header = GptHeader::ref_from_prefix(&raw)
        .ok_or_else(|| DiskError::Corrupt("short GPT header".into()))?;
    if header.signature != GPT_SIGNATURE {
        return Ok(None);
    }
    let entry_size = header.entry_size.get() as u64;
    if entry_size < 128 {
        return Err(DiskError::Corrupt(format!(
            "GPT entry size {entry_size} is below the 128-byte minimum"
        )));
    }
    let count = header.entry_count.get().min(MAX_PARTITION);
    let table_offset = header.entries_lba.get() * ss;
    let mut parts = BTreeMap::new();
    for index in 0..count {
        let raw = window.read_vec(table_offset + u64::from(index) * entry_size, 128)?;
        let entry = GptEntry::ref_from_prefix(&raw)
            .ok_or_else(|| DiskError::Corrupt("short GPT entry".into()))?;
        if entry.type_guid == [0u8; 16] {
            continue;
        }
        let first = entry.first_lba.get();
        let last = entry.last_lba.get();
        if last < first {
            return Err(DiskError::Corrupt(format!(
                "GPT entry {index} ends before it starts"
            )));
        }
        parts.insert(
            index + 1,
            Extent {
                offset: first * ss,
                len: (last - first + 1) * ss,
            },
        );
    }
    Ok(Some(parts))
}

fn read_mbr(window: &ByteWindow, ss: u64) -> Result<Option<BTreeMap<u32, Extent>>, DiskError> {
    if window.len() < ss {
        return Ok(None);
    }
    let sector = window.read_vec(0, 512)?;
    if sector[510..512] != BOOT_SIGNATURE {
        return Ok(None);
    }
    let mut parts = BTreeMap::new();
    let mut extended: Option<u64> = None;
    for index in 0..4u32 {
        let raw = &sector[(MBR_TABLE_OFFSET as usize + index as usize * 16)..][..16];
        let entry = MbrEntry::ref_from_prefix(raw)
            .ok_or_else(|| DiskError::Corrupt("short MBR entry".into()))?;
        match entry.part_type {
            0 => continue,
            EXTENDED_CHS | EXTENDED_LBA => {
                extended = Some(u64::from(entry.first_lba.get()));
            }
            _ => {
                parts.insert(
                    index + 1,
                    Extent {
                        offset: u64::from(entry.first_lba.get()) * ss,
                        len: u64::from(entry.sectors.get()) * ss,
                    },
                );
            }
        }
    }
    if let Some(ext_base) = extended {
        read_ebr_chain(window, ss, ext_base, &mut parts)?;
    }
    Ok(Some(parts))
}

// Logical partitions live in a linked list of EBRs inside the extended
// partition. Entry 0 of each EBR is the logical partition (relative to the
// EBR itself), entry 1 links to the next EBR (relative to the extended
// partition's base).
fn read_ebr_chain(
    window: &ByteWindow,
    ss: u64,
    ext_base: u64,
    parts: &mut BTreeMap<u32, Extent>,
) -> Result<(), DiskError> {
    let mut ebr_lba = ext_base;
    let mut number = 5u32;
    while number <= MAX_PARTITION {
        let sector = window.read_vec(ebr_lba * ss, 512)?;
        if sector[510..512] != BOOT_SIGNATURE {
            return Err(DiskError::Corrupt(format!(
                "EBR at sector {ebr_lba} lacks a boot signature"
            )));
        }
        let first = MbrEntry::ref_from_prefix(&sector[MBR_TABLE_OFFSET as usize..][..16])
            .ok_or_else(|| DiskError::Corrupt("short EBR entry".into()))?;
        if first.part_type != 0 {
            parts.insert(
                number,
                Extent {
                    offset: (ebr_lba + u64::from(first.first_lba.get())) * ss,
                    len: u64::from(first.sectors.get()) * ss,
                },
            );
            number += 1;
        }
        let next = MbrEntry::ref_from_prefix(&sector[MBR_TABLE_OFFSET as usize + 16..][..16])
            .ok_or_else(|| DiskError::Corrupt("short EBR entry".into()))?;
        match next.part_type {
            0 => break,
            EXTENDED_CHS | EXTENDED_LBA => {
                let link = ext_base + u64::from(next.first_lba.get());
                if link == ebr_lba {
                    return Err(DiskError::Corrupt(format!(
                        "EBR chain loops at sector {ebr_lba}"
                    )));
                }
                ebr_lba = link;
            }
            t => {
                return Err(DiskError::Corrupt(format!(
                    "EBR link entry has unexpected type {t:#04x}"
                )))
            }
        }
    }
    Ok(())
}
