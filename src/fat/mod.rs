// Read-only FAT12/16/32 file-systems over a byte window.
//
// The layout references that matter here: the wikipedia page on the design
// of the FAT file system, and the Microsoft EFI FAT32 specification. The
// type of a volume is decided *only* by its count of data clusters (below
// 4085 is FAT12, below 65525 is FAT16, anything else FAT32); the file-system
// name string in the extended BPB is advisory and untrusted.

pub mod dir;
pub mod file;
pub mod layout;
pub mod table;

use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use zerocopy::FromBytes;

use crate::image::{ByteWindow, WindowError};
use dir::DirEntry;
use file::FatFile;
use layout::{
    BiosParameterBlock, ExtendedBpb, Fat32Bpb, InfoSector, BPB_SIZE, FAT32_BPB_SIZE, INFO_SIG1,
    INFO_SIG2, INFO_SIG3,
};
use table::{FatTable, FatType};

const FAT12_MAX_CLUSTERS: u64 = 4085;
const FAT16_MAX_CLUSTERS: u64 = 65525;

#[derive(Debug)]
pub enum FatError {
    /// The volume's structure is invalid or unusable.
    Damaged(String),
    /// A cluster chain ran into the bad-cluster marker.
    BadCluster(u32),
    /// A cluster chain revisited a cluster.
    ChainCycle(u32),
    /// A FAT entry pointed outside the data area.
    ChainOutOfRange(u32),
    NotFound(String),
    NotADirectory(String),
    IsADirectory(String),
    Window(WindowError),
}

impl error::Error for FatError {}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FatError::Damaged(msg) => write!(f, "damaged file-system: {msg}"),
            FatError::BadCluster(c) => write!(f, "chain references bad cluster {c}"),
            FatError::ChainCycle(c) => write!(f, "cluster chain cycles at {c}"),
            FatError::ChainOutOfRange(c) => {
                write!(f, "cluster {c} is outside the data area")
            }
            FatError::NotFound(p) => write!(f, "{p}: not found"),
            FatError::NotADirectory(p) => write!(f, "{p}: not a directory"),
            FatError::IsADirectory(p) => write!(f, "{p}: is a directory"),
            FatError::Window(e) => write!(f, "{e}"),
        }
    }
}

impl From<WindowError> for FatError {
    fn from(e: WindowError) -> Self {
        FatError::Window(e)
    }
}

// Location of a directory's contents.
#[derive(Debug, Clone, Copy)]
enum RootDir {
    /// FAT12/16: a fixed region of the volume.
    Region { offset: u64, len: u64 },
    /// FAT32: an ordinary cluster chain.
    Cluster(u32),
}

/// The result of resolving a path: either the root directory itself or an
/// entry of its parent directory.
#[derive(Debug, Clone)]
pub enum Located {
    Root,
    Entry(DirEntry),
}

/// A FAT file-system bound to one partition window. All reads go through
/// shared references, so a single instance can serve any number of
/// concurrent transfers.
pub struct FatFileSystem {
    window: ByteWindow,
    fat_type: FatType,
    bytes_per_sector: u32,
    cluster_size: u32,
    table: FatTable,
    root: RootDir,
    data_offset: u64,
    label: String,
    dirty: bool,
    damaged: AtomicBool,
}

impl fmt::Debug for FatFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FatFileSystem")
            .field("fat_type", &self.fat_type.name())
            .field("label", &self.label)
            .field("cluster_size", &self.cluster_size)
            .finish()
    }
}

impl FatFileSystem {
    /// Parses and validates the volume headers at the start of *window*.
    pub fn new(window: ByteWindow) -> Result<FatFileSystem, FatError> {
        let sector = window
            .read_vec(0, 512)
            .map_err(|_| FatError::Damaged("volume is shorter than one sector".into()))?;
        if sector[510..512] != [0x55, 0xAA] {
            return Err(FatError::Damaged("missing 0x55AA boot signature".into()));
        }
        let bpb = BiosParameterBlock::ref_from_prefix(&sector)
            .ok_or_else(|| FatError::Damaged("short BPB".into()))?;

        let bps = u64::from(bpb.bytes_per_sector.get());
        if ![512, 1024, 2048, 4096].contains(&bps) {
            return Err(FatError::Damaged(format!("bytes per sector is {bps}")));
        }
        let spc = u64::from(bpb.sectors_per_cluster);
        if spc == 0 || !spc.is_power_of_two() {
            return Err(FatError::Damaged(format!("sectors per cluster is {spc}")));
        }
        let reserved = u64::from(bpb.reserved_sectors.get());
        if reserved < 1 {
            return Err(FatError::Damaged("no reserved sectors".into()));
        }
        let fat_count = u64::from(bpb.fat_count);
        if !(1..=2).contains(&fat_count) {
            return Err(FatError::Damaged(format!("FAT count is {fat_count}")));
        }

        let fat32_bpb = Fat32Bpb::ref_from_prefix(&sector[BPB_SIZE..])
            .ok_or_else(|| FatError::Damaged("short FAT32 BPB".into()))?;
        let fat_sectors = match bpb.sectors_per_fat_16.get() {
            0 => u64::from(fat32_bpb.sectors_per_fat_32.get()),
            n => u64::from(n),
        };
        if fat_sectors == 0 {
            return Err(FatError::Damaged("sectors per FAT is 0".into()));
        }
        let total_sectors = match bpb.total_sectors_16.get() {
            0 => u64::from(bpb.total_sectors_32.get()),
            n => u64::from(n),
        };
        if total_sectors == 0 {
            return Err(FatError::Damaged("total sector count is 0".into()));
        }

        let root_entries = u64::from(bpb.max_root_entries.get());
        let root_bytes = root_entries * layout::DIR_ENTRY_SIZE as u64;
        let root_sectors = root_bytes.div_ceil(bps);
        let overhead = reserved + fat_count * fat_sectors + root_sectors;
        let data_sectors = total_sectors
            .checked_sub(overhead)
            .ok_or_else(|| FatError::Damaged("data area would be negative".into()))?;
        let cluster_count = data_sectors / spc;
        let fat_type = if cluster_count < FAT12_MAX_CLUSTERS {
            FatType::Fat12
        } else if cluster_count < FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        // Cross-check the fields specific to the detected type; a mismatch
        // means the headers are lying about something fundamental.
        if fat_type == FatType::Fat32 {
            if bpb.sectors_per_fat_16.get() != 0 || root_entries != 0 {
                return Err(FatError::Damaged(
                    "cluster count says FAT32 but the headers carry \
                     FAT12/16 fields"
                        .into(),
                ));
            }
        } else if root_entries == 0 || bpb.sectors_per_fat_16.get() == 0 {
            return Err(FatError::Damaged(format!(
                "cluster count says {} but the headers carry FAT32 fields",
                fat_type.name()
            )));
        }

        let fat_offset = reserved * bps;
        let root_offset = fat_offset + fat_count * fat_sectors * bps;
        let data_offset = root_offset + root_bytes;
        let table = FatTable::new(
            window
                .subwindow(fat_offset, fat_sectors * bps)
                .map_err(|e| FatError::Damaged(e.to_string()))?,
            fat_type,
            cluster_count as u32,
        );

        // The extended BPB sits after the FAT32 parameter block on FAT32
        // volumes, directly after the BPB otherwise.
        let ebpb_offset = if fat_type == FatType::Fat32 {
            BPB_SIZE + FAT32_BPB_SIZE
        } else {
            BPB_SIZE
        };
        let ebpb = ExtendedBpb::ref_from_prefix(&sector[ebpb_offset..])
            .ok_or_else(|| FatError::Damaged("short extended BPB".into()))?;
        let label = if [0x28, 0x29].contains(&ebpb.extended_boot_sig) {
            ebpb.volume_label
                .iter()
                .map(|&b| char::from(b))
                .collect::<String>()
                .trim_end_matches(' ')
                .to_string()
        } else {
            String::new()
        };

        let root = if fat_type == FatType::Fat32 {
            RootDir::Cluster(fat32_bpb.root_dir_cluster.get())
        } else {
            RootDir::Region {
                offset: root_offset,
                len: root_bytes,
            }
        };

        let damaged = AtomicBool::new(false);
        let mut dirty = false;
        // The reserved FAT entry 1 carries the clean-shutdown and hardware
        // error bits on FAT16/32.
        if let (kind @ (FatType::Fat16 | FatType::Fat32), Ok(flags)) = (fat_type, table.entry(1)) {
            let (clean_bit, error_bit) = match kind {
                FatType::Fat16 => (0x8000, 0x4000),
                _ => (0x0800_0000, 0x0400_0000),
            };
            if flags & clean_bit == 0 {
                warn!("file-system has the dirty bit set; continuing read-only");
                dirty = true;
            }
            if flags & error_bit == 0 {
                warn!("file-system has the I/O errors bit set");
                damaged.store(true, Ordering::Relaxed);
            }
        }
        if fat_type == FatType::Fat32 {
            let info = fat32_bpb.info_sector.get();
            if !(info == 0 || info == 0xFFFF) {
                match window.read_vec(u64::from(info) * bps, 512) {
                    Ok(raw) => {
                        let sect = InfoSector::ref_from_prefix(&raw)
                            .ok_or_else(|| FatError::Damaged("short info sector".into()))?;
                        if sect.sig1 != INFO_SIG1 || sect.sig2 != INFO_SIG2 || sect.sig3 != INFO_SIG3
                        {
                            warn!("FAT32 info sector has invalid signatures");
                            damaged.store(true, Ordering::Relaxed);
                        }
                    }
                    Err(_) => {
                        warn!("FAT32 info sector lies outside the volume");
                        damaged.store(true, Ordering::Relaxed);
                    }
                }
            }
        }

        Ok(FatFileSystem {
            window,
            fat_type,
            bytes_per_sector: bps as u32,
            cluster_size: (bps * spc) as u32,
            table,
            root,
            data_offset,
            label,
            dirty,
            damaged,
        })
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// True if the volume was not cleanly unmounted by its last writer.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True if a global structural defect has been observed, either at mount
    /// time or while following a chain.
    pub fn is_damaged(&self) -> bool {
        self.damaged.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_damaged(&self) {
        self.damaged.store(true, Ordering::Relaxed);
    }

    pub(crate) fn window(&self) -> &ByteWindow {
        &self.window
    }

    pub(crate) fn table(&self) -> &FatTable {
        &self.table
    }

    /// Byte offset of the given data cluster within the volume.
    pub(crate) fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset + u64::from(cluster - 2) * u64::from(self.cluster_size)
    }

    fn read_directory(self: &Arc<Self>, root: RootDir) -> Result<Vec<DirEntry>, FatError> {
        let fat32 = self.fat_type == FatType::Fat32;
        let raw = match root {
            RootDir::Region { offset, len } => self.window.read_vec(offset, len as usize)?,
            RootDir::Cluster(cluster) => FatFile::new(self, cluster, None)?.read_to_vec()?,
        };
        Ok(dir::decode_directory(&raw, fat32))
    }

    /// Resolves *path* (`/`-separated, leading slash optional) to a
    /// directory entry. Matching is case-insensitive against both the long
    /// and the 8.3 name of each entry.
    pub fn lookup(self: &Arc<Self>, path: &str) -> Result<Located, FatError> {
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        if segments.peek().is_none() {
            return Ok(Located::Root);
        }
        let mut dir = self.root;
        let mut walked = String::new();
        while let Some(segment) = segments.next() {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(segment);
            let upper = segment.to_uppercase();
            let entry = self
                .read_directory(dir)?
                .into_iter()
                .find(|e| e.name.to_uppercase() == upper || e.short_name.to_uppercase() == upper)
                .ok_or_else(|| FatError::NotFound(walked.clone()))?;
            if segments.peek().is_none() {
                return Ok(Located::Entry(entry));
            }
            if !entry.is_dir() {
                return Err(FatError::NotADirectory(walked));
            }
            // A ".." entry pointing back at the root stores cluster 0.
            dir = match entry.first_cluster {
                0 => self.root,
                c => RootDir::Cluster(c),
            };
        }
        unreachable!()
    }

    /// Lists the entries of the directory named by *path*.
    pub fn read_dir(self: &Arc<Self>, path: &str) -> Result<Vec<DirEntry>, FatError> {
        match self.lookup(path)? {
            Located::Root => self.read_directory(self.root),
            Located::Entry(e) if e.is_dir() => {
                let root = match e.first_cluster {
                    0 => self.root,
                    c => RootDir::Cluster(c),
                };
                self.read_directory(root)
            }
            Located::Entry(_) => Err(FatError::NotADirectory(path.to_string())),
        }
    }

    /// Opens the file named by *path* for reading.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<FatFile, FatError> {
        match self.lookup(path)? {
            Located::Root => Err(FatError::IsADirectory(path.to_string())),
            Located::Entry(e) if e.is_dir() => Err(FatError::IsADirectory(path.to_string())),
            Located::Entry(e) => FatFile::new(self, e.first_cluster, Some(u64::from(e.size))),
        }
    }
}
