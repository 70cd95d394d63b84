// Test support: builds small but structurally honest FAT volumes (and MBR
// images wrapping them) entirely in memory. Geometry is fixed per FAT type
// and chosen so that cluster-count detection lands where intended.

use crate::fat::layout::{
    lfn_checksum, DirectoryEntry, LongFilenameEntry, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LFN,
    ATTR_VOLUME, DIR_ENTRY_SIZE, LFN_CHARS_PER_ENTRY,
};
use crate::fat::table::FatType;
use zerocopy::{AsBytes, FromZeroes};

struct Geometry {
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    fat_sectors: u32,
    root_entries: u32,
    total_sectors: u32,
}

const BPS: u32 = 512;

fn geometry(kind: FatType) -> Geometry {
    match kind {
        // A 1.44M floppy: 2847 data clusters.
        FatType::Fat12 => Geometry {
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_sectors: 9,
            root_entries: 224,
            total_sectors: 2880,
        },
        // 4M volume, 8095 data clusters.
        FatType::Fat16 => Geometry {
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_sectors: 32,
            root_entries: 512,
            total_sectors: 8192,
        },
        // Just over the FAT16 limit: 66000 data clusters.
        FatType::Fat32 => Geometry {
            sectors_per_cluster: 1,
            reserved_sectors: 32,
            fat_sectors: 516,
            root_entries: 0,
            total_sectors: 32 + 2 * 516 + 66000,
        },
    }
}

enum Node {
    File { name: String, data: Vec<u8> },
    Dir { name: String, children: Vec<(String, Vec<u8>)> },
}

pub struct ImageBuilder {
    kind: FatType,
    label: [u8; 11],
    nodes: Vec<Node>,
}

impl ImageBuilder {
    /// Size in bytes of one FAT copy in the FAT16 test geometry.
    pub const FAT16_FAT_BYTES: u64 = 32 * 512;

    pub fn new(kind: FatType) -> ImageBuilder {
        ImageBuilder {
            kind,
            label: *b"NO NAME    ",
            nodes: Vec::new(),
        }
    }

    pub fn label(mut self, label: &[u8]) -> ImageBuilder {
        self.label = *b"           ";
        self.label[..label.len()].copy_from_slice(label);
        self
    }

    /// Adds a file. A single `/` creates (or reuses) a top-level directory.
    pub fn file(mut self, path: &str, data: &[u8]) -> ImageBuilder {
        match path.split_once('/') {
            None => self.nodes.push(Node::File {
                name: path.to_string(),
                data: data.to_vec(),
            }),
            Some((dir, rest)) => {
                let child = (rest.to_string(), data.to_vec());
                for node in &mut self.nodes {
                    if let Node::Dir { name, children } = node {
                        if name == dir {
                            children.push(child);
                            return self;
                        }
                    }
                }
                self.nodes.push(Node::Dir {
                    name: dir.to_string(),
                    children: vec![child],
                });
            }
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let geo = geometry(self.kind);
        let cs = geo.sectors_per_cluster * BPS;
        let mut img = vec![0u8; (geo.total_sectors * BPS) as usize];
        let fat_offset = geo.reserved_sectors * BPS;
        let root_offset = fat_offset + 2 * geo.fat_sectors * BPS;
        let root_bytes = geo.root_entries * DIR_ENTRY_SIZE as u32;
        let data_offset = root_offset + root_bytes;
        let data_sectors = geo.total_sectors
            - geo.reserved_sectors
            - 2 * geo.fat_sectors
            - root_bytes / BPS;

        let mut fat: Vec<u32> = vec![0; (data_sectors / geo.sectors_per_cluster + 2) as usize];
        let (fill, end) = match self.kind {
            FatType::Fat12 => (0x0FF8, 0x0FFF),
            FatType::Fat16 => (0xFFF8, 0xFFFF),
            FatType::Fat32 => (0x0FFF_FFF8, 0x0FFF_FFFF),
        };
        fat[0] = fill;
        fat[1] = end;
        let mut next_free = 2u32;

        // Writes *data* into freshly allocated clusters and returns the
        // first cluster of the chain (0 for empty data).
        let mut store = |fat: &mut Vec<u32>, img: &mut Vec<u8>, data: &[u8]| -> u32 {
            if data.is_empty() {
                return 0;
            }
            let clusters = data.len().div_ceil(cs as usize) as u32;
            let first = next_free;
            for i in 0..clusters {
                let this = next_free;
                next_free += 1;
                fat[this as usize] = if i + 1 == clusters { end } else { this + 1 };
                let chunk_start = (i * cs) as usize;
                let chunk = &data[chunk_start..data.len().min(chunk_start + cs as usize)];
                let offset = (data_offset + (this - 2) * cs) as usize;
                img[offset..offset + chunk.len()].copy_from_slice(chunk);
            }
            first
        };

        let mut root_content = Vec::new();
        if self.kind != FatType::Fat32 {
            // A volume label entry leads the root directory.
            let mut label_entry = DirectoryEntry::new_zeroed();
            label_entry.filename.copy_from_slice(&self.label[..8]);
            label_entry.ext.copy_from_slice(&self.label[8..]);
            label_entry.attr = ATTR_VOLUME;
            root_content.extend_from_slice(label_entry.as_bytes());
        }
        for node in &self.nodes {
            match node {
                Node::File { name, data } => {
                    let first = store(&mut fat, &mut img, data);
                    root_content.extend_from_slice(&make_entries(
                        name,
                        ATTR_ARCHIVE,
                        first,
                        data.len() as u32,
                    ));
                }
                Node::Dir { name, children } => {
                    let mut content = Vec::new();
                    // "." is fixed up after the directory's own cluster is
                    // known; ".." points at the root (cluster 0).
                    content.extend_from_slice(&make_entries(".", ATTR_DIRECTORY, 0, 0));
                    content.extend_from_slice(&make_entries("..", ATTR_DIRECTORY, 0, 0));
                    for (child, data) in children {
                        let first = store(&mut fat, &mut img, data);
                        content.extend_from_slice(&make_entries(
                            child,
                            ATTR_ARCHIVE,
                            first,
                            data.len() as u32,
                        ));
                    }
                    let first = store(&mut fat, &mut img, &content);
                    // Fix the "." entry now that the cluster is known.
                    let offset = (data_offset + (first - 2) * cs) as usize + 26;
                    img[offset..offset + 2].copy_from_slice(&(first as u16).to_le_bytes());
                    root_content.extend_from_slice(&make_entries(name, ATTR_DIRECTORY, first, 0));
                }
            }
        }

        let root_cluster = if self.kind == FatType::Fat32 {
            if root_content.is_empty() {
                // Keep the root chain valid even on an empty volume.
                root_content.resize(DIR_ENTRY_SIZE, 0);
            }
            store(&mut fat, &mut img, &root_content)
        } else {
            assert!(
                root_content.len() <= root_bytes as usize,
                "root directory overflow"
            );
            let off = root_offset as usize;
            img[off..off + root_content.len()].copy_from_slice(&root_content);
            0
        };

        write_fat(&mut img, &fat, self.kind, fat_offset, geo.fat_sectors * BPS);
        self.write_headers(&mut img, &geo, root_cluster);
        img
    }

    fn write_headers(&self, img: &mut [u8], geo: &Geometry, root_cluster: u32) {
        let mut bpb = crate::fat::layout::BiosParameterBlock::new_zeroed();
        bpb.jump = [0xEB, 0x3C, 0x90];
        bpb.oem_name = *b"PIBOOTD ";
        bpb.bytes_per_sector.set(BPS as u16);
        bpb.sectors_per_cluster = geo.sectors_per_cluster as u8;
        bpb.reserved_sectors.set(geo.reserved_sectors as u16);
        bpb.fat_count = 2;
        bpb.max_root_entries.set(geo.root_entries as u16);
        if geo.total_sectors < 65536 && self.kind != FatType::Fat32 {
            bpb.total_sectors_16.set(geo.total_sectors as u16);
        } else {
            bpb.total_sectors_32.set(geo.total_sectors);
        }
        bpb.media_descriptor = 0xF8;
        if self.kind != FatType::Fat32 {
            bpb.sectors_per_fat_16.set(geo.fat_sectors as u16);
        }
        img[..36].copy_from_slice(bpb.as_bytes());

        let mut ebpb = crate::fat::layout::ExtendedBpb::new_zeroed();
        ebpb.drive_number = 0x80;
        ebpb.extended_boot_sig = 0x29;
        ebpb.volume_label = self.label;
        ebpb.file_system = match self.kind {
            FatType::Fat12 => *b"FAT12   ",
            FatType::Fat16 => *b"FAT16   ",
            FatType::Fat32 => *b"FAT32   ",
        };

        if self.kind == FatType::Fat32 {
            let mut f32 = crate::fat::layout::Fat32Bpb::new_zeroed();
            f32.sectors_per_fat_32.set(geo.fat_sectors);
            f32.root_dir_cluster.set(root_cluster);
            f32.info_sector.set(1);
            f32.backup_sector.set(6);
            img[36..64].copy_from_slice(f32.as_bytes());
            img[64..90].copy_from_slice(ebpb.as_bytes());
            // Info sector.
            img[512..516].copy_from_slice(b"RRaA");
            img[512 + 484..512 + 488].copy_from_slice(b"rrAa");
            img[512 + 508..512 + 512].copy_from_slice(&[0x00, 0x00, 0x55, 0xAA]);
        } else {
            img[36..62].copy_from_slice(ebpb.as_bytes());
        }
        img[510] = 0x55;
        img[511] = 0xAA;
    }
}

fn write_fat(img: &mut [u8], fat: &[u32], kind: FatType, offset: u32, fat_bytes: u32) {
    let mut raw = vec![0u8; fat_bytes as usize];
    match kind {
        FatType::Fat12 => {
            for (i, &v) in fat.iter().enumerate() {
                let o = i + i / 2;
                if i % 2 == 0 {
                    raw[o] = (v & 0xFF) as u8;
                    raw[o + 1] = (raw[o + 1] & 0xF0) | ((v >> 8) & 0x0F) as u8;
                } else {
                    raw[o] = (raw[o] & 0x0F) | ((v & 0x0F) << 4) as u8;
                    raw[o + 1] = (v >> 4) as u8;
                }
            }
        }
        FatType::Fat16 => {
            for (i, &v) in fat.iter().enumerate() {
                raw[i * 2..i * 2 + 2].copy_from_slice(&(v as u16).to_le_bytes());
            }
        }
        FatType::Fat32 => {
            for (i, &v) in fat.iter().enumerate() {
                raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
    }
    for copy in 0..2 {
        let off = (offset + copy * fat_bytes) as usize;
        img[off..off + raw.len()].copy_from_slice(&raw);
    }
}

fn is_plain_sfn(base: &str, ext: &str) -> bool {
    let ok = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_~-".contains(c))
    };
    !base.is_empty() && base.len() <= 8 && ext.len() <= 3 && ok(base) && ok(ext)
}

fn sfn_fields(name: &str) -> ([u8; 8], [u8; 3], bool) {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b.to_string(), e.to_string()),
        _ => (name.to_string(), String::new()),
    };
    let upper_base = base.to_uppercase();
    let upper_ext = ext.to_uppercase();
    let plain = is_plain_sfn(&upper_base, &upper_ext);
    let (sfn_base, sfn_ext) = if plain {
        (upper_base, upper_ext)
    } else {
        let stripped: String = upper_base
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(6)
            .collect();
        (
            format!("{stripped}~1"),
            upper_ext
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(3)
                .collect(),
        )
    };
    let mut filename = *b"        ";
    filename[..sfn_base.len()].copy_from_slice(sfn_base.as_bytes());
    let mut extension = *b"   ";
    extension[..sfn_ext.len()].copy_from_slice(sfn_ext.as_bytes());
    (filename, extension, plain)
}

/// Emits the on-disk records for one name: the LFN run (when the name is
/// not a plain 8.3 one) followed by the directory entry.
fn make_entries(name: &str, attr: u8, cluster: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if name == "." || name == ".." {
        let mut e = DirectoryEntry::new_zeroed();
        e.filename = *b"        ";
        e.filename[..name.len()].copy_from_slice(name.as_bytes());
        e.ext = *b"   ";
        e.attr = attr;
        e.first_cluster_lo.set(cluster as u16);
        e.first_cluster_hi.set((cluster >> 16) as u16);
        return e.as_bytes().to_vec();
    }
    let (filename, ext, plain) = sfn_fields(name);
    if !plain {
        let checksum = lfn_checksum(&filename, &ext);
        let mut units: Vec<u16> = name.encode_utf16().collect();
        units.push(0x0000);
        while units.len() % LFN_CHARS_PER_ENTRY != 0 {
            units.push(0xFFFF);
        }
        let count = units.len() / LFN_CHARS_PER_ENTRY;
        for seq in (1..=count).rev() {
            let mut slot = LongFilenameEntry::new_zeroed();
            slot.sequence = seq as u8 | if seq == count { 0x40 } else { 0 };
            slot.attr = ATTR_LFN;
            slot.checksum = checksum;
            let chunk = &units[(seq - 1) * LFN_CHARS_PER_ENTRY..][..LFN_CHARS_PER_ENTRY];
            let mut bytes = Vec::with_capacity(26);
            for u in chunk {
                bytes.extend_from_slice(&u.to_le_bytes());
            }
            slot.name_1.copy_from_slice(&bytes[0..10]);
            slot.name_2.copy_from_slice(&bytes[10..22]);
            slot.name_3.copy_from_slice(&bytes[22..26]);
            out.extend_from_slice(slot.as_bytes());
        }
    }
    let mut e = DirectoryEntry::new_zeroed();
    e.filename = filename;
    e.ext = ext;
    e.attr = attr;
    e.first_cluster_lo.set(cluster as u16);
    e.first_cluster_hi.set((cluster >> 16) as u16);
    e.size.set(size);
    out.extend_from_slice(e.as_bytes());
    out
}

/// Wraps a FAT volume in a single-partition MBR disk image. The partition
/// starts at sector 1.
pub fn mbr_disk(volume: &[u8]) -> Vec<u8> {
    assert!(volume.len() % 512 == 0);
    let sectors = (volume.len() / 512) as u32;
    let mut img = vec![0u8; 512];
    img[446 + 4] = 0x0C;
    img[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    img[446 + 12..446 + 16].copy_from_slice(&sectors.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xAA;
    img.extend_from_slice(volume);
    img
}
