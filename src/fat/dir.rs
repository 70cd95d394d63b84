// Directory decoding: walking raw 32-byte records, reassembling VFAT long
// filenames, and folding the result into usable entries.

use crate::fat::layout::{
    lfn_checksum, DirectoryEntry, DosTimestamp, LongFilenameEntry, CASE_LOWER_BASE,
    CASE_LOWER_EXT, DIR_ENTRY_SIZE, LFN_CHARS_PER_ENTRY,
};
use zerocopy::FromBytes;

/// A fully decoded directory entry: the visible (long) name, the 8.3 name,
/// and the fields a read-only server cares about.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub short_name: String,
    pub attr: u8,
    pub size: u32,
    pub first_cluster: u32,
    pub created: Option<DosTimestamp>,
    pub modified: Option<DosTimestamp>,
    pub accessed: Option<DosTimestamp>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attr & crate::fat::layout::ATTR_DIRECTORY != 0
    }
}

// Long filenames arrive as a run of slots physically *preceding* their 8.3
// record, in descending sequence order (the slot flagged 0x40 is first on
// disk and holds the tail of the name). The buffer collects slots by
// sequence number and is thrown away whenever the run is broken: a deleted
// entry, a slot that doesn't fit the run, or a checksum that doesn't match
// the 8.3 record it lands on.
struct LfnBuffer {
    slots: Vec<Option<[u16; LFN_CHARS_PER_ENTRY]>>,
    checksum: u8,
}

impl LfnBuffer {
    fn start(entry: &LongFilenameEntry) -> Option<LfnBuffer> {
        let seq = (entry.sequence & 0x3F) as usize;
        if seq == 0 {
            return None;
        }
        let mut buf = LfnBuffer {
            slots: vec![None; seq],
            checksum: entry.checksum,
        };
        buf.slots[seq - 1] = Some(entry.units());
        Some(buf)
    }

    fn add(&mut self, entry: &LongFilenameEntry) -> bool {
        let seq = (entry.sequence & 0x3F) as usize;
        if entry.checksum != self.checksum
            || seq == 0
            || seq > self.slots.len()
            || self.slots[seq - 1].is_some()
        {
            return false;
        }
        self.slots[seq - 1] = Some(entry.units());
        true
    }

    /// Assembles the name if every slot arrived and the checksum binds to
    /// the given 8.3 record.
    fn assemble(&self, entry: &DirectoryEntry) -> Option<String> {
        if self.checksum != lfn_checksum(&entry.filename, &entry.ext) {
            return None;
        }
        let mut units = Vec::with_capacity(self.slots.len() * LFN_CHARS_PER_ENTRY);
        for slot in &self.slots {
            units.extend_from_slice(&(*slot)?);
        }
        // The name ends at the first NUL; unused space is 0xFFFF padding.
        let end = units
            .iter()
            .position(|&u| u == 0x0000)
            .unwrap_or(units.len());
        units.truncate(end);
        while units.last() == Some(&0xFFFF) {
            units.pop();
        }
        if units.is_empty() {
            return None;
        }
        String::from_utf16(&units).ok()
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Decodes the 8.3 name, applying the deleted-marker escape and the NT
/// case-folding flags.
fn short_names(entry: &DirectoryEntry) -> (String, String) {
    let mut base = entry.filename;
    if base[0] == 0x05 {
        base[0] = 0xE5;
    }
    let base_end = base
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |i| i + 1);
    let ext_end = entry
        .ext
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |i| i + 1);
    let base = latin1(&base[..base_end]);
    let ext = latin1(&entry.ext[..ext_end]);

    let sfn = if ext.is_empty() {
        base.clone()
    } else {
        format!("{base}.{ext}")
    };
    let folded_base = if entry.attr2 & CASE_LOWER_BASE != 0 {
        base.to_lowercase()
    } else {
        base
    };
    let display = if ext.is_empty() {
        folded_base
    } else if entry.attr2 & CASE_LOWER_EXT != 0 {
        format!("{folded_base}.{}", ext.to_lowercase())
    } else {
        format!("{folded_base}.{ext}")
    };
    (display, sfn)
}

/// Decodes a raw directory region into entries. Iteration stops at the
/// first end marker; deleted entries and the volume label are skipped.
pub fn decode_directory(raw: &[u8], fat32: bool) -> Vec<DirEntry> {
    let mut out = Vec::new();
    let mut lfn: Option<LfnBuffer> = None;
    for record in raw.chunks_exact(DIR_ENTRY_SIZE) {
        let entry = match DirectoryEntry::ref_from_prefix(record) {
            Some(e) => e,
            None => break,
        };
        if entry.is_end() {
            break;
        }
        if entry.is_lfn() {
            let slot = match LongFilenameEntry::ref_from_prefix(record) {
                Some(s) => s,
                None => break,
            };
            if slot.sequence == 0xE5 {
                lfn = None;
            } else if slot.sequence & 0x40 != 0 {
                lfn = LfnBuffer::start(slot);
            } else if !lfn.as_mut().map_or(false, |buf| buf.add(slot)) {
                lfn = None;
            }
            continue;
        }
        if entry.is_deleted() || entry.is_volume_label() {
            lfn = None;
            continue;
        }
        let (display, sfn) = short_names(entry);
        let name = lfn
            .take()
            .and_then(|buf| buf.assemble(entry))
            .unwrap_or(display);
        out.push(DirEntry {
            name,
            short_name: sfn,
            attr: entry.attr,
            size: entry.size.get(),
            first_cluster: entry.first_cluster(fat32),
            created: DosTimestamp::decode(entry.cdate.get(), entry.ctime.get(), entry.ctime_cs),
            modified: DosTimestamp::decode(entry.mdate.get(), entry.mtime.get(), 0),
            accessed: DosTimestamp::decode(entry.adate.get(), 0, 0),
        });
    }
    out
}
