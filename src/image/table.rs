//! MBR / GPT partition table parsing.
//!
//! Byte-exact reads only: the MBR boot signature at 510, the four 16-byte
//! MBR slots at 446, and the GPT header at LBA 1 with its entry array.

use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// Sector size assumed for raw images.
pub const SECTOR_SIZE: u64 = 512;

/// MBR boot signature at bytes 510..512.
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const MBR_SIGNATURE_OFFSET: u64 = 510;

/// First MBR partition slot and slot layout.
pub const MBR_ENTRIES_OFFSET: usize = 446;
pub const MBR_ENTRY_SIZE: usize = 16;
pub const MBR_ENTRY_COUNT: usize = 4;

/// GPT header signature at LBA 1.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_HEADER_OFFSET: u64 = SECTOR_SIZE;

/// Upper bound on GPT entries we are willing to read.
const GPT_MAX_ENTRIES: u32 = 256;
const GPT_MAX_ENTRY_SIZE: u64 = 4096;

/// MBR type used by a GPT protective MBR.
pub const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xee;

/// MBR types that never hold a mountable filesystem.
const MBR_TYPES_NOT_MOUNTABLE: &[u8] = &[0x00, 0x05, 0x0f, 0x85, MBR_TYPE_GPT_PROTECTIVE];

/// Partition table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Mbr,
    Gpt,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Mbr => write!(f, "MBR"),
            TableKind::Gpt => write!(f, "GPT"),
        }
    }
}

/// Partition type as stored in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    /// One-byte MBR system id.
    Mbr(u8),
    /// GPT type GUID, lowercase canonical form.
    Gpt(String),
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(t) => write!(f, "0x{:02x}", t),
            PartitionType::Gpt(guid) => f.write_str(guid),
        }
    }
}

/// One raw table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// 1-based slot number; matches the kernel's partition suffix.
    pub index: u32,
    /// Byte offset from the start of the image.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    pub part_type: PartitionType,
    /// MBR boot flag (0x80) or GPT legacy-BIOS-bootable attribute.
    pub active: bool,
}

impl PartitionEntry {
    pub fn is_mountable(&self) -> bool {
        match &self.part_type {
            PartitionType::Mbr(t) => !MBR_TYPES_NOT_MOUNTABLE.contains(t),
            PartitionType::Gpt(_) => true,
        }
    }
}

/// Parsed partition table of an image.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionTableDescriptor {
    /// Authoritative table; GPT wins when both signatures are present.
    pub kind: Option<TableKind>,
    pub mbr_signature: bool,
    pub gpt_signature: bool,
    /// Non-zero-type MBR slots among the four primary slots.
    pub mbr_active_slots: usize,
    /// The MBR only holds a GPT protective entry.
    pub protective_mbr: bool,
    /// Entries of the authoritative table.
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTableDescriptor {
    /// Read the table from an open image of `size` bytes.
    pub fn read<R: Read + Seek>(reader: &mut R, size: u64) -> io::Result<Self> {
        let mut desc = Self::default();
        if size < SECTOR_SIZE {
            return Ok(desc);
        }

        let mut sector0 = [0u8; SECTOR_SIZE as usize];
        read_exact_at(reader, 0, &mut sector0)?;
        let signature_at = MBR_SIGNATURE_OFFSET as usize;
        desc.mbr_signature = sector0[signature_at..signature_at + 2] == MBR_SIGNATURE;

        let mbr_entries = parse_mbr_entries(&sector0);
        desc.mbr_active_slots = mbr_entries.len();
        desc.protective_mbr = !mbr_entries.is_empty()
            && mbr_entries
                .iter()
                .all(|e| e.part_type == PartitionType::Mbr(MBR_TYPE_GPT_PROTECTIVE));

        if size >= 2 * SECTOR_SIZE {
            let mut magic = [0u8; 8];
            read_exact_at(reader, GPT_HEADER_OFFSET, &mut magic)?;
            desc.gpt_signature = &magic == GPT_SIGNATURE;
        }

        if desc.gpt_signature {
            desc.kind = Some(TableKind::Gpt);
            desc.entries = read_gpt_entries(reader, size)?;
        } else if desc.mbr_signature {
            desc.kind = Some(TableKind::Mbr);
            desc.entries = mbr_entries;
        }

        Ok(desc)
    }

    /// Exactly one recognized table is present.
    pub fn is_signature_valid(&self) -> bool {
        self.kind.is_some()
    }

    pub fn has_both_signatures(&self) -> bool {
        self.mbr_signature && self.gpt_signature
    }

    pub fn is_protective_mbr(&self) -> bool {
        self.protective_mbr
    }

    pub fn entry(&self, index: u32) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn mountable(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|e| e.is_mountable())
    }

    pub fn mountable_count(&self) -> usize {
        self.mountable().count()
    }

    /// Highest slot number in use; the kernel creates nodes up to it.
    pub fn highest_index(&self) -> u32 {
        self.entries.iter().map(|e| e.index).max().unwrap_or(0)
    }
}

fn parse_mbr_entries(sector0: &[u8]) -> Vec<PartitionEntry> {
    let mut entries = Vec::new();
    for slot in 0..MBR_ENTRY_COUNT {
        let start = MBR_ENTRIES_OFFSET + slot * MBR_ENTRY_SIZE;
        let raw = &sector0[start..start + MBR_ENTRY_SIZE];
        let part_type = raw[4];
        if part_type == 0x00 {
            continue;
        }
        let first_lba = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
        let sectors = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as u64;
        entries.push(PartitionEntry {
            index: slot as u32 + 1,
            offset: first_lba * SECTOR_SIZE,
            size: sectors * SECTOR_SIZE,
            part_type: PartitionType::Mbr(part_type),
            active: raw[0] == 0x80,
        });
    }
    entries
}

fn read_gpt_entries<R: Read + Seek>(reader: &mut R, size: u64) -> io::Result<Vec<PartitionEntry>> {
    let mut header = [0u8; 92];
    read_exact_at(reader, GPT_HEADER_OFFSET, &mut header)?;

    let entries_lba = u64::from_le_bytes(header[72..80].try_into().unwrap_or_default());
    let count = u32::from_le_bytes(header[80..84].try_into().unwrap_or_default());
    let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap_or_default()) as u64;

    if !(128..=GPT_MAX_ENTRY_SIZE).contains(&entry_size) || count == 0 || count > GPT_MAX_ENTRIES {
        return Ok(Vec::new());
    }
    // Header fields come straight from the image; reject anything that overflows.
    let bounds = entries_lba.checked_mul(SECTOR_SIZE).and_then(|offset| {
        (count as u64)
            .checked_mul(entry_size)
            .and_then(|len| offset.checked_add(len))
            .map(|end| (offset, end))
    });
    let array_offset = match bounds {
        Some((offset, end)) if end <= size => offset,
        _ => return Ok(Vec::new()),
    };

    let mut entries = Vec::new();
    let mut raw = vec![0u8; entry_size as usize];
    for i in 0..count {
        read_exact_at(reader, array_offset + i as u64 * entry_size, &mut raw)?;
        let type_guid = &raw[0..16];
        if type_guid.iter().all(|b| *b == 0) {
            continue;
        }
        let first_lba = u64::from_le_bytes(raw[32..40].try_into().unwrap_or_default());
        let last_lba = u64::from_le_bytes(raw[40..48].try_into().unwrap_or_default());
        let attributes = u64::from_le_bytes(raw[48..56].try_into().unwrap_or_default());
        entries.push(PartitionEntry {
            index: i + 1,
            offset: first_lba.saturating_mul(SECTOR_SIZE),
            size: last_lba
                .saturating_sub(first_lba)
                .saturating_add(1)
                .saturating_mul(SECTOR_SIZE),
            part_type: PartitionType::Gpt(format_guid(type_guid)),
            active: attributes & (1 << 2) != 0,
        });
    }
    Ok(entries)
}

/// Mixed-endian GUID to canonical text.
fn format_guid(b: &[u8]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
        b[14], b[15]
    )
}

pub(crate) fn read_exact_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Sector-0 bytes with the given `(type, first_lba, sectors, bootable)` slots.
    pub(crate) fn mbr_sector(slots: &[(u8, u32, u32, bool)]) -> Vec<u8> {
        let mut s = vec![0u8; SECTOR_SIZE as usize];
        for (i, (t, lba, n, boot)) in slots.iter().enumerate() {
            let off = MBR_ENTRIES_OFFSET + i * MBR_ENTRY_SIZE;
            s[off] = if *boot { 0x80 } else { 0 };
            s[off + 4] = *t;
            s[off + 8..off + 12].copy_from_slice(&lba.to_le_bytes());
            s[off + 12..off + 16].copy_from_slice(&n.to_le_bytes());
        }
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn test_mbr_two_partitions() {
        let mut data = mbr_sector(&[(0x0c, 8192, 1024, true), (0x83, 9216, 4096, false)]);
        data.resize(64 * 1024, 0);
        let size = data.len() as u64;
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), size).unwrap();

        assert_eq!(desc.kind, Some(TableKind::Mbr));
        assert!(desc.mbr_signature);
        assert!(!desc.gpt_signature);
        assert_eq!(desc.mbr_active_slots, 2);
        assert_eq!(desc.mountable_count(), 2);

        let boot = desc.entry(1).unwrap();
        assert!(boot.active);
        assert_eq!(boot.offset, 8192 * 512);
        assert_eq!(boot.part_type, PartitionType::Mbr(0x0c));
        assert_eq!(desc.entry(2).unwrap().size, 4096 * 512);
    }

    #[test]
    fn test_no_signature_has_no_kind() {
        let data = vec![0u8; 4096];
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), 4096).unwrap();
        assert!(!desc.is_signature_valid());
        assert!(desc.entries.is_empty());
    }

    #[test]
    fn test_gpt_header_wins_over_protective_mbr() {
        let mut data = mbr_sector(&[(MBR_TYPE_GPT_PROTECTIVE, 1, 0xffff, false)]);
        data.resize(64 * 1024, 0);

        // Header at LBA 1, entries at LBA 2, 4 entries of 128 bytes.
        data[512..520].copy_from_slice(GPT_SIGNATURE);
        data[512 + 72..512 + 80].copy_from_slice(&2u64.to_le_bytes());
        data[512 + 80..512 + 84].copy_from_slice(&4u32.to_le_bytes());
        data[512 + 84..512 + 88].copy_from_slice(&128u32.to_le_bytes());

        // Entry 2 (index 1 in the array) is a Linux filesystem partition.
        let e = 1024 + 128;
        let linux_fs: [u8; 16] = [
            0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47,
            0x7d, 0xe4,
        ];
        data[e..e + 16].copy_from_slice(&linux_fs);
        data[e + 32..e + 40].copy_from_slice(&34u64.to_le_bytes());
        data[e + 40..e + 48].copy_from_slice(&99u64.to_le_bytes());

        let size = data.len() as u64;
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), size).unwrap();
        assert!(desc.has_both_signatures());
        assert_eq!(desc.kind, Some(TableKind::Gpt));
        assert_eq!(desc.entries.len(), 1);

        let root = desc.entry(2).unwrap();
        assert_eq!(
            root.part_type,
            PartitionType::Gpt("0fc63daf-8483-4772-8e79-3d69d8477de4".to_string())
        );
        assert_eq!(root.offset, 34 * 512);
        assert_eq!(root.size, 66 * 512);
    }

    fn gpt_header(data: &mut [u8], entries_lba: u64, count: u32, entry_size: u32) {
        data[512..520].copy_from_slice(GPT_SIGNATURE);
        data[512 + 72..512 + 80].copy_from_slice(&entries_lba.to_le_bytes());
        data[512 + 80..512 + 84].copy_from_slice(&count.to_le_bytes());
        data[512 + 84..512 + 88].copy_from_slice(&entry_size.to_le_bytes());
    }

    #[test]
    fn test_corrupt_gpt_header_yields_no_entries() {
        let cases: [(u64, u32, u32); 4] = [
            (u64::MAX / 256, 4, 128),
            (u64::MAX / 512, 1, 128),
            (2, 4, u32::MAX),
            (2, 4, 8192),
        ];
        for (lba, count, entry_size) in cases {
            let mut data = mbr_sector(&[(MBR_TYPE_GPT_PROTECTIVE, 1, 0xffff, false)]);
            data.resize(64 * 1024, 0);
            gpt_header(&mut data, lba, count, entry_size);
            let size = data.len() as u64;
            let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), size).unwrap();
            assert_eq!(desc.kind, Some(TableKind::Gpt));
            assert!(desc.entries.is_empty(), "lba={} entry_size={}", lba, entry_size);
        }
    }

    #[test]
    fn test_gpt_without_mbr_signature() {
        let mut data = vec![0u8; 64 * 1024];
        gpt_header(&mut data, 2, 4, 128);
        let size = data.len() as u64;
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), size).unwrap();
        assert!(desc.gpt_signature);
        assert!(!desc.mbr_signature);
        assert!(!desc.has_both_signatures());
        assert_eq!(desc.kind, Some(TableKind::Gpt));
    }

    #[test]
    fn test_extended_partition_not_mountable() {
        let mut data = mbr_sector(&[(0x83, 2048, 100, false), (0x05, 4096, 100, false)]);
        data.resize(8192, 0);
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), 8192).unwrap();
        assert_eq!(desc.entries.len(), 2);
        assert_eq!(desc.mountable_count(), 1);
        assert_eq!(desc.highest_index(), 2);
    }

    #[test]
    fn test_tiny_input_is_empty_descriptor() {
        let data = vec![0u8; 100];
        let desc = PartitionTableDescriptor::read(&mut Cursor::new(data), 100).unwrap();
        assert!(desc.kind.is_none());
    }
}
