//! File header and section table.
//!
//! ```text
//! 0    magic u32 | version u32 | crc u32 | header_size u32
//! 16   file_size u64
//! 24   requested_base u64
//! 32   section_count u32 | flags u32
//! 40   reserved
//! 64   uuid [u8; 16]                       volatile
//! 80   created_at u64 (seconds)            volatile
//! 88   reserved u64                        volatile
//! 96   section table, 24 bytes per entry:  kind u32 | reserved u32 | offset u64 | size u64
//! ```
//!
//! All integers are little-endian. The CRC covers every byte from offset 12 to
//! the end of the file except the volatile range, which is also ignored when two
//! images are compared for determinism.

use crate::LoadError;
use bitflags::bitflags;
use std::ops::Range;
use uuid::Uuid;

pub const ARCHIVE_MAGIC: u32 = 0xf00b_aba2;
pub const ARCHIVE_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 96;
pub const SECTION_ENTRY_SIZE: usize = 24;
/// Every section starts at a multiple of this.
pub const SECTION_ALIGNMENT: usize = 16;
/// Header bytes that differ between two dumps of the same training run.
pub const VOLATILE_RANGE: Range<usize> = 64..96;

const CRC_START: usize = 12;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const HEAP_ARCHIVED = 1 << 0;
        const FULL_MODULE_GRAPH = 1 << 1;
        const HAS_INIT_LIST = 1 << 2;
        const PRELOADED_CLASSES = 1 << 3;
        const PRECOMPILED = 1 << 4;
        const REFLECTION_DATA = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum SectionKind {
    RwMetadata = 1,
    RoMetadata = 2,
    MetadataPtrmap = 3,
    HeapRegion = 4,
    HeapOopmap = 5,
    HeapPtrmap = 6,
    HeapRoots = 7,
    ClassTable = 8,
    BuiltinDictionary = 9,
    UnregisteredDictionary = 10,
    LambdaProxyDictionary = 11,
    LambdaProxyRecords = 12,
    MethodDataDictionary = 13,
    MethodDataRecords = 14,
    SubgraphInfos = 15,
    InitList = 16,
    SymbolTable = 17,
    StringTable = 18,
    PreloadedClasses = 19,
    ReflectionData = 20,
    LambdaFormInvokers = 21,
}

impl SectionKind {
    /// In file order.
    pub const ALL: [SectionKind; 21] = [
        SectionKind::RwMetadata,
        SectionKind::RoMetadata,
        SectionKind::MetadataPtrmap,
        SectionKind::HeapRegion,
        SectionKind::HeapOopmap,
        SectionKind::HeapPtrmap,
        SectionKind::HeapRoots,
        SectionKind::ClassTable,
        SectionKind::BuiltinDictionary,
        SectionKind::UnregisteredDictionary,
        SectionKind::LambdaProxyDictionary,
        SectionKind::LambdaProxyRecords,
        SectionKind::MethodDataDictionary,
        SectionKind::MethodDataRecords,
        SectionKind::SubgraphInfos,
        SectionKind::InitList,
        SectionKind::SymbolTable,
        SectionKind::StringTable,
        SectionKind::PreloadedClasses,
        SectionKind::ReflectionData,
        SectionKind::LambdaFormInvokers,
    ];

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u32 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            SectionKind::RwMetadata => "rw",
            SectionKind::RoMetadata => "ro",
            SectionKind::MetadataPtrmap => "ptrmap",
            SectionKind::HeapRegion => "heap",
            SectionKind::HeapOopmap => "heap-oopmap",
            SectionKind::HeapPtrmap => "heap-ptrmap",
            SectionKind::HeapRoots => "heap-roots",
            SectionKind::ClassTable => "classes",
            SectionKind::BuiltinDictionary => "builtin-dictionary",
            SectionKind::UnregisteredDictionary => "unregistered-dictionary",
            SectionKind::LambdaProxyDictionary => "lambda-proxy-dictionary",
            SectionKind::LambdaProxyRecords => "lambda-proxies",
            SectionKind::MethodDataDictionary => "method-data-dictionary",
            SectionKind::MethodDataRecords => "method-data",
            SectionKind::SubgraphInfos => "subgraph-infos",
            SectionKind::InitList => "init-list",
            SectionKind::SymbolTable => "symbols",
            SectionKind::StringTable => "strings",
            SectionKind::PreloadedClasses => "preloaded-classes",
            SectionKind::ReflectionData => "reflection-data",
            SectionKind::LambdaFormInvokers => "lambda-form-invokers",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub kind: SectionKind,
    pub offset: u64,
    pub size: u64,
}

impl SectionEntry {
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub crc: u32,
    pub header_size: u32,
    pub file_size: u64,
    /// Address the metadata pointers were written against.
    pub requested_base: u64,
    pub flags: HeaderFlags,
    pub uuid: Uuid,
    pub created_at: u64,
    pub sections: Vec<SectionEntry>,
}

impl FileHeader {
    pub fn new(requested_base: u64, flags: HeaderFlags, uuid: Uuid, created_at: u64) -> Self {
        Self {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            crc: 0,
            header_size: HEADER_SIZE as u32,
            file_size: 0,
            requested_base,
            flags,
            uuid,
            created_at,
            sections: Vec::new(),
        }
    }

    /// Header plus section table size, before alignment.
    pub fn encoded_len(section_count: usize) -> usize {
        HEADER_SIZE + section_count * SECTION_ENTRY_SIZE
    }

    pub fn section(&self, kind: SectionKind) -> Option<&SectionEntry> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::encoded_len(self.sections.len())];
        put_u32(&mut out, 0, self.magic);
        put_u32(&mut out, 4, self.version);
        put_u32(&mut out, 8, self.crc);
        put_u32(&mut out, 12, self.header_size);
        put_u64(&mut out, 16, self.file_size);
        put_u64(&mut out, 24, self.requested_base);
        put_u32(&mut out, 32, self.sections.len() as u32);
        put_u32(&mut out, 36, self.flags.bits());
        out[64..80].copy_from_slice(self.uuid.as_bytes());
        put_u64(&mut out, 80, self.created_at);
        for (i, s) in self.sections.iter().enumerate() {
            let at = HEADER_SIZE + i * SECTION_ENTRY_SIZE;
            put_u32(&mut out, at, s.kind as u32);
            put_u64(&mut out, at + 8, s.offset);
            put_u64(&mut out, at + 16, s.size);
        }
        out
    }

    /// Decodes and checks magic, version, file size and section bounds. The
    /// CRC is checked separately, see [`compute_crc`].
    pub fn decode(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_SIZE {
            return Err(LoadError::Truncated {
                expected: HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }
        let magic = get_u32(bytes, 0);
        if magic != ARCHIVE_MAGIC {
            return Err(LoadError::BadMagic(magic));
        }
        let version = get_u32(bytes, 4);
        if version != ARCHIVE_VERSION {
            return Err(LoadError::VersionMismatch {
                found: version,
                expected: ARCHIVE_VERSION,
            });
        }
        let file_size = get_u64(bytes, 16);
        if file_size != bytes.len() as u64 {
            return Err(LoadError::Truncated {
                expected: file_size,
                actual: bytes.len() as u64,
            });
        }
        let count = get_u32(bytes, 32) as usize;
        let table_end = Self::encoded_len(count);
        if table_end > bytes.len() {
            return Err(LoadError::BadSection(format!("section table of {count} entries overruns the file")));
        }
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * SECTION_ENTRY_SIZE;
            let raw = get_u32(bytes, at);
            let kind = SectionKind::from_u32(raw)
                .ok_or_else(|| LoadError::BadSection(format!("unknown section kind {raw}")))?;
            let entry = SectionEntry {
                kind,
                offset: get_u64(bytes, at + 8),
                size: get_u64(bytes, at + 16),
            };
            let end = entry.offset.checked_add(entry.size);
            if entry.offset < table_end as u64 || end.is_none_or(|e| e > file_size) {
                return Err(LoadError::BadSection(format!(
                    "{} [{:#x}, +{}] is outside the file",
                    kind.name(),
                    entry.offset,
                    entry.size
                )));
            }
            sections.push(entry);
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[64..80]);
        Ok(Self {
            magic,
            version,
            crc: get_u32(bytes, 8),
            header_size: get_u32(bytes, 12),
            file_size,
            requested_base: get_u64(bytes, 24),
            flags: HeaderFlags::from_bits_truncate(get_u32(bytes, 36)),
            uuid: Uuid::from_bytes(uuid),
            created_at: get_u64(bytes, 80),
            sections,
        })
    }
}

/// CRC-32 of the whole image, skipping the CRC field itself, the fields before
/// it and the volatile range.
pub fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[CRC_START.min(bytes.len())..VOLATILE_RANGE.start.min(bytes.len())]);
    if bytes.len() > VOLATILE_RANGE.end {
        hasher.update(&bytes[VOLATILE_RANGE.end..]);
    }
    hasher.finalize()
}

/// Stamps the CRC into an encoded image.
pub fn stamp_crc(bytes: &mut [u8]) {
    let crc = compute_crc(bytes);
    put_u32(bytes, 8, crc);
}

/// The image with its volatile range zeroed.
pub fn deterministic_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    let end = VOLATILE_RANGE.end.min(out.len());
    if VOLATILE_RANGE.start < end {
        out[VOLATILE_RANGE.start..end].fill(0);
    }
    out
}

pub fn align_up(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

pub(crate) fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileHeader {
        let mut h = FileHeader::new(0x8_0000_0000, HeaderFlags::HEAP_ARCHIVED, Uuid::new_v4(), 1_700_000_000);
        h.sections.push(SectionEntry {
            kind: SectionKind::RwMetadata,
            offset: 128,
            size: 16,
        });
        h.file_size = 144;
        h
    }

    fn image(h: &FileHeader) -> Vec<u8> {
        let mut bytes = h.encode();
        bytes.resize(h.file_size as usize, 0xab);
        stamp_crc(&mut bytes);
        bytes
    }

    #[test]
    fn test_header_decodes_what_it_encodes() {
        let h = sample();
        let bytes = image(&h);
        let back = FileHeader::decode(&bytes).unwrap();
        assert_eq!(back.requested_base, h.requested_base);
        assert_eq!(back.uuid, h.uuid);
        assert_eq!(back.flags, HeaderFlags::HEAP_ARCHIVED);
        assert_eq!(back.sections, h.sections);
        assert_eq!(back.crc, compute_crc(&bytes));
    }

    #[test]
    fn test_crc_ignores_volatile_range() {
        let h = sample();
        let a = image(&h);
        let mut other = h.clone();
        other.uuid = Uuid::new_v4();
        other.created_at += 60;
        let b = image(&other);
        assert_ne!(a, b);
        assert_eq!(compute_crc(&a), compute_crc(&b));
        assert_eq!(deterministic_bytes(&a), deterministic_bytes(&b));

        let mut c = a.clone();
        c[130] ^= 1;
        assert_ne!(compute_crc(&a), compute_crc(&c));
    }

    #[test]
    fn test_rejects_bad_magic_version_and_bounds() {
        let h = sample();
        let mut bytes = image(&h);
        bytes[0] ^= 0xff;
        assert!(matches!(FileHeader::decode(&bytes), Err(LoadError::BadMagic(_))));

        let mut bytes = image(&h);
        put_u32(&mut bytes, 4, 7);
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(LoadError::VersionMismatch { found: 7, .. })
        ));

        let bytes = image(&h);
        assert!(matches!(
            FileHeader::decode(&bytes[..140]),
            Err(LoadError::Truncated { .. })
        ));

        let mut bad = h.clone();
        bad.sections[0].size = 4096;
        let bytes = image(&bad);
        assert!(matches!(FileHeader::decode(&bytes), Err(LoadError::BadSection(_))));
    }
}
