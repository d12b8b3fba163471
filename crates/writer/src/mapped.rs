//! # Mapped Archive
//!
//! **Role**: Opens an archive file with `memmap2`, validates it and, when the
//! metadata must live at another base address, relocates a private copy.
//!
//! **Design**:
//! - The header is decoded first: magic, version, file size and section bounds.
//!   The CRC is checked when `VerifySharedSpaces` is set, before relocation
//!   touches any byte.
//! - Every `rkyv` section is validated once here. Accessors read in place
//!   afterwards.
//! - `ArchiveRelocationMode`: 0 maps at `SharedBaseAddress`, relocating when it
//!   differs from the requested base; 1 always uses the alternate base; 2 refuses
//!   any base but the requested one.

use crate::compact::CompactHashtable;
use crate::header::{compute_crc, FileHeader, SectionKind};
use crate::metadata::{decode_bitmap, relocate, ClassView, MetadataView};
use crate::records::*;
use crate::LoadError;
use archiver::HeapRegion;
use common::CdsConfig;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fmt::Write as _;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Distance of the alternate mapping base from the requested one.
pub const ALTERNATE_BASE_OFFSET: u64 = 0x4000_0000;

enum ArchiveBytes {
    Shared(Mmap),
    /// Copy-on-write mapping holding relocated metadata.
    Private(MmapMut),
}

impl Deref for ArchiveBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ArchiveBytes::Shared(m) => m,
            ArchiveBytes::Private(m) => m,
        }
    }
}

macro_rules! validate_section {
    ($bytes:expr, $header:expr, $kind:ident, $ty:ty) => {{
        let entry = $header
            .section(SectionKind::$kind)
            .ok_or(LoadError::MissingSection(SectionKind::$kind.name()))?;
        rkyv::access::<$ty, rkyv::rancor::Error>(&$bytes[entry.range()]).map_err(|e| LoadError::Decode {
            section: SectionKind::$kind.name(),
            reason: e.to_string(),
        })?;
    }};
}

macro_rules! section_accessor {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&self) -> &$ty {
            // SAFETY: `open` validated this section with `rkyv::access`, and the
            // mapping is never written after that.
            unsafe { rkyv::access_unchecked::<$ty>(self.section(SectionKind::$kind)) }
        }
    };
}

pub struct MappedArchive {
    path: PathBuf,
    bytes: ArchiveBytes,
    header: FileHeader,
    mapped_base: u64,
    relocated_pointers: usize,
}

impl MappedArchive {
    pub fn open(path: &Path, config: &CdsConfig) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // SAFETY: the archive is opened read-only and is not modified while mapped.
        let map = unsafe { Mmap::map(&file)? };
        let header = FileHeader::decode(&map)?;
        if config.verify_shared_spaces {
            let computed = compute_crc(&map);
            if computed != header.crc {
                return Err(LoadError::CrcMismatch {
                    stored: header.crc,
                    computed,
                });
            }
        }
        for kind in SectionKind::ALL {
            if header.section(kind).is_none() {
                return Err(LoadError::MissingSection(kind.name()));
            }
        }

        let requested = header.requested_base;
        let mapped_base = match config.archive_relocation_mode {
            1 => requested.wrapping_add(ALTERNATE_BASE_OFFSET),
            _ => config.shared_base_address,
        };
        if config.archive_relocation_mode == 2 && mapped_base != requested {
            return Err(LoadError::RelocationRefused {
                requested,
                available: mapped_base,
            });
        }

        let delta = mapped_base.wrapping_sub(requested) as i64;
        let mut relocated_pointers = 0;
        let bytes = if delta == 0 {
            ArchiveBytes::Shared(map)
        } else {
            drop(map);
            // SAFETY: private copy-on-write mapping; writes never reach the file.
            let mut copy = unsafe { MmapOptions::new().map_copy(&file)? };
            let range = |kind: SectionKind| header.section(kind).map(|e| e.range()).unwrap_or_default();
            let ptrmap = decode_bitmap(&copy[range(SectionKind::MetadataPtrmap)])?;
            relocated_pointers = relocate(
                &mut copy,
                range(SectionKind::RwMetadata),
                range(SectionKind::RoMetadata),
                &ptrmap,
                delta,
            )?;
            info!(
                target: "cds",
                "Relocated {} metadata pointers from {:#x} to {:#x}",
                relocated_pointers,
                requested,
                mapped_base
            );
            ArchiveBytes::Private(copy)
        };

        validate_section!(bytes, header, ClassTable, ArchivedClassTable);
        validate_section!(bytes, header, HeapRoots, ArchivedHeapRootsRecord);
        validate_section!(bytes, header, SubgraphInfos, ArchivedSubgraphTable);
        validate_section!(bytes, header, InitList, ArchivedInitListRecord);
        validate_section!(bytes, header, LambdaProxyRecords, ArchivedLambdaTable);
        validate_section!(bytes, header, MethodDataRecords, ArchivedMethodDataTable);
        validate_section!(bytes, header, PreloadedClasses, ArchivedPreloadedRecord);
        validate_section!(bytes, header, ReflectionData, ArchivedReflectionTable);
        validate_section!(bytes, header, LambdaFormInvokers, ArchivedLambdaFormInvokers);
        for kind in [
            SectionKind::BuiltinDictionary,
            SectionKind::UnregisteredDictionary,
            SectionKind::LambdaProxyDictionary,
            SectionKind::MethodDataDictionary,
            SectionKind::SymbolTable,
            SectionKind::StringTable,
        ] {
            let entry = header.section(kind).ok_or(LoadError::MissingSection(kind.name()))?;
            CompactHashtable::new(&bytes[entry.range()])?;
        }

        debug!(
            target: "cds",
            "Mapped {} ({} bytes, {} sections) at {:#x}",
            path.display(),
            header.file_size,
            header.sections.len(),
            mapped_base
        );
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            header,
            mapped_base,
            relocated_pointers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn mapped_base(&self) -> u64 {
        self.mapped_base
    }

    pub fn relocation_delta(&self) -> i64 {
        self.mapped_base.wrapping_sub(self.header.requested_base) as i64
    }

    pub fn relocated_pointers(&self) -> usize {
        self.relocated_pointers
    }

    /// Bytes of a section; empty when absent.
    pub fn section(&self, kind: SectionKind) -> &[u8] {
        match self.header.section(kind) {
            Some(entry) => &self.bytes[entry.range()],
            None => &[],
        }
    }

    section_accessor!(class_table, ClassTable, ArchivedClassTable);
    section_accessor!(heap_roots, HeapRoots, ArchivedHeapRootsRecord);
    section_accessor!(subgraph_table, SubgraphInfos, ArchivedSubgraphTable);
    section_accessor!(init_list, InitList, ArchivedInitListRecord);
    section_accessor!(lambda_table, LambdaProxyRecords, ArchivedLambdaTable);
    section_accessor!(method_data, MethodDataRecords, ArchivedMethodDataTable);
    section_accessor!(
        /// Preloaded and initiated class lists, as class-table indices.
        preloaded,
        PreloadedClasses,
        ArchivedPreloadedRecord
    );
    section_accessor!(reflection_data, ReflectionData, ArchivedReflectionTable);
    section_accessor!(lambda_form_invokers, LambdaFormInvokers, ArchivedLambdaFormInvokers);

    pub fn metadata(&self) -> MetadataView<'_> {
        MetadataView::new(
            self.section(SectionKind::RwMetadata),
            self.section(SectionKind::RoMetadata),
            self.mapped_base,
        )
    }

    fn table(&self, kind: SectionKind) -> Option<CompactHashtable<'_>> {
        CompactHashtable::new(self.section(kind)).ok()
    }

    pub fn class_count(&self) -> usize {
        self.class_table().classes.len()
    }

    /// Metadata record of the class at `index` in the class table.
    pub fn class_view(&self, index: u32) -> Result<ClassView<'_>, LoadError> {
        let rec = self
            .class_table()
            .classes
            .get(index as usize)
            .ok_or_else(|| LoadError::BadSection(format!("class index {index} out of range")))?;
        self.metadata().class(rec.meta.to_native() as usize)
    }

    fn lookup_class(&self, kind: SectionKind, name: &str) -> Vec<u32> {
        let Some(table) = self.table(kind) else {
            return Vec::new();
        };
        table
            .lookup(name)
            .filter(|&i| self.class_view(i).is_ok_and(|v| v.name == name))
            .collect()
    }

    /// Class-table indices of the built-in classes named `name`, one per
    /// defining loader.
    pub fn lookup_builtin(&self, name: &str) -> Vec<u32> {
        self.lookup_class(SectionKind::BuiltinDictionary, name)
    }

    pub fn lookup_unregistered(&self, name: &str) -> Option<u32> {
        self.lookup_class(SectionKind::UnregisteredDictionary, name)
            .into_iter()
            .next()
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<&str> {
        let view = self.metadata();
        self.table(SectionKind::SymbolTable)?
            .lookup(name)
            .filter_map(|off| view.symbol(off as usize).ok())
            .find(|s| *s == name)
    }

    /// Heap region offset of the archived interned string `value`.
    pub fn lookup_shared_string(&self, value: &str) -> Option<u32> {
        let region = self.section(SectionKind::HeapRegion);
        self.table(SectionKind::StringTable)?
            .lookup(value)
            .find(|&off| HeapRegion::string_in(region, off) == Some(value))
    }

    /// Index into the lambda table of the site `caller.name:type method_type`.
    pub fn lookup_lambda_site(&self, caller: &str, invoked_name: &str, invoked_type: &str, method_type: &str) -> Option<u32> {
        let key = lambda_site_key(caller, invoked_name, invoked_type, method_type);
        let sites = &self.lambda_table().sites;
        self.table(SectionKind::LambdaProxyDictionary)?.lookup(&key).find(|&i| {
            sites.get(i as usize).is_some_and(|s| {
                s.invoked_name.as_str() == invoked_name
                    && s.invoked_type.as_str() == invoked_type
                    && s.method_type.as_str() == method_type
                    && self
                        .class_view(s.caller.to_native())
                        .is_ok_and(|v| v.name == caller)
            })
        })
    }

    /// Index into the method-data table of `holder.name signature`.
    pub fn lookup_method_data(&self, holder: &str, name: &str, signature: &str) -> Option<u32> {
        let key = method_key(holder, name, signature);
        let methods = &self.method_data().methods;
        self.table(SectionKind::MethodDataDictionary)?.lookup(&key).find(|&i| {
            methods.get(i as usize).is_some_and(|m| {
                m.name.as_str() == name
                    && m.signature.as_str() == signature
                    && self
                        .class_view(m.holder.to_native())
                        .is_ok_and(|v| v.name == holder)
            })
        })
    }

    /// Copy of the heap region with its bitmaps and roots.
    pub fn heap_region(&self) -> Result<HeapRegion, LoadError> {
        Ok(HeapRegion {
            bytes: self.section(SectionKind::HeapRegion).to_vec(),
            oopmap: decode_bitmap(self.section(SectionKind::HeapOopmap))?,
            ptrmap: decode_bitmap(self.section(SectionKind::HeapPtrmap))?,
            roots: self.heap_roots().roots.iter().map(|r| r.to_native()).collect(),
        })
    }

    /// Header, section table and record counts in the format of `aotcds print`.
    pub fn describe(&self) -> String {
        let h = &self.header;
        let mut out = String::new();
        let _ = writeln!(out, "Archive:        {}", self.path.display());
        let _ = writeln!(out, "Magic:          {:#010x}", h.magic);
        let _ = writeln!(out, "Version:        {}", h.version);
        let _ = writeln!(out, "CRC:            {:#010x}", h.crc);
        let _ = writeln!(out, "UUID:           {}", h.uuid);
        let _ = writeln!(out, "Created:        {}", h.created_at);
        let _ = writeln!(out, "Requested base: {:#x}", h.requested_base);
        let _ = writeln!(out, "Mapped base:    {:#x}", self.mapped_base);
        let _ = writeln!(out, "Flags:          {:?}", h.flags);
        let _ = writeln!(out, "File size:      {}", h.file_size);
        let _ = writeln!(out, "Sections:");
        for s in &h.sections {
            let _ = writeln!(out, "  {:<26} {:>#10x} {:>10}", s.kind.name(), s.offset, s.size);
        }
        let roots = self.heap_roots();
        let _ = writeln!(out, "Classes:        {}", self.class_count());
        let _ = writeln!(out, "Heap roots:     {}", roots.roots.len());
        let _ = writeln!(out, "Subgraphs:      {}", self.subgraph_table().subgraphs.len());
        let _ = writeln!(out, "Init list:      {}", self.init_list().entries.len());
        let _ = writeln!(out, "Lambda sites:   {}", self.lambda_table().sites.len());
        let _ = writeln!(out, "Method data:    {}", self.method_data().methods.len());
        let _ = writeln!(out, "Reflection:     {}", self.reflection_data().classes.len());
        let _ = writeln!(out, "LF invokers:    {}", self.lambda_form_invokers().lines.len());
        out
    }
}
