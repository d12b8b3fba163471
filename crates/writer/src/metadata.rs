//! Read-write and read-only metadata regions.
//!
//! Both regions are arrays of little-endian words placed back to back in one
//! address space: RW at the base, RO right after it. A pointer word holds
//! `base + offset` and has its bit set in the pointer map, which numbers the RW
//! words first and the RO words after them. Null pointers are 0 and unmarked.
//!
//! ```text
//! RW class record   name* | super* | loader, kind, state, flags | interfaces* | class index
//! RO symbol         byte length | bytes, zero-padded to a word
//! RO interfaces     count | class record* ...
//! RO subgraph       holder* | flags | n | (slot, root) * n | m | class record* * m
//! ```

use crate::LoadError;
use common::{BitMap, ClassState, HiddenKind, KlassKind, LoaderKind};
use std::collections::BTreeMap;
use std::ops::Range;

pub const WORD: usize = 8;
pub const CLASS_RECORD_WORDS: usize = 5;

const SUBGRAPH_FULL_MODULE_GRAPH: u64 = 1 << 0;
const SUBGRAPH_HAS_NON_EARLY_KLASSES: u64 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Region {
    Rw,
    Ro,
}

/// A word position in one of the regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Loc {
    pub region: Region,
    pub word: usize,
}

impl Loc {
    pub fn add(self, words: usize) -> Self {
        Self {
            region: self.region,
            word: self.word + words,
        }
    }

    pub fn byte_offset(self) -> usize {
        self.word * WORD
    }

    /// Offset in the combined address space.
    fn address_offset(self, rw_len: usize) -> u64 {
        match self.region {
            Region::Rw => self.byte_offset() as u64,
            Region::Ro => (rw_len + self.byte_offset()) as u64,
        }
    }
}

/// Small integer for the kind of a class.
pub fn kind_code(kind: KlassKind) -> u8 {
    match kind {
        KlassKind::Instance => 0,
        KlassKind::Hidden(HiddenKind::LambdaProxy) => 1,
        KlassKind::Hidden(HiddenKind::LambdaForm) => 2,
        KlassKind::Hidden(HiddenKind::Other) => 3,
        KlassKind::ObjArray { .. } => 4,
        KlassKind::TypeArray { .. } => 5,
    }
}

pub fn hidden_kind_of(code: u8) -> Option<HiddenKind> {
    match code {
        1 => Some(HiddenKind::LambdaProxy),
        2 => Some(HiddenKind::LambdaForm),
        3 => Some(HiddenKind::Other),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassHeader {
    pub loader: LoaderKind,
    pub kind: u8,
    pub state: ClassState,
    pub flags: u32,
}

impl ClassHeader {
    fn pack(self) -> u64 {
        self.loader as u64 | (self.kind as u64) << 8 | (self.state as u64) << 16 | (self.flags as u64) << 32
    }

    fn unpack(word: u64) -> Option<Self> {
        Some(Self {
            loader: LoaderKind::from_u8(word as u8)?,
            kind: (word >> 8) as u8,
            state: ClassState::from_u8((word >> 16) as u8)?,
            flags: (word >> 32) as u32,
        })
    }
}

#[derive(Debug, Default)]
pub struct MetadataBuilder {
    rw: Vec<u64>,
    ro: Vec<u64>,
    pointers: Vec<(Loc, Loc)>,
    symbols: BTreeMap<String, Loc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataImage {
    pub rw: Vec<u8>,
    pub ro: Vec<u8>,
    pub ptrmap: BitMap,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn region_mut(&mut self, region: Region) -> &mut Vec<u64> {
        match region {
            Region::Rw => &mut self.rw,
            Region::Ro => &mut self.ro,
        }
    }

    pub fn alloc(&mut self, region: Region, words: usize) -> Loc {
        let buf = self.region_mut(region);
        let word = buf.len();
        buf.resize(word + words, 0);
        Loc { region, word }
    }

    pub fn put(&mut self, at: Loc, value: u64) {
        self.region_mut(at.region)[at.word] = value;
    }

    pub fn put_ptr(&mut self, at: Loc, target: Loc) {
        self.pointers.push((at, target));
    }

    /// Interns `s` in the RO region.
    pub fn symbol(&mut self, s: &str) -> Loc {
        if let Some(&loc) = self.symbols.get(s) {
            return loc;
        }
        let bytes = s.as_bytes();
        let loc = self.alloc(Region::Ro, 1 + bytes.len().div_ceil(WORD));
        self.put(loc, bytes.len() as u64);
        for (i, chunk) in bytes.chunks(WORD).enumerate() {
            let mut w = [0u8; WORD];
            w[..chunk.len()].copy_from_slice(chunk);
            self.put(loc.add(1 + i), u64::from_le_bytes(w));
        }
        self.symbols.insert(s.to_string(), loc);
        loc
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, Loc)> {
        self.symbols.iter().map(|(s, &loc)| (s.as_str(), loc))
    }

    /// Writes a class record. Pointers to the super class and interfaces are
    /// patched in later with [`MetadataBuilder::link_class`].
    pub fn add_class(&mut self, name: &str, header: ClassHeader, index: u32) -> Loc {
        let name = self.symbol(name);
        let rec = self.alloc(Region::Rw, CLASS_RECORD_WORDS);
        self.put_ptr(rec, name);
        self.put(rec.add(2), header.pack());
        self.put(rec.add(4), index as u64);
        rec
    }

    pub fn link_class(&mut self, rec: Loc, super_rec: Option<Loc>, interfaces: &[Loc]) {
        if let Some(s) = super_rec {
            self.put_ptr(rec.add(1), s);
        }
        if !interfaces.is_empty() {
            let arr = self.alloc(Region::Ro, 1 + interfaces.len());
            self.put(arr, interfaces.len() as u64);
            for (i, &itf) in interfaces.iter().enumerate() {
                self.put_ptr(arr.add(1 + i), itf);
            }
            self.put_ptr(rec.add(3), arr);
        }
    }

    pub fn add_subgraph(
        &mut self,
        holder: Loc,
        is_full_module_graph: bool,
        has_non_early_klasses: bool,
        entry_fields: &[(u32, u32)],
        klasses: &[Loc],
    ) -> Loc {
        let words = 3 + 2 * entry_fields.len() + 1 + klasses.len();
        let rec = self.alloc(Region::Ro, words);
        self.put_ptr(rec, holder);
        let mut flags = 0;
        if is_full_module_graph {
            flags |= SUBGRAPH_FULL_MODULE_GRAPH;
        }
        if has_non_early_klasses {
            flags |= SUBGRAPH_HAS_NON_EARLY_KLASSES;
        }
        self.put(rec.add(1), flags);
        self.put(rec.add(2), entry_fields.len() as u64);
        let mut at = rec.add(3);
        for &(slot, root) in entry_fields {
            self.put(at, slot as u64);
            self.put(at.add(1), root as u64);
            at = at.add(2);
        }
        self.put(at, klasses.len() as u64);
        for (i, &k) in klasses.iter().enumerate() {
            self.put_ptr(at.add(1 + i), k);
        }
        rec
    }

    /// Resolves every pointer against `base` and emits both regions.
    pub fn finish(mut self, base: u64) -> MetadataImage {
        let rw_len = self.rw.len() * WORD;
        let rw_words = self.rw.len();
        let mut ptrmap = BitMap::new(self.rw.len() + self.ro.len());
        let pointers = std::mem::take(&mut self.pointers);
        for (at, target) in pointers {
            self.put(at, base + target.address_offset(rw_len));
            let bit = match at.region {
                Region::Rw => at.word,
                Region::Ro => rw_words + at.word,
            };
            ptrmap.set(bit);
        }
        let to_bytes = |words: &[u64]| -> Vec<u8> { words.iter().flat_map(|w| w.to_le_bytes()).collect() };
        MetadataImage {
            rw: to_bytes(&self.rw),
            ro: to_bytes(&self.ro),
            ptrmap,
        }
    }
}

/// Adds `delta` to every marked pointer word of the RW and RO sections of a
/// mapped image. Returns the number of patched words.
pub fn relocate(image: &mut [u8], rw: Range<usize>, ro: Range<usize>, ptrmap: &BitMap, delta: i64) -> Result<usize, LoadError> {
    let rw_words = rw.len() / WORD;
    if ptrmap.len() != rw_words + ro.len() / WORD {
        return Err(LoadError::BadSection(format!(
            "pointer map covers {} words, regions hold {}",
            ptrmap.len(),
            rw_words + ro.len() / WORD
        )));
    }
    let mut patched = 0;
    for bit in ptrmap.iter_ones() {
        let at = if bit < rw_words {
            rw.start + bit * WORD
        } else {
            ro.start + (bit - rw_words) * WORD
        };
        let mut w = [0u8; WORD];
        w.copy_from_slice(&image[at..at + WORD]);
        let value = u64::from_le_bytes(w).wrapping_add_signed(delta);
        image[at..at + WORD].copy_from_slice(&value.to_le_bytes());
        patched += 1;
    }
    Ok(patched)
}

pub fn encode_bitmap(map: &BitMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(WORD * (1 + map.words().len()));
    out.extend_from_slice(&(map.len() as u64).to_le_bytes());
    for w in map.words() {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

pub fn decode_bitmap(bytes: &[u8]) -> Result<BitMap, LoadError> {
    let bad = || LoadError::BadSection("malformed bitmap".to_string());
    if bytes.len() < WORD || bytes.len() % WORD != 0 {
        return Err(bad());
    }
    let words: Vec<u64> = bytes
        .chunks_exact(WORD)
        .map(|c| {
            let mut w = [0u8; WORD];
            w.copy_from_slice(c);
            u64::from_le_bytes(w)
        })
        .collect();
    let len = words[0] as usize;
    if len.div_ceil(64) != words.len() - 1 {
        return Err(bad());
    }
    Ok(BitMap::from_words(words[1..].to_vec(), len))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassView<'a> {
    pub name: &'a str,
    pub header: ClassHeader,
    /// RW byte offset of the super class record.
    pub super_record: Option<usize>,
    pub interface_records: Vec<usize>,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphView {
    pub holder_record: usize,
    pub is_full_module_graph: bool,
    pub has_non_early_klasses: bool,
    pub entry_fields: Vec<(u32, u32)>,
    pub klass_records: Vec<usize>,
}

/// Reads records of mapped regions whose pointers are relative to `base`.
#[derive(Debug, Clone, Copy)]
pub struct MetadataView<'a> {
    rw: &'a [u8],
    ro: &'a [u8],
    base: u64,
}

impl<'a> MetadataView<'a> {
    pub fn new(rw: &'a [u8], ro: &'a [u8], base: u64) -> Self {
        Self { rw, ro, base }
    }

    fn corrupt(what: &str, at: usize) -> LoadError {
        LoadError::BadSection(format!("metadata: {what} at {at:#x}"))
    }

    fn word(&self, loc: Loc) -> Result<u64, LoadError> {
        let bytes = match loc.region {
            Region::Rw => self.rw,
            Region::Ro => self.ro,
        };
        let at = loc.byte_offset();
        let w = bytes
            .get(at..at + WORD)
            .ok_or_else(|| Self::corrupt("word out of range", at))?;
        let mut b = [0u8; WORD];
        b.copy_from_slice(w);
        Ok(u64::from_le_bytes(b))
    }

    /// Target of a pointer word, or `None` for null.
    fn deref(&self, ptr: u64) -> Result<Option<Loc>, LoadError> {
        if ptr == 0 {
            return Ok(None);
        }
        let off = ptr
            .checked_sub(self.base)
            .ok_or_else(|| Self::corrupt("pointer below the mapping", ptr as usize))? as usize;
        if off % WORD != 0 {
            return Err(Self::corrupt("misaligned pointer", off));
        }
        let loc = if off < self.rw.len() {
            Loc {
                region: Region::Rw,
                word: off / WORD,
            }
        } else if off - self.rw.len() < self.ro.len() {
            Loc {
                region: Region::Ro,
                word: (off - self.rw.len()) / WORD,
            }
        } else {
            return Err(Self::corrupt("pointer past the mapping", off));
        };
        Ok(Some(loc))
    }

    fn rw_record(&self, ptr: u64) -> Result<Option<usize>, LoadError> {
        match self.deref(ptr)? {
            None => Ok(None),
            Some(Loc {
                region: Region::Rw,
                word,
            }) => Ok(Some(word * WORD)),
            Some(loc) => Err(Self::corrupt("class pointer into RO", loc.byte_offset())),
        }
    }

    pub fn symbol_at(&self, loc: Loc) -> Result<&'a str, LoadError> {
        let len = self.word(loc)? as usize;
        let start = loc.add(1).byte_offset();
        let bytes = match loc.region {
            Region::Rw => self.rw,
            Region::Ro => self.ro,
        };
        let raw = bytes
            .get(start..start + len)
            .ok_or_else(|| Self::corrupt("symbol out of range", start))?;
        std::str::from_utf8(raw).map_err(|_| Self::corrupt("symbol is not UTF-8", start))
    }

    /// Symbol at a byte offset of the RO region.
    pub fn symbol(&self, ro_offset: usize) -> Result<&'a str, LoadError> {
        self.symbol_at(Loc {
            region: Region::Ro,
            word: ro_offset / WORD,
        })
    }

    /// Class record at a byte offset of the RW region.
    pub fn class(&self, rw_offset: usize) -> Result<ClassView<'a>, LoadError> {
        let rec = Loc {
            region: Region::Rw,
            word: rw_offset / WORD,
        };
        let name = self
            .deref(self.word(rec)?)?
            .ok_or_else(|| Self::corrupt("class without a name", rw_offset))?;
        let header = ClassHeader::unpack(self.word(rec.add(2))?)
            .ok_or_else(|| Self::corrupt("bad class header", rw_offset))?;
        let mut interface_records = Vec::new();
        if let Some(arr) = self.deref(self.word(rec.add(3))?)? {
            let n = self.word(arr)? as usize;
            for i in 0..n {
                let ptr = self.word(arr.add(1 + i))?;
                interface_records.push(
                    self.rw_record(ptr)?
                        .ok_or_else(|| Self::corrupt("null interface", arr.byte_offset()))?,
                );
            }
        }
        Ok(ClassView {
            name: self.symbol_at(name)?,
            header,
            super_record: self.rw_record(self.word(rec.add(1))?)?,
            interface_records,
            index: self.word(rec.add(4))? as u32,
        })
    }

    /// Subgraph record at a byte offset of the RO region.
    pub fn subgraph(&self, ro_offset: usize) -> Result<SubgraphView, LoadError> {
        let rec = Loc {
            region: Region::Ro,
            word: ro_offset / WORD,
        };
        let holder_record = self
            .rw_record(self.word(rec)?)?
            .ok_or_else(|| Self::corrupt("subgraph without a holder", ro_offset))?;
        let flags = self.word(rec.add(1))?;
        let n = self.word(rec.add(2))? as usize;
        let mut entry_fields = Vec::with_capacity(n);
        let mut at = rec.add(3);
        for _ in 0..n {
            entry_fields.push((self.word(at)? as u32, self.word(at.add(1))? as u32));
            at = at.add(2);
        }
        let m = self.word(at)? as usize;
        let mut klass_records = Vec::with_capacity(m);
        for i in 0..m {
            klass_records.push(
                self.rw_record(self.word(at.add(1 + i))?)?
                    .ok_or_else(|| Self::corrupt("null subgraph class", at.byte_offset()))?,
            );
        }
        Ok(SubgraphView {
            holder_record,
            is_full_module_graph: flags & SUBGRAPH_FULL_MODULE_GRAPH != 0,
            has_non_early_klasses: flags & SUBGRAPH_HAS_NON_EARLY_KLASSES != 0,
            entry_fields,
            klass_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x8_0000_0000;

    fn header(loader: LoaderKind) -> ClassHeader {
        ClassHeader {
            loader,
            kind: kind_code(KlassKind::Instance),
            state: ClassState::Linked,
            flags: 0x12,
        }
    }

    fn sample() -> (MetadataImage, Loc, Loc, Loc) {
        let mut b = MetadataBuilder::new();
        let object = b.add_class("java/lang/Object", header(LoaderKind::Boot), 0);
        let runnable = b.add_class("java/lang/Runnable", header(LoaderKind::Boot), 1);
        let main = b.add_class("app/Main", header(LoaderKind::App), 2);
        b.link_class(runnable, Some(object), &[]);
        b.link_class(main, Some(object), &[runnable]);
        let sg = b.add_subgraph(main, false, true, &[(0, 3), (2, 4)], &[object, runnable]);
        (b.finish(BASE), main, sg, object)
    }

    #[test]
    fn test_class_records_read_back() {
        let (img, main, _, object) = sample();
        let view = MetadataView::new(&img.rw, &img.ro, BASE);
        let c = view.class(main.byte_offset()).unwrap();
        assert_eq!(c.name, "app/Main");
        assert_eq!(c.index, 2);
        assert_eq!(c.header, header(LoaderKind::App));
        assert_eq!(c.super_record, Some(object.byte_offset()));
        assert_eq!(c.interface_records.len(), 1);
        let itf = view.class(c.interface_records[0]).unwrap();
        assert_eq!(itf.name, "java/lang/Runnable");
        assert_eq!(view.class(object.byte_offset()).unwrap().super_record, None);
    }

    #[test]
    fn test_subgraph_record_reads_back() {
        let (img, main, sg, object) = sample();
        let view = MetadataView::new(&img.rw, &img.ro, BASE);
        let s = view.subgraph(sg.byte_offset()).unwrap();
        assert_eq!(s.holder_record, main.byte_offset());
        assert!(!s.is_full_module_graph);
        assert!(s.has_non_early_klasses);
        assert_eq!(s.entry_fields, vec![(0, 3), (2, 4)]);
        assert_eq!(s.klass_records[0], object.byte_offset());
    }

    #[test]
    fn test_symbols_are_interned_once() {
        let mut b = MetadataBuilder::new();
        let a = b.symbol("run");
        let again = b.symbol("run");
        let long = b.symbol("java/lang/invoke/LambdaForm$Holder");
        assert_eq!(a, again);
        let img = b.finish(BASE);
        let view = MetadataView::new(&img.rw, &img.ro, BASE);
        assert_eq!(view.symbol(a.byte_offset()).unwrap(), "run");
        assert_eq!(view.symbol(long.byte_offset()).unwrap(), "java/lang/invoke/LambdaForm$Holder");
    }

    #[test]
    fn test_relocation_patches_marked_words_only() {
        let (img, main, sg, _) = sample();
        let mut file = Vec::new();
        file.extend_from_slice(&img.rw);
        file.extend_from_slice(&img.ro);
        let rw = 0..img.rw.len();
        let ro = img.rw.len()..file.len();
        let delta = 0x4000_0000i64;
        let patched = relocate(&mut file, rw.clone(), ro.clone(), &img.ptrmap, delta).unwrap();
        assert_eq!(patched, img.ptrmap.count_ones());

        let view = MetadataView::new(&file[rw.clone()], &file[ro.clone()], BASE + delta as u64);
        let c = view.class(main.byte_offset()).unwrap();
        assert_eq!(c.name, "app/Main");
        assert_eq!(c.index, 2);
        assert_eq!(view.subgraph(sg.byte_offset()).unwrap().entry_fields, vec![(0, 3), (2, 4)]);

        // Unrelocated pointers no longer resolve against the new base.
        let stale = MetadataView::new(&img.rw, &img.ro, BASE + delta as u64);
        assert!(stale.class(main.byte_offset()).is_err());
    }

    #[test]
    fn test_bitmap_encoding() {
        let (img, ..) = sample();
        let back = decode_bitmap(&encode_bitmap(&img.ptrmap)).unwrap();
        assert_eq!(back, img.ptrmap);
        assert!(decode_bitmap(&[1, 2, 3]).is_err());
    }
}
