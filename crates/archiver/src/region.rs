//! # Heap Region: Byte Image of the Archived Objects
//!
//! **Layout**:
//! - Offset 0 holds a reserved word so that a zero reference encodes null.
//! - Objects follow in archiving order. Each starts with two header words:
//!   `klass index | identity hash << 32`, then `kind | aux << 8 | length << 32`.
//!   `aux` is the element type of a primitive array or the type of a primitive
//!   mirror.
//! - No object straddles a [`MIN_GC_REGION_ALIGNMENT`] boundary; the gap before a
//!   boundary is zero filled.
//! - Instance fields and mirror statics take one word each. Object-array
//!   elements are 4-byte region offsets. Primitive arrays are packed by element
//!   size. Strings are a length word followed by their UTF-8 bytes.
//! - A mirror starts with two native-pointer words: `class index + 1` of its class
//!   and of its array class, zero when absent.
//!
//! **Bitmaps**:
//! - `oopmap`: one bit per 4-byte unit, set where a non-null reference starts.
//! - `ptrmap`: one bit per word, set on mirror native-pointer words.

use crate::graph::HeapArchiver;
use crate::ArchiverError;
use common::heap::{MirrorTarget, HEAP_WORD_BYTES, MIRROR_NATIVE_SLOTS, OBJECT_HEADER_BYTES};
use common::{BasicType, BitMap, HeapObject, KlassId, ObjectBody, ObjectId, Runtime, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const MIN_GC_REGION_ALIGNMENT: usize = 256 * 1024;

const NARROW_OOP_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ObjectKind {
    Instance = 1,
    ObjArray = 2,
    TypeArray = 3,
    Str = 4,
    ClassMirror = 5,
    PrimitiveMirror = 6,
}

impl ObjectKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ObjectKind::Instance),
            2 => Some(ObjectKind::ObjArray),
            3 => Some(ObjectKind::TypeArray),
            4 => Some(ObjectKind::Str),
            5 => Some(ObjectKind::ClassMirror),
            6 => Some(ObjectKind::PrimitiveMirror),
            _ => None,
        }
    }
}

/// A slot word as stored in the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSlot {
    /// Raw bits; a null reference is a zero word.
    Word(u64),
    Ref(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Instance { slots: Vec<RegionSlot> },
    ObjArray { elements: Vec<Option<u32>> },
    TypeArray { element: BasicType, values: Vec<i64> },
    Str { value: String },
    ClassMirror { klass_index: u32, array_klass_index: Option<u32>, statics: Vec<RegionSlot> },
    PrimitiveMirror { basic_type: BasicType, array_klass_index: Option<u32> },
}

/// One object read back from a region.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedObject {
    pub offset: u32,
    pub klass_index: u32,
    pub identity_hash: u32,
    pub size: usize,
    pub body: DecodedBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapRegion {
    pub bytes: Vec<u8>,
    pub oopmap: BitMap,
    pub ptrmap: BitMap,
    /// Region offset per root, zero for a null root.
    pub roots: Vec<u32>,
}

/// Lays out the objects cached by a [`HeapArchiver`].
#[derive(Debug)]
pub struct HeapRegionWriter {
    offsets: BTreeMap<ObjectId, u32>,
    top: usize,
}

impl Default for HeapRegionWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapRegionWriter {
    pub fn new() -> Self {
        Self {
            offsets: BTreeMap::new(),
            top: HEAP_WORD_BYTES,
        }
    }

    /// Region offset assigned to an archived object.
    pub fn offset_of(&self, obj: ObjectId) -> Option<u32> {
        self.offsets.get(&obj).copied()
    }

    fn allocate(&mut self, obj: ObjectId, size: usize) {
        let start = self.top;
        let end = start + size - 1;
        if start / MIN_GC_REGION_ALIGNMENT != end / MIN_GC_REGION_ALIGNMENT {
            self.top = (end / MIN_GC_REGION_ALIGNMENT) * MIN_GC_REGION_ALIGNMENT;
        }
        self.offsets.insert(obj, self.top as u32);
        self.top += size;
    }

    /// Builds the region image. `klass_index` maps a class to its position in
    /// the archived class table.
    pub fn write(
        mut self,
        rt: &Runtime,
        archiver: &HeapArchiver<'_>,
        klass_index: impl Fn(KlassId) -> Option<u32>,
    ) -> Result<(HeapRegion, BTreeMap<ObjectId, u32>), ArchiverError> {
        for &obj in archiver.archived_objects() {
            let size = rt.heap.get(obj).ok_or(ArchiverError::BadObject(obj))?.size_in_bytes();
            self.allocate(obj, size);
        }
        let mut region = HeapRegion {
            bytes: vec![0; self.top],
            oopmap: BitMap::new(self.top / NARROW_OOP_BYTES),
            ptrmap: BitMap::new(self.top / HEAP_WORD_BYTES),
            roots: Vec::new(),
        };

        let index_of = |k: KlassId| {
            klass_index(k).ok_or_else(|| ArchiverError::UnindexedKlass(rt.klass(k).external_name()))
        };
        let ref_offset = |v: Value| -> Result<Option<u32>, ArchiverError> {
            match v {
                Value::Ref(o) => {
                    let archived = archiver.archived_ref(rt, o).ok_or(ArchiverError::NotArchived(o))?;
                    self.offsets
                        .get(&archived)
                        .copied()
                        .map(Some)
                        .ok_or(ArchiverError::NotArchived(o))
                }
                _ => Ok(None),
            }
        };

        for &obj in archiver.archived_objects() {
            let o = &rt.heap[obj];
            let at = self.offsets[&obj] as usize;
            let (kind, aux) = kind_of(o);
            let header0 = u64::from(index_of(o.klass)?) | (u64::from(o.identity_hash) << 32);
            let header1 = kind as u64 | (u64::from(aux) << 8) | ((o.length() as u64) << 32);
            region.put_u64(at, header0);
            region.put_u64(at + HEAP_WORD_BYTES, header1);
            let body = at + OBJECT_HEADER_BYTES;

            match &o.body {
                ObjectBody::Instance { fields } => {
                    for (i, v) in fields.iter().enumerate() {
                        region.put_slot(body + i * HEAP_WORD_BYTES, *v, ref_offset(*v)?);
                    }
                }
                ObjectBody::ObjArray { elements } => {
                    for (i, v) in elements.iter().enumerate() {
                        let pos = body + i * NARROW_OOP_BYTES;
                        if let Some(off) = ref_offset(*v)? {
                            region.bytes[pos..pos + 4].copy_from_slice(&off.to_le_bytes());
                            region.oopmap.set(pos / NARROW_OOP_BYTES);
                        }
                    }
                }
                ObjectBody::TypeArray { element, values } => {
                    let width = element.element_size();
                    for (i, v) in values.iter().enumerate() {
                        let pos = body + i * width;
                        region.bytes[pos..pos + width].copy_from_slice(&v.to_le_bytes()[..width]);
                    }
                }
                ObjectBody::Str { value } => {
                    region.put_u64(body, value.len() as u64);
                    let pos = body + HEAP_WORD_BYTES;
                    region.bytes[pos..pos + value.len()].copy_from_slice(value.as_bytes());
                }
                ObjectBody::Mirror { target, statics } => {
                    let (klass_word, array_klass) = match *target {
                        MirrorTarget::Class(k) => (u64::from(index_of(k)?) + 1, array_klass_of(rt, k)),
                        MirrorTarget::Primitive(bt) => (0, rt.type_array_klass(bt)),
                    };
                    let array_word = array_klass
                        .and_then(&klass_index)
                        .map_or(0, |i| u64::from(i) + 1);
                    for (i, word) in [klass_word, array_word].into_iter().enumerate() {
                        if word != 0 {
                            let pos = body + i * HEAP_WORD_BYTES;
                            region.put_u64(pos, word);
                            region.ptrmap.set(pos / HEAP_WORD_BYTES);
                        }
                    }
                    let statics_at = body + MIRROR_NATIVE_SLOTS * HEAP_WORD_BYTES;
                    for (i, v) in statics.iter().enumerate() {
                        region.put_slot(statics_at + i * HEAP_WORD_BYTES, *v, ref_offset(*v)?);
                    }
                }
            }
        }

        for root in archiver.roots().as_slice() {
            let off = match root {
                Some(o) => *self.offsets.get(o).ok_or(ArchiverError::NotArchived(*o))?,
                None => 0,
            };
            region.roots.push(off);
        }
        info!(
            target: "cds::heap",
            "Heap region: {} objects, {} bytes, {} roots, {} oops",
            self.offsets.len(),
            region.bytes.len(),
            region.roots.len(),
            region.oopmap.count_ones()
        );
        Ok((region, self.offsets))
    }
}

fn kind_of(o: &HeapObject) -> (ObjectKind, u8) {
    match &o.body {
        ObjectBody::Instance { .. } => (ObjectKind::Instance, 0),
        ObjectBody::ObjArray { .. } => (ObjectKind::ObjArray, 0),
        ObjectBody::TypeArray { element, .. } => (ObjectKind::TypeArray, *element as u8),
        ObjectBody::Str { .. } => (ObjectKind::Str, 0),
        ObjectBody::Mirror { target: MirrorTarget::Class(_), .. } => (ObjectKind::ClassMirror, 0),
        ObjectBody::Mirror { target: MirrorTarget::Primitive(bt), .. } => (ObjectKind::PrimitiveMirror, *bt as u8),
    }
}

fn array_klass_of(rt: &Runtime, k: KlassId) -> Option<KlassId> {
    let klass = rt.klass(k);
    let name = if klass.is_array() {
        format!("[{}", klass.name)
    } else {
        format!("[L{};", klass.name)
    };
    rt.klasses.lookup(klass.loader, &name)
}

/// Sign- or zero-extends a packed primitive array element.
fn widen(element: BasicType, raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf[..raw.len()].copy_from_slice(raw);
    let v = u64::from_le_bytes(buf);
    match element {
        BasicType::Byte => v as u8 as i8 as i64,
        BasicType::Short => v as u16 as i16 as i64,
        BasicType::Int => v as u32 as i32 as i64,
        _ => v as i64,
    }
}

impl HeapRegion {
    fn put_u64(&mut self, pos: usize, v: u64) {
        self.bytes[pos..pos + HEAP_WORD_BYTES].copy_from_slice(&v.to_le_bytes());
    }

    fn put_slot(&mut self, pos: usize, v: Value, reference: Option<u32>) {
        match (v, reference) {
            (_, Some(off)) => {
                self.put_u64(pos, u64::from(off));
                self.oopmap.set(pos / NARROW_OOP_BYTES);
            }
            (Value::Prim(bits), None) => self.put_u64(pos, bits as u64),
            _ => {}
        }
    }

    fn corrupt(offset: usize, reason: &'static str) -> ArchiverError {
        ArchiverError::CorruptRegion {
            offset: offset as u32,
            reason,
        }
    }

    fn get_u64(&self, pos: usize) -> Result<u64, ArchiverError> {
        let raw = self
            .bytes
            .get(pos..pos + HEAP_WORD_BYTES)
            .ok_or_else(|| Self::corrupt(pos, "truncated word"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    fn get_slot(&self, pos: usize) -> Result<RegionSlot, ArchiverError> {
        let word = self.get_u64(pos)?;
        Ok(if self.oopmap.at(pos / NARROW_OOP_BYTES) {
            RegionSlot::Ref(word as u32)
        } else {
            RegionSlot::Word(word)
        })
    }

    /// Value of the string object at `offset` of a region image, read in place.
    pub fn string_in(bytes: &[u8], offset: u32) -> Option<&str> {
        let word = |pos: usize| -> Option<u64> {
            let raw = bytes.get(pos..pos + HEAP_WORD_BYTES)?;
            Some(u64::from_le_bytes(raw.try_into().ok()?))
        };
        let at = offset as usize;
        if at == 0 || ObjectKind::from_u8(word(at + HEAP_WORD_BYTES)? as u8) != Some(ObjectKind::Str) {
            return None;
        }
        let body = at + OBJECT_HEADER_BYTES;
        let len = word(body)? as usize;
        let start = body + HEAP_WORD_BYTES;
        std::str::from_utf8(bytes.get(start..start + len)?).ok()
    }

    /// Decodes the object starting at `offset`.
    pub fn decode_at(&self, offset: u32) -> Result<DecodedObject, ArchiverError> {
        let at = offset as usize;
        if at == 0 {
            return Err(Self::corrupt(at, "null offset"));
        }
        let header0 = self.get_u64(at)?;
        let header1 = self.get_u64(at + HEAP_WORD_BYTES)?;
        let kind = ObjectKind::from_u8(header1 as u8).ok_or_else(|| Self::corrupt(at, "bad object kind"))?;
        let aux = (header1 >> 8) as u8;
        let len = (header1 >> 32) as usize;
        let body = at + OBJECT_HEADER_BYTES;

        let (decoded, payload) = match kind {
            ObjectKind::Instance => {
                let slots = (0..len)
                    .map(|i| self.get_slot(body + i * HEAP_WORD_BYTES))
                    .collect::<Result<_, _>>()?;
                (DecodedBody::Instance { slots }, len * HEAP_WORD_BYTES)
            }
            ObjectKind::ObjArray => {
                let mut elements = Vec::with_capacity(len);
                for i in 0..len {
                    let pos = body + i * NARROW_OOP_BYTES;
                    let raw = self
                        .bytes
                        .get(pos..pos + NARROW_OOP_BYTES)
                        .ok_or_else(|| Self::corrupt(pos, "truncated element"))?;
                    let off = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    elements.push(self.oopmap.at(pos / NARROW_OOP_BYTES).then_some(off));
                }
                (DecodedBody::ObjArray { elements }, len * NARROW_OOP_BYTES)
            }
            ObjectKind::TypeArray => {
                let element = BasicType::from_u8(aux).ok_or_else(|| Self::corrupt(at, "bad element type"))?;
                let width = element.element_size();
                let raw = self
                    .bytes
                    .get(body..body + len * width)
                    .ok_or_else(|| Self::corrupt(body, "truncated array"))?;
                let values = raw.chunks(width.max(1)).map(|c| widen(element, c)).collect();
                (DecodedBody::TypeArray { element, values }, len * width)
            }
            ObjectKind::Str => {
                let n = self.get_u64(body)? as usize;
                let pos = body + HEAP_WORD_BYTES;
                let raw = self
                    .bytes
                    .get(pos..pos + n)
                    .ok_or_else(|| Self::corrupt(pos, "truncated string"))?;
                let value = String::from_utf8(raw.to_vec()).map_err(|_| Self::corrupt(pos, "invalid UTF-8"))?;
                (DecodedBody::Str { value }, HEAP_WORD_BYTES + n)
            }
            ObjectKind::ClassMirror | ObjectKind::PrimitiveMirror => {
                let klass_word = self.get_u64(body)?;
                let array_word = self.get_u64(body + HEAP_WORD_BYTES)?;
                let array_klass_index = (array_word != 0).then(|| (array_word - 1) as u32);
                let decoded = if kind == ObjectKind::ClassMirror {
                    if klass_word == 0 {
                        return Err(Self::corrupt(body, "class mirror without class"));
                    }
                    let statics_at = body + MIRROR_NATIVE_SLOTS * HEAP_WORD_BYTES;
                    let statics = (0..len)
                        .map(|i| self.get_slot(statics_at + i * HEAP_WORD_BYTES))
                        .collect::<Result<_, _>>()?;
                    DecodedBody::ClassMirror {
                        klass_index: (klass_word - 1) as u32,
                        array_klass_index,
                        statics,
                    }
                } else {
                    DecodedBody::PrimitiveMirror {
                        basic_type: BasicType::from_u8(aux).ok_or_else(|| Self::corrupt(at, "bad primitive type"))?,
                        array_klass_index,
                    }
                };
                (decoded, (MIRROR_NATIVE_SLOTS + len) * HEAP_WORD_BYTES)
            }
        };
        Ok(DecodedObject {
            offset,
            klass_index: header0 as u32,
            identity_hash: (header0 >> 32) as u32,
            size: (OBJECT_HEADER_BYTES + payload).next_multiple_of(HEAP_WORD_BYTES),
            body: decoded,
        })
    }

    /// Every object in the region, in layout order.
    pub fn objects(&self) -> Result<Vec<DecodedObject>, ArchiverError> {
        let mut out = Vec::new();
        let mut pos = HEAP_WORD_BYTES;
        while pos < self.bytes.len() {
            if self.get_u64(pos)? == 0 {
                // Filler up to the next alignment boundary.
                pos = (pos / MIN_GC_REGION_ALIGNMENT + 1) * MIN_GC_REGION_ALIGNMENT;
                continue;
            }
            let obj = self.decode_at(pos as u32)?;
            pos += obj.size;
            out.push(obj);
        }
        Ok(out)
    }

    /// Recreates the region's objects in `rt`, preserving identity hashes.
    /// `klass_of` maps a class-table index to a class of `rt`. Returns the new
    /// object for each region offset.
    pub fn materialize(
        &self,
        rt: &mut Runtime,
        klass_of: impl Fn(u32) -> Option<KlassId>,
    ) -> Result<BTreeMap<u32, ObjectId>, ArchiverError> {
        let decoded = self.objects()?;
        let klass = |index: u32, at: u32| klass_of(index).ok_or_else(|| Self::corrupt(at as usize, "unknown class index"));

        let mut ids = BTreeMap::new();
        for d in &decoded {
            let mut placeholder = HeapObject::new(klass(d.klass_index, d.offset)?, ObjectBody::Instance { fields: Vec::new() });
            placeholder.identity_hash = d.identity_hash;
            ids.insert(d.offset, rt.heap.alloc(placeholder));
        }
        let lookup = |off: u32| ids.get(&off).copied().ok_or_else(|| Self::corrupt(off as usize, "dangling reference"));
        let to_value = |slot: &RegionSlot, is_ref: bool| -> Result<Value, ArchiverError> {
            Ok(match *slot {
                RegionSlot::Ref(off) => Value::Ref(lookup(off)?),
                RegionSlot::Word(_) if is_ref => Value::Null,
                RegionSlot::Word(bits) => Value::Prim(bits as i64),
            })
        };

        let mut bodies = Vec::with_capacity(decoded.len());
        for d in &decoded {
            let body = match &d.body {
                DecodedBody::Instance { slots } => {
                    let k = klass(d.klass_index, d.offset)?;
                    let kinds: Vec<bool> = rt
                        .klasses
                        .instance_layout(k)
                        .iter()
                        .map(|(_, f)| f.is_reference())
                        .collect();
                    let fields = slots
                        .iter()
                        .enumerate()
                        .map(|(i, s)| to_value(s, kinds.get(i).copied().unwrap_or(false)))
                        .collect::<Result<_, _>>()?;
                    ObjectBody::Instance { fields }
                }
                DecodedBody::ObjArray { elements } => ObjectBody::ObjArray {
                    elements: elements
                        .iter()
                        .map(|e| e.map_or(Ok(Value::Null), |off| lookup(off).map(Value::Ref)))
                        .collect::<Result<_, _>>()?,
                },
                DecodedBody::TypeArray { element, values } => ObjectBody::TypeArray {
                    element: *element,
                    values: values.clone(),
                },
                DecodedBody::Str { value } => ObjectBody::Str { value: value.clone() },
                DecodedBody::ClassMirror { klass_index, statics, .. } => {
                    let target = klass(*klass_index, d.offset)?;
                    let kinds: Vec<bool> = rt
                        .klass(target)
                        .static_fields()
                        .map(|(_, f)| f.is_reference())
                        .collect();
                    let statics = statics
                        .iter()
                        .enumerate()
                        .map(|(i, s)| to_value(s, kinds.get(i).copied().unwrap_or(false)))
                        .collect::<Result<_, _>>()?;
                    ObjectBody::Mirror {
                        target: MirrorTarget::Class(target),
                        statics,
                    }
                }
                DecodedBody::PrimitiveMirror { basic_type, .. } => ObjectBody::Mirror {
                    target: MirrorTarget::Primitive(*basic_type),
                    statics: Vec::new(),
                },
            };
            bodies.push((ids[&d.offset], body));
        }
        for (id, body) in bodies {
            if let Some(obj) = rt.heap.get_mut(id) {
                obj.body = body;
            }
        }
        debug!(target: "cds::heap", "Materialized {} archived objects", ids.len());
        Ok(ids)
    }

    /// Object for root `index` after [`HeapRegion::materialize`].
    pub fn root(&self, ids: &BTreeMap<u32, ObjectId>, index: u32) -> Option<ObjectId> {
        let off = *self.roots.get(index as usize)?;
        if off == 0 {
            return None;
        }
        ids.get(&off).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Archiver;
    use common::builder::KlassBuilder;
    use common::CdsConfig;
    use dumptime::DumpTimeTable;

    fn dense_index(rt: &Runtime) -> impl Fn(KlassId) -> Option<u32> + '_ {
        move |k: KlassId| (k.index() < rt.klasses.len()).then_some(k.0)
    }

    #[test]
    fn test_region_round_trips_integer_cache() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let cache_array = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
        let config = CdsConfig::default();
        let mut table = DumpTimeTable::new();
        let mut archiver = HeapArchiver::new(&config);
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, cache_array).unwrap());

        let (region, offsets) = HeapRegionWriter::new()
            .write(&rt, &archiver, dense_index(&rt))
            .unwrap();
        assert_eq!(offsets.len(), 257);
        assert_eq!(region.oopmap.count_ones(), 256);
        assert_eq!(&region.bytes[..8], &[0; 8]);

        let decoded = region.decode_at(offsets[&cache_array]).unwrap();
        assert_eq!(decoded.identity_hash, rt.heap[cache_array].identity_hash);
        let DecodedBody::ObjArray { elements } = &decoded.body else {
            panic!("expected an object array");
        };
        assert_eq!(elements.len(), 256);
        let zero = region.decode_at(elements[128].unwrap()).unwrap();
        assert_eq!(zero.body, DecodedBody::Instance { slots: vec![RegionSlot::Word(0)] });
    }

    #[test]
    fn test_objects_do_not_straddle_alignment() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let array_klass = rt.boot_class(common::runtime::OBJECT_ARRAY_CLASS).unwrap();
        let mut elements = Vec::new();
        for _ in 0..3 {
            let chunk = rt.new_type_array(BasicType::Byte, vec![1; MIN_GC_REGION_ALIGNMENT / 3]).unwrap();
            elements.push(Value::Ref(chunk));
        }
        let outer = rt.new_object_array(array_klass, elements);
        let config = CdsConfig::default();
        let mut table = DumpTimeTable::new();
        let mut archiver = HeapArchiver::new(&config);
        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, outer).unwrap());

        let (region, offsets) = HeapRegionWriter::new()
            .write(&rt, &archiver, dense_index(&rt))
            .unwrap();
        for (&obj, &off) in &offsets {
            let start = off as usize;
            let end = start + rt.heap[obj].size_in_bytes() - 1;
            assert_eq!(start / MIN_GC_REGION_ALIGNMENT, end / MIN_GC_REGION_ALIGNMENT);
        }
        let objects = region.objects().unwrap();
        assert_eq!(objects.len(), 4);
        let DecodedBody::TypeArray { values, .. } = &objects[1].body else {
            panic!("expected a byte array");
        };
        assert!(values.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_materialize_preserves_identity_hash_and_strings() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let hello = rt.intern("hello").unwrap();
        let string_klass = rt.boot_class("java/lang/String").unwrap();
        let mirror = rt.klass(string_klass).mirror.unwrap();
        let array_klass = rt.boot_class(common::runtime::OBJECT_ARRAY_CLASS).unwrap();
        let outer = rt.new_object_array(array_klass, vec![Value::Ref(hello), Value::Null, Value::Ref(mirror)]);
        let config = CdsConfig::default();
        let mut table = DumpTimeTable::new();
        let mut archiver = HeapArchiver::new(&config);
        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, outer).unwrap());
        let (region, offsets) = HeapRegionWriter::new()
            .write(&rt, &archiver, dense_index(&rt))
            .unwrap();

        let mut fresh = KlassBuilder::bootstrap_runtime();
        let ids = region.materialize(&mut fresh, |i| Some(KlassId(i))).unwrap();
        let copy = ids[&offsets[&outer]];
        assert_eq!(fresh.heap[copy].identity_hash, rt.heap[outer].identity_hash);
        let slots = fresh.heap[copy].slots().to_vec();
        assert_eq!(slots[1], Value::Null);
        let s = slots[0].as_ref().unwrap();
        assert_eq!(fresh.heap[s].as_str(), Some("hello"));
        let m = slots[2].as_ref().unwrap();
        assert_eq!(fresh.heap[m].mirror_target(), Some(MirrorTarget::Class(string_klass)));
        assert_eq!(fresh.heap[m].identity_hash, rt.heap[mirror].identity_hash);
    }

    #[test]
    fn test_unindexed_klass_is_an_error() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let s = rt.intern("x").unwrap();
        let config = CdsConfig::default();
        let mut table = DumpTimeTable::new();
        let mut archiver = HeapArchiver::new(&config);
        archiver.archive_reachable(&mut rt, &mut table, holder, s).unwrap();
        let err = HeapRegionWriter::new().write(&rt, &archiver, |_| None).unwrap_err();
        assert!(matches!(err, ArchiverError::UnindexedKlass(_)));
    }
}
