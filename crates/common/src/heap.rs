//! # Heap: Object Arena of the Training Run
//!
//! Objects are addressed by [`ObjectId`]. An id is the object's identity: two
//! references are the same object iff their ids are equal. The archiver keys its
//! seen-set and cache by id for that reason.
//!
//! Identity hashes are sampled lazily, exactly once per object, and stored in the
//! object header so that later readers (and the archived copy) see the same value.

use crate::{BasicType, KlassId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// Bytes of header every object carries (mark word + class word).
pub const OBJECT_HEADER_BYTES: usize = 16;

/// Size of a heap word and of a reference slot in the archived heap region.
pub const HEAP_WORD_BYTES: usize = 8;

/// Slots at the start of a mirror that hold native (metadata) pointers.
pub const MIRROR_NATIVE_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Contents of a field, array element or static slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    /// Any primitive, stored as its raw bits.
    Prim(i64),
    Ref(ObjectId),
}

impl Value {
    pub fn as_ref(self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    /// Default value of a slot of the given type.
    pub fn default_for(bt: BasicType) -> Value {
        if bt.is_reference() {
            Value::Null
        } else {
            Value::Prim(0)
        }
    }
}

/// What a mirror (reflective class object) stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorTarget {
    Class(KlassId),
    Primitive(BasicType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectBody {
    /// Plain instance; `fields` follow declared instance-field order.
    Instance { fields: Vec<Value> },
    ObjArray { elements: Vec<Value> },
    TypeArray { element: BasicType, values: Vec<i64> },
    Str { value: String },
    /// Class mirror; `statics` follow declared static-field order.
    Mirror { target: MirrorTarget, statics: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapObject {
    pub klass: KlassId,
    /// Zero until sampled.
    #[serde(default)]
    pub identity_hash: u32,
    pub body: ObjectBody,
}

impl HeapObject {
    pub fn new(klass: KlassId, body: ObjectBody) -> Self {
        Self {
            klass,
            identity_hash: 0,
            body,
        }
    }

    /// Outgoing references in declared order (fields, elements, statics).
    pub fn references(&self) -> Vec<ObjectId> {
        self.slots().iter().filter_map(|v| v.as_ref()).collect()
    }

    /// Reference-capable slots in declared order. Empty for strings and
    /// primitive arrays.
    pub fn slots(&self) -> &[Value] {
        match &self.body {
            ObjectBody::Instance { fields } => fields,
            ObjectBody::ObjArray { elements } => elements,
            ObjectBody::Mirror { statics, .. } => statics,
            ObjectBody::TypeArray { .. } | ObjectBody::Str { .. } => &[],
        }
    }

    pub fn mirror_target(&self) -> Option<MirrorTarget> {
        match self.body {
            ObjectBody::Mirror { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror_target().is_some()
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.body {
            ObjectBody::Str { value } => Some(value),
            _ => None,
        }
    }

    /// Number of elements for arrays, byte length for strings, slot count otherwise.
    pub fn length(&self) -> usize {
        match &self.body {
            ObjectBody::Instance { fields } => fields.len(),
            ObjectBody::ObjArray { elements } => elements.len(),
            ObjectBody::TypeArray { values, .. } => values.len(),
            ObjectBody::Str { value } => value.len(),
            ObjectBody::Mirror { statics, .. } => statics.len(),
        }
    }

    /// Size of the object as laid out in the heap, rounded up to a heap word.
    pub fn size_in_bytes(&self) -> usize {
        let payload = match &self.body {
            ObjectBody::Instance { fields } => fields.len() * HEAP_WORD_BYTES,
            ObjectBody::ObjArray { elements } => elements.len() * BasicType::Object.element_size(),
            ObjectBody::TypeArray { element, values } => values.len() * element.element_size(),
            ObjectBody::Str { value } => HEAP_WORD_BYTES + value.len(),
            ObjectBody::Mirror { statics, .. } => {
                (MIRROR_NATIVE_SLOTS + statics.len()) * HEAP_WORD_BYTES
            }
        };
        (OBJECT_HEADER_BYTES + payload).next_multiple_of(HEAP_WORD_BYTES)
    }
}

/// Object arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heap {
    objects: Vec<HeapObject>,
    /// State of the identity-hash generator. Part of the snapshot so that two
    /// dumps of the same training run sample the same hashes.
    hash_state: u32,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            hash_state: 0x2545_f491,
        }
    }

    pub fn alloc(&mut self, obj: HeapObject) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(obj);
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(id.index())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &HeapObject)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (ObjectId(i as u32), o))
    }

    /// Returns the identity hash of `id`, sampling and storing it on first use.
    ///
    /// Returns `None` only for an id the heap never allocated.
    pub fn identity_hash(&mut self, id: ObjectId) -> Option<u32> {
        let current = self.objects.get(id.index())?.identity_hash;
        if current != 0 {
            return Some(current);
        }
        let hash = self.next_hash();
        if let Some(obj) = self.objects.get_mut(id.index()) {
            obj.identity_hash = hash;
        }
        Some(hash)
    }

    /// Identity hash if it has already been sampled.
    pub fn peek_identity_hash(&self, id: ObjectId) -> Option<u32> {
        self.get(id)
            .map(|o| o.identity_hash)
            .filter(|&h| h != 0)
    }

    // xorshift32, masked to 31 bits, never zero.
    fn next_hash(&mut self) -> u32 {
        loop {
            let mut x = self.hash_state;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.hash_state = x;
            let h = x & 0x7fff_ffff;
            if h != 0 {
                return h;
            }
        }
    }
}

impl Index<ObjectId> for Heap {
    type Output = HeapObject;

    fn index(&self, id: ObjectId) -> &HeapObject {
        &self.objects[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(fields: Vec<Value>) -> HeapObject {
        HeapObject::new(KlassId(0), ObjectBody::Instance { fields })
    }

    #[test]
    fn test_identity_hash_sampled_once() {
        let mut heap = Heap::new();
        let a = heap.alloc(instance(vec![]));
        assert_eq!(heap.peek_identity_hash(a), None);
        let h1 = heap.identity_hash(a).unwrap();
        let h2 = heap.identity_hash(a).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, 0);
        assert_eq!(heap.peek_identity_hash(a), Some(h1));
    }

    #[test]
    fn test_identity_hash_reproducible_from_clone() {
        let mut heap = Heap::new();
        let a = heap.alloc(instance(vec![]));
        let b = heap.alloc(instance(vec![]));
        let mut copy = heap.clone();
        assert_eq!(heap.identity_hash(b), copy.identity_hash(b));
        assert_eq!(heap.identity_hash(a), copy.identity_hash(a));
    }

    #[test]
    fn test_references_in_declared_order() {
        let mut heap = Heap::new();
        let x = heap.alloc(instance(vec![]));
        let y = heap.alloc(instance(vec![]));
        let holder = heap.alloc(instance(vec![
            Value::Ref(y),
            Value::Prim(3),
            Value::Null,
            Value::Ref(x),
        ]));
        assert_eq!(heap[holder].references(), vec![y, x]);
    }

    #[test]
    fn test_size_rounding() {
        let arr = HeapObject::new(
            KlassId(1),
            ObjectBody::TypeArray {
                element: BasicType::Byte,
                values: vec![0; 3],
            },
        );
        assert_eq!(arr.size_in_bytes(), 24);
        let s = HeapObject::new(KlassId(2), ObjectBody::Str { value: "abc".into() });
        assert_eq!(s.size_in_bytes() % HEAP_WORD_BYTES, 0);
    }
}
