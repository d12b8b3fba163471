//! Permanent objects.
//!
//! Every archived object gets a compact, stable index: the objects are laid out
//! in segments of `1 << PERMOBJ_SEGMENT_SHIFT` entries, and each segment is an
//! object array appended to the roots array after all other roots. Index
//! `(segment << SHIFT) + j` names entry `j` of segment `segment`.

use common::ObjectId;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const PERMOBJ_SEGMENT_SHIFT: u32 = 14;
pub const PERMOBJ_SEGMENT_SIZE: usize = 1 << PERMOBJ_SEGMENT_SHIFT;

#[derive(Debug, Default)]
pub struct PermanentObjects {
    segments: Vec<Vec<ObjectId>>,
    /// Root index of the first segment.
    first_root: u32,
    /// Built on first lookup.
    index: Mutex<Option<HashMap<ObjectId, u32>>>,
}

impl PermanentObjects {
    /// Splits `objects` into segments. `first_root` is the roots-array index the
    /// first segment array will occupy.
    pub fn new(objects: &[ObjectId], first_root: u32) -> Self {
        Self {
            segments: objects
                .chunks(PERMOBJ_SEGMENT_SIZE)
                .map(<[ObjectId]>::to_vec)
                .collect(),
            first_root,
            index: Mutex::new(None),
        }
    }

    pub fn segments(&self) -> &[Vec<ObjectId>] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn first_root(&self) -> u32 {
        self.first_root
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get_archived_object_permanent_index(&self, obj: ObjectId) -> Option<u32> {
        let mut guard = self.index.lock();
        let index = guard.get_or_insert_with(|| {
            let mut map = HashMap::with_capacity(self.len());
            for (s, seg) in self.segments.iter().enumerate() {
                for (j, &o) in seg.iter().enumerate() {
                    map.insert(o, ((s as u32) << PERMOBJ_SEGMENT_SHIFT) + j as u32);
                }
            }
            map
        });
        index.get(&obj).copied()
    }

    pub fn get_archived_object(&self, index: u32) -> Option<ObjectId> {
        let segment = (index >> PERMOBJ_SEGMENT_SHIFT) as usize;
        let j = (index as usize) & (PERMOBJ_SEGMENT_SIZE - 1);
        self.segments.get(segment)?.get(j).copied()
    }
}
