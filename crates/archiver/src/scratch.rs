//! Scratch objects: the dump-time stand-ins that are archived in place of live
//! objects the running program may still mutate.
//!
//! A class mirror is archived as a scratch copy. Its static fields are copied
//! only when the class can be archived pre-initialized; otherwise they hold
//! their type defaults and the class initializer runs again at run time.

use crate::ArchiverError;
use common::heap::MirrorTarget;
use common::{BasicType, HeapObject, KlassId, ObjectBody, ObjectId, Runtime, Value};
use dumptime::{can_be_preinited, DumpTimeTable};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Classes of the exception prototypes the runtime throws without running any
/// constructor, in root order.
pub const ARCHIVED_EXCEPTION_CLASSES: [&str; 6] = [
    "java/lang/NullPointerException",
    "java/lang/ArithmeticException",
    "java/lang/VirtualMachineError",
    "java/lang/ArrayIndexOutOfBoundsException",
    "java/lang/ArrayStoreException",
    "java/lang/ClassCastException",
];

#[derive(Debug, Default)]
struct ScratchTables {
    mirrors: BTreeMap<KlassId, ObjectId>,
    primitive_mirrors: BTreeMap<BasicType, ObjectId>,
    /// Every scratch mirror, to recognise one that is reached again.
    scratch_ids: BTreeSet<ObjectId>,
    exceptions: Vec<ObjectId>,
    strings_array: Option<ObjectId>,
}

#[derive(Debug, Default)]
pub struct ScratchObjects {
    tables: Mutex<ScratchTables>,
}

impl ScratchObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scratch(&self, obj: ObjectId) -> bool {
        self.tables.lock().scratch_ids.contains(&obj)
    }

    /// The scratch mirror standing for the live mirror `orig`, created on first
    /// request. Objects that are not mirrors, and scratch mirrors themselves,
    /// map to themselves.
    pub fn scratch_mirror_for(
        &self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        orig: ObjectId,
    ) -> Result<ObjectId, ArchiverError> {
        let target = rt
            .heap
            .get(orig)
            .ok_or(ArchiverError::BadObject(orig))?
            .mirror_target();
        let Some(target) = target else {
            return Ok(orig);
        };
        if self.is_scratch(orig) {
            return Ok(orig);
        }
        match target {
            MirrorTarget::Class(k) => self.scratch_class_mirror(rt, table, k),
            MirrorTarget::Primitive(bt) => self.scratch_primitive_mirror(rt, orig, bt),
        }
    }

    fn scratch_class_mirror(
        &self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        k: KlassId,
    ) -> Result<ObjectId, ArchiverError> {
        if let Some(&m) = self.tables.lock().mirrors.get(&k) {
            return Ok(m);
        }
        let orig = rt.ensure_mirror(k)?;
        let orig_obj = rt.heap.get(orig).ok_or(ArchiverError::BadObject(orig))?;
        let class_klass = orig_obj.klass;
        let preinited = rt.klass(k).state.is_initialized() && can_be_preinited(rt, table, k);
        let statics: Vec<Value> = if preinited {
            orig_obj.slots().to_vec()
        } else {
            rt.klass(k)
                .static_fields()
                .map(|(_, f)| Value::default_for(f.basic_type()))
                .collect()
        };
        let m = rt.heap.alloc(HeapObject::new(
            class_klass,
            ObjectBody::Mirror {
                target: MirrorTarget::Class(k),
                statics,
            },
        ));
        // The archived mirror must report the identity hash of the live one.
        if let Some(hash) = rt.heap.identity_hash(orig) {
            if let Some(obj) = rt.heap.get_mut(m) {
                obj.identity_hash = hash;
            }
        }
        trace!(
            target: "cds::heap",
            "scratch mirror {} for {}{}",
            m,
            rt.klass(k).external_name(),
            if preinited { " (initialized)" } else { "" }
        );
        let mut tables = self.tables.lock();
        tables.mirrors.insert(k, m);
        tables.scratch_ids.insert(m);
        Ok(m)
    }

    fn scratch_primitive_mirror(
        &self,
        rt: &mut Runtime,
        orig: ObjectId,
        bt: BasicType,
    ) -> Result<ObjectId, ArchiverError> {
        if let Some(&m) = self.tables.lock().primitive_mirrors.get(&bt) {
            return Ok(m);
        }
        let mut copy = rt.heap.get(orig).ok_or(ArchiverError::BadObject(orig))?.clone();
        copy.identity_hash = rt.heap.identity_hash(orig).unwrap_or_default();
        let m = rt.heap.alloc(copy);
        let mut tables = self.tables.lock();
        tables.primitive_mirrors.insert(bt, m);
        tables.scratch_ids.insert(m);
        Ok(m)
    }

    /// Scratch mirrors of the primitive types, in basic-type order.
    pub fn primitive_mirrors(&self, rt: &mut Runtime, table: &mut DumpTimeTable) -> Result<Vec<(BasicType, ObjectId)>, ArchiverError> {
        let live = rt.ensure_primitive_mirrors()?;
        live.into_iter()
            .map(|(bt, m)| Ok((bt, self.scratch_mirror_for(rt, table, m)?)))
            .collect()
    }

    /// One pre-allocated instance per class of [`ARCHIVED_EXCEPTION_CLASSES`].
    pub fn exception_prototypes(&self, rt: &mut Runtime) -> Result<Vec<ObjectId>, ArchiverError> {
        {
            let tables = self.tables.lock();
            if !tables.exceptions.is_empty() {
                return Ok(tables.exceptions.clone());
            }
        }
        let mut out = Vec::with_capacity(ARCHIVED_EXCEPTION_CLASSES.len());
        for name in ARCHIVED_EXCEPTION_CLASSES {
            let k = rt
                .boot_class(name)
                .ok_or(ArchiverError::MissingCoreClass(name))?;
            out.push(rt.new_instance(k));
        }
        self.tables.lock().exceptions = out.clone();
        Ok(out)
    }

    /// An `Object[]` of every interned string, sorted by content.
    pub fn interned_strings_array(&self, rt: &mut Runtime) -> Result<ObjectId, ArchiverError> {
        if let Some(a) = self.tables.lock().strings_array {
            return Ok(a);
        }
        let array_klass = rt
            .boot_class(common::runtime::OBJECT_ARRAY_CLASS)
            .ok_or(ArchiverError::MissingCoreClass(common::runtime::OBJECT_ARRAY_CLASS))?;
        // BTreeMap iteration is already in content order.
        let elements = rt.interned.values().map(|&s| Value::Ref(s)).collect();
        let a = rt.new_object_array(array_klass, elements);
        self.tables.lock().strings_array = Some(a);
        Ok(a)
    }

    /// Scratch mirror already created for class `k`.
    pub fn mirror_of(&self, k: KlassId) -> Option<ObjectId> {
        self.tables.lock().mirrors.get(&k).copied()
    }

    pub fn primitive_mirror_of(&self, bt: BasicType) -> Option<ObjectId> {
        self.tables.lock().primitive_mirrors.get(&bt).copied()
    }

    pub fn mirror_count(&self) -> usize {
        let tables = self.tables.lock();
        tables.mirrors.len() + tables.primitive_mirrors.len()
    }
}
