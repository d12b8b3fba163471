//! The subgraph walk and the archived-object cache.

use crate::permanent::PermanentObjects;
use crate::roots::{resolve_root_fields, ResolvedRootField, RootField, RootGroup, RootsArray};
use crate::roots::{DEFAULT_ROOT_FIELDS, FMG_ROOT_FIELDS};
use crate::scratch::ScratchObjects;
use crate::subgraph::{check_default_subgraph_classes, KlassSubGraphInfo};
use crate::{Archiver, ArchiverError, MAX_OBJ_SIZE};
use common::heap::{MirrorTarget, MIRROR_NATIVE_SLOTS};
use common::runtime::{OBJECT_ARRAY_CLASS, OBJECT_CLASS};
use common::{BasicType, CdsConfig, KlassFlags, KlassId, ObjectId, Runtime, Value};
use dumptime::DumpTimeTable;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use tracing::{debug, error, info, warn};

/// Bookkeeping for one archived object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    /// Position in archiving order.
    pub order: u32,
    /// The object through which this one was first reached.
    pub referrer: Option<ObjectId>,
    pub level: u32,
    /// Slots holding native pointers rather than references.
    pub native_pointer_slots: Vec<u32>,
}

/// Root indices of the objects the runtime locates without a holder field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialRoots {
    pub interned_strings: Option<u32>,
    pub exceptions: Vec<Option<u32>>,
    pub primitive_mirrors: Vec<(BasicType, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivedHeapSummary {
    pub objects: usize,
    pub roots: usize,
    pub subgraphs: usize,
    pub mirrors: usize,
    pub dropped_roots: usize,
    pub permanent_segments: usize,
    pub unusual_klasses: usize,
}

struct Pending {
    obj: ObjectId,
    level: u32,
    referrer: Option<ObjectId>,
}

pub struct HeapArchiver<'a> {
    config: &'a CdsConfig,
    scratch: ScratchObjects,
    cache: HashMap<ObjectId, CachedObject>,
    order: Vec<ObjectId>,
    /// Objects visited while recording the current holder.
    seen: HashSet<ObjectId>,
    subgraphs: BTreeMap<KlassId, KlassSubGraphInfo>,
    default_holder: Option<KlassId>,
    roots: RootsArray,
    special: SpecialRoots,
    mirror_roots: BTreeMap<KlassId, u32>,
    enums_handled: BTreeSet<KlassId>,
    extra_root_fields: Vec<RootField>,
    permanent: Option<PermanentObjects>,
    dropped_roots: usize,
}

impl<'a> HeapArchiver<'a> {
    pub fn new(config: &'a CdsConfig) -> Self {
        Self {
            config,
            scratch: ScratchObjects::new(),
            cache: HashMap::new(),
            order: Vec::new(),
            seen: HashSet::new(),
            subgraphs: BTreeMap::new(),
            default_holder: None,
            roots: RootsArray::new(),
            special: SpecialRoots::default(),
            mirror_roots: BTreeMap::new(),
            enums_handled: BTreeSet::new(),
            extra_root_fields: Vec::new(),
            permanent: None,
            dropped_roots: 0,
        }
    }

    /// Adds a root field archived after the built-in ones, in the default group.
    pub fn add_root_field(&mut self, field: RootField) {
        self.extra_root_fields.push(field);
    }

    // ---------------------------------------------------------------------
    // accessors
    // ---------------------------------------------------------------------

    pub fn is_archived(&self, obj: ObjectId) -> bool {
        self.cache.contains_key(&obj)
    }

    pub fn cached(&self, obj: ObjectId) -> Option<&CachedObject> {
        self.cache.get(&obj)
    }

    /// Archived objects in archiving order.
    pub fn archived_objects(&self) -> &[ObjectId] {
        &self.order
    }

    pub fn roots(&self) -> &RootsArray {
        &self.roots
    }

    pub fn subgraphs(&self) -> impl Iterator<Item = &KlassSubGraphInfo> {
        self.subgraphs.values()
    }

    pub fn subgraph(&self, holder: KlassId) -> Option<&KlassSubGraphInfo> {
        self.subgraphs.get(&holder)
    }

    pub fn special_roots(&self) -> &SpecialRoots {
        &self.special
    }

    pub fn mirror_roots(&self) -> &BTreeMap<KlassId, u32> {
        &self.mirror_roots
    }

    pub fn permanent(&self) -> Option<&PermanentObjects> {
        self.permanent.as_ref()
    }

    pub fn scratch(&self) -> &ScratchObjects {
        &self.scratch
    }

    /// The archived object standing for `obj`: `obj` itself, or the scratch
    /// mirror that replaced a live mirror.
    pub fn archived_ref(&self, rt: &Runtime, obj: ObjectId) -> Option<ObjectId> {
        if self.cache.contains_key(&obj) {
            return Some(obj);
        }
        let scratch = match rt.heap.get(obj)?.mirror_target()? {
            MirrorTarget::Class(k) => self.scratch.mirror_of(k),
            MirrorTarget::Primitive(bt) => self.scratch.primitive_mirror_of(bt),
        }?;
        self.cache.contains_key(&scratch).then_some(scratch)
    }

    // ---------------------------------------------------------------------
    // recording
    // ---------------------------------------------------------------------

    fn start_recording(&mut self, holder: KlassId, group: RootGroup) {
        self.subgraphs
            .entry(holder)
            .or_insert_with(|| KlassSubGraphInfo::new(holder, group));
        self.seen.clear();
    }

    fn done_recording(&self, rt: &Runtime, holder: KlassId) {
        if let Some(info) = self.subgraphs.get(&holder) {
            debug!(
                target: "cds::heap",
                "Done recording subgraph(s) for archived fields in {}: {} entry fields, {} klasses",
                rt.klass(holder).external_name(),
                info.entry_fields.len(),
                info.object_klasses.len()
            );
        }
    }

    fn default_holder(&self) -> Result<KlassId, ArchiverError> {
        self.default_holder
            .ok_or(ArchiverError::MissingCoreClass(OBJECT_CLASS))
    }

    /// Renders the chain of referrers leading to `obj`, outermost first.
    fn reference_trace(&self, rt: &Runtime, referrer: Option<ObjectId>, obj: ObjectId) -> String {
        let mut chain = vec![obj];
        let mut next = referrer;
        while let Some(o) = next {
            if chain.contains(&o) {
                break;
            }
            chain.push(o);
            next = self.cache.get(&o).and_then(|c| c.referrer);
        }
        let mut out = String::from("Reference trace");
        for (i, o) in chain.iter().rev().enumerate() {
            let class = rt
                .heap
                .get(*o)
                .map(|h| rt.klass(h.klass).external_name())
                .unwrap_or_else(|| "<unknown>".to_string());
            let _ = write!(out, "\n[{}] {} {}", i, class, o);
        }
        out
    }

    fn class_name(rt: &Runtime, obj: ObjectId) -> String {
        rt.heap
            .get(obj)
            .map(|h| rt.klass(h.klass).external_name())
            .unwrap_or_default()
    }

    /// Archives the reference statics of an enum class the first time one of
    /// its constants is reached, so that the constants keep their identity.
    fn queue_enum_statics(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        enum_klass: KlassId,
        p: &Pending,
        stack: &mut Vec<Pending>,
    ) -> Result<(), ArchiverError> {
        if !self.enums_handled.insert(enum_klass) {
            return Ok(());
        }
        let statics: Vec<(usize, bool)> = rt
            .klass(enum_klass)
            .static_fields()
            .map(|(slot, f)| (slot, f.is_reference()))
            .collect();
        let mut root_indices = Vec::new();
        let mut queued = Vec::new();
        for (slot, is_ref) in statics {
            if !is_ref {
                continue;
            }
            let root = match rt.static_value(enum_klass, slot).and_then(Value::as_ref) {
                Some(o) => {
                    let archived = self.scratch.scratch_mirror_for(rt, table, o)?;
                    queued.push(Pending {
                        obj: o,
                        level: p.level + 1,
                        referrer: Some(p.obj),
                    });
                    self.roots.append(Some(archived))
                }
                None => self.roots.append(None),
            };
            root_indices.push(root as i32);
        }
        debug!(
            target: "cds::heap",
            "Archiving {} static fields of enum {}",
            root_indices.len(),
            rt.klass(enum_klass).external_name()
        );
        table.info_mut(rt, enum_klass).enum_static_roots = root_indices;
        stack.extend(queued.into_iter().rev());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // phases
    // ---------------------------------------------------------------------

    fn archive_special_roots(&mut self, rt: &mut Runtime, table: &mut DumpTimeTable) -> Result<(), ArchiverError> {
        let holder = self.default_holder()?;

        let strings = self.scratch.interned_strings_array(rt)?;
        if self.archive_reachable(rt, table, holder, strings)? {
            self.special.interned_strings = Some(self.roots.append(Some(strings)));
        }

        let exceptions = self.scratch.exception_prototypes(rt)?;
        self.special.exceptions.clear();
        for ex in exceptions {
            let root = if self.archive_reachable(rt, table, holder, ex)? {
                Some(self.roots.append(Some(ex)))
            } else {
                None
            };
            self.special.exceptions.push(root);
        }

        self.special.primitive_mirrors.clear();
        for (bt, m) in self.scratch.primitive_mirrors(rt, table)? {
            if self.archive_reachable(rt, table, holder, m)? {
                let root = self.roots.append(Some(m));
                self.special.primitive_mirrors.push((bt, root));
            }
        }
        Ok(())
    }

    /// Archives the scratch mirror of every class in `klasses` and records its
    /// root index.
    pub fn archive_java_mirrors(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        klasses: &[KlassId],
    ) -> Result<usize, ArchiverError> {
        let holder = self.default_holder()?;
        let mut archived = 0;
        for &k in klasses {
            if self.mirror_roots.contains_key(&k) {
                continue;
            }
            let live = rt.ensure_mirror(k)?;
            let m = self.scratch.scratch_mirror_for(rt, table, live)?;
            if self.archive_reachable(rt, table, holder, m)? {
                self.mirror_roots.insert(k, self.roots.append(Some(m)));
                archived += 1;
            }
        }
        info!(target: "cds::heap", "Archived {} class mirrors", archived);
        Ok(archived)
    }

    /// Archives the subgraphs of the given root fields. A holder's fields must
    /// be adjacent in `fields`.
    pub fn archive_static_fields(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        fields: &[ResolvedRootField],
    ) -> Result<(), ArchiverError> {
        let mut current: Option<KlassId> = None;
        for f in fields {
            if current != Some(f.holder) {
                if let Some(prev) = current {
                    self.done_recording(rt, prev);
                }
                self.start_recording(f.holder, f.group);
                current = Some(f.holder);
            }
            if self
                .subgraphs
                .get(&f.holder)
                .is_some_and(|info| info.entry_root(f.slot).is_some())
            {
                continue;
            }
            let root = match rt.static_value(f.holder, f.slot as usize).and_then(Value::as_ref) {
                None => self.roots.append(None),
                Some(obj) => {
                    let archived = self.scratch.scratch_mirror_for(rt, table, obj)?;
                    if self.archive_reachable(rt, table, f.holder, obj)? {
                        debug!(
                            target: "cds::heap",
                            "Archived field {}::{} => {}",
                            rt.klass(f.holder).external_name(),
                            f.field,
                            archived
                        );
                        self.roots.append(Some(archived))
                    } else {
                        self.dropped_roots += 1;
                        self.roots.append(None)
                    }
                }
            };
            if let Some(info) = self.subgraphs.get_mut(&f.holder) {
                info.add_entry_field(f.slot, root);
            }
        }
        if let Some(prev) = current {
            self.done_recording(rt, prev);
        }
        Ok(())
    }

    /// Lays every archived object out in permanent segments and appends the
    /// segment arrays to the roots. Runs once, after all other roots.
    fn archive_permanent_objects(&mut self, rt: &mut Runtime) -> Result<(), ArchiverError> {
        if self.permanent.is_some() {
            return Ok(());
        }
        let array_klass = rt
            .boot_class(OBJECT_ARRAY_CLASS)
            .ok_or(ArchiverError::MissingCoreClass(OBJECT_ARRAY_CLASS))?;
        let first_root = self.roots.len() as u32;
        let perm = PermanentObjects::new(&self.order, first_root);
        for segment in perm.segments() {
            let elements = segment.iter().map(|&o| Value::Ref(o)).collect();
            let array = rt.new_object_array(array_klass, elements);
            rt.heap.identity_hash(array);
            self.cache.insert(
                array,
                CachedObject {
                    order: self.order.len() as u32,
                    referrer: None,
                    level: 0,
                    native_pointer_slots: Vec::new(),
                },
            );
            self.order.push(array);
            self.roots.append(Some(array));
        }
        self.permanent = Some(perm);
        Ok(())
    }

    /// Archives the whole heap: the special roots, the class mirrors, every
    /// root field, then the permanent segments.
    pub fn archive_all(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
    ) -> Result<ArchivedHeapSummary, ArchiverError> {
        if !self.config.heap_archiving_enabled() {
            info!(target: "cds::heap", "Heap archiving is disabled");
            return Ok(ArchivedHeapSummary::default());
        }
        table.reset_preinit_check();

        let object = rt
            .boot_class(OBJECT_CLASS)
            .ok_or(ArchiverError::MissingCoreClass(OBJECT_CLASS))?;
        self.default_holder = Some(object);
        self.start_recording(object, RootGroup::Default);
        self.archive_special_roots(rt, table)?;
        let mirrored: Vec<KlassId> = table
            .archivable()
            .filter(|&k| rt.klass(k).is_instance())
            .collect();
        self.archive_java_mirrors(rt, table, &mirrored)?;
        self.done_recording(rt, object);

        let mut fields = resolve_root_fields(rt, table, DEFAULT_ROOT_FIELDS, RootGroup::Default)?;
        fields.extend(resolve_root_fields(rt, table, &self.extra_root_fields, RootGroup::Default)?);
        self.archive_static_fields(rt, table, &fields)?;
        if self.config.archive_full_module_graph {
            let fmg = resolve_root_fields(rt, table, FMG_ROOT_FIELDS, RootGroup::FullModuleGraph)?;
            self.archive_static_fields(rt, table, &fmg)?;
        }

        let unusual = match self.subgraphs.get(&object) {
            Some(info) => check_default_subgraph_classes(rt, self.config, info),
            None => 0,
        };
        self.archive_permanent_objects(rt)?;

        let summary = ArchivedHeapSummary {
            objects: self.order.len(),
            roots: self.roots.len(),
            subgraphs: self.subgraphs.len(),
            mirrors: self.mirror_roots.len(),
            dropped_roots: self.dropped_roots,
            permanent_segments: self.permanent.as_ref().map_or(0, PermanentObjects::segment_count),
            unusual_klasses: unusual,
        };
        info!(
            target: "cds::heap",
            "Archived {} objects, {} roots, {} subgraphs",
            summary.objects,
            summary.roots,
            summary.subgraphs
        );
        Ok(summary)
    }
}

impl Archiver for HeapArchiver<'_> {
    fn archive_reachable(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        holder: KlassId,
        obj: ObjectId,
    ) -> Result<bool, ArchiverError> {
        self.subgraphs
            .entry(holder)
            .or_insert_with(|| KlassSubGraphInfo::new(holder, RootGroup::Default));

        let mut stack = vec![Pending {
            obj,
            level: 1,
            referrer: None,
        }];
        while let Some(p) = stack.pop() {
            let klass = rt.heap.get(p.obj).ok_or(ArchiverError::BadObject(p.obj))?.klass;
            if rt.klass(klass).has_flag(KlassFlags::HAS_INJECTED_FIELDS) {
                let class = rt.klass(klass).external_name();
                error!(target: "cds::heap", "Cannot archive object of class {}", class);
                return Err(ArchiverError::InjectedFields {
                    class,
                    trace: self.reference_trace(rt, p.referrer, p.obj),
                });
            }
            let current = self.scratch.scratch_mirror_for(rt, table, p.obj)?;
            if !self.seen.insert(current) {
                continue;
            }
            let p = Pending { obj: current, ..p };

            if !self.cache.contains_key(&current) {
                let size = rt.heap[current].size_in_bytes();
                if size > MAX_OBJ_SIZE {
                    let class = Self::class_name(rt, current);
                    if p.level == 1 {
                        warn!(
                            target: "cds::heap",
                            "Cannot archive the sub-graph referenced from {} object ({}) size {}, skipped",
                            class,
                            current,
                            size
                        );
                        self.seen.remove(&current);
                        return Ok(false);
                    }
                    error!(target: "cds::heap", "Cannot archive {} object ({}) size {}", class, current, size);
                    return Err(ArchiverError::Oversize {
                        class,
                        object: current,
                        size,
                        trace: self.reference_trace(rt, p.referrer, current),
                    });
                }
                let bottom = rt.klasses.bottom_klass(klass);
                if table.is_excluded(klass) || table.is_excluded(bottom) {
                    return Err(ArchiverError::ExcludedClass {
                        class: rt.klass(klass).external_name(),
                        trace: self.reference_trace(rt, p.referrer, current),
                    });
                }
                rt.heap.identity_hash(current);
                let native_pointer_slots = if rt.heap[current].is_mirror() {
                    (0..MIRROR_NATIVE_SLOTS as u32).collect()
                } else {
                    Vec::new()
                };
                self.cache.insert(
                    current,
                    CachedObject {
                        order: self.order.len() as u32,
                        referrer: p.referrer,
                        level: p.level,
                        native_pointer_slots,
                    },
                );
                self.order.push(current);
            }

            let config = self.config;
            let rejected = self
                .subgraphs
                .get_mut(&holder)
                .map(|info| info.add_object_klass(rt, config, klass))
                .transpose()
                .is_err();
            if rejected {
                let class = rt.klass(klass).external_name();
                error!(target: "cds::heap", "Class {} not allowed in archive heap. Must be in java.base", class);
                return Err(ArchiverError::DisallowedClass {
                    class,
                    trace: self.reference_trace(rt, p.referrer, current),
                });
            }

            // Enum statics are pushed first so they are walked after the fields.
            if let Some(enum_klass) = rt.is_enum_constant(current) {
                self.queue_enum_statics(rt, table, enum_klass, &p, &mut stack)?;
            }
            let children = rt.heap[current].references();
            for child in children.into_iter().rev() {
                stack.push(Pending {
                    obj: child,
                    level: p.level + 1,
                    referrer: Some(current),
                });
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::{FieldFlags, LoaderKind, ObjectBody};
    use dumptime::ExclusionEngine;

    fn checked_table(rt: &Runtime, config: &CdsConfig) -> DumpTimeTable {
        let mut table = DumpTimeTable::new();
        ExclusionEngine::new(config).check_all(rt, &mut table).unwrap();
        table
    }

    #[test]
    fn test_integer_cache_subgraph() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let cache_array = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        let summary = archiver.archive_all(&mut rt, &mut table).unwrap();

        assert!(archiver.is_archived(cache_array));
        for boxed in rt.heap[cache_array].references() {
            assert!(archiver.is_archived(boxed));
            assert_ne!(rt.heap[boxed].identity_hash, 0);
        }
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let info = archiver.subgraph(holder).unwrap();
        let (slot, root) = info.entry_fields[0];
        assert_eq!(slot, 0);
        assert_eq!(archiver.roots().get(root), Some(cache_array));
        assert!(!info.has_non_early_klasses);
        assert_eq!(summary.dropped_roots, 0);
        assert!(summary.permanent_segments >= 1);
        assert_eq!(archiver.special_roots().exceptions.len(), 6);
        assert_eq!(archiver.special_roots().primitive_mirrors.len(), 9);
    }

    #[test]
    fn test_archiving_twice_is_idempotent() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let cache_array = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        archiver.archive_all(&mut rt, &mut table).unwrap();

        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let objects = archiver.archived_objects().len();
        let roots = archiver.roots().len();
        let klasses = archiver.subgraph(holder).unwrap().object_klasses.clone();

        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, cache_array).unwrap());
        let fields = resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).unwrap();
        archiver.archive_static_fields(&mut rt, &mut table, &fields).unwrap();

        assert_eq!(archiver.archived_objects().len(), objects);
        assert_eq!(archiver.roots().len(), roots);
        assert_eq!(archiver.subgraph(holder).unwrap().object_klasses, klasses);
        assert_eq!(archiver.subgraph(holder).unwrap().entry_fields.len(), 1);
    }

    #[test]
    fn test_oversize_root_is_dropped() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = KlassBuilder::new("app/Holder", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .static_field("big", "[J", FieldFlags::empty())
            .static_field("name", "Ljava/lang/String;", FieldFlags::empty())
            .build(&mut rt);
        rt.initialize_class(holder).unwrap();
        let big = rt.new_type_array(BasicType::Long, vec![7; MAX_OBJ_SIZE / 8 + 1]).unwrap();
        let name = rt.intern("kept").unwrap();
        rt.set_static_value(holder, 0, Value::Ref(big));
        rt.set_static_value(holder, 1, Value::Ref(name));

        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        archiver.add_root_field(RootField {
            holder: "app/Holder",
            field: "big",
        });
        archiver.add_root_field(RootField {
            holder: "app/Holder",
            field: "name",
        });
        let summary = archiver.archive_all(&mut rt, &mut table).unwrap();

        assert_eq!(summary.dropped_roots, 1);
        assert!(!archiver.is_archived(big));
        let info = archiver.subgraph(holder).unwrap();
        let big_root = info.entry_root(0).unwrap();
        assert_eq!(archiver.roots().get(big_root), None);
        let name_root = info.entry_root(1).unwrap();
        assert_eq!(archiver.roots().get(name_root), Some(name));
    }

    #[test]
    fn test_oversize_nested_object_is_fatal() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let array_klass = rt.boot_class(OBJECT_ARRAY_CLASS).unwrap();
        let big = rt.new_type_array(BasicType::Long, vec![0; MAX_OBJ_SIZE / 8 + 1]).unwrap();
        let outer = rt.new_object_array(array_klass, vec![Value::Ref(big)]);

        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        let err = archiver.archive_reachable(&mut rt, &mut table, holder, outer).unwrap_err();
        match err {
            ArchiverError::Oversize { object, trace, .. } => {
                assert_eq!(object, big);
                assert!(trace.contains("[1] [J"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_identity_hash_survives_archiving() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let cache_array = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
        let before = rt.heap.identity_hash(cache_array).unwrap();
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        archiver.archive_all(&mut rt, &mut table).unwrap();
        assert_eq!(rt.heap.peek_identity_hash(cache_array), Some(before));
    }

    #[test]
    fn test_injected_fields_are_rejected() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let odd = KlassBuilder::new("java/lang/invoke/MemberName", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::HAS_INJECTED_FIELDS)
            .build(&mut rt);
        let obj = rt.new_instance(odd);
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        assert!(matches!(
            archiver.archive_reachable(&mut rt, &mut table, holder, obj),
            Err(ArchiverError::InjectedFields { .. })
        ));
    }

    #[test]
    fn test_enum_statics_become_roots() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let color = KlassBuilder::new("java/lang/Color", LoaderKind::Boot)
            .super_class(&rt, "java/lang/Enum")
            .flags(KlassFlags::ENUM | KlassFlags::FINAL)
            .static_field("RED", "Ljava/lang/Color;", FieldFlags::FINAL)
            .static_field("BLUE", "Ljava/lang/Color;", FieldFlags::FINAL)
            .static_field("COUNT", "I", FieldFlags::FINAL)
            .build(&mut rt);
        rt.initialize_class(color).unwrap();
        let red = rt.new_instance(color);
        let blue = rt.new_instance(color);
        rt.set_static_value(color, 0, Value::Ref(red));
        rt.set_static_value(color, 1, Value::Ref(blue));

        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, red).unwrap());

        assert!(archiver.is_archived(blue));
        let roots = &table.get(color).unwrap().enum_static_roots;
        assert_eq!(roots.len(), 2);
        assert_eq!(archiver.roots().get(roots[0] as u32), Some(red));
        assert_eq!(archiver.roots().get(roots[1] as u32), Some(blue));
    }

    #[test]
    fn test_mirror_is_replaced_by_scratch_copy() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let string = rt.boot_class("java/lang/String").unwrap();
        let live = rt.klass(string).mirror.unwrap();
        let config = CdsConfig::default();
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        assert!(archiver.archive_reachable(&mut rt, &mut table, holder, live).unwrap());

        assert!(!archiver.is_archived(live));
        let scratch = archiver.archived_ref(&rt, live).unwrap();
        assert_ne!(scratch, live);
        assert!(matches!(rt.heap[scratch].body, ObjectBody::Mirror { .. }));
        assert_eq!(archiver.cached(scratch).unwrap().native_pointer_slots, vec![0, 1]);
    }

    #[test]
    fn test_disabled_heap_archives_nothing() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let config = CdsConfig {
            archive_heap: false,
            ..CdsConfig::default()
        };
        let mut table = checked_table(&rt, &config);
        let mut archiver = HeapArchiver::new(&config);
        let summary = archiver.archive_all(&mut rt, &mut table).unwrap();
        assert_eq!(summary, ArchivedHeapSummary::default());
        assert!(archiver.archived_objects().is_empty());
    }
}
