//! # Restoring an Archive into a Runtime
//!
//! **Role**: Installs a [`MappedArchive`] into a production runtime and keeps the
//! run-time tables the archive feeds: the lambda-proxy table, the unregistered
//! dictionary and the init list.
//!
//! **Design**:
//! - Archived classes are matched to the runtime's classes by loader and name.
//!   A class whose runtime super class differs is skipped, as is anything the
//!   runtime cannot find. Hidden classes are defined from their metadata.
//! - Archived mirrors replace a class's mirror only while the class is not yet
//!   linked and only when its static layout matches.
//! - Resolved constant-pool entries are written straight into the pools; the
//!   link resolver is never consulted.
//! - [`RestoredArchive::start_up`] never fails. Every replay problem is logged
//!   and counted.

use crate::mapped::MappedArchive;
use crate::metadata::{hidden_kind_of, ClassView};
use crate::records::{ArchivedFieldValueRecord, ArchivedInitRecord, ArchivedMethodDataRecord};
use archiver::{PERMOBJ_SEGMENT_SHIFT, PERMOBJ_SEGMENT_SIZE};
use crate::{HeaderFlags, LoadError, SectionKind};
use common::constant_pool::{CallSite, ResolvedFieldRef};
use common::{
    BasicType, CdsConfig, ClassState, HiddenKind, Klass, KlassFlags, KlassId, KlassKind, LoaderKind, ObjectBody,
    ObjectId, Runtime, Value,
};
use dumptime::{LambdaProxyKey, RunTimeLambdaProxyTable};
use initlist::{InitInfo, InitList, ReplayDriver, ReplayReport};
use parking_lot::Mutex;
use precompiler::{CompileRecord, Directives, InstallingBroker, MethodTrainingData, Precompiler, TrainingData};
use prelinker::PreloadedKlasses;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

const KIND_OBJ_ARRAY: u8 = 4;
const KIND_TYPE_ARRAY: u8 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub classes_mapped: usize,
    pub classes_skipped: usize,
    pub hidden_defined: usize,
    pub heap_objects: usize,
    pub mirrors_installed: usize,
    pub subgraphs_installed: usize,
    pub interned_strings: usize,
    pub cp_entries: usize,
    pub init_entries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub preloaded: usize,
    pub prelinked: usize,
    pub replay: ReplayReport,
    pub compiled: usize,
}

/// What is needed to define an archived class the runtime does not have yet.
#[derive(Debug, Clone)]
struct ClassTemplate {
    name: String,
    loader: LoaderKind,
    kind: KlassKind,
    flags: KlassFlags,
    super_klass: Option<KlassId>,
    interfaces: Vec<KlassId>,
    nest_host: Option<KlassId>,
}

impl ClassTemplate {
    fn define(&self, rt: &mut Runtime) -> Option<KlassId> {
        let mut k = Klass::new(&self.name, self.loader, self.kind);
        k.flags = self.flags;
        k.super_klass = self.super_klass;
        k.interfaces = self.interfaces.clone();
        if let Some(host) = self.nest_host {
            k.nest_host = Some(host);
            k.nest_host_name = Some(rt.klasses.name(host).to_string());
            k.module = rt.klass(host).module.clone();
        }
        let id = rt.add_klass(k);
        match rt.load_class(id) {
            Ok(()) => Some(id),
            Err(e) => {
                debug!(target: "cds", "Cannot define archived class {}: {}", self.name, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
struct UnregisteredEntry {
    klass: Option<KlassId>,
    template: ClassTemplate,
    classfile_size: u32,
    classfile_crc32: u32,
}

pub struct RestoredArchive {
    /// Runtime class per class-table index.
    classes: Vec<Option<KlassId>>,
    roots: Vec<Option<ObjectId>>,
    init_list: InitList,
    lambdas: RunTimeLambdaProxyTable<LambdaProxyKey>,
    training: TrainingData,
    unregistered: Mutex<BTreeMap<String, UnregisteredEntry>>,
    reflection_data: BTreeMap<KlassId, u32>,
    lambda_form_invokers: Vec<String>,
    preloaded: PreloadedKlasses,
    platform_initiated: Vec<KlassId>,
    app_initiated: Vec<KlassId>,
    precompiled: bool,
    report: RestoreReport,
}

/// Class-table lookups shared by the restore steps.
struct ClassMap<'a> {
    archive: &'a MappedArchive,
    /// RW offset of a class record to its class-table index.
    by_record: HashMap<usize, u32>,
    classes: Vec<Option<KlassId>>,
}

impl ClassMap<'_> {
    fn get(&self, index: u32) -> Option<KlassId> {
        self.classes.get(index as usize).copied().flatten()
    }

    fn by_record(&self, rw_offset: usize) -> Option<KlassId> {
        self.by_record.get(&rw_offset).and_then(|&i| self.get(i))
    }

    fn template(&self, view: &ClassView<'_>, nest_host: Option<u32>) -> Option<ClassTemplate> {
        let kind = match hidden_kind_of(view.header.kind) {
            Some(hidden) => KlassKind::Hidden(hidden),
            None => KlassKind::Instance,
        };
        let super_klass = match view.super_record {
            Some(rec) => Some(self.by_record(rec)?),
            None => None,
        };
        let interfaces = view
            .interface_records
            .iter()
            .map(|&rec| self.by_record(rec))
            .collect::<Option<Vec<_>>>()?;
        Some(ClassTemplate {
            name: view.name.to_string(),
            loader: view.header.loader,
            kind,
            flags: KlassFlags::from_bits_truncate(view.header.flags),
            super_klass,
            interfaces,
            nest_host: nest_host.and_then(|h| self.get(h)),
        })
    }
}

fn element_name(array: &str) -> Option<&str> {
    let rest = array.strip_prefix('[')?;
    Some(rest.strip_prefix('L').and_then(|r| r.strip_suffix(';')).unwrap_or(rest))
}

impl RestoredArchive {
    pub fn restore(archive: &MappedArchive, rt: &mut Runtime, config: &CdsConfig) -> Result<Self, LoadError> {
        let table = archive.class_table();
        let mut map = ClassMap {
            archive,
            by_record: table
                .classes
                .iter()
                .enumerate()
                .map(|(i, c)| (c.meta.to_native() as usize, i as u32))
                .collect(),
            classes: vec![None; table.classes.len()],
        };
        let mut report = RestoreReport::default();

        Self::map_classes(&mut map, rt, &mut report)?;
        let roots = Self::restore_heap(&map, rt, &mut report);
        Self::install_mirrors(&map, rt, &roots, &mut report);
        Self::install_subgraphs(&map, rt, &roots, config, &mut report)?;
        Self::restore_strings(archive, rt, &roots, &mut report);
        Self::restore_constant_pools(&map, rt, &mut report);

        let init_list = Self::restore_init_list(&map, rt, &roots);
        report.init_entries = init_list.len();
        let lambdas = Self::restore_lambdas(&map);
        let training = Self::restore_training(&map, rt);
        let unregistered = Self::restore_unregistered(&map)?;

        let reflection_data = archive
            .reflection_data()
            .classes
            .iter()
            .filter_map(|r| map.get(r.class.to_native()).map(|k| (k, r.flags.to_native())))
            .collect();
        let lambda_form_invokers = archive
            .lambda_form_invokers()
            .lines
            .iter()
            .map(|l| l.as_str().to_string())
            .collect();
        let p = archive.preloaded();
        let indices = |v: &rkyv::vec::ArchivedVec<rkyv::Archived<u32>>| -> Vec<KlassId> {
            v.iter().filter_map(|i| map.get(i.to_native())).collect()
        };
        let preloaded = PreloadedKlasses {
            boot: indices(&p.boot),
            boot2: indices(&p.boot2),
            platform: indices(&p.platform),
            app: indices(&p.app),
        };
        let (platform_initiated, app_initiated) = (indices(&p.platform_initiated), indices(&p.app_initiated));

        info!(
            target: "cds",
            "Restored {} classes ({} skipped, {} hidden defined), {} heap objects, {} mirrors, {} subgraphs, {} init entries",
            report.classes_mapped,
            report.classes_skipped,
            report.hidden_defined,
            report.heap_objects,
            report.mirrors_installed,
            report.subgraphs_installed,
            report.init_entries
        );
        Ok(Self {
            classes: map.classes,
            roots,
            init_list,
            lambdas,
            training,
            unregistered: Mutex::new(unregistered),
            reflection_data,
            lambda_form_invokers,
            preloaded,
            platform_initiated,
            app_initiated,
            precompiled: archive.header().flags.contains(HeaderFlags::PRECOMPILED),
            report,
        })
    }

    fn map_classes(map: &mut ClassMap<'_>, rt: &mut Runtime, report: &mut RestoreReport) -> Result<(), LoadError> {
        let archive = map.archive;
        let count = map.classes.len() as u32;
        let metadata = archive.metadata();
        let mut hidden = Vec::new();
        for i in 0..count {
            let view = archive.class_view(i)?;
            let loader = view.header.loader;
            if loader == LoaderKind::Unregistered {
                continue;
            }
            if hidden_kind_of(view.header.kind).is_some() {
                hidden.push(i);
                continue;
            }
            let found = match rt.klasses.lookup(loader, view.name) {
                Some(k) => Some(k),
                None if view.header.kind == KIND_OBJ_ARRAY => element_name(view.name)
                    .and_then(|e| rt.klasses.lookup(loader, e).or_else(|| rt.boot_class(e)))
                    .map(|e| common::KlassBuilder::array_of(rt, e)),
                None => None,
            };
            let Some(k) = found else {
                debug!(target: "cds", "Archived class {} is not known to the runtime", view.name);
                report.classes_skipped += 1;
                continue;
            };
            if view.header.kind != KIND_TYPE_ARRAY && view.header.kind != KIND_OBJ_ARRAY {
                let archived_super = match view.super_record {
                    Some(rec) => Some(metadata.class(rec)?.name),
                    None => None,
                };
                let runtime_super = rt.klass(k).super_klass.map(|s| rt.klasses.name(s));
                if archived_super != runtime_super {
                    debug!(
                        target: "cds",
                        "Skipping {}: super class {:?} does not match the archived {:?}",
                        view.name,
                        runtime_super,
                        archived_super
                    );
                    report.classes_skipped += 1;
                    continue;
                }
            }
            map.classes[i as usize] = Some(k);
            report.classes_mapped += 1;
        }

        let records = &archive.class_table().classes;
        for i in hidden {
            let view = archive.class_view(i)?;
            let nest_host = records[i as usize].nest_host.as_ref().map(|h| h.to_native());
            if hidden_kind_of(view.header.kind) == Some(HiddenKind::LambdaProxy)
                && nest_host.and_then(|h| map.get(h)).is_none()
            {
                debug!(target: "cds::lambda", "Nest host of {} is not mapped", view.name);
                report.classes_skipped += 1;
                continue;
            }
            let existing = rt.klasses.lookup(view.header.loader, view.name);
            let k = match existing {
                Some(k) => Some(k),
                None => map.template(&view, nest_host).and_then(|t| {
                    let k = t.define(rt);
                    if k.is_some() {
                        report.hidden_defined += 1;
                    }
                    k
                }),
            };
            match k {
                Some(k) => {
                    map.classes[i as usize] = Some(k);
                    report.classes_mapped += 1;
                }
                None => report.classes_skipped += 1,
            }
        }
        Ok(())
    }

    /// Materializes the heap region. Returns the object of each root.
    fn restore_heap(map: &ClassMap<'_>, rt: &mut Runtime, report: &mut RestoreReport) -> Vec<Option<ObjectId>> {
        let archive = map.archive;
        if !archive.header().flags.contains(HeaderFlags::HEAP_ARCHIVED) {
            return Vec::new();
        }
        let region = match archive.heap_region() {
            Ok(region) => region,
            Err(e) => {
                warn!(target: "cds::heap", "Archived heap is unusable: {}", e);
                return Vec::new();
            }
        };
        match region.materialize(rt, |i| map.get(i)) {
            Ok(ids) => {
                report.heap_objects = ids.len();
                (0..region.roots.len() as u32).map(|r| region.root(&ids, r)).collect()
            }
            Err(e) => {
                warn!(target: "cds::heap", "Cannot materialize the archived heap: {}", e);
                Vec::new()
            }
        }
    }

    fn install_mirrors(map: &ClassMap<'_>, rt: &mut Runtime, roots: &[Option<ObjectId>], report: &mut RestoreReport) {
        if roots.is_empty() {
            return;
        }
        let heap_roots = map.archive.heap_roots();
        let root = |r: u32| roots.get(r as usize).copied().flatten();
        for m in heap_roots.mirrors.iter() {
            let (Some(k), Some(mirror)) = (map.get(m.class.to_native()), root(m.root.to_native())) else {
                continue;
            };
            let statics = match rt.heap.get(mirror).map(|o| &o.body) {
                Some(ObjectBody::Mirror { statics, .. }) => statics.len(),
                _ => continue,
            };
            let klass = rt.klass(k);
            if klass.state.is_linked() || klass.static_field_count() != statics {
                debug!(target: "cds::heap", "Keeping the runtime mirror of {}", klass.name);
                continue;
            }
            rt.klass_mut(k).mirror = Some(mirror);
            report.mirrors_installed += 1;
        }
        for p in heap_roots.primitive_mirrors.iter() {
            let (Some(bt), Some(mirror)) = (BasicType::from_u8(p.basic_type), root(p.root.to_native())) else {
                continue;
            };
            match rt.primitive_mirrors.iter_mut().find(|(t, _)| *t == bt) {
                Some(slot) => slot.1 = mirror,
                None => rt.primitive_mirrors.push((bt, mirror)),
            }
        }

        for (i, rec) in map.archive.class_table().classes.iter().enumerate() {
            if rec.enum_static_roots.is_empty() {
                continue;
            }
            let Some(k) = map.get(i as u32) else { continue };
            if rt.klass(k).state.is_initialized() || rt.ensure_mirror(k).is_err() {
                continue;
            }
            let slots: Vec<usize> = rt
                .klass(k)
                .static_fields()
                .filter(|(_, f)| f.is_reference())
                .map(|(slot, _)| slot)
                .collect();
            for (slot, r) in slots.into_iter().zip(rec.enum_static_roots.iter()) {
                let value = u32::try_from(r.to_native()).ok().and_then(root).map_or(Value::Null, Value::Ref);
                rt.set_static_value(k, slot, value);
            }
        }
    }

    fn install_subgraphs(
        map: &ClassMap<'_>,
        rt: &mut Runtime,
        roots: &[Option<ObjectId>],
        config: &CdsConfig,
        report: &mut RestoreReport,
    ) -> Result<(), LoadError> {
        if roots.is_empty() {
            return Ok(());
        }
        let metadata = map.archive.metadata();
        for sg in map.archive.subgraph_table().subgraphs.iter() {
            let Some(holder) = map.get(sg.holder.to_native()) else {
                continue;
            };
            let view = metadata.subgraph(sg.record.to_native() as usize)?;
            if view.is_full_module_graph && !config.archive_full_module_graph {
                continue;
            }
            if let Some(missing) = view.klass_records.iter().find(|&&rec| map.by_record(rec).is_none()) {
                debug!(
                    target: "cds::heap",
                    "Subgraph of {} needs the unmapped class at {:#x}",
                    rt.klasses.name(holder),
                    missing
                );
                continue;
            }
            if rt.ensure_mirror(holder).is_err() {
                continue;
            }
            for &(slot, root) in &view.entry_fields {
                let value = roots.get(root as usize).copied().flatten().map_or(Value::Null, Value::Ref);
                rt.set_static_value(holder, slot as usize, value);
            }
            report.subgraphs_installed += 1;
        }
        Ok(())
    }

    fn restore_strings(archive: &MappedArchive, rt: &mut Runtime, roots: &[Option<ObjectId>], report: &mut RestoreReport) {
        let Some(array) = archive
            .heap_roots()
            .interned_strings
            .as_ref()
            .and_then(|r| roots.get(r.to_native() as usize).copied().flatten())
        else {
            return;
        };
        let elements: Vec<ObjectId> = match rt.heap.get(array).map(|o| &o.body) {
            Some(ObjectBody::ObjArray { elements }) => elements.iter().filter_map(|v| (*v).as_ref()).collect(),
            _ => return,
        };
        for s in elements {
            let Some(value) = rt.heap.get(s).and_then(|o| o.as_str()).map(str::to_string) else {
                continue;
            };
            if archive.lookup_shared_string(&value).is_none() {
                debug!(target: "cds::heap", "Interned string {:?} is missing from the string table", value);
            }
            rt.interned.entry(value).or_insert(s);
            report.interned_strings += 1;
        }
    }

    fn restore_constant_pools(map: &ClassMap<'_>, rt: &mut Runtime, report: &mut RestoreReport) {
        for (i, rec) in map.archive.class_table().classes.iter().enumerate() {
            let Some(k) = map.get(i as u32) else { continue };
            for r in rec.resolved_klasses.iter() {
                if let Some(target) = map.get(r.target.to_native()) {
                    if rt.klass_mut(k).constants.set_resolved_klass(r.index.to_native(), target) {
                        report.cp_entries += 1;
                    }
                }
            }
            for f in rec.resolved_fields.iter() {
                let Some(holder) = map.get(f.holder.to_native()) else { continue };
                rt.klass_mut(k).constants.cache.fields.insert(
                    f.index.to_native(),
                    ResolvedFieldRef {
                        holder,
                        slot: f.slot.to_native(),
                        is_static: f.is_static,
                    },
                );
                report.cp_entries += 1;
            }
            for m in rec.resolved_methods.iter() {
                let method = map
                    .get(m.holder.to_native())
                    .and_then(|h| rt.find_method(h, m.name.as_str(), m.signature.as_str()));
                if let Some(method) = method {
                    rt.klass_mut(k).constants.cache.methods.insert(m.index.to_native(), method);
                    report.cp_entries += 1;
                }
            }
            for cs in rec.resolved_indys.iter() {
                let target = match cs.target.as_ref() {
                    Some(t) => match map.get(t.to_native()) {
                        Some(t) => Some(t),
                        None => continue,
                    },
                    None => None,
                };
                rt.klass_mut(k).constants.cache.indys.insert(
                    cs.index.to_native(),
                    CallSite {
                        bootstrap_class: cs.bootstrap_class.as_str().to_string(),
                        bootstrap_name: cs.bootstrap_name.as_str().to_string(),
                        target,
                    },
                );
                report.cp_entries += 1;
            }
        }
    }

    /// The restored object at `index` of the permanent segments.
    fn permanent_object(archive: &MappedArchive, rt: &Runtime, roots: &[Option<ObjectId>], index: u32) -> Option<ObjectId> {
        let first = archive.heap_roots().permanent_first_root.as_ref()?.to_native();
        let segment = roots.get((first + (index >> PERMOBJ_SEGMENT_SHIFT)) as usize).copied().flatten()?;
        match &rt.heap.get(segment)?.body {
            ObjectBody::ObjArray { elements } => elements
                .get(index as usize & (PERMOBJ_SEGMENT_SIZE - 1))
                .copied()?
                .as_ref(),
            _ => None,
        }
    }

    fn restore_init_list(map: &ClassMap<'_>, rt: &Runtime, roots: &[Option<ObjectId>]) -> InitList {
        let field_init = |holder: u32, slot: u32, value: &ArchivedFieldValueRecord, value_klass: Option<u32>| {
            let value_klass = match value_klass {
                Some(k) => Some(map.get(k)?),
                None => None,
            };
            let value = match value {
                ArchivedFieldValueRecord::Null => Value::Null,
                ArchivedFieldValueRecord::Prim(v) => Value::Prim(v.to_native()),
                ArchivedFieldValueRecord::Object(i) => {
                    Value::Ref(Self::permanent_object(map.archive, rt, roots, i.to_native())?)
                }
            };
            Some(InitInfo::FieldInit {
                holder: map.get(holder)?,
                slot,
                value,
                value_klass,
            })
        };
        let entries = map
            .archive
            .init_list()
            .entries
            .iter()
            .filter_map(|e| match e {
                ArchivedInitRecord::ClassInit { holder, state } => Some(InitInfo::ClassInit {
                    holder: map.get(holder.to_native())?,
                    state: ClassState::from_u8(*state)?,
                }),
                ArchivedInitRecord::FieldInit {
                    holder,
                    slot,
                    value,
                    value_klass,
                } => Some(
                    field_init(
                        holder.to_native(),
                        slot.to_native(),
                        value,
                        value_klass.as_ref().map(|k| k.to_native()),
                    )
                    .unwrap_or(InitInfo::Invalid),
                ),
                ArchivedInitRecord::InvokeDynamic { holder, index } => Some(InitInfo::InvokeDynamic {
                    holder: map.get(holder.to_native())?,
                    index: index.to_native(),
                }),
                ArchivedInitRecord::InvokeHandle {
                    holder,
                    method_holder,
                    method_name,
                    method_signature,
                    bci,
                } => Some(InitInfo::InvokeHandle {
                    holder: map.get(holder.to_native())?,
                    method: rt.find_method(
                        map.get(method_holder.to_native())?,
                        method_name.as_str(),
                        method_signature.as_str(),
                    )?,
                    bci: bci.to_native(),
                }),
                ArchivedInitRecord::Invalid => Some(InitInfo::Invalid),
            })
            .collect();
        InitList::new(entries)
    }

    fn restore_lambdas(map: &ClassMap<'_>) -> RunTimeLambdaProxyTable<LambdaProxyKey> {
        let sites = map.archive.lambda_table().sites.iter().filter_map(|s| {
            let key = LambdaProxyKey {
                caller: map.get(s.caller.to_native())?,
                invoked_name: s.invoked_name.as_str().to_string(),
                invoked_type: s.invoked_type.as_str().to_string(),
                method_type: s.method_type.as_str().to_string(),
                member_holder: map.get(s.member_holder.to_native())?,
                member_name: s.member_name.as_str().to_string(),
                member_signature: s.member_signature.as_str().to_string(),
                instantiated_method_type: s.instantiated_method_type.as_str().to_string(),
            };
            let proxies: Vec<KlassId> = s.proxies.iter().filter_map(|p| map.get(p.to_native())).collect();
            Some((key, proxies))
        });
        RunTimeLambdaProxyTable::new(sites)
    }

    fn restore_training(map: &ClassMap<'_>, rt: &Runtime) -> TrainingData {
        let record = |m: &ArchivedMethodDataRecord| -> Option<MethodTrainingData> {
            let holder = map.get(m.holder.to_native())?;
            Some(MethodTrainingData {
                holder: rt.klasses.name(holder).to_string(),
                name: m.name.as_str().to_string(),
                signature: m.signature.as_str().to_string(),
                compiles: m
                    .compiles
                    .iter()
                    .map(|c| CompileRecord {
                        level: c.level,
                        compile_id: c.compile_id.to_native(),
                    })
                    .collect(),
                method: None,
            })
        };
        let mut training = TrainingData::new(map.archive.method_data().methods.iter().filter_map(record).collect());
        training.bind(rt);
        training
    }

    fn restore_unregistered(map: &ClassMap<'_>) -> Result<BTreeMap<String, UnregisteredEntry>, LoadError> {
        let archive = map.archive;
        let records = &archive.class_table().classes;
        let mut out = BTreeMap::new();
        let dictionary = crate::CompactHashtable::new(archive.section(SectionKind::UnregisteredDictionary))?;
        for index in dictionary.values() {
            let view = archive.class_view(index)?;
            let Some(rec) = records.get(index as usize) else { continue };
            let Some(template) = map.template(&view, None) else {
                debug!(target: "cds", "Supertypes of unregistered {} are not mapped", view.name);
                continue;
            };
            out.insert(
                view.name.to_string(),
                UnregisteredEntry {
                    klass: None,
                    template,
                    classfile_size: rec.classfile_size.to_native(),
                    classfile_crc32: rec.classfile_crc32.to_native(),
                },
            );
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // run time
    // ---------------------------------------------------------------------

    pub fn report(&self) -> &RestoreReport {
        &self.report
    }

    /// Runtime class of class-table entry `index`.
    pub fn klass(&self, index: u32) -> Option<KlassId> {
        self.classes.get(index as usize).copied().flatten()
    }

    pub fn archived_classes(&self) -> BTreeSet<KlassId> {
        self.classes.iter().flatten().copied().collect()
    }

    /// Object of root `index`, `None` for a null or dropped root.
    pub fn root(&self, index: u32) -> Option<ObjectId> {
        self.roots.get(index as usize).copied().flatten()
    }

    pub fn init_list(&self) -> &InitList {
        &self.init_list
    }

    pub fn training(&self) -> &TrainingData {
        &self.training
    }

    pub fn reflection_data(&self, k: KlassId) -> Option<u32> {
        self.reflection_data.get(&k).copied()
    }

    pub fn lambda_form_invokers(&self) -> &[String] {
        &self.lambda_form_invokers
    }

    pub fn preloaded(&self) -> &PreloadedKlasses {
        &self.preloaded
    }

    pub fn initiated(&self, loader: LoaderKind) -> &[KlassId] {
        match loader {
            LoaderKind::Platform => &self.platform_initiated,
            LoaderKind::App => &self.app_initiated,
            _ => &[],
        }
    }

    /// Next archived proxy for a lambda site; each proxy is handed out once.
    pub fn take_lambda_proxy(&self, key: &LambdaProxyKey) -> Option<KlassId> {
        let proxy = self.lambdas.take(key);
        debug!(
            target: "cds::lambda",
            "Lambda proxy for {}: {:?} ({} left)",
            key.invoked_name,
            proxy,
            self.lambdas.remaining(key)
        );
        proxy
    }

    /// Hands out the archived unregistered class `name` once, provided the
    /// class file presented by the loader has the archived size and CRC.
    pub fn lookup_unregistered(&self, rt: &mut Runtime, name: &str, classfile: &[u8]) -> Option<KlassId> {
        let mut entries = self.unregistered.lock();
        let entry = entries.get(name)?;
        if entry.classfile_size as usize != classfile.len() || entry.classfile_crc32 != crc32fast::hash(classfile) {
            debug!(target: "cds", "Class file of {} does not match the archive", name);
            return None;
        }
        let entry = entries.remove(name)?;
        let k = match entry.klass {
            Some(k) => Some(k),
            None => entry.template.define(rt),
        }?;
        rt.klass_mut(k).classfile = classfile.to_vec();
        Some(k)
    }

    /// Preloads, replays the init list and forces precompiled code. Never fails.
    pub fn start_up(&self, rt: &mut Runtime, config: &CdsConfig) -> StartupReport {
        let archived = self.archived_classes();
        let driver = ReplayDriver::from_config(config).with_reflection_data(self.reflection_data.clone());
        let (preloaded, prelinked) = driver.preload_all(rt, &archived);
        let replay = driver.replay(rt, &self.init_list, &archived);
        let mut compiled = 0;
        if self.precompiled && config.precompile_level > 0 {
            match Directives::from_config(config) {
                Ok(directives) => {
                    let precompiler = Precompiler::new(config, &directives, &self.training);
                    compiled = precompiler.force_compilation(rt, &archived, &mut InstallingBroker::new(), false);
                }
                Err(e) => warn!(target: "precompile", "Ignoring compile commands: {}", e),
            }
        }
        info!(
            target: "cds",
            "Start-up: {} preloaded, {} prelinked, {} preinitialized, {} replay failures, {} compiled",
            preloaded + replay.preloaded,
            prelinked + replay.prelinked,
            replay.preinitialized,
            replay.failures,
            compiled
        );
        StartupReport {
            preloaded,
            prelinked,
            replay,
            compiled,
        }
    }
}
