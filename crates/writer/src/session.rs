//! # Dump Session
//!
//! **Role**: One static dump. Owns the runtime loaded from the training
//! snapshot together with every dump-time table, applies the class list and
//! then runs the dump phases in a fixed order.
//!
//! **Design**:
//! - Events the runtime reports while the session works (class-list loading,
//!   dump-time linking, pre-resolution) are discarded. Only the training run's
//!   events reach the init list.
//! - Class-list problems that make the list unusable are errors carrying a
//!   caret diagnostic; everything else is a warning and the line is skipped.

use crate::builder::{ArchiveBuilder, ArchiveSummary, DumpArtifacts};
use crate::DumpError;
use archiver::{ArchivedHeapSummary, HeapArchiver, RootField};
use classlist::{is_ignored_class, ClassEntry, ClassList, ClassListError, ClassListLine, CpRequest, Diagnostic, ParsedLine};
use common::{BitMap, CdsConfig, CpTag, KlassId, KlassKind, LoaderKind, Runtime};
use dumptime::{apply_forced_list, DumpTimeTable, ExclusionEngine, LambdaProxyDictionary, LambdaProxyKey, UnregisteredClasses};
use initlist::InitListRecorder;
use precompiler::{Directives, InstallingBroker, PrecompileReport, Precompiler, TrainingData};
use prelinker::{CpPreResolver, PreResolveReport};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Number of call-site items following the caller on a `@lambda-proxy` line.
const LAMBDA_PROXY_ITEMS: usize = 8;

#[derive(Debug, Default)]
pub struct ClassListReport {
    pub classes_loaded: usize,
    pub not_found: usize,
    pub unregistered: usize,
    pub lambda_proxies: usize,
    pub cp_requests: usize,
    pub reflection_data: usize,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    pub classes_excluded: usize,
    pub link_failures: usize,
    pub preresolve: PreResolveReport,
    pub heap: ArchivedHeapSummary,
    pub precompile: PrecompileReport,
}

/// A finished archive image.
#[derive(Debug)]
pub struct ArchiveImage {
    pub bytes: Vec<u8>,
    pub summary: ArchiveSummary,
    pub report: DumpReport,
}

impl ArchiveImage {
    pub fn write_to(&self, path: &Path) -> Result<(), DumpError> {
        std::fs::write(path, &self.bytes)?;
        info!(target: "cds", "Wrote {} bytes to {}", self.bytes.len(), path.display());
        Ok(())
    }
}

pub struct DumpSession {
    config: CdsConfig,
    rt: Runtime,
    table: DumpTimeTable,
    recorder: InitListRecorder,
    lambdas: LambdaProxyDictionary,
    unregistered: UnregisteredClasses,
    cp_requests: BTreeMap<KlassId, BitMap>,
    ids: BTreeMap<u32, KlassId>,
    reflection_data: BTreeMap<KlassId, u32>,
    lambda_form_invokers: Vec<String>,
    training: TrainingData,
    extra_root_fields: Vec<RootField>,
}

impl DumpSession {
    /// Starts a session over a training snapshot. The snapshot's pending
    /// events become the raw init list.
    pub fn new(mut rt: Runtime, config: CdsConfig) -> Result<Self, DumpError> {
        config.validate()?;
        let recorder = InitListRecorder::new();
        let events = rt.take_events();
        debug!(target: "cds", "Training run recorded {} events", events.len());
        recorder.ingest(&rt, events);
        Ok(Self {
            config,
            rt,
            table: DumpTimeTable::new(),
            recorder,
            lambdas: LambdaProxyDictionary::new(),
            unregistered: UnregisteredClasses::new(),
            cp_requests: BTreeMap::new(),
            ids: BTreeMap::new(),
            reflection_data: BTreeMap::new(),
            lambda_form_invokers: Vec::new(),
            training: TrainingData::default(),
            extra_root_fields: Vec::new(),
        })
    }

    pub fn with_training_data(mut self, training: TrainingData) -> Self {
        self.training = training;
        self
    }

    pub fn add_root_field(&mut self, field: RootField) {
        self.extra_root_fields.push(field);
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn config(&self) -> &CdsConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // class list
    // ---------------------------------------------------------------------

    /// Applies every line of `list` in file order.
    pub fn apply_class_list(&mut self, list: &ClassList) -> Result<ClassListReport, DumpError> {
        let mut report = ClassListReport::default();
        for line in &list.lines {
            match &line.kind {
                ClassListLine::Class(entry) if entry.is_unregistered() => {
                    self.apply_unregistered(list, line, entry, &mut report)?
                }
                ClassListLine::Class(entry) => self.apply_builtin(list, line, entry, &mut report),
                ClassListLine::LambdaProxy { class, items } => {
                    self.apply_lambda_proxy(list, line, class, items, &mut report)?
                }
                ClassListLine::ConstantPool { class, requests } => {
                    self.apply_cp_requests(list, line, class, requests, &mut report)
                }
                ClassListLine::ReflectionData { class, flags } => {
                    if !self.config.archive_reflection_data {
                        continue;
                    }
                    match self.rt.find_class(LoaderKind::App, class) {
                        Some(k) => {
                            self.reflection_data.insert(k, *flags);
                            report.reflection_data += 1;
                        }
                        None => debug!(target: "classlist", "No class {} for reflection data", class),
                    }
                }
                ClassListLine::LambdaFormInvoker(_) => {}
            }
        }
        self.lambda_form_invokers
            .extend(list.lambda_form_invokers.iter().cloned());
        info!(
            target: "classlist",
            "{}: {} classes loaded, {} not found, {} unregistered, {} lambda proxies, {} @cp lines, {} warnings",
            list.file,
            report.classes_loaded,
            report.not_found,
            report.unregistered,
            report.lambda_proxies,
            report.cp_requests,
            report.warnings.len()
        );
        Ok(report)
    }

    fn warn_line(report: &mut ClassListReport, d: Diagnostic) {
        warn!(target: "classlist", "{}", d.render_warning());
        report.warnings.push(d);
    }

    fn apply_builtin(&mut self, list: &ClassList, line: &ParsedLine, entry: &ClassEntry, report: &mut ClassListReport) {
        let Some(k) = self.rt.find_class(LoaderKind::App, &entry.name) else {
            if !is_ignored_class(&entry.name) {
                report.not_found += 1;
                Self::warn_line(
                    report,
                    line.diagnostic(&list.file, 0, format!("Preload Warning: Cannot find {}", entry.name)),
                );
            }
            return;
        };
        if let Err(e) = self.rt.load_class(k) {
            report.not_found += 1;
            Self::warn_line(
                report,
                line.diagnostic(&list.file, 0, format!("Preload Warning: Cannot load {}: {e}", entry.name)),
            );
            return;
        }
        if let Some(id) = entry.id {
            self.ids.insert(id, k);
        }
        report.classes_loaded += 1;
    }

    fn apply_unregistered(
        &mut self,
        list: &ClassList,
        line: &ParsedLine,
        entry: &ClassEntry,
        report: &mut ClassListReport,
    ) -> Result<(), DumpError> {
        let fatal = |msg: String| DumpError::ClassList(ClassListError::Parse(line.diagnostic(&list.file, 0, msg)));
        let Some(k) = self.rt.klasses.lookup(LoaderKind::Unregistered, &entry.name) else {
            report.not_found += 1;
            Self::warn_line(
                report,
                line.diagnostic(
                    &list.file,
                    0,
                    format!(
                        "Preload Warning: Cannot find {} in {}",
                        entry.name,
                        entry.source.as_deref().unwrap_or_default()
                    ),
                ),
            );
            return Ok(());
        };
        if !self.unregistered.add(&entry.name) {
            return Err(fatal(format!("Duplicated class {}", entry.name)));
        }

        let klass = self.rt.klass(k);
        let declared_super = entry.super_id.and_then(|id| self.ids.get(&id).copied());
        if declared_super != klass.super_klass {
            let name = |k: Option<KlassId>| k.map_or("<none>".to_string(), |k| self.rt.klasses.name(k).to_string());
            return Err(fatal(format!(
                "The specified super class {} (id {}) does not match actual super class {}",
                name(declared_super),
                entry.super_id.unwrap_or_default(),
                name(klass.super_klass)
            )));
        }
        let declared: BTreeSet<KlassId> = entry
            .interfaces
            .iter()
            .filter_map(|id| self.ids.get(id).copied())
            .collect();
        let actual: BTreeSet<KlassId> = klass.interfaces.iter().copied().collect();
        if declared.len() != entry.interfaces.len() || declared != actual {
            return Err(fatal(format!(
                "The number of interfaces ({}) specified in class list does not match the class file ({})",
                entry.interfaces.len(),
                actual.len()
            )));
        }

        if let Err(e) = self.rt.load_class(k) {
            report.not_found += 1;
            Self::warn_line(
                report,
                line.diagnostic(&list.file, 0, format!("Preload Warning: Cannot load {}: {e}", entry.name)),
            );
            return Ok(());
        }
        if let Some(id) = entry.id {
            self.ids.insert(id, k);
        }
        report.unregistered += 1;
        Ok(())
    }

    fn apply_cp_requests(
        &mut self,
        list: &ClassList,
        line: &ParsedLine,
        class: &str,
        requests: &[CpRequest],
        report: &mut ClassListReport,
    ) {
        let holder = self
            .rt
            .find_class(LoaderKind::App, class)
            .filter(|&k| self.rt.klass(k).is_builtin() && self.rt.klass(k).state.is_loaded());
        let Some(holder) = holder else {
            let column = classlist::CONSTANT_POOL_TAG.len() + 1;
            Self::warn_line(
                report,
                line.diagnostic(
                    &list.file,
                    column,
                    format!("class {class} is not (yet) loaded by one of the built-in loaders"),
                ),
            );
            return;
        };
        let cp = &self.rt.klass(holder).constants;
        let len = cp.len();
        let mut bits = Vec::with_capacity(requests.len());
        for req in requests {
            let index = req.index as usize;
            if index == 0 || index >= len {
                Self::warn_line(
                    report,
                    line.diagnostic(&list.file, req.column, format!("Invalid constant pool index {}", req.index)),
                );
                continue;
            }
            let tag = cp.tag_at(index as u16);
            let supported = matches!(
                tag,
                CpTag::Class
                    | CpTag::UnresolvedClass
                    | CpTag::UnresolvedClassInError
                    | CpTag::Fieldref
                    | CpTag::Methodref
                    | CpTag::InterfaceMethodref
                    | CpTag::InvokeDynamic
            );
            if !supported {
                Self::warn_line(
                    report,
                    line.diagnostic(
                        &list.file,
                        req.column,
                        format!("Unsupported constant pool index {}: {:?} (type={})", req.index, tag, tag.value()),
                    ),
                );
                continue;
            }
            bits.push(index);
        }
        let map = self.cp_requests.entry(holder).or_insert_with(|| BitMap::new(len));
        for index in bits {
            map.set(index);
        }
        report.cp_requests += 1;
    }

    fn apply_lambda_proxy(
        &mut self,
        list: &ClassList,
        line: &ParsedLine,
        class: &str,
        items: &[String],
        report: &mut ClassListReport,
    ) -> Result<(), DumpError> {
        let fatal = |msg: String| DumpError::ClassList(ClassListError::Parse(line.diagnostic(&list.file, 0, msg)));
        if items.len() != LAMBDA_PROXY_ITEMS {
            return Err(fatal(format!(
                "Expected {LAMBDA_PROXY_ITEMS} items after the caller of {}, found {}",
                classlist::LAMBDA_PROXY_TAG,
                items.len()
            )));
        }
        let Some(caller) = self.rt.find_class(LoaderKind::App, class) else {
            Self::warn_line(
                report,
                line.diagnostic(&list.file, 0, format!("Preload Warning: Cannot find {class}")),
            );
            return Ok(());
        };
        let (invoked_name, invoked_type) = (&items[0], &items[1]);
        let cp = &self.rt.klass(caller).constants;
        let candidates: Vec<u16> = (1..cp.len() as u16)
            .filter(|&i| {
                cp.indy_at(i)
                    .is_some_and(|(_, name, sig)| name == invoked_name && sig == invoked_type)
            })
            .collect();
        // Several sites may share a shape; each line claims the next unlinked one.
        let index = candidates
            .iter()
            .copied()
            .find(|i| !cp.cache.indys.contains_key(i))
            .or_else(|| candidates.first().copied());
        let Some(index) = index else {
            return Err(fatal(format!(
                "No invoke dynamic constant pool entry can be found for class {class}. The classlist is probably out-of-date."
            )));
        };

        let site = self
            .rt
            .link_class(caller)
            .and_then(|()| self.rt.resolve_indy_at(caller, index));
        let proxy = match site {
            Ok(cs) => cs.target,
            Err(e) => {
                Self::warn_line(
                    report,
                    line.diagnostic(&list.file, 0, format!("Cannot link lambda site {class}[{index}]: {e}")),
                );
                return Ok(());
            }
        };
        let Some(proxy) = proxy else {
            debug!(target: "cds::lambda", "{}[{}] is not a lambda site", class, index);
            return Ok(());
        };
        let loader = self.rt.klass(caller).loader;
        let Some(member_holder) = self.rt.find_class(loader, &items[4]) else {
            Self::warn_line(
                report,
                line.diagnostic(&list.file, 0, format!("Preload Warning: Cannot find {}", items[4])),
            );
            return Ok(());
        };
        let key = LambdaProxyKey {
            caller,
            invoked_name: invoked_name.clone(),
            invoked_type: invoked_type.clone(),
            method_type: items[2].clone(),
            member_holder,
            member_name: items[5].clone(),
            member_signature: items[6].clone(),
            instantiated_method_type: items[7].clone(),
        };
        debug!(
            target: "cds::lambda",
            "Registered {} for {}.{}{}",
            self.rt.klasses.name(proxy),
            class,
            key.invoked_name,
            key.invoked_type
        );
        self.lambdas.add_proxy(&self.rt, &mut self.table, key, proxy);
        report.lambda_proxies += 1;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // dump
    // ---------------------------------------------------------------------

    fn link_loaded_classes(&mut self) -> usize {
        let pending: Vec<KlassId> = self
            .rt
            .klasses
            .iter()
            .filter(|(_, k)| k.is_instance() || k.is_hidden())
            .filter(|(_, k)| k.state.is_loaded() && !k.state.is_linked())
            .map(|(id, _)| id)
            .collect();
        let mut failures = 0;
        for k in pending {
            if let Err(e) = self.rt.link_class(k) {
                warn!(target: "cds", "Linking {} failed: {}", self.rt.klasses.name(k), e);
                self.table.set_failed_verification(&self.rt, k);
                failures += 1;
            }
        }
        failures
    }

    /// Archivable classes plus the array classes whose bottom class is
    /// archivable or primitive, in class-id order.
    fn archived_classes(&self) -> Vec<KlassId> {
        let mut classes: BTreeSet<KlassId> = self.table.archivable().collect();
        for (id, k) in self.rt.klasses.iter() {
            if !k.state.is_loaded() {
                continue;
            }
            match k.kind {
                KlassKind::TypeArray { .. } => {
                    classes.insert(id);
                }
                KlassKind::ObjArray { .. } => {
                    let bottom = self.rt.klasses.bottom_klass(id);
                    if self.rt.klass(bottom).is_type_array() || classes.contains(&bottom) {
                        classes.insert(id);
                    }
                }
                _ => {}
            }
        }
        classes.into_iter().collect()
    }

    /// Runs every dump phase and lays out the archive.
    pub fn dump(mut self) -> Result<ArchiveImage, DumpError> {
        let mut report = DumpReport::default();
        self.rt.take_events();

        report.link_failures = self.link_loaded_classes();
        report.classes_excluded = ExclusionEngine::new(&self.config).check_all(&self.rt, &mut self.table)?;
        let forced = apply_forced_list(&self.rt, &mut self.table);
        debug!(target: "cds", "{} classes forced to pre-initialize", forced);

        let dropped_sites = self.lambdas.cleanup(&self.rt, &self.table);
        let bound = self.training.bind(&self.rt);
        let dropped_methods = self.training.cleanup(&self.rt, &self.table);
        debug!(
            target: "cds",
            "Dropped {} lambda sites and {} training records; {} records bound",
            dropped_sites,
            dropped_methods,
            bound
        );

        let (preloaded, platform_initiated, app_initiated) = {
            let mut resolver = CpPreResolver::new(&self.rt, &self.config, &self.table);
            resolver.preresolve_all(&mut self.rt, &self.cp_requests);
            let archivable: Vec<KlassId> = self.table.archivable().collect();
            for k in archivable {
                resolver.remove_unshareable_entries(&mut self.rt, k);
            }
            let preloaded = resolver.class_sets_mut().record_preloaded_klasses(&self.rt);
            let platform: Vec<KlassId> = resolver.class_sets().platform_initiated().collect();
            let app: Vec<KlassId> = resolver.class_sets().app_initiated().collect();
            report.preresolve = resolver.report().clone();
            (preloaded, platform, app)
        };
        self.rt.take_events();

        let mut heap = HeapArchiver::new(&self.config);
        for &field in &self.extra_root_fields {
            heap.add_root_field(field);
        }
        report.heap = heap.archive_all(&mut self.rt, &mut self.table)?;
        self.rt.take_events();

        let classes = self.archived_classes();
        let init_list = self.recorder.finish(&self.rt, &self.table);
        if self.config.enforce_class_init_dependencies {
            init_list.check_init_dependencies(&self.rt)?;
        }

        if self.config.precompile_level > 0 {
            let directives = Directives::from_config(&self.config)?;
            let precompiler = Precompiler::new(&self.config, &directives, &self.training);
            let mut broker = InstallingBroker::new();
            report.precompile = precompiler.compile_cached_code(&mut self.rt, &mut broker);
        }

        let art = DumpArtifacts {
            rt: &self.rt,
            config: &self.config,
            table: &self.table,
            classes: &classes,
            heap: &heap,
            init_list: &init_list,
            lambdas: &self.lambdas,
            training: &self.training,
            preloaded: &preloaded,
            platform_initiated: &platform_initiated,
            app_initiated: &app_initiated,
            reflection_data: &self.reflection_data,
            lambda_form_invokers: &self.lambda_form_invokers,
            precompiled: report.precompile.compiled > 0,
        };
        let (bytes, summary) = ArchiveBuilder::new(&art).build()?;
        Ok(ArchiveImage { bytes, summary, report })
    }
}
