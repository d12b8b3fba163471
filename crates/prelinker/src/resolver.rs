//! # Deterministic CP Pre-Resolution
//!
//! Each requested CP index moves from `Unresolved` to exactly one of `Resolved`,
//! `ResolutionError` or `SkippedNonDeterministic`. Only `Resolved` entries are
//! written to the archive; [`CpPreResolver::remove_unshareable_entries`] reverts
//! anything else the training run left resolved in the pool.
//!
//! **Determinism tests**:
//! - Class: the target is already loaded, and either a supertype of the holder,
//!   a vm class, or a preloaded class.
//! - Field: the class component passes, the field is an instance field, and its
//!   declaring class is archivable.
//! - Method: the class component passes, the target cannot be overridden, and its
//!   holder is archivable. Static targets only into the method-handle runtime.
//! - Invokedynamic: a lambda metafactory or string-concat bootstrap with the
//!   exact bootstrap signature, in a holder outside `java.base`.

use crate::classes::ClassSets;
use crate::ResolveError;
use common::runtime::{
    LAMBDA_METAFACTORY, LAMBDA_METAFACTORY_SIGNATURE, METHOD_HANDLE_CLASS, STRING_CONCAT_FACTORY,
    STRING_CONCAT_SIGNATURE,
};
use common::{BitMap, CdsConfig, CpEntry, CpTag, KlassId, LoaderKind, Runtime};
use dumptime::{is_archivable_hidden, DumpTimeTable};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// Holders regenerated from `@lambda-form-invoker` lines. Their pools are
/// resolved eagerly so that compiled code can inline through them.
pub const LAMBDA_FORM_INVOKER_HOLDERS: &[&str] = &[
    "java/lang/invoke/Invokers$Holder",
    "java/lang/invoke/DirectMethodHandle$Holder",
    "java/lang/invoke/DelegatingMethodHandle$Holder",
    "java/lang/invoke/LambdaForm$Holder",
];

const METHOD_HANDLE_NATIVES_CLASS: &str = "java/lang/invoke/MethodHandleNatives";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CpState {
    #[default]
    Unresolved,
    Resolved,
    ResolutionError,
    SkippedNonDeterministic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreResolveReport {
    pub requested: usize,
    pub resolved: usize,
    pub errors: usize,
    pub skipped: usize,
    pub strings: usize,
    /// Resolved entries removed again before writing.
    pub reverted: usize,
}

/// Resolves a single CP entry in place.
pub trait Resolver {
    fn resolve_entry(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError>;
}

pub struct CpPreResolver<'a> {
    config: &'a CdsConfig,
    table: &'a DumpTimeTable,
    sets: ClassSets,
    states: BTreeMap<(KlassId, u16), CpState>,
    report: PreResolveReport,
}

impl<'a> CpPreResolver<'a> {
    pub fn new(rt: &Runtime, config: &'a CdsConfig, table: &'a DumpTimeTable) -> Self {
        Self {
            config,
            table,
            sets: ClassSets::new(rt, table, config),
            states: BTreeMap::new(),
            report: PreResolveReport::default(),
        }
    }

    pub fn state(&self, holder: KlassId, index: u16) -> CpState {
        self.states.get(&(holder, index)).copied().unwrap_or_default()
    }

    pub fn report(&self) -> &PreResolveReport {
        &self.report
    }

    pub fn class_sets(&self) -> &ClassSets {
        &self.sets
    }

    pub fn class_sets_mut(&mut self) -> &mut ClassSets {
        &mut self.sets
    }

    fn is_archivable(&self, k: KlassId) -> bool {
        self.table
            .get(k)
            .is_some_and(|i| i.exclusion_checked && !i.is_excluded())
    }

    fn class_name(rt: &Runtime, k: KlassId) -> String {
        rt.klass(k).external_name()
    }

    fn not_deterministic(rt: &Runtime, holder: KlassId, index: u16, tag: CpTag) -> ResolveError {
        ResolveError::NotDeterministic {
            class: Self::class_name(rt, holder),
            index,
            tag,
        }
    }

    fn runtime_error(rt: &Runtime, holder: KlassId, index: u16, source: common::RuntimeError) -> ResolveError {
        ResolveError::Runtime {
            class: Self::class_name(rt, holder),
            index,
            source,
        }
    }

    // ---------------------------------------------------------------------
    // determinism tests
    // ---------------------------------------------------------------------

    /// Whether a reference from `holder` to `target` resolves to the same class
    /// in every run that maps the archive.
    pub fn can_archive_resolved_klass(&mut self, rt: &Runtime, holder: KlassId, target: KlassId) -> bool {
        let t = rt.klass(target);
        if !t.is_instance() {
            return false;
        }
        if rt.klasses.is_subtype_of(holder, target) {
            return true;
        }
        if self.sets.is_vm_class(holder) {
            return self.sets.is_vm_class(target);
        }
        if self.sets.is_preloaded(target) {
            let h = rt.klass(holder);
            return match h.loader {
                LoaderKind::Platform | LoaderKind::App => {
                    self.sets.maybe_add_initiated(rt, holder, target);
                    true
                }
                LoaderKind::Boot => true,
                LoaderKind::Unregistered => false,
            };
        }
        // A boot class that is itself archived is found first by every loader.
        t.loader == LoaderKind::Boot && rt.klass(holder).is_builtin() && self.is_archivable(target)
    }

    /// The already loaded class that the class entry `index` names.
    fn loaded_class_at(rt: &Runtime, holder: KlassId, index: u16) -> Option<KlassId> {
        let h = rt.klass(holder);
        if let Some(k) = h.constants.resolved_klass_at(index) {
            return Some(k);
        }
        let name = h.constants.klass_name_at(index)?;
        rt.find_class(h.loader, name)
            .filter(|&k| rt.klass(k).state.is_loaded())
    }

    fn resolve_class(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<KlassId, ResolveError> {
        let tag = rt.klass(holder).constants.tag_at(index);
        let target = Self::loaded_class_at(rt, holder, index)
            .ok_or_else(|| Self::not_deterministic(rt, holder, index, tag))?;
        if !self.can_archive_resolved_klass(rt, holder, target) {
            return Err(Self::not_deterministic(rt, holder, index, tag));
        }
        let k = rt
            .resolve_klass_at(holder, index)
            .map_err(|e| Self::runtime_error(rt, holder, index, e))?;
        trace!(
            target: "cds::resolve",
            "Resolved class  [{:3}] {} -> {}",
            index,
            Self::class_name(rt, holder),
            Self::class_name(rt, k)
        );
        Ok(k)
    }

    fn resolve_field(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError> {
        let (class_index, name, sig) = {
            let m = rt
                .klass(holder)
                .constants
                .member_ref_at(index)
                .ok_or_else(|| Self::not_deterministic(rt, holder, index, CpTag::Fieldref))?;
            (m.class_index, m.name.to_string(), m.signature.to_string())
        };
        let k = self.resolve_class(rt, holder, class_index)?;
        let (decl, field, _) = rt
            .find_field(k, &name, &sig)
            .ok_or_else(|| {
                Self::runtime_error(
                    rt,
                    holder,
                    index,
                    common::RuntimeError::NoSuchField(format!("{}.{}", rt.klasses.name(k), name)),
                )
            })?;
        // Resolving a static field may run the initializer of its class.
        if field.is_static() || !self.is_archivable(decl) {
            return Err(Self::not_deterministic(rt, holder, index, CpTag::Fieldref));
        }
        rt.resolve_field_at(holder, index)
            .map_err(|e| Self::runtime_error(rt, holder, index, e))?;
        trace!(
            target: "cds::resolve",
            "Resolved field  [{:3}] {} -> {}.{}",
            index,
            Self::class_name(rt, holder),
            Self::class_name(rt, decl),
            name
        );
        Ok(())
    }

    fn resolve_method(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError> {
        let (tag, class_index, name, sig) = {
            let m = rt
                .klass(holder)
                .constants
                .member_ref_at(index)
                .ok_or_else(|| Self::not_deterministic(rt, holder, index, CpTag::Methodref))?;
            (m.tag, m.class_index, m.name.to_string(), m.signature.to_string())
        };
        let k = self.resolve_class(rt, holder, class_index)?;
        let target = rt.find_method(k, &name, &sig).ok_or_else(|| {
            Self::runtime_error(
                rt,
                holder,
                index,
                common::RuntimeError::NoSuchMethod(format!("{}.{}{}", rt.klasses.name(k), name, sig)),
            )
        })?;
        let (method_holder, bound, is_static) = match rt.method(target) {
            Some(m) => (m.holder, m.can_be_statically_bound(), m.is_static()),
            None => return Err(Self::not_deterministic(rt, holder, index, tag)),
        };
        let static_ok = !is_static
            || matches!(
                rt.klasses.name(method_holder),
                METHOD_HANDLE_CLASS | METHOD_HANDLE_NATIVES_CLASS
            );
        if !bound || !static_ok || !self.is_archivable(method_holder) {
            return Err(Self::not_deterministic(rt, holder, index, tag));
        }
        rt.resolve_method_at(holder, index)
            .map_err(|e| Self::runtime_error(rt, holder, index, e))?;
        trace!(
            target: "cds::resolve",
            "Resolved method [{:3}] {} -> {}.{}",
            index,
            Self::class_name(rt, holder),
            Self::class_name(rt, method_holder),
            name
        );
        Ok(())
    }

    /// Whether the bootstrap method of the indy entry is one whose call sites
    /// link to the same target in every run.
    pub fn is_indy_archivable(&self, rt: &Runtime, holder: KlassId, index: u16) -> bool {
        if !self.config.archive_invoke_dynamic || !self.config.heap_archiving_enabled() {
            return false;
        }
        let h = rt.klass(holder);
        if h.in_java_base() {
            return false;
        }
        let cp = &h.constants;
        let Some((bsm, _, invoked_type)) = cp.indy_at(index) else {
            return false;
        };
        let Some((_, member)) = cp.method_handle_at(bsm.method_handle) else {
            return false;
        };
        let Some(bsm_class) = cp.klass_name_at(member.class_index) else {
            return false;
        };
        // The call site must produce an object.
        if !invoked_type.rsplit(')').next().is_some_and(|r| r.starts_with('L')) {
            return false;
        }
        match (bsm_class, member.name) {
            (LAMBDA_METAFACTORY, "metafactory") => {
                member.signature == LAMBDA_METAFACTORY_SIGNATURE
                    && bsm.arguments.len() == 3
                    && matches!(cp.tag_at(bsm.arguments[0]), CpTag::MethodType)
                    && rt.method_handle_kind(holder, bsm.arguments[1]).is_some()
                    && matches!(cp.tag_at(bsm.arguments[2]), CpTag::MethodType)
            }
            (STRING_CONCAT_FACTORY, "makeConcatWithConstants") => {
                member.signature == STRING_CONCAT_SIGNATURE
            }
            _ => false,
        }
    }

    fn resolve_indy(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError> {
        if !self.is_indy_archivable(rt, holder, index) {
            return Err(Self::not_deterministic(rt, holder, index, CpTag::InvokeDynamic));
        }
        let cs = rt
            .resolve_indy_at(holder, index)
            .map_err(|e| Self::runtime_error(rt, holder, index, e))?;
        if let Some(proxy) = cs.target {
            if !self.is_archivable(proxy) && !is_archivable_hidden(rt, self.config, proxy) {
                rt.klass_mut(holder).constants.cache.indys.remove(&index);
                return Err(Self::not_deterministic(rt, holder, index, CpTag::InvokeDynamic));
            }
        }
        trace!(
            target: "cds::resolve",
            "Resolved indy   [{:3}] {} -> {}.{}",
            index,
            Self::class_name(rt, holder),
            cs.bootstrap_class,
            cs.bootstrap_name
        );
        Ok(())
    }

    fn resolve_string(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError> {
        if !self.config.heap_archiving_enabled() {
            return Err(Self::not_deterministic(rt, holder, index, CpTag::String));
        }
        let value = match rt.klass(holder).constants.entry(index) {
            Some(CpEntry::String { utf8 }) => rt.klass(holder).constants.utf8_at(*utf8).map(str::to_string),
            _ => None,
        };
        let value = value.ok_or_else(|| Self::not_deterministic(rt, holder, index, CpTag::String))?;
        rt.intern(&value)
            .map_err(|e| Self::runtime_error(rt, holder, index, e))?;
        self.report.strings += 1;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // drivers
    // ---------------------------------------------------------------------

    /// Whether every class and member entry of `k` is resolved, not only the
    /// ones the training run touched.
    pub fn resolves_eagerly(&self, rt: &Runtime, k: KlassId) -> bool {
        let klass = rt.klass(k);
        klass.is_builtin()
            && (LAMBDA_FORM_INVOKER_HOLDERS.contains(&klass.name.as_str())
                || (klass.is_hidden() && is_archivable_hidden(rt, self.config, k)))
    }

    /// Attempts every index set in `requested`. Returns the number of entries
    /// resolved by this call.
    pub fn preresolve(&mut self, rt: &mut Runtime, holder: KlassId, requested: &BitMap) -> Result<usize, ResolveError> {
        if !rt.klass(holder).state.is_linked() {
            return Err(ResolveError::NotLinked(holder));
        }
        let mut resolved = 0;
        for i in requested.iter_ones() {
            let Ok(index) = u16::try_from(i) else {
                break;
            };
            self.report.requested += 1;
            let state = match self.resolve_entry(rt, holder, index) {
                Ok(()) => {
                    resolved += 1;
                    CpState::Resolved
                }
                Err(e @ ResolveError::NotDeterministic { .. }) => {
                    debug!(target: "cds::resolve", "{}", e);
                    CpState::SkippedNonDeterministic
                }
                Err(e) => {
                    warn!(target: "cds::resolve", "{}", e);
                    CpState::ResolutionError
                }
            };
            match state {
                CpState::Resolved => self.report.resolved += 1,
                CpState::SkippedNonDeterministic => self.report.skipped += 1,
                CpState::ResolutionError => self.report.errors += 1,
                CpState::Unresolved => {}
            }
            self.states.insert((holder, index), state);
        }
        Ok(resolved)
    }

    /// Interns the string constants of `holder` and, for classes that resolve
    /// eagerly, attempts all of their class and member entries.
    pub fn dumptime_resolve_constants(&mut self, rt: &mut Runtime, holder: KlassId) -> Result<usize, ResolveError> {
        if !rt.klass(holder).state.is_linked() {
            return Err(ResolveError::NotLinked(holder));
        }
        let len = rt.klass(holder).constants.len();
        for index in 1..len as u16 {
            if rt.klass(holder).constants.tag_at(index) == CpTag::String {
                if let Err(e) = self.resolve_string(rt, holder, index) {
                    debug!(target: "cds::resolve", "{}", e);
                }
            }
        }
        if !self.resolves_eagerly(rt, holder) {
            return Ok(0);
        }
        let mut all = BitMap::new(len);
        for index in 1..len as u16 {
            let tag = rt.klass(holder).constants.tag_at(index);
            if tag.is_unresolved_klass() || tag.is_field_or_method() {
                all.set(index as usize);
            }
        }
        self.preresolve(rt, holder, &all)
    }

    /// Pre-resolves every archivable class, using its training-run request map
    /// when there is one. Returns the total number of resolved entries.
    pub fn preresolve_all(&mut self, rt: &mut Runtime, requests: &BTreeMap<KlassId, BitMap>) -> usize {
        let classes: Vec<KlassId> = self.table.archivable().collect();
        let mut total = 0;
        for k in classes {
            if let Err(e) = self.dumptime_resolve_constants(rt, k) {
                debug!(target: "cds::resolve", "{}", e);
                continue;
            }
            if let Some(bits) = requests.get(&k) {
                match self.preresolve(rt, k, bits) {
                    Ok(n) => total += n,
                    Err(e) => debug!(target: "cds::resolve", "{}", e),
                }
            }
        }
        info!(
            target: "cds::resolve",
            "Pre-resolved {} of {} requested entries ({} skipped, {} errors, {} strings)",
            self.report.resolved,
            self.report.requested,
            self.report.skipped,
            self.report.errors,
            self.report.strings
        );
        total
    }

    /// Reverts resolved entries of `holder` that did not pass the determinism
    /// tests, so that only deterministic resolutions reach the archive.
    pub fn remove_unshareable_entries(&mut self, rt: &mut Runtime, holder: KlassId) -> usize {
        let keep = |states: &BTreeMap<(KlassId, u16), CpState>, index: u16| {
            states.get(&(holder, index)) == Some(&CpState::Resolved)
        };
        let mut reverted = 0;
        let len = rt.klass(holder).constants.len();
        for index in 1..len as u16 {
            if rt.klass(holder).constants.tag_at(index) != CpTag::Class || keep(&self.states, index) {
                continue;
            }
            let deterministic = rt
                .klass(holder)
                .constants
                .resolved_klass_at(index)
                .is_some_and(|t| self.can_archive_resolved_klass(rt, holder, t));
            if !deterministic {
                rt.klass_mut(holder).constants.unresolve_klass(index);
                reverted += 1;
            }
        }
        let states = &self.states;
        let cache = &mut rt.klass_mut(holder).constants.cache;
        let before = cache.fields.len() + cache.methods.len() + cache.indys.len() + cache.invokehandles.len();
        cache.fields.retain(|&i, _| keep(states, i));
        cache.methods.retain(|&i, _| keep(states, i));
        cache.indys.retain(|&i, _| keep(states, i));
        cache.invokehandles.clear();
        let after = cache.fields.len() + cache.methods.len() + cache.indys.len();
        reverted += before - after;
        if reverted > 0 {
            debug!(
                target: "cds::resolve",
                "{}: reverted {} resolved entries",
                rt.klass(holder).external_name(),
                reverted
            );
        }
        self.report.reverted += reverted;
        reverted
    }
}

impl Resolver for CpPreResolver<'_> {
    fn resolve_entry(&mut self, rt: &mut Runtime, holder: KlassId, index: u16) -> Result<(), ResolveError> {
        let tag = rt.klass(holder).constants.tag_at(index);
        match tag {
            CpTag::UnresolvedClass | CpTag::UnresolvedClassInError | CpTag::Class => {
                self.resolve_class(rt, holder, index).map(|_| ())
            }
            CpTag::Fieldref if self.config.archive_field_references => self.resolve_field(rt, holder, index),
            CpTag::Methodref | CpTag::InterfaceMethodref if self.config.archive_method_references => {
                self.resolve_method(rt, holder, index)
            }
            CpTag::Fieldref | CpTag::Methodref | CpTag::InterfaceMethodref => {
                Err(Self::not_deterministic(rt, holder, index, tag))
            }
            CpTag::InvokeDynamic => self.resolve_indy(rt, holder, index),
            CpTag::String => self.resolve_string(rt, holder, index),
            _ => Err(ResolveError::UnsupportedTag {
                class: Self::class_name(rt, holder),
                index,
                tag,
            }),
        }
    }
}
