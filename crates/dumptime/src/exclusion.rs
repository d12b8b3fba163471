//! # Exclusion Engine
//!
//! Decides, once per class, whether the class may go into the archive. The
//! first matching rule excludes the class; a class whose super class or any
//! direct interface is excluded is excluded too.
//!
//! [`ExclusionEngine::check_all`] walks the supertype graph in topological order
//! (supertypes first) so that every verdict it computes can read finished
//! verdicts of the supertypes. [`Excluder::check_for_exclusion`] works on a single
//! class and recurses into unchecked supertypes on demand.

use crate::table::DumpTimeTable;
use crate::DumpTimeError;
use common::klass::SPLIT_VERIFIER_MAJOR_VERSION;
use common::{CdsConfig, ClassState, HiddenKind, KlassFlags, KlassId, KlassKind, Runtime};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    NotLoaded,
    InErrorState,
    Scratch,
    Redefined,
    UnsupportedLocation,
    Signed,
    JfrEvent,
    FailedVerification,
    OldClass,
    UnarchivableHidden,
    ExcludedSuper(String),
    ExcludedInterface(String),
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::NotLoaded => write!(f, "Not fully loaded"),
            ExclusionReason::InErrorState => write!(f, "In error state"),
            ExclusionReason::Scratch => write!(f, "Scratch class"),
            ExclusionReason::Redefined => write!(f, "Has been redefined"),
            ExclusionReason::UnsupportedLocation => write!(f, "Unsupported location"),
            ExclusionReason::Signed => write!(f, "Signed JAR"),
            ExclusionReason::JfrEvent => write!(f, "JFR event class"),
            ExclusionReason::FailedVerification => write!(f, "Failed verification"),
            ExclusionReason::OldClass => write!(f, "Old class has been linked"),
            ExclusionReason::UnarchivableHidden => write!(f, "Hidden class"),
            ExclusionReason::ExcludedSuper(name) => write!(f, "super class {name} is excluded"),
            ExclusionReason::ExcludedInterface(name) => write!(f, "interface {name} is excluded"),
        }
    }
}

pub trait Excluder {
    /// Computes (or returns the memoized) exclusion verdict of `k`.
    fn check_for_exclusion(&self, rt: &Runtime, table: &mut DumpTimeTable, k: KlassId) -> bool;
}

/// Hidden classes the archive can hold: lambda-form classes and lambda proxies
/// whose nest host is an ordinary class. Both need invokedynamic archiving, which
/// in turn needs the heap region.
pub fn is_archivable_hidden(rt: &Runtime, config: &CdsConfig, k: KlassId) -> bool {
    if !config.archive_invoke_dynamic || !config.heap_archiving_enabled() {
        return false;
    }
    let klass = rt.klass(k);
    match klass.kind {
        KlassKind::Hidden(HiddenKind::LambdaForm) => klass.is_builtin(),
        KlassKind::Hidden(HiddenKind::LambdaProxy) => klass
            .nest_host
            .is_some_and(|h| rt.klass(h).is_builtin() && !rt.klass(h).is_hidden()),
        _ => false,
    }
}

pub struct ExclusionEngine<'a> {
    config: &'a CdsConfig,
}

impl<'a> ExclusionEngine<'a> {
    pub fn new(config: &'a CdsConfig) -> Self {
        Self { config }
    }

    /// Own-rule check, ignoring supertypes.
    fn local_reason(&self, rt: &Runtime, table: &mut DumpTimeTable, k: KlassId) -> Option<ExclusionReason> {
        let klass = rt.klass(k);
        if klass.state == ClassState::InitializationError {
            return Some(ExclusionReason::InErrorState);
        }
        if klass.has_flag(KlassFlags::SCRATCH) {
            return Some(ExclusionReason::Scratch);
        }
        if !klass.state.is_loaded() {
            return Some(ExclusionReason::NotLoaded);
        }
        if rt.klasses.has_been_redefined(k) {
            return Some(ExclusionReason::Redefined);
        }
        if !klass.is_hidden() && klass.classpath_index.is_none() && klass.is_builtin() {
            return Some(ExclusionReason::UnsupportedLocation);
        }
        if klass.has_flag(KlassFlags::SIGNED) {
            return Some(ExclusionReason::Signed);
        }
        if klass.has_flag(KlassFlags::JFR_EVENT) {
            return Some(ExclusionReason::JfrEvent);
        }
        if !klass.state.is_linked() {
            if table.info_mut(rt, k).failed_verification {
                return Some(ExclusionReason::FailedVerification);
            }
        } else if klass.major_version < SPLIT_VERIFIER_MAJOR_VERSION {
            return Some(ExclusionReason::OldClass);
        }
        if klass.is_hidden()
            && !table.info_mut(rt, k).is_archived_lambda_proxy
            && !is_archivable_hidden(rt, self.config, k)
        {
            return Some(ExclusionReason::UnarchivableHidden);
        }
        None
    }

    /// Verdict from supertypes that have already been checked.
    fn inherited_reason(&self, rt: &Runtime, table: &DumpTimeTable, k: KlassId) -> Option<ExclusionReason> {
        let klass = rt.klass(k);
        if let Some(s) = klass.super_klass.filter(|&s| table.is_excluded(s)) {
            return Some(ExclusionReason::ExcludedSuper(rt.klass(s).external_name()));
        }
        klass
            .interfaces
            .iter()
            .find(|&&i| table.is_excluded(i))
            .map(|&i| ExclusionReason::ExcludedInterface(rt.klass(i).external_name()))
    }

    fn record(&self, rt: &Runtime, table: &mut DumpTimeTable, k: KlassId, reason: Option<ExclusionReason>) -> bool {
        let info = table.info_mut(rt, k);
        match reason {
            Some(reason) => {
                if !info.is_excluded() {
                    warn!(target: "cds", "Skipping {}: {}", rt.klass(k).external_name(), reason);
                }
                info.set_excluded(reason.to_string());
                true
            }
            None => {
                info.exclusion_checked = true;
                info.is_excluded()
            }
        }
    }

    /// Checks every loaded instance class, supertypes first. Returns the number
    /// of excluded classes.
    pub fn check_all(&self, rt: &Runtime, table: &mut DumpTimeTable) -> Result<usize, DumpTimeError> {
        let mut graph: DiGraph<KlassId, ()> = DiGraph::new();
        let mut nodes: HashMap<KlassId, NodeIndex> = HashMap::new();
        for (id, klass) in rt.klasses.iter() {
            if klass.is_instance() {
                nodes.insert(id, graph.add_node(id));
            }
        }
        for (&id, &node) in &nodes {
            for sup in rt.klasses.direct_supertypes(id) {
                if let Some(&s) = nodes.get(&sup) {
                    graph.add_edge(s, node, ());
                }
            }
        }
        let order = toposort(&graph, None)
            .map_err(|cycle| DumpTimeError::CyclicTypeGraph(rt.klass(graph[cycle.node_id()]).name.clone()))?;

        let mut excluded = 0;
        for node in order {
            if self.check_for_exclusion(rt, table, graph[node]) {
                excluded += 1;
            }
        }
        info!(target: "cds", "Exclusion check: {} classes, {} excluded", nodes.len(), excluded);
        Ok(excluded)
    }
}

impl Excluder for ExclusionEngine<'_> {
    fn check_for_exclusion(&self, rt: &Runtime, table: &mut DumpTimeTable, k: KlassId) -> bool {
        match rt.klass(k).kind {
            KlassKind::TypeArray { .. } => return false,
            KlassKind::ObjArray { .. } => {
                let bottom = rt.klasses.bottom_klass(k);
                return bottom != k && self.check_for_exclusion(rt, table, bottom);
            }
            KlassKind::Instance | KlassKind::Hidden(_) => {}
        }
        if let Some(info) = table.get(k) {
            if info.exclusion_checked {
                return info.is_excluded();
            }
        }
        // Mark first so that a malformed cycle terminates.
        table.info_mut(rt, k).exclusion_checked = true;

        let reason = self.local_reason(rt, table, k).or_else(|| {
            for sup in rt.klasses.direct_supertypes(k) {
                self.check_for_exclusion(rt, table, sup);
            }
            self.inherited_reason(rt, table, k)
        });
        self.record(rt, table, k, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::LoaderKind;

    fn setup() -> (Runtime, CdsConfig) {
        (KlassBuilder::bootstrap_runtime(), CdsConfig::default())
    }

    #[test]
    fn test_plain_app_class_is_archivable() {
        let (mut rt, config) = setup();
        let a = KlassBuilder::new("app/A", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        let engine = ExclusionEngine::new(&config);
        assert!(!engine.check_for_exclusion(&rt, &mut table, a));
        assert!(table.get(a).unwrap().exclusion_checked);
    }

    #[test]
    fn test_redefined_super_excludes_subclass() {
        let (mut rt, config) = setup();
        let a = KlassBuilder::new("app/A", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let b = KlassBuilder::new("app/B", LoaderKind::App)
            .super_class(&rt, "app/A")
            .build(&mut rt);
        rt.klass_mut(a).flags |= KlassFlags::REDEFINED;
        let mut table = DumpTimeTable::new();
        let engine = ExclusionEngine::new(&config);
        engine.check_all(&rt, &mut table).unwrap();
        assert!(table.is_excluded(a));
        assert!(table.is_excluded(b));
    }

    #[test]
    fn test_signed_interface_propagates() {
        let (mut rt, config) = setup();
        let i = KlassBuilder::new("app/I", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::INTERFACE | KlassFlags::SIGNED)
            .build(&mut rt);
        let c = KlassBuilder::new("app/C", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .interface(&rt, "app/I")
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        let engine = ExclusionEngine::new(&config);
        assert!(engine.check_for_exclusion(&rt, &mut table, c));
        assert!(table.is_excluded(i));
        assert_eq!(
            table.get(c).unwrap().exclusion_reason.as_deref(),
            Some("interface app.I is excluded")
        );
    }

    #[test]
    fn test_exclusion_monotonic_over_all_classes() {
        let (mut rt, config) = setup();
        KlassBuilder::new("app/Jfr", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::JFR_EVENT)
            .build(&mut rt);
        KlassBuilder::new("app/Sub", LoaderKind::App)
            .super_class(&rt, "app/Jfr")
            .build(&mut rt);
        KlassBuilder::new("app/SubSub", LoaderKind::App)
            .super_class(&rt, "app/Sub")
            .build(&mut rt);
        KlassBuilder::new("app/Nowhere", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .classpath_index(None)
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        ExclusionEngine::new(&config).check_all(&rt, &mut table).unwrap();
        for (k, klass) in rt.klasses.iter().filter(|(_, k)| k.is_instance()) {
            if table.is_excluded(k) {
                continue;
            }
            for sup in rt.klasses.direct_supertypes(k) {
                assert!(!table.is_excluded(sup), "{} kept but super excluded", klass.name);
            }
        }
        assert!(table.is_excluded(rt.find_class(LoaderKind::App, "app/SubSub").unwrap()));
        assert!(table.is_excluded(rt.find_class(LoaderKind::App, "app/Nowhere").unwrap()));
    }

    #[test]
    fn test_hidden_classes() {
        let (mut rt, mut config) = setup();
        let host = KlassBuilder::new("app/Main", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let proxy = KlassBuilder::new("app/Main$$Lambda+0x01", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .hidden(HiddenKind::LambdaProxy)
            .build(&mut rt);
        rt.klass_mut(proxy).nest_host = Some(host);
        let other = KlassBuilder::new("app/Spun", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .hidden(HiddenKind::Other)
            .build(&mut rt);

        let mut table = DumpTimeTable::new();
        assert!(ExclusionEngine::new(&config).check_for_exclusion(&rt, &mut table, proxy));

        config.archive_invoke_dynamic = true;
        let mut table = DumpTimeTable::new();
        let engine = ExclusionEngine::new(&config);
        assert!(!engine.check_for_exclusion(&rt, &mut table, proxy));
        assert!(engine.check_for_exclusion(&rt, &mut table, other));
    }

    #[test]
    fn test_old_linked_class_excluded() {
        let (mut rt, config) = setup();
        let k = KlassBuilder::new("app/Old", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .major_version(49)
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        let engine = ExclusionEngine::new(&config);
        assert!(!engine.check_for_exclusion(&rt, &mut table, k));

        rt.link_class(k).unwrap();
        let mut table = DumpTimeTable::new();
        assert!(engine.check_for_exclusion(&rt, &mut table, k));
    }

    #[test]
    fn test_object_array_follows_element() {
        let (mut rt, config) = setup();
        let a = KlassBuilder::new("app/A", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::SIGNED)
            .build(&mut rt);
        let arr = KlassBuilder::array_of(&mut rt, a);
        let mut table = DumpTimeTable::new();
        assert!(ExclusionEngine::new(&config).check_for_exclusion(&rt, &mut table, arr));
        let int_arr = rt.boot_class("[I").unwrap();
        assert!(!ExclusionEngine::new(&config).check_for_exclusion(&rt, &mut table, int_arr));
    }
}
