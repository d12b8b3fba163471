//! Class sets the determinism tests consult.
//!
//! - *vm classes* are resolved while the runtime boots, before any user code can
//!   run, so they can never be replaced.
//! - *preloaded classes* are the archivable built-in classes the runtime loads
//!   eagerly at start-up when `PreloadSharedClasses` is on.
//! - *initiated classes* are preloaded classes that a platform or app class
//!   references from another loader. The loader must be registered as an
//!   initiating loader of them before the reference can be trusted.

use common::{CdsConfig, KlassId, LoaderKind, Runtime};
use dumptime::DumpTimeTable;
use std::collections::BTreeSet;
use tracing::{info, trace};

/// Classes the runtime resolves during bootstrap.
pub const VM_CLASS_NAMES: &[&str] = &[
    "java/lang/Object",
    "java/lang/String",
    "java/lang/Class",
    "java/lang/Cloneable",
    "java/lang/ClassLoader",
    "java/io/Serializable",
    "java/lang/System",
    "java/lang/Throwable",
    "java/lang/Error",
    "java/lang/Exception",
    "java/lang/RuntimeException",
    "java/lang/NullPointerException",
    "java/lang/ArithmeticException",
    "java/lang/ArrayStoreException",
    "java/lang/ClassCastException",
    "java/lang/ArrayIndexOutOfBoundsException",
    "java/lang/VirtualMachineError",
    "java/lang/Thread",
    "java/lang/ThreadGroup",
    "java/lang/Module",
    "java/lang/Record",
    "java/lang/Enum",
    "java/lang/Number",
    "java/lang/Boolean",
    "java/lang/Character",
    "java/lang/Float",
    "java/lang/Double",
    "java/lang/Byte",
    "java/lang/Short",
    "java/lang/Integer",
    "java/lang/Long",
    "java/lang/StackTraceElement",
    "java/lang/ref/Reference",
    "java/lang/invoke/MethodHandle",
    "java/lang/invoke/MethodHandleNatives",
    "java/lang/invoke/MethodType",
    "java/lang/invoke/MemberName",
    "java/lang/invoke/CallSite",
    "java/lang/invoke/LambdaForm",
    "java/lang/invoke/ResolvedMethodName",
    "java/lang/invoke/MethodHandles$Lookup",
];

/// Preloaded classes by loader, each list ordered supertypes first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadedKlasses {
    /// Boot classes in `java.base`.
    pub boot: Vec<KlassId>,
    /// Boot classes in other modules.
    pub boot2: Vec<KlassId>,
    pub platform: Vec<KlassId>,
    pub app: Vec<KlassId>,
}

#[derive(Debug, Default)]
pub struct ClassSets {
    vm_classes: BTreeSet<KlassId>,
    preloaded: BTreeSet<KlassId>,
    platform_initiated: BTreeSet<KlassId>,
    app_initiated: BTreeSet<KlassId>,
}

impl ClassSets {
    /// Computes the vm classes (with their supertypes) and, when
    /// `PreloadSharedClasses` is on, the preloaded classes.
    pub fn new(rt: &Runtime, table: &DumpTimeTable, config: &CdsConfig) -> Self {
        let mut sets = ClassSets::default();
        for name in VM_CLASS_NAMES {
            if let Some(k) = rt.boot_class(name) {
                sets.add_vm_class(rt, k);
            }
        }
        if config.preload_shared_classes {
            sets.preloaded = table
                .archivable()
                .filter(|&k| {
                    let klass = rt.klass(k);
                    klass.is_builtin() && !klass.is_hidden()
                })
                .collect();
        }
        sets
    }

    fn add_vm_class(&mut self, rt: &Runtime, k: KlassId) {
        if self.vm_classes.insert(k) {
            for sup in rt.klasses.direct_supertypes(k) {
                self.add_vm_class(rt, sup);
            }
        }
    }

    pub fn is_vm_class(&self, k: KlassId) -> bool {
        self.vm_classes.contains(&k)
    }

    pub fn is_preloaded(&self, k: KlassId) -> bool {
        self.preloaded.contains(&k)
    }

    pub fn vm_class_count(&self) -> usize {
        self.vm_classes.len()
    }

    /// Records `target` as initiated by the loader of `holder` when the two are
    /// defined by different loaders.
    pub fn maybe_add_initiated(&mut self, rt: &Runtime, holder: KlassId, target: KlassId) {
        let holder_loader = rt.klass(holder).loader;
        if holder_loader == rt.klass(target).loader {
            return;
        }
        let set = match holder_loader {
            LoaderKind::Platform => &mut self.platform_initiated,
            LoaderKind::App => &mut self.app_initiated,
            LoaderKind::Boot | LoaderKind::Unregistered => return,
        };
        if set.insert(target) {
            trace!(
                target: "cds::resolve",
                "{} loader initiated {} -> {}",
                holder_loader,
                rt.klass(holder).external_name(),
                rt.klass(target).external_name()
            );
        }
    }

    pub fn platform_initiated(&self) -> impl Iterator<Item = KlassId> + '_ {
        self.platform_initiated.iter().copied()
    }

    pub fn app_initiated(&self) -> impl Iterator<Item = KlassId> + '_ {
        self.app_initiated.iter().copied()
    }

    /// Lists the preloaded classes per loader, supertypes first, recording the
    /// supertypes a platform or app class takes from another loader as initiated.
    pub fn record_preloaded_klasses(&mut self, rt: &Runtime) -> PreloadedKlasses {
        let mut out = PreloadedKlasses::default();
        if self.preloaded.is_empty() {
            return out;
        }
        let mut seen = BTreeSet::new();
        let candidates: Vec<KlassId> = self.preloaded.iter().copied().collect();
        for k in candidates {
            self.record_one(rt, k, &mut seen, &mut out);
        }
        info!(
            target: "cds",
            "Preloaded classes: boot {}, boot2 {}, platform {}, app {}",
            out.boot.len(),
            out.boot2.len(),
            out.platform.len(),
            out.app.len()
        );
        out
    }

    fn record_one(
        &mut self,
        rt: &Runtime,
        k: KlassId,
        seen: &mut BTreeSet<KlassId>,
        out: &mut PreloadedKlasses,
    ) {
        if !seen.insert(k) || self.is_vm_class(k) || !self.is_preloaded(k) {
            return;
        }
        for sup in rt.klasses.direct_supertypes(k) {
            self.record_one(rt, sup, seen, out);
            self.maybe_add_initiated(rt, k, sup);
        }
        let klass = rt.klass(k);
        let list = match klass.loader {
            LoaderKind::Boot if klass.in_java_base() => &mut out.boot,
            LoaderKind::Boot => &mut out.boot2,
            LoaderKind::Platform => &mut out.platform,
            LoaderKind::App => &mut out.app,
            LoaderKind::Unregistered => return,
        };
        list.push(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use dumptime::ExclusionEngine;

    #[test]
    fn test_vm_classes_include_supertypes() {
        let rt = KlassBuilder::bootstrap_runtime();
        let table = DumpTimeTable::new();
        let sets = ClassSets::new(&rt, &table, &CdsConfig::default());
        let npe = rt.boot_class("java/lang/NullPointerException").unwrap();
        let throwable = rt.boot_class("java/lang/Throwable").unwrap();
        assert!(sets.is_vm_class(npe));
        assert!(sets.is_vm_class(throwable));
        assert!(!sets.is_vm_class(rt.boot_class("java/util/HashMap").unwrap()));
    }

    #[test]
    fn test_preloaded_lists_are_supers_first() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let base = KlassBuilder::new("app/Base", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let sub = KlassBuilder::new("app/Sub", LoaderKind::App)
            .super_class(&rt, "app/Base")
            .interface(&rt, "java/lang/Runnable")
            .build(&mut rt);
        let config = CdsConfig {
            preload_shared_classes: true,
            ..CdsConfig::default()
        };
        let mut table = DumpTimeTable::new();
        ExclusionEngine::new(&config).check_all(&rt, &mut table).unwrap();
        let mut sets = ClassSets::new(&rt, &table, &config);
        let lists = sets.record_preloaded_klasses(&rt);
        let pos = |k| lists.app.iter().position(|&x| x == k).unwrap();
        assert!(pos(base) < pos(sub));
        let runnable = rt.boot_class("java/lang/Runnable").unwrap();
        assert!(lists.boot.contains(&runnable));
        assert!(sets.app_initiated().any(|k| k == runnable));
    }
}
