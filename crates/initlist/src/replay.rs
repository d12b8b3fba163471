//! Start-up replay of the init list.

use crate::list::{InitInfo, InitList};
use bitflags::bitflags;
use common::{CdsConfig, ClassState, CpTag, KlassId, MethodId, Runtime, RuntimeError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplayFlags: u8 {
        const PRELINK = 1 << 0;
        const PREINIT = 1 << 1;
        const PRERESOLVE_CP = 1 << 2;
        const PRERESOLVE_INDY = 1 << 3;
        const PRERESOLVE_INVOKEHANDLE = 1 << 4;
    }
}

impl ReplayFlags {
    /// `PreloadArchivedClasses` 1 prelinks and 2 also pre-initializes.
    /// `Preresolve` bits 0..2 select class constants, invokedynamic and
    /// invokehandle sites.
    pub fn from_config(config: &CdsConfig) -> Self {
        let mut flags = ReplayFlags::empty();
        flags.set(ReplayFlags::PRELINK, config.preload_archived_classes > 0);
        flags.set(ReplayFlags::PREINIT, config.preload_archived_classes > 1);
        flags.set(ReplayFlags::PRERESOLVE_CP, config.preresolve & 1 != 0);
        flags.set(ReplayFlags::PRERESOLVE_INDY, config.preresolve & 2 != 0);
        flags.set(ReplayFlags::PRERESOLVE_INVOKEHANDLE, config.preresolve & 4 != 0);
        flags
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub preloaded: usize,
    pub prelinked: usize,
    pub preinitialized: usize,
    pub cp_resolved: usize,
    pub indy_resolved: usize,
    pub invokehandles_resolved: usize,
    pub reflection_data: usize,
    pub already_linked: usize,
    pub skipped: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayDriver {
    flags: ReplayFlags,
    preload_shared: bool,
    prelink_shared: bool,
    /// Archived reflection-data flags per class.
    reflection_data: BTreeMap<KlassId, u32>,
}

impl ReplayDriver {
    pub fn new(flags: ReplayFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn from_config(config: &CdsConfig) -> Self {
        Self {
            flags: ReplayFlags::from_config(config),
            preload_shared: config.preload_shared_classes,
            prelink_shared: config.prelink_shared_classes,
            ..Self::default()
        }
    }

    /// Classes whose reflection data is regenerated once their constants are
    /// resolved.
    pub fn with_reflection_data(mut self, reflection_data: BTreeMap<KlassId, u32>) -> Self {
        self.reflection_data = reflection_data;
        self
    }

    pub fn flags(&self) -> ReplayFlags {
        self.flags
    }

    /// Eagerly loads, and with `PrelinkSharedClasses` links, every built-in
    /// archived class. Returns `(loaded, linked)`.
    pub fn preload_all(&self, rt: &mut Runtime, archived: &BTreeSet<KlassId>) -> (usize, usize) {
        let (mut loaded, mut linked) = (0, 0);
        if !self.preload_shared {
            return (loaded, linked);
        }
        for &k in archived {
            if !rt.klass(k).is_builtin() {
                continue;
            }
            if !rt.klass(k).state.is_loaded() {
                match rt.load_class(k) {
                    Ok(()) => loaded += 1,
                    Err(e) => {
                        debug!(target: "cds", "Preload of {} failed: {}", rt.klass(k).external_name(), e);
                        continue;
                    }
                }
            }
            if self.prelink_shared && !rt.klass(k).state.is_linked() {
                match rt.link_class(k) {
                    Ok(()) => linked += 1,
                    Err(e) => debug!(target: "cds", "Prelink of {} failed: {}", rt.klass(k).external_name(), e),
                }
            }
        }
        info!(target: "cds", "Preloaded {} and prelinked {} shared classes", loaded, linked);
        (loaded, linked)
    }

    /// Replays `list` against `rt`. Entries whose holder is not in `archived`
    /// are skipped. Never fails.
    pub fn replay(&self, rt: &mut Runtime, list: &InitList, archived: &BTreeSet<KlassId>) -> ReplayReport {
        let mut report = ReplayReport::default();
        for entry in list.entries() {
            let Some(holder) = entry.holder() else {
                continue;
            };
            if !archived.contains(&holder) || rt.klasses.get(holder).is_none() {
                debug!(target: "cds", "Replay: {} is not in the archive", holder);
                report.skipped += 1;
                continue;
            }
            if !rt.klass(holder).state.is_loaded() {
                match rt.load_class(holder) {
                    Ok(()) => report.preloaded += 1,
                    Err(e) => {
                        self.failed(rt, &mut report, "preload", holder, &e);
                        continue;
                    }
                }
            }
            match *entry {
                InitInfo::ClassInit { holder, state } => self.replay_class_init(rt, &mut report, holder, state),
                InitInfo::FieldInit { .. } | InitInfo::Invalid => {}
                InitInfo::InvokeDynamic { holder, index } => self.replay_indy(rt, &mut report, holder, index),
                InitInfo::InvokeHandle { holder, method, bci } => {
                    self.replay_invokehandle(rt, &mut report, holder, method, bci)
                }
            }
        }
        info!(
            target: "cds",
            "Preload finished: preloaded {}, prelinked {}, pre-initialized {}",
            report.preloaded,
            report.prelinked,
            report.preinitialized
        );
        report
    }

    fn failed(&self, rt: &Runtime, report: &mut ReplayReport, step: &str, holder: KlassId, e: &RuntimeError) {
        info!(target: "cds", "{} of {} failed: {}", step, rt.klass(holder).external_name(), e);
        report.failures += 1;
    }

    fn replay_class_init(&self, rt: &mut Runtime, report: &mut ReplayReport, holder: KlassId, state: ClassState) {
        if self.flags.contains(ReplayFlags::PRELINK)
            && state >= ClassState::BeingLinked
            && !rt.klass(holder).state.is_linked()
        {
            match rt.link_class(holder) {
                Ok(()) => report.prelinked += 1,
                Err(e) => self.failed(rt, report, "Prelink", holder, &e),
            }
            if let Err(e) = rt.resolve_nest_host(holder) {
                debug!(target: "cds", "nest host of {}: {}", rt.klass(holder).external_name(), e);
            }
        }
        if self.flags.contains(ReplayFlags::PREINIT)
            && state >= ClassState::BeingInitialized
            && !rt.klass(holder).state.is_initialized()
            && !rt.klass(holder).state.is_error()
        {
            if let Err(e) = rt.initialize_class(holder) {
                self.failed(rt, report, "Preinit", holder, &e);
            }
            let now = rt.klass(holder).state;
            if now.is_initialized() || now.is_error() {
                report.preinitialized += 1;
            }
        }
        if self.flags.contains(ReplayFlags::PRERESOLVE_CP) && rt.klass(holder).state.is_initialized() {
            report.cp_resolved += resolve_loaded_klass_constants(rt, holder);
            if let Some(&flags) = self.reflection_data.get(&holder) {
                match rt.generate_reflection_data(holder, flags) {
                    Ok(()) => report.reflection_data += 1,
                    Err(e) => self.failed(rt, report, "Reflection data", holder, &e),
                }
            }
        }
    }

    /// With pre-initialization on, call sites of classes that did not reach
    /// the initialized state are left alone.
    fn holder_ready(&self, rt: &Runtime, holder: KlassId) -> bool {
        !self.flags.contains(ReplayFlags::PREINIT) || rt.klass(holder).state.is_initialized()
    }

    fn replay_indy(&self, rt: &mut Runtime, report: &mut ReplayReport, holder: KlassId, index: u16) {
        if !self.flags.contains(ReplayFlags::PRERESOLVE_INDY) || !self.holder_ready(rt, holder) {
            return;
        }
        if rt.klass(holder).constants.cache.indys.contains_key(&index) {
            report.already_linked += 1;
            return;
        }
        match rt.resolve_indy_at(holder, index) {
            Ok(cs) => {
                debug!(
                    target: "cds::resolve",
                    "Replay: indy {} [{}] -> {}.{}",
                    rt.klass(holder).external_name(),
                    index,
                    cs.bootstrap_class,
                    cs.bootstrap_name
                );
                report.indy_resolved += 1;
            }
            Err(e) => self.failed(rt, report, "invokedynamic", holder, &e),
        }
    }

    fn replay_invokehandle(
        &self,
        rt: &mut Runtime,
        report: &mut ReplayReport,
        holder: KlassId,
        method: MethodId,
        bci: u32,
    ) {
        if !self.flags.contains(ReplayFlags::PRERESOLVE_INVOKEHANDLE) || !self.holder_ready(rt, holder) {
            return;
        }
        let linked = rt
            .method(method)
            .and_then(|m| m.call_sites.get(&bci))
            .is_some_and(|index| rt.klass(holder).constants.cache.invokehandles.contains_key(index));
        if linked {
            report.already_linked += 1;
            return;
        }
        match rt.resolve_invokehandle(method, bci) {
            Ok(_) => report.invokehandles_resolved += 1,
            Err(e) => self.failed(rt, report, "invokehandle", holder, &e),
        }
    }
}

/// Resolves the class constants of `holder` whose targets are already loaded
/// by the holder's loader. Returns how many were resolved.
fn resolve_loaded_klass_constants(rt: &mut Runtime, holder: KlassId) -> usize {
    let len = rt.klass(holder).constants.len();
    let loader = rt.klass(holder).loader;
    let mut resolved = 0;
    for index in 1..len as u16 {
        let cp = &rt.klass(holder).constants;
        if cp.tag_at(index) != CpTag::UnresolvedClass {
            continue;
        }
        let loaded = cp
            .klass_name_at(index)
            .and_then(|name| rt.find_class(loader, name))
            .is_some_and(|k| rt.klass(k).state.is_loaded());
        if loaded && rt.resolve_klass_at(holder, index).is_ok() {
            resolved += 1;
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::InitListRecorder;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::{KlassFlags, LoaderKind};
    use dumptime::DumpTimeTable;

    struct Training {
        rt: Runtime,
        fresh: Runtime,
        list: InitList,
        main: KlassId,
        site: u16,
        broken: KlassId,
    }

    /// Initializes String, HashMap and `app/Main`, links a lambda site of
    /// `app/Main`, then fails to initialize `app/Broken`.
    fn train() -> Training {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let main = KlassBuilder::new("app/Main", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let site = KlassBuilder::add_lambda_site(&mut rt, main, "run", "()Ljava/lang/Runnable;");
        let broken = KlassBuilder::new("app/Broken", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::CLINIT_FAILS)
            .build(&mut rt);
        let fresh = rt.clone();

        let string = rt.boot_class("java/lang/String").unwrap();
        let map = rt.boot_class("java/util/HashMap").unwrap();
        rt.initialize_class(string).unwrap();
        rt.initialize_class(map).unwrap();
        rt.initialize_class(main).unwrap();
        rt.resolve_indy_at(main, site).unwrap();
        assert!(rt.initialize_class(broken).is_err());

        let recorder = InitListRecorder::new();
        let events = rt.take_events();
        recorder.ingest(&rt, events);
        let list = recorder.finish(&rt, &DumpTimeTable::new());
        Training { rt, fresh, list, main, site, broken }
    }

    fn archived(rt: &Runtime) -> BTreeSet<KlassId> {
        rt.klasses.ids().collect()
    }

    #[test]
    fn test_flags_from_config() {
        let mut config = CdsConfig::default();
        assert_eq!(ReplayFlags::from_config(&config), ReplayFlags::empty());
        config.preload_archived_classes = 2;
        config.preresolve = 2;
        assert_eq!(
            ReplayFlags::from_config(&config),
            ReplayFlags::PRELINK | ReplayFlags::PREINIT | ReplayFlags::PRERESOLVE_INDY
        );
    }

    #[test]
    fn test_replay_initializes_recorded_classes() {
        let t = train();
        let mut rt = t.fresh;
        let archived = archived(&rt);
        let mut config = CdsConfig::default();
        config.preload_archived_classes = 2;
        config.preresolve = 2;

        let report = ReplayDriver::from_config(&config).replay(&mut rt, &t.list, &archived);

        for name in ["java/lang/String", "java/util/HashMap"] {
            let k = rt.boot_class(name).unwrap();
            assert!(rt.klass(k).state.is_initialized(), "{name} not initialized");
        }
        assert!(rt.klass(t.main).state.is_initialized());
        assert!(rt.klass(t.main).constants.cache.indys.contains_key(&t.site));
        assert!(rt.klass(t.broken).state.is_error());
        assert_eq!(report.indy_resolved, 1);
        assert_eq!(report.failures, 1);
        assert!(report.preinitialized >= 4);
    }

    #[test]
    fn test_replay_without_flags_only_loads() {
        let t = train();
        let mut rt = t.fresh;
        let archived = archived(&rt);
        let report = ReplayDriver::new(ReplayFlags::empty()).replay(&mut rt, &t.list, &archived);
        assert_eq!(report.preinitialized, 0);
        assert!(!rt.klass(t.main).state.is_initialized());
        assert!(rt.klass(t.main).constants.cache.indys.is_empty());
    }

    #[test]
    fn test_replay_with_every_flag_never_aborts() {
        let t = train();
        let all = ReplayFlags::all();

        // Replaying into the training runtime itself finds everything linked.
        let mut rt = t.rt;
        let archived_all = archived(&rt);
        let report = ReplayDriver::new(all).replay(&mut rt, &t.list, &archived_all);
        assert_eq!(report.indy_resolved, 0);
        assert_eq!(report.already_linked, 1);

        // A partial archive skips the missing holders.
        let mut rt = t.fresh;
        let mut partial = archived(&rt);
        partial.remove(&t.main);
        let report = ReplayDriver::new(all).replay(&mut rt, &t.list, &partial);
        assert!(report.skipped >= 2);
        assert!(rt.klass(t.main).constants.cache.indys.is_empty());
    }

    #[test]
    fn test_resolving_constants_regenerates_reflection_data() {
        let t = train();
        let mut rt = t.fresh;
        let archived = archived(&rt);
        let flags = ReplayFlags::PRELINK | ReplayFlags::PREINIT | ReplayFlags::PRERESOLVE_CP;
        let driver = ReplayDriver::new(flags).with_reflection_data(BTreeMap::from([(t.main, 0x5)]));

        let report = driver.replay(&mut rt, &t.list, &archived);

        assert_eq!(rt.klass(t.main).reflection_data, Some(0x5));
        assert_eq!(report.reflection_data, 1);
        let string = rt.boot_class("java/lang/String").unwrap();
        assert_eq!(rt.klass(string).reflection_data, None);
    }

    #[test]
    fn test_invalid_entries_are_passed_over() {
        let t = train();
        let archived = archived(&t.fresh);
        let mut entries = vec![InitInfo::Invalid];
        entries.extend(t.list.entries().iter().cloned());
        entries.push(InitInfo::Invalid);
        let padded = InitList::new(entries);

        let mut plain_rt = t.fresh.clone();
        let plain = ReplayDriver::new(ReplayFlags::all()).replay(&mut plain_rt, &t.list, &archived);
        let mut rt = t.fresh;
        let report = ReplayDriver::new(ReplayFlags::all()).replay(&mut rt, &padded, &archived);
        assert_eq!(report, plain);
        assert_eq!(report.failures, 1);
        assert!(rt.klass(t.main).state.is_initialized());
    }

    #[test]
    fn test_preload_all_links_builtin_classes() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let main = KlassBuilder::new("app/Main", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let archived = archived(&rt);
        let mut config = CdsConfig::default();
        config.preload_shared_classes = true;
        config.prelink_shared_classes = true;
        let (_, linked) = ReplayDriver::from_config(&config).preload_all(&mut rt, &archived);
        assert!(linked > 0);
        assert!(rt.klass(main).state.is_linked());
    }
}
