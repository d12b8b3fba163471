//! Dump-time precompile passes and start-up forced compilation.

use crate::broker::{CompileBroker, CompileReason};
use crate::directives::Directives;
use crate::training::TrainingData;
use crate::{COMP_LEVEL_FULL_OPTIMIZATION, COMP_LEVEL_FULL_PROFILE, COMP_LEVEL_LIMITED_PROFILE, COMP_LEVEL_SIMPLE};
use common::{CdsConfig, KlassId, MethodId, Runtime};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecompileReport {
    pub compiled: usize,
    pub failed: usize,
}

pub struct Precompiler<'a> {
    config: &'a CdsConfig,
    directives: &'a Directives,
    training: &'a TrainingData,
}

impl<'a> Precompiler<'a> {
    pub fn new(config: &'a CdsConfig, directives: &'a Directives, training: &'a TrainingData) -> Self {
        Self {
            config,
            directives,
            training,
        }
    }

    fn compile_id(&self, m: MethodId, level: u8) -> Option<u32> {
        self.training.lookup(m).and_then(|mtd| mtd.compile_id_at(level))
    }

    fn is_compilable(rt: &Runtime, m: MethodId) -> bool {
        rt.method(m).is_some_and(|m| !m.is_native() && !m.is_abstract())
    }

    /// Whether a dump-time pass searching `search_level` takes `m`.
    fn include(&self, rt: &Runtime, m: MethodId, search_level: u8) -> bool {
        if !Self::is_compilable(rt, m) || self.directives.dont_precompile(rt, m) {
            return false;
        }
        self.directives.precompile_recorded(rt, m) > 0 || self.compile_id(m, search_level).is_some()
    }

    /// Stable sort by compile id at `level`; methods without one go last.
    fn sort_by_compile_id(&self, methods: &mut [MethodId], level: u8) {
        methods.sort_by_key(|&m| self.compile_id(m, level).unwrap_or(u32::MAX));
    }

    fn run_pass(
        &self,
        rt: &mut Runtime,
        broker: &mut dyn CompileBroker,
        comp_level: u8,
        search_level: u8,
        for_preload: bool,
        report: &mut PrecompileReport,
    ) {
        let mut methods: Vec<MethodId> = self
            .training
            .methods()
            .filter(|&m| self.include(rt, m, search_level))
            .collect();
        self.sort_by_compile_id(&mut methods, search_level);
        let reason = if for_preload {
            CompileReason::PrecompileForPreload
        } else {
            CompileReason::Precompile
        };
        for m in methods {
            let status = broker.compile_method(rt, m, comp_level, reason);
            let name = rt
                .method(m)
                .map(|method| format!("{}::{}", rt.klass(method.holder).external_name(), method.name_and_sig()))
                .unwrap_or_default();
            match status {
                Ok(()) => report.compiled += 1,
                Err(ref e) => {
                    debug!(target: "precompile", "{}", e);
                    report.failed += 1;
                }
            }
            info!(
                target: "precompile",
                "[{:4}] T{} Compiled {} ({})",
                report.compiled + report.failed,
                comp_level + u8::from(for_preload),
                name,
                if status.is_ok() { "success" } else { "FAILED" }
            );
        }
    }

    /// The dump-time passes: a preload pass at full optimization, then one pass
    /// per level with the full-profile level compiled at limited profile.
    pub fn compile_cached_code(&self, rt: &mut Runtime, broker: &mut dyn CompileBroker) -> PrecompileReport {
        let mut report = PrecompileReport::default();
        if !self.training.have_data() {
            return report;
        }
        self.run_pass(
            rt,
            broker,
            COMP_LEVEL_FULL_OPTIMIZATION,
            COMP_LEVEL_FULL_OPTIMIZATION,
            true,
            &mut report,
        );
        for level in COMP_LEVEL_SIMPLE..=COMP_LEVEL_FULL_OPTIMIZATION {
            let comp_level = if level == COMP_LEVEL_FULL_PROFILE {
                COMP_LEVEL_LIMITED_PROFILE
            } else {
                level
            };
            self.run_pass(rt, broker, comp_level, level, false, &mut report);
        }
        report
    }

    /// Start-up compilation of recorded methods, after the init list replay.
    ///
    /// A method is compiled only when its holder is initialized, or merely
    /// linked when classes are not pre-initialized. With
    /// `ForcePrecompilation` every method of the `archived` classes is a
    /// candidate. Returns the number of methods submitted.
    pub fn force_compilation(
        &self,
        rt: &mut Runtime,
        archived: &BTreeSet<KlassId>,
        broker: &mut dyn CompileBroker,
        recompile: bool,
    ) -> usize {
        let mut methods: Vec<MethodId> = self.training.methods().collect();
        if self.config.force_precompilation {
            let seen: BTreeSet<MethodId> = methods.iter().copied().collect();
            for &k in archived {
                if rt.klasses.get(k).is_none() || !rt.klass(k).is_builtin() {
                    continue;
                }
                methods.extend(rt.klass(k).methods.iter().filter(|m| !seen.contains(*m)));
            }
        }
        methods.retain(|&m| Self::is_compilable(rt, m));
        methods.sort_by_key(|&m| {
            self.training
                .lookup(m)
                .and_then(|mtd| mtd.last_compile_id())
                .unwrap_or(u32::MAX)
        });

        let preinit = self.config.preload_archived_classes > 1 || recompile;
        let max_level = self.config.precompile_level.min(COMP_LEVEL_FULL_OPTIMIZATION);
        let mut count = 0;
        for m in methods {
            let Some(method) = rt.method(m) else { continue };
            let holder = method.holder;
            let name = method.name_and_sig();
            let state = rt.klass(holder).state;
            let mut cid = self.compile_id(m, COMP_LEVEL_FULL_OPTIMIZATION);
            let mut level = max_level;
            if !(state.is_initialized() || (!preinit && state.is_linked())) {
                debug!(
                    target: "precompile",
                    "Precompile skipped (not initialized: {}) {} at level {}",
                    state.name(),
                    name,
                    level
                );
                continue;
            }
            if cid.is_none() && !self.config.force_precompile_level {
                cid = self.training.lookup(m).and_then(|mtd| mtd.last_compile_id());
                level = max_level.min(COMP_LEVEL_LIMITED_PROFILE);
            }
            let compile = (cid.is_some() && !self.directives.dont_precompile(rt, m))
                || self.config.force_precompilation;
            if !compile {
                level = self.directives.precompile_recorded(rt, m);
                if level == 0 {
                    continue;
                }
                debug!(target: "precompile", "Precompile (forced) {:?} {} at level {}", cid, name, level);
            } else {
                debug!(target: "precompile", "Precompile {:?} {} at level {}", cid, name, level);
            }
            count += 1;
            if !recompile {
                if let Some(method) = rt.methods.get_mut(m.index()) {
                    method.code_level = None;
                }
            }
            if let Err(e) = broker.compile_method(rt, m, level, CompileReason::Recorded) {
                info!(target: "precompile", "Precompile failed {:?} {} at level {}: {}", cid, name, level, e);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InstallingBroker;
    use crate::directives::Directive;
    use crate::training::{CompileRecord, MethodTrainingData};
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::{LoaderKind, MethodFlags};

    struct Fixture {
        rt: Runtime,
        main: KlassId,
        training: TrainingData,
    }

    fn mtd(name: &str, compiles: &[(u8, u32)]) -> MethodTrainingData {
        MethodTrainingData {
            holder: "app/Main".to_string(),
            name: name.to_string(),
            signature: "()V".to_string(),
            compiles: compiles
                .iter()
                .map(|&(level, compile_id)| CompileRecord { level, compile_id })
                .collect(),
            method: None,
        }
    }

    fn fixture() -> Fixture {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let main = KlassBuilder::new("app/Main", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .method("late", "()V", MethodFlags::empty())
            .method("early", "()V", MethodFlags::empty())
            .method("warm", "()V", MethodFlags::empty())
            .method("slowPath", "()V", MethodFlags::empty())
            .method("bridge", "()V", MethodFlags::NATIVE)
            .method("cold", "()V", MethodFlags::empty())
            .build(&mut rt);
        rt.link_class(main).unwrap();
        let mut training = TrainingData::new(vec![
            mtd("late", &[(4, 30)]),
            mtd("early", &[(4, 10)]),
            mtd("warm", &[(3, 5)]),
            mtd("slowPath", &[(4, 1)]),
            mtd("bridge", &[(4, 2)]),
            mtd("cold", &[]),
        ]);
        training.bind(&rt);
        Fixture { rt, main, training }
    }

    fn names(rt: &Runtime, tasks: &[crate::CompileTask]) -> Vec<(String, u8)> {
        tasks
            .iter()
            .map(|t| (rt.method(t.method).unwrap().name.clone(), t.level))
            .collect()
    }

    #[test]
    fn test_dump_passes_follow_recorded_order() {
        let mut fx = fixture();
        let config = CdsConfig::default();
        let directives = Directives::new(vec![Directive::parse("DontPrecompile,app/Main::slow*").unwrap()]);
        let mut broker = InstallingBroker::new();
        let report = Precompiler::new(&config, &directives, &fx.training).compile_cached_code(&mut fx.rt, &mut broker);

        assert_eq!(
            names(&fx.rt, &broker.tasks),
            vec![
                ("early".to_string(), 4),
                ("late".to_string(), 4),
                ("warm".to_string(), 2),
                ("early".to_string(), 4),
                ("late".to_string(), 4),
            ]
        );
        assert_eq!(broker.tasks[0].reason, CompileReason::PrecompileForPreload);
        assert_eq!(broker.tasks[2].reason, CompileReason::Precompile);
        assert_eq!(report, PrecompileReport { compiled: 5, failed: 0 });
    }

    #[test]
    fn test_recorded_directive_includes_untrained_method() {
        let mut fx = fixture();
        let config = CdsConfig::default();
        let directives = Directives::new(vec![Directive::parse("PrecompileRecorded=1,app/Main::cold").unwrap()]);
        let mut broker = InstallingBroker::new();
        Precompiler::new(&config, &directives, &fx.training).compile_cached_code(&mut fx.rt, &mut broker);
        let cold = fx.rt.find_method(fx.main, "cold", "()V").unwrap();
        // Taken by every pass, after the methods with compile ids.
        assert_eq!(broker.tasks.iter().filter(|t| t.method == cold).count(), 5);
    }

    #[test]
    fn test_force_compilation_requires_initialized_holder() {
        let mut fx = fixture();
        let mut config = CdsConfig::default();
        config.precompile_level = 4;
        config.preload_archived_classes = 2;
        let directives = Directives::default();
        let archived: BTreeSet<KlassId> = fx.rt.klasses.ids().collect();
        let mut broker = InstallingBroker::new();

        let pre = Precompiler::new(&config, &directives, &fx.training);
        assert_eq!(pre.force_compilation(&mut fx.rt, &archived, &mut broker, false), 0);

        fx.rt.initialize_class(fx.main).unwrap();
        let count = pre.force_compilation(&mut fx.rt, &archived, &mut broker, false);
        assert_eq!(count, 4);
        assert_eq!(
            names(&fx.rt, &broker.tasks),
            vec![
                ("slowPath".to_string(), 4),
                ("warm".to_string(), 2),
                ("early".to_string(), 4),
                ("late".to_string(), 4),
            ]
        );
        let early = fx.rt.find_method(fx.main, "early", "()V").unwrap();
        assert_eq!(fx.rt.method(early).unwrap().code_level, Some(4));
    }

    #[test]
    fn test_force_precompilation_takes_every_archived_method() {
        let mut fx = fixture();
        let mut config = CdsConfig::default();
        config.precompile_level = 1;
        config.force_precompilation = true;
        let directives = Directives::default();
        let archived: BTreeSet<KlassId> = [fx.main].into_iter().collect();
        let mut broker = InstallingBroker::new();
        let count = Precompiler::new(&config, &directives, &fx.training)
            .force_compilation(&mut fx.rt, &archived, &mut broker, false);
        assert_eq!(count, 5);
        assert!(broker.tasks.iter().all(|t| t.level == 1));
    }
}
