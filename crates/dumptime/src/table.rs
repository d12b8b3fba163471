use crate::info::{ConstraintFlags, DumpTimeClassInfo};
use common::{KlassId, LoaderKind, Runtime};
use std::collections::BTreeMap;
use tracing::trace;

/// One [`DumpTimeClassInfo`] per examined class, iterated in class-id order.
#[derive(Debug, Default)]
pub struct DumpTimeTable {
    infos: BTreeMap<KlassId, DumpTimeClassInfo>,
    preinit_reset_done: bool,
}

impl DumpTimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get(&self, k: KlassId) -> Option<&DumpTimeClassInfo> {
        self.infos.get(&k)
    }

    pub fn get_mut(&mut self, k: KlassId) -> Option<&mut DumpTimeClassInfo> {
        self.infos.get_mut(&k)
    }

    /// Returns the record of `k`, creating it on first examination.
    pub fn info_mut(&mut self, rt: &Runtime, k: KlassId) -> &mut DumpTimeClassInfo {
        self.infos.entry(k).or_insert_with(|| {
            let klass = rt.klass(k);
            trace!(target: "cds", "new dump-time info for {}", klass.name);
            DumpTimeClassInfo::new(klass)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (KlassId, &DumpTimeClassInfo)> {
        self.infos.iter().map(|(k, v)| (*k, v))
    }

    /// Whether `k` has been found excluded. Unexamined classes are not.
    pub fn is_excluded(&self, k: KlassId) -> bool {
        self.infos.get(&k).is_some_and(|i| i.is_excluded())
    }

    pub fn set_failed_verification(&mut self, rt: &Runtime, k: KlassId) {
        self.info_mut(rt, k).failed_verification = true;
    }

    pub fn set_archived_lambda_proxy(&mut self, rt: &Runtime, k: KlassId) {
        self.info_mut(rt, k).is_archived_lambda_proxy = true;
    }

    /// Records a verification constraint. Only unregistered classes keep them:
    /// the constraints of built-in classes are re-resolved while archiving.
    pub fn add_verification_constraint(
        &mut self,
        rt: &Runtime,
        k: KlassId,
        target_name: &str,
        from_name: &str,
        flags: ConstraintFlags,
    ) -> bool {
        if rt.klass(k).loader != LoaderKind::Unregistered {
            return false;
        }
        self.info_mut(rt, k)
            .add_verification_constraint(target_name, from_name, flags)
    }

    pub fn add_linking_constraint(
        &mut self,
        rt: &Runtime,
        k: KlassId,
        symbol: &str,
        loader1: LoaderKind,
        loader2: LoaderKind,
    ) -> bool {
        self.info_mut(rt, k)
            .add_linking_constraint(symbol, loader1, loader2)
    }

    /// Clears memoized pre-initialization verdicts. Only the first call has an
    /// effect; returns whether this call did the reset.
    pub fn reset_preinit_check(&mut self) -> bool {
        if self.preinit_reset_done {
            return false;
        }
        for info in self.infos.values_mut() {
            info.preinit = crate::PreinitVerdict::Unknown;
        }
        self.preinit_reset_done = true;
        true
    }

    pub fn preinit_reset_done(&self) -> bool {
        self.preinit_reset_done
    }

    /// Archivable classes in class-id order.
    pub fn archivable(&self) -> impl Iterator<Item = KlassId> + '_ {
        self.infos
            .iter()
            .filter(|(_, i)| i.exclusion_checked && !i.is_excluded())
            .map(|(k, _)| *k)
    }
}
