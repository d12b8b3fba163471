//! Dump-time scratchpad of a single class.

use bitflags::bitflags;
use common::{Klass, KlassFlags, KlassId, LoaderKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreinitVerdict {
    #[default]
    Unknown,
    Ok,
    No,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ConstraintFlags: u8 {
        const FROM_FIELD_PROTECTED = 1 << 0;
        const FROM_IS_ARRAY = 1 << 1;
        const FROM_IS_OBJECT = 1 << 2;
    }
}

/// "`from_name` must be assignable to `target_name`", checked when the class is
/// loaded from the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerificationConstraint {
    pub target_name: String,
    pub from_name: String,
    pub flags: ConstraintFlags,
}

/// `symbol` must resolve to the same class in both loaders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkingConstraint {
    pub symbol: String,
    pub loader1: LoaderKind,
    pub loader2: LoaderKind,
}

#[derive(Debug, Clone, Default)]
pub struct DumpTimeClassInfo {
    excluded: bool,
    pub exclusion_checked: bool,
    pub exclusion_reason: Option<String>,
    pub failed_verification: bool,
    pub is_archived_lambda_proxy: bool,
    pub nest_host: Option<KlassId>,
    pub verification_constraints: Vec<VerificationConstraint>,
    pub linking_constraints: Vec<LinkingConstraint>,
    /// Root indices of the enum class's static reference fields.
    pub enum_static_roots: Vec<i32>,
    pub preinit: PreinitVerdict,
    pub forced_preinit: bool,
    pub classfile_size: u32,
    pub classfile_crc32: u32,
}

impl DumpTimeClassInfo {
    /// A fresh, unchecked record for `klass`.
    pub fn new(klass: &Klass) -> Self {
        Self {
            failed_verification: klass.has_flag(KlassFlags::VERIFY_FAILS) && !klass.state.is_linked(),
            nest_host: klass.nest_host,
            classfile_size: klass.classfile.len() as u32,
            classfile_crc32: crc32fast::hash(&klass.classfile),
            ..Default::default()
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// Marks the class excluded. There is no way back.
    pub fn set_excluded(&mut self, reason: impl Into<String>) {
        if !self.excluded {
            self.excluded = true;
            self.exclusion_reason = Some(reason.into());
        }
        self.exclusion_checked = true;
    }

    /// Adds a verification constraint unless an identical one exists.
    pub fn add_verification_constraint(
        &mut self,
        target_name: &str,
        from_name: &str,
        flags: ConstraintFlags,
    ) -> bool {
        let c = VerificationConstraint {
            target_name: target_name.to_string(),
            from_name: from_name.to_string(),
            flags,
        };
        if self.verification_constraints.contains(&c) {
            return false;
        }
        self.verification_constraints.push(c);
        true
    }

    /// Adds a linking constraint when both loaders are built-in and no identical
    /// constraint exists. Constraints involving other loaders are not cached.
    pub fn add_linking_constraint(
        &mut self,
        symbol: &str,
        loader1: LoaderKind,
        loader2: LoaderKind,
    ) -> bool {
        if !loader1.is_builtin() || !loader2.is_builtin() {
            return false;
        }
        let c = LinkingConstraint {
            symbol: symbol.to_string(),
            loader1,
            loader2,
        };
        if self.linking_constraints.contains(&c) {
            return false;
        }
        self.linking_constraints.push(c);
        true
    }
}
