//! # Pre-initialization Predicate
//!
//! A class may be archived in the initialized state when re-running its
//! initializer in a fresh process could not produce different static values:
//! it has no initializer at all (or is a lambda-form class, or is on the forced
//! list), every static still holds its declared default, and the same holds for
//! all of its supertypes.
//!
//! Verdicts are memoized in the dump-time table and cleared exactly once
//! ([`DumpTimeTable::reset_preinit_check`]) between the training-time use and the
//! mirror freeze, since code that ran in between may have written statics.

use crate::info::PreinitVerdict;
use crate::table::DumpTimeTable;
use common::{ConstantValue, HiddenKind, KlassId, ObjectBody, Runtime, Value};
use tracing::{debug, trace};

/// Classes whose initializers are known to be safe to run at dump time.
pub const FORCED_PREINIT_CLASSES: &[&str] = &[
    "java/util/HexFormat",
    "jdk/internal/util/ClassFileDumper",
    "java/lang/reflect/ClassFileFormatVersion",
    "java/lang/Character$CharacterCache",
    "java/lang/invoke/Invokers",
    "java/lang/invoke/Invokers$Holder",
    "java/lang/invoke/MethodHandle",
    "java/lang/invoke/MethodHandleStatics",
    "java/lang/invoke/DelegatingMethodHandle",
    "java/lang/invoke/DelegatingMethodHandle$Holder",
    "java/lang/invoke/LambdaForm",
    "java/lang/invoke/LambdaForm$NamedFunction",
    "java/lang/invoke/ClassSpecializer",
    "java/lang/invoke/DirectMethodHandle",
    "java/lang/invoke/DirectMethodHandle$Holder",
    "java/lang/invoke/BoundMethodHandle$Specializer",
    "java/lang/invoke/MethodHandles$Lookup",
];

/// Marks the boot classes of [`FORCED_PREINIT_CLASSES`] that exist in `rt`.
pub fn apply_forced_list(rt: &Runtime, table: &mut DumpTimeTable) -> usize {
    let mut n = 0;
    for name in FORCED_PREINIT_CLASSES {
        if let Some(k) = rt.boot_class(name) {
            table.info_mut(rt, k).forced_preinit = true;
            n += 1;
        }
    }
    debug!(target: "cds", "{} classes forced pre-initializable", n);
    n
}

fn holds_default(rt: &Runtime, current: Value, declared: Option<&ConstantValue>, reference: bool) -> bool {
    match (declared, current) {
        (None, Value::Null) => reference,
        (None, Value::Prim(v)) => !reference && v == 0,
        (None, Value::Ref(_)) => false,
        (Some(ConstantValue::Prim(d)), Value::Prim(v)) => *d == v,
        (Some(ConstantValue::Str(d)), Value::Ref(obj)) => {
            matches!(rt.heap.get(obj).map(|o| &o.body), Some(ObjectBody::Str { value }) if value == d)
        }
        _ => false,
    }
}

/// Every static of an initialized class still holds its declared default.
fn statics_unchanged(rt: &Runtime, k: KlassId) -> bool {
    let klass = rt.klass(k);
    if !klass.state.is_initialized() {
        return true;
    }
    klass.static_fields().all(|(slot, f)| {
        let current = rt.static_value(k, slot).unwrap_or_default();
        let ok = holds_default(rt, current, f.constant_value.as_ref(), f.is_reference());
        if !ok {
            trace!(target: "cds", "{}.{} has been modified", klass.name, f.name);
        }
        ok
    })
}

pub fn can_be_preinited(rt: &Runtime, table: &mut DumpTimeTable, k: KlassId) -> bool {
    match table.info_mut(rt, k).preinit {
        PreinitVerdict::Ok => return true,
        PreinitVerdict::No => return false,
        PreinitVerdict::Unknown => {}
    }
    // Provisional answer while the supertypes are checked.
    table.info_mut(rt, k).preinit = PreinitVerdict::No;

    let klass = rt.klass(k);
    let ok = klass.is_builtin()
        && rt
            .klasses
            .direct_supertypes(k)
            .into_iter()
            .all(|s| can_be_preinited(rt, table, s))
        && (klass.hidden_kind() == Some(HiddenKind::LambdaForm)
            || table.info_mut(rt, k).forced_preinit
            || (!klass.has_flag(common::KlassFlags::HAS_CLINIT) && statics_unchanged(rt, k)));

    table.info_mut(rt, k).preinit = if ok { PreinitVerdict::Ok } else { PreinitVerdict::No };
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::{FieldFlags, KlassFlags, LoaderKind};

    #[test]
    fn test_class_without_initializer() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let k = KlassBuilder::new("app/Plain", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .static_field("count", "I", FieldFlags::empty())
            .static_field_constant("NAME", "Ljava/lang/String;", ConstantValue::Str("x".into()))
            .build(&mut rt);
        rt.initialize_class(k).unwrap();
        let mut table = DumpTimeTable::new();
        assert!(can_be_preinited(&rt, &mut table, k));
    }

    #[test]
    fn test_modified_static_blocks_preinit() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let k = KlassBuilder::new("app/Counter", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .static_field("count", "I", FieldFlags::empty())
            .build(&mut rt);
        rt.initialize_class(k).unwrap();
        rt.set_static_value(k, 0, Value::Prim(3));
        let mut table = DumpTimeTable::new();
        assert!(!can_be_preinited(&rt, &mut table, k));
    }

    #[test]
    fn test_initializer_blocks_unless_forced() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let k = KlassBuilder::new("java/util/HexFormat", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::HAS_CLINIT)
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        assert!(!can_be_preinited(&rt, &mut table, k));

        let mut table = DumpTimeTable::new();
        apply_forced_list(&rt, &mut table);
        assert!(can_be_preinited(&rt, &mut table, k));
    }

    #[test]
    fn test_super_must_qualify() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        KlassBuilder::new("app/Base", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .flags(KlassFlags::HAS_CLINIT)
            .build(&mut rt);
        let sub = KlassBuilder::new("app/Sub", LoaderKind::App)
            .super_class(&rt, "app/Base")
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        assert!(!can_be_preinited(&rt, &mut table, sub));
    }

    #[test]
    fn test_unregistered_never_preinited() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let k = KlassBuilder::new("custom/C", LoaderKind::Unregistered)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let mut table = DumpTimeTable::new();
        assert!(!can_be_preinited(&rt, &mut table, k));
    }

    #[test]
    fn test_preinited_statics_match_a_fresh_initialization() {
        let build = |rt: &mut Runtime| {
            KlassBuilder::new("app/Limits", LoaderKind::App)
                .super_class(rt, OBJECT_CLASS)
                .static_field("count", "I", FieldFlags::empty())
                .static_field_constant("MAX", "J", ConstantValue::Prim(7))
                .static_field("next", "Ljava/lang/Object;", FieldFlags::empty())
                .build(rt)
        };
        let mut trained = KlassBuilder::bootstrap_runtime();
        let k = build(&mut trained);
        trained.initialize_class(k).unwrap();
        let mut table = DumpTimeTable::new();
        assert!(can_be_preinited(&trained, &mut table, k));

        let mut fresh = KlassBuilder::bootstrap_runtime();
        let f = build(&mut fresh);
        fresh.initialize_class(f).unwrap();
        for (slot, field) in trained.klass(k).static_fields() {
            assert_eq!(
                trained.static_value(k, slot),
                fresh.static_value(f, slot),
                "{} differs",
                field.name
            );
        }
    }

    #[test]
    fn test_verdict_recomputed_after_reset() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let k = KlassBuilder::new("app/Counter", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .static_field("count", "I", FieldFlags::empty())
            .build(&mut rt);
        rt.initialize_class(k).unwrap();
        let mut table = DumpTimeTable::new();
        assert!(can_be_preinited(&rt, &mut table, k));
        rt.set_static_value(k, 0, Value::Prim(1));
        assert!(can_be_preinited(&rt, &mut table, k));
        table.reset_preinit_check();
        assert!(!can_be_preinited(&rt, &mut table, k));
    }
}
