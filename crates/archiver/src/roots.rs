//! Static-field roots of the archived heap and the roots array.

use crate::ArchiverError;
use common::{KlassId, LoaderKind, ObjectId, Runtime};
use dumptime::DumpTimeTable;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootGroup {
    Default,
    FullModuleGraph,
}

/// A `(holder, field)` pair whose value is archived as a subgraph root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootField {
    pub holder: &'static str,
    pub field: &'static str,
}

const fn root(holder: &'static str, field: &'static str) -> RootField {
    RootField { holder, field }
}

pub const DEFAULT_ROOT_FIELDS: &[RootField] = &[
    root("java/lang/Integer$IntegerCache", "archivedCache"),
    root("java/lang/Long$LongCache", "archivedCache"),
    root("java/lang/Byte$ByteCache", "archivedCache"),
    root("java/lang/Short$ShortCache", "archivedCache"),
    root("java/lang/Character$CharacterCache", "archivedCache"),
    root("java/util/jar/Attributes$Name", "KNOWN_NAMES"),
    root("sun/util/locale/BaseLocale", "constantBaseLocales"),
    root("jdk/internal/module/ArchivedModuleGraph", "archivedModuleGraph"),
    root("java/util/ImmutableCollections", "archivedObjects"),
    root("java/lang/ModuleLayer", "EMPTY_LAYER"),
    root("java/lang/module/Configuration", "EMPTY_CONFIGURATION"),
    root("jdk/internal/math/FDBigInteger", "archivedCaches"),
    root("java/lang/invoke/DirectMethodHandle", "archivedObjects"),
    root("java/lang/invoke/MethodType", "archivedObjects"),
    root("java/lang/invoke/LambdaForm$NamedFunction", "archivedObjects"),
];

pub const FMG_ROOT_FIELDS: &[RootField] = &[
    root("jdk/internal/loader/ArchivedClassLoaders", "archivedClassLoaders"),
    root("jdk/internal/module/ArchivedBootLayer", "archivedBootLayer"),
    root("java/lang/Module$ArchivedData", "archivedData"),
];

/// A root field bound to its holder class and static slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRootField {
    pub holder: KlassId,
    pub slot: u32,
    pub field: &'static str,
    pub group: RootGroup,
}

/// Binds each entry of `fields` to `(holder, slot)`.
///
/// Holders the training run never loaded, and excluded holders, are skipped.
/// A loaded holder whose field is missing, not static, or not a reference is an
/// error.
pub fn resolve_root_fields(
    rt: &Runtime,
    table: &DumpTimeTable,
    fields: &[RootField],
    group: RootGroup,
) -> Result<Vec<ResolvedRootField>, ArchiverError> {
    let mut out = Vec::with_capacity(fields.len());
    for rf in fields {
        let holder = rt
            .boot_class(rf.holder)
            .or_else(|| rt.find_class(LoaderKind::App, rf.holder));
        let Some(holder) = holder else {
            info!(target: "cds::heap", "Skipping {}::{}: class not loaded", rf.holder, rf.field);
            continue;
        };
        if table.is_excluded(holder) {
            info!(target: "cds::heap", "Skipping {}::{}: class is excluded", rf.holder, rf.field);
            continue;
        }
        let klass = rt.klass(holder);
        let unresolvable = |reason| ArchiverError::UnresolvableRootField {
            holder: klass.external_name(),
            field: rf.field.to_string(),
            reason,
        };
        let Some(f) = klass.fields.iter().find(|f| f.name == rf.field) else {
            return Err(unresolvable("no such field"));
        };
        if !f.is_static() {
            return Err(unresolvable("not a static field"));
        }
        if !f.is_reference() {
            return Err(unresolvable("not a reference field"));
        }
        let (slot, _) = klass
            .find_static_field(rf.field, Some(&f.signature))
            .ok_or_else(|| unresolvable("no such field"))?;
        out.push(ResolvedRootField {
            holder,
            slot: slot as u32,
            field: rf.field,
            group,
        });
    }
    Ok(out)
}

/// Append-only roots array. Appending an object that is already a root returns
/// its existing index, so that repeated archiving of a root is stable.
#[derive(Debug, Clone, Default)]
pub struct RootsArray {
    roots: Vec<Option<ObjectId>>,
    index: HashMap<ObjectId, u32>,
}

impl RootsArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, obj: Option<ObjectId>) -> u32 {
        if let Some(o) = obj {
            if let Some(&i) = self.index.get(&o) {
                return i;
            }
        }
        let i = self.roots.len() as u32;
        self.roots.push(obj);
        if let Some(o) = obj {
            self.index.insert(o, i);
        }
        i
    }

    pub fn get(&self, index: u32) -> Option<ObjectId> {
        self.roots.get(index as usize).copied().flatten()
    }

    pub fn index_of(&self, obj: ObjectId) -> Option<u32> {
        self.index.get(&obj).copied()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn as_slice(&self) -> &[Option<ObjectId>] {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::FieldFlags;

    #[test]
    fn test_roots_append_is_stable() {
        let mut roots = RootsArray::new();
        assert_eq!(roots.append(Some(ObjectId(4))), 0);
        assert_eq!(roots.append(None), 1);
        assert_eq!(roots.append(Some(ObjectId(4))), 0);
        assert_eq!(roots.append(None), 2);
        assert_eq!(roots.get(0), Some(ObjectId(4)));
        assert_eq!(roots.get(1), None);
        assert_eq!(roots.len(), 3);
    }

    #[test]
    fn test_unloaded_holders_are_skipped() {
        let rt = KlassBuilder::bootstrap_runtime();
        let table = DumpTimeTable::new();
        let resolved = resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).unwrap();
        let cache = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        assert!(resolved.iter().any(|r| r.holder == cache && r.field == "archivedCache"));
        assert!(resolved.iter().all(|r| rt.klasses.name(r.holder) != "java/lang/ModuleLayer"));
    }

    #[test]
    fn test_method_handle_caches_resolve() {
        let rt = KlassBuilder::bootstrap_runtime();
        let table = DumpTimeTable::new();
        let resolved = resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).unwrap();
        for holder in [
            "java/lang/invoke/DirectMethodHandle",
            "java/lang/invoke/MethodType",
            "java/lang/invoke/LambdaForm$NamedFunction",
        ] {
            let k = rt.boot_class(holder).unwrap();
            assert!(
                resolved.iter().any(|r| r.holder == k && r.field == "archivedObjects"),
                "{holder} not resolved"
            );
        }
    }

    #[test]
    fn test_missing_root_field_is_fatal() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        KlassBuilder::new("java/lang/ModuleLayer", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let table = DumpTimeTable::new();
        let err = resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).unwrap_err();
        assert!(matches!(
            err,
            ArchiverError::UnresolvableRootField { reason: "no such field", .. }
        ));
    }

    #[test]
    fn test_non_static_root_field_is_fatal() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        KlassBuilder::new("java/lang/ModuleLayer", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .field("EMPTY_LAYER", "Ljava/lang/ModuleLayer;")
            .build(&mut rt);
        let table = DumpTimeTable::new();
        let err = resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).unwrap_err();
        assert!(matches!(
            err,
            ArchiverError::UnresolvableRootField { reason: "not a static field", .. }
        ));
    }

    #[test]
    fn test_primitive_root_field_is_fatal() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        KlassBuilder::new("java/lang/ModuleLayer", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .static_field("EMPTY_LAYER", "I", FieldFlags::FINAL)
            .build(&mut rt);
        let table = DumpTimeTable::new();
        assert!(resolve_root_fields(&rt, &table, DEFAULT_ROOT_FIELDS, RootGroup::Default).is_err());
    }
}
