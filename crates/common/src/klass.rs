//! # Klass: Class Metadata and the Class Arena
//!
//! A class is identified by `(defining loader, binary name)`. The arena hands out
//! [`KlassId`]s in load order and keeps a name index per loader.
//!
//! Kinds are a tagged variant ([`KlassKind`]); the few places where the kind
//! matters (`is_hidden`, array element lookup, allowed-class checks) `match` on it.

use crate::constant_pool::ConstantPool;
use crate::heap::ObjectId;
use crate::{BasicType, ClassState, KlassId, LoaderKind, MethodId};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Index, IndexMut};

/// Oldest class-file major version the split verifier handles (Java 6).
pub const SPLIT_VERIFIER_MAJOR_VERSION: u16 = 50;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KlassFlags: u32 {
        const INTERFACE = 1 << 0;
        const FINAL = 1 << 1;
        const ENUM = 1 << 2;
        /// Replaced through the redefinition interface.
        const REDEFINED = 1 << 3;
        /// Dump-time shadow created by the archiver itself.
        const SCRATCH = 1 << 4;
        /// Carries code signers.
        const SIGNED = 1 << 5;
        /// Subclass of the flight-recorder event base class.
        const JFR_EVENT = 1 << 6;
        /// Declares a `<clinit>` method.
        const HAS_CLINIT = 1 << 7;
        /// The class initializer throws.
        const CLINIT_FAILS = 1 << 8;
        /// The VM injects hidden instance fields into this class.
        const HAS_INJECTED_FIELDS = 1 << 9;
        /// Verification of this class fails.
        const VERIFY_FAILS = 1 << 10;
        /// Loaded before the early start-up phase ended.
        const EARLY = 1 << 11;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FieldFlags: u8 {
        const STATIC = 1 << 0;
        const FINAL = 1 << 1;
        /// Holds a raw metadata address rather than a Java value.
        const NATIVE_ADDRESS = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HiddenKind {
    LambdaProxy,
    LambdaForm,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlassKind {
    Instance,
    Hidden(HiddenKind),
    ObjArray { element: KlassId },
    TypeArray { element: BasicType },
}

/// Compile-time constant of a field (the `ConstantValue` attribute), or the value
/// the class initializer stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstantValue {
    Prim(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub flags: FieldFlags,
    /// `ConstantValue` attribute; installed when the class is linked.
    #[serde(default)]
    pub constant_value: Option<ConstantValue>,
    /// Value the class initializer assigns, if it assigns one.
    #[serde(default)]
    pub init_value: Option<ConstantValue>,
}

impl FieldInfo {
    pub fn new(name: &str, signature: &str, flags: FieldFlags) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            flags,
            constant_value: None,
            init_value: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(FieldFlags::FINAL)
    }

    pub fn basic_type(&self) -> BasicType {
        BasicType::from_signature(&self.signature).unwrap_or(BasicType::Object)
    }

    pub fn is_reference(&self) -> bool {
        self.basic_type().is_reference()
    }
}

fn default_major_version() -> u16 {
    61
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Klass {
    /// Internal binary name, e.g. `java/lang/Object`.
    pub name: String,
    pub loader: LoaderKind,
    pub kind: KlassKind,
    #[serde(default)]
    pub state: ClassState,
    #[serde(default)]
    pub flags: KlassFlags,
    #[serde(default)]
    pub super_klass: Option<KlassId>,
    #[serde(default)]
    pub interfaces: Vec<KlassId>,
    /// Declared fields (static and instance) in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub methods: Vec<MethodId>,
    #[serde(default)]
    pub constants: ConstantPool,
    #[serde(default)]
    pub module: Option<String>,
    /// Index into the shared class path, `None` for classes loaded elsewhere.
    #[serde(default)]
    pub classpath_index: Option<u32>,
    #[serde(default = "default_major_version")]
    pub major_version: u16,
    #[serde(default)]
    pub nest_host_name: Option<String>,
    #[serde(default)]
    pub nest_host: Option<KlassId>,
    #[serde(default)]
    pub mirror: Option<ObjectId>,
    /// Raw class-file bytes as read by the loader.
    #[serde(default)]
    pub classfile: Vec<u8>,
    /// `source:` path for unregistered classes.
    #[serde(default)]
    pub source: Option<String>,
    /// Flags of the reflection data generated for this class, once generated.
    #[serde(default)]
    pub reflection_data: Option<u32>,
}

impl Klass {
    pub fn new(name: &str, loader: LoaderKind, kind: KlassKind) -> Self {
        Self {
            name: name.to_string(),
            loader,
            kind,
            state: ClassState::Allocated,
            flags: KlassFlags::empty(),
            super_klass: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: ConstantPool::new(),
            module: None,
            classpath_index: None,
            major_version: default_major_version(),
            nest_host_name: None,
            nest_host: None,
            mirror: None,
            classfile: Vec::new(),
            source: None,
            reflection_data: None,
        }
    }

    pub fn external_name(&self) -> String {
        crate::external_name(&self.name)
    }

    pub fn is_instance(&self) -> bool {
        matches!(self.kind, KlassKind::Instance | KlassKind::Hidden(_))
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self.kind, KlassKind::Hidden(_))
    }

    pub fn hidden_kind(&self) -> Option<HiddenKind> {
        match self.kind {
            KlassKind::Hidden(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.kind,
            KlassKind::ObjArray { .. } | KlassKind::TypeArray { .. }
        )
    }

    pub fn is_type_array(&self) -> bool {
        matches!(self.kind, KlassKind::TypeArray { .. })
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(KlassFlags::INTERFACE)
    }

    pub fn is_builtin(&self) -> bool {
        self.loader.is_builtin()
    }

    pub fn in_java_base(&self) -> bool {
        self.module.as_deref() == Some("java.base")
    }

    pub fn has_flag(&self, flag: KlassFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Static fields with their slot index in the mirror.
    pub fn static_fields(&self) -> impl Iterator<Item = (usize, &FieldInfo)> {
        self.fields.iter().filter(|f| f.is_static()).enumerate()
    }

    pub fn static_field_count(&self) -> usize {
        self.fields.iter().filter(|f| f.is_static()).count()
    }

    /// Finds a static field by name (and signature, when given).
    pub fn find_static_field(&self, name: &str, signature: Option<&str>) -> Option<(usize, &FieldInfo)> {
        self.static_fields()
            .find(|(_, f)| f.name == name && signature.is_none_or(|s| s == f.signature))
    }

    /// Declared instance fields in order.
    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.is_static())
    }
}

/// Class arena with a per-loader name index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KlassTable {
    klasses: Vec<Klass>,
    #[serde(skip)]
    by_name: HashMap<(LoaderKind, String), KlassId>,
}

impl KlassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a class. A later class with the same loader and name shadows the
    /// earlier one in the name index (redefinition keeps both in the arena).
    pub fn add(&mut self, klass: Klass) -> KlassId {
        let id = KlassId(self.klasses.len() as u32);
        self.by_name.insert((klass.loader, klass.name.clone()), id);
        self.klasses.push(klass);
        id
    }

    /// Rebuilds the name index after deserialization.
    pub fn reindex(&mut self) {
        self.by_name = self
            .klasses
            .iter()
            .enumerate()
            .filter(|(_, k)| !k.has_flag(KlassFlags::SCRATCH))
            .map(|(i, k)| ((k.loader, k.name.clone()), KlassId(i as u32)))
            .collect();
    }

    pub fn get(&self, id: KlassId) -> Option<&Klass> {
        self.klasses.get(id.index())
    }

    pub fn get_mut(&mut self, id: KlassId) -> Option<&mut Klass> {
        self.klasses.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.klasses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klasses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KlassId, &Klass)> {
        self.klasses
            .iter()
            .enumerate()
            .map(|(i, k)| (KlassId(i as u32), k))
    }

    pub fn ids(&self) -> impl Iterator<Item = KlassId> {
        (0..self.klasses.len() as u32).map(KlassId)
    }

    /// Class defined by exactly `loader` under `name`.
    pub fn lookup(&self, loader: LoaderKind, name: &str) -> Option<KlassId> {
        self.by_name.get(&(loader, name.to_string())).copied()
    }

    /// Class visible to `loader` through the built-in delegation chain.
    pub fn find_visible(&self, loader: LoaderKind, name: &str) -> Option<KlassId> {
        let mut current = Some(loader);
        while let Some(l) = current {
            if let Some(id) = self.lookup(l, name) {
                return Some(id);
            }
            current = l.parent();
        }
        None
    }

    /// Boot-loader class by name.
    pub fn boot(&self, name: &str) -> Option<KlassId> {
        self.lookup(LoaderKind::Boot, name)
    }

    pub fn name(&self, id: KlassId) -> &str {
        self.get(id).map(|k| k.name.as_str()).unwrap_or("<unknown>")
    }

    /// Direct supertypes: super class first, then declared interfaces.
    pub fn direct_supertypes(&self, id: KlassId) -> Vec<KlassId> {
        let Some(k) = self.get(id) else {
            return Vec::new();
        };
        k.super_klass.iter().chain(k.interfaces.iter()).copied().collect()
    }

    /// Whether `sub` is `sup` or inherits from it through any path.
    pub fn is_subtype_of(&self, sub: KlassId, sup: KlassId) -> bool {
        let mut stack = vec![sub];
        let mut visited = std::collections::HashSet::new();
        while let Some(k) = stack.pop() {
            if k == sup {
                return true;
            }
            if visited.insert(k) {
                stack.extend(self.direct_supertypes(k));
            }
        }
        false
    }

    /// Whether `id` or any of its supertypes has been redefined.
    pub fn has_been_redefined(&self, id: KlassId) -> bool {
        let mut stack = vec![id];
        let mut visited = std::collections::HashSet::new();
        while let Some(k) = stack.pop() {
            if !visited.insert(k) {
                continue;
            }
            if self.get(k).is_some_and(|k| k.has_flag(KlassFlags::REDEFINED)) {
                return true;
            }
            stack.extend(self.direct_supertypes(k));
        }
        false
    }

    /// Instance-field layout including inherited fields, super class first.
    pub fn instance_layout(&self, id: KlassId) -> Vec<(KlassId, &FieldInfo)> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(k) = current {
            chain.push(k);
            current = self.get(k).and_then(|k| k.super_klass);
        }
        chain
            .into_iter()
            .rev()
            .filter_map(|k| self.get(k).map(|klass| (k, klass)))
            .flat_map(|(k, klass)| klass.instance_fields().map(move |f| (k, f)))
            .collect()
    }

    /// Innermost element class of an object array, or the class itself.
    pub fn bottom_klass(&self, id: KlassId) -> KlassId {
        let mut current = id;
        while let Some(KlassKind::ObjArray { element }) = self.get(current).map(|k| k.kind) {
            current = element;
        }
        current
    }
}

impl Index<KlassId> for KlassTable {
    type Output = Klass;

    fn index(&self, id: KlassId) -> &Klass {
        &self.klasses[id.index()]
    }
}

impl IndexMut<KlassId> for KlassTable {
    fn index_mut(&mut self, id: KlassId) -> &mut Klass {
        &mut self.klasses[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (KlassTable, KlassId, KlassId, KlassId, KlassId) {
        let mut t = KlassTable::new();
        let object = t.add(Klass::new("java/lang/Object", LoaderKind::Boot, KlassKind::Instance));
        let mut runnable = Klass::new("java/lang/Runnable", LoaderKind::Boot, KlassKind::Instance);
        runnable.flags |= KlassFlags::INTERFACE;
        let runnable = t.add(runnable);
        let mut a = Klass::new("A", LoaderKind::App, KlassKind::Instance);
        a.super_klass = Some(object);
        a.interfaces.push(runnable);
        let a = t.add(a);
        let mut b = Klass::new("B", LoaderKind::App, KlassKind::Instance);
        b.super_klass = Some(a);
        let b = t.add(b);
        (t, object, runnable, a, b)
    }

    #[test]
    fn test_subtype_through_interface() {
        let (t, object, runnable, a, b) = table();
        assert!(t.is_subtype_of(b, runnable));
        assert!(t.is_subtype_of(b, object));
        assert!(t.is_subtype_of(a, a));
        assert!(!t.is_subtype_of(a, b));
    }

    #[test]
    fn test_redefinition_is_transitive() {
        let (mut t, _, _, a, b) = table();
        assert!(!t.has_been_redefined(b));
        t[a].flags |= KlassFlags::REDEFINED;
        assert!(t.has_been_redefined(b));
    }

    #[test]
    fn test_find_visible_delegates_to_boot() {
        let (t, object, _, a, _) = table();
        assert_eq!(t.find_visible(LoaderKind::App, "java/lang/Object"), Some(object));
        assert_eq!(t.find_visible(LoaderKind::App, "A"), Some(a));
        assert_eq!(t.find_visible(LoaderKind::Boot, "A"), None);
    }

    #[test]
    fn test_reindex_after_deserialize() {
        let (t, _, _, a, _) = table();
        let json = serde_json::to_string(&t).unwrap();
        let mut back: KlassTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lookup(LoaderKind::App, "A"), None);
        back.reindex();
        assert_eq!(back.lookup(LoaderKind::App, "A"), Some(a));
    }

    #[test]
    fn test_instance_layout_puts_super_fields_first() {
        let (mut t, _, _, a, b) = table();
        t[a].fields.push(FieldInfo::new("x", "I", FieldFlags::empty()));
        t[a].fields.push(FieldInfo::new("S", "I", FieldFlags::STATIC));
        t[b].fields.push(FieldInfo::new("y", "J", FieldFlags::empty()));
        let names: Vec<_> = t.instance_layout(b).iter().map(|(_, f)| f.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }
}
