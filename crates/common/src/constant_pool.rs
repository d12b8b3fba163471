//! # Constant Pool
//!
//! Per-class table of symbolic references. Class entries are rewritten in place
//! from `UnresolvedClass` to `Class`; field, method and invokedynamic entries keep
//! their symbolic form and record the resolved target in the [`CpCache`].

use crate::{KlassId, MethodId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Method-handle reference kinds (JVMS 5.4.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RefKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

impl RefKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RefKind::GetField),
            2 => Some(RefKind::GetStatic),
            3 => Some(RefKind::PutField),
            4 => Some(RefKind::PutStatic),
            5 => Some(RefKind::InvokeVirtual),
            6 => Some(RefKind::InvokeStatic),
            7 => Some(RefKind::InvokeSpecial),
            8 => Some(RefKind::NewInvokeSpecial),
            9 => Some(RefKind::InvokeInterface),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpEntry {
    /// Slot 0, and the second slot of wide constants.
    Empty,
    Utf8(String),
    Integer(i32),
    String { utf8: u16 },
    UnresolvedClass { name: u16 },
    Class { name: u16, klass: KlassId },
    UnresolvedClassInError { name: u16 },
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, signature: u16 },
    MethodHandle { kind: RefKind, reference: u16 },
    MethodType { signature: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
}

/// Entry tags, numbered as in the class-file format (internal tags >= 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpTag {
    Invalid,
    Utf8,
    Integer,
    String,
    UnresolvedClass,
    Class,
    UnresolvedClassInError,
    Fieldref,
    Methodref,
    InterfaceMethodref,
    NameAndType,
    MethodHandle,
    MethodType,
    InvokeDynamic,
}

impl CpTag {
    pub fn value(self) -> u8 {
        match self {
            CpTag::Invalid => 0,
            CpTag::Utf8 => 1,
            CpTag::Integer => 3,
            CpTag::Class => 7,
            CpTag::String => 8,
            CpTag::Fieldref => 9,
            CpTag::Methodref => 10,
            CpTag::InterfaceMethodref => 11,
            CpTag::NameAndType => 12,
            CpTag::MethodHandle => 15,
            CpTag::MethodType => 16,
            CpTag::InvokeDynamic => 18,
            CpTag::UnresolvedClass => 100,
            CpTag::UnresolvedClassInError => 103,
        }
    }

    pub fn is_klass(self) -> bool {
        self == CpTag::Class
    }

    pub fn is_unresolved_klass(self) -> bool {
        matches!(self, CpTag::UnresolvedClass | CpTag::UnresolvedClassInError)
    }

    pub fn is_field_or_method(self) -> bool {
        matches!(
            self,
            CpTag::Fieldref | CpTag::Methodref | CpTag::InterfaceMethodref
        )
    }
}

impl fmt::Display for CpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpTag::Invalid => "Invalid",
            CpTag::Utf8 => "Utf8",
            CpTag::Integer => "Integer",
            CpTag::String => "String",
            CpTag::UnresolvedClass => "UnresolvedClass",
            CpTag::Class => "Class",
            CpTag::UnresolvedClassInError => "UnresolvedClassInError",
            CpTag::Fieldref => "Fieldref",
            CpTag::Methodref => "Methodref",
            CpTag::InterfaceMethodref => "InterfaceMethodref",
            CpTag::NameAndType => "NameAndType",
            CpTag::MethodHandle => "MethodHandle",
            CpTag::MethodType => "MethodType",
            CpTag::InvokeDynamic => "InvokeDynamic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapMethod {
    /// CP index of the bootstrap `MethodHandle` entry.
    pub method_handle: u16,
    /// CP indices of the static arguments.
    pub arguments: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFieldRef {
    pub holder: KlassId,
    pub slot: u32,
    pub is_static: bool,
}

/// Linked invokedynamic call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Internal name of the bootstrap method's class.
    pub bootstrap_class: String,
    pub bootstrap_name: String,
    /// Class spun for the site, when the bootstrap produces one.
    pub target: Option<KlassId>,
}

/// Resolution results for non-class entries, keyed by CP index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpCache {
    #[serde(default)]
    pub fields: BTreeMap<u16, ResolvedFieldRef>,
    #[serde(default)]
    pub methods: BTreeMap<u16, MethodId>,
    #[serde(default)]
    pub indys: BTreeMap<u16, CallSite>,
    #[serde(default)]
    pub invokehandles: BTreeMap<u16, MethodId>,
}

/// Symbolic components of a field or method reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub tag: CpTag,
    pub class_index: u16,
    pub name: &'a str,
    pub signature: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPool {
    pub entries: Vec<CpEntry>,
    #[serde(default)]
    pub bootstrap_methods: Vec<BootstrapMethod>,
    #[serde(default)]
    pub cache: CpCache,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// Creates a pool holding only the unused slot 0.
    pub fn new() -> Self {
        Self {
            entries: vec![CpEntry::Empty],
            bootstrap_methods: Vec::new(),
            cache: CpCache::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn entry(&self, index: u16) -> Option<&CpEntry> {
        self.entries.get(index as usize)
    }

    pub fn tag_at(&self, index: u16) -> CpTag {
        match self.entry(index) {
            None | Some(CpEntry::Empty) => CpTag::Invalid,
            Some(CpEntry::Utf8(_)) => CpTag::Utf8,
            Some(CpEntry::Integer(_)) => CpTag::Integer,
            Some(CpEntry::String { .. }) => CpTag::String,
            Some(CpEntry::UnresolvedClass { .. }) => CpTag::UnresolvedClass,
            Some(CpEntry::Class { .. }) => CpTag::Class,
            Some(CpEntry::UnresolvedClassInError { .. }) => CpTag::UnresolvedClassInError,
            Some(CpEntry::Fieldref { .. }) => CpTag::Fieldref,
            Some(CpEntry::Methodref { .. }) => CpTag::Methodref,
            Some(CpEntry::InterfaceMethodref { .. }) => CpTag::InterfaceMethodref,
            Some(CpEntry::NameAndType { .. }) => CpTag::NameAndType,
            Some(CpEntry::MethodHandle { .. }) => CpTag::MethodHandle,
            Some(CpEntry::MethodType { .. }) => CpTag::MethodType,
            Some(CpEntry::InvokeDynamic { .. }) => CpTag::InvokeDynamic,
        }
    }

    pub fn utf8_at(&self, index: u16) -> Option<&str> {
        match self.entry(index)? {
            CpEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Class name of a class entry, resolved or not.
    pub fn klass_name_at(&self, index: u16) -> Option<&str> {
        match self.entry(index)? {
            CpEntry::UnresolvedClass { name }
            | CpEntry::Class { name, .. }
            | CpEntry::UnresolvedClassInError { name } => self.utf8_at(*name),
            _ => None,
        }
    }

    pub fn resolved_klass_at(&self, index: u16) -> Option<KlassId> {
        match self.entry(index)? {
            CpEntry::Class { klass, .. } => Some(*klass),
            _ => None,
        }
    }

    /// Rewrites an unresolved class entry to its resolved form.
    /// Returns `false` if `index` is not a class entry.
    pub fn set_resolved_klass(&mut self, index: u16, klass: KlassId) -> bool {
        let Some(entry) = self.entries.get_mut(index as usize) else {
            return false;
        };
        match *entry {
            CpEntry::UnresolvedClass { name } | CpEntry::Class { name, .. } => {
                *entry = CpEntry::Class { name, klass };
                true
            }
            _ => false,
        }
    }

    pub fn mark_klass_in_error(&mut self, index: u16) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            if let CpEntry::UnresolvedClass { name } = *entry {
                *entry = CpEntry::UnresolvedClassInError { name };
            }
        }
    }

    /// Reverts a class entry to the unresolved form.
    pub fn unresolve_klass(&mut self, index: u16) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            if let CpEntry::Class { name, .. } = *entry {
                *entry = CpEntry::UnresolvedClass { name };
            }
        }
    }

    pub fn name_and_type_at(&self, index: u16) -> Option<(&str, &str)> {
        match self.entry(index)? {
            CpEntry::NameAndType { name, signature } => {
                Some((self.utf8_at(*name)?, self.utf8_at(*signature)?))
            }
            _ => None,
        }
    }

    pub fn member_ref_at(&self, index: u16) -> Option<MemberRef<'_>> {
        let (tag, class_index, nat) = match self.entry(index)? {
            CpEntry::Fieldref {
                class,
                name_and_type,
            } => (CpTag::Fieldref, *class, *name_and_type),
            CpEntry::Methodref {
                class,
                name_and_type,
            } => (CpTag::Methodref, *class, *name_and_type),
            CpEntry::InterfaceMethodref {
                class,
                name_and_type,
            } => (CpTag::InterfaceMethodref, *class, *name_and_type),
            _ => return None,
        };
        let (name, signature) = self.name_and_type_at(nat)?;
        Some(MemberRef {
            tag,
            class_index,
            name,
            signature,
        })
    }

    /// Bootstrap record and call-site name/type of an invokedynamic entry.
    pub fn indy_at(&self, index: u16) -> Option<(&BootstrapMethod, &str, &str)> {
        match self.entry(index)? {
            CpEntry::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                let bsm = self.bootstrap_methods.get(*bootstrap as usize)?;
                let (name, sig) = self.name_and_type_at(*name_and_type)?;
                Some((bsm, name, sig))
            }
            _ => None,
        }
    }

    /// Kind and target member of a method-handle entry.
    pub fn method_handle_at(&self, index: u16) -> Option<(RefKind, MemberRef<'_>)> {
        match self.entry(index)? {
            CpEntry::MethodHandle { kind, reference } => {
                Some((*kind, self.member_ref_at(*reference)?))
            }
            _ => None,
        }
    }

    /// Whether the entry at `index` currently holds a resolved value.
    pub fn is_resolved(&self, index: u16) -> bool {
        match self.tag_at(index) {
            CpTag::Class => true,
            CpTag::Fieldref => self.cache.fields.contains_key(&index),
            CpTag::Methodref | CpTag::InterfaceMethodref => {
                self.cache.methods.contains_key(&index)
            }
            CpTag::InvokeDynamic => self.cache.indys.contains_key(&index),
            _ => false,
        }
    }

    // ---------------------------------------------------------------------
    // construction
    // ---------------------------------------------------------------------

    pub fn push(&mut self, entry: CpEntry) -> u16 {
        self.entries.push(entry);
        (self.entries.len() - 1) as u16
    }

    /// Adds a UTF-8 entry, reusing an identical one.
    pub fn add_utf8(&mut self, s: &str) -> u16 {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| matches!(e, CpEntry::Utf8(v) if v == s))
        {
            return i as u16;
        }
        self.push(CpEntry::Utf8(s.to_string()))
    }

    /// Adds an unresolved class entry, reusing one with the same name.
    pub fn add_class(&mut self, name: &str) -> u16 {
        let utf8 = self.add_utf8(name);
        if let Some(i) = self.entries.iter().position(|e| {
            matches!(e, CpEntry::UnresolvedClass { name: n } | CpEntry::Class { name: n, .. } if *n == utf8)
        }) {
            return i as u16;
        }
        self.push(CpEntry::UnresolvedClass { name: utf8 })
    }

    pub fn add_string(&mut self, s: &str) -> u16 {
        let utf8 = self.add_utf8(s);
        self.push(CpEntry::String { utf8 })
    }

    pub fn add_name_and_type(&mut self, name: &str, signature: &str) -> u16 {
        let name = self.add_utf8(name);
        let signature = self.add_utf8(signature);
        self.push(CpEntry::NameAndType { name, signature })
    }

    pub fn add_field_ref(&mut self, class: &str, name: &str, signature: &str) -> u16 {
        let class = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, signature);
        self.push(CpEntry::Fieldref {
            class,
            name_and_type,
        })
    }

    pub fn add_method_ref(&mut self, class: &str, name: &str, signature: &str) -> u16 {
        let class = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, signature);
        self.push(CpEntry::Methodref {
            class,
            name_and_type,
        })
    }

    pub fn add_interface_method_ref(&mut self, class: &str, name: &str, signature: &str) -> u16 {
        let class = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, signature);
        self.push(CpEntry::InterfaceMethodref {
            class,
            name_and_type,
        })
    }

    pub fn add_method_handle(&mut self, kind: RefKind, reference: u16) -> u16 {
        self.push(CpEntry::MethodHandle { kind, reference })
    }

    pub fn add_method_type(&mut self, signature: &str) -> u16 {
        let signature = self.add_utf8(signature);
        self.push(CpEntry::MethodType { signature })
    }

    /// Appends a bootstrap-method record and returns its index.
    pub fn add_bootstrap(&mut self, method_handle: u16, arguments: Vec<u16>) -> u16 {
        self.bootstrap_methods.push(BootstrapMethod {
            method_handle,
            arguments,
        });
        (self.bootstrap_methods.len() - 1) as u16
    }

    pub fn add_invoke_dynamic(&mut self, bootstrap: u16, name: &str, signature: &str) -> u16 {
        let name_and_type = self.add_name_and_type(name, signature);
        self.push(CpEntry::InvokeDynamic {
            bootstrap,
            name_and_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_entry_resolution() {
        let mut cp = ConstantPool::new();
        let idx = cp.add_class("java/lang/Object");
        assert_eq!(cp.tag_at(idx), CpTag::UnresolvedClass);
        assert!(!cp.is_resolved(idx));
        assert!(cp.set_resolved_klass(idx, KlassId(0)));
        assert_eq!(cp.tag_at(idx), CpTag::Class);
        assert_eq!(cp.resolved_klass_at(idx), Some(KlassId(0)));
        assert_eq!(cp.klass_name_at(idx), Some("java/lang/Object"));
        cp.unresolve_klass(idx);
        assert_eq!(cp.tag_at(idx), CpTag::UnresolvedClass);
    }

    #[test]
    fn test_add_class_reuses_entry() {
        let mut cp = ConstantPool::new();
        let a = cp.add_class("A");
        let b = cp.add_class("A");
        assert_eq!(a, b);
    }

    #[test]
    fn test_member_ref() {
        let mut cp = ConstantPool::new();
        let f = cp.add_field_ref("A", "count", "I");
        let m = cp.member_ref_at(f).unwrap();
        assert_eq!(m.tag, CpTag::Fieldref);
        assert_eq!(m.name, "count");
        assert_eq!(m.signature, "I");
        assert_eq!(cp.klass_name_at(m.class_index), Some("A"));
    }

    #[test]
    fn test_set_resolved_rejects_non_class() {
        let mut cp = ConstantPool::new();
        let u = cp.add_utf8("x");
        assert!(!cp.set_resolved_klass(u, KlassId(1)));
        assert_eq!(cp.tag_at(200), CpTag::Invalid);
    }
}
