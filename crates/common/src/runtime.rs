//! # Runtime: Classes, Heap and Link Resolver
//!
//! **Role**: The live runtime the archiver inspects at dump time and binds into at
//! start-up. Owns the class arena, the method arena, the heap and the
//! interned-string table.
//!
//! **Design**:
//! - Lifecycle operations (`load_class`, `link_class`, `initialize_class`) and
//!   link-resolver operations (`resolve_*`) return `Result<_, RuntimeError>`.
//!   A Java exception raised by the operation is the `Err` value.
//! - Every class-reference resolution bumps [`ResolverStats`], so callers can
//!   tell a pre-resolved entry from one that went through the resolver.
//! - Training hooks are not callbacks. The runtime appends [`LifecycleEvent`]s
//!   and the dump session drains them into its init-list recorder.

use crate::constant_pool::{CallSite, CpEntry, RefKind, ResolvedFieldRef};
use crate::heap::{Heap, HeapObject, MirrorTarget, ObjectBody, ObjectId, Value};
use crate::klass::{ConstantValue, FieldInfo, HiddenKind, Klass, KlassFlags, KlassKind, KlassTable};
use crate::method::Method;
use crate::{BasicType, ClassState, KlassId, LoaderKind, MethodId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

pub const OBJECT_CLASS: &str = "java/lang/Object";
pub const CLASS_CLASS: &str = "java/lang/Class";
pub const STRING_CLASS: &str = "java/lang/String";
pub const OBJECT_ARRAY_CLASS: &str = "[Ljava/lang/Object;";
pub const LAMBDA_METAFACTORY: &str = "java/lang/invoke/LambdaMetafactory";
pub const LAMBDA_METAFACTORY_SIGNATURE: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";
pub const STRING_CONCAT_FACTORY: &str = "java/lang/invoke/StringConcatFactory";
pub const STRING_CONCAT_SIGNATURE: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/invoke/CallSite;";
pub const METHOD_HANDLE_CLASS: &str = "java/lang/invoke/MethodHandle";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("java.lang.NoClassDefFoundError: {0}")]
    NoClassDefFound(String),

    #[error("java.lang.VerifyError: {0}")]
    Verify(String),

    #[error("java.lang.LinkageError: {0}")]
    Linkage(String),

    #[error("java.lang.ExceptionInInitializerError: {0}")]
    Initializer(String),

    #[error("java.lang.NoSuchFieldError: {0}")]
    NoSuchField(String),

    #[error("java.lang.NoSuchMethodError: {0}")]
    NoSuchMethod(String),

    #[error("java.lang.BootstrapMethodError: {0}")]
    Bootstrap(String),

    #[error("invalid constant pool index {index} in {class}")]
    BadCpIndex { class: String, index: u16 },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("snapshot decode error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether this is an exception thrown by a class initializer.
    pub fn is_initializer_exception(&self) -> bool {
        matches!(self, RuntimeError::Initializer(_))
    }
}

/// Class lifecycle and resolution events observed while the runtime executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    ClassInit(KlassId, ClassState),
    /// A static final field of `KlassId` was assigned by its initializer.
    FieldInit(KlassId, u32),
    InvokeDynamic(KlassId, u16),
    InvokeHandle(MethodId, u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub class_resolutions: u64,
    pub member_resolutions: u64,
    pub indy_resolutions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runtime {
    pub klasses: KlassTable,
    #[serde(default)]
    pub methods: Vec<Method>,
    #[serde(default)]
    pub heap: Heap,
    /// Interned strings by content.
    #[serde(default)]
    pub interned: BTreeMap<String, ObjectId>,
    #[serde(default)]
    pub primitive_mirrors: Vec<(BasicType, ObjectId)>,
    /// Events not yet drained by a recorder.
    #[serde(default)]
    pub events: Vec<LifecycleEvent>,
    #[serde(skip)]
    pub stats: ResolverStats,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // snapshots
    // ---------------------------------------------------------------------

    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        let mut rt: Runtime = serde_json::from_str(json)?;
        rt.klasses.reindex();
        Ok(rt)
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_snapshot(path: &Path) -> Result<Self, RuntimeError> {
        let json = std::fs::read_to_string(path)?;
        let rt = Self::from_json(&json)?;
        debug!(
            target: "cds",
            "Loaded snapshot {}: {} classes, {} objects",
            path.display(),
            rt.klasses.len(),
            rt.heap.len()
        );
        Ok(rt)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), RuntimeError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Removes and returns all pending lifecycle events.
    pub fn take_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    // ---------------------------------------------------------------------
    // arenas
    // ---------------------------------------------------------------------

    pub fn klass(&self, id: KlassId) -> &Klass {
        &self.klasses[id]
    }

    pub fn klass_mut(&mut self, id: KlassId) -> &mut Klass {
        &mut self.klasses[id]
    }

    pub fn add_klass(&mut self, klass: Klass) -> KlassId {
        self.klasses.add(klass)
    }

    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.index())
    }

    /// Adds a method and attaches it to its holder.
    pub fn add_method(&mut self, method: Method) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        if let Some(holder) = self.klasses.get_mut(method.holder) {
            holder.methods.push(id);
        }
        self.methods.push(method);
        id
    }

    /// Class named `name` as seen by a class defined by `loader`.
    ///
    /// Unregistered classes see other unregistered classes first, then whatever
    /// the application loader sees.
    pub fn find_class(&self, loader: LoaderKind, name: &str) -> Option<KlassId> {
        match loader {
            LoaderKind::Unregistered => self
                .klasses
                .lookup(LoaderKind::Unregistered, name)
                .or_else(|| self.klasses.find_visible(LoaderKind::App, name)),
            _ => self.klasses.find_visible(loader, name),
        }
    }

    pub fn boot_class(&self, name: &str) -> Option<KlassId> {
        self.klasses.boot(name)
    }

    fn require_boot_class(&self, name: &str) -> Result<KlassId, RuntimeError> {
        self.boot_class(name)
            .ok_or_else(|| RuntimeError::NoClassDefFound(name.to_string()))
    }

    pub fn type_array_klass(&self, element: BasicType) -> Option<KlassId> {
        self.boot_class(&element.array_class_name()?)
    }

    /// Whether the object is an enum constant: its class, or the class it
    /// specializes, is an enum.
    pub fn is_enum_constant(&self, obj: ObjectId) -> Option<KlassId> {
        let o = self.heap.get(obj)?;
        if !matches!(o.body, ObjectBody::Instance { .. }) {
            return None;
        }
        let k = self.klasses.get(o.klass)?;
        if k.has_flag(KlassFlags::ENUM) {
            return Some(o.klass);
        }
        let sup = k.super_klass?;
        self.klasses
            .get(sup)
            .filter(|s| s.has_flag(KlassFlags::ENUM))
            .map(|_| sup)
    }

    // ---------------------------------------------------------------------
    // objects
    // ---------------------------------------------------------------------

    pub fn new_string(&mut self, value: &str) -> Result<ObjectId, RuntimeError> {
        let k = self.require_boot_class(STRING_CLASS)?;
        Ok(self.heap.alloc(HeapObject::new(
            k,
            ObjectBody::Str {
                value: value.to_string(),
            },
        )))
    }

    /// Returns the canonical string object for `value`.
    pub fn intern(&mut self, value: &str) -> Result<ObjectId, RuntimeError> {
        if let Some(&id) = self.interned.get(value) {
            return Ok(id);
        }
        let id = self.new_string(value)?;
        self.interned.insert(value.to_string(), id);
        Ok(id)
    }

    /// Allocates an instance with every field at its default value.
    pub fn new_instance(&mut self, klass: KlassId) -> ObjectId {
        let fields = self
            .klasses
            .instance_layout(klass)
            .iter()
            .map(|(_, f)| Value::default_for(f.basic_type()))
            .collect();
        self.heap
            .alloc(HeapObject::new(klass, ObjectBody::Instance { fields }))
    }

    pub fn new_object_array(&mut self, klass: KlassId, elements: Vec<Value>) -> ObjectId {
        self.heap
            .alloc(HeapObject::new(klass, ObjectBody::ObjArray { elements }))
    }

    pub fn new_type_array(
        &mut self,
        element: BasicType,
        values: Vec<i64>,
    ) -> Result<ObjectId, RuntimeError> {
        let name = element.array_class_name().unwrap_or_default();
        let k = self
            .type_array_klass(element)
            .ok_or(RuntimeError::NoClassDefFound(name))?;
        Ok(self
            .heap
            .alloc(HeapObject::new(k, ObjectBody::TypeArray { element, values })))
    }

    /// Stores `value` into instance slot `slot` (or array element `slot`).
    pub fn set_field(&mut self, obj: ObjectId, slot: usize, value: Value) -> bool {
        let Some(o) = self.heap.get_mut(obj) else {
            return false;
        };
        let slots = match &mut o.body {
            ObjectBody::Instance { fields } => fields,
            ObjectBody::ObjArray { elements } => elements,
            _ => return false,
        };
        match slots.get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }

    /// Mirror of `klass`, allocating it with default statics on first use.
    pub fn ensure_mirror(&mut self, klass: KlassId) -> Result<ObjectId, RuntimeError> {
        if let Some(m) = self.klasses[klass].mirror {
            return Ok(m);
        }
        let class_klass = self.require_boot_class(CLASS_CLASS)?;
        let statics = self.klasses[klass]
            .static_fields()
            .map(|(_, f)| Value::default_for(f.basic_type()))
            .collect();
        let mirror = self.heap.alloc(HeapObject::new(
            class_klass,
            ObjectBody::Mirror {
                target: MirrorTarget::Class(klass),
                statics,
            },
        ));
        self.klasses[klass].mirror = Some(mirror);
        Ok(mirror)
    }

    /// Mirrors for the primitive types, allocated once.
    pub fn ensure_primitive_mirrors(&mut self) -> Result<Vec<(BasicType, ObjectId)>, RuntimeError> {
        if self.primitive_mirrors.is_empty() {
            let class_klass = self.require_boot_class(CLASS_CLASS)?;
            for bt in BasicType::PRIMITIVES {
                let m = self.heap.alloc(HeapObject::new(
                    class_klass,
                    ObjectBody::Mirror {
                        target: MirrorTarget::Primitive(bt),
                        statics: Vec::new(),
                    },
                ));
                self.primitive_mirrors.push((bt, m));
            }
        }
        Ok(self.primitive_mirrors.clone())
    }

    pub fn static_value(&self, klass: KlassId, slot: usize) -> Option<Value> {
        let mirror = self.klasses.get(klass)?.mirror?;
        match &self.heap.get(mirror)?.body {
            ObjectBody::Mirror { statics, .. } => statics.get(slot).copied(),
            _ => None,
        }
    }

    pub fn static_field_value(&self, klass: KlassId, name: &str) -> Option<Value> {
        let (slot, _) = self.klasses.get(klass)?.find_static_field(name, None)?;
        self.static_value(klass, slot)
    }

    pub fn set_static_value(&mut self, klass: KlassId, slot: usize, value: Value) -> bool {
        let Some(mirror) = self.klasses.get(klass).and_then(|k| k.mirror) else {
            return false;
        };
        match self.heap.get_mut(mirror).map(|o| &mut o.body) {
            Some(ObjectBody::Mirror { statics, .. }) if slot < statics.len() => {
                statics[slot] = value;
                true
            }
            _ => false,
        }
    }

    fn constant_to_value(&mut self, c: &ConstantValue) -> Result<Value, RuntimeError> {
        match c {
            ConstantValue::Prim(v) => Ok(Value::Prim(*v)),
            ConstantValue::Str(s) => Ok(Value::Ref(self.intern(s)?)),
        }
    }

    // ---------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------

    /// Loads `klass` and its supertypes.
    pub fn load_class(&mut self, klass: KlassId) -> Result<(), RuntimeError> {
        let state = self.klasses.get(klass).map(|k| k.state).ok_or_else(|| {
            RuntimeError::NoClassDefFound(klass.to_string())
        })?;
        if state.is_loaded() {
            return Ok(());
        }
        for sup in self.klasses.direct_supertypes(klass) {
            self.load_class(sup)?;
        }
        if let KlassKind::ObjArray { element } = self.klasses[klass].kind {
            self.load_class(element)?;
        }
        self.ensure_mirror(klass)?;
        self.klasses[klass].state = ClassState::Loaded;
        trace!(target: "cds", "loaded {}", self.klasses.name(klass));
        Ok(())
    }

    /// Links `klass` (verifying it) after linking its supertypes. Installs the
    /// `ConstantValue` attributes of static fields.
    pub fn link_class(&mut self, klass: KlassId) -> Result<(), RuntimeError> {
        self.load_class(klass)?;
        if self.klasses[klass].state.is_linked() {
            return Ok(());
        }
        for sup in self.klasses.direct_supertypes(klass) {
            self.link_class(sup)?;
        }
        self.klasses[klass].state = ClassState::BeingLinked;
        if self.klasses[klass].has_flag(KlassFlags::VERIFY_FAILS) {
            self.klasses[klass].state = ClassState::Loaded;
            return Err(RuntimeError::Verify(self.klasses[klass].external_name()));
        }
        let constants: Vec<(usize, ConstantValue)> = self.klasses[klass]
            .static_fields()
            .filter_map(|(slot, f)| f.constant_value.clone().map(|c| (slot, c)))
            .collect();
        for (slot, c) in constants {
            let v = self.constant_to_value(&c)?;
            self.set_static_value(klass, slot, v);
        }
        self.klasses[klass].state = ClassState::Linked;
        Ok(())
    }

    /// Runs the class initializer of `klass` after initializing its super class.
    pub fn initialize_class(&mut self, klass: KlassId) -> Result<(), RuntimeError> {
        match self.klasses.get(klass).map(|k| k.state) {
            Some(ClassState::Initialized) | Some(ClassState::BeingInitialized) => return Ok(()),
            Some(ClassState::InitializationError) => {
                return Err(RuntimeError::NoClassDefFound(format!(
                    "Could not initialize class {}",
                    self.klasses[klass].external_name()
                )))
            }
            _ => {}
        }
        self.link_class(klass)?;
        if let Some(sup) = self.klasses[klass].super_klass {
            self.initialize_class(sup)?;
        }
        self.klasses[klass].state = ClassState::BeingInitialized;
        self.events
            .push(LifecycleEvent::ClassInit(klass, ClassState::BeingInitialized));

        if self.klasses[klass].has_flag(KlassFlags::CLINIT_FAILS) {
            self.klasses[klass].state = ClassState::InitializationError;
            self.events
                .push(LifecycleEvent::ClassInit(klass, ClassState::InitializationError));
            return Err(RuntimeError::Initializer(self.klasses[klass].external_name()));
        }

        let assignments: Vec<(usize, bool, ConstantValue)> = self.klasses[klass]
            .static_fields()
            .filter_map(|(slot, f)| f.init_value.clone().map(|c| (slot, f.is_final(), c)))
            .collect();
        for (slot, is_final, c) in assignments {
            let v = self.constant_to_value(&c)?;
            self.set_static_value(klass, slot, v);
            if is_final {
                self.events
                    .push(LifecycleEvent::FieldInit(klass, slot as u32));
            }
        }
        self.klasses[klass].state = ClassState::Initialized;
        self.events
            .push(LifecycleEvent::ClassInit(klass, ClassState::Initialized));
        Ok(())
    }

    /// Builds the reflection data of a linked class for the given `flags`.
    /// Regenerating with different flags replaces the previous data.
    pub fn generate_reflection_data(&mut self, klass: KlassId, flags: u32) -> Result<(), RuntimeError> {
        let k = &mut self.klasses[klass];
        if !k.state.is_linked() {
            return Err(RuntimeError::Linkage(format!(
                "reflection data of unlinked class {}",
                k.external_name()
            )));
        }
        k.reflection_data = Some(flags);
        Ok(())
    }

    pub fn resolve_nest_host(&mut self, klass: KlassId) -> Result<Option<KlassId>, RuntimeError> {
        let k = &self.klasses[klass];
        if k.nest_host.is_some() {
            return Ok(k.nest_host);
        }
        let Some(name) = k.nest_host_name.clone() else {
            return Ok(None);
        };
        let host = self
            .find_class(k.loader, &name)
            .ok_or(RuntimeError::NoClassDefFound(name))?;
        self.load_class(host)?;
        self.klasses[klass].nest_host = Some(host);
        Ok(Some(host))
    }

    // ---------------------------------------------------------------------
    // link resolver
    // ---------------------------------------------------------------------

    fn bad_index(&self, holder: KlassId, index: u16) -> RuntimeError {
        RuntimeError::BadCpIndex {
            class: self.klasses.name(holder).to_string(),
            index,
        }
    }

    /// Resolves the class entry at `index` of `holder`'s pool and rewrites it.
    pub fn resolve_klass_at(&mut self, holder: KlassId, index: u16) -> Result<KlassId, RuntimeError> {
        let cp = &self.klasses[holder].constants;
        if let Some(k) = cp.resolved_klass_at(index) {
            return Ok(k);
        }
        let name = cp
            .klass_name_at(index)
            .ok_or_else(|| self.bad_index(holder, index))?
            .to_string();
        if matches!(cp.entry(index), Some(CpEntry::UnresolvedClassInError { .. })) {
            return Err(RuntimeError::NoClassDefFound(name));
        }
        self.stats.class_resolutions += 1;
        let loader = self.klasses[holder].loader;
        let target = match self.find_class(loader, &name) {
            Some(t) => t,
            None => {
                self.klasses[holder].constants.mark_klass_in_error(index);
                return Err(RuntimeError::NoClassDefFound(name));
            }
        };
        self.load_class(target)?;
        self.klasses[holder]
            .constants
            .set_resolved_klass(index, target);
        Ok(target)
    }

    /// Field lookup: declared fields, then superinterfaces, then super class.
    /// Returns the declaring class, its field and the slot.
    pub fn find_field(&self, klass: KlassId, name: &str, signature: &str) -> Option<(KlassId, FieldInfo, u32)> {
        let k = self.klasses.get(klass)?;
        if let Some(f) = k
            .fields
            .iter()
            .find(|f| f.name == name && f.signature == signature)
        {
            let slot = if f.is_static() {
                k.find_static_field(name, Some(signature))?.0
            } else {
                self.klasses
                    .instance_layout(klass)
                    .iter()
                    .position(|(d, fi)| *d == klass && fi.name == name)?
            };
            return Some((klass, f.clone(), slot as u32));
        }
        k.interfaces
            .iter()
            .chain(k.super_klass.iter())
            .find_map(|&s| self.find_field(s, name, signature))
    }

    /// Method lookup: the class and its super classes, then superinterfaces.
    pub fn find_method(&self, klass: KlassId, name: &str, signature: &str) -> Option<MethodId> {
        let mut current = Some(klass);
        while let Some(c) = current {
            let k = self.klasses.get(c)?;
            if let Some(&m) = k.methods.iter().find(|&&m| {
                self.method(m)
                    .is_some_and(|m| m.name == name && m.signature == signature)
            }) {
                return Some(m);
            }
            current = k.super_klass;
        }
        let mut stack = vec![klass];
        while let Some(c) = stack.pop() {
            let k = self.klasses.get(c)?;
            for &i in &k.interfaces {
                if let Some(&m) = self.klasses.get(i)?.methods.iter().find(|&&m| {
                    self.method(m)
                        .is_some_and(|m| m.name == name && m.signature == signature)
                }) {
                    return Some(m);
                }
                stack.push(i);
            }
            stack.extend(k.super_klass);
        }
        None
    }

    pub fn resolve_field_at(
        &mut self,
        holder: KlassId,
        index: u16,
    ) -> Result<ResolvedFieldRef, RuntimeError> {
        if let Some(r) = self.klasses[holder].constants.cache.fields.get(&index) {
            return Ok(*r);
        }
        let (class_index, name, sig) = {
            let m = self.klasses[holder]
                .constants
                .member_ref_at(index)
                .ok_or_else(|| self.bad_index(holder, index))?;
            (m.class_index, m.name.to_string(), m.signature.to_string())
        };
        let k = self.resolve_klass_at(holder, class_index)?;
        self.stats.member_resolutions += 1;
        let (decl, field, slot) = self.find_field(k, &name, &sig).ok_or_else(|| {
            RuntimeError::NoSuchField(format!("{}.{}", self.klasses.name(k), name))
        })?;
        let r = ResolvedFieldRef {
            holder: decl,
            slot,
            is_static: field.is_static(),
        };
        self.klasses[holder].constants.cache.fields.insert(index, r);
        Ok(r)
    }

    pub fn resolve_method_at(&mut self, holder: KlassId, index: u16) -> Result<MethodId, RuntimeError> {
        if let Some(&m) = self.klasses[holder].constants.cache.methods.get(&index) {
            return Ok(m);
        }
        let (class_index, name, sig) = {
            let m = self.klasses[holder]
                .constants
                .member_ref_at(index)
                .ok_or_else(|| self.bad_index(holder, index))?;
            (m.class_index, m.name.to_string(), m.signature.to_string())
        };
        let k = self.resolve_klass_at(holder, class_index)?;
        self.stats.member_resolutions += 1;
        let m = self.find_method(k, &name, &sig).ok_or_else(|| {
            RuntimeError::NoSuchMethod(format!("{}.{}{}", self.klasses.name(k), name, sig))
        })?;
        self.klasses[holder].constants.cache.methods.insert(index, m);
        Ok(m)
    }

    /// Bootstrap class and method name of an invokedynamic entry.
    pub fn indy_bootstrap(&self, holder: KlassId, index: u16) -> Option<(String, String)> {
        let cp = &self.klasses.get(holder)?.constants;
        let (bsm, _, _) = cp.indy_at(index)?;
        let (_, member) = cp.method_handle_at(bsm.method_handle)?;
        Some((
            cp.klass_name_at(member.class_index)?.to_string(),
            member.name.to_string(),
        ))
    }

    /// Links an invokedynamic call site by running its bootstrap method.
    ///
    /// The lambda metafactory reuses a proxy class of the caller that no other
    /// site has claimed, and spins a new one otherwise.
    pub fn resolve_indy_at(&mut self, holder: KlassId, index: u16) -> Result<CallSite, RuntimeError> {
        if let Some(cs) = self.klasses[holder].constants.cache.indys.get(&index) {
            return Ok(cs.clone());
        }
        let (bsm_class, bsm_name) = self
            .indy_bootstrap(holder, index)
            .ok_or_else(|| self.bad_index(holder, index))?;
        self.stats.indy_resolutions += 1;
        let target = match (bsm_class.as_str(), bsm_name.as_str()) {
            (LAMBDA_METAFACTORY, "metafactory") => Some(self.claim_lambda_proxy(holder)?),
            (STRING_CONCAT_FACTORY, "makeConcatWithConstants") => None,
            _ => {
                return Err(RuntimeError::Bootstrap(format!(
                    "{bsm_class}.{bsm_name} in {}",
                    self.klasses.name(holder)
                )))
            }
        };
        let cs = CallSite {
            bootstrap_class: bsm_class,
            bootstrap_name: bsm_name,
            target,
        };
        self.klasses[holder]
            .constants
            .cache
            .indys
            .insert(index, cs.clone());
        self.events.push(LifecycleEvent::InvokeDynamic(holder, index));
        Ok(cs)
    }

    fn claim_lambda_proxy(&mut self, caller: KlassId) -> Result<KlassId, RuntimeError> {
        let claimed: Vec<KlassId> = self.klasses[caller]
            .constants
            .cache
            .indys
            .values()
            .filter_map(|cs| cs.target)
            .collect();
        let existing = self
            .klasses
            .iter()
            .find(|(id, k)| {
                k.hidden_kind() == Some(HiddenKind::LambdaProxy)
                    && k.nest_host == Some(caller)
                    && !claimed.contains(id)
            })
            .map(|(id, _)| id);
        if let Some(id) = existing {
            self.link_class(id)?;
            return Ok(id);
        }
        let object = self.require_boot_class(OBJECT_CLASS)?;
        let caller_klass = &self.klasses[caller];
        let n = self
            .klasses
            .iter()
            .filter(|(_, k)| k.hidden_kind() == Some(HiddenKind::LambdaProxy))
            .count();
        let mut proxy = Klass::new(
            &format!("{}$$Lambda+0x{:08x}", caller_klass.name, n),
            caller_klass.loader,
            KlassKind::Hidden(HiddenKind::LambdaProxy),
        );
        proxy.super_klass = Some(object);
        proxy.nest_host = Some(caller);
        proxy.nest_host_name = Some(caller_klass.name.clone());
        proxy.module = caller_klass.module.clone();
        proxy.flags |= KlassFlags::FINAL;
        let id = self.add_klass(proxy);
        self.link_class(id)?;
        debug!(target: "cds::lambda", "spun {}", self.klasses.name(id));
        Ok(id)
    }

    /// Links a signature-polymorphic `MethodHandle` call site at `(method, bci)`.
    pub fn resolve_invokehandle(&mut self, method: MethodId, bci: u32) -> Result<MethodId, RuntimeError> {
        let m = self
            .method(method)
            .ok_or_else(|| RuntimeError::NoSuchMethod(format!("method #{}", method.0)))?;
        let holder = m.holder;
        let index = *m.call_sites.get(&bci).ok_or_else(|| {
            RuntimeError::Linkage(format!("no call site at bci {bci} of {}", m.name_and_sig()))
        })?;
        if let Some(&t) = self.klasses[holder].constants.cache.invokehandles.get(&index) {
            return Ok(t);
        }
        let (class_index, name) = {
            let r = self.klasses[holder]
                .constants
                .member_ref_at(index)
                .ok_or_else(|| self.bad_index(holder, index))?;
            (r.class_index, r.name.to_string())
        };
        let k = self.resolve_klass_at(holder, class_index)?;
        if self.klasses.name(k) != METHOD_HANDLE_CLASS {
            return Err(RuntimeError::Linkage(format!(
                "{} is not a method handle invocation",
                self.klasses.name(k)
            )));
        }
        let target = self.klasses[k]
            .methods
            .iter()
            .copied()
            .find(|&id| self.method(id).is_some_and(|m| m.name == name))
            .ok_or_else(|| RuntimeError::NoSuchMethod(format!("MethodHandle.{name}")))?;
        self.klasses[holder]
            .constants
            .cache
            .invokehandles
            .insert(index, target);
        self.events.push(LifecycleEvent::InvokeHandle(method, bci));
        Ok(target)
    }

    /// Whether the method-handle entry at `index` targets a method with a
    /// resolvable reference kind.
    pub fn method_handle_kind(&self, holder: KlassId, index: u16) -> Option<RefKind> {
        self.klasses
            .get(holder)?
            .constants
            .method_handle_at(index)
            .map(|(kind, _)| kind)
    }
}
