//! Fluent construction of classes, and a bootstrap runtime holding the core
//! library classes every archive depends on.

use crate::constant_pool::RefKind;
use crate::heap::{ObjectId, Value};
use crate::klass::{ConstantValue, FieldFlags, FieldInfo, HiddenKind, Klass, KlassFlags, KlassKind};
use crate::method::{Method, MethodFlags};
use crate::runtime::{
    Runtime, RuntimeError, LAMBDA_METAFACTORY, LAMBDA_METAFACTORY_SIGNATURE, OBJECT_CLASS,
    STRING_CONCAT_FACTORY, STRING_CONCAT_SIGNATURE,
};
use crate::{BasicType, ClassState, KlassId, LoaderKind};
use tracing::debug;

pub struct KlassBuilder {
    klass: Klass,
    methods: Vec<(String, String, MethodFlags)>,
    state: Option<ClassState>,
}

impl KlassBuilder {
    /// Starts an instance class. Boot classes default to `java.base`; built-in
    /// classes default to shared class-path entry 0.
    pub fn new(name: &str, loader: LoaderKind) -> Self {
        let mut klass = Klass::new(name, loader, KlassKind::Instance);
        if loader == LoaderKind::Boot {
            klass.module = Some("java.base".to_string());
        }
        if loader.is_builtin() {
            klass.classpath_index = Some(0);
        }
        Self {
            klass,
            methods: Vec::new(),
            state: None,
        }
    }

    pub fn super_class(mut self, rt: &Runtime, name: &str) -> Self {
        self.klass.super_klass = rt.find_class(self.klass.loader, name);
        self
    }

    pub fn super_id(mut self, id: KlassId) -> Self {
        self.klass.super_klass = Some(id);
        self
    }

    pub fn interface(mut self, rt: &Runtime, name: &str) -> Self {
        if let Some(i) = rt.find_class(self.klass.loader, name) {
            self.klass.interfaces.push(i);
        }
        self
    }

    pub fn flags(mut self, flags: KlassFlags) -> Self {
        self.klass.flags |= flags;
        self
    }

    pub fn hidden(mut self, kind: HiddenKind) -> Self {
        self.klass.kind = KlassKind::Hidden(kind);
        self.klass.classpath_index = None;
        self
    }

    pub fn module(mut self, module: &str) -> Self {
        self.klass.module = Some(module.to_string());
        self
    }

    pub fn classpath_index(mut self, index: Option<u32>) -> Self {
        self.klass.classpath_index = index;
        self
    }

    pub fn major_version(mut self, v: u16) -> Self {
        self.klass.major_version = v;
        self
    }

    pub fn nest_host(mut self, name: &str) -> Self {
        self.klass.nest_host_name = Some(name.to_string());
        self
    }

    pub fn source(mut self, path: &str) -> Self {
        self.klass.source = Some(path.to_string());
        self
    }

    pub fn classfile(mut self, bytes: Vec<u8>) -> Self {
        self.klass.classfile = bytes;
        self
    }

    /// Overrides the lifecycle state after loading, without running anything.
    pub fn state(mut self, state: ClassState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn field(mut self, name: &str, signature: &str) -> Self {
        self.klass
            .fields
            .push(FieldInfo::new(name, signature, FieldFlags::empty()));
        self
    }

    pub fn static_field(mut self, name: &str, signature: &str, flags: FieldFlags) -> Self {
        self.klass
            .fields
            .push(FieldInfo::new(name, signature, flags | FieldFlags::STATIC));
        self
    }

    /// Static field assigned by the class initializer.
    pub fn static_field_init(
        mut self,
        name: &str,
        signature: &str,
        flags: FieldFlags,
        value: ConstantValue,
    ) -> Self {
        let mut f = FieldInfo::new(name, signature, flags | FieldFlags::STATIC);
        f.init_value = Some(value);
        self.klass.fields.push(f);
        self.klass.flags |= KlassFlags::HAS_CLINIT;
        self
    }

    /// `static final` field with a `ConstantValue` attribute.
    pub fn static_field_constant(mut self, name: &str, signature: &str, value: ConstantValue) -> Self {
        let mut f = FieldInfo::new(name, signature, FieldFlags::STATIC | FieldFlags::FINAL);
        f.constant_value = Some(value);
        self.klass.fields.push(f);
        self
    }

    pub fn method(mut self, name: &str, signature: &str, flags: MethodFlags) -> Self {
        self.methods
            .push((name.to_string(), signature.to_string(), flags));
        if name == "<clinit>" {
            self.klass.flags |= KlassFlags::HAS_CLINIT;
        }
        self
    }

    /// Adds the class to `rt` and loads it.
    pub fn build(self, rt: &mut Runtime) -> KlassId {
        let id = rt.add_klass(self.klass);
        for (name, sig, flags) in self.methods {
            rt.add_method(Method::new(id, &name, &sig, flags));
        }
        if let Err(e) = rt.load_class(id) {
            debug!(target: "cds", "{} left unloaded: {}", rt.klasses.name(id), e);
        }
        if let Some(state) = self.state {
            rt.klass_mut(id).state = state;
        }
        id
    }

    /// Adds an array class of `element` to the boot loader.
    pub fn array_of(rt: &mut Runtime, element: KlassId) -> KlassId {
        let elem = rt.klass(element);
        let name = if elem.is_array() {
            format!("[{}", elem.name)
        } else {
            format!("[L{};", elem.name)
        };
        let (loader, module) = (elem.loader, elem.module.clone());
        if let Some(existing) = rt.klasses.lookup(loader, &name) {
            return existing;
        }
        let mut k = Klass::new(&name, loader, KlassKind::ObjArray { element });
        k.super_klass = rt.boot_class(OBJECT_CLASS);
        k.module = module;
        k.flags |= KlassFlags::FINAL;
        let id = rt.add_klass(k);
        if let Err(e) = rt.load_class(id) {
            debug!(target: "cds", "{} left unloaded: {}", name, e);
        }
        id
    }

    // ---------------------------------------------------------------------
    // call sites
    // ---------------------------------------------------------------------

    /// Adds a lambda call site to `holder`'s pool and returns the indy index.
    pub fn add_lambda_site(rt: &mut Runtime, holder: KlassId, name: &str, signature: &str) -> u16 {
        let holder_name = rt.klass(holder).name.clone();
        let n = rt.klass(holder).constants.bootstrap_methods.len();
        let cp = &mut rt.klass_mut(holder).constants;
        let bsm_ref = cp.add_method_ref(LAMBDA_METAFACTORY, "metafactory", LAMBDA_METAFACTORY_SIGNATURE);
        let bsm = cp.add_method_handle(RefKind::InvokeStatic, bsm_ref);
        let erased = cp.add_method_type("()V");
        let impl_ref = cp.add_method_ref(&holder_name, &format!("lambda$main${n}"), "()V");
        let impl_handle = cp.add_method_handle(RefKind::InvokeStatic, impl_ref);
        let instantiated = cp.add_method_type("()V");
        let bootstrap = cp.add_bootstrap(bsm, vec![erased, impl_handle, instantiated]);
        cp.add_invoke_dynamic(bootstrap, name, signature)
    }

    /// Adds a string-concatenation call site and returns the indy index.
    pub fn add_concat_site(rt: &mut Runtime, holder: KlassId, signature: &str) -> u16 {
        let cp = &mut rt.klass_mut(holder).constants;
        let bsm_ref = cp.add_method_ref(
            STRING_CONCAT_FACTORY,
            "makeConcatWithConstants",
            STRING_CONCAT_SIGNATURE,
        );
        let bsm = cp.add_method_handle(RefKind::InvokeStatic, bsm_ref);
        let recipe = cp.add_string("\u{1}\u{1}");
        let bootstrap = cp.add_bootstrap(bsm, vec![recipe]);
        cp.add_invoke_dynamic(bootstrap, "makeConcatWithConstants", signature)
    }

    // ---------------------------------------------------------------------
    // bootstrap runtime
    // ---------------------------------------------------------------------

    /// A runtime holding the core library classes loaded by the boot loader.
    pub fn bootstrap_runtime() -> Runtime {
        let mut rt = Runtime::new();
        let early = KlassFlags::EARLY;

        let object = KlassBuilder::new(OBJECT_CLASS, LoaderKind::Boot)
            .flags(early)
            .build(&mut rt);
        let boot = |rt: &mut Runtime, name: &str, sup: KlassId, flags: KlassFlags| {
            KlassBuilder::new(name, LoaderKind::Boot)
                .super_id(sup)
                .flags(flags | early)
                .build(rt)
        };
        // Loading Class also loads Object, which could not get a mirror before.
        boot(&mut rt, "java/lang/Class", object, KlassFlags::FINAL);
        boot(&mut rt, "java/lang/String", object, KlassFlags::FINAL);
        boot(&mut rt, "java/io/Serializable", object, KlassFlags::INTERFACE);
        boot(&mut rt, "java/lang/Runnable", object, KlassFlags::INTERFACE);

        let number = boot(&mut rt, "java/lang/Number", object, KlassFlags::empty());
        for (boxed, prim) in [
            ("java/lang/Integer", "I"),
            ("java/lang/Long", "J"),
            ("java/lang/Short", "S"),
            ("java/lang/Byte", "B"),
        ] {
            KlassBuilder::new(boxed, LoaderKind::Boot)
                .super_id(number)
                .flags(KlassFlags::FINAL | early)
                .field("value", prim)
                .build(&mut rt);
        }
        KlassBuilder::new("java/lang/Character", LoaderKind::Boot)
            .super_id(object)
            .flags(KlassFlags::FINAL | early)
            .field("value", "C")
            .build(&mut rt);
        for (cache, boxed) in [
            ("java/lang/Integer$IntegerCache", "Integer"),
            ("java/lang/Long$LongCache", "Long"),
            ("java/lang/Short$ShortCache", "Short"),
            ("java/lang/Byte$ByteCache", "Byte"),
            ("java/lang/Character$CharacterCache", "Character"),
        ] {
            KlassBuilder::new(cache, LoaderKind::Boot)
                .super_id(object)
                .flags(early)
                .static_field(
                    "archivedCache",
                    &format!("[Ljava/lang/{boxed};"),
                    FieldFlags::empty(),
                )
                .build(&mut rt);
        }

        KlassBuilder::new("java/lang/Enum", LoaderKind::Boot)
            .super_id(object)
            .flags(early)
            .field("name", "Ljava/lang/String;")
            .field("ordinal", "I")
            .build(&mut rt);

        let throwable = KlassBuilder::new("java/lang/Throwable", LoaderKind::Boot)
            .super_id(object)
            .flags(early)
            .field("detailMessage", "Ljava/lang/String;")
            .build(&mut rt);
        let exception = boot(&mut rt, "java/lang/Exception", throwable, KlassFlags::empty());
        let runtime_ex = boot(&mut rt, "java/lang/RuntimeException", exception, KlassFlags::empty());
        let error = boot(&mut rt, "java/lang/Error", throwable, KlassFlags::empty());
        boot(&mut rt, "java/lang/VirtualMachineError", error, KlassFlags::empty());
        for name in [
            "java/lang/NullPointerException",
            "java/lang/ArithmeticException",
            "java/lang/ArrayStoreException",
            "java/lang/ClassCastException",
        ] {
            boot(&mut rt, name, runtime_ex, KlassFlags::empty());
        }
        let ioobe = boot(&mut rt, "java/lang/IndexOutOfBoundsException", runtime_ex, KlassFlags::empty());
        boot(&mut rt, "java/lang/ArrayIndexOutOfBoundsException", ioobe, KlassFlags::empty());

        KlassBuilder::new("java/lang/invoke/MethodHandle", LoaderKind::Boot)
            .super_id(object)
            .flags(early)
            .method("invoke", "([Ljava/lang/Object;)Ljava/lang/Object;", MethodFlags::FINAL | MethodFlags::NATIVE)
            .method("invokeExact", "([Ljava/lang/Object;)Ljava/lang/Object;", MethodFlags::FINAL | MethodFlags::NATIVE)
            .method("invokeBasic", "([Ljava/lang/Object;)Ljava/lang/Object;", MethodFlags::FINAL | MethodFlags::NATIVE)
            .build(&mut rt);
        for name in [
            "java/lang/invoke/MethodHandleNatives",
            "java/lang/invoke/CallSite",
            "java/lang/invoke/MethodHandles$Lookup",
            "java/lang/invoke/LambdaForm",
            "java/lang/invoke/Invokers$Holder",
            "java/lang/invoke/DirectMethodHandle$Holder",
        ] {
            boot(&mut rt, name, object, KlassFlags::empty());
        }
        // Holders of the archived method-handle caches.
        for name in [
            "java/lang/invoke/MethodType",
            "java/lang/invoke/LambdaForm$NamedFunction",
            "java/lang/invoke/DirectMethodHandle",
        ] {
            KlassBuilder::new(name, LoaderKind::Boot)
                .super_id(object)
                .flags(early)
                .static_field("archivedObjects", "[Ljava/lang/Object;", FieldFlags::empty())
                .build(&mut rt);
        }
        KlassBuilder::new(LAMBDA_METAFACTORY, LoaderKind::Boot)
            .super_id(object)
            .flags(early)
            .method("metafactory", LAMBDA_METAFACTORY_SIGNATURE, MethodFlags::STATIC)
            .build(&mut rt);
        KlassBuilder::new(STRING_CONCAT_FACTORY, LoaderKind::Boot)
            .super_id(object)
            .flags(early)
            .method("makeConcatWithConstants", STRING_CONCAT_SIGNATURE, MethodFlags::STATIC)
            .build(&mut rt);

        let map = boot(&mut rt, "java/util/AbstractMap", object, KlassFlags::empty());
        boot(&mut rt, "java/util/HashMap", map, KlassFlags::empty());

        let object_array = KlassBuilder::array_of(&mut rt, object);
        rt.klass_mut(object_array).flags |= early;
        for boxed in ["java/lang/String", "java/lang/Integer", "java/lang/Long", "java/lang/Short", "java/lang/Byte", "java/lang/Character"] {
            if let Some(k) = rt.boot_class(boxed) {
                let arr = KlassBuilder::array_of(&mut rt, k);
                rt.klass_mut(arr).flags |= early;
            }
        }
        for bt in BasicType::PRIMITIVES {
            let Some(name) = bt.array_class_name() else {
                continue;
            };
            let mut k = Klass::new(&name, LoaderKind::Boot, KlassKind::TypeArray { element: bt });
            k.super_klass = Some(object);
            k.module = Some("java.base".to_string());
            k.flags |= KlassFlags::FINAL | early;
            let id = rt.add_klass(k);
            if let Err(e) = rt.load_class(id) {
                debug!(target: "cds", "{} left unloaded: {}", name, e);
            }
        }
        rt.take_events();
        rt
    }

    /// Fills `java/lang/Integer$IntegerCache.archivedCache` with the boxes for
    /// -128..=127, initializing the cache class. Returns the cache array.
    pub fn populate_integer_cache(rt: &mut Runtime) -> Result<ObjectId, RuntimeError> {
        let integer = rt
            .boot_class("java/lang/Integer")
            .ok_or_else(|| RuntimeError::NoClassDefFound("java/lang/Integer".into()))?;
        let cache = rt
            .boot_class("java/lang/Integer$IntegerCache")
            .ok_or_else(|| RuntimeError::NoClassDefFound("java/lang/Integer$IntegerCache".into()))?;
        let array_klass = rt
            .boot_class("[Ljava/lang/Integer;")
            .ok_or_else(|| RuntimeError::NoClassDefFound("[Ljava/lang/Integer;".into()))?;
        rt.initialize_class(integer)?;
        let mut elements = Vec::with_capacity(256);
        for v in -128i64..=127 {
            let boxed = rt.new_instance(integer);
            rt.set_field(boxed, 0, Value::Prim(v));
            elements.push(Value::Ref(boxed));
        }
        let array = rt.new_object_array(array_klass, elements);
        rt.initialize_class(cache)?;
        rt.set_static_value(cache, 0, Value::Ref(array));
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectBody;

    #[test]
    fn test_bootstrap_has_core_classes() {
        let rt = KlassBuilder::bootstrap_runtime();
        for name in [
            "java/lang/Object",
            "java/lang/Class",
            "java/lang/String",
            "[Ljava/lang/Object;",
            "[I",
            "[B",
            "java/lang/Integer$IntegerCache",
            "java/lang/NullPointerException",
        ] {
            let id = rt.boot_class(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(rt.klass(id).state.is_loaded(), "{name} not loaded");
            assert!(rt.klass(id).mirror.is_some(), "{name} has no mirror");
        }
        assert!(rt.events.is_empty());
    }

    #[test]
    fn test_integer_cache_population() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let array = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
        assert_eq!(rt.heap[array].length(), 256);
        let cache = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        assert_eq!(rt.static_field_value(cache, "archivedCache"), Some(Value::Ref(array)));
        let ObjectBody::ObjArray { elements } = &rt.heap[array].body else {
            panic!("not an object array");
        };
        let zero = elements[128].as_ref().unwrap();
        assert_eq!(rt.heap[zero].slots(), &[Value::Prim(0)]);
    }

    #[test]
    fn test_array_of_reuses_existing() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let object = rt.boot_class(OBJECT_CLASS).unwrap();
        let a = KlassBuilder::array_of(&mut rt, object);
        assert_eq!(Some(a), rt.boot_class("[Ljava/lang/Object;"));
    }
}
