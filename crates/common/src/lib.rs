//! # Common: Runtime Model for the Archiver
//!
//! **Role**: The shared vocabulary of every archiver crate. Models the managed
//! runtime the archiver runs inside of: classes, methods, constant pools, the
//! object heap, mirrors and interned strings.
//!
//! **Core Types**:
//! - `KlassId` / `MethodId` / `ObjectId`: stable arena indices. Persistent records
//!   never store anything else.
//! - `Runtime`: the class arena, method arena, heap and string table, plus the
//!   link-resolver and class-lifecycle operations the archiver calls into.
//! - `CdsConfig`: every recognized flag with its default.
//!
//! **Design**:
//! - The runtime is a plain value. There are no globals; callers thread `&Runtime`
//!   or `&mut Runtime` explicitly.
//! - Snapshots of a training run are JSON (`serde`), loaded with
//!   [`Runtime::load_snapshot`].

pub mod bitmap;
pub mod builder;
pub mod config;
pub mod constant_pool;
pub mod heap;
pub mod klass;
pub mod method;
pub mod runtime;

pub use bitmap::BitMap;
pub use builder::KlassBuilder;
pub use config::CdsConfig;
pub use constant_pool::{ConstantPool, CpEntry, CpTag};
pub use heap::{Heap, HeapObject, ObjectBody, ObjectId, Value};
pub use klass::{
    ConstantValue, FieldFlags, FieldInfo, HiddenKind, Klass, KlassFlags, KlassKind, KlassTable,
};
pub use method::{Method, MethodFlags};
pub use runtime::{LifecycleEvent, Runtime, RuntimeError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a class in the runtime's class arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KlassId(pub u32);

impl KlassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K#{}", self.0)
    }
}

/// Index of a method in the runtime's method arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub u32);

impl MethodId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Defining loader of a class.
///
/// The first three are the *built-in* loaders. `Unregistered` classes come from
/// the class list with a `source:` attribute and belong to no built-in loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoaderKind {
    Boot = 0,
    Platform = 1,
    App = 2,
    Unregistered = 3,
}

impl LoaderKind {
    pub fn is_builtin(self) -> bool {
        !matches!(self, LoaderKind::Unregistered)
    }

    /// Next loader in the built-in delegation chain (app -> platform -> boot).
    pub fn parent(self) -> Option<LoaderKind> {
        match self {
            LoaderKind::App => Some(LoaderKind::Platform),
            LoaderKind::Platform => Some(LoaderKind::Boot),
            LoaderKind::Boot | LoaderKind::Unregistered => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoaderKind::Boot => "boot",
            LoaderKind::Platform => "platform",
            LoaderKind::App => "app",
            LoaderKind::Unregistered => "unregistered",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LoaderKind::Boot),
            1 => Some(LoaderKind::Platform),
            2 => Some(LoaderKind::App),
            3 => Some(LoaderKind::Unregistered),
            _ => None,
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a class. Ordered: a later variant is a later state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ClassState {
    /// Known to the runtime but not yet loaded.
    #[default]
    Allocated = 0,
    Loaded = 1,
    BeingLinked = 2,
    Linked = 3,
    BeingInitialized = 4,
    Initialized = 5,
    InitializationError = 6,
}

impl ClassState {
    pub fn is_loaded(self) -> bool {
        self >= ClassState::Loaded
    }

    pub fn is_linked(self) -> bool {
        self >= ClassState::Linked
    }

    pub fn is_initialized(self) -> bool {
        self == ClassState::Initialized
    }

    pub fn is_error(self) -> bool {
        self == ClassState::InitializationError
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassState::Allocated => "allocated",
            ClassState::Loaded => "loaded",
            ClassState::BeingLinked => "being_linked",
            ClassState::Linked => "linked",
            ClassState::BeingInitialized => "being_initialized",
            ClassState::Initialized => "fully_initialized",
            ClassState::InitializationError => "initialization_error",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ClassState::Allocated),
            1 => Some(ClassState::Loaded),
            2 => Some(ClassState::BeingLinked),
            3 => Some(ClassState::Linked),
            4 => Some(ClassState::BeingInitialized),
            5 => Some(ClassState::Initialized),
            6 => Some(ClassState::InitializationError),
            _ => None,
        }
    }
}

/// Field and array-element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
}

impl BasicType {
    /// Primitive types that own a mirror, in mirror-table order.
    pub const PRIMITIVES: [BasicType; 9] = [
        BasicType::Boolean,
        BasicType::Char,
        BasicType::Float,
        BasicType::Double,
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Void,
    ];

    /// Maps the first character of a field descriptor to its basic type.
    ///
    /// # Examples
    /// ```
    /// # use common::BasicType;
    /// assert_eq!(BasicType::from_signature("I"), Some(BasicType::Int));
    /// assert_eq!(BasicType::from_signature("[Ljava/lang/Object;"), Some(BasicType::Array));
    /// assert_eq!(BasicType::from_signature(""), None);
    /// ```
    pub fn from_signature(sig: &str) -> Option<Self> {
        match sig.as_bytes().first()? {
            b'Z' => Some(BasicType::Boolean),
            b'C' => Some(BasicType::Char),
            b'F' => Some(BasicType::Float),
            b'D' => Some(BasicType::Double),
            b'B' => Some(BasicType::Byte),
            b'S' => Some(BasicType::Short),
            b'I' => Some(BasicType::Int),
            b'J' => Some(BasicType::Long),
            b'L' => Some(BasicType::Object),
            b'[' => Some(BasicType::Array),
            b'V' => Some(BasicType::Void),
            _ => None,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    /// Element size in bytes when stored in a primitive array.
    pub fn element_size(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
            BasicType::Object | BasicType::Array => 4,
            BasicType::Void => 0,
        }
    }

    /// Descriptor character; `None` for the reference types.
    pub fn signature_char(self) -> Option<char> {
        match self {
            BasicType::Boolean => Some('Z'),
            BasicType::Char => Some('C'),
            BasicType::Float => Some('F'),
            BasicType::Double => Some('D'),
            BasicType::Byte => Some('B'),
            BasicType::Short => Some('S'),
            BasicType::Int => Some('I'),
            BasicType::Long => Some('J'),
            BasicType::Void => Some('V'),
            BasicType::Object | BasicType::Array => None,
        }
    }

    /// Name of the primitive array class, e.g. `[I`.
    pub fn array_class_name(self) -> Option<String> {
        match self {
            BasicType::Void | BasicType::Object | BasicType::Array => None,
            _ => self.signature_char().map(|c| format!("[{c}")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Object => "object",
            BasicType::Array => "array",
            BasicType::Void => "void",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(BasicType::Boolean),
            5 => Some(BasicType::Char),
            6 => Some(BasicType::Float),
            7 => Some(BasicType::Double),
            8 => Some(BasicType::Byte),
            9 => Some(BasicType::Short),
            10 => Some(BasicType::Int),
            11 => Some(BasicType::Long),
            12 => Some(BasicType::Object),
            13 => Some(BasicType::Array),
            14 => Some(BasicType::Void),
            _ => None,
        }
    }
}

/// Converts an internal class name (`java/lang/Object`) to its external form.
pub fn external_name(name: &str) -> String {
    name.replace('/', ".")
}
