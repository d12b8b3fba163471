use crate::KlassId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MethodFlags: u16 {
        const STATIC = 1 << 0;
        const FINAL = 1 << 1;
        const PRIVATE = 1 << 2;
        const NATIVE = 1 << 3;
        const ABSTRACT = 1 << 4;
        const SYNTHETIC = 1 << 5;
        /// The compiler bails out on this method.
        const NOT_COMPILABLE = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub holder: KlassId,
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub flags: MethodFlags,
    /// Invoke sites by bytecode index; each value is the CP index the site uses.
    #[serde(default)]
    pub call_sites: BTreeMap<u32, u16>,
    /// Tier of the installed compiled code, if any.
    #[serde(default)]
    pub code_level: Option<u8>,
}

impl Method {
    pub fn new(holder: KlassId, name: &str, signature: &str, flags: MethodFlags) -> Self {
        Self {
            holder,
            name: name.to_string(),
            signature: signature.to_string(),
            flags,
            call_sites: BTreeMap::new(),
            code_level: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_class_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// A call through this method cannot be redirected by an override.
    pub fn can_be_statically_bound(&self) -> bool {
        self.flags
            .intersects(MethodFlags::FINAL | MethodFlags::PRIVATE | MethodFlags::STATIC)
            || self.is_initializer()
    }

    pub fn name_and_sig(&self) -> String {
        format!("{}{}", self.name, self.signature)
    }
}
