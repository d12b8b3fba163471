//! Record sections of the archive (`rkyv`).
//!
//! Classes are referred to by their index in the class table. Every section
//! has a single root type so that it can be validated with `rkyv::access` when
//! the archive is mapped and read in place afterwards.

use rkyv::{Archive, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ResolvedKlassRecord {
    pub index: u16,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ResolvedFieldRecord {
    pub index: u16,
    pub holder: u32,
    pub slot: u32,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ResolvedMethodRecord {
    pub index: u16,
    pub holder: u32,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ResolvedIndyRecord {
    pub index: u16,
    pub bootstrap_class: String,
    pub bootstrap_name: String,
    pub target: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct VerificationRecord {
    pub target_name: String,
    pub from_name: String,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct LinkingRecord {
    pub symbol: String,
    pub loader1: u8,
    pub loader2: u8,
}

/// Everything about an archived class that is not in its metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ClassRecord {
    /// RW byte offset of the metadata record.
    pub meta: u32,
    /// Root index of the archived mirror.
    pub mirror_root: Option<u32>,
    pub preinited: bool,
    pub nest_host: Option<u32>,
    pub resolved_klasses: Vec<ResolvedKlassRecord>,
    pub resolved_fields: Vec<ResolvedFieldRecord>,
    pub resolved_methods: Vec<ResolvedMethodRecord>,
    pub resolved_indys: Vec<ResolvedIndyRecord>,
    pub verification_constraints: Vec<VerificationRecord>,
    pub linking_constraints: Vec<LinkingRecord>,
    pub enum_static_roots: Vec<i32>,
    pub classfile_size: u32,
    pub classfile_crc32: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ClassTable {
    pub classes: Vec<ClassRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct MirrorRootRecord {
    pub class: u32,
    pub root: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct PrimitiveMirrorRecord {
    pub basic_type: u8,
    pub root: u32,
}

/// The roots array and the named ranges inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct HeapRootsRecord {
    /// Heap region offset per root, 0 for null.
    pub roots: Vec<u32>,
    pub mirrors: Vec<MirrorRootRecord>,
    pub primitive_mirrors: Vec<PrimitiveMirrorRecord>,
    pub interned_strings: Option<u32>,
    pub exceptions: Vec<Option<u32>>,
    pub permanent_first_root: Option<u32>,
    pub permanent_segments: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct SubgraphRef {
    pub holder: u32,
    /// RO byte offset of the subgraph record.
    pub record: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct SubgraphTable {
    pub subgraphs: Vec<SubgraphRef>,
}

/// Value of a recorded static final field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub enum FieldValueRecord {
    Null,
    Prim(i64),
    /// Permanent index of the archived object.
    Object(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub enum InitRecord {
    ClassInit {
        holder: u32,
        state: u8,
    },
    FieldInit {
        holder: u32,
        slot: u32,
        value: FieldValueRecord,
        value_klass: Option<u32>,
    },
    InvokeDynamic {
        holder: u32,
        index: u16,
    },
    InvokeHandle {
        holder: u32,
        method_holder: u32,
        method_name: String,
        method_signature: String,
        bci: u32,
    },
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct InitListRecord {
    pub entries: Vec<InitRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct LambdaRecord {
    pub caller: u32,
    pub invoked_name: String,
    pub invoked_type: String,
    pub method_type: String,
    pub member_holder: u32,
    pub member_name: String,
    pub member_signature: String,
    pub instantiated_method_type: String,
    /// In the order the training run generated them.
    pub proxies: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct LambdaTable {
    pub sites: Vec<LambdaRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct CompileRecordData {
    pub level: u8,
    pub compile_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct MethodDataRecord {
    pub holder: u32,
    pub name: String,
    pub signature: String,
    pub compiles: Vec<CompileRecordData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct MethodDataTable {
    pub methods: Vec<MethodDataRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct PreloadedRecord {
    pub boot: Vec<u32>,
    pub boot2: Vec<u32>,
    pub platform: Vec<u32>,
    pub app: Vec<u32>,
    pub platform_initiated: Vec<u32>,
    pub app_initiated: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ReflectionRecord {
    pub class: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ReflectionTable {
    pub classes: Vec<ReflectionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct LambdaFormInvokers {
    pub lines: Vec<String>,
}

/// Key under which a lambda call site is stored in the lambda-proxy dictionary.
pub fn lambda_site_key(caller: &str, invoked_name: &str, invoked_type: &str, method_type: &str) -> String {
    format!("{caller}.{invoked_name}:{invoked_type}{method_type}")
}

/// Key under which a method is stored in the method-data dictionary.
pub fn method_key(holder: &str, name: &str, signature: &str) -> String {
    format!("{holder}.{name}{signature}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_table_validates_and_decodes() {
        let table = ClassTable {
            classes: vec![ClassRecord {
                meta: 40,
                mirror_root: Some(3),
                resolved_klasses: vec![ResolvedKlassRecord { index: 2, target: 0 }],
                resolved_indys: vec![ResolvedIndyRecord {
                    index: 9,
                    bootstrap_class: "java/lang/invoke/LambdaMetafactory".into(),
                    bootstrap_name: "metafactory".into(),
                    target: Some(5),
                }],
                classfile_size: 4,
                classfile_crc32: 0xdead_beef,
                ..ClassRecord::default()
            }],
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&table).unwrap();
        let archived = rkyv::access::<ArchivedClassTable, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(archived.classes.len(), 1);
        assert_eq!(archived.classes[0].meta, 40);
        assert_eq!(archived.classes[0].resolved_indys[0].bootstrap_name.as_str(), "metafactory");
        let back = rkyv::deserialize::<ClassTable, rkyv::rancor::Error>(archived).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_init_list_keeps_order() {
        let list = InitListRecord {
            entries: vec![
                InitRecord::ClassInit { holder: 1, state: 5 },
                InitRecord::FieldInit {
                    holder: 1,
                    slot: 0,
                    value: FieldValueRecord::Prim(-7),
                    value_klass: None,
                },
                InitRecord::Invalid,
                InitRecord::FieldInit {
                    holder: 1,
                    slot: 1,
                    value: FieldValueRecord::Object(3),
                    value_klass: Some(4),
                },
                InitRecord::InvokeDynamic { holder: 2, index: 11 },
            ],
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&list).unwrap();
        let archived = rkyv::access::<ArchivedInitListRecord, rkyv::rancor::Error>(&bytes).unwrap();
        let back = rkyv::deserialize::<InitListRecord, rkyv::rancor::Error>(archived).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn test_garbage_fails_validation() {
        let mut garbage = rkyv::util::AlignedVec::<16>::new();
        garbage.extend_from_slice(&[0xff; 16]);
        assert!(rkyv::access::<ArchivedLambdaFormInvokers, rkyv::rancor::Error>(&garbage).is_err());
    }
}
