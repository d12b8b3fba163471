//! The init list: an ordered log of initialization events of a training run.

use crate::InitListError;
use common::{ClassState, KlassId, MethodId, Runtime, Value};
use dumptime::DumpTimeTable;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitInfo {
    ClassInit { holder: KlassId, state: ClassState },
    /// Value a class initializer assigned to a static final field, with the
    /// class of a reference value.
    FieldInit {
        holder: KlassId,
        slot: u32,
        value: Value,
        value_klass: Option<KlassId>,
    },
    InvokeDynamic { holder: KlassId, index: u16 },
    InvokeHandle { holder: KlassId, method: MethodId, bci: u32 },
    /// An entry the dump could not keep. It holds its place in the list.
    Invalid,
}

impl InitInfo {
    pub fn holder(&self) -> Option<KlassId> {
        match *self {
            InitInfo::ClassInit { holder, .. }
            | InitInfo::FieldInit { holder, .. }
            | InitInfo::InvokeDynamic { holder, .. }
            | InitInfo::InvokeHandle { holder, .. } => Some(holder),
            InitInfo::Invalid => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, InitInfo::Invalid)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            InitInfo::ClassInit { .. } => "class_init",
            InitInfo::FieldInit { .. } => "field_init",
            InitInfo::InvokeDynamic { .. } => "invokedynamic",
            InitInfo::InvokeHandle { .. } => "invokehandle",
            InitInfo::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitList {
    entries: Vec<InitInfo>,
}

impl InitList {
    pub fn new(entries: Vec<InitInfo>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[InitInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invalidates, in place, every entry whose holder the dump excluded, and
    /// every field entry whose value's class was excluded.
    pub fn cleanup(&mut self, rt: &Runtime, table: &DumpTimeTable) -> usize {
        let mut invalidated = 0;
        for e in self.entries.iter_mut() {
            let Some(holder) = e.holder() else { continue };
            let reason = if table.is_excluded(holder) {
                "holder"
            } else if let InitInfo::FieldInit { value_klass: Some(vk), .. } = *e {
                if !table.is_excluded(vk) {
                    continue;
                }
                "value klass"
            } else {
                continue;
            };
            debug!(
                target: "cds",
                "init list: {} {}: EXCLUDED ({})",
                e.kind_name(),
                rt.klasses.name(holder),
                reason
            );
            *e = InitInfo::Invalid;
            invalidated += 1;
        }
        invalidated
    }

    /// Removes superseded `ClassInit` entries. An entry is superseded by any
    /// later `ClassInit` of the same class, except that a `BeingInitialized`
    /// entry survives when no `Initialized` entry follows it.
    pub fn compact(&mut self) -> usize {
        let mut later: HashMap<KlassId, ClassState> = HashMap::new();
        let mut keep = vec![true; self.entries.len()];
        for (i, e) in self.entries.iter().enumerate().rev() {
            let InitInfo::ClassInit { holder, state } = *e else {
                continue;
            };
            if let Some(&max) = later.get(&holder) {
                keep[i] = state == ClassState::BeingInitialized && max != ClassState::Initialized;
            }
            let max = later.entry(holder).or_insert(state);
            if state > *max {
                *max = state;
            }
        }
        let before = self.entries.len();
        let mut flags = keep.into_iter();
        self.entries.retain(|_| flags.next().unwrap_or(true));
        before - self.entries.len()
    }

    /// The live state of `k`, raised to the highest recorded state while `k`
    /// is not yet initialized.
    pub fn lookup_init_state(&self, rt: &Runtime, k: KlassId) -> ClassState {
        let live = rt.klass(k).state;
        if live.is_initialized() {
            return live;
        }
        self.entries
            .iter()
            .filter_map(|e| match *e {
                InitInfo::ClassInit { holder, state } if holder == k => Some(state),
                _ => None,
            })
            .fold(live, ClassState::max)
    }

    /// Number of classes recorded as initialized that are not initialized yet.
    pub fn compute_init_count(&self, rt: &Runtime) -> usize {
        let mut counted = HashSet::new();
        for e in &self.entries {
            if let InitInfo::ClassInit { holder, state: ClassState::Initialized } = *e {
                if rt.klass(holder).state < ClassState::Initialized {
                    counted.insert(holder);
                }
            }
        }
        counted.len()
    }

    pub fn lookup_static_field_value(&self, holder: KlassId, slot: u32) -> Option<Value> {
        self.entries.iter().find_map(|e| match *e {
            InitInfo::FieldInit { holder: h, slot: s, value, .. } if h == holder && s == slot => Some(value),
            _ => None,
        })
    }

    /// Every class recorded as initialized must have its super class recorded
    /// as initialized before it.
    pub fn check_init_dependencies(&self, rt: &Runtime) -> Result<(), InitListError> {
        let mut initialized = HashSet::new();
        for e in &self.entries {
            let InitInfo::ClassInit { holder, state: ClassState::Initialized } = *e else {
                continue;
            };
            if let Some(sup) = rt.klass(holder).super_klass {
                if !initialized.contains(&sup) {
                    return Err(InitListError::InitDependency {
                        class: rt.klass(holder).external_name(),
                        super_class: rt.klass(sup).external_name(),
                    });
                }
            }
            initialized.insert(holder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;

    fn class_init(holder: KlassId, state: ClassState) -> InitInfo {
        InitInfo::ClassInit { holder, state }
    }

    #[test]
    fn test_compaction_keeps_highest_state() {
        let (a, b) = (KlassId(1), KlassId(2));
        let mut list = InitList::new(vec![
            class_init(a, ClassState::BeingInitialized),
            class_init(b, ClassState::BeingInitialized),
            class_init(a, ClassState::Initialized),
            InitInfo::InvokeDynamic { holder: a, index: 7 },
            class_init(b, ClassState::InitializationError),
        ]);
        assert_eq!(list.compact(), 1);
        assert_eq!(
            list.entries(),
            &[
                class_init(b, ClassState::BeingInitialized),
                class_init(a, ClassState::Initialized),
                InitInfo::InvokeDynamic { holder: a, index: 7 },
                class_init(b, ClassState::InitializationError),
            ]
        );
        assert_eq!(list.compact(), 0);
    }

    #[test]
    fn test_lookups() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let string = rt.boot_class("java/lang/String").unwrap();
        let object = rt.boot_class(common::runtime::OBJECT_CLASS).unwrap();
        let list = InitList::new(vec![
            class_init(string, ClassState::BeingInitialized),
            InitInfo::FieldInit { holder: string, slot: 0, value: Value::Prim(42), value_klass: None },
            class_init(string, ClassState::Initialized),
        ]);
        assert_eq!(list.lookup_init_state(&rt, string), ClassState::Initialized);
        assert_eq!(list.lookup_init_state(&rt, object), ClassState::Loaded);
        assert_eq!(list.compute_init_count(&rt), 1);
        assert_eq!(list.lookup_static_field_value(string, 0), Some(Value::Prim(42)));
        assert_eq!(list.lookup_static_field_value(string, 1), None);

        rt.initialize_class(string).unwrap();
        assert_eq!(list.compute_init_count(&rt), 0);
    }

    #[test]
    fn test_cleanup_invalidates_in_place() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let kept = KlassBuilder::new("app/Kept", common::LoaderKind::App)
            .super_class(&rt, common::runtime::OBJECT_CLASS)
            .build(&mut rt);
        let gone = KlassBuilder::new("app/Gone", common::LoaderKind::App)
            .super_class(&rt, common::runtime::OBJECT_CLASS)
            .build(&mut rt);
        let obj = rt.new_instance(gone);
        let mut table = DumpTimeTable::new();
        table.info_mut(&rt, gone).set_excluded("Signed JAR");

        let mut list = InitList::new(vec![
            class_init(gone, ClassState::Initialized),
            class_init(kept, ClassState::Initialized),
            InitInfo::FieldInit { holder: kept, slot: 0, value: Value::Ref(obj), value_klass: Some(gone) },
            InitInfo::InvokeDynamic { holder: kept, index: 3 },
        ]);
        assert_eq!(list.cleanup(&rt, &table), 2);
        assert_eq!(
            list.entries(),
            &[
                InitInfo::Invalid,
                class_init(kept, ClassState::Initialized),
                InitInfo::Invalid,
                InitInfo::InvokeDynamic { holder: kept, index: 3 },
            ]
        );
        assert_eq!(list.lookup_static_field_value(kept, 0), None);
        assert_eq!(list.lookup_init_state(&rt, gone), ClassState::Loaded);
    }

    #[test]
    fn test_reference_field_value_is_kept() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let string = rt.boot_class("java/lang/String").unwrap();
        let greeting = rt.intern("hello").unwrap();
        let list = InitList::new(vec![InitInfo::FieldInit {
            holder: string,
            slot: 1,
            value: Value::Ref(greeting),
            value_klass: Some(string),
        }]);
        assert_eq!(list.lookup_static_field_value(string, 1), Some(Value::Ref(greeting)));
    }

    #[test]
    fn test_init_dependencies() {
        let rt = KlassBuilder::bootstrap_runtime();
        let object = rt.boot_class(common::runtime::OBJECT_CLASS).unwrap();
        let string = rt.boot_class("java/lang/String").unwrap();
        let ordered = InitList::new(vec![
            class_init(object, ClassState::Initialized),
            class_init(string, ClassState::Initialized),
        ]);
        assert!(ordered.check_init_dependencies(&rt).is_ok());

        let reversed = InitList::new(vec![
            class_init(string, ClassState::Initialized),
            class_init(object, ClassState::Initialized),
        ]);
        let err = reversed.check_init_dependencies(&rt).unwrap_err();
        assert!(err.to_string().contains("java.lang.String"));
    }
}
