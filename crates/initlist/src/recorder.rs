//! Training-side recording of the init list.

use crate::list::{InitInfo, InitList};
use common::{ClassState, KlassId, LifecycleEvent, MethodId, Runtime, Value};
use dumptime::DumpTimeTable;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Append-only log shared by every thread of the training run.
#[derive(Debug, Default)]
pub struct InitListRecorder {
    list: Mutex<Vec<InitInfo>>,
}

impl InitListRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    fn push(&self, info: InitInfo) {
        trace!(target: "cds", "init list += {:?}", info);
        self.list.lock().push(info);
    }

    pub fn record_class_init(&self, holder: KlassId, state: ClassState) {
        self.push(InitInfo::ClassInit { holder, state });
    }

    pub fn record_field_init(&self, holder: KlassId, slot: u32, value: Value, value_klass: Option<KlassId>) {
        self.push(InitInfo::FieldInit {
            holder,
            slot,
            value,
            value_klass,
        });
    }

    pub fn record_indy(&self, holder: KlassId, index: u16) {
        self.push(InitInfo::InvokeDynamic { holder, index });
    }

    pub fn record_invokehandle(&self, holder: KlassId, method: MethodId, bci: u32) {
        self.push(InitInfo::InvokeHandle { holder, method, bci });
    }

    /// Appends the lifecycle events drained from `rt`, in order.
    ///
    /// Field values are read from `rt` as they stand now, and fields of holders
    /// that did not finish initializing are not recorded. A reference value is
    /// recorded with its object's class.
    pub fn ingest(&self, rt: &Runtime, events: Vec<LifecycleEvent>) {
        for event in events {
            match event {
                LifecycleEvent::ClassInit(k, state) => self.record_class_init(k, state),
                LifecycleEvent::FieldInit(k, slot) => {
                    if !rt.klass(k).state.is_initialized() {
                        continue;
                    }
                    let value = rt.static_value(k, slot as usize).unwrap_or_default();
                    let value_klass = value.as_ref().and_then(|obj| rt.heap.get(obj)).map(|o| o.klass);
                    self.record_field_init(k, slot, value, value_klass);
                }
                LifecycleEvent::InvokeDynamic(k, index) => self.record_indy(k, index),
                LifecycleEvent::InvokeHandle(m, bci) => match rt.method(m) {
                    Some(method) => self.record_invokehandle(method.holder, m, bci),
                    None => debug!(target: "cds", "init list: no method #{} for invokehandle", m.0),
                },
            }
        }
    }

    /// Takes the log, invalidates entries of excluded classes and compacts it.
    pub fn finish(&self, rt: &Runtime, table: &DumpTimeTable) -> InitList {
        let mut list = InitList::new(std::mem::take(&mut *self.list.lock()));
        let excluded = list.cleanup(rt, table);
        let superseded = list.compact();
        debug!(
            target: "cds",
            "init list: {} entries ({} invalidated, {} superseded)",
            list.len(),
            excluded,
            superseded
        );
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::{ConstantValue, FieldFlags, LoaderKind};
    use dumptime::ExclusionEngine;

    #[test]
    fn test_records_from_many_threads() {
        let recorder = InitListRecorder::new();
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let recorder = &recorder;
                s.spawn(move || {
                    for i in 0..25 {
                        recorder.record_indy(KlassId(t), i);
                    }
                });
            }
        });
        assert_eq!(recorder.len(), 100);
    }

    #[test]
    fn test_ingest_training_events() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let config = KlassBuilder::new("app/Config", LoaderKind::App)
            .super_class(&rt, common::runtime::OBJECT_CLASS)
            .static_field_init("LIMIT", "I", FieldFlags::FINAL, ConstantValue::Prim(8))
            .build(&mut rt);
        rt.initialize_class(config).unwrap();

        let recorder = InitListRecorder::new();
        recorder.ingest(&rt, rt.events.clone());
        let mut table = DumpTimeTable::new();
        ExclusionEngine::new(&common::CdsConfig::default())
            .check_all(&rt, &mut table)
            .unwrap();
        let list = recorder.finish(&rt, &table);

        assert!(recorder.is_empty());
        assert!(list
            .entries()
            .contains(&InitInfo::ClassInit { holder: config, state: ClassState::Initialized }));
        assert!(!list
            .entries()
            .contains(&InitInfo::ClassInit { holder: config, state: ClassState::BeingInitialized }));
        assert_eq!(list.lookup_static_field_value(config, 0), Some(Value::Prim(8)));
    }

    #[test]
    fn test_reference_field_keeps_its_value() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let greeter = KlassBuilder::new("app/Greeter", LoaderKind::App)
            .super_class(&rt, common::runtime::OBJECT_CLASS)
            .static_field_init(
                "GREETING",
                "Ljava/lang/String;",
                FieldFlags::FINAL,
                ConstantValue::Str("hello".into()),
            )
            .build(&mut rt);
        rt.initialize_class(greeter).unwrap();
        let live = rt.static_field_value(greeter, "GREETING").unwrap();
        assert!(live.as_ref().is_some());

        let recorder = InitListRecorder::new();
        recorder.ingest(&rt, rt.events.clone());
        let table = DumpTimeTable::new();
        let list = recorder.finish(&rt, &table);

        let string = rt.boot_class("java/lang/String").unwrap();
        assert_eq!(list.lookup_static_field_value(greeter, 0), Some(live));
        assert!(list.entries().iter().any(|e| matches!(
            e,
            InitInfo::FieldInit { holder, value_klass: Some(k), .. } if *holder == greeter && *k == string
        )));
    }
}
