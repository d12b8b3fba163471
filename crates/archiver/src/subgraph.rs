use crate::roots::RootGroup;
use common::runtime::{OBJECT_ARRAY_CLASS, OBJECT_CLASS, STRING_CLASS};
use common::{CdsConfig, KlassFlags, KlassId, KlassKind, Runtime};
use dumptime::is_archivable_hidden;
use tracing::{debug, info};

/// What the run time needs to re-attach one holder's archived subgraph: the
/// static fields to rebind, and the classes to load before any of its objects
/// may be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlassSubGraphInfo {
    pub holder: KlassId,
    pub is_full_module_graph: bool,
    /// `(static slot, root index)` per archived entry field.
    pub entry_fields: Vec<(u32, u32)>,
    pub object_klasses: Vec<KlassId>,
    pub has_non_early_klasses: bool,
}

/// Why a class may not appear in an archived subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlassRejection {
    NotInJavaBase,
}

impl KlassSubGraphInfo {
    pub fn new(holder: KlassId, group: RootGroup) -> Self {
        Self {
            holder,
            is_full_module_graph: group == RootGroup::FullModuleGraph,
            entry_fields: Vec::new(),
            object_klasses: Vec::new(),
            has_non_early_klasses: false,
        }
    }

    pub fn add_entry_field(&mut self, slot: u32, root_index: u32) {
        self.entry_fields.push((slot, root_index));
    }

    /// Root index recorded for `slot`, if the field was archived already.
    pub fn entry_root(&self, slot: u32) -> Option<u32> {
        self.entry_fields
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|&(_, r)| r)
    }

    /// Records the class of an archived object. Classes the runtime has in
    /// place before any archived object is used are not recorded.
    pub fn add_object_klass(&mut self, rt: &Runtime, config: &CdsConfig, k: KlassId) -> Result<(), KlassRejection> {
        if k == self.holder {
            return Ok(());
        }
        let klass = rt.klass(k);
        match klass.kind {
            KlassKind::TypeArray { .. } => return Ok(()),
            KlassKind::ObjArray { .. } => {
                let bottom = rt.klasses.bottom_klass(k);
                if rt.klass(bottom).is_instance() {
                    check_allowed_klass(rt, config, bottom)?;
                }
                if klass.name == OBJECT_ARRAY_CLASS {
                    return Ok(());
                }
            }
            KlassKind::Instance | KlassKind::Hidden(_) => {
                if klass.name == STRING_CLASS || klass.name == OBJECT_CLASS {
                    return Ok(());
                }
                check_allowed_klass(rt, config, k)?;
            }
        }
        if !self.object_klasses.contains(&k) {
            debug!(target: "cds::heap", "Adding klass {}", klass.external_name());
            self.object_klasses.push(k);
        }
        if !self.is_full_module_graph && is_non_early_klass(rt, k) {
            self.has_non_early_klasses = true;
        }
        Ok(())
    }
}

fn check_allowed_klass(rt: &Runtime, config: &CdsConfig, k: KlassId) -> Result<(), KlassRejection> {
    let klass = rt.klass(k);
    let named_hidden = config.archive_invoke_dynamic
        && klass.is_hidden()
        && (is_lambda_form_name(&klass.name) || is_lambda_proxy_name(&klass.name));
    if klass.in_java_base() || named_hidden || is_archivable_hidden(rt, config, k) {
        Ok(())
    } else {
        Err(KlassRejection::NotInJavaBase)
    }
}

fn is_non_early_klass(rt: &Runtime, k: KlassId) -> bool {
    let bottom = rt.klasses.bottom_klass(k);
    let klass = rt.klass(bottom);
    if !klass.is_instance() || klass.has_flag(KlassFlags::EARLY) {
        return false;
    }
    info!(target: "cds::heap", "non-early: {}", klass.external_name());
    true
}

/// Hidden lambda-form classes, recognised by name.
pub fn is_lambda_form_name(name: &str) -> bool {
    ["java/lang/invoke/LambdaForm$MH+", "java/lang/invoke/LambdaForm$DMH+", "java/lang/invoke/LambdaForm$BMH+"]
        .iter()
        .any(|p| name.starts_with(p))
}

/// Lambda proxy classes, recognised by name.
pub fn is_lambda_proxy_name(name: &str) -> bool {
    name.find("$$Lambda+").is_some_and(|i| i > 0)
}

/// Logs the classes of the default subgraph that are not among the expected
/// handful. Returns how many were logged.
pub fn check_default_subgraph_classes(rt: &Runtime, config: &CdsConfig, info: &KlassSubGraphInfo) -> usize {
    let mut unusual = 0;
    for (i, &k) in info.object_klasses.iter().enumerate() {
        let klass = rt.klass(k);
        info!(target: "cds::heap", "Archived object klass (default subgraph {}) => {}", i, klass.external_name());
        if !klass.is_instance() {
            continue;
        }
        let expected = matches!(klass.name.as_str(), "java/lang/Class" | "java/lang/String");
        if !expected && !is_archivable_hidden(rt, config, k) {
            unusual += 1;
            info!(target: "cds", "Archived unusual klass (default subgraph {}) => {}", unusual, klass.external_name());
        }
    }
    unusual
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::LoaderKind;

    #[test]
    fn test_early_and_array_classes_not_recorded() {
        let rt = KlassBuilder::bootstrap_runtime();
        let config = CdsConfig::default();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let mut info = KlassSubGraphInfo::new(holder, RootGroup::Default);
        for name in [OBJECT_CLASS, STRING_CLASS, OBJECT_ARRAY_CLASS, "[I", "java/lang/Integer$IntegerCache"] {
            info.add_object_klass(&rt, &config, rt.boot_class(name).unwrap()).unwrap();
        }
        assert!(info.object_klasses.is_empty());

        let boxes = rt.boot_class("[Ljava/lang/Integer;").unwrap();
        let integer = rt.boot_class("java/lang/Integer").unwrap();
        info.add_object_klass(&rt, &config, boxes).unwrap();
        info.add_object_klass(&rt, &config, integer).unwrap();
        info.add_object_klass(&rt, &config, integer).unwrap();
        assert_eq!(info.object_klasses, vec![boxes, integer]);
        assert!(!info.has_non_early_klasses);
    }

    #[test]
    fn test_app_class_is_rejected() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let app = KlassBuilder::new("app/Data", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let mut info = KlassSubGraphInfo::new(holder, RootGroup::Default);
        assert_eq!(
            info.add_object_klass(&rt, &CdsConfig::default(), app),
            Err(KlassRejection::NotInJavaBase)
        );
    }

    #[test]
    fn test_non_early_only_outside_module_graph() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let config = CdsConfig::default();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let map = KlassBuilder::new("java/util/TreeMap", LoaderKind::Boot)
            .super_class(&rt, OBJECT_CLASS)
            .build(&mut rt);

        let mut info = KlassSubGraphInfo::new(holder, RootGroup::Default);
        info.add_object_klass(&rt, &config, map).unwrap();
        assert!(info.has_non_early_klasses);

        let mut fmg = KlassSubGraphInfo::new(holder, RootGroup::FullModuleGraph);
        fmg.add_object_klass(&rt, &config, map).unwrap();
        assert!(!fmg.has_non_early_klasses);
    }

    #[test]
    fn test_only_unexpected_instance_classes_are_unusual() {
        let rt = KlassBuilder::bootstrap_runtime();
        let config = CdsConfig::default();
        let holder = rt.boot_class("java/lang/Integer$IntegerCache").unwrap();
        let mut info = KlassSubGraphInfo::new(holder, RootGroup::Default);
        for name in [STRING_CLASS, OBJECT_ARRAY_CLASS, "[Ljava/lang/Integer;", "java/lang/Integer"] {
            info.object_klasses.push(rt.boot_class(name).unwrap());
        }
        assert_eq!(check_default_subgraph_classes(&rt, &config, &info), 1);
    }

    #[test]
    fn test_hidden_class_names() {
        assert!(is_lambda_form_name("java/lang/invoke/LambdaForm$MH+0x0000000801000400"));
        assert!(!is_lambda_form_name("java/lang/invoke/LambdaForm$Holder"));
        assert!(is_lambda_proxy_name("app/Main$$Lambda+0x00000008"));
        assert!(!is_lambda_proxy_name("$$Lambda+"));
    }
}
