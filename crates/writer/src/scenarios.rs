//! End-to-end runs: a training runtime is dumped to a file, the file is mapped
//! and restored into a fresh runtime built from the same class definitions.

use crate::header::deterministic_bytes;
use crate::{ArchiveImage, DumpSession, LoadError, MappedArchive, RestoredArchive, ALTERNATE_BASE_OFFSET};
use archiver::RootField;
use classlist::ClassListParser;
use common::builder::KlassBuilder;
use common::runtime::OBJECT_CLASS;
use common::{
    BasicType, CdsConfig, ClassState, ConstantValue, CpTag, FieldFlags, KlassFlags, KlassId, LoaderKind, MethodFlags, ObjectBody,
    Runtime, Value,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LAMBDA_LINE: &str =
    "@lambda-proxy app/Main run ()Ljava/lang/Runnable; ()V REF_invokeStatic app/Main lambda$main$0 ()V ()V";

fn dump(rt: Runtime, config: CdsConfig, classlist: &str, roots: &[RootField]) -> ArchiveImage {
    let mut session = DumpSession::new(rt, config).unwrap();
    for &field in roots {
        session.add_root_field(field);
    }
    let list = ClassListParser::new("scenario.classlist").parse_str(classlist).unwrap();
    session.apply_class_list(&list).unwrap();
    session.dump().unwrap()
}

fn write(image: &ArchiveImage) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.aot");
    image.write_to(&path).unwrap();
    (dir, path)
}

fn restore(path: &Path, config: &CdsConfig, rt: &mut Runtime) -> (MappedArchive, RestoredArchive) {
    let archive = MappedArchive::open(path, config).unwrap();
    let restored = RestoredArchive::restore(&archive, rt, config).unwrap();
    (archive, restored)
}

fn app_class(rt: &mut Runtime, name: &str) -> KlassId {
    KlassBuilder::new(name, LoaderKind::App)
        .super_class(rt, OBJECT_CLASS)
        .build(rt)
}

/// Element `i` of an object array.
fn element(rt: &Runtime, array: common::ObjectId, i: usize) -> Option<common::ObjectId> {
    match &rt.heap[array].body {
        ObjectBody::ObjArray { elements } => elements.get(i).copied().and_then(Value::as_ref),
        _ => None,
    }
}

#[test]
fn test_integer_cache_is_mapped_before_user_code() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    let cache = KlassBuilder::populate_integer_cache(&mut rt).unwrap();
    let zero = element(&rt, cache, 128).unwrap();
    let cache_hash = rt.heap.identity_hash(cache).unwrap();
    let zero_hash = rt.heap.identity_hash(zero).unwrap();

    let image = dump(rt, CdsConfig::default(), "", &[]);
    assert!(image.summary.subgraphs > 0);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (_archive, restored) = restore(&path, &config, &mut prod);
    assert!(restored.report().heap_objects > 256);

    let holder = prod.boot_class("java/lang/Integer$IntegerCache").unwrap();
    assert!(!prod.klass(holder).state.is_initialized());
    let Some(Value::Ref(array)) = prod.static_value(holder, 0) else {
        panic!("integer cache is not installed");
    };
    assert_eq!(prod.heap[array].length(), 256);
    assert_eq!(prod.klass(prod.heap[array].klass).name, "[Ljava/lang/Integer;");

    let boxed = element(&prod, array, 128).unwrap();
    assert_eq!(element(&prod, array, 128), Some(boxed));
    assert_eq!(prod.heap[boxed].slots()[0], Value::Prim(0));
    assert_eq!(prod.heap[element(&prod, array, 0).unwrap()].slots()[0], Value::Prim(-128));

    assert_eq!(prod.heap[array].identity_hash, cache_hash);
    assert_eq!(prod.heap[boxed].identity_hash, zero_hash);
}

#[test]
fn test_class_reference_is_resolved_without_the_resolver() {
    let define = |rt: &mut Runtime| {
        let a = app_class(rt, "app/A");
        let index = rt.klass_mut(a).constants.add_class(OBJECT_CLASS);
        (a, index)
    };
    let mut rt = KlassBuilder::bootstrap_runtime();
    let (_, index) = define(&mut rt);
    assert_eq!(index, 2);
    let image = dump(rt, CdsConfig::default(), &format!("app/A\n@cp app/A {index}\n"), &[]);
    assert_eq!(image.report.preresolve.resolved, 1);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (a, _) = define(&mut prod);
    let (_archive, restored) = restore(&path, &config, &mut prod);
    assert!(restored.report().cp_entries >= 1);

    let object = prod.boot_class(OBJECT_CLASS);
    assert_eq!(prod.klass(a).constants.tag_at(index), CpTag::Class);
    assert_eq!(prod.klass(a).constants.resolved_klass_at(index), object);
    assert_eq!(prod.stats.class_resolutions, 0);

    // The lazy path agrees with the archived resolution.
    let mut lazy = KlassBuilder::bootstrap_runtime();
    let (a, _) = define(&mut lazy);
    let target = lazy.resolve_klass_at(a, index).unwrap();
    assert_eq!(lazy.klasses.name(target), prod.klasses.name(object.unwrap()));
}

#[test]
fn test_signed_class_reference_stays_unresolved() {
    let define = |rt: &mut Runtime| {
        KlassBuilder::new("app/Signed", LoaderKind::App)
            .super_class(rt, OBJECT_CLASS)
            .flags(KlassFlags::SIGNED)
            .build(rt);
        let referrer = app_class(rt, "app/Referrer");
        let index = rt.klass_mut(referrer).constants.add_class("app/Signed");
        (referrer, index)
    };
    let mut rt = KlassBuilder::bootstrap_runtime();
    let (_, index) = define(&mut rt);
    let text = format!("app/Signed\napp/Referrer\n@cp app/Referrer {index}\n");
    let image = dump(rt, CdsConfig::default(), &text, &[]);
    assert_eq!(image.report.preresolve.requested, 1);
    assert_eq!(image.report.preresolve.resolved, 0);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (referrer, _) = define(&mut prod);
    let (archive, restored) = restore(&path, &config, &mut prod);
    assert!(archive.lookup_builtin("app/Signed").is_empty());
    let record = archive.lookup_builtin("app/Referrer")[0];
    assert!(archive.class_table().classes[record as usize]
        .resolved_klasses
        .iter()
        .all(|r| r.index.to_native() != index));
    assert_eq!(restored.klass(record), Some(referrer));
    assert_eq!(prod.klass(referrer).constants.tag_at(index), CpTag::UnresolvedClass);
}

#[test]
fn test_redefined_super_excludes_subclass_and_its_subgraph() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    let a = app_class(&mut rt, "app/A");
    let b = KlassBuilder::new("app/B", LoaderKind::App)
        .super_class(&rt, "app/A")
        .static_field("DATA", "[I", FieldFlags::FINAL)
        .build(&mut rt);
    let data = rt.new_type_array(BasicType::Int, vec![1, 2, 3]).unwrap();
    rt.set_static_value(b, 0, Value::Ref(data));
    rt.klass_mut(a).flags |= KlassFlags::REDEFINED;

    let root = RootField {
        holder: "app/B",
        field: "DATA",
    };
    let image = dump(rt, CdsConfig::default(), "app/A\napp/B\n", &[root]);
    assert!(image.report.classes_excluded >= 2);
    let (_dir, path) = write(&image);

    let archive = MappedArchive::open(&path, &CdsConfig::default()).unwrap();
    assert!(archive.lookup_builtin("app/A").is_empty());
    assert!(archive.lookup_builtin("app/B").is_empty());
    for sg in archive.subgraph_table().subgraphs.iter() {
        let holder = archive.class_view(sg.holder.to_native()).unwrap();
        assert_ne!(holder.name, "app/B");
    }
}

#[test]
fn test_oversize_root_is_archived_as_null() {
    let define = |rt: &mut Runtime| {
        KlassBuilder::new("app/Holder", LoaderKind::App)
            .super_class(rt, OBJECT_CLASS)
            .static_field("BIG", "[I", FieldFlags::empty())
            .static_field("SMALL", "[I", FieldFlags::empty())
            .build(rt)
    };
    let mut rt = KlassBuilder::bootstrap_runtime();
    let holder = define(&mut rt);
    let big = rt.new_type_array(BasicType::Int, vec![7; 100_000]).unwrap();
    let small = rt.new_type_array(BasicType::Int, vec![1, 2, 3]).unwrap();
    rt.set_static_value(holder, 0, Value::Ref(big));
    rt.set_static_value(holder, 1, Value::Ref(small));

    let roots = [
        RootField {
            holder: "app/Holder",
            field: "BIG",
        },
        RootField {
            holder: "app/Holder",
            field: "SMALL",
        },
    ];
    let image = dump(rt, CdsConfig::default(), "app/Holder\n", &roots);
    assert_eq!(image.report.heap.dropped_roots, 1);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let holder = define(&mut prod);
    let (_archive, restored) = restore(&path, &config, &mut prod);
    assert!(restored.report().subgraphs_installed >= 1);
    assert_eq!(prod.static_value(holder, 0), Some(Value::Null));
    let Some(Value::Ref(array)) = prod.static_value(holder, 1) else {
        panic!("SMALL is not installed");
    };
    match &prod.heap[array].body {
        ObjectBody::TypeArray { element, values } => {
            assert_eq!(*element, BasicType::Int);
            assert_eq!(values, &vec![1, 2, 3]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

fn lambda_app(rt: &mut Runtime, later_flags: KlassFlags) -> (KlassId, u16, KlassId) {
    let main = KlassBuilder::new("app/Main", LoaderKind::App)
        .super_class(rt, OBJECT_CLASS)
        .method("lambda$main$0", "()V", MethodFlags::STATIC)
        .build(rt);
    let site = KlassBuilder::add_lambda_site(rt, main, "run", "()Ljava/lang/Runnable;");
    let later = KlassBuilder::new("app/Later", LoaderKind::App)
        .super_class(rt, OBJECT_CLASS)
        .flags(later_flags)
        .build(rt);
    (main, site, later)
}

#[test]
fn test_init_list_replay_at_start_up() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    let (main, site, later) = lambda_app(&mut rt, KlassFlags::empty());
    for name in ["java/lang/String", "java/util/HashMap"] {
        let k = rt.boot_class(name).unwrap();
        rt.initialize_class(k).unwrap();
    }
    rt.initialize_class(main).unwrap();
    rt.resolve_indy_at(main, site).unwrap();
    rt.initialize_class(later).unwrap();

    let image = dump(rt, CdsConfig::default(), &format!("app/Main\napp/Later\n{LAMBDA_LINE}\n"), &[]);
    assert!(image.summary.init_entries >= 4);
    assert_eq!(image.summary.lambda_sites, 1);
    let (_dir, path) = write(&image);

    // The production run's `app/Later` initializer throws.
    let mut config = CdsConfig::default();
    config.apply_option("-XX:PreloadArchivedClasses=2").unwrap();
    config.apply_option("-XX:Preresolve=2").unwrap();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (main, site, later) = lambda_app(&mut prod, KlassFlags::CLINIT_FAILS);
    let (_archive, restored) = restore(&path, &config, &mut prod);
    assert_eq!(restored.report().hidden_defined, 1);

    let startup = restored.start_up(&mut prod, &config);
    assert!(startup.replay.failures >= 1);
    for name in ["java/lang/String", "java/util/HashMap"] {
        let k = prod.boot_class(name).unwrap();
        assert!(prod.klass(k).state.is_initialized(), "{name} not initialized");
    }
    assert_eq!(prod.klass(later).state, ClassState::InitializationError);

    let cs = prod.klass(main).constants.cache.indys.get(&site).cloned();
    let target = cs.and_then(|cs| cs.target).expect("lambda site not resolved");
    assert!(prod.klasses.name(target).starts_with("app/Main$$Lambda+"));
    assert_eq!(prod.klass(target).nest_host, Some(main));
}

#[test]
fn test_init_list_replay_with_everything_enabled_never_aborts() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    let (main, site, later) = lambda_app(&mut rt, KlassFlags::empty());
    rt.initialize_class(main).unwrap();
    rt.resolve_indy_at(main, site).unwrap();
    rt.initialize_class(later).unwrap();
    let image = dump(rt, CdsConfig::default(), "app/Main\napp/Later\n", &[]);
    let (_dir, path) = write(&image);

    let mut config = CdsConfig::default();
    config.apply_option("-XX:PreloadArchivedClasses=2").unwrap();
    config.apply_option("-XX:Preresolve=7").unwrap();
    config.apply_option("-XX:+PreloadSharedClasses").unwrap();
    config.apply_option("-XX:+PrelinkSharedClasses").unwrap();
    let mut prod = KlassBuilder::bootstrap_runtime();
    // Production classes that fail every step the list asks for.
    let (main, _, _) = lambda_app(&mut prod, KlassFlags::CLINIT_FAILS | KlassFlags::VERIFY_FAILS);
    prod.klass_mut(main).flags |= KlassFlags::CLINIT_FAILS;
    let (_archive, restored) = restore(&path, &config, &mut prod);
    let startup = restored.start_up(&mut prod, &config);
    assert!(startup.replay.failures >= 1);
    assert!(!prod.klass(main).state.is_initialized());
}

fn greeter(rt: &mut Runtime) -> KlassId {
    KlassBuilder::new("app/Greeter", LoaderKind::App)
        .super_class(rt, OBJECT_CLASS)
        .static_field_init(
            "GREETING",
            "Ljava/lang/String;",
            FieldFlags::FINAL,
            ConstantValue::Str("hello".into()),
        )
        .build(rt)
}

#[test]
fn test_reference_field_init_survives_the_archive() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    let k = greeter(&mut rt);
    rt.initialize_class(k).unwrap();
    let image = dump(rt, CdsConfig::default(), "app/Greeter\n", &[]);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let k = greeter(&mut prod);
    let (_archive, restored) = restore(&path, &config, &mut prod);
    let Some(Value::Ref(obj)) = restored.init_list().lookup_static_field_value(k, 0) else {
        panic!("GREETING has no archived value");
    };
    assert!(matches!(&prod.heap[obj].body, ObjectBody::Str { value } if value == "hello"));
}

#[test]
fn test_two_dumps_are_identical() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    KlassBuilder::populate_integer_cache(&mut rt).unwrap();
    let (main, site, _) = lambda_app(&mut rt, KlassFlags::empty());
    rt.initialize_class(main).unwrap();
    rt.resolve_indy_at(main, site).unwrap();
    let text = format!("app/Main\napp/Later\n{LAMBDA_LINE}\n");

    let first = dump(rt.clone(), CdsConfig::default(), &text, &[]);
    let second = dump(rt, CdsConfig::default(), &text, &[]);
    assert_eq!(first.bytes.len(), second.bytes.len());
    assert_eq!(deterministic_bytes(&first.bytes), deterministic_bytes(&second.bytes));
}

#[test]
fn test_subgraph_roots_have_recorded_classes() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    KlassBuilder::populate_integer_cache(&mut rt).unwrap();
    let image = dump(rt, CdsConfig::default(), "", &[]);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (archive, restored) = restore(&path, &config, &mut prod);
    let metadata = archive.metadata();
    let mut checked = 0;
    for sg in archive.subgraph_table().subgraphs.iter() {
        let view = metadata.subgraph(sg.record.to_native() as usize).unwrap();
        let recorded: Vec<Option<KlassId>> = view
            .klass_records
            .iter()
            .map(|&rec| restored.klass(metadata.class(rec).unwrap().index))
            .collect();
        for &(_, root) in &view.entry_fields {
            let Some(obj) = restored.root(root) else { continue };
            let k = prod.heap[obj].klass;
            assert!(
                prod.klass(k).is_type_array() || recorded.contains(&Some(k)),
                "root {root} has unrecorded class {}",
                prod.klasses.name(k)
            );
            checked += 1;
        }
    }
    assert!(checked > 0);
}

#[test]
fn test_unregistered_class_is_handed_out_once() {
    let classfile = b"\xca\xfe\xba\xbe plugin".to_vec();
    let mut rt = KlassBuilder::bootstrap_runtime();
    KlassBuilder::new("app/Plugin", LoaderKind::Unregistered)
        .super_class(&rt, OBJECT_CLASS)
        .source("/opt/p.jar")
        .classfile(classfile.clone())
        .build(&mut rt);
    let text = "java/lang/Object id: 0\napp/Plugin id: 1 super: 0 source: /opt/p.jar\n";
    let image = dump(rt, CdsConfig::default(), text, &[]);
    let (_dir, path) = write(&image);

    let config = CdsConfig::default();
    let mut prod = KlassBuilder::bootstrap_runtime();
    let (archive, restored) = restore(&path, &config, &mut prod);
    assert!(archive.lookup_unregistered("app/Plugin").is_some());
    assert!(archive.lookup_builtin("app/Plugin").is_empty());

    assert_eq!(restored.lookup_unregistered(&mut prod, "app/Plugin", b"other bytes"), None);
    let k = restored
        .lookup_unregistered(&mut prod, "app/Plugin", &classfile)
        .expect("archived class rejected");
    assert_eq!(prod.klass(k).loader, LoaderKind::Unregistered);
    assert_eq!(prod.klass(k).super_klass, prod.boot_class(OBJECT_CLASS));
    assert!(prod.klass(k).state.is_loaded());
    assert_eq!(restored.lookup_unregistered(&mut prod, "app/Plugin", &classfile), None);
}

#[test]
fn test_relocation_modes() {
    let mut rt = KlassBuilder::bootstrap_runtime();
    KlassBuilder::populate_integer_cache(&mut rt).unwrap();
    let image = dump(rt, CdsConfig::default(), "", &[]);
    let (_dir, path) = write(&image);

    let base = CdsConfig::default();
    let at_requested = MappedArchive::open(&path, &base).unwrap();
    assert_eq!(at_requested.relocation_delta(), 0);
    let names: Vec<String> = (0..at_requested.class_count() as u32)
        .map(|i| at_requested.class_view(i).unwrap().name.to_string())
        .collect();

    let moved = CdsConfig {
        shared_base_address: base.shared_base_address + 0x1000_0000,
        ..base.clone()
    };
    let relocated = MappedArchive::open(&path, &moved).unwrap();
    assert_eq!(relocated.relocation_delta(), 0x1000_0000);
    assert!(relocated.relocated_pointers() > 0);
    let relocated_names: Vec<String> = (0..relocated.class_count() as u32)
        .map(|i| relocated.class_view(i).unwrap().name.to_string())
        .collect();
    assert_eq!(names, relocated_names);

    let always = CdsConfig {
        archive_relocation_mode: 1,
        ..base.clone()
    };
    let alt = MappedArchive::open(&path, &always).unwrap();
    assert_eq!(alt.relocation_delta(), ALTERNATE_BASE_OFFSET as i64);
    let mut prod = KlassBuilder::bootstrap_runtime();
    let restored = RestoredArchive::restore(&alt, &mut prod, &always).unwrap();
    assert_eq!(restored.report().classes_skipped, 0);

    let never = CdsConfig {
        archive_relocation_mode: 2,
        ..moved
    };
    assert!(matches!(
        MappedArchive::open(&path, &never),
        Err(LoadError::RelocationRefused { .. })
    ));
}

#[test]
fn test_verify_shared_spaces_detects_corruption() {
    let rt = KlassBuilder::bootstrap_runtime();
    let mut image = dump(rt, CdsConfig::default(), "", &[]);
    let last = image.bytes.len() - 1;
    image.bytes[last] ^= 0xff;
    let (_dir, path) = write(&image);

    let config = CdsConfig {
        verify_shared_spaces: true,
        ..CdsConfig::default()
    };
    assert!(matches!(
        MappedArchive::open(&path, &config),
        Err(LoadError::CrcMismatch { .. })
    ));
}
