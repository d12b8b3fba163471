//! Lays out an archive image from the results of a dump.

use crate::compact::CompactHashtableBuilder;
use crate::header::{align_up, stamp_crc, FileHeader, HeaderFlags, SectionEntry, SectionKind, SECTION_ALIGNMENT};
use crate::metadata::{encode_bitmap, kind_code, ClassHeader, Loc, MetadataBuilder};
use crate::records::*;
use crate::DumpError;
use archiver::{HeapArchiver, HeapRegionWriter};
use common::{CdsConfig, KlassId, LoaderKind, ObjectBody, ObjectId, Runtime, Value};
use dumptime::{DumpTimeTable, LambdaProxyDictionary, PreinitVerdict};
use initlist::{InitInfo, InitList};
use precompiler::TrainingData;
use prelinker::PreloadedKlasses;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

macro_rules! encode_section {
    ($name:expr, $value:expr) => {
        rkyv::to_bytes::<rkyv::rancor::Error>(&$value)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| DumpError::Encode {
                section: $name,
                reason: e.to_string(),
            })?
    };
}

/// Everything a finished dump hands to the builder.
pub struct DumpArtifacts<'a> {
    pub rt: &'a Runtime,
    pub config: &'a CdsConfig,
    pub table: &'a DumpTimeTable,
    /// Class-table order.
    pub classes: &'a [KlassId],
    pub heap: &'a HeapArchiver<'a>,
    pub init_list: &'a InitList,
    pub lambdas: &'a LambdaProxyDictionary,
    pub training: &'a TrainingData,
    pub preloaded: &'a PreloadedKlasses,
    pub platform_initiated: &'a [KlassId],
    pub app_initiated: &'a [KlassId],
    pub reflection_data: &'a BTreeMap<KlassId, u32>,
    pub lambda_form_invokers: &'a [String],
    pub precompiled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub classes: usize,
    pub heap_objects: usize,
    pub heap_bytes: usize,
    pub roots: usize,
    pub subgraphs: usize,
    pub init_entries: usize,
    pub lambda_sites: usize,
    pub method_data: usize,
    pub interned_strings: usize,
    pub relocatable_pointers: usize,
    pub file_size: usize,
}

pub struct ArchiveBuilder<'a> {
    art: &'a DumpArtifacts<'a>,
    index: BTreeMap<KlassId, u32>,
    summary: ArchiveSummary,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(art: &'a DumpArtifacts<'a>) -> Self {
        let index = art
            .classes
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u32))
            .collect();
        Self {
            art,
            index,
            summary: ArchiveSummary::default(),
        }
    }

    fn idx(&self, k: KlassId) -> Option<u32> {
        self.index.get(&k).copied()
    }

    fn name(&self, k: KlassId) -> &'a str {
        self.art.rt.klasses.name(k)
    }

    /// Builds the complete image, CRC included.
    pub fn build(mut self) -> Result<(Vec<u8>, ArchiveSummary), DumpError> {
        let art = self.art;
        let (region, offsets) = HeapRegionWriter::new().write(art.rt, art.heap, |k| self.idx(k))?;
        self.summary.heap_objects = offsets.len();
        self.summary.heap_bytes = region.bytes.len();
        self.summary.roots = region.roots.len();

        let mut meta = MetadataBuilder::new();
        let recs = self.class_metadata(&mut meta);
        let subgraphs = self.subgraph_metadata(&mut meta, &recs);
        let mut symbols = CompactHashtableBuilder::new();
        for (s, loc) in meta.symbols() {
            symbols.add(s, loc.byte_offset() as u32);
        }
        let meta = meta.finish(art.config.shared_base_address);
        self.summary.relocatable_pointers = meta.ptrmap.count_ones();

        let classes = self.class_table(&recs);
        let (builtin, unregistered) = self.dictionaries();
        let (lambda_dict, lambda_sites) = self.lambda_sites();
        let (method_dict, methods) = self.method_data();
        let strings = self.string_table(&offsets);
        let init = self.init_list();

        let mut payloads: Vec<(SectionKind, Vec<u8>)> = vec![
            (SectionKind::RwMetadata, meta.rw),
            (SectionKind::RoMetadata, meta.ro),
            (SectionKind::MetadataPtrmap, encode_bitmap(&meta.ptrmap)),
            (SectionKind::HeapRegion, region.bytes.clone()),
            (SectionKind::HeapOopmap, encode_bitmap(&region.oopmap)),
            (SectionKind::HeapPtrmap, encode_bitmap(&region.ptrmap)),
        ];
        payloads.push((SectionKind::HeapRoots, encode_section!("heap-roots", self.heap_roots(&region.roots))));
        payloads.push((SectionKind::ClassTable, encode_section!("classes", classes)));
        payloads.push((SectionKind::BuiltinDictionary, builtin.build()));
        payloads.push((SectionKind::UnregisteredDictionary, unregistered.build()));
        payloads.push((SectionKind::LambdaProxyDictionary, lambda_dict.build()));
        payloads.push((SectionKind::LambdaProxyRecords, encode_section!("lambda-proxies", lambda_sites)));
        payloads.push((SectionKind::MethodDataDictionary, method_dict.build()));
        payloads.push((SectionKind::MethodDataRecords, encode_section!("method-data", methods)));
        payloads.push((SectionKind::SubgraphInfos, encode_section!("subgraph-infos", subgraphs)));
        payloads.push((SectionKind::InitList, encode_section!("init-list", init)));
        payloads.push((SectionKind::SymbolTable, symbols.build()));
        payloads.push((SectionKind::StringTable, strings.build()));
        payloads.push((SectionKind::PreloadedClasses, encode_section!("preloaded-classes", self.preloaded())));
        payloads.push((SectionKind::ReflectionData, encode_section!("reflection-data", self.reflection_data())));
        payloads.push((
            SectionKind::LambdaFormInvokers,
            encode_section!(
                "lambda-form-invokers",
                LambdaFormInvokers {
                    lines: art.lambda_form_invokers.to_vec(),
                }
            ),
        ));

        let image = self.assemble(payloads);
        self.summary.file_size = image.len();
        info!(
            target: "cds",
            "Archive: {} classes, {} heap objects ({} bytes), {} roots, {} subgraphs, {} init entries, {} bytes",
            self.summary.classes,
            self.summary.heap_objects,
            self.summary.heap_bytes,
            self.summary.roots,
            self.summary.subgraphs,
            self.summary.init_entries,
            self.summary.file_size
        );
        Ok((image, self.summary))
    }

    fn class_metadata(&mut self, meta: &mut MetadataBuilder) -> Vec<Loc> {
        let rt = self.art.rt;
        let recs: Vec<Loc> = self
            .art
            .classes
            .iter()
            .enumerate()
            .map(|(i, &k)| {
                let klass = rt.klass(k);
                let header = ClassHeader {
                    loader: klass.loader,
                    kind: kind_code(klass.kind),
                    state: klass.state,
                    flags: klass.flags.bits(),
                };
                meta.add_class(&klass.name, header, i as u32)
            })
            .collect();
        for (i, &k) in self.art.classes.iter().enumerate() {
            let klass = rt.klass(k);
            let super_rec = klass.super_klass.and_then(|s| self.idx(s)).map(|s| recs[s as usize]);
            let interfaces: Vec<Loc> = klass
                .interfaces
                .iter()
                .filter_map(|&itf| self.idx(itf))
                .map(|itf| recs[itf as usize])
                .collect();
            meta.link_class(recs[i], super_rec, &interfaces);
        }
        self.summary.classes = recs.len();
        recs
    }

    fn subgraph_metadata(&mut self, meta: &mut MetadataBuilder, recs: &[Loc]) -> SubgraphTable {
        let mut out = SubgraphTable::default();
        for sg in self.art.heap.subgraphs() {
            let Some(holder) = self.idx(sg.holder) else {
                warn!(target: "cds::heap", "Subgraph holder {} is not archived", self.name(sg.holder));
                continue;
            };
            let klasses: Vec<Loc> = sg
                .object_klasses
                .iter()
                .filter_map(|&k| self.idx(k))
                .map(|k| recs[k as usize])
                .collect();
            let rec = meta.add_subgraph(
                recs[holder as usize],
                sg.is_full_module_graph,
                sg.has_non_early_klasses,
                &sg.entry_fields,
                &klasses,
            );
            out.subgraphs.push(SubgraphRef {
                holder,
                record: rec.byte_offset() as u32,
            });
        }
        self.summary.subgraphs = out.subgraphs.len();
        out
    }

    fn class_table(&self, recs: &[Loc]) -> ClassTable {
        let art = self.art;
        let rt = art.rt;
        let mut classes = Vec::with_capacity(recs.len());
        for (i, &k) in art.classes.iter().enumerate() {
            let klass = rt.klass(k);
            let cp = &klass.constants;
            let info = art.table.get(k);
            let mut rec = ClassRecord {
                meta: recs[i].byte_offset() as u32,
                mirror_root: art.heap.mirror_roots().get(&k).copied(),
                preinited: info.is_some_and(|i| i.preinit == PreinitVerdict::Ok),
                nest_host: info.and_then(|i| i.nest_host).or(klass.nest_host).and_then(|h| self.idx(h)),
                classfile_size: info.map_or(klass.classfile.len() as u32, |i| i.classfile_size),
                classfile_crc32: info.map_or_else(|| crc32fast::hash(&klass.classfile), |i| i.classfile_crc32),
                ..ClassRecord::default()
            };
            for index in 1..cp.len() as u16 {
                if let Some(target) = cp.resolved_klass_at(index) {
                    match self.idx(target) {
                        Some(target) => rec.resolved_klasses.push(ResolvedKlassRecord { index, target }),
                        None => debug!(
                            target: "cds::resolve",
                            "{} [{}]: {} is not archived",
                            klass.external_name(),
                            index,
                            self.name(target)
                        ),
                    }
                }
            }
            for (&index, f) in &cp.cache.fields {
                if let Some(holder) = self.idx(f.holder) {
                    rec.resolved_fields.push(ResolvedFieldRecord {
                        index,
                        holder,
                        slot: f.slot,
                        is_static: f.is_static,
                    });
                }
            }
            for (&index, &m) in &cp.cache.methods {
                let Some(method) = rt.method(m) else { continue };
                if let Some(holder) = self.idx(method.holder) {
                    rec.resolved_methods.push(ResolvedMethodRecord {
                        index,
                        holder,
                        name: method.name.clone(),
                        signature: method.signature.clone(),
                    });
                }
            }
            for (&index, cs) in &cp.cache.indys {
                let target = match cs.target {
                    Some(t) => match self.idx(t) {
                        Some(t) => Some(t),
                        None => continue,
                    },
                    None => None,
                };
                rec.resolved_indys.push(ResolvedIndyRecord {
                    index,
                    bootstrap_class: cs.bootstrap_class.clone(),
                    bootstrap_name: cs.bootstrap_name.clone(),
                    target,
                });
            }
            if let Some(info) = info {
                rec.verification_constraints = info
                    .verification_constraints
                    .iter()
                    .map(|c| VerificationRecord {
                        target_name: c.target_name.clone(),
                        from_name: c.from_name.clone(),
                        flags: c.flags.bits(),
                    })
                    .collect();
                rec.linking_constraints = info
                    .linking_constraints
                    .iter()
                    .map(|c| LinkingRecord {
                        symbol: c.symbol.clone(),
                        loader1: c.loader1 as u8,
                        loader2: c.loader2 as u8,
                    })
                    .collect();
                rec.enum_static_roots = info.enum_static_roots.clone();
            }
            classes.push(rec);
        }
        ClassTable { classes }
    }

    fn dictionaries(&self) -> (CompactHashtableBuilder, CompactHashtableBuilder) {
        let mut builtin = CompactHashtableBuilder::new();
        let mut unregistered = CompactHashtableBuilder::new();
        for (i, &k) in self.art.classes.iter().enumerate() {
            let klass = self.art.rt.klass(k);
            if klass.is_hidden() || klass.is_array() {
                continue;
            }
            match klass.loader {
                LoaderKind::Unregistered => unregistered.add(&klass.name, i as u32),
                _ => builtin.add(&klass.name, i as u32),
            }
        }
        (builtin, unregistered)
    }

    fn lambda_sites(&mut self) -> (CompactHashtableBuilder, LambdaTable) {
        let mut dict = CompactHashtableBuilder::new();
        let mut table = LambdaTable::default();
        for (key, proxies) in self.art.lambdas.iter() {
            let (Some(caller), Some(member_holder)) = (self.idx(key.caller), self.idx(key.member_holder)) else {
                continue;
            };
            let proxies: Vec<u32> = proxies.iter().filter_map(|&p| self.idx(p)).collect();
            if proxies.is_empty() {
                continue;
            }
            dict.add(
                &lambda_site_key(self.name(key.caller), &key.invoked_name, &key.invoked_type, &key.method_type),
                table.sites.len() as u32,
            );
            table.sites.push(LambdaRecord {
                caller,
                invoked_name: key.invoked_name.clone(),
                invoked_type: key.invoked_type.clone(),
                method_type: key.method_type.clone(),
                member_holder,
                member_name: key.member_name.clone(),
                member_signature: key.member_signature.clone(),
                instantiated_method_type: key.instantiated_method_type.clone(),
                proxies,
            });
        }
        self.summary.lambda_sites = table.sites.len();
        (dict, table)
    }

    fn method_data(&mut self) -> (CompactHashtableBuilder, MethodDataTable) {
        let mut dict = CompactHashtableBuilder::new();
        let mut table = MethodDataTable::default();
        for rec in self.art.training.records() {
            let holder = rec
                .method
                .and_then(|m| self.art.rt.method(m))
                .and_then(|m| self.idx(m.holder));
            let Some(holder) = holder else {
                debug!(target: "precompile", "No archived holder for {}.{}{}", rec.holder, rec.name, rec.signature);
                continue;
            };
            dict.add(&method_key(&rec.holder, &rec.name, &rec.signature), table.methods.len() as u32);
            table.methods.push(MethodDataRecord {
                holder,
                name: rec.name.clone(),
                signature: rec.signature.clone(),
                compiles: rec
                    .compiles
                    .iter()
                    .map(|c| CompileRecordData {
                        level: c.level,
                        compile_id: c.compile_id,
                    })
                    .collect(),
            });
        }
        self.summary.method_data = table.methods.len();
        (dict, table)
    }

    /// Interned strings by value, to their heap region offset.
    fn string_table(&mut self, offsets: &BTreeMap<ObjectId, u32>) -> CompactHashtableBuilder {
        let mut dict = CompactHashtableBuilder::new();
        let rt = self.art.rt;
        let array = self
            .art
            .heap
            .special_roots()
            .interned_strings
            .and_then(|root| self.art.heap.roots().get(root));
        let Some(array) = array else {
            return dict;
        };
        let Some(ObjectBody::ObjArray { elements }) = rt.heap.get(array).map(|o| &o.body) else {
            return dict;
        };
        for s in elements.iter().filter_map(|v| v.as_ref()) {
            let (Some(value), Some(&off)) = (rt.heap.get(s).and_then(|o| o.as_str()), offsets.get(&s)) else {
                continue;
            };
            dict.add(value, off);
        }
        self.summary.interned_strings = dict.len();
        dict
    }

    fn heap_roots(&self, roots: &[u32]) -> HeapRootsRecord {
        let heap = self.art.heap;
        let special = heap.special_roots();
        HeapRootsRecord {
            roots: roots.to_vec(),
            mirrors: heap
                .mirror_roots()
                .iter()
                .filter_map(|(&k, &root)| self.idx(k).map(|class| MirrorRootRecord { class, root }))
                .collect(),
            primitive_mirrors: special
                .primitive_mirrors
                .iter()
                .map(|&(bt, root)| PrimitiveMirrorRecord {
                    basic_type: bt as u8,
                    root,
                })
                .collect(),
            interned_strings: special.interned_strings,
            exceptions: special.exceptions.clone(),
            permanent_first_root: heap.permanent().map(|p| p.first_root()),
            permanent_segments: heap.permanent().map_or(0, |p| p.segment_count() as u32),
        }
    }

    fn init_list(&mut self) -> InitListRecord {
        let rt = self.art.rt;
        let mut entries = Vec::with_capacity(self.art.init_list.len());
        for entry in self.art.init_list.entries() {
            let Some(k) = entry.holder() else {
                entries.push(InitRecord::Invalid);
                continue;
            };
            let Some(holder) = self.idx(k) else {
                debug!(target: "cds", "Init list: {} is not archived", self.name(k));
                continue;
            };
            let rec = match *entry {
                InitInfo::ClassInit { state, .. } => InitRecord::ClassInit {
                    holder,
                    state: state as u8,
                },
                InitInfo::FieldInit {
                    slot,
                    value,
                    value_klass,
                    ..
                } => match self.field_value(value, value_klass) {
                    Some((value, value_klass)) => InitRecord::FieldInit {
                        holder,
                        slot,
                        value,
                        value_klass,
                    },
                    None => {
                        debug!(target: "cds", "Init list: value of {} slot {} is not archived", self.name(k), slot);
                        InitRecord::Invalid
                    }
                },
                InitInfo::InvokeDynamic { index, .. } => InitRecord::InvokeDynamic { holder, index },
                InitInfo::InvokeHandle { method, bci, .. } => {
                    let Some(m) = rt.method(method) else { continue };
                    let Some(method_holder) = self.idx(m.holder) else { continue };
                    InitRecord::InvokeHandle {
                        holder,
                        method_holder,
                        method_name: m.name.clone(),
                        method_signature: m.signature.clone(),
                        bci,
                    }
                }
                InitInfo::Invalid => InitRecord::Invalid,
            };
            entries.push(rec);
        }
        self.summary.init_entries = entries.len();
        InitListRecord { entries }
    }

    /// A reference is stored as the permanent index of its archived object.
    fn field_value(&self, value: Value, value_klass: Option<KlassId>) -> Option<(FieldValueRecord, Option<u32>)> {
        let value_klass = match value_klass {
            Some(k) => Some(self.idx(k)?),
            None => None,
        };
        let value = match value {
            Value::Null => FieldValueRecord::Null,
            Value::Prim(v) => FieldValueRecord::Prim(v),
            Value::Ref(obj) => FieldValueRecord::Object(self.art.heap.permanent()?.get_archived_object_permanent_index(obj)?),
        };
        Some((value, value_klass))
    }

    fn indices(&self, ks: &[KlassId]) -> Vec<u32> {
        ks.iter().filter_map(|&k| self.idx(k)).collect()
    }

    fn preloaded(&self) -> PreloadedRecord {
        let p = self.art.preloaded;
        PreloadedRecord {
            boot: self.indices(&p.boot),
            boot2: self.indices(&p.boot2),
            platform: self.indices(&p.platform),
            app: self.indices(&p.app),
            platform_initiated: self.indices(self.art.platform_initiated),
            app_initiated: self.indices(self.art.app_initiated),
        }
    }

    fn reflection_data(&self) -> ReflectionTable {
        ReflectionTable {
            classes: self
                .art
                .reflection_data
                .iter()
                .filter_map(|(&k, &flags)| self.idx(k).map(|class| ReflectionRecord { class, flags }))
                .collect(),
        }
    }

    fn header_flags(&self) -> HeaderFlags {
        let art = self.art;
        let mut flags = HeaderFlags::empty();
        flags.set(
            HeaderFlags::HEAP_ARCHIVED,
            art.config.heap_archiving_enabled() && !art.heap.archived_objects().is_empty(),
        );
        flags.set(
            HeaderFlags::FULL_MODULE_GRAPH,
            art.heap.subgraphs().any(|sg| sg.is_full_module_graph),
        );
        flags.set(HeaderFlags::HAS_INIT_LIST, !art.init_list.is_empty());
        let p = art.preloaded;
        flags.set(
            HeaderFlags::PRELOADED_CLASSES,
            !(p.boot.is_empty() && p.boot2.is_empty() && p.platform.is_empty() && p.app.is_empty()),
        );
        flags.set(HeaderFlags::PRECOMPILED, art.precompiled);
        flags.set(HeaderFlags::REFLECTION_DATA, !art.reflection_data.is_empty());
        flags
    }

    fn assemble(&self, payloads: Vec<(SectionKind, Vec<u8>)>) -> Vec<u8> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut header = FileHeader::new(
            self.art.config.shared_base_address,
            self.header_flags(),
            Uuid::new_v4(),
            created_at,
        );
        let mut offset = align_up(FileHeader::encoded_len(payloads.len()), SECTION_ALIGNMENT);
        for (kind, bytes) in &payloads {
            header.sections.push(SectionEntry {
                kind: *kind,
                offset: offset as u64,
                size: bytes.len() as u64,
            });
            offset = align_up(offset + bytes.len(), SECTION_ALIGNMENT);
        }
        header.file_size = offset as u64;

        let mut image = vec![0u8; offset];
        let encoded = header.encode();
        image[..encoded.len()].copy_from_slice(&encoded);
        for ((_, bytes), entry) in payloads.iter().zip(&header.sections) {
            image[entry.range()].copy_from_slice(bytes);
        }
        stamp_crc(&mut image);
        image
    }
}
