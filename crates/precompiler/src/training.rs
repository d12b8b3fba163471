//! Training data: what the training run compiled, per method.
//!
//! ```json
//! { "methods": [
//!     { "holder": "app/Main", "name": "run", "signature": "()V",
//!       "compiles": [ { "level": 3, "compile_id": 7 }, { "level": 4, "compile_id": 19 } ] }
//! ] }
//! ```

use crate::PrecompileError;
use common::{LoaderKind, MethodId, Runtime};
use dumptime::DumpTimeTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRecord {
    pub level: u8,
    pub compile_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodTrainingData {
    pub holder: String,
    pub name: String,
    pub signature: String,
    /// Top-level compilations in the order they completed.
    #[serde(default)]
    pub compiles: Vec<CompileRecord>,
    #[serde(skip)]
    pub method: Option<MethodId>,
}

impl MethodTrainingData {
    pub fn highest_level(&self) -> Option<u8> {
        self.compiles.iter().map(|c| c.level).max()
    }

    pub fn last_toplevel_compile(&self, level: u8) -> Option<&CompileRecord> {
        self.compiles.iter().rev().find(|c| c.level == level)
    }

    /// Compile id of the last compilation at `level`, when `level` is the
    /// highest level the method reached.
    pub fn compile_id_at(&self, level: u8) -> Option<u32> {
        if self.highest_level() != Some(level) {
            return None;
        }
        self.last_toplevel_compile(level).map(|c| c.compile_id)
    }

    /// Compile id of the last compilation at any level.
    pub fn last_compile_id(&self) -> Option<u32> {
        self.compiles.last().map(|c| c.compile_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingData {
    #[serde(default)]
    methods: Vec<MethodTrainingData>,
    #[serde(skip)]
    index: HashMap<MethodId, usize>,
}

impl TrainingData {
    pub fn new(methods: Vec<MethodTrainingData>) -> Self {
        Self {
            methods,
            index: HashMap::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PrecompileError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, PrecompileError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String, PrecompileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn have_data(&self) -> bool {
        !self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn records(&self) -> &[MethodTrainingData] {
        &self.methods
    }

    /// Binds every record to the runtime method it names. Records whose class
    /// or method is unknown stay unbound and are ignored by the passes.
    /// Returns the number of bound records.
    pub fn bind(&mut self, rt: &Runtime) -> usize {
        self.index.clear();
        for (i, mtd) in self.methods.iter_mut().enumerate() {
            mtd.method = rt
                .find_class(LoaderKind::App, &mtd.holder)
                .and_then(|k| rt.find_method(k, &mtd.name, &mtd.signature))
                .filter(|&m| rt.method(m).is_some_and(|m| rt.klasses.name(m.holder) == mtd.holder));
            match mtd.method {
                Some(m) => {
                    self.index.insert(m, i);
                }
                None => debug!(
                    target: "precompile",
                    "No method for training data {}::{}{}",
                    mtd.holder,
                    mtd.name,
                    mtd.signature
                ),
            }
        }
        self.index.len()
    }

    pub fn lookup(&self, m: MethodId) -> Option<&MethodTrainingData> {
        self.index.get(&m).map(|&i| &self.methods[i])
    }

    /// Bound methods in record order.
    pub fn methods(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.methods.iter().filter_map(|mtd| mtd.method)
    }

    /// Drops records of excluded or unbound holders. Returns the number dropped.
    pub fn cleanup(&mut self, rt: &Runtime, table: &DumpTimeTable) -> usize {
        let before = self.methods.len();
        self.methods.retain(|mtd| {
            mtd.method
                .and_then(|m| rt.method(m))
                .is_some_and(|m| !table.is_excluded(m.holder))
        });
        let dropped = before - self.methods.len();
        self.bind(rt);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::builder::KlassBuilder;
    use common::runtime::OBJECT_CLASS;
    use common::MethodFlags;

    fn record(holder: &str, name: &str, compiles: &[(u8, u32)]) -> MethodTrainingData {
        MethodTrainingData {
            holder: holder.to_string(),
            name: name.to_string(),
            signature: "()V".to_string(),
            compiles: compiles
                .iter()
                .map(|&(level, compile_id)| CompileRecord { level, compile_id })
                .collect(),
            method: None,
        }
    }

    #[test]
    fn test_compile_id_needs_highest_level() {
        let mtd = record("app/Main", "run", &[(3, 7), (4, 19), (3, 25)]);
        assert_eq!(mtd.highest_level(), Some(4));
        assert_eq!(mtd.compile_id_at(4), Some(19));
        assert_eq!(mtd.compile_id_at(3), None);
        assert_eq!(mtd.last_compile_id(), Some(25));
    }

    #[test]
    fn test_load_and_bind() {
        let mut rt = KlassBuilder::bootstrap_runtime();
        let main = KlassBuilder::new("app/Main", LoaderKind::App)
            .super_class(&rt, OBJECT_CLASS)
            .method("run", "()V", MethodFlags::empty())
            .build(&mut rt);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.json");
        let td = TrainingData::new(vec![
            record("app/Main", "run", &[(4, 3)]),
            record("app/Gone", "run", &[(1, 1)]),
        ]);
        std::fs::write(&path, td.to_json().unwrap()).unwrap();

        let mut td = TrainingData::load(&path).unwrap();
        assert_eq!(td.len(), 2);
        assert_eq!(td.bind(&rt), 1);
        let run = rt.find_method(main, "run", "()V").unwrap();
        assert_eq!(td.methods().collect::<Vec<_>>(), vec![run]);
        assert_eq!(td.lookup(run).unwrap().compile_id_at(4), Some(3));

        let table = DumpTimeTable::new();
        assert_eq!(td.cleanup(&rt, &table), 1);
        assert_eq!(td.len(), 1);
        assert!(td.lookup(run).is_some());
    }
}
