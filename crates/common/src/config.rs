//! # Config: Archiver Flags
//!
//! Every recognized flag with its default. A config is read from a JSON file whose
//! keys are the flag names, then overridden by option strings in the runtime's own
//! syntax:
//!
//! ```text
//! -XX:+ArchiveInvokeDynamic      boolean on
//! -ArchiveHeap                   boolean off
//! PreloadArchivedClasses=2       valued
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default requested mapping base of the archive.
pub const DEFAULT_SHARED_BASE_ADDRESS: u64 = 0x8_0000_0000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unrecognized option: {0}")]
    UnknownFlag(String),

    #[error("Improperly specified option '{flag}={value}'")]
    BadValue { flag: String, value: String },

    #[error("{flag}={value} is outside the allowed range [0..{max}]")]
    OutOfRange { flag: String, value: u64, max: u64 },

    #[error("Missing +/- setting for boolean option '{0}'")]
    NotBoolean(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config decode error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CdsConfig {
    pub verify_shared_spaces: bool,
    pub auto_create_shared_archive: bool,
    pub print_shared_archive_and_exit: bool,
    pub shared_base_address: u64,
    pub shared_archive_file: Option<String>,
    pub shared_class_list_file: Option<String>,
    pub archive_classes_at_exit: Option<String>,
    pub archive_relocation_mode: u8,
    pub preload_shared_classes: bool,
    pub prelink_shared_classes: bool,
    pub archive_field_references: bool,
    pub archive_method_references: bool,
    pub archive_invoke_dynamic: bool,
    pub archive_reflection_data: bool,
    pub archive_heap: bool,
    pub archive_full_module_graph: bool,
    pub preload_archived_classes: u8,
    pub preresolve: u8,
    pub precompile_level: u8,
    pub force_precompile_level: bool,
    pub force_precompilation: bool,
    pub enforce_class_init_dependencies: bool,
    /// Per-method precompile directives, e.g. `DontPrecompile,app/Main::slow*`.
    pub compile_command: Vec<String>,
}

impl Default for CdsConfig {
    fn default() -> Self {
        Self {
            verify_shared_spaces: false,
            auto_create_shared_archive: false,
            print_shared_archive_and_exit: false,
            shared_base_address: DEFAULT_SHARED_BASE_ADDRESS,
            shared_archive_file: None,
            shared_class_list_file: None,
            archive_classes_at_exit: None,
            archive_relocation_mode: 0,
            preload_shared_classes: false,
            prelink_shared_classes: false,
            archive_field_references: true,
            archive_method_references: true,
            archive_invoke_dynamic: false,
            archive_reflection_data: false,
            archive_heap: true,
            archive_full_module_graph: true,
            preload_archived_classes: 0,
            preresolve: 0,
            precompile_level: 0,
            force_precompile_level: false,
            force_precompilation: false,
            enforce_class_init_dependencies: false,
            compile_command: Vec::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Setting<'a> {
    Bool(bool),
    Value(&'a str),
}

impl CdsConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: CdsConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies one option string, with or without the `-XX:` prefix. The config
    /// is left unchanged when the option is rejected.
    pub fn apply_option(&mut self, option: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        next.set_option(option)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn set_option(&mut self, option: &str) -> Result<(), ConfigError> {
        let opt = option.strip_prefix("-XX:").unwrap_or(option);
        let (name, setting) = if let Some(rest) = opt.strip_prefix('+') {
            (rest, Setting::Bool(true))
        } else if let Some(rest) = opt.strip_prefix('-') {
            (rest, Setting::Bool(false))
        } else if let Some((name, value)) = opt.split_once('=') {
            (name, Setting::Value(value))
        } else {
            return Err(ConfigError::NotBoolean(opt.to_string()));
        };

        macro_rules! flag {
            ($field:ident) => {
                match setting {
                    Setting::Bool(b) => self.$field = b,
                    Setting::Value(v) => self.$field = parse_bool(name, v)?,
                }
            };
        }
        macro_rules! number {
            ($field:ident, $ty:ty) => {
                match setting {
                    Setting::Value(v) => self.$field = parse_number::<$ty>(name, v)?,
                    Setting::Bool(_) => return Err(bad_value(name, opt)),
                }
            };
        }
        macro_rules! text {
            ($field:ident) => {
                match setting {
                    Setting::Value(v) => self.$field = Some(v.to_string()),
                    Setting::Bool(_) => return Err(bad_value(name, opt)),
                }
            };
        }

        match name {
            "VerifySharedSpaces" => flag!(verify_shared_spaces),
            "AutoCreateSharedArchive" => flag!(auto_create_shared_archive),
            "PrintSharedArchiveAndExit" => flag!(print_shared_archive_and_exit),
            "SharedBaseAddress" => number!(shared_base_address, u64),
            "SharedArchiveFile" => text!(shared_archive_file),
            "SharedClassListFile" => text!(shared_class_list_file),
            "ArchiveClassesAtExit" => text!(archive_classes_at_exit),
            "ArchiveRelocationMode" => number!(archive_relocation_mode, u8),
            "PreloadSharedClasses" => flag!(preload_shared_classes),
            "PrelinkSharedClasses" => flag!(prelink_shared_classes),
            "ArchiveFieldReferences" => flag!(archive_field_references),
            "ArchiveMethodReferences" => flag!(archive_method_references),
            "ArchiveInvokeDynamic" => flag!(archive_invoke_dynamic),
            "ArchiveReflectionData" => flag!(archive_reflection_data),
            "ArchiveHeap" => flag!(archive_heap),
            "ArchiveFullModuleGraph" => flag!(archive_full_module_graph),
            "PreloadArchivedClasses" => number!(preload_archived_classes, u8),
            "Preresolve" => number!(preresolve, u8),
            "PrecompileLevel" => number!(precompile_level, u8),
            "ForcePrecompileLevel" => flag!(force_precompile_level),
            "ForcePrecompilation" => flag!(force_precompilation),
            "EnforceClassInitDependencies" => flag!(enforce_class_init_dependencies),
            "CompileCommand" => match setting {
                Setting::Value(v) => self.compile_command.push(v.to_string()),
                Setting::Bool(_) => return Err(bad_value(name, opt)),
            },
            _ => return Err(ConfigError::UnknownFlag(name.to_string())),
        }
        Ok(())
    }

    /// Range-checks the valued flags.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("ArchiveRelocationMode", self.archive_relocation_mode, 2),
            ("PreloadArchivedClasses", self.preload_archived_classes, 2),
            ("Preresolve", self.preresolve, 7),
            ("PrecompileLevel", self.precompile_level, 4),
        ];
        for (flag, value, max) in checks {
            if value > max {
                return Err(ConfigError::OutOfRange {
                    flag: flag.to_string(),
                    value: value as u64,
                    max: max as u64,
                });
            }
        }
        Ok(())
    }

    /// Whether the heap region (and with it invokedynamic archiving) is dumped.
    pub fn heap_archiving_enabled(&self) -> bool {
        self.archive_heap
    }
}

fn bad_value(flag: &str, value: &str) -> ConfigError {
    ConfigError::BadValue {
        flag: flag.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(flag: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(bad_value(flag, value)),
    }
}

fn parse_number<T>(flag: &str, value: &str) -> Result<T, ConfigError>
where
    T: TryFrom<u64>,
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| bad_value(flag, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CdsConfig::default();
        assert!(c.archive_heap);
        assert!(c.archive_field_references);
        assert!(!c.archive_invoke_dynamic);
        assert_eq!(c.shared_base_address, DEFAULT_SHARED_BASE_ADDRESS);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_apply_options() {
        let mut c = CdsConfig::default();
        c.apply_option("-XX:+ArchiveInvokeDynamic").unwrap();
        c.apply_option("-ArchiveHeap").unwrap();
        c.apply_option("PreloadArchivedClasses=2").unwrap();
        c.apply_option("-XX:SharedBaseAddress=0x10000000").unwrap();
        c.apply_option("SharedArchiveFile=/tmp/app.jsa").unwrap();
        assert!(c.archive_invoke_dynamic);
        assert!(!c.archive_heap);
        assert_eq!(c.preload_archived_classes, 2);
        assert_eq!(c.shared_base_address, 0x1000_0000);
        assert_eq!(c.shared_archive_file.as_deref(), Some("/tmp/app.jsa"));
    }

    #[test]
    fn test_rejects_bad_options() {
        let mut c = CdsConfig::default();
        assert!(matches!(
            c.apply_option("+NoSuchFlag"),
            Err(ConfigError::UnknownFlag(_))
        ));
        assert!(matches!(
            c.apply_option("Preresolve=9"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert_eq!(c.preresolve, 0);
        assert!(matches!(
            c.apply_option("ArchiveHeap"),
            Err(ConfigError::NotBoolean(_))
        ));
        assert!(matches!(
            c.apply_option("PrecompileLevel=high"),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn test_from_file_uses_flag_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cds.json");
        std::fs::write(&path, r#"{"Preresolve": 6, "VerifySharedSpaces": true}"#).unwrap();
        let c = CdsConfig::from_file(&path).unwrap();
        assert_eq!(c.preresolve, 6);
        assert!(c.verify_shared_spaces);
        assert!(c.archive_heap);
    }
}
