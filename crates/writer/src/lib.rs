//! # Writer: Dump Sessions and the Archive File
//!
//! **Role**: Drives a static dump from a training snapshot and a class list to
//! an archive file, and maps that file back into a fresh runtime.
//!
//! **Core Types**:
//! - `DumpSession`: owns the runtime and every dump-time table for one dump;
//!   applies the class list, then runs exclusion, pre-resolution, heap
//!   archiving, init-list compaction and precompilation in order.
//! - `ArchiveBuilder`: lays out metadata regions, the heap region, the compact
//!   dictionaries and the record sections, and stamps header and CRC.
//! - `MappedArchive`: `memmap2` view of an archive file, validated and, when the
//!   base address moved, relocated.
//! - `RestoredArchive`: the archive installed into a runtime; serves the
//!   run-time lambda-proxy table and the unregistered dictionary, and replays
//!   the init list at start-up.
//!
//! **Design**:
//! - All output is produced in class-table, root and insertion order, never in
//!   hash order, so two dumps of one training run are identical apart from
//!   the header's volatile range.
//! - Mapping failures are errors; start-up replay after a successful map never
//!   fails.

pub mod builder;
pub mod compact;
pub mod header;
pub mod mapped;
pub mod metadata;
pub mod records;
pub mod restore;
pub mod session;

#[cfg(test)]
mod scenarios;

pub use builder::{ArchiveBuilder, ArchiveSummary, DumpArtifacts};
pub use compact::{name_hash, CompactHashtable, CompactHashtableBuilder};
pub use header::{FileHeader, HeaderFlags, SectionEntry, SectionKind, ARCHIVE_MAGIC, ARCHIVE_VERSION, VOLATILE_RANGE};
pub use mapped::{MappedArchive, ALTERNATE_BASE_OFFSET};
pub use restore::{RestoreReport, RestoredArchive, StartupReport};
pub use session::{ArchiveImage, ClassListReport, DumpReport, DumpSession};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    ClassList(#[from] classlist::ClassListError),

    #[error(transparent)]
    Config(#[from] common::config::ConfigError),

    #[error(transparent)]
    DumpTime(#[from] dumptime::DumpTimeError),

    #[error(transparent)]
    Archiver(#[from] archiver::ArchiverError),

    #[error(transparent)]
    InitList(#[from] initlist::InitListError),

    #[error(transparent)]
    Precompile(#[from] precompiler::PrecompileError),

    #[error("Failed to encode the {section} section: {reason}")]
    Encode { section: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("The shared archive file has a bad magic number: {0:#x}")]
    BadMagic(u32),

    #[error("The shared archive file version {found} does not match the required version {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("The shared archive file was truncated: {actual} bytes, expected {expected}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Header checksum verification failed: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("Corrupt archive section: {0}")]
    BadSection(String),

    #[error("Missing archive section {0}")]
    MissingSection(&'static str),

    #[error("Failed to decode the {section} section: {reason}")]
    Decode { section: &'static str, reason: String },

    #[error("Unable to map the archive at {requested:#x}, relocation is disabled (ArchiveRelocationMode=2, available {available:#x})")]
    RelocationRefused { requested: u64, available: u64 },
}
