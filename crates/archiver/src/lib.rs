//! # Archiver: Heap Subgraph Archiving
//!
//! **Role**: Starting from a fixed table of static-field roots, collects the
//! transitive object graph that can be stored in the archive, freezes identity
//! hashes, substitutes scratch mirrors for class mirrors, and lays the result out
//! as a relocatable heap region.
//!
//! **Core Types**:
//! - `HeapArchiver`: the walk, the archived-object cache, per-holder subgraph
//!   infos and the roots array.
//! - `KlassSubGraphInfo`: entry fields and object classes of one holder.
//! - `ScratchObjects`: dump-time mirrors and exception prototypes.
//! - `PermanentObjects`: fixed-fanout segments addressing every archived object.
//! - `HeapRegionWriter` / `HeapRegion`: the word image with its oop and native
//!   pointer bitmaps.
//!
//! **Design**:
//! - The walk is iterative over an explicit worklist; the seen set is per holder
//!   and the cache is per dump.
//! - Dropping an oversize root is the only recoverable failure. Every other
//!   problem is an `ArchiverError` carrying the reference trace of the object.

pub mod graph;
pub mod permanent;
pub mod region;
pub mod roots;
pub mod scratch;
pub mod subgraph;

pub use graph::{ArchivedHeapSummary, CachedObject, HeapArchiver, SpecialRoots};
pub use permanent::{PermanentObjects, PERMOBJ_SEGMENT_SHIFT, PERMOBJ_SEGMENT_SIZE};
pub use region::{DecodedBody, DecodedObject, HeapRegion, HeapRegionWriter, RegionSlot, MIN_GC_REGION_ALIGNMENT};
pub use roots::{RootField, RootGroup, RootsArray, DEFAULT_ROOT_FIELDS, FMG_ROOT_FIELDS};
pub use scratch::{ScratchObjects, ARCHIVED_EXCEPTION_CLASSES};
pub use subgraph::KlassSubGraphInfo;

use common::{KlassId, ObjectId, Runtime};
use dumptime::DumpTimeTable;
use thiserror::Error;

/// Largest object the heap region can hold.
pub const MAX_OBJ_SIZE: usize = MIN_GC_REGION_ALIGNMENT;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("Cannot archive object of class {class}\n{trace}")]
    InjectedFields { class: String, trace: String },

    #[error("Cannot archive the sub-graph referenced from {class} object ({object}) size {size}\n{trace}")]
    Oversize {
        class: String,
        object: ObjectId,
        size: usize,
        trace: String,
    },

    #[error("Class {class} not allowed in archive heap. Must be in java.base\n{trace}")]
    DisallowedClass { class: String, trace: String },

    #[error("Cannot archive object of excluded class {class}\n{trace}")]
    ExcludedClass { class: String, trace: String },

    #[error("Unable to find the static field {field} of {holder}: {reason}")]
    UnresolvableRootField {
        holder: String,
        field: String,
        reason: &'static str,
    },

    #[error("Core class {0} is not loaded")]
    MissingCoreClass(&'static str),

    #[error("Object {0} is referenced but was not archived")]
    NotArchived(ObjectId),

    #[error("Class {0} has no index in the archived class table")]
    UnindexedKlass(String),

    #[error("Corrupt heap region at offset {offset}: {reason}")]
    CorruptRegion { offset: u32, reason: &'static str },

    #[error("Object {0} does not exist")]
    BadObject(ObjectId),

    #[error("Runtime error: {0}")]
    Runtime(#[from] common::RuntimeError),
}

/// Adds the graph reachable from an object to a holder's subgraph.
pub trait Archiver {
    /// Archives everything reachable from `obj` and records its classes in the
    /// subgraph of `holder`. Returns `Ok(false)` when `obj` itself was too
    /// large and has been dropped.
    fn archive_reachable(
        &mut self,
        rt: &mut Runtime,
        table: &mut DumpTimeTable,
        holder: KlassId,
        obj: ObjectId,
    ) -> Result<bool, ArchiverError>;
}
