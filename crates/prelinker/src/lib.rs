//! # Prelinker: Deterministic Constant-Pool Pre-Resolution
//!
//! **Role**: Resolves constant-pool entries of archivable classes at dump time,
//! but only entries that are guaranteed to resolve to the same target in every
//! later run. Everything else stays symbolic and is resolved lazily as usual.
//!
//! **Core Types**:
//! - `ClassSets`: the vm classes, the preloaded classes and the classes each
//!   built-in loader initiates.
//! - `CpPreResolver`: the [`Resolver`] that applies the per-tag determinism tests
//!   and drives the runtime's link resolver.
//! - `CpState`: outcome per requested index.
//!
//! **Design**:
//! - A failed resolution is a `ResolveError` that is logged and recorded, never
//!   propagated. Pre-resolution cannot fail a dump.

pub mod classes;
pub mod resolver;

pub use classes::{ClassSets, PreloadedKlasses, VM_CLASS_NAMES};
pub use resolver::{CpPreResolver, CpState, PreResolveReport, Resolver, LAMBDA_FORM_INVOKER_HOLDERS};

use common::{CpTag, KlassId, RuntimeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{class} [{index}]: {source}")]
    Runtime {
        class: String,
        index: u16,
        #[source]
        source: RuntimeError,
    },

    #[error("{class} [{index}]: resolution of {tag} is not deterministic")]
    NotDeterministic { class: String, index: u16, tag: CpTag },

    #[error("{class} [{index}]: unsupported tag {tag}")]
    UnsupportedTag { class: String, index: u16, tag: CpTag },

    #[error("class {0} is not linked")]
    NotLinked(KlassId),
}
