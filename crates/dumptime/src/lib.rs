//! # Dumptime: Per-Class Dump Session State
//!
//! **Role**: Everything the dumper knows about a class that is not part of the
//! class itself: whether it may be archived, why not, which constraints must be
//! re-checked at run time, and whether its mirror may be archived initialized.
//!
//! **Core Types**:
//! - `DumpTimeClassInfo` / `DumpTimeTable`: one record per examined class.
//! - `ExclusionEngine`: the archivability verdict, propagated through supertypes.
//! - `LambdaProxyDictionary`: lambda call-site key to ordered proxy classes.
//! - `UnregisteredClasses`: name uniqueness for `source:` classes.
//!
//! **Design**:
//! - Verdicts are memoized in the table; exclusion is never undone in a session.
//! - The table is owned by the dump session and borrowed mutably by the writer,
//!   so it needs no lock of its own.

pub mod exclusion;
pub mod info;
pub mod lambda;
pub mod preinit;
pub mod table;
pub mod unregistered;

pub use exclusion::{is_archivable_hidden, ExclusionEngine, ExclusionReason, Excluder};
pub use info::{
    ConstraintFlags, DumpTimeClassInfo, LinkingConstraint, PreinitVerdict, VerificationConstraint,
};
pub use lambda::{LambdaProxyDictionary, LambdaProxyKey, RunTimeLambdaProxyTable};
pub use preinit::{apply_forced_list, can_be_preinited, FORCED_PREINIT_CLASSES};
pub use table::DumpTimeTable;
pub use unregistered::UnregisteredClasses;

use common::KlassId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpTimeError {
    #[error("cyclic type graph at {0}")]
    CyclicTypeGraph(String),

    #[error("unknown class {0}")]
    UnknownClass(KlassId),
}
