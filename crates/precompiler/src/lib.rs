//! # Precompiler: Training-Data-Driven Ahead-of-Time Compilation
//!
//! **Role**: Replays the compilations a training run performed. At dump time
//! the recorded methods are compiled tier by tier in their recorded order; at
//! start-up, after the init list has been replayed, the recorded methods of
//! initialized classes are compiled again.
//!
//! **Core Types**:
//! - `TrainingData`: per-method compile records of the training run (JSON).
//! - `Directives`: `DontPrecompile` / `PrecompileRecorded=level` method patterns.
//! - `CompileBroker`: the seam to the compiler. `InstallingBroker` installs code
//!   into the runtime model.
//! - `Precompiler`: the dump-time passes and the start-up `force_compilation`.
//!
//! **Design**:
//! - A failed compilation is logged and counted; it never fails a dump or a
//!   start-up.

pub mod broker;
pub mod directives;
pub mod passes;
pub mod training;

pub use broker::{CompileBroker, CompileReason, CompileTask, InstallingBroker};
pub use directives::{Directive, DirectiveKind, Directives, MethodPattern};
pub use passes::{PrecompileReport, Precompiler};
pub use training::{CompileRecord, MethodTrainingData, TrainingData};

use thiserror::Error;

/// Highest compilation tier.
pub const COMP_LEVEL_FULL_OPTIMIZATION: u8 = 4;
pub const COMP_LEVEL_FULL_PROFILE: u8 = 3;
pub const COMP_LEVEL_LIMITED_PROFILE: u8 = 2;
pub const COMP_LEVEL_SIMPLE: u8 = 1;

#[derive(Debug, Error)]
pub enum PrecompileError {
    #[error("Unrecognized compile command '{0}'")]
    UnknownDirective(String),

    #[error("Bad method pattern '{0}': expected Class::method")]
    BadPattern(String),

    #[error("Improperly specified compile command '{0}'")]
    BadValue(String),

    #[error("compilation of {method} at level {level} failed: {reason}")]
    CompileFailed {
        method: String,
        level: u8,
        reason: &'static str,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("training data decode error: {0}")]
    JsonError(#[from] serde_json::Error),
}
