//! # Initlist: Recorded Class Initialization and Start-up Replay
//!
//! **Role**: Captures the order in which a training run initialized classes and
//! linked call sites, and replays that order at production start-up so the same
//! classes are ready before `main` runs.
//!
//! **Core Types**:
//! - `InitInfo`: one recorded event (class init, static-final field value,
//!   invokedynamic site, invokehandle site).
//! - `InitListRecorder`: the training-side log, appended to from any thread.
//! - `InitList`: the compacted, cleaned log the writer stores in the archive.
//! - `ReplayDriver`: walks an `InitList` under `ReplayFlags`.
//!
//! **Design**:
//! - Replay never fails. Every per-entry exception is logged and counted, and
//!   the class is left to ordinary lazy initialization.
//! - Entries name classes by `KlassId`; the writer maps them to names on the
//!   way out and back.

pub mod list;
pub mod recorder;
pub mod replay;

pub use list::{InitInfo, InitList};
pub use recorder::InitListRecorder;
pub use replay::{ReplayDriver, ReplayFlags, ReplayReport};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitListError {
    #[error("{class} is initialized before its super class {super_class}")]
    InitDependency { class: String, super_class: String },
}
