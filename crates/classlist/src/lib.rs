//! # Classlist: The Class-List File Format
//!
//! **Role**: Parses the line-oriented class list that drives a static dump:
//! which classes to load, which of them are unregistered classes with their
//! declared supertypes, and the `@` lines requesting lambda-proxy archiving,
//! constant-pool pre-resolution and reflection data.
//!
//! **Core Types**:
//! - `ClassListParser`: line parser that tracks declared ids across lines.
//! - `ClassList` / `ParsedLine` / `ClassListLine`: the parsed file.
//! - `Diagnostic`: a message pinned to a line and column, rendered with a caret.
//!
//! **Design**:
//! - The parser is purely syntactic. Checks that need loaded classes (the
//!   `@cp` index range and tags, lambda-proxy call sites) happen where the list
//!   is applied, and report through the same `Diagnostic`.
//! - A parse error ends the parse; the dump that asked for it fails.

pub mod diagnostic;
pub mod parser;

pub use diagnostic::Diagnostic;
pub use parser::{
    is_ignored_class, ClassEntry, ClassList, ClassListLine, ClassListParser, CpRequest, ParsedLine,
    MAX_ALLOWED_LINE_LEN,
};

use thiserror::Error;

pub const LAMBDA_PROXY_TAG: &str = "@lambda-proxy";
pub const LAMBDA_FORM_TAG: &str = "@lambda-form-invoker";
pub const CONSTANT_POOL_TAG: &str = "@cp";
pub const CLASS_REFLECTION_DATA_TAG: &str = "@class-reflection-data";

#[derive(Debug, Error)]
pub enum ClassListError {
    #[error("{0}")]
    Parse(Diagnostic),

    #[error("Loading classlist failed: {0}")]
    IoError(#[from] std::io::Error),
}
