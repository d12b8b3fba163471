//! The seam between the precompile passes and a compiler.

use crate::PrecompileError;
use common::{MethodFlags, MethodId, Runtime};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileReason {
    /// Dump-time pass whose code is loaded before any other cached code.
    PrecompileForPreload,
    Precompile,
    /// Start-up compilation of a recorded method.
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileTask {
    pub method: MethodId,
    pub level: u8,
    pub reason: CompileReason,
}

pub trait CompileBroker {
    /// Compiles `method` at `level` and installs the code.
    fn compile_method(
        &mut self,
        rt: &mut Runtime,
        method: MethodId,
        level: u8,
        reason: CompileReason,
    ) -> Result<(), PrecompileError>;
}

/// Installs code by recording the tier on the runtime method, and keeps the
/// sequence of tasks it accepted.
#[derive(Debug, Default)]
pub struct InstallingBroker {
    pub tasks: Vec<CompileTask>,
}

impl InstallingBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompileBroker for InstallingBroker {
    fn compile_method(
        &mut self,
        rt: &mut Runtime,
        method: MethodId,
        level: u8,
        reason: CompileReason,
    ) -> Result<(), PrecompileError> {
        let Some(m) = rt.method(method) else {
            return Err(PrecompileError::CompileFailed {
                method: format!("#{}", method.0),
                level,
                reason: "no such method",
            });
        };
        let failed = |reason| PrecompileError::CompileFailed {
            method: format!("{}::{}", rt.klasses.name(m.holder), m.name_and_sig()),
            level,
            reason,
        };
        if m.flags
            .intersects(MethodFlags::NATIVE | MethodFlags::ABSTRACT | MethodFlags::NOT_COMPILABLE)
        {
            return Err(failed("not compilable"));
        }
        if !rt.klass(m.holder).state.is_linked() {
            return Err(failed("holder is not linked"));
        }
        if let Some(m) = rt.methods.get_mut(method.index()) {
            m.code_level = Some(level);
        }
        trace!(target: "precompile", "installed #{} at level {}", method.0, level);
        self.tasks.push(CompileTask { method, level, reason });
        Ok(())
    }
}
