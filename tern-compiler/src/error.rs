use thiserror::Error;

use crate::hir::InstId;

pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Recoverable reasons a method is left uncompiled. Compiler bugs are not
/// reported through this type; they abort.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("frame size {size} exceeds maximum of {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unknown optimization pass `{0}`")]
    UnknownPass(String),

    #[error("instruction {0:?} not supported by this backend")]
    UnsupportedInstruction(InstId),

    #[error("out of registers while allocating {0:?}")]
    OutOfRegisters(InstId),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}
