//! Error types, one enum per concern, lifted to `GeneratorError` at the top
//! of the pipeline. Every error aborts the run; nothing is caught and
//! silently ignored.

use crate::instr::Format;
use thiserror::Error;

/// An immediate does not fit the signed width of its instruction format.
/// Builder output is always in range, so hitting this indicates a bug in the
/// calling code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("immediate {imm:#x} out of range for {format:?}-format instruction")]
pub struct EncodingError {
    pub format: Format,
    pub imm: i32,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmError {
    #[error("unknown instruction word {word:#010x}")]
    UnknownInstruction { word: u32 },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Offsets below 8 in magnitude cannot be routed through an
    /// auipc/jalr pair.
    #[error("call offset magnitude should be at least 8 (got {offset})")]
    WrongOffset { offset: i64 },
    #[error("instruction weights have no mass on any available category")]
    EmptyWeights,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MethodError {
    #[error("element sized to zero instructions")]
    EmptySection,
    #[error("planned {expected} call slots but {provided} callees were provided")]
    CallNumber { expected: usize, provided: usize },
    #[error("method at {address:#x} cannot call itself")]
    RecursiveCall { address: u64 },
    #[error(
        "callee at depth {callee_depth} is not strictly below caller depth {caller_depth}"
    )]
    MutualCall {
        caller_depth: u64,
        callee_depth: u64,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("wrong address: {0}")]
    WrongAddress(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Method(#[from] MethodError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
