// This module defines the error types for bbjit using the thiserror crate. JitError covers the
// recoverable failure modes of the JIT core: the executable region could not be mapped or
// reprotected, a block was discarded because one of the code buffers ran out of capacity, a
// checked in-place rewrite of already emitted code fell outside the bounds it was allowed to
// touch, a block id referred to a bytecode unit the JIT never saw, or a configuration string was
// malformed. Unsupported bytecode is not an error value (the engine seals the block with an exit
// instead), and compiler defects such as a context that disagrees with live values or an
// immediate that does not fit its encoding are panics, not variants here. JitResult<T> is the
// convenience alias used throughout the crate.

//! Error types for the JIT core.

use thiserror::Error;

/// Main error type for JIT operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("Could not map {requested} bytes of executable memory: {reason}")]
    OutOfMemory { requested: usize, reason: String },

    #[error("Page protection change failed during {op}: {reason}")]
    Protection { op: &'static str, reason: String },

    #[error("Code buffer capacity exhausted while compiling iseq {iseq} at index {idx}")]
    CapacityExhausted { iseq: u32, idx: u32 },

    #[error("Patch position {pos} outside of writable range (limit {limit})")]
    PatchOutOfBounds { pos: usize, limit: usize },

    #[error("Patched code [{start}, {end}) overruns its slot (limit {limit})")]
    PatchOverflow { start: usize, end: usize, limit: usize },

    #[error("Unknown bytecode unit: {0}")]
    UnknownIseq(u32),

    #[error("Invalid option {name}={value}")]
    InvalidOption { name: String, value: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Object file generation failed: {0}")]
    ObjectWrite(String),
}

/// Result type alias for JIT operations.
pub type JitResult<T> = Result<T, JitError>;
