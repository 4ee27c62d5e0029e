//! bbjit - a lazy basic block versioning JIT core.
//!
//! bbjit compiles interpreter bytecode to native code one basic block at a time. Every block is
//! specialized on a [`Context`](bbv::Context) of types inferred for the stack, self and locals,
//! so the same bytecode may own several versions. Branches to blocks that have not run yet jump
//! to stubs; the first execution of a stub compiles the target and patches the branch in place.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bbjit::core::options::{JitOptions, TargetArch};
//! use bbjit::jit::Jit;
//!
//! let jit = Jit::simulated(TargetArch::X86_64, JitOptions::default())?;
//! let entry = jit.gen_entry_point(&iseq, 0, Some(&frame));
//! // ... the host redefined a method
//! jit.invalidate_all()?;
//! ```
//!
//! # Architecture
//!
//! - [`asm`] - code buffers over W^X memory, operands and the per-ISA encoders
//! - [`bbv`] - contexts, the block graph, version tables and invalidation state
//! - [`codegen`] - the versioning engine, branch stubs and the x86-64/AArch64 backends
//! - [`jit`] - the locked JIT instance the host interpreter talks to
//! - [`host`] - traits and layouts consumed from the interpreter
//! - [`dump`] - disassembly and ELF dumps
//! - [`test_iseq`] - textual bytecode and an in-memory host

pub mod asm;
pub mod bbv;
pub mod bytecode;
pub mod codegen;
pub mod core;
pub mod dump;
pub mod host;
pub mod jit;
pub mod test_iseq;

pub use bbv::{BlockId, Context, Type};
pub use self::core::error::{JitError, JitResult};
pub use self::core::options::{JitOptions, TargetArch};
pub use jit::Jit;
