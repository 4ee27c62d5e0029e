// The backend is the per-instruction-set half of the code generator. The versioning engine,
// branch bookkeeping and invalidation protocol are written once against this trait, and each
// target supplies the machine code for the handful of fixed sequences they need: exits back to
// the interpreter, branch code for every branch kind and shape, stubs that call the stub hit
// handler, the entry prologue and the shared exit continuations. Every branch sequence a backend
// emits must have a size determined by its kind and shape alone, since branches are rewritten in
// place and may only keep or lose bytes, never grow. Backends also register their opcode
// generators with the codegen registry at start-up.

//! Per-ISA code generation interface.

use super::CodegenRegistry;
use crate::asm::opnd::Cond;
use crate::asm::{CodeBuffer, CodePtr};
use crate::bbv::{BranchKind, BranchShape, Context};
use crate::core::options::TargetArch;
use crate::core::stats::RuntimeCounters;

/// Where branch stubs call into when first executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubHitTarget {
    /// First argument passed to the handler.
    pub jit: u64,

    /// Address of the handler.
    pub handler: u64,
}

/// Machine code generation for one instruction set.
pub trait Backend: Send + Sync {
    fn arch(&self) -> TargetArch;

    /// Byte pattern that faults when executed, used to fill unused memory.
    fn fill_byte(&self) -> u8;

    /// Largest executable region this backend's branches can span.
    fn max_exec_mem(&self) -> usize {
        usize::MAX
    }

    fn register_generators(&self, registry: &mut CodegenRegistry);

    /// Unconditional jump with a fixed size encoding.
    fn jmp_ptr(&self, cb: &mut CodeBuffer, target: CodePtr);

    /// Conditional jump with a fixed size encoding.
    fn jcc_ptr(&self, cb: &mut CodeBuffer, cond: Cond, target: CodePtr);

    /// Emit the code for a branch of `kind` laid out as `shape`.
    fn gen_branch(
        &self,
        cb: &mut CodeBuffer,
        kind: BranchKind,
        targets: [Option<CodePtr>; 2],
        shape: BranchShape,
    );

    /// Exit to the interpreter at `exit_pc`, writing back the stack pointer of `ctx`.
    fn gen_exit(
        &self,
        cb: &mut CodeBuffer,
        exit_pc: u64,
        ctx: &Context,
        counters: Option<&RuntimeCounters>,
    ) -> CodePtr;

    /// Continuation reached by returning from the outermost JIT frame.
    fn gen_leave_exit(&self, cb: &mut CodeBuffer, counters: Option<&RuntimeCounters>) -> CodePtr;

    /// Exit taken when the stub hit handler could not compile its target.
    fn gen_exit_from_stub(
        &self,
        cb: &mut CodeBuffer,
        counters: Option<&RuntimeCounters>,
    ) -> CodePtr;

    /// Native entry sequence taking the execution context and control frame as C arguments.
    fn gen_entry_prologue(&self, cb: &mut CodeBuffer, leave_exit: CodePtr) -> CodePtr;

    /// Stub that calls the stub hit handler for target `target_idx` of `branch`, then jumps
    /// to the address it returns.
    fn gen_branch_stub(
        &self,
        ocb: &mut CodeBuffer,
        stub_hit: StubHitTarget,
        branch: u64,
        target_idx: u32,
    ) -> CodePtr;

    /// Increment the runtime counter at `counter_addr`.
    fn gen_counter_inc(&self, cb: &mut CodeBuffer, counter_addr: u64);
}

/// Destination `idx` of a branch, which must be known.
pub(crate) fn branch_target(targets: [Option<CodePtr>; 2], idx: usize) -> CodePtr {
    match targets[idx] {
        Some(target) => target,
        None => panic!("branch is missing target {idx}"),
    }
}
