// This module is the AArch64 backend. It mirrors the register conventions of the x86-64 backend
// with callee-saved registers: x19 holds the control frame, x20 the execution context and x21
// the interpreter stack pointer, while x0, x1, x16 and x17 are scratch. The prologue and every
// exit save and restore those registers together with the link register on the machine stack.
// Conditional branches to arbitrary targets are emitted as an inverted b.cond over an
// unconditional b, which keeps every branch kind and shape at a fixed size and gives all
// branches the ±128 MiB reach of b, so the executable region is capped at that size. Only a
// reference subset of opcodes has generators on this backend; everything else side exits.

//! AArch64 backend.

use super::backend::{branch_target, Backend, StubHitTarget};
use super::branch::gen_direct_jump;
use super::{CodegenRegistry, CodegenStatus, JitState};
use crate::asm::arm64::*;
use crate::asm::opnd::{mem_opnd, mem_post_opnd, mem_pre_opnd, Cond, Opnd, Reg};
use crate::asm::{CodeBuffer, CodePtr};
use crate::bbv::{BranchKind, BranchShape, Context, Type};
use crate::bytecode::Opcode;
use crate::core::options::TargetArch;
use crate::core::stats::{Counter, RuntimeCounters};
use crate::host::*;

pub const REG_CFP: Reg = X19;
pub const REG_EC: Reg = X20;
pub const REG_SP: Reg = X21;

pub const REG0: Reg = X0;
pub const REG1: Reg = X1;

/// Intra-procedure-call scratch registers.
const SCRATCH0: Reg = X16;
const SCRATCH1: Reg = X17;

/// Size of a conditional branch to an arbitrary target.
pub const JCC_PTR_BYTES: usize = 8;

/// Size of an unconditional branch.
pub const JMP_PTR_BYTES: usize = 4;

pub struct Arm64Backend;

fn sp_opnd(disp: i32) -> Opnd {
    mem_opnd(64, REG_SP, disp)
}

fn cfp_opnd(offset: i32) -> Opnd {
    mem_opnd(64, REG_CFP, offset)
}

/// `b.cond target` with the reach of `b`.
fn jcc_far(cb: &mut CodeBuffer, cond: Cond, target: CodePtr) {
    let skip = cb.get_write_ptr().add_bytes(JCC_PTR_BYTES);
    bcond(cb, cond.invert(), skip);
    b(cb, target);
}

fn push_jit_regs(cb: &mut CodeBuffer) {
    for reg in [X30, REG_CFP, REG_EC, REG_SP] {
        str(cb, reg, mem_pre_opnd(64, SP, -16));
    }
}

fn pop_jit_regs(cb: &mut CodeBuffer) {
    for reg in [REG_SP, REG_EC, REG_CFP, X30] {
        ldr(cb, reg, mem_post_opnd(64, SP, 16));
    }
}

fn counter_inc(cb: &mut CodeBuffer, counters: Option<&RuntimeCounters>, counter: Counter) {
    if let Some(counters) = counters {
        Arm64Backend.gen_counter_inc(cb, counters.addr(counter));
    }
}

impl Backend for Arm64Backend {
    fn arch(&self) -> TargetArch {
        TargetArch::Arm64
    }

    fn fill_byte(&self) -> u8 {
        // 0x00000000 is a permanently undefined instruction
        0x00
    }

    fn max_exec_mem(&self) -> usize {
        BRANCH_RANGE
    }

    fn register_generators(&self, registry: &mut CodegenRegistry) {
        registry.register(Opcode::Nop, gen_nop);
        registry.register(Opcode::Pop, gen_pop);
        registry.register(Opcode::Putnil, gen_putnil);
        registry.register(Opcode::Putself, gen_putself);
        registry.register(Opcode::Putobject, gen_putobject);
        registry.register(Opcode::Jump, gen_jump);
        registry.register(Opcode::Leave, gen_leave);
    }

    fn jmp_ptr(&self, cb: &mut CodeBuffer, target: CodePtr) {
        b(cb, target);
    }

    fn jcc_ptr(&self, cb: &mut CodeBuffer, cond: Cond, target: CodePtr) {
        jcc_far(cb, cond, target);
    }

    fn gen_branch(
        &self,
        cb: &mut CodeBuffer,
        kind: BranchKind,
        targets: [Option<CodePtr>; 2],
        shape: BranchShape,
    ) {
        match (kind, shape) {
            (BranchKind::Jump, BranchShape::Next0) => {}
            (BranchKind::Jump, BranchShape::Default) => b(cb, branch_target(targets, 0)),
            (BranchKind::Cond(cond), BranchShape::Next0) => {
                jcc_far(cb, cond.invert(), branch_target(targets, 1))
            }
            (BranchKind::Cond(cond), BranchShape::Next1) => {
                jcc_far(cb, cond, branch_target(targets, 0))
            }
            (BranchKind::Cond(cond), BranchShape::Default) => {
                jcc_far(cb, cond, branch_target(targets, 0));
                b(cb, branch_target(targets, 1));
            }
            (BranchKind::Guard(cond), BranchShape::Default) => {
                jcc_far(cb, cond, branch_target(targets, 0))
            }
            (kind, shape) => panic!("{kind:?} branch cannot have shape {shape:?}"),
        }
    }

    fn gen_exit(
        &self,
        cb: &mut CodeBuffer,
        exit_pc: u64,
        ctx: &Context,
        counters: Option<&RuntimeCounters>,
    ) -> CodePtr {
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("exit to interpreter");

        if ctx.get_sp_offset() != 0 {
            add(cb, REG_SP, REG_SP, Opnd::Imm(ctx.sp_disp(0) as i64));
            str(cb, REG_SP, cfp_opnd(CFP_SP));
        }

        mov_u64(cb, SCRATCH0, exit_pc);
        str(cb, SCRATCH0, cfp_opnd(CFP_PC));

        counter_inc(cb, counters, Counter::SideExit);

        pop_jit_regs(cb);
        mov_u64(cb, REG0, Value::UNDEF.as_u64());
        ret(cb);

        code_ptr
    }

    fn gen_leave_exit(&self, cb: &mut CodeBuffer, counters: Option<&RuntimeCounters>) -> CodePtr {
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("leave exit");

        counter_inc(cb, counters, Counter::LeaveInterpReturn);
        pop_jit_regs(cb);
        ret(cb);

        code_ptr
    }

    fn gen_exit_from_stub(
        &self,
        cb: &mut CodeBuffer,
        counters: Option<&RuntimeCounters>,
    ) -> CodePtr {
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("exit from branch stub");

        counter_inc(cb, counters, Counter::ExitFromBranchStub);
        pop_jit_regs(cb);
        mov_u64(cb, REG0, Value::UNDEF.as_u64());
        ret(cb);

        code_ptr
    }

    fn gen_entry_prologue(&self, cb: &mut CodeBuffer, leave_exit: CodePtr) -> CodePtr {
        cb.align_pos(64);
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("entry prologue");

        push_jit_regs(cb);
        mov(cb, REG_EC, Opnd::Reg(C_ARG_REGS[0]));
        mov(cb, REG_CFP, Opnd::Reg(C_ARG_REGS[1]));
        ldr(cb, REG_SP, cfp_opnd(CFP_SP));

        mov_u64(cb, SCRATCH0, leave_exit.as_u64());
        str(cb, SCRATCH0, cfp_opnd(CFP_JIT_RETURN));

        code_ptr
    }

    fn gen_branch_stub(
        &self,
        ocb: &mut CodeBuffer,
        stub_hit: StubHitTarget,
        branch: u64,
        target_idx: u32,
    ) -> CodePtr {
        let stub_addr = ocb.get_write_ptr();
        ocb.add_comment("branch stub hit");

        mov_u64(ocb, C_ARG_REGS[0], stub_hit.jit);
        mov_u64(ocb, C_ARG_REGS[1], branch);
        mov_u64(ocb, C_ARG_REGS[2], target_idx as u64);
        mov(ocb, C_ARG_REGS[3], Opnd::Reg(REG_EC));
        mov_u64(ocb, SCRATCH0, stub_hit.handler);
        blr(ocb, SCRATCH0);
        br(ocb, REG0);

        stub_addr
    }

    fn gen_counter_inc(&self, cb: &mut CodeBuffer, counter_addr: u64) {
        mov_u64(cb, SCRATCH1, counter_addr);
        ldr(cb, SCRATCH0, mem_opnd(64, SCRATCH1, 0));
        add(cb, SCRATCH0, SCRATCH0, Opnd::Imm(1));
        str(cb, SCRATCH0, mem_opnd(64, SCRATCH1, 0));
    }
}

fn gen_check_ints(cb: &mut CodeBuffer, side_exit: CodePtr) {
    cb.add_comment("check interrupts");
    let flag = REG0.with_bits(32);
    ldr(cb, flag, mem_opnd(32, REG_EC, EC_INTERRUPT_FLAG));
    cmp(cb, flag, Opnd::Imm(0));
    jcc_far(cb, Cond::NZ, side_exit);
}

fn jit_putobject(jit: &mut JitState<'_>, ctx: &mut Context, arg: Value) {
    let stack_top = sp_opnd(ctx.stack_push(Type::from_value(arg)));
    let cb = jit.cb();
    mov_u64(cb, REG0, arg.as_u64());
    str(cb, REG0, stack_top);
}

fn gen_nop(_jit: &mut JitState<'_>, _ctx: &mut Context) -> CodegenStatus {
    CodegenStatus::KeepCompiling
}

fn gen_pop(_jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    ctx.stack_pop(1);
    CodegenStatus::KeepCompiling
}

fn gen_putnil(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    jit_putobject(jit, ctx, Value::NIL);
    CodegenStatus::KeepCompiling
}

fn gen_putobject(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let arg = Value(jit.get_arg(0));
    jit_putobject(jit, ctx, arg);
    CodegenStatus::KeepCompiling
}

fn gen_putself(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    ldr(jit.cb(), REG0, cfp_opnd(CFP_SELF));
    let stack_top = sp_opnd(ctx.stack_push_self());
    str(jit.cb(), REG0, stack_top);
    CodegenStatus::KeepCompiling
}

fn gen_jump(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let jump_offset = jit.get_arg(0) as i64;

    if jump_offset < 0 {
        let side_exit = jit.get_side_exit(ctx);
        gen_check_ints(jit.cb(), side_exit);
    }

    let jump_idx = (jit.next_insn_idx() as i64 + jump_offset) as u32;
    let jump_block = jit.blockid_at(jump_idx);
    gen_direct_jump(jit, ctx, jump_block);

    CodegenStatus::EndBlock
}

fn gen_leave(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    assert_eq!(ctx.get_stack_size(), 1, "leave with more than the return value on the stack");

    let side_exit = jit.get_side_exit(ctx);
    gen_check_ints(jit.cb(), side_exit);

    let ret_val = sp_opnd(ctx.stack_pop(1));
    let cb = jit.cb();
    ldr(cb, REG0, ret_val);

    add(cb, REG_CFP, REG_CFP, Opnd::Imm(CONTROL_FRAME_SIZE as i64));
    str(cb, REG_CFP, mem_opnd(64, REG_EC, EC_CFP));
    ldr(cb, REG_SP, cfp_opnd(CFP_SP));
    str(cb, REG0, mem_opnd(64, REG_SP, 0));

    ldr(cb, SCRATCH0, cfp_opnd(CFP_JIT_RETURN - CONTROL_FRAME_SIZE));
    br(cb, SCRATCH0);

    CodegenStatus::EndBlock
}
