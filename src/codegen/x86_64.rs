// This module is the x86-64 backend. Generated code keeps three values in callee-saved
// registers for its whole lifetime: the current control frame in r13, the execution context in
// r12 and the JIT's view of the interpreter stack pointer in rbx. The entry prologue saves those
// three registers and loads them from the C arguments (execution context, control frame); every
// exit restores them and returns to the caller with the interpreter's "undefined" value in rax,
// which the host reads as "continue interpreting from cfp->pc". A branch is a fixed sequence of
// rel32 jumps per kind and shape so that it can be rewritten in place. Stubs load the handle of
// their branch and target index into argument registers, call the stub hit handler and jump to
// the address it returns. The opcode generators for the bytecode subset the JIT understands live
// here as well, written directly against the iced based encoder in crate::asm::x86_64.

//! x86-64 backend and opcode generators.

use super::backend::{branch_target, Backend, StubHitTarget};
use super::branch::{defer_compilation, gen_branch, gen_direct_jump, jit_chain_guard};
use super::{CodegenRegistry, CodegenStatus, JitState};
use crate::asm::opnd::{imm_opnd, mem_opnd, uimm_opnd, Cond, Opnd, Reg};
use crate::asm::x86_64::*;
use crate::asm::{CodeBuffer, CodePtr};
use crate::bbv::{BranchKind, BranchShape, Context, InsnOpnd, Type};
use crate::bytecode::Opcode;
use crate::core::options::TargetArch;
use crate::core::stats::{Counter, RuntimeCounters};
use crate::host::*;

/// Current control frame.
pub const REG_CFP: Reg = R13;

/// Execution context.
pub const REG_EC: Reg = R12;

/// Interpreter stack pointer as seen by generated code.
pub const REG_SP: Reg = RBX;

/// Scratch registers.
pub const REG0: Reg = RAX;
pub const REG1: Reg = RCX;

/// Byte that raises #UD when executed.
pub const FILL_BYTE: u8 = 0x1E;

/// Guard chain depth for operand type checks of sends.
const SEND_MAX_DEPTH: u8 = 5;

pub struct X86Backend;

fn sp_opnd(disp: i32) -> Opnd {
    mem_opnd(64, REG_SP, disp)
}

fn cfp_opnd(offset: i32) -> Opnd {
    mem_opnd(64, REG_CFP, offset)
}

/// Restore the callee-saved registers pushed by the prologue.
fn pop_jit_regs(cb: &mut CodeBuffer) {
    pop(cb, REG_SP);
    pop(cb, REG_EC);
    pop(cb, REG_CFP);
}

fn counter_inc(cb: &mut CodeBuffer, counters: Option<&RuntimeCounters>, counter: Counter) {
    if let Some(counters) = counters {
        X86Backend.gen_counter_inc(cb, counters.addr(counter));
    }
}

impl Backend for X86Backend {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn fill_byte(&self) -> u8 {
        FILL_BYTE
    }

    fn register_generators(&self, registry: &mut CodegenRegistry) {
        registry.register(Opcode::Nop, gen_nop);
        registry.register(Opcode::Pop, gen_pop);
        registry.register(Opcode::Dup, gen_dup);
        registry.register(Opcode::Swap, gen_swap);
        registry.register(Opcode::Putnil, gen_putnil);
        registry.register(Opcode::Putself, gen_putself);
        registry.register(Opcode::Putobject, gen_putobject);
        registry.register(Opcode::PutobjectInt2Fix0, gen_putobject_int2fix);
        registry.register(Opcode::PutobjectInt2Fix1, gen_putobject_int2fix);
        registry.register(Opcode::Getlocal, gen_getlocal);
        registry.register(Opcode::Setlocal, gen_setlocal);
        registry.register(Opcode::Jump, gen_jump);
        registry.register(Opcode::Branchif, gen_branchif);
        registry.register(Opcode::Branchunless, gen_branchunless);
        registry.register(Opcode::Branchnil, gen_branchnil);
        registry.register(Opcode::OptNilP, gen_opt_nil_p);
        registry.register(Opcode::OptPlus, gen_opt_plus);
        registry.register(Opcode::OptGetinlinecache, gen_opt_getinlinecache);
        registry.register(Opcode::Invokebuiltin, gen_invokebuiltin);
        registry.register(Opcode::Leave, gen_leave);
    }

    fn jmp_ptr(&self, cb: &mut CodeBuffer, target: CodePtr) {
        jmp_ptr(cb, target);
    }

    fn jcc_ptr(&self, cb: &mut CodeBuffer, cond: Cond, target: CodePtr) {
        jcc_ptr(cb, cond, target);
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
            (BranchKind::Jump, BranchShape::Default) => jmp_ptr(cb, branch_target(targets, 0)),
            (BranchKind::Cond(cond), BranchShape::Next0) => {
                jcc_ptr(cb, cond.invert(), branch_target(targets, 1))
            }
            (BranchKind::Cond(cond), BranchShape::Next1) => {
                jcc_ptr(cb, cond, branch_target(targets, 0))
            }
            (BranchKind::Cond(cond), BranchShape::Default) => {
                jcc_ptr(cb, cond, branch_target(targets, 0));
                jmp_ptr(cb, branch_target(targets, 1));
            }
            (BranchKind::Guard(cond), BranchShape::Default) => {
                jcc_ptr(cb, cond, branch_target(targets, 0))
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

        // Write back the stack pointer the interpreter will resume with
        if ctx.get_sp_offset() != 0 {
            lea(cb, REG_SP, sp_opnd(ctx.sp_disp(0)));
            mov(cb, cfp_opnd(CFP_SP), REG_SP.into());
        }

        mov(cb, REG0.into(), uimm_opnd(exit_pc));
        mov(cb, cfp_opnd(CFP_PC), REG0.into());

        counter_inc(cb, counters, Counter::SideExit);

        pop_jit_regs(cb);
        mov(cb, REG0.into(), uimm_opnd(Value::UNDEF.as_u64()));
        ret(cb);

        code_ptr
    }

    fn gen_leave_exit(&self, cb: &mut CodeBuffer, counters: Option<&RuntimeCounters>) -> CodePtr {
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("leave exit");

        counter_inc(cb, counters, Counter::LeaveInterpReturn);

        // The return value is already in rax
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
        mov(cb, REG0.into(), uimm_opnd(Value::UNDEF.as_u64()));
        ret(cb);

        code_ptr
    }

    fn gen_entry_prologue(&self, cb: &mut CodeBuffer, leave_exit: CodePtr) -> CodePtr {
        cb.align_pos(64);
        let code_ptr = cb.get_write_ptr();
        cb.add_comment("entry prologue");

        push(cb, REG_CFP);
        push(cb, REG_EC);
        push(cb, REG_SP);

        mov(cb, REG_EC.into(), C_ARG_REGS[0].into());
        mov(cb, REG_CFP.into(), C_ARG_REGS[1].into());
        mov(cb, REG_SP.into(), cfp_opnd(CFP_SP));

        // Returning from the outermost frame lands in the leave exit
        mov(cb, REG0.into(), uimm_opnd(leave_exit.as_u64()));
        mov(cb, cfp_opnd(CFP_JIT_RETURN), REG0.into());

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

        mov(ocb, C_ARG_REGS[0].into(), uimm_opnd(stub_hit.jit));
        mov(ocb, C_ARG_REGS[1].into(), uimm_opnd(branch));
        mov(ocb, C_ARG_REGS[2].into(), uimm_opnd(target_idx as u64));
        mov(ocb, C_ARG_REGS[3].into(), REG_EC.into());
        call_ptr(ocb, REG0, stub_hit.handler);

        // Jump to the address returned by the handler
        jmp_reg(ocb, RAX);

        stub_addr
    }

    fn gen_counter_inc(&self, cb: &mut CodeBuffer, counter_addr: u64) {
        mov(cb, REG1.into(), uimm_opnd(counter_addr));
        lock_add(cb, mem_opnd(64, REG1, 0), 1);
    }
}

/// Side exit when the execution context has a pending interrupt.
fn gen_check_ints(cb: &mut CodeBuffer, side_exit: CodePtr) {
    cb.add_comment("check interrupts");
    cmp(cb, mem_opnd(32, REG_EC, EC_INTERRUPT_FLAG), imm_opnd(0));
    jcc_ptr(cb, Cond::NZ, side_exit);
}

/// Save the PC of the next instruction to the frame.
fn jit_save_pc(jit: &mut JitState<'_>) {
    let next_pc = jit.next_pc();
    let cb = jit.cb();
    mov(cb, REG0.into(), uimm_opnd(next_pc));
    mov(cb, cfp_opnd(CFP_PC), REG0.into());
}

/// Flush the stack pointer to the frame and rebase the context on it.
fn gen_save_sp(cb: &mut CodeBuffer, ctx: &mut Context) {
    if ctx.get_sp_offset() != 0 {
        lea(cb, REG_SP, sp_opnd(ctx.sp_disp(0)));
        mov(cb, cfp_opnd(CFP_SP), REG_SP.into());
        ctx.set_sp_offset(0);
    }
}

/// Make the frame look like the interpreter's before calling a host routine that may inspect
/// it, raise, or write locals.
fn jit_prepare_routine_call(jit: &mut JitState<'_>, ctx: &mut Context) {
    jit.set_record_boundary_patch_point();
    jit_save_pc(jit);
    gen_save_sp(jit.cb(), ctx);
    ctx.clear_local_types();
}

fn jit_putobject(jit: &mut JitState<'_>, ctx: &mut Context, arg: Value) {
    let val_type = Type::from_value(arg);
    let stack_top = sp_opnd(ctx.stack_push(val_type));
    let cb = jit.cb();

    let raw = arg.as_u64() as i64;
    if i32::try_from(raw).is_ok() {
        mov(cb, stack_top, imm_opnd(raw));
    } else {
        mov(cb, REG0.into(), uimm_opnd(arg.as_u64()));
        mov(cb, stack_top, REG0.into());
    }
}

/// Index of the instruction `offset` slots past the next one.
fn jump_target_idx(jit: &JitState<'_>, offset: i64) -> u32 {
    (jit.next_insn_idx() as i64 + offset) as u32
}

fn gen_nop(_jit: &mut JitState<'_>, _ctx: &mut Context) -> CodegenStatus {
    CodegenStatus::KeepCompiling
}

fn gen_pop(_jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    // Decrement SP
    ctx.stack_pop(1);
    CodegenStatus::KeepCompiling
}

fn gen_dup(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let dup_val = sp_opnd(ctx.stack_opnd(0));
    let mapping = ctx.get_opnd_mapping(InsnOpnd::StackOpnd(0));

    let loc0 = sp_opnd(ctx.stack_push_mapping(mapping));
    let cb = jit.cb();
    mov(cb, REG0.into(), dup_val);
    mov(cb, loc0, REG0.into());

    CodegenStatus::KeepCompiling
}

fn gen_swap(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let opnd0 = sp_opnd(ctx.stack_opnd(0));
    let opnd1 = sp_opnd(ctx.stack_opnd(1));
    let mapping0 = ctx.get_opnd_mapping(InsnOpnd::StackOpnd(0));
    let mapping1 = ctx.get_opnd_mapping(InsnOpnd::StackOpnd(1));

    let cb = jit.cb();
    mov(cb, REG0.into(), opnd0);
    mov(cb, REG1.into(), opnd1);
    mov(cb, opnd0, REG1.into());
    mov(cb, opnd1, REG0.into());

    ctx.set_opnd_mapping(InsnOpnd::StackOpnd(0), mapping1);
    ctx.set_opnd_mapping(InsnOpnd::StackOpnd(1), mapping0);

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

fn gen_putobject_int2fix(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let cst_val = if jit.get_opcode() == Opcode::PutobjectInt2Fix0 {
        0
    } else {
        1
    };
    jit_putobject(jit, ctx, Value::fixnum(cst_val));
    CodegenStatus::KeepCompiling
}

fn gen_putself(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let cb = jit.cb();
    mov(cb, REG0.into(), cfp_opnd(CFP_SELF));

    let stack_top = sp_opnd(ctx.stack_push_self());
    mov(jit.cb(), stack_top, REG0.into());

    CodegenStatus::KeepCompiling
}

/// Displacement from the environment pointer of a local.
fn local_disp(jit: &JitState<'_>, local_idx: u32) -> i32 {
    let local_table_size = jit.get_iseq().local_table_size();
    local_ep_offset(local_table_size, local_idx) * VALUE_SIZE
}

fn gen_getlocal(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let local_idx = jit.get_arg(0) as u32;
    let disp = local_disp(jit, local_idx);

    let cb = jit.cb();
    mov(cb, REG0.into(), cfp_opnd(CFP_EP));
    mov(cb, REG0.into(), mem_opnd(64, REG0, disp));

    let stack_top = sp_opnd(ctx.stack_push_local(local_idx as usize));
    mov(jit.cb(), stack_top, REG0.into());

    CodegenStatus::KeepCompiling
}

fn gen_setlocal(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let local_idx = jit.get_arg(0) as u32;
    let disp = local_disp(jit, local_idx);

    let cb = jit.cb();
    mov(cb, REG0.into(), cfp_opnd(CFP_EP));

    // Environments that escaped to the heap need a write barrier; leave those to the interpreter
    test(cb, mem_opnd(64, REG0, 0), imm_opnd(ENV_FLAG_WB_REQUIRED as i64));
    let side_exit = jit.get_side_exit(ctx);
    jcc_ptr(jit.cb(), Cond::NZ, side_exit);

    let temp_type = ctx.get_opnd_type(InsnOpnd::StackOpnd(0));
    ctx.set_local_type(local_idx as usize, temp_type);

    let stack_top = sp_opnd(ctx.stack_pop(1));
    let cb = jit.cb();
    mov(cb, REG1.into(), stack_top);
    mov(cb, mem_opnd(64, REG0, disp), REG1.into());

    CodegenStatus::KeepCompiling
}

fn gen_jump(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let jump_offset = jit.get_arg(0) as i64;

    // Backward jumps can loop forever, so they must let interrupts in
    if jump_offset < 0 {
        let side_exit = jit.get_side_exit(ctx);
        gen_check_ints(jit.cb(), side_exit);
    }

    let jump_block = jit.blockid_at(jump_target_idx(jit, jump_offset));
    gen_direct_jump(jit, ctx, jump_block);

    CodegenStatus::EndBlock
}

/// Shared tail of the conditional branch instructions: `cond` holding after the test sends
/// execution to the jump target.
fn gen_conditional_branch(
    jit: &mut JitState<'_>,
    ctx: &mut Context,
    test_val: impl FnOnce(&mut CodeBuffer, Opnd),
    cond: Cond,
) -> CodegenStatus {
    let jump_offset = jit.get_arg(0) as i64;

    if jump_offset < 0 {
        let side_exit = jit.get_side_exit(ctx);
        gen_check_ints(jit.cb(), side_exit);
    }

    let val_opnd = sp_opnd(ctx.stack_pop(1));
    test_val(jit.cb(), val_opnd);

    let jump_block = jit.blockid_at(jump_target_idx(jit, jump_offset));
    let next_block = jit.blockid_at(jit.next_insn_idx());

    gen_branch(
        jit,
        ctx,
        jump_block,
        ctx,
        Some((next_block, &*ctx)),
        BranchKind::Cond(cond),
    );

    CodegenStatus::EndBlock
}

/// Test for a value other than `nil` and `false`.
fn test_truthy(cb: &mut CodeBuffer, val_opnd: Opnd) {
    test(cb, val_opnd, imm_opnd(!(Value::NIL.as_u64() as i64)));
}

fn gen_branchif(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    gen_conditional_branch(jit, ctx, test_truthy, Cond::NZ)
}

fn gen_branchunless(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    gen_conditional_branch(jit, ctx, test_truthy, Cond::Z)
}

fn gen_branchnil(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let test_nil = |cb: &mut CodeBuffer, val_opnd: Opnd| {
        cmp(cb, val_opnd, uimm_opnd(Value::NIL.as_u64()));
    };
    gen_conditional_branch(jit, ctx, test_nil, Cond::Z)
}

fn gen_opt_nil_p(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let recv_type = ctx.get_opnd_type(InsnOpnd::StackOpnd(0));

    // The answer is known when the receiver's type is
    let known = match recv_type {
        Type::Nil => Some(Value::TRUE),
        Type::Unknown | Type::UnknownImm => None,
        _ => Some(Value::FALSE),
    };
    if let Some(result) = known {
        ctx.stack_pop(1);
        jit_putobject(jit, ctx, result);
        return CodegenStatus::KeepCompiling;
    }

    let recv = sp_opnd(ctx.stack_pop(1));
    let cb = jit.cb();
    let is_nil = cb.new_label("is_nil");
    let done = cb.new_label("done");

    mov(cb, REG0.into(), recv);
    cmp(cb, REG0.into(), uimm_opnd(Value::NIL.as_u64()));
    jcc_label(cb, Cond::Z, is_nil);
    mov(cb, REG0.into(), uimm_opnd(Value::FALSE.as_u64()));
    jmp_label(cb, done);
    cb.write_label(is_nil);
    mov(cb, REG0.into(), uimm_opnd(Value::TRUE.as_u64()));
    cb.write_label(done);
    cb.link_labels();

    let stack_ret = sp_opnd(ctx.stack_push(Type::UnknownImm));
    mov(jit.cb(), stack_ret, REG0.into());

    CodegenStatus::KeepCompiling
}

/// Guard that the two values on top of the stack are fixnums.
fn guard_two_fixnums(jit: &mut JitState<'_>, ctx: &mut Context, side_exit: CodePtr) {
    let arg1_type = ctx.get_opnd_type(InsnOpnd::StackOpnd(0));
    let arg0_type = ctx.get_opnd_type(InsnOpnd::StackOpnd(1));

    if arg0_type.is_heap() || arg1_type.is_heap() {
        jmp_ptr(jit.cb(), side_exit);
        return;
    }

    if (arg0_type != Type::Fixnum && arg0_type.is_specific())
        || (arg1_type != Type::Fixnum && arg1_type.is_specific())
    {
        jmp_ptr(jit.cb(), side_exit);
        return;
    }

    let arg1 = sp_opnd(ctx.stack_opnd(0));
    let arg0 = sp_opnd(ctx.stack_opnd(1));

    if arg0_type != Type::Fixnum {
        jit.cb().add_comment("guard arg0 fixnum");
        test(jit.cb(), arg0, imm_opnd(Value::FIXNUM_FLAG as i64));
        jit_chain_guard(jit, ctx, Cond::Z, SEND_MAX_DEPTH, side_exit);
    }

    if arg1_type != Type::Fixnum {
        jit.cb().add_comment("guard arg1 fixnum");
        test(jit.cb(), arg1, imm_opnd(Value::FIXNUM_FLAG as i64));
        jit_chain_guard(jit, ctx, Cond::Z, SEND_MAX_DEPTH, side_exit);
    }

    ctx.upgrade_opnd_type(InsnOpnd::StackOpnd(0), Type::Fixnum);
    ctx.upgrade_opnd_type(InsnOpnd::StackOpnd(1), Type::Fixnum);
}

fn gen_opt_plus(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    // Specialize on the operands seen at run time
    if !jit.at_current_insn() {
        defer_compilation(jit, ctx);
        return CodegenStatus::EndBlock;
    }

    let comptime_a = jit.peek_at_stack(ctx, 1);
    let comptime_b = jit.peek_at_stack(ctx, 0);

    if !(comptime_a.fixnum_p() && comptime_b.fixnum_p()) {
        return CodegenStatus::CantCompile;
    }

    let side_exit = jit.get_side_exit(ctx);
    guard_two_fixnums(jit, ctx, side_exit);

    let arg1 = sp_opnd(ctx.stack_pop(1));
    let arg0 = sp_opnd(ctx.stack_pop(1));

    // Add arg0 + arg1 and test for overflow, removing one tag bit first
    let cb = jit.cb();
    mov(cb, REG0.into(), arg0);
    sub(cb, REG0.into(), imm_opnd(1));
    add(cb, REG0.into(), arg1);
    jcc_ptr(cb, Cond::O, side_exit);

    let dst = sp_opnd(ctx.stack_push(Type::Fixnum));
    mov(jit.cb(), dst, REG0.into());

    CodegenStatus::KeepCompiling
}

fn gen_opt_getinlinecache(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let jump_offset = jit.get_arg(0) as i64;

    let Some(value) = jit.get_iseq().inline_cache_value(jit.get_insn_idx()) else {
        return CodegenStatus::CantCompile;
    };

    // The cached value is baked in; invalidation reaches this code through the entry exit
    jit.ensure_block_entry_exit();
    jit_putobject(jit, ctx, value);

    let jump_block = jit.blockid_at(jump_target_idx(jit, jump_offset));
    gen_direct_jump(jit, ctx, jump_block);

    CodegenStatus::EndBlock
}

fn gen_invokebuiltin(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    let func_ptr = jit.get_arg(0);
    let argc = jit.get_arg(1) as usize;

    // Tracing hooks need every call to go through the interpreter
    if jit.tracing_active() {
        return CodegenStatus::CantCompile;
    }

    // ec, self, and the arguments must fit in registers
    if argc + 2 > C_ARG_REGS.len() {
        return CodegenStatus::CantCompile;
    }

    jit_prepare_routine_call(jit, ctx);

    let cb = jit.cb();
    mov(cb, C_ARG_REGS[0].into(), REG_EC.into());
    mov(cb, C_ARG_REGS[1].into(), cfp_opnd(CFP_SELF));

    for i in 0..argc {
        let stack_opnd = sp_opnd(ctx.stack_opnd((argc - i - 1) as i32));
        mov(cb, C_ARG_REGS[i + 2].into(), stack_opnd);
    }

    call_ptr(cb, REG0, func_ptr);

    ctx.stack_pop(argc);
    let stack_ret = sp_opnd(ctx.stack_push(Type::Unknown));
    mov(jit.cb(), stack_ret, RAX.into());

    CodegenStatus::KeepCompiling
}

fn gen_leave(jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
    // Only the return value may be left on the stack
    assert_eq!(ctx.get_stack_size(), 1, "leave with more than the return value on the stack");

    let side_exit = jit.get_side_exit(ctx);
    gen_check_ints(jit.cb(), side_exit);

    let ret_val = sp_opnd(ctx.stack_pop(1));
    let cb = jit.cb();
    mov(cb, REG0.into(), ret_val);

    // Pop the frame (ec->cfp++) and push the return value on the caller's stack
    add(cb, REG_CFP.into(), imm_opnd(CONTROL_FRAME_SIZE as i64));
    mov(cb, mem_opnd(64, REG_EC, EC_CFP), REG_CFP.into());
    mov(cb, REG_SP.into(), cfp_opnd(CFP_SP));
    mov(cb, mem_opnd(64, REG_SP, 0), REG0.into());

    // Return through the popped frame's jit_return
    jmp_rm(cb, cfp_opnd(CFP_JIT_RETURN - CONTROL_FRAME_SIZE));

    CodegenStatus::EndBlock
}
