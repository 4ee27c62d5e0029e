// This module encodes the x86-64 instructions the JIT emits, using the iced-x86 library. Each
// encoder function takes the code buffer and tagged operands, builds the instruction with a
// throwaway CodeAssembler positioned at the buffer's current address and appends the resulting
// bytes. Branches and calls to absolute targets are always encoded in their rel32 form through
// iced's Encoder so that every branch site has a fixed size and can be rewritten in place later
// without moving the code around it: JMP is 5 bytes and Jcc is 6. Label variants encode a zero
// displacement and register a label reference over the trailing four bytes, to be resolved by
// CodeBuffer::link_labels. An operand combination iced rejects, or an immediate that does not
// fit its field, is a bug in the code generator and aborts.

//! x86-64 instruction encoding using iced-x86.

use super::opnd::{Cond, Mem, Opnd, Reg};
use super::{CodeBuffer, CodePtr, Label};
use iced_x86::code_asm::*;
use iced_x86::{Code, Encoder, IcedError, Instruction};

pub const RAX: Reg = Reg::gp(0, 64);
pub const RCX: Reg = Reg::gp(1, 64);
pub const RDX: Reg = Reg::gp(2, 64);
pub const RBX: Reg = Reg::gp(3, 64);
pub const RSP: Reg = Reg::gp(4, 64);
pub const RBP: Reg = Reg::gp(5, 64);
pub const RSI: Reg = Reg::gp(6, 64);
pub const RDI: Reg = Reg::gp(7, 64);
pub const R8: Reg = Reg::gp(8, 64);
pub const R9: Reg = Reg::gp(9, 64);
pub const R10: Reg = Reg::gp(10, 64);
pub const R11: Reg = Reg::gp(11, 64);
pub const R12: Reg = Reg::gp(12, 64);
pub const R13: Reg = Reg::gp(13, 64);
pub const R14: Reg = Reg::gp(14, 64);
pub const R15: Reg = Reg::gp(15, 64);

/// System V integer argument registers.
pub const C_ARG_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Size of `jmp rel32`.
pub const JMP_PTR_BYTES: usize = 5;

/// Size of `jcc rel32`.
pub const JCC_PTR_BYTES: usize = 6;

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

fn gp64(reg: Reg) -> AsmRegister64 {
    GP64[reg.reg_no as usize]
}

fn gp32(reg: Reg) -> AsmRegister32 {
    GP32[reg.reg_no as usize]
}

fn gp8(reg: Reg) -> AsmRegister8 {
    GP8[reg.reg_no as usize]
}

fn mem(m: Mem) -> AsmMemoryOperand {
    let addr = gp64(m.base) + m.disp;
    match m.num_bits {
        64 => qword_ptr(addr),
        32 => dword_ptr(addr),
        16 => word_ptr(addr),
        8 => byte_ptr(addr),
        n => panic!("encoding range violation: {n}-bit memory operand"),
    }
}

fn imm32(imm: i64) -> i32 {
    match i32::try_from(imm) {
        Ok(imm) => imm,
        Err(_) => panic!("encoding range violation: {imm:#x} does not fit in 32 bits"),
    }
}

fn uimm32(imm: u64) -> i32 {
    match i32::try_from(imm) {
        Ok(imm) => imm,
        Err(_) => panic!("encoding range violation: {imm:#x} does not fit in 32 bits"),
    }
}

/// Assemble one instruction at the current write position.
fn emit(cb: &mut CodeBuffer, build: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) {
    let ip = cb.get_write_ptr().as_u64();
    let bytes = CodeAssembler::new(64).and_then(|mut asm| {
        build(&mut asm)?;
        asm.assemble(ip)
    });

    match bytes {
        Ok(bytes) => cb.write_bytes(&bytes),
        Err(err) => panic!("encoding range violation: {err}"),
    }
}

/// Encode a relative branch with a fixed size rel32 displacement.
fn emit_branch(cb: &mut CodeBuffer, code: Code, target: u64) {
    let ip = cb.get_write_ptr().as_u64();
    let encoded = Instruction::with_branch(code, target).and_then(|instr| {
        let mut encoder = Encoder::new(64);
        encoder.encode(&instr, ip)?;
        Ok(encoder.take_buffer())
    });

    match encoded {
        Ok(bytes) => cb.write_bytes(&bytes),
        Err(err) => panic!("encoding range violation: branch to {target:#x}: {err}"),
    }
}

fn jcc_code(cond: Cond) -> Code {
    match cond {
        Cond::Z => Code::Je_rel32_64,
        Cond::NZ => Code::Jne_rel32_64,
        Cond::BE => Code::Jbe_rel32_64,
        Cond::A => Code::Ja_rel32_64,
        Cond::L => Code::Jl_rel32_64,
        Cond::GE => Code::Jge_rel32_64,
        Cond::LE => Code::Jle_rel32_64,
        Cond::G => Code::Jg_rel32_64,
        Cond::O => Code::Jo_rel32_64,
        Cond::NO => Code::Jno_rel32_64,
    }
}

fn bad_operands(mnemonic: &str, dst: Opnd, src: Opnd) -> ! {
    panic!("encoding range violation: {mnemonic} {dst:?}, {src:?}")
}

pub fn mov(cb: &mut CodeBuffer, dst: Opnd, src: Opnd) {
    emit(cb, |a| match (dst, src) {
        (Opnd::Reg(d), Opnd::Reg(s)) if d.num_bits == 64 => a.mov(gp64(d), gp64(s)),
        (Opnd::Reg(d), Opnd::Reg(s)) if d.num_bits == 32 => a.mov(gp32(d), gp32(s)),
        (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 64 => a.mov(gp64(d), i),
        (Opnd::Reg(d), Opnd::UImm(u)) if d.num_bits == 64 => a.mov(gp64(d), u as i64),
        (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 32 => a.mov(gp32(d), imm32(i)),
        (Opnd::Reg(d), Opnd::Mem(m)) if d.num_bits == 64 => a.mov(gp64(d), mem(m)),
        (Opnd::Reg(d), Opnd::Mem(m)) if d.num_bits == 32 => a.mov(gp32(d), mem(m)),
        (Opnd::Mem(m), Opnd::Reg(s)) if s.num_bits == 64 => a.mov(mem(m), gp64(s)),
        (Opnd::Mem(m), Opnd::Reg(s)) if s.num_bits == 32 => a.mov(mem(m), gp32(s)),
        (Opnd::Mem(m), Opnd::Imm(i)) => a.mov(mem(m), imm32(i)),
        (Opnd::Mem(m), Opnd::UImm(u)) => a.mov(mem(m), uimm32(u)),
        _ => bad_operands("mov", dst, src),
    });
}

pub fn lea(cb: &mut CodeBuffer, dst: Reg, src: Opnd) {
    emit(cb, |a| match src {
        Opnd::Mem(m) => a.lea(gp64(dst), mem(m)),
        _ => bad_operands("lea", Opnd::Reg(dst), src),
    });
}

macro_rules! alu_op {
    ($name:ident) => {
        pub fn $name(cb: &mut CodeBuffer, dst: Opnd, src: Opnd) {
            emit(cb, |a| match (dst, src) {
                (Opnd::Reg(d), Opnd::Reg(s)) if d.num_bits == 64 => a.$name(gp64(d), gp64(s)),
                (Opnd::Reg(d), Opnd::Reg(s)) if d.num_bits == 32 => a.$name(gp32(d), gp32(s)),
                (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 64 => a.$name(gp64(d), imm32(i)),
                (Opnd::Reg(d), Opnd::UImm(u)) if d.num_bits == 64 => a.$name(gp64(d), uimm32(u)),
                (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 32 => a.$name(gp32(d), imm32(i)),
                (Opnd::Reg(d), Opnd::Mem(m)) if d.num_bits == 64 => a.$name(gp64(d), mem(m)),
                (Opnd::Mem(m), Opnd::Reg(s)) if s.num_bits == 64 => a.$name(mem(m), gp64(s)),
                (Opnd::Mem(m), Opnd::Imm(i)) => a.$name(mem(m), imm32(i)),
                (Opnd::Mem(m), Opnd::UImm(u)) => a.$name(mem(m), uimm32(u)),
                _ => bad_operands(stringify!($name), dst, src),
            });
        }
    };
}

alu_op!(add);
alu_op!(sub);
alu_op!(and);
alu_op!(or);
alu_op!(xor);
alu_op!(cmp);

pub fn test(cb: &mut CodeBuffer, dst: Opnd, src: Opnd) {
    emit(cb, |a| match (dst, src) {
        (Opnd::Reg(d), Opnd::Reg(s)) if d.num_bits == 64 => a.test(gp64(d), gp64(s)),
        (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 64 => a.test(gp64(d), imm32(i)),
        (Opnd::Reg(d), Opnd::Imm(i)) if d.num_bits == 8 => a.test(gp8(d), imm32(i)),
        (Opnd::Mem(m), Opnd::Imm(i)) => a.test(mem(m), imm32(i)),
        _ => bad_operands("test", dst, src),
    });
}

/// `lock add [mem], imm`
pub fn lock_add(cb: &mut CodeBuffer, dst: Opnd, imm: i64) {
    emit(cb, |a| match dst {
        Opnd::Mem(m) => a.lock().add(mem(m), imm32(imm)),
        _ => bad_operands("lock add", dst, Opnd::Imm(imm)),
    });
}

pub fn push(cb: &mut CodeBuffer, reg: Reg) {
    emit(cb, |a| a.push(gp64(reg)));
}

pub fn pop(cb: &mut CodeBuffer, reg: Reg) {
    emit(cb, |a| a.pop(gp64(reg)));
}

pub fn ret(cb: &mut CodeBuffer) {
    emit(cb, |a| a.ret());
}

pub fn nop(cb: &mut CodeBuffer) {
    emit(cb, |a| a.nop());
}

/// Trap if executed.
pub fn int3(cb: &mut CodeBuffer) {
    emit(cb, |a| a.int3());
}

pub fn call_reg(cb: &mut CodeBuffer, reg: Reg) {
    emit(cb, |a| a.call(gp64(reg)));
}

/// Call an absolute address, through `scratch` when it is out of rel32 range.
pub fn call_ptr(cb: &mut CodeBuffer, scratch: Reg, target: u64) {
    let next_ip = cb.get_write_ptr().as_u64() as i64 + 5;
    if i32::try_from(target as i64 - next_ip).is_ok() {
        emit_branch(cb, Code::Call_rel32_64, target);
    } else {
        mov(cb, Opnd::Reg(scratch), Opnd::UImm(target));
        call_reg(cb, scratch);
    }
}

pub fn jmp_reg(cb: &mut CodeBuffer, reg: Reg) {
    emit(cb, |a| a.jmp(gp64(reg)));
}

pub fn jmp_rm(cb: &mut CodeBuffer, opnd: Opnd) {
    emit(cb, |a| match opnd {
        Opnd::Reg(r) => a.jmp(gp64(r)),
        Opnd::Mem(m) => a.jmp(mem(m)),
        _ => bad_operands("jmp", opnd, Opnd::None),
    });
}

/// `jmp rel32` to an absolute address.
pub fn jmp_ptr(cb: &mut CodeBuffer, target: CodePtr) {
    emit_branch(cb, Code::Jmp_rel32_64, target.as_u64());
}

/// `jcc rel32` to an absolute address.
pub fn jcc_ptr(cb: &mut CodeBuffer, cond: Cond, target: CodePtr) {
    emit_branch(cb, jcc_code(cond), target.as_u64());
}

pub fn jmp_label(cb: &mut CodeBuffer, label: Label) {
    let next = cb.get_write_ptr().as_u64() + JMP_PTR_BYTES as u64;
    emit_branch(cb, Code::Jmp_rel32_64, next);
    cb.label_ref(label, 4);
}

pub fn jcc_label(cb: &mut CodeBuffer, cond: Cond, label: Label) {
    let next = cb.get_write_ptr().as_u64() + JCC_PTR_BYTES as u64;
    emit_branch(cb, jcc_code(cond), next);
    cb.label_ref(label, 4);
}

#[cfg(test)]
mod tests {
    use super::super::memory::SimulatedMemory;
    use super::super::opnd::{imm_opnd, mem_opnd, uimm_opnd};
    use super::*;
    use std::sync::Arc;

    fn new_cb() -> CodeBuffer {
        let sim = Arc::new(SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE));
        CodeBuffer::new(sim, 0x1E, 8).unwrap()
    }

    fn bytes(cb: &CodeBuffer) -> Vec<u8> {
        cb.read_bytes(0, cb.get_write_pos())
    }

    #[test]
    fn test_mov_forms() {
        let mut cb = new_cb();
        mov(&mut cb, RAX.into(), RCX.into());
        assert_eq!(bytes(&cb), vec![0x48, 0x89, 0xC8]);

        let mut cb2 = new_cb();
        mov(&mut cb2, RAX.into(), mem_opnd(64, RBX, -8));
        assert_eq!(bytes(&cb2), vec![0x48, 0x8B, 0x43, 0xF8]);

        let mut cb3 = new_cb();
        mov(&mut cb3, RAX.into(), uimm_opnd(0x1122_3344_5566_7788));
        assert_eq!(cb3.get_write_pos(), 10);
    }

    #[test]
    fn test_ret_and_push() {
        let mut cb = new_cb();
        push(&mut cb, RBP);
        ret(&mut cb);
        assert_eq!(bytes(&cb), vec![0x55, 0xC3]);
    }

    #[test]
    fn test_branch_sizes_are_fixed() {
        let mut cb = new_cb();
        let target = cb.get_ptr(0x40).unwrap();
        jmp_ptr(&mut cb, target);
        assert_eq!(cb.get_write_pos(), JMP_PTR_BYTES);
        jcc_ptr(&mut cb, Cond::Z, target);
        assert_eq!(cb.get_write_pos(), JMP_PTR_BYTES + JCC_PTR_BYTES);

        let b = bytes(&cb);
        assert_eq!(b[0], 0xE9);
        assert_eq!(b[5..7], [0x0F, 0x84]);
        assert_eq!(i32::from_le_bytes([b[1], b[2], b[3], b[4]]), 0x40 - 5);
    }

    #[test]
    fn test_jmp_label() {
        let mut cb = new_cb();
        let done = cb.new_label("done");
        jmp_label(&mut cb, done);
        add(&mut cb, RAX.into(), imm_opnd(1));
        cb.write_label(done);
        cb.link_labels();
        let b = bytes(&cb);
        assert_eq!(b[0], 0xE9);
        assert_eq!(i32::from_le_bytes([b[1], b[2], b[3], b[4]]), 4);
    }

    #[test]
    fn test_alu_and_test() {
        let mut cb = new_cb();
        test(&mut cb, RAX.into(), imm_opnd(1));
        sub(&mut cb, RAX.into(), imm_opnd(1));
        cmp(&mut cb, mem_opnd(32, R12, 24), imm_opnd(0));
        assert!(!cb.has_dropped_bytes());
        assert!(cb.get_write_pos() > 10);
    }

    #[test]
    #[should_panic(expected = "encoding range violation")]
    fn test_imm_out_of_range() {
        let mut cb = new_cb();
        add(&mut cb, RAX.into(), imm_opnd(1 << 40));
    }
}
