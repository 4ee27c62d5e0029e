// This module hand-encodes the subset of the A64 instruction set the AArch64 backend needs. Every
// A64 instruction is one little-endian 32-bit word, so each encoder assembles the word from its
// fixed opcode bits and operand fields and writes it with CodeBuffer::write_int. Loads and stores
// support the scaled unsigned offset form, the unscaled signed form for small negative offsets,
// and the pre- and post-index forms used to push and pop the machine stack. Direct branches carry
// a 26-bit (B, BL) or 19-bit (B.cond) word displacement, which limits how far apart code can be;
// the JIT caps its executable region so that every in-region branch is in range. Operands that do
// not fit their field are code generator bugs and abort.

//! Hand-written A64 instruction encoding.

use super::opnd::{Addressing, Cond, Mem, Opnd, Reg, RegKind};
use super::{CodeBuffer, CodePtr};

pub const X0: Reg = Reg::gp(0, 64);
pub const X1: Reg = Reg::gp(1, 64);
pub const X2: Reg = Reg::gp(2, 64);
pub const X3: Reg = Reg::gp(3, 64);
pub const X16: Reg = Reg::gp(16, 64);
pub const X17: Reg = Reg::gp(17, 64);
pub const X19: Reg = Reg::gp(19, 64);
pub const X20: Reg = Reg::gp(20, 64);
pub const X21: Reg = Reg::gp(21, 64);
pub const X29: Reg = Reg::gp(29, 64);
pub const X30: Reg = Reg::gp(30, 64);

pub const XZR: Reg = Reg {
    kind: RegKind::Zero,
    reg_no: 31,
    num_bits: 64,
};

pub const SP: Reg = Reg {
    kind: RegKind::Stack,
    reg_no: 31,
    num_bits: 64,
};

/// Integer argument registers of the AAPCS64 calling convention.
pub const C_ARG_REGS: [Reg; 4] = [X0, X1, X2, X3];

/// Reach of B and BL in either direction.
pub const BRANCH_RANGE: usize = 128 * 1024 * 1024;

fn emit(cb: &mut CodeBuffer, insn: u32) {
    cb.write_int(insn as u64, 32);
}

fn rd(reg: Reg) -> u32 {
    reg.reg_no as u32 & 0x1F
}

fn cond_code(cond: Cond) -> u32 {
    match cond {
        Cond::Z => 0x0,
        Cond::NZ => 0x1,
        Cond::O => 0x6,
        Cond::NO => 0x7,
        Cond::A => 0x8,
        Cond::BE => 0x9,
        Cond::GE => 0xA,
        Cond::L => 0xB,
        Cond::G => 0xC,
        Cond::LE => 0xD,
    }
}

/// Word displacement from the current position to `target`, checked against `bits`.
fn branch_offset(cb: &CodeBuffer, target: CodePtr, bits: u32) -> u32 {
    let from = cb.get_write_ptr().raw() as i64;
    let delta = target.raw() as i64 - from;
    let words = delta / 4;
    let limit = 1i64 << (bits - 1);
    if delta % 4 != 0 || words < -limit || words >= limit {
        panic!("encoding range violation: branch from {from:#x} to {target:?}");
    }
    (words as u32) & ((1u32 << bits) - 1)
}

fn load_store(cb: &mut CodeBuffer, rt: Reg, m: Mem, scaled: u32, unscaled: u32, pre: u32, post: u32) {
    // Bit 30 selects the 64-bit form of every load/store we emit
    let (size_bit, scale) = match m.num_bits {
        64 => (0, 8),
        32 => (1 << 30, 4),
        n => panic!("encoding range violation: {n}-bit load/store"),
    };
    let (scaled, unscaled, pre, post) = (scaled ^ size_bit, unscaled ^ size_bit, pre ^ size_bit, post ^ size_bit);
    let base = rd(m.base) << 5;
    let disp = m.disp as i64;

    let insn = match m.addressing {
        Addressing::Offset if disp >= 0 && disp % scale == 0 && disp / scale < 4096 => {
            scaled | ((disp / scale) as u32) << 10 | base | rd(rt)
        }
        Addressing::Offset if (-256..256).contains(&disp) => {
            unscaled | (((disp as u32) & 0x1FF) << 12) | base | rd(rt)
        }
        Addressing::PreIndex if (-256..256).contains(&disp) => {
            pre | (((disp as u32) & 0x1FF) << 12) | base | rd(rt)
        }
        Addressing::PostIndex if (-256..256).contains(&disp) => {
            post | (((disp as u32) & 0x1FF) << 12) | base | rd(rt)
        }
        _ => panic!("encoding range violation: displacement {disp} for {:?}", m.addressing),
    };
    emit(cb, insn);
}

/// `ldr xt, [mem]`
pub fn ldr(cb: &mut CodeBuffer, rt: Reg, src: Opnd) {
    match src {
        Opnd::Mem(m) => load_store(cb, rt, m, 0xF940_0000, 0xF840_0000, 0xF840_0C00, 0xF840_0400),
        other => panic!("encoding range violation: ldr from {other:?}"),
    }
}

/// `str xt, [mem]`
pub fn str(cb: &mut CodeBuffer, rt: Reg, dst: Opnd) {
    match dst {
        Opnd::Mem(m) => load_store(cb, rt, m, 0xF900_0000, 0xF800_0000, 0xF800_0C00, 0xF800_0400),
        other => panic!("encoding range violation: str to {other:?}"),
    }
}

pub fn movz(cb: &mut CodeBuffer, rd_reg: Reg, imm16: u16, shift: u8) {
    let hw = (shift / 16) as u32;
    emit(cb, 0xD280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd(rd_reg));
}

pub fn movk(cb: &mut CodeBuffer, rd_reg: Reg, imm16: u16, shift: u8) {
    let hw = (shift / 16) as u32;
    emit(cb, 0xF280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd(rd_reg));
}

/// Materialize a 64-bit constant with one movz and up to three movk.
pub fn mov_u64(cb: &mut CodeBuffer, rd_reg: Reg, value: u64) {
    movz(cb, rd_reg, value as u16, 0);
    for shift in [16u8, 32, 48] {
        let chunk = (value >> shift) as u16;
        if chunk != 0 {
            movk(cb, rd_reg, chunk, shift);
        }
    }
}

/// `mov rd, src` for a register or a constant.
pub fn mov(cb: &mut CodeBuffer, rd_reg: Reg, src: Opnd) {
    match src {
        Opnd::Reg(rm) if rm.kind == RegKind::Stack || rd_reg.kind == RegKind::Stack => {
            emit(cb, 0x9100_0000 | (rd(rm) << 5) | rd(rd_reg));
        }
        Opnd::Reg(rm) => emit(cb, 0xAA00_03E0 | (rd(rm) << 16) | rd(rd_reg)),
        Opnd::Imm(imm) => mov_u64(cb, rd_reg, imm as u64),
        Opnd::UImm(imm) => mov_u64(cb, rd_reg, imm),
        Opnd::ImmShift { imm, shift } => movz(cb, rd_reg, imm, shift),
        other => panic!("encoding range violation: mov from {other:?}"),
    }
}

fn add_sub(cb: &mut CodeBuffer, is_sub: bool, rd_reg: Reg, rn: Reg, src: Opnd) {
    match src {
        Opnd::Imm(imm) if imm < 0 => add_sub(cb, !is_sub, rd_reg, rn, Opnd::UImm(imm.unsigned_abs())),
        Opnd::Imm(imm) => add_sub(cb, is_sub, rd_reg, rn, Opnd::UImm(imm as u64)),
        Opnd::UImm(imm) if imm < 4096 => {
            let op = if is_sub { 0xD100_0000 } else { 0x9100_0000 };
            emit(cb, op | ((imm as u32) << 10) | (rd(rn) << 5) | rd(rd_reg));
        }
        Opnd::Reg(rm) => {
            let op = if is_sub { 0xCB00_0000 } else { 0x8B00_0000 };
            emit(cb, op | (rd(rm) << 16) | (rd(rn) << 5) | rd(rd_reg));
        }
        other => panic!("encoding range violation: add/sub with {other:?}"),
    }
}

pub fn add(cb: &mut CodeBuffer, rd_reg: Reg, rn: Reg, src: Opnd) {
    add_sub(cb, false, rd_reg, rn, src);
}

pub fn sub(cb: &mut CodeBuffer, rd_reg: Reg, rn: Reg, src: Opnd) {
    add_sub(cb, true, rd_reg, rn, src);
}

/// `cmp rn, src`, 32-bit when `rn` is a W register.
pub fn cmp(cb: &mut CodeBuffer, rn: Reg, src: Opnd) {
    let sf = if rn.num_bits == 32 { 0x8000_0000 } else { 0 };
    match src {
        Opnd::Imm(imm) if (0..4096).contains(&imm) => {
            emit(cb, (0xF100_0000 ^ sf) | ((imm as u32) << 10) | (rd(rn) << 5) | 31);
        }
        Opnd::UImm(imm) if imm < 4096 => {
            emit(cb, (0xF100_0000 ^ sf) | ((imm as u32) << 10) | (rd(rn) << 5) | 31);
        }
        Opnd::Reg(rm) => emit(cb, (0xEB00_0000 ^ sf) | (rd(rm) << 16) | (rd(rn) << 5) | 31),
        other => panic!("encoding range violation: cmp with {other:?}"),
    }
}

/// `b target`
pub fn b(cb: &mut CodeBuffer, target: CodePtr) {
    let imm26 = branch_offset(cb, target, 26);
    emit(cb, 0x1400_0000 | imm26);
}

/// `bl target`
pub fn bl(cb: &mut CodeBuffer, target: CodePtr) {
    let imm26 = branch_offset(cb, target, 26);
    emit(cb, 0x9400_0000 | imm26);
}

/// `b.cond target`
pub fn bcond(cb: &mut CodeBuffer, cond: Cond, target: CodePtr) {
    let imm19 = branch_offset(cb, target, 19);
    emit(cb, 0x5400_0000 | (imm19 << 5) | cond_code(cond));
}

pub fn br(cb: &mut CodeBuffer, rn: Reg) {
    emit(cb, 0xD61F_0000 | (rd(rn) << 5));
}

pub fn blr(cb: &mut CodeBuffer, rn: Reg) {
    emit(cb, 0xD63F_0000 | (rd(rn) << 5));
}

/// `ret` through x30.
pub fn ret(cb: &mut CodeBuffer) {
    emit(cb, 0xD65F_03C0);
}

pub fn brk(cb: &mut CodeBuffer, imm16: u16) {
    emit(cb, 0xD420_0000 | ((imm16 as u32) << 5));
}

pub fn nop(cb: &mut CodeBuffer) {
    emit(cb, 0xD503_201F);
}

#[cfg(test)]
mod tests {
    use super::super::memory::SimulatedMemory;
    use super::super::opnd::{mem_opnd, mem_post_opnd, mem_pre_opnd};
    use super::*;
    use std::sync::Arc;

    fn new_cb() -> CodeBuffer {
        let sim = Arc::new(SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE));
        CodeBuffer::new(sim, 0x00, 8).unwrap()
    }

    fn words(cb: &CodeBuffer) -> Vec<u32> {
        cb.read_bytes(0, cb.get_write_pos())
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_load_store_forms() {
        let mut cb = new_cb();
        ldr(&mut cb, X0, mem_opnd(64, X19, 8));
        str(&mut cb, X1, mem_opnd(64, X21, -8));
        str(&mut cb, X30, mem_pre_opnd(64, SP, -16));
        ldr(&mut cb, X30, mem_post_opnd(64, SP, 16));
        assert_eq!(
            words(&cb),
            vec![0xF940_0660, 0xF81F_82A1, 0xF81F_0FFE, 0xF841_07FE]
        );
    }

    #[test]
    fn test_mov_and_arith() {
        let mut cb = new_cb();
        mov(&mut cb, X0, Opnd::Reg(X1));
        add(&mut cb, X21, X21, Opnd::Imm(8));
        sub(&mut cb, X21, X21, Opnd::Imm(-8));
        cmp(&mut cb, X0, Opnd::Imm(8));
        ret(&mut cb);
        assert_eq!(
            words(&cb),
            vec![0xAA01_03E0, 0x9100_22B5, 0x9100_22B5, 0xF100_201F, 0xD65F_03C0]
        );
    }

    #[test]
    fn test_mov_u64_skips_zero_chunks() {
        let mut cb = new_cb();
        mov_u64(&mut cb, X0, 0x0001_0000_0000_0008);
        assert_eq!(words(&cb), vec![0xD280_0100, 0xF2E0_0020]);
    }

    #[test]
    fn test_branches() {
        let mut cb = new_cb();
        let target = cb.get_ptr(16).unwrap();
        b(&mut cb, target);
        bcond(&mut cb, Cond::NZ, target);
        let back = cb.get_ptr(0).unwrap();
        b(&mut cb, back);
        assert_eq!(words(&cb), vec![0x1400_0004, 0x5400_0061, 0x17FF_FFFE]);
    }

    #[test]
    fn test_w_register_forms() {
        let mut cb = new_cb();
        ldr(&mut cb, X0.with_bits(32), mem_opnd(32, X20, 24));
        cmp(&mut cb, X0.with_bits(32), Opnd::Imm(0));
        assert_eq!(words(&cb), vec![0xB940_1A80, 0x7100_001F]);
    }

    #[test]
    #[should_panic(expected = "encoding range violation")]
    fn test_ldr_offset_out_of_range() {
        let mut cb = new_cb();
        ldr(&mut cb, X0, mem_opnd(64, X19, 1 << 16));
    }
}
