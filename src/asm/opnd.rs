// This module defines the operand descriptions shared by the instruction encoders. Opnd is a
// tagged sum type with one variant per operand kind: no operand, a register, a signed or
// unsigned immediate, a shifted immediate (AArch64 movz/movk style) and a memory reference. Each
// variant carries only the fields that matter for that kind; memory references record the base
// register, a byte displacement, the access width and the addressing mode (plain offset, pre- or
// post-index) so the AArch64 encoder can express its load/store forms with the same type the
// x86-64 encoder uses. Condition codes for conditional branches live here as well.

//! Operand descriptions for the instruction encoders.

use super::{sig_imm_size, unsig_imm_size};

/// Kind of register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKind {
    /// General purpose register.
    Gp,
    /// The machine stack pointer where it is not a general purpose register (AArch64 SP).
    Stack,
    /// The zero register (AArch64 XZR).
    Zero,
}

/// Machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub kind: RegKind,
    pub reg_no: u8,
    pub num_bits: u8,
}

impl Reg {
    pub const fn gp(reg_no: u8, num_bits: u8) -> Self {
        Self {
            kind: RegKind::Gp,
            reg_no,
            num_bits,
        }
    }

    /// The same register at a different width.
    pub const fn with_bits(self, num_bits: u8) -> Self {
        Self { num_bits, ..self }
    }
}

/// Addressing mode of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `[base + disp]`
    Offset,
    /// `[base + disp]!`, base updated before the access.
    PreIndex,
    /// `[base], disp`, base updated after the access.
    PostIndex,
}

/// Memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
    pub num_bits: u8,
    pub addressing: Addressing,
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opnd {
    None,
    Reg(Reg),
    Imm(i64),
    UImm(u64),
    ImmShift { imm: u16, shift: u8 },
    Mem(Mem),
}

impl Opnd {
    /// Size in bits of the operand, or of the smallest encoding of an immediate.
    pub fn num_bits(&self) -> u8 {
        match self {
            Opnd::None => 0,
            Opnd::Reg(reg) => reg.num_bits,
            Opnd::Imm(imm) => sig_imm_size(*imm),
            Opnd::UImm(imm) => unsig_imm_size(*imm),
            Opnd::ImmShift { .. } => 16,
            Opnd::Mem(mem) => mem.num_bits,
        }
    }

    pub fn unwrap_reg(&self) -> Reg {
        match self {
            Opnd::Reg(reg) => *reg,
            other => panic!("expected register operand, got {other:?}"),
        }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Opnd::Mem(_))
    }
}

impl From<Reg> for Opnd {
    fn from(reg: Reg) -> Self {
        Opnd::Reg(reg)
    }
}

pub fn imm_opnd(value: i64) -> Opnd {
    Opnd::Imm(value)
}

pub fn uimm_opnd(value: u64) -> Opnd {
    Opnd::UImm(value)
}

/// `[base + disp]` of `num_bits` width.
pub fn mem_opnd(num_bits: u8, base: Reg, disp: i32) -> Opnd {
    Opnd::Mem(Mem {
        base,
        disp,
        num_bits,
        addressing: Addressing::Offset,
    })
}

pub fn mem_pre_opnd(num_bits: u8, base: Reg, disp: i32) -> Opnd {
    Opnd::Mem(Mem {
        base,
        disp,
        num_bits,
        addressing: Addressing::PreIndex,
    })
}

pub fn mem_post_opnd(num_bits: u8, base: Reg, disp: i32) -> Opnd {
    Opnd::Mem(Mem {
        base,
        disp,
        num_bits,
        addressing: Addressing::PostIndex,
    })
}

/// Branch condition, evaluated on the flags of the last compare or test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Z,
    NZ,
    BE,
    A,
    L,
    GE,
    LE,
    G,
    O,
    NO,
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::Z => Cond::NZ,
            Cond::NZ => Cond::Z,
            Cond::BE => Cond::A,
            Cond::A => Cond::BE,
            Cond::L => Cond::GE,
            Cond::GE => Cond::L,
            Cond::LE => Cond::G,
            Cond::G => Cond::LE,
            Cond::O => Cond::NO,
            Cond::NO => Cond::O,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_sizes() {
        assert_eq!(imm_opnd(-1).num_bits(), 8);
        assert_eq!(imm_opnd(1 << 20).num_bits(), 32);
        assert_eq!(uimm_opnd(u64::MAX).num_bits(), 64);
        let base = Reg::gp(3, 64);
        assert_eq!(mem_opnd(32, base, 8).num_bits(), 32);
        assert!(mem_opnd(64, base, -8).is_mem());
        assert_eq!(Opnd::from(base).unwrap_reg(), base);
    }

    #[test]
    fn test_cond_invert_is_involution() {
        for cond in [Cond::Z, Cond::BE, Cond::L, Cond::LE, Cond::O] {
            assert_ne!(cond.invert(), cond);
            assert_eq!(cond.invert().invert(), cond);
        }
    }
}
