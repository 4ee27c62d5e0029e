//! Opcode table of the interpreter bytecode.
//!
//! Each instruction occupies one slot for the opcode plus one slot per operand, so the length
//! of an instruction is how far the instruction index advances past it.

/// Interpreter opcodes known to the JIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop,
    Pop,
    Dup,
    Swap,
    Putnil,
    Putself,
    Putobject,
    PutobjectInt2Fix0,
    PutobjectInt2Fix1,
    Getlocal,
    Setlocal,
    Jump,
    Branchif,
    Branchunless,
    Branchnil,
    OptNilP,
    OptPlus,
    OptGetinlinecache,
    Invokebuiltin,
    Leave,
    OptSendWithoutBlock,
    Throw,
}

const ALL_OPCODES: [Opcode; 22] = [
    Opcode::Nop,
    Opcode::Pop,
    Opcode::Dup,
    Opcode::Swap,
    Opcode::Putnil,
    Opcode::Putself,
    Opcode::Putobject,
    Opcode::PutobjectInt2Fix0,
    Opcode::PutobjectInt2Fix1,
    Opcode::Getlocal,
    Opcode::Setlocal,
    Opcode::Jump,
    Opcode::Branchif,
    Opcode::Branchunless,
    Opcode::Branchnil,
    Opcode::OptNilP,
    Opcode::OptPlus,
    Opcode::OptGetinlinecache,
    Opcode::Invokebuiltin,
    Opcode::Leave,
    Opcode::OptSendWithoutBlock,
    Opcode::Throw,
];

impl Opcode {
    /// Number of operand slots.
    pub fn num_operands(self) -> u32 {
        match self {
            Opcode::Putobject
            | Opcode::Getlocal
            | Opcode::Setlocal
            | Opcode::Jump
            | Opcode::Branchif
            | Opcode::Branchunless
            | Opcode::Branchnil
            | Opcode::OptNilP
            | Opcode::OptPlus
            | Opcode::OptSendWithoutBlock
            | Opcode::Throw => 1,
            Opcode::OptGetinlinecache | Opcode::Invokebuiltin => 2,
            _ => 0,
        }
    }

    /// Encoded length in slots.
    pub fn len(self) -> u32 {
        1 + self.num_operands()
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::Putnil => "putnil",
            Opcode::Putself => "putself",
            Opcode::Putobject => "putobject",
            Opcode::PutobjectInt2Fix0 => "putobject_INT2FIX_0_",
            Opcode::PutobjectInt2Fix1 => "putobject_INT2FIX_1_",
            Opcode::Getlocal => "getlocal",
            Opcode::Setlocal => "setlocal",
            Opcode::Jump => "jump",
            Opcode::Branchif => "branchif",
            Opcode::Branchunless => "branchunless",
            Opcode::Branchnil => "branchnil",
            Opcode::OptNilP => "opt_nil_p",
            Opcode::OptPlus => "opt_plus",
            Opcode::OptGetinlinecache => "opt_getinlinecache",
            Opcode::Invokebuiltin => "invokebuiltin",
            Opcode::Leave => "leave",
            Opcode::OptSendWithoutBlock => "opt_send_without_block",
            Opcode::Throw => "throw",
        }
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        ALL_OPCODES.iter().copied().find(|op| op.name() == name)
    }

    pub fn from_u64(raw: u64) -> Option<Opcode> {
        ALL_OPCODES.get(raw as usize).copied()
    }

    /// Instructions whose specialization relies on being first in their block.
    pub fn must_start_block(self) -> bool {
        matches!(self, Opcode::OptGetinlinecache)
    }

    /// Instructions with a relative jump offset as their first operand.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Branchif | Opcode::Branchunless | Opcode::Branchnil
        )
    }

    pub fn all() -> &'static [Opcode] {
        &ALL_OPCODES
    }
}
