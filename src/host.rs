// This module defines the boundary between the JIT and the interpreter that embeds it. The JIT
// never owns bytecode or frames; it consumes them through a small set of traits. Iseq is a
// compiled bytecode unit: it answers which opcode sits at an instruction index, what its raw
// operands are, and which interpreter program counter value corresponds to that index.
// ExecutionContext is a live frame seen from the compiler: its current program counter, the
// values on its stack, self and its locals, and a way to move its stack pointer and program
// counter when a branch stub hands control back to compiled code. ExecutionBarrier parks every
// other execution context before code is rewritten. Value models the interpreter's tagged word
// (fixnums, flonums, static symbols and the special constants), and the repr(C) frame structures
// fix the memory layout generated code reads and writes, with their field offsets exported as
// constants for the code generators. RawFrame adapts a raw execution context pointer handed to
// the branch stub trampoline into an ExecutionContext.

//! Interfaces consumed from the host interpreter.

use crate::bbv::context::Type;
use crate::bytecode::Opcode;
use std::fmt;
use std::mem::offset_of;

/// Tagged interpreter value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(pub u64);

impl Value {
    pub const FALSE: Value = Value(0x00);
    pub const NIL: Value = Value(0x08);
    pub const TRUE: Value = Value(0x14);
    pub const UNDEF: Value = Value(0x34);

    pub const FIXNUM_FLAG: u64 = 0x01;
    pub const FLONUM_MASK: u64 = 0x03;
    pub const FLONUM_FLAG: u64 = 0x02;
    pub const IMMEDIATE_MASK: u64 = 0x07;
    pub const STATIC_SYM_FLAG: u64 = 0x0c;

    /// Encode a small integer.
    pub fn fixnum(n: i64) -> Value {
        Value(((n << 1) | 1) as u64)
    }

    pub fn as_fixnum(self) -> Option<i64> {
        self.fixnum_p().then_some((self.0 as i64) >> 1)
    }

    pub fn fixnum_p(self) -> bool {
        self.0 & Self::FIXNUM_FLAG != 0
    }

    pub fn flonum_p(self) -> bool {
        self.0 & Self::FLONUM_MASK == Self::FLONUM_FLAG
    }

    pub fn static_sym_p(self) -> bool {
        self.0 & 0xff == Self::STATIC_SYM_FLAG
    }

    pub fn nil_p(self) -> bool {
        self == Self::NIL
    }

    /// False for `nil` and `false`.
    pub fn truthy(self) -> bool {
        self.0 & !Self::NIL.0 != 0
    }

    pub fn immediate_p(self) -> bool {
        self.0 & Self::IMMEDIATE_MASK != 0
    }

    /// Immediates and the falsy constants; anything else is a heap reference.
    pub fn special_const_p(self) -> bool {
        self.immediate_p() || !self.truthy()
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::NIL => write!(f, "nil"),
            Value::TRUE => write!(f, "true"),
            Value::FALSE => write!(f, "false"),
            Value::UNDEF => write!(f, "undef"),
            v if v.fixnum_p() => write!(f, "{}", (v.0 as i64) >> 1),
            v => write!(f, "Value({:#x})", v.0),
        }
    }
}

/// Identity of a bytecode unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct IseqId(pub u32);

impl fmt::Display for IseqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A compiled bytecode unit.
pub trait Iseq: Send + Sync {
    fn id(&self) -> IseqId;

    fn name(&self) -> &str;

    /// Encoded length in slots. Instruction indices range over `0..size()`.
    fn size(&self) -> u32;

    fn opcode_at(&self, idx: u32) -> Opcode;

    /// Raw operand `n` of the instruction at `idx`.
    fn operand(&self, idx: u32, n: usize) -> u64;

    /// Interpreter program counter of the instruction at `idx`.
    fn pc_at(&self, idx: u32) -> u64;

    fn local_table_size(&self) -> u32;

    /// Value cached by the inline cache of the instruction at `idx`, if it is filled.
    fn inline_cache_value(&self, _idx: u32) -> Option<Value> {
        None
    }
}

/// A live interpreter frame as seen by the compiler.
pub trait ExecutionContext {
    fn current_pc(&self) -> u64;

    fn set_pc(&mut self, pc: u64);

    /// Move the frame's stack pointer by `delta` slots.
    fn adjust_sp(&mut self, delta: i32);

    fn peek_self(&self) -> Value;

    /// Value `n` slots below the top of the stack.
    fn peek_stack(&self, n: usize) -> Value;

    fn peek_local(&self, local_idx: u32) -> Value;

    /// Classify a runtime value.
    fn type_of(&self, val: Value) -> Type {
        Type::from_value(val)
    }
}

/// Global execution barrier.
///
/// A sweep calls `barrier` before it takes the JIT lock and `release` after it has dropped the
/// lock, on every path. Other execution contexts may stay parked in between.
pub trait ExecutionBarrier: Send + Sync {
    /// Return once every other execution context is parked outside generated code writers.
    fn barrier(&self);

    /// Let the contexts parked by `barrier` run again.
    fn release(&self) {}
}

/// Barrier for single threaded hosts.
pub struct NoBarrier;

impl ExecutionBarrier for NoBarrier {
    fn barrier(&self) {}
}

/// Interpreter control frame.
#[repr(C)]
#[derive(Debug)]
pub struct ControlFrame {
    pub pc: u64,
    pub sp: *mut Value,
    pub iseq: u64,
    pub self_val: Value,
    pub ep: *const Value,
    pub block_code: u64,
    pub jit_return: u64,
}

/// Interpreter execution context.
#[repr(C)]
#[derive(Debug)]
pub struct RawExecutionContext {
    pub vm_stack: *mut Value,
    pub vm_stack_size: u64,
    pub cfp: *mut ControlFrame,
    pub interrupt_flag: u32,
    pub interrupt_mask: u32,
}

pub const VALUE_SIZE: i32 = 8;
pub const CONTROL_FRAME_SIZE: i32 = std::mem::size_of::<ControlFrame>() as i32;

pub const CFP_PC: i32 = offset_of!(ControlFrame, pc) as i32;
pub const CFP_SP: i32 = offset_of!(ControlFrame, sp) as i32;
pub const CFP_SELF: i32 = offset_of!(ControlFrame, self_val) as i32;
pub const CFP_EP: i32 = offset_of!(ControlFrame, ep) as i32;
pub const CFP_JIT_RETURN: i32 = offset_of!(ControlFrame, jit_return) as i32;

pub const EC_CFP: i32 = offset_of!(RawExecutionContext, cfp) as i32;
pub const EC_INTERRUPT_FLAG: i32 = offset_of!(RawExecutionContext, interrupt_flag) as i32;

/// Slots between the environment pointer and the first local.
pub const ENV_DATA_SIZE: u32 = 3;

/// Environment flag requiring a write barrier before a local is stored.
pub const ENV_FLAG_WB_REQUIRED: u64 = 0x80;

/// Offset from the environment pointer of local `local_idx`, in slots.
pub fn local_ep_offset(local_table_size: u32, local_idx: u32) -> i32 {
    -((ENV_DATA_SIZE + local_table_size - 1 - local_idx) as i32)
}

/// ExecutionContext over a raw execution context.
pub struct RawFrame {
    ec: *mut RawExecutionContext,
    local_table_size: u32,
}

impl RawFrame {
    /// # Safety
    ///
    /// `ec` must point to a live execution context whose current control frame runs a unit
    /// with `local_table_size` locals, and both must stay valid while the frame is used.
    pub unsafe fn new(ec: *mut RawExecutionContext, local_table_size: u32) -> Self {
        Self {
            ec,
            local_table_size,
        }
    }

    fn cfp(&self) -> *mut ControlFrame {
        unsafe { (*self.ec).cfp }
    }
}

impl ExecutionContext for RawFrame {
    fn current_pc(&self) -> u64 {
        unsafe { (*self.cfp()).pc }
    }

    fn set_pc(&mut self, pc: u64) {
        unsafe { (*self.cfp()).pc = pc }
    }

    fn adjust_sp(&mut self, delta: i32) {
        unsafe {
            let cfp = self.cfp();
            (*cfp).sp = (*cfp).sp.offset(delta as isize);
        }
    }

    fn peek_self(&self) -> Value {
        unsafe { (*self.cfp()).self_val }
    }

    fn peek_stack(&self, n: usize) -> Value {
        unsafe { *(*self.cfp()).sp.sub(1 + n) }
    }

    fn peek_local(&self, local_idx: u32) -> Value {
        let offset = local_ep_offset(self.local_table_size, local_idx);
        unsafe { *(*self.cfp()).ep.offset(offset as isize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_tags() {
        assert_eq!(Value::fixnum(21).as_fixnum(), Some(21));
        assert_eq!(Value::fixnum(-3).as_fixnum(), Some(-3));
        assert!(Value::fixnum(0).special_const_p());
        assert!(!Value::NIL.truthy());
        assert!(!Value::FALSE.truthy());
        assert!(Value::TRUE.truthy());
        assert!(Value::NIL.special_const_p());
        assert!(!Value(0x7f00_1230).special_const_p());
        assert!(Value(0x0c0c).static_sym_p());
        assert!(Value(0x1002).flonum_p());
        assert_eq!(format!("{:?}", Value::fixnum(5)), "5");
    }

    #[test]
    fn test_frame_layout() {
        assert_eq!(CONTROL_FRAME_SIZE, 56);
        assert_eq!(CFP_SP, 8);
        assert_eq!(CFP_SELF, 24);
        assert_eq!(EC_CFP, 16);
        assert_eq!(EC_INTERRUPT_FLAG, 24);
        assert_eq!(local_ep_offset(2, 0), -4);
        assert_eq!(local_ep_offset(2, 1), -3);
    }

    #[test]
    fn test_raw_frame_access() {
        let mut stack = [Value::fixnum(1), Value::fixnum(2), Value::NIL, Value::NIL];
        let env = [Value::fixnum(7), Value::fixnum(8), Value::NIL, Value::NIL, Value(0)];
        let mut cfp = ControlFrame {
            pc: 0x100,
            sp: unsafe { stack.as_mut_ptr().add(2) },
            iseq: 0,
            self_val: Value::TRUE,
            ep: unsafe { env.as_ptr().add(4) },
            block_code: 0,
            jit_return: 0,
        };
        let mut ec = RawExecutionContext {
            vm_stack: stack.as_mut_ptr(),
            vm_stack_size: 4,
            cfp: &mut cfp,
            interrupt_flag: 0,
            interrupt_mask: 0,
        };

        let mut frame = unsafe { RawFrame::new(&mut ec, 2) };
        assert_eq!(frame.peek_stack(0), Value::fixnum(2));
        assert_eq!(frame.peek_stack(1), Value::fixnum(1));
        assert_eq!(frame.peek_self(), Value::TRUE);
        assert_eq!(frame.peek_local(0), Value::fixnum(7));
        assert_eq!(frame.peek_local(1), Value::fixnum(8));

        frame.adjust_sp(1);
        frame.set_pc(0x200);
        assert_eq!(frame.current_pc(), 0x200);
        assert_eq!(frame.peek_stack(0), Value::NIL);
    }
}
