//! In-memory bytecode units and frames.
//!
//! [`TestIseq`] implements [`Iseq`] over a flat slot array built from a textual listing (see
//! [`parser`]), and [`TestFrame`] implements [`ExecutionContext`] over a plain value stack. Both
//! stand in for the host interpreter in the driver binary and in tests.

pub mod parser;

use crate::bytecode::Opcode;
use crate::host::{ExecutionContext, Iseq, IseqId, Value};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

pub use parser::{parse_units, ParseError};

/// Program counter of slot 0 of unit 0.
const PC_BASE: u64 = 0x10_0000;

/// Slots in a TestFrame's value stack.
const STACK_SLOTS: usize = 64;

/// A bytecode unit held in memory.
#[derive(Debug)]
pub struct TestIseq {
    id: IseqId,
    name: String,
    local_table_size: u32,
    slots: Vec<u64>,
    inline_caches: Mutex<HashMap<u32, Value>>,
}

impl TestIseq {
    pub fn new(id: IseqId, name: &str, local_table_size: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            local_table_size,
            slots: Vec::new(),
            inline_caches: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a listing holding exactly one unit.
    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let mut units = parse_units(src)?;
        if units.len() != 1 {
            return Err(ParseError::UnitCount(units.len()));
        }
        Ok(units.remove(0))
    }

    /// Append an instruction, returning its index.
    pub fn push_insn(&mut self, opcode: Opcode, operands: &[u64]) -> u32 {
        assert_eq!(operands.len(), opcode.num_operands() as usize);
        let idx = self.slots.len() as u32;
        self.slots.push(opcode as u64);
        self.slots.extend_from_slice(operands);
        idx
    }

    /// Fill or clear the inline cache of the instruction at `idx`.
    pub fn set_inline_cache(&self, idx: u32, value: Option<Value>) {
        let mut caches = self.inline_caches.lock();
        match value {
            Some(value) => caches.insert(idx, value),
            None => caches.remove(&idx),
        };
    }

    /// Instruction indices in order.
    pub fn insn_indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        let mut idx = 0;
        while idx < self.size() {
            indices.push(idx);
            idx += self.opcode_at(idx).len();
        }
        indices
    }
}

impl Iseq for TestIseq {
    fn id(&self) -> IseqId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    fn opcode_at(&self, idx: u32) -> Opcode {
        let raw = self.slots[idx as usize];
        match Opcode::from_u64(raw) {
            Some(opcode) => opcode,
            None => panic!("slot {idx} of {} is not an opcode: {raw:#x}", self.name),
        }
    }

    fn operand(&self, idx: u32, n: usize) -> u64 {
        self.slots[idx as usize + 1 + n]
    }

    fn pc_at(&self, idx: u32) -> u64 {
        PC_BASE + ((self.id.0 as u64) << 16) + idx as u64 * 8
    }

    fn local_table_size(&self) -> u32 {
        self.local_table_size
    }

    fn inline_cache_value(&self, idx: u32) -> Option<Value> {
        self.inline_caches.lock().get(&idx).copied()
    }
}

/// A frame running a unit, with its own value stack.
pub struct TestFrame {
    iseq: Arc<dyn Iseq>,
    pc: u64,
    stack: Vec<Value>,
    sp: usize,
    self_val: Value,
    locals: Vec<Value>,
}

impl TestFrame {
    /// Frame at the first instruction of `iseq` with an empty stack.
    pub fn new(iseq: Arc<dyn Iseq>) -> Self {
        let locals = vec![Value::NIL; iseq.local_table_size() as usize];
        Self {
            pc: iseq.pc_at(0),
            iseq,
            stack: vec![Value::NIL; STACK_SLOTS],
            sp: 0,
            self_val: Value::NIL,
            locals,
        }
    }

    pub fn iseq(&self) -> &Arc<dyn Iseq> {
        &self.iseq
    }

    pub fn push(&mut self, val: Value) {
        assert!(self.sp < STACK_SLOTS, "test frame stack overflow");
        self.stack[self.sp] = val;
        self.sp += 1;
    }

    /// Stack depth in slots.
    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn set_self(&mut self, val: Value) {
        self.self_val = val;
    }

    pub fn set_local(&mut self, local_idx: u32, val: Value) {
        self.locals[local_idx as usize] = val;
    }
}

impl ExecutionContext for TestFrame {
    fn current_pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn adjust_sp(&mut self, delta: i32) {
        let sp = self.sp as i64 + delta as i64;
        assert!(
            (0..=STACK_SLOTS as i64).contains(&sp),
            "stack pointer moved out of the frame: {sp}"
        );
        self.sp = sp as usize;
    }

    fn peek_self(&self) -> Value {
        self.self_val
    }

    fn peek_stack(&self, n: usize) -> Value {
        self.stack[self.sp - 1 - n]
    }

    fn peek_local(&self, local_idx: u32) -> Value {
        self.locals[local_idx as usize]
    }
}
