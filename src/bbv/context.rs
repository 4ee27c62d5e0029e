// This module implements the abstract context the compiler carries through a block: what it knows
// about the value types of the temporary stack, of self and of the first few locals, where each
// stack slot's value came from (a plain temporary, a copy of self or a copy of a local), how deep
// the stack is, how far the JIT's stack pointer has run ahead of the interpreter's, and how deep
// the current guard chain is. Contexts are small Copy values. Compatibility between the context
// a caller actually has and the context a compiled version was built for is computed by diff,
// which returns a non-negative distance when the version can be reused and Incompatible when it
// cannot; the relation is asymmetric, since a more specific actual type may flow into a more
// general declared type but not the other way around. Learning a type through a mapped slot
// writes the knowledge back to self or to the local the slot aliases.

//! Type and mapping context tracked while compiling a block.

use crate::host::{Value, VALUE_SIZE};

/// Number of temporary stack slots whose types are tracked.
pub const MAX_TEMP_TYPES: usize = 8;

/// Number of locals whose types are tracked.
pub const MAX_LOCAL_TYPES: usize = 8;

/// Inferred type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Type {
    #[default]
    Unknown,
    UnknownImm,
    UnknownHeap,
    Nil,
    True,
    False,
    Fixnum,
    Flonum,
    Array,
    Hash,
    ImmSymbol,
    HeapSymbol,
    String,
}

/// Specialization distance between an actual and a declared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeDiff {
    Compatible(usize),
    Incompatible,
}

impl TypeDiff {
    pub fn is_compatible(self) -> bool {
        matches!(self, TypeDiff::Compatible(_))
    }
}

impl Type {
    /// Type of an immediate value, or UnknownHeap for a heap reference.
    pub fn from_value(val: Value) -> Type {
        if !val.special_const_p() {
            return Type::UnknownHeap;
        }

        if val.fixnum_p() {
            Type::Fixnum
        } else if val.nil_p() {
            Type::Nil
        } else if val == Value::TRUE {
            Type::True
        } else if val == Value::FALSE {
            Type::False
        } else if val.static_sym_p() {
            Type::ImmSymbol
        } else if val.flonum_p() {
            Type::Flonum
        } else {
            Type::UnknownImm
        }
    }

    pub fn is_imm(self) -> bool {
        matches!(
            self,
            Type::UnknownImm
                | Type::Nil
                | Type::True
                | Type::False
                | Type::Fixnum
                | Type::Flonum
                | Type::ImmSymbol
        )
    }

    pub fn is_heap(self) -> bool {
        matches!(
            self,
            Type::UnknownHeap | Type::Array | Type::Hash | Type::HeapSymbol | Type::String
        )
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Type::Unknown | Type::UnknownImm | Type::UnknownHeap)
    }

    /// A concrete type, not one of the unknown categories.
    pub fn is_specific(self) -> bool {
        !self.is_unknown()
    }

    /// Distance from `self` (actual) to `dst` (declared).
    pub fn diff(self, dst: Type) -> TypeDiff {
        if self == dst {
            return TypeDiff::Compatible(0);
        }

        // Any type can flow into an unknown type
        if dst == Type::Unknown {
            return TypeDiff::Compatible(1);
        }

        if self.is_heap() && dst == Type::UnknownHeap {
            return TypeDiff::Compatible(1);
        }

        if self.is_imm() && dst == Type::UnknownImm {
            return TypeDiff::Compatible(1);
        }

        TypeDiff::Incompatible
    }

    /// Replace with a more specific compatible type.
    pub fn upgrade(&mut self, src: Type) {
        assert!(
            src.diff(*self).is_compatible(),
            "cannot upgrade {self:?} to {src:?}"
        );
        *self = src;
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Unknown => "unknown",
            Type::UnknownImm => "unknown imm",
            Type::UnknownHeap => "unknown heap",
            Type::Nil => "nil",
            Type::True => "true",
            Type::False => "false",
            Type::Fixnum => "fixnum",
            Type::Flonum => "flonum",
            Type::Array => "array",
            Type::Hash => "hash",
            Type::ImmSymbol => "symbol",
            Type::HeapSymbol => "heap symbol",
            Type::String => "string",
        }
    }
}

/// Where the value of a temporary stack slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TempMapping {
    #[default]
    MapToStack,
    MapToSelf,
    MapToLocal(u8),
}

/// Operand of a bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnOpnd {
    SelfOpnd,
    /// Stack slot, 0 being the top.
    StackOpnd(u16),
}

/// Compile-time knowledge at a program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    /// Number of values on the temporary stack.
    stack_size: u16,

    /// Offset of the JIT's stack pointer from the interpreter's, in slots.
    sp_offset: i16,

    /// Depth of this block in a guard chain.
    chain_depth: u8,

    local_types: [Type; MAX_LOCAL_TYPES],
    temp_types: [Type; MAX_TEMP_TYPES],
    self_type: Type,
    temp_mapping: [TempMapping; MAX_TEMP_TYPES],
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with `size` unknown values already on the stack.
    pub fn new_with_stack_size(size: i16) -> Self {
        Self {
            stack_size: size as u16,
            sp_offset: size,
            ..Self::default()
        }
    }

    pub fn get_stack_size(&self) -> u16 {
        self.stack_size
    }

    pub fn get_sp_offset(&self) -> i16 {
        self.sp_offset
    }

    pub fn set_sp_offset(&mut self, offset: i16) {
        self.sp_offset = offset;
    }

    pub fn get_chain_depth(&self) -> u8 {
        self.chain_depth
    }

    pub fn reset_chain_depth(&mut self) {
        self.chain_depth = 0;
    }

    pub fn increment_chain_depth(&mut self) {
        self.chain_depth += 1;
    }

    /// Context that keeps only the stack shape and the chain depth, dropping every type and
    /// mapping.
    pub fn generic(&self) -> Self {
        Self {
            stack_size: self.stack_size,
            sp_offset: self.sp_offset,
            chain_depth: self.chain_depth,
            ..Self::default()
        }
    }

    /// Displacement in bytes from the JIT stack pointer of `offset_bytes` past the adjusted
    /// stack pointer.
    pub fn sp_disp(&self, offset_bytes: i32) -> i32 {
        self.sp_offset as i32 * VALUE_SIZE + offset_bytes
    }

    /// Push a value with a known mapping. Returns the displacement of the new stack top.
    pub fn stack_push_mapping(&mut self, (mapping, temp_type): (TempMapping, Type)) -> i32 {
        let stack_size = self.stack_size as usize;

        if stack_size < MAX_TEMP_TYPES {
            self.temp_mapping[stack_size] = mapping;
            self.temp_types[stack_size] = temp_type;

            if let TempMapping::MapToLocal(idx) = mapping {
                assert!((idx as usize) < MAX_LOCAL_TYPES);
            }
        }

        self.stack_size += 1;
        self.sp_offset += 1;

        (self.sp_offset as i32 - 1) * VALUE_SIZE
    }

    pub fn stack_push(&mut self, val_type: Type) -> i32 {
        self.stack_push_mapping((TempMapping::MapToStack, val_type))
    }

    pub fn stack_push_self(&mut self) -> i32 {
        self.stack_push_mapping((TempMapping::MapToSelf, Type::Unknown))
    }

    pub fn stack_push_local(&mut self, local_idx: usize) -> i32 {
        if local_idx >= MAX_LOCAL_TYPES {
            return self.stack_push(Type::Unknown);
        }
        self.stack_push_mapping((TempMapping::MapToLocal(local_idx as u8), Type::Unknown))
    }

    /// Pop `n` values. Returns the displacement of the stack top before the pop.
    pub fn stack_pop(&mut self, n: usize) -> i32 {
        assert!(n <= self.stack_size as usize, "stack underflow");

        let top = (self.sp_offset as i32 - 1) * VALUE_SIZE;

        for i in 0..n {
            let idx = self.stack_size as usize - i - 1;
            if idx < MAX_TEMP_TYPES {
                self.temp_types[idx] = Type::Unknown;
                self.temp_mapping[idx] = TempMapping::MapToStack;
            }
        }

        self.stack_size -= n as u16;
        self.sp_offset -= n as i16;

        top
    }

    /// Displacement of stack slot `idx`, 0 being the top.
    pub fn stack_opnd(&self, idx: i32) -> i32 {
        (self.sp_offset as i32 - 1 - idx) * VALUE_SIZE
    }

    fn stack_idx(&self, idx: u16) -> usize {
        assert!(idx < self.stack_size, "stack operand {idx} out of range");
        (self.stack_size - 1 - idx) as usize
    }

    pub fn get_opnd_type(&self, opnd: InsnOpnd) -> Type {
        match opnd {
            InsnOpnd::SelfOpnd => self.self_type,
            InsnOpnd::StackOpnd(idx) => {
                let stack_idx = self.stack_idx(idx);
                if stack_idx >= MAX_TEMP_TYPES {
                    return Type::Unknown;
                }

                match self.temp_mapping[stack_idx] {
                    TempMapping::MapToSelf => self.self_type,
                    TempMapping::MapToStack => self.temp_types[stack_idx],
                    TempMapping::MapToLocal(local) => self.local_types[local as usize],
                }
            }
        }
    }

    /// Learn a more specific type for an operand, propagating it to self or the aliased local.
    pub fn upgrade_opnd_type(&mut self, opnd: InsnOpnd, opnd_type: Type) {
        match opnd {
            InsnOpnd::SelfOpnd => self.self_type.upgrade(opnd_type),
            InsnOpnd::StackOpnd(idx) => {
                let stack_idx = self.stack_idx(idx);
                if stack_idx >= MAX_TEMP_TYPES {
                    return;
                }

                match self.temp_mapping[stack_idx] {
                    TempMapping::MapToSelf => self.self_type.upgrade(opnd_type),
                    TempMapping::MapToStack => self.temp_types[stack_idx].upgrade(opnd_type),
                    TempMapping::MapToLocal(local) => {
                        self.local_types[local as usize].upgrade(opnd_type)
                    }
                }
            }
        }
    }

    /// Type and origin of an operand, for copying it with `stack_push_mapping`.
    pub fn get_opnd_mapping(&self, opnd: InsnOpnd) -> (TempMapping, Type) {
        let opnd_type = self.get_opnd_type(opnd);

        match opnd {
            InsnOpnd::SelfOpnd => (TempMapping::MapToSelf, opnd_type),
            InsnOpnd::StackOpnd(idx) => {
                let stack_idx = self.stack_idx(idx);
                if stack_idx < MAX_TEMP_TYPES {
                    (self.temp_mapping[stack_idx], opnd_type)
                } else {
                    (TempMapping::MapToStack, opnd_type)
                }
            }
        }
    }

    /// Overwrite the type and mapping of a stack operand.
    pub fn set_opnd_mapping(&mut self, opnd: InsnOpnd, (mapping, opnd_type): (TempMapping, Type)) {
        match opnd {
            InsnOpnd::SelfOpnd => panic!("self always maps to self"),
            InsnOpnd::StackOpnd(idx) => {
                let stack_idx = self.stack_idx(idx);
                if stack_idx >= MAX_TEMP_TYPES {
                    return;
                }
                self.temp_mapping[stack_idx] = mapping;
                self.temp_types[stack_idx] = opnd_type;
            }
        }
    }

    pub fn get_local_type(&self, local_idx: usize) -> Type {
        self.local_types
            .get(local_idx)
            .copied()
            .unwrap_or(Type::Unknown)
    }

    /// Set the type of a local. Stack slots aliasing it keep the old type.
    pub fn set_local_type(&mut self, local_idx: usize, local_type: Type) {
        if local_idx >= MAX_LOCAL_TYPES {
            return;
        }

        self.detach_locals(|idx| idx == local_idx);
        self.local_types[local_idx] = local_type;
    }

    /// Forget every local type, e.g. after a call that can write locals.
    pub fn clear_local_types(&mut self) {
        self.detach_locals(|_| true);
        self.local_types = [Type::Unknown; MAX_LOCAL_TYPES];
    }

    fn detach_locals(&mut self, matches: impl Fn(usize) -> bool) {
        for i in 0..MAX_TEMP_TYPES {
            if let TempMapping::MapToLocal(idx) = self.temp_mapping[i] {
                if matches(idx as usize) {
                    self.temp_types[i] = self.local_types[idx as usize];
                    self.temp_mapping[i] = TempMapping::MapToStack;
                }
            }
        }
    }

    /// Distance from `self` (the context a caller has) to `dst` (the context a version was
    /// compiled for).
    pub fn diff(&self, dst: &Context) -> TypeDiff {
        let src = self;

        // Versions at different depths of a guard chain never stand in for each other
        if dst.chain_depth != src.chain_depth {
            return TypeDiff::Incompatible;
        }

        if dst.stack_size != src.stack_size || dst.sp_offset != src.sp_offset {
            return TypeDiff::Incompatible;
        }

        let mut diff = match src.self_type.diff(dst.self_type) {
            TypeDiff::Compatible(d) => d,
            TypeDiff::Incompatible => return TypeDiff::Incompatible,
        };

        for (t_src, t_dst) in src.local_types.iter().zip(dst.local_types.iter()) {
            match t_src.diff(*t_dst) {
                TypeDiff::Compatible(d) => diff += d,
                TypeDiff::Incompatible => return TypeDiff::Incompatible,
            }
        }

        for i in 0..src.stack_size {
            let (src_mapping, src_type) = src.get_opnd_mapping(InsnOpnd::StackOpnd(i));
            let (dst_mapping, dst_type) = dst.get_opnd_mapping(InsnOpnd::StackOpnd(i));

            if src_mapping != dst_mapping {
                // Forgetting where a temporary came from is always safe
                if dst_mapping == TempMapping::MapToStack {
                    diff += 1;
                } else {
                    return TypeDiff::Incompatible;
                }
            }

            match src_type.diff(dst_type) {
                TypeDiff::Compatible(d) => diff += d,
                TypeDiff::Incompatible => return TypeDiff::Incompatible,
            }
        }

        TypeDiff::Compatible(diff)
    }
}
