// This module is the block versioning engine proper. JitCore owns everything the engine mutates:
// the inline and outlined code buffers, the block graph, the version tables, the invalidation
// state, statistics, the backend for the target instruction set and the registry of opcode
// generators. It is always used under the runtime-wide JIT lock held by crate::jit::Jit.
//
// gen_single_block compiles one block version: starting from a possibly widened context it walks
// the bytecode, hands each instruction to its registered generator through a JitState, and stops
// when a generator ends the block, cannot compile its instruction (the block is sealed with an
// exit, which doubles as the entry exit when it is the first instruction) or when an instruction
// that must start its own block is reached. Boundaries after host calls get an outlined exit and
// a patch record so invalidation can reroute them later. A block for which either buffer dropped
// bytes is discarded. gen_block_series then follows fall-through requests left by direct jumps to
// targets that have no version yet, placing each successor right after its predecessor until the
// batch limit, and discards the whole batch if any member fails.

//! Block compilation, generator registry and per-instruction compile state.

pub mod arm64;
pub mod backend;
pub mod branch;
pub mod x86_64;

use crate::asm::memory::ExecMemory;
use crate::asm::{CodeBuffer, CodePtr};
use crate::bbv::{BlockId, BlockRef, Context, Graph, InsnOpnd, InvalidationState, TempMapping, VersionTable};
use crate::bytecode::Opcode;
use crate::core::error::{JitError, JitResult};
use crate::core::options::{JitOptions, TargetArch};
use crate::core::stats::{Counter, JitStats, RuntimeCounters};
use crate::host::{ExecutionContext, Iseq, Value};
use backend::{Backend, StubHitTarget};
use hashbrown::HashMap;
use std::sync::Arc;

/// Outcome of generating code for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenStatus {
    /// Continue with the next instruction in the same block.
    KeepCompiling,
    /// The instruction ended the block.
    EndBlock,
    /// The instruction is not supported here; exit to the interpreter.
    CantCompile,
}

/// Code generator for one opcode.
pub trait InsnCodegen: Send + Sync {
    fn gen(&self, jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus;
}

impl<F> InsnCodegen for F
where
    F: for<'a> Fn(&mut JitState<'a>, &mut Context) -> CodegenStatus + Send + Sync,
{
    fn gen(&self, jit: &mut JitState<'_>, ctx: &mut Context) -> CodegenStatus {
        self(jit, ctx)
    }
}

/// Opcode to generator table, filled once by the backend.
#[derive(Default)]
pub struct CodegenRegistry {
    gen_fns: HashMap<Opcode, Arc<dyn InsnCodegen>>,
}

impl CodegenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, opcode: Opcode, gen: impl InsnCodegen + 'static) {
        let previous = self.gen_fns.insert(opcode, Arc::new(gen));
        assert!(
            previous.is_none(),
            "generator for {} registered twice",
            opcode.name()
        );
    }

    pub fn get(&self, opcode: Opcode) -> Option<Arc<dyn InsnCodegen>> {
        self.gen_fns.get(&opcode).cloned()
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.gen_fns.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.gen_fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gen_fns.is_empty()
    }
}

/// Backend for `arch`.
pub fn backend_for(arch: TargetArch) -> Arc<dyn Backend> {
    match arch {
        TargetArch::X86_64 => Arc::new(x86_64::X86Backend),
        TargetArch::Arm64 => Arc::new(arm64::Arm64Backend),
    }
}

/// All state mutated by code generation.
pub struct JitCore {
    pub(crate) cb: CodeBuffer,
    pub(crate) ocb: CodeBuffer,
    pub(crate) graph: Graph,
    pub(crate) versions: VersionTable,
    pub(crate) invalidation: InvalidationState,
    pub(crate) options: JitOptions,
    pub(crate) stats: JitStats,
    pub(crate) counters: Arc<RuntimeCounters>,
    pub(crate) backend: Arc<dyn Backend>,
    registry: Arc<CodegenRegistry>,

    /// Landing code for returns out of the outermost JIT frame.
    pub(crate) leave_exit: CodePtr,

    /// Landing code for stubs whose target could not be compiled.
    pub(crate) exit_from_stub: CodePtr,

    pub(crate) stub_hit: StubHitTarget,
    pub(crate) tracing_active: bool,
}

impl JitCore {
    /// Split `mem` into the two code buffers and generate the shared exits.
    pub fn new(
        mem: Arc<dyn ExecMemory>,
        options: JitOptions,
        backend: Arc<dyn Backend>,
    ) -> JitResult<Self> {
        let requested = mem.size();
        let (mut cb, mut ocb) = CodeBuffer::new_split(
            mem,
            backend.fill_byte(),
            options.label_limit,
            options.dump_disasm,
        )?;

        let mut registry = CodegenRegistry::new();
        backend.register_generators(&mut registry);

        let counters = Arc::new(RuntimeCounters::default());
        let stats_counters = options.gen_stats.then_some(&*counters);
        let leave_exit = backend.gen_leave_exit(&mut ocb, stats_counters);
        let exit_from_stub = backend.gen_exit_from_stub(&mut ocb, stats_counters);

        cb.mark_all_executable();
        ocb.mark_all_executable();

        if ocb.has_dropped_bytes() {
            return Err(JitError::OutOfMemory {
                requested,
                reason: "no room for the shared exits".to_string(),
            });
        }

        log::debug!(
            "JIT core ready for {}: {} inline + {} outlined bytes, {} generators",
            backend.arch().name(),
            cb.get_mem_size(),
            ocb.get_mem_size(),
            registry.len()
        );

        Ok(Self {
            cb,
            ocb,
            graph: Graph::new(),
            versions: VersionTable::new(),
            invalidation: InvalidationState::new(),
            options,
            stats: JitStats::default(),
            counters,
            backend,
            registry: Arc::new(registry),
            leave_exit,
            exit_from_stub,
            stub_hit: StubHitTarget { jit: 0, handler: 0 },
            tracing_active: false,
        })
    }

    /// Set what branch stubs call when first executed.
    pub fn set_stub_hit_target(&mut self, stub_hit: StubHitTarget) {
        self.stub_hit = stub_hit;
    }

    pub fn cb(&self) -> &CodeBuffer {
        &self.cb
    }

    pub fn ocb(&self) -> &CodeBuffer {
        &self.ocb
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    pub fn invalidation(&self) -> &InvalidationState {
        &self.invalidation
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &CodegenRegistry {
        &self.registry
    }

    pub fn leave_exit(&self) -> CodePtr {
        self.leave_exit
    }

    pub fn exit_from_stub(&self) -> CodePtr {
        self.exit_from_stub
    }

    pub fn tracing_active(&self) -> bool {
        self.tracing_active
    }

    pub fn register_iseq(&mut self, iseq: Arc<dyn Iseq>) {
        self.versions.register_iseq(iseq);
    }

    /// Statistics with buffer usage and runtime counters filled in.
    pub fn stats(&self) -> JitStats {
        let mut stats = self.stats.clone();
        stats.frozen_bytes = self.invalidation.frozen_bytes();
        stats.inline_code_size = self.cb.get_write_pos();
        stats.outlined_code_size = self.ocb.get_write_pos();
        stats.runtime = self.counters.snapshot();
        stats
    }

    /// Emit an exit in the outlined buffer and return its position there.
    pub(crate) fn gen_outlined_exit(&mut self, exit_pc: u64, ctx: &Context) -> usize {
        let pos = self.ocb.get_write_pos();
        let counters = if self.options.gen_stats {
            Some(&*self.counters)
        } else {
            None
        };
        self.backend.gen_exit(&mut self.ocb, exit_pc, ctx, counters);
        pos
    }

    /// Emit an exit at the current inline position.
    pub(crate) fn gen_inline_exit(&mut self, exit_pc: u64, ctx: &Context) -> CodePtr {
        let counters = if self.options.gen_stats {
            Some(&*self.counters)
        } else {
            None
        };
        self.backend.gen_exit(&mut self.cb, exit_pc, ctx, counters)
    }

    pub(crate) fn mark_all_executable(&mut self) {
        self.ocb.mark_all_executable();
        self.cb.mark_all_executable();
    }
}

/// Compile state of the instruction currently being generated.
pub struct JitState<'a> {
    core: &'a mut JitCore,
    iseq: Arc<dyn Iseq>,
    block: BlockRef,

    insn_idx: u32,
    opcode: Opcode,
    pc: u64,

    /// Exit shared by every guard of the current instruction.
    side_exit_for_pc: Option<CodePtr>,

    ec: Option<&'a dyn ExecutionContext>,

    /// Set by generators that call into the host, which may toggle tracing.
    record_boundary_patch_point: bool,
}

impl<'a> JitState<'a> {
    fn new(
        core: &'a mut JitCore,
        iseq: Arc<dyn Iseq>,
        block: BlockRef,
        ec: Option<&'a dyn ExecutionContext>,
    ) -> Self {
        let pc = iseq.pc_at(0);
        Self {
            core,
            iseq,
            block,
            insn_idx: 0,
            opcode: Opcode::Nop,
            pc,
            side_exit_for_pc: None,
            ec,
            record_boundary_patch_point: false,
        }
    }

    fn set_insn(&mut self, insn_idx: u32, opcode: Opcode, pc: u64) {
        self.insn_idx = insn_idx;
        self.opcode = opcode;
        self.pc = pc;
        self.side_exit_for_pc = None;
    }

    pub fn cb(&mut self) -> &mut CodeBuffer {
        &mut self.core.cb
    }

    pub fn ocb(&mut self) -> &mut CodeBuffer {
        &mut self.core.ocb
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.core.backend)
    }

    pub(crate) fn core(&mut self) -> &mut JitCore {
        self.core
    }

    pub fn get_iseq(&self) -> &Arc<dyn Iseq> {
        &self.iseq
    }

    pub fn get_block(&self) -> BlockRef {
        self.block
    }

    pub fn get_insn_idx(&self) -> u32 {
        self.insn_idx
    }

    pub fn get_opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn get_pc(&self) -> u64 {
        self.pc
    }

    /// Raw operand `n` of the current instruction.
    pub fn get_arg(&self, n: usize) -> u64 {
        self.iseq.operand(self.insn_idx, n)
    }

    pub fn next_insn_idx(&self) -> u32 {
        self.insn_idx + self.opcode.len()
    }

    /// Interpreter PC of the instruction after the current one.
    pub fn next_pc(&self) -> u64 {
        self.iseq.pc_at(self.next_insn_idx())
    }

    /// BlockId of instruction `idx` in the current unit.
    pub fn blockid_at(&self, idx: u32) -> BlockId {
        BlockId::new(self.iseq.id(), idx)
    }

    pub fn tracing_active(&self) -> bool {
        self.core.tracing_active
    }

    pub fn options(&self) -> &JitOptions {
        &self.core.options
    }

    /// True when the frame being compiled for is stopped at the current instruction, so its
    /// values can be inspected.
    pub fn at_current_insn(&self) -> bool {
        match self.ec {
            Some(ec) => ec.current_pc() == self.pc,
            None => false,
        }
    }

    fn live_ec(&self) -> &'a dyn ExecutionContext {
        assert!(self.at_current_insn(), "peeking at values off the current instruction");
        match self.ec {
            Some(ec) => ec,
            None => unreachable!(),
        }
    }

    /// Live value `n` slots below the top of the stack.
    ///
    /// Does not account for the context's sp_offset: the stub hit handler flushes it to the
    /// frame before compiling.
    pub fn peek_at_stack(&self, ctx: &Context, n: usize) -> Value {
        assert!(n < ctx.get_stack_size() as usize);
        self.live_ec().peek_stack(n)
    }

    pub fn peek_at_self(&self) -> Value {
        self.live_ec().peek_self()
    }

    pub fn peek_at_local(&self, local_idx: u32) -> Value {
        self.live_ec().peek_local(local_idx)
    }

    /// Outlined exit to the current instruction, created on first use.
    pub fn get_side_exit(&mut self, ctx: &Context) -> CodePtr {
        if let Some(exit) = self.side_exit_for_pc {
            return exit;
        }

        let pos = self.core.gen_outlined_exit(self.pc, ctx);
        let exit = self.ptr_in_ocb(pos);
        self.side_exit_for_pc = Some(exit);
        exit
    }

    fn ptr_in_ocb(&self, pos: usize) -> CodePtr {
        self.core
            .ocb
            .get_ptr(pos)
            .unwrap_or_else(|| self.core.ocb.get_write_ptr())
    }

    /// Give the current block an entry exit if it has none yet.
    pub fn ensure_block_entry_exit(&mut self) {
        let block = self.core.graph.block(self.block);
        if block.entry_exit.is_some() {
            return;
        }
        let blockid = block.blockid;
        let block_ctx = block.ctx;

        let exit = if self.insn_idx == blockid.idx {
            self.get_side_exit(&block_ctx)
        } else {
            let pc = self.iseq.pc_at(blockid.idx);
            let pos = self.core.gen_outlined_exit(pc, &block_ctx);
            self.ptr_in_ocb(pos)
        };
        self.core.graph.block_mut(self.block).entry_exit = Some(exit);
    }

    /// Ask for an exit and a patch record at the next instruction boundary.
    pub fn set_record_boundary_patch_point(&mut self) {
        self.record_boundary_patch_point = true;
    }

    pub fn gen_counter_inc(&mut self, counter: Counter) {
        if self.core.options.gen_stats {
            let addr = self.core.counters.addr(counter);
            self.core.backend.gen_counter_inc(&mut self.core.cb, addr);
        }
    }
}

/// Check the context against the live frame. Any disagreement is a compiler bug.
fn verify_ctx(jit: &JitState<'_>, ctx: &Context) {
    let ec = jit.live_ec();

    let self_val = jit.peek_at_self();
    let self_type = ctx.get_opnd_type(InsnOpnd::SelfOpnd);
    if !ec.type_of(self_val).diff(self_type).is_compatible() {
        panic!(
            "verify_ctx: ctx type ({}) incompatible with actual value of self: {:?}",
            self_type.name(),
            self_val
        );
    }

    let stack_size = ctx.get_stack_size() as usize;
    for i in 0..stack_size.min(crate::bbv::context::MAX_TEMP_TYPES) {
        let (mapping, learned) = ctx.get_opnd_mapping(InsnOpnd::StackOpnd(i as u16));
        let val = jit.peek_at_stack(ctx, i);

        match mapping {
            TempMapping::MapToSelf if self_val != val => panic!(
                "verify_ctx: stack value was mapped to self, but values did not match\n  stack: {:?}\n  self: {:?}",
                val, self_val
            ),
            TempMapping::MapToLocal(local_idx) => {
                let local_val = jit.peek_at_local(local_idx as u32);
                if local_val != val {
                    panic!(
                        "verify_ctx: stack value was mapped to local, but values did not match\n  stack: {:?}\n  local {}: {:?}",
                        val, local_idx, local_val
                    );
                }
            }
            _ => {}
        }

        if !ec.type_of(val).diff(learned).is_compatible() {
            panic!(
                "verify_ctx: ctx type ({}) incompatible with actual value on stack: {:?}",
                learned.name(),
                val
            );
        }
    }

    let local_table_size = jit.iseq.local_table_size() as usize;
    for i in 0..local_table_size.min(crate::bbv::context::MAX_LOCAL_TYPES) {
        let learned = ctx.get_local_type(i);
        let val = jit.peek_at_local(i as u32);
        if !ec.type_of(val).diff(learned).is_compatible() {
            panic!(
                "verify_ctx: ctx type ({}) incompatible with actual value of local: {:?}",
                learned.name(),
                val
            );
        }
    }
}

/// End the block with a jump to the next instruction, carrying the current context.
pub fn jit_jump_to_next_insn(jit: &mut JitState<'_>, current_ctx: &Context) {
    // Chains only ever jump back to the same instruction
    let mut reset_depth = *current_ctx;
    reset_depth.reset_chain_depth();

    let jump_block = jit.blockid_at(jit.next_insn_idx());

    if jit.record_boundary_patch_point {
        let exit_pc = jit.next_pc();
        let exit_pos = jit.core.gen_outlined_exit(exit_pc, &reset_depth);
        let core = jit.core();
        core.invalidation.record_patch(&core.cb, exit_pos);
        jit.record_boundary_patch_point = false;
    }

    branch::gen_direct_jump(jit, &reset_depth, jump_block);
}

/// Compile one version of `blockid`.
pub fn gen_single_block(
    core: &mut JitCore,
    blockid: BlockId,
    start_ctx: &Context,
    ec: Option<&dyn ExecutionContext>,
) -> JitResult<BlockRef> {
    let iseq = core.versions.iseq(blockid.iseq)?;

    let (mut ctx, widened) =
        core.versions
            .limit_block_versions(blockid, start_ctx, core.options.max_versions);
    if widened {
        core.stats.version_limit_hits += 1;
        log::debug!("Version limit reached for {blockid:?}, compiling a generic version");
    }

    let block = core.graph.new_block(blockid, ctx);
    let start_addr = core.cb.get_write_ptr();
    core.graph.block_mut(block).start_addr = Some(start_addr);

    let registry = Arc::clone(&core.registry);
    let iseq_size = iseq.size();
    let mut insn_idx = blockid.idx;

    let mut jit = JitState::new(core, Arc::clone(&iseq), block, ec);

    while insn_idx < iseq_size {
        let opcode = iseq.opcode_at(insn_idx);
        let pc = iseq.pc_at(insn_idx);

        // Some instructions are only specialized when they start a block
        if opcode.must_start_block() && insn_idx > blockid.idx {
            jit_jump_to_next_insn(&mut jit, &ctx);
            break;
        }

        jit.set_insn(insn_idx, opcode, pc);

        if jit.record_boundary_patch_point {
            let exit_pos = jit.core.gen_outlined_exit(pc, &ctx);
            let core = jit.core();
            core.invalidation.record_patch(&core.cb, exit_pos);
            jit.record_boundary_patch_point = false;
        }

        if jit.core.options.verify_ctx && jit.at_current_insn() {
            verify_ctx(&jit, &ctx);
        }

        let status = match registry.get(opcode) {
            Some(gen) => {
                log::trace!("compiling {blockid:?} {insn_idx}: {}", opcode.name());
                jit.gen_counter_inc(Counter::ExecInstruction);
                jit.cb().add_comment(opcode.name());
                gen.gen(&mut jit, &mut ctx)
            }
            None => CodegenStatus::CantCompile,
        };

        if status == CodegenStatus::CantCompile {
            let exit = jit.core.gen_inline_exit(pc, &ctx);
            if insn_idx == blockid.idx {
                jit.core.graph.block_mut(block).entry_exit = Some(exit);
            }
            break;
        }

        // Only the first instruction of a block may care about the chain depth
        ctx.reset_chain_depth();
        insn_idx += opcode.len();

        if status == CodegenStatus::EndBlock {
            break;
        }
    }

    let pending_boundary = jit.record_boundary_patch_point;
    assert!(
        !pending_boundary,
        "block {blockid:?} ended with a pending boundary patch point"
    );

    let end_addr = core.cb.get_write_ptr();
    let sealed = core.graph.block_mut(block);
    sealed.end_addr = Some(end_addr);
    sealed.end_idx = insn_idx;

    if core.cb.has_dropped_bytes() || core.ocb.has_dropped_bytes() {
        core.graph.discard_block(block);
        core.stats.compilation_failure += 1;
        log::warn!("Out of executable memory while compiling {blockid:?}");
        return Err(JitError::CapacityExhausted {
            iseq: blockid.iseq.0,
            idx: blockid.idx,
        });
    }

    log::debug!(
        "Compiled {} {blockid:?}..{insn_idx} at {start_addr:?}, {} bytes",
        iseq.name(),
        end_addr.raw() - start_addr.raw()
    );

    Ok(block)
}

/// Compile `blockid` and every fall-through successor it requests.
pub fn gen_block_series(
    core: &mut JitCore,
    blockid: BlockId,
    start_ctx: &Context,
    ec: Option<&dyn ExecutionContext>,
) -> JitResult<BlockRef> {
    let first = gen_single_block(core, blockid, start_ctx, ec)?;
    core.versions.add_block_version(&core.graph, first)?;

    let mut batch = vec![first];
    let mut last = first;

    loop {
        let Some(&last_branch) = core.graph.block(last).outgoing.last() else {
            break;
        };

        let br = core.graph.branch(last_branch);
        if br.dst_addrs[0].is_some() || br.dst_addrs[1].is_some() {
            break;
        }
        let Some(target) = br.targets[0] else {
            panic!("invalid target for last branch of {:?}", core.graph.block(last).blockid);
        };
        let target_ctx = br.target_ctxs[0];

        if batch.len() >= core.options.max_per_batch {
            if let Err(err) = branch::stub_out_fallthrough(core, last_branch) {
                discard_batch(core, &batch);
                return Err(err);
            }
            break;
        }

        let new_block = match gen_single_block(core, target, &target_ctx, ec) {
            Ok(block) => block,
            Err(err) => {
                discard_batch(core, &batch);
                return Err(err);
            }
        };
        core.versions.add_block_version(&core.graph, new_block)?;
        core.graph.link(last_branch, 0, new_block);

        assert_eq!(
            core.graph.block(new_block).start_addr,
            core.graph.branch(last_branch).end_addr,
            "fall-through block must follow its branch"
        );

        batch.push(new_block);
        last = new_block;
    }

    core.stats.compiled_block_count += batch.len();

    if core.options.dump_disasm {
        for &block in &batch {
            log::debug!("{}", crate::dump::disasm_block(core, block));
        }
    }

    Ok(first)
}

fn discard_batch(core: &mut JitCore, batch: &[BlockRef]) {
    for &block in batch {
        core.versions.remove_block_version(&core.graph, block);
        core.graph.discard_block(block);
    }
    core.stats.compilation_failure += 1;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::asm::memory::SimulatedMemory;

    /// Core over simulated memory for unit tests.
    pub fn new_core(arch: TargetArch, options: JitOptions) -> (JitCore, Arc<SimulatedMemory>) {
        let sim = Arc::new(SimulatedMemory::new(64 * SimulatedMemory::PAGE_SIZE));
        let core = JitCore::new(sim.clone(), options, backend_for(arch)).unwrap();
        (core, sim)
    }
}
