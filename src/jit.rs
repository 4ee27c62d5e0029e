// This module is the surface the host interpreter talks to. A Jit owns one JitCore behind a
// runtime-wide lock (parking_lot::Mutex) plus the host's execution barrier. Every operation that
// writes code or touches the version tables takes the lock: resolving a block id to an entry
// address, generating a unit's native entry point, servicing a branch stub hit, and the global
// invalidation sweep. The sweep first waits at the barrier so that no other execution context is
// inside a code-writing window, then drops every version, reroutes every recorded patch point to
// its outlined exit, freezes all inline code written so far and restores execute permission. The
// parked contexts are released only after the lock is dropped. Blocks are unlinked, never freed,
// since other contexts may still be running inside them.
//
// Branch stubs reach the JIT through bbjit_branch_stub_hit, an extern "C" trampoline whose first
// argument is the address of the Jit. That is why constructors hand out an Arc<Jit>: the address
// stays stable for as long as generated code can call back into it.

//! The JIT instance exposed to the host interpreter.

use crate::asm::memory::{page_align_up, ExecMemory, MmapMemory, SimulatedMemory};
use crate::asm::CodePtr;
use crate::bbv::{BlockId, BlockRef, Context};
use crate::codegen::backend::StubHitTarget;
use crate::codegen::{backend_for, branch, gen_block_series, JitCore};
use crate::core::error::{JitError, JitResult};
use crate::core::options::{JitOptions, TargetArch};
use crate::core::stats::JitStats;
use crate::host::{ExecutionBarrier, ExecutionContext, Iseq, NoBarrier, RawExecutionContext, RawFrame};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A JIT instance: code buffers, versions and invalidation state behind one lock.
pub struct Jit {
    core: Mutex<JitCore>,
    barrier: Arc<dyn ExecutionBarrier>,
}

impl Jit {
    /// JIT for the host architecture over freshly mapped executable memory.
    pub fn new(options: JitOptions, barrier: Arc<dyn ExecutionBarrier>) -> JitResult<Arc<Self>> {
        let arch = TargetArch::native();
        let size = Self::clamp_mem_size(arch, options.exec_mem_size);
        let mem = Arc::new(MmapMemory::new(size)?);
        Self::with_memory(mem, arch, options, barrier)
    }

    /// JIT over simulated memory, for hosts that never execute the generated code.
    pub fn simulated(arch: TargetArch, options: JitOptions) -> JitResult<Arc<Self>> {
        let size = Self::clamp_mem_size(arch, options.exec_mem_size);
        let mem = Arc::new(SimulatedMemory::new(page_align_up(
            size,
            SimulatedMemory::PAGE_SIZE,
        )));
        Self::with_memory(mem, arch, options, Arc::new(NoBarrier))
    }

    pub fn with_memory(
        mem: Arc<dyn ExecMemory>,
        arch: TargetArch,
        options: JitOptions,
        barrier: Arc<dyn ExecutionBarrier>,
    ) -> JitResult<Arc<Self>> {
        let backend = backend_for(arch);
        if mem.size() > backend.max_exec_mem() {
            return Err(JitError::OutOfMemory {
                requested: mem.size(),
                reason: format!("{} branches cannot span the region", arch.name()),
            });
        }

        let core = JitCore::new(mem, options, backend)?;
        let jit = Arc::new(Self {
            core: Mutex::new(core),
            barrier,
        });

        let stub_hit = StubHitTarget {
            jit: Arc::as_ptr(&jit) as u64,
            handler: bbjit_branch_stub_hit as usize as u64,
        };
        jit.core.lock().set_stub_hit_target(stub_hit);

        log::info!("bbjit initialized for {}", arch.name());
        Ok(jit)
    }

    fn clamp_mem_size(arch: TargetArch, requested: usize) -> usize {
        let limit = backend_for(arch).max_exec_mem();
        if requested > limit {
            log::warn!(
                "exec-mem-size of {requested} bytes exceeds the {limit} byte reach of {} branches",
                arch.name()
            );
            return limit;
        }
        requested
    }

    /// Take the JIT lock.
    pub fn lock(&self) -> MutexGuard<'_, JitCore> {
        self.core.lock()
    }

    pub fn register_iseq(&self, iseq: Arc<dyn Iseq>) {
        self.core.lock().register_iseq(iseq);
    }

    /// Entry address of a version of `blockid` usable with `ctx`, compiling one if needed.
    ///
    /// A block whose first instruction cannot be compiled resolves to its entry exit.
    pub fn resolve(
        &self,
        blockid: BlockId,
        ctx: &Context,
        ec: Option<&dyn ExecutionContext>,
    ) -> JitResult<CodePtr> {
        let mut core = self.core.lock();
        let block = find_or_compile(&mut core, blockid, ctx, ec)?;
        start_addr(&core, block)
    }

    /// Native entry point of `iseq` at `insn_idx`, or `None` when the interpreter should keep
    /// running it.
    pub fn gen_entry_point(
        &self,
        iseq: &Arc<dyn Iseq>,
        insn_idx: u32,
        ec: Option<&dyn ExecutionContext>,
    ) -> Option<CodePtr> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        core.register_iseq(iseq.clone());

        let blockid = BlockId::new(iseq.id(), insn_idx);
        let leave_exit = core.leave_exit;
        let entry = core.backend.clone().gen_entry_prologue(&mut core.cb, leave_exit);

        let existing = core.versions.find_block_version(
            &core.graph,
            blockid,
            &Context::new(),
            core.options.max_versions,
            core.options.greedy_versioning,
        );

        let block = match existing {
            Some(block) => {
                let Some(target) = core.graph.block(block).start_addr else {
                    core.mark_all_executable();
                    return None;
                };
                core.backend.clone().jmp_ptr(&mut core.cb, target);
                block
            }
            None => match gen_block_series(core, blockid, &Context::new(), ec) {
                Ok(block) => block,
                Err(err) => {
                    log::debug!("No entry point for {}: {err}", iseq.name());
                    core.mark_all_executable();
                    return None;
                }
            },
        };

        core.mark_all_executable();

        if core.cb.has_dropped_bytes() || core.graph.block(block).end_idx == insn_idx {
            return None;
        }

        log::debug!("Entry point for {} at {entry:?}", iseq.name());
        Some(entry)
    }

    /// Service a branch stub hit from generated code.
    pub fn branch_stub_hit(
        &self,
        branch: u64,
        target_idx: u32,
        ec: &mut dyn ExecutionContext,
    ) -> CodePtr {
        let mut core = self.core.lock();
        branch::branch_stub_hit(&mut core, branch, target_idx, ec)
    }

    /// Revoke every compiled version and reroute recorded patch points to their exits.
    pub fn invalidate_all(&self) -> JitResult<()> {
        let _parked = Parked::new(&*self.barrier);
        let mut guard = self.core.lock();
        let core = &mut *guard;

        let blocks = core.versions.take_all();
        for &block in &blocks {
            core.graph.invalidate_block(block);
        }

        let backend = core.backend.clone();
        let result = core
            .invalidation
            .apply(&mut core.cb, &core.ocb, |cb, target| backend.jmp_ptr(cb, target));

        let (applied, end) = match result {
            Ok(done) => done,
            Err(err) => {
                core.mark_all_executable();
                return Err(err);
            }
        };

        core.invalidation.freeze(end.max(core.cb.get_write_pos()));
        core.stats.invalidation_count += 1;
        core.stats.patches_applied += applied;
        core.mark_all_executable();

        log::info!(
            "Invalidated {} blocks, applied {applied} patches, frozen at {:#x}",
            blocks.len(),
            core.invalidation.frozen_bytes()
        );
        Ok(())
    }

    /// Record that the host turned on tracing, then invalidate everything compiled so far.
    pub fn enable_tracing(&self) -> JitResult<()> {
        self.core.lock().tracing_active = true;
        self.invalidate_all()
    }

    pub fn tracing_active(&self) -> bool {
        self.core.lock().tracing_active()
    }

    pub fn stats(&self) -> JitStats {
        self.core.lock().stats()
    }
}

/// Other execution contexts held at the barrier. Declared before the core lock guard, so it is
/// released after the lock is.
struct Parked<'a>(&'a dyn ExecutionBarrier);

impl<'a> Parked<'a> {
    fn new(barrier: &'a dyn ExecutionBarrier) -> Self {
        barrier.barrier();
        Self(barrier)
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn find_or_compile(
    core: &mut JitCore,
    blockid: BlockId,
    ctx: &Context,
    ec: Option<&dyn ExecutionContext>,
) -> JitResult<BlockRef> {
    core.versions.iseq(blockid.iseq)?;

    let existing = core.versions.find_block_version(
        &core.graph,
        blockid,
        ctx,
        core.options.max_versions,
        core.options.greedy_versioning,
    );
    if let Some(block) = existing {
        return Ok(block);
    }

    let result = gen_block_series(core, blockid, ctx, ec);
    core.mark_all_executable();
    result
}

fn start_addr(core: &JitCore, block: BlockRef) -> JitResult<CodePtr> {
    let block = core.graph.block(block);
    block.start_addr.ok_or(JitError::CapacityExhausted {
        iseq: block.blockid.iseq.0,
        idx: block.blockid.idx,
    })
}

/// Called by branch stubs with the Jit, the branch handle, the target index and the execution
/// context; returns the address to continue at.
///
/// # Safety
///
/// `jit` must be the address of a live `Jit` and `ec` a live execution context whose current
/// control frame runs the unit that owns the branch.
pub unsafe extern "C" fn bbjit_branch_stub_hit(
    jit: *const Jit,
    branch: u64,
    target_idx: u32,
    ec: *mut RawExecutionContext,
) -> *const u8 {
    let jit = unsafe { &*jit };
    let mut core = jit.core.lock();

    let local_table_size = core
        .graph
        .checked_branch(branch)
        .map(|br| core.graph.block(core.graph.branch(br).block).blockid.iseq)
        .and_then(|id| core.versions.iseq(id).ok())
        .map_or(0, |iseq| iseq.local_table_size());

    let mut frame = unsafe { RawFrame::new(ec, local_table_size) };
    branch::branch_stub_hit(&mut core, branch, target_idx, &mut frame).as_ptr()
}
