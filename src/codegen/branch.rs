// This module links block versions together. gen_branch, gen_direct_jump, defer_compilation and
// jit_chain_guard create branches from inside a generator; a branch whose target has no
// compatible version yet gets a stub in outlined code instead. branch_stub_hit runs when such a
// stub executes: it moves the frame to the target, compiles the target and rewrites the branch in
// place. When the branch is the last thing in inline code, the branch is first reshaped to fall
// through so the new block lands right after it. Branches below the frozen watermark are never
// rewritten, and a rewrite never makes a branch longer than it was.

//! Branches between block versions and the stub hit handler.
//!
//! A branch records its successors as block ids and contexts. Successors that already have a
//! compatible version are jumped to directly. The others get a stub in the outlined buffer that
//! calls [`branch_stub_hit`] the first time it runs, which compiles the successor and rewrites the
//! branch to jump straight to it.

use super::{gen_block_series, JitCore, JitState};
use crate::asm::opnd::Cond;
use crate::asm::CodePtr;
use crate::bbv::{BlockId, BlockRef, BranchKind, BranchRef, BranchShape, Context};
use crate::core::error::{JitError, JitResult};
use crate::host::ExecutionContext;
use std::sync::Arc;

/// Existing compatible version of `blockid` for `ctx`, if any.
fn find_version(core: &JitCore, blockid: BlockId, ctx: &Context) -> Option<BlockRef> {
    core.versions.find_block_version(
        &core.graph,
        blockid,
        ctx,
        core.options.max_versions,
        core.options.greedy_versioning,
    )
}

/// Stub for target `target_idx` of `branch`, or None if the outlined buffer is full.
fn gen_stub(core: &mut JitCore, branch: BranchRef, target_idx: usize) -> Option<CodePtr> {
    let stub = core.backend.gen_branch_stub(
        &mut core.ocb,
        core.stub_hit,
        branch.as_raw(),
        target_idx as u32,
    );
    if core.ocb.has_dropped_bytes() {
        None
    } else {
        Some(stub)
    }
}

/// Where target `target_idx` of `branch` should jump: a compiled version or a new stub.
fn get_branch_target(core: &mut JitCore, branch: BranchRef, target_idx: usize) -> Option<CodePtr> {
    let br = core.graph.branch(branch);
    let target = br.targets[target_idx]?;
    let ctx = br.target_ctxs[target_idx];

    if let Some(block) = find_version(core, target, &ctx) {
        core.graph.link(branch, target_idx, block);
        return core.graph.block(block).start_addr;
    }

    gen_stub(core, branch, target_idx)
}

/// Destinations to encode for `branch`. A missing destination only happens when a buffer ran
/// out of room, and the block is then discarded, so any encodable address will do.
fn encodable_targets(core: &JitCore, branch: BranchRef) -> [Option<CodePtr>; 2] {
    let br = core.graph.branch(branch);
    let placeholder = core.cb.get_write_ptr();
    let mut targets = [None; 2];
    for (idx, target) in targets.iter_mut().enumerate().take(br.kind.num_targets()) {
        *target = Some(br.dst_addrs[idx].unwrap_or(placeholder));
    }
    targets
}

/// Emit a new branch at the current inline position.
fn emit_branch(core: &mut JitCore, branch: BranchRef) {
    let targets = encodable_targets(core, branch);
    let (kind, shape) = {
        let br = core.graph.branch(branch);
        (br.kind, br.shape)
    };

    let start = core.cb.get_write_ptr();
    core.backend.gen_branch(&mut core.cb, kind, targets, shape);
    let end = core.cb.get_write_ptr();

    let br = core.graph.branch_mut(branch);
    br.start_addr = Some(start);
    br.end_addr = Some(end);
}

/// Create a branch out of the block being compiled and fill in its targets.
fn new_branch(
    jit: &mut JitState<'_>,
    src_ctx: &Context,
    kind: BranchKind,
    target0: BlockId,
    ctx0: &Context,
    target1: Option<(BlockId, &Context)>,
) -> BranchRef {
    let block = jit.get_block();
    let core = jit.core();
    let branch = core.graph.new_branch(block, *src_ctx, kind);
    core.stats.compiled_branch_count += 1;

    let br = core.graph.branch_mut(branch);
    br.targets[0] = Some(target0);
    br.target_ctxs[0] = *ctx0;
    if let Some((target1, ctx1)) = target1 {
        br.targets[1] = Some(target1);
        br.target_ctxs[1] = *ctx1;
    }
    branch
}

/// Branch to `target0`, and for conditional kinds to `target1` otherwise.
pub fn gen_branch(
    jit: &mut JitState<'_>,
    src_ctx: &Context,
    target0: BlockId,
    ctx0: &Context,
    target1: Option<(BlockId, &Context)>,
    kind: BranchKind,
) {
    let branch = new_branch(jit, src_ctx, kind, target0, ctx0, target1);
    let core = jit.core();

    let dst0 = get_branch_target(core, branch, 0);
    let dst1 = if target1.is_some() {
        get_branch_target(core, branch, 1)
    } else {
        None
    };

    let br = core.graph.branch_mut(branch);
    br.dst_addrs = [dst0, dst1];
    br.shape = BranchShape::Default;
    emit_branch(core, branch);
}

/// Jump to `target0` with `ctx`. A target without a version is compiled right after the
/// current block, and the branch takes no space.
pub fn gen_direct_jump(jit: &mut JitState<'_>, ctx: &Context, target0: BlockId) {
    let branch = new_branch(jit, ctx, BranchKind::Jump, target0, ctx, None);
    let core = jit.core();

    match find_version(core, target0, ctx) {
        Some(block) => {
            core.graph.link(branch, 0, block);
            core.graph.branch_mut(branch).shape = BranchShape::Default;
            emit_branch(core, branch);
        }
        None => {
            let here = core.cb.get_write_ptr();
            let br = core.graph.branch_mut(branch);
            br.shape = BranchShape::Next0;
            br.start_addr = Some(here);
            br.end_addr = Some(here);
        }
    }
}

/// End the block with a stub for the current instruction one chain level deeper, so it gets
/// compiled once execution reaches it and live values can be inspected.
pub fn defer_compilation(jit: &mut JitState<'_>, cur_ctx: &Context) {
    assert_eq!(cur_ctx.get_chain_depth(), 0, "Double defer!");

    let mut next_ctx = *cur_ctx;
    next_ctx.increment_chain_depth();

    let blockid = jit.blockid_at(jit.get_insn_idx());
    let branch = new_branch(jit, cur_ctx, BranchKind::Jump, blockid, &next_ctx, None);
    let core = jit.core();

    let dst = get_branch_target(core, branch, 0);
    let br = core.graph.branch_mut(branch);
    br.dst_addrs[0] = dst;
    br.shape = BranchShape::Default;
    emit_branch(core, branch);
}

/// Guard that jumps away when `cond` holds: to a deeper version of the current instruction
/// while the chain is shorter than `depth_limit`, to `side_exit` after that.
pub fn jit_chain_guard(
    jit: &mut JitState<'_>,
    ctx: &Context,
    cond: Cond,
    depth_limit: u8,
    side_exit: CodePtr,
) {
    if ctx.get_chain_depth() < depth_limit {
        let mut deeper = *ctx;
        deeper.increment_chain_depth();
        let blockid = jit.blockid_at(jit.get_insn_idx());
        gen_branch(jit, ctx, blockid, &deeper, None, BranchKind::Guard(cond));
    } else {
        let backend = jit.backend();
        backend.jcc_ptr(jit.cb(), cond, side_exit);
    }
}

/// Re-emit `branch` in place with its current shape and destinations.
///
/// Branches in frozen code are left alone. The write cursor never moves back, and the block's
/// end follows the branch when the branch terminates it.
pub fn regenerate_branch(core: &mut JitCore, branch: BranchRef) -> JitResult<()> {
    let br = core.graph.branch(branch).clone();
    let (Some(start), Some(end)) = (br.start_addr, br.end_addr) else {
        return Ok(());
    };
    let Some(start_pos) = core.cb.ptr_to_pos(start) else {
        return Err(JitError::PatchOutOfBounds {
            pos: start.raw(),
            limit: core.cb.get_mem_size(),
        });
    };

    let frozen = core.invalidation.frozen_bytes();
    if start_pos < frozen {
        return Ok(());
    }

    let terminates_block = core.graph.block(br.block).end_addr == Some(end);
    let targets = encodable_targets(core, branch);
    let backend = Arc::clone(&core.backend);
    let limit = core.cb.get_mem_size();

    let end_pos = core.cb.rewrite_at(start_pos, frozen, limit, |cb| {
        backend.gen_branch(cb, br.kind, targets, br.shape)
    })?;

    let new_end = start.add_bytes(end_pos - start_pos);
    core.graph.branch_mut(branch).end_addr = Some(new_end);
    if terminates_block {
        core.graph.block_mut(br.block).end_addr = Some(new_end);
    }
    Ok(())
}

/// Turn a zero-size fall-through jump at the end of a block into a jump to a stub.
pub(crate) fn stub_out_fallthrough(core: &mut JitCore, branch: BranchRef) -> JitResult<()> {
    let Some(stub) = gen_stub(core, branch, 0) else {
        let target = core.graph.branch(branch).targets[0];
        return Err(JitError::CapacityExhausted {
            iseq: target.map_or(0, |t| t.iseq.0),
            idx: target.map_or(0, |t| t.idx),
        });
    };

    let br = core.graph.branch_mut(branch);
    br.dst_addrs[0] = Some(stub);
    br.shape = BranchShape::Default;
    regenerate_branch(core, branch)
}

/// Called by a stub the first time target `target_idx` of a branch is taken. Returns the
/// address execution continues at.
///
/// The frame's stack pointer is advanced by the target's sp_offset and its PC set to the
/// target instruction while compiling, so generators can look at live values. On success the
/// stack pointer is restored; on failure the frame is left describing the target instruction
/// and the returned exit hands it to the interpreter.
pub fn branch_stub_hit(
    core: &mut JitCore,
    branch_raw: u64,
    target_idx: u32,
    ec: &mut dyn ExecutionContext,
) -> CodePtr {
    core.stats.branch_stub_hits += 1;

    let Some(branch) = core.graph.checked_branch(branch_raw) else {
        panic!("stub hit for unknown branch {branch_raw}");
    };
    let target_idx = target_idx as usize;
    assert!(target_idx < 2, "invalid branch target index {target_idx}");

    let br = core.graph.branch(branch).clone();
    let branch_size_on_entry = br.code_size();

    let dst_addr = match (br.blocks[target_idx], br.dst_addrs[target_idx]) {
        // Another execution context serviced this stub first
        (Some(_), Some(dst)) => dst,
        _ => {
            let Some(target) = br.targets[target_idx] else {
                panic!("stub hit for missing target {target_idx} of {branch:?}");
            };
            let target_ctx = br.target_ctxs[target_idx];
            let target_pc = match core.versions.iseq(target.iseq) {
                Ok(iseq) => iseq.pc_at(target.idx),
                Err(err) => panic!("stub hit for {target:?}: {err}"),
            };

            let sp_offset = target_ctx.get_sp_offset() as i32;
            ec.adjust_sp(sp_offset);
            ec.set_pc(target_pc);

            let dst = match service_stub(core, branch, target_idx, target, &target_ctx, &*ec) {
                Some(dst) => {
                    ec.adjust_sp(-sp_offset);
                    dst
                }
                None => core.exit_from_stub,
            };

            core.mark_all_executable();
            dst
        }
    };

    let new_branch_size = core.graph.branch(branch).code_size();
    assert!(
        new_branch_size <= branch_size_on_entry,
        "branch stubs should not enlarge branches"
    );

    log::debug!("Stub hit {branch:?}[{target_idx}] -> {dst_addr:?}");
    dst_addr
}

/// Find or compile the target, then point the branch at it.
fn service_stub(
    core: &mut JitCore,
    branch: BranchRef,
    target_idx: usize,
    target: BlockId,
    target_ctx: &Context,
    ec: &dyn ExecutionContext,
) -> Option<CodePtr> {
    let mut block = find_version(core, target, target_ctx);

    if block.is_none() {
        let br = core.graph.branch(branch).clone();
        let old_shape = br.shape;
        let mut branch_modified = false;

        let at_end = br.end_addr == Some(core.cb.get_write_ptr());
        let unfrozen = br
            .start_addr
            .and_then(|start| core.cb.ptr_to_pos(start))
            .is_some_and(|pos| pos >= core.invalidation.frozen_bytes());

        // Place the new block right after the branch when the branch ends the inline code
        if at_end && unfrozen && !matches!(br.kind, BranchKind::Guard(_)) {
            core.graph.branch_mut(branch).shape = if target_idx == 0 {
                BranchShape::Next0
            } else {
                BranchShape::Next1
            };

            match regenerate_branch(core, branch) {
                Ok(()) => {
                    let end = core.graph.branch(branch).end_addr;
                    if end.is_some_and(|end| core.cb.try_set_write_ptr(end)) {
                        branch_modified = true;
                    } else {
                        // Nothing fits after the branch, so the target cannot be placed there
                        log::debug!("Inline code is full after {branch:?}");
                        core.graph.branch_mut(branch).shape = old_shape;
                        if let Err(err) = regenerate_branch(core, branch) {
                            log::error!("Could not restore {branch:?}: {err}");
                        }
                        core.stats.compilation_failure += 1;
                        return None;
                    }
                }
                Err(err) => {
                    log::warn!("Could not reshape {branch:?}: {err}");
                    core.graph.branch_mut(branch).shape = old_shape;
                }
            }
        }

        match gen_block_series(core, target, target_ctx, Some(ec)) {
            Ok(new_block) => block = Some(new_block),
            Err(err) => {
                log::debug!("Stub target {target:?} not compiled: {err}");
                if branch_modified {
                    core.graph.branch_mut(branch).shape = old_shape;
                    if let Err(err) = regenerate_branch(core, branch) {
                        log::error!("Could not restore {branch:?}: {err}");
                    }
                }
            }
        }
    }

    let block = block?;
    core.graph.link(branch, target_idx, block);
    let dst = core.graph.block(block).start_addr;

    if let Err(err) = regenerate_branch(core, branch) {
        log::error!("Could not patch {branch:?}: {err}");
    }
    dst
}
