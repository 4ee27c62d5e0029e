// This module holds the block graph: every compiled block version and every branch between them.
// Blocks and branches live in two arenas owned by the JIT and are referred to by index handles,
// so the cyclic structure (a block lists its outgoing branches, a branch points at its owning
// block and at the blocks it targets, and each target lists the branch among its incoming edges)
// needs no shared ownership or interior mutability. A branch handle is also what a stub passes
// back to the stub hit handler, so handles are plain integers that survive a round trip through
// generated code. Blocks are never removed from the arena. Invalidation only changes their
// status, because an execution context may still be running inside one; a block discarded
// before registration is unlinked from the graph so no branch can ever reach it.

//! Block versions, branches and the arena that owns them.

use super::context::Context;
use crate::asm::opnd::Cond;
use crate::asm::CodePtr;
use crate::host::IseqId;
use std::fmt;

/// Bytecode position a block realizes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub iseq: IseqId,

    /// Instruction index where the block starts.
    pub idx: u32,
}

impl BlockId {
    pub fn new(iseq: IseqId, idx: u32) -> Self {
        Self { iseq, idx }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.iseq.0, self.idx)
    }
}

/// Handle of a block in the graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BlockRef(usize);

impl BlockRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle of a branch in the graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BranchRef(usize);

impl BranchRef {
    /// Integer passed through generated code to the stub hit handler.
    pub fn as_raw(self) -> u64 {
        self.0 as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Registered or being compiled.
    Live,
    /// Removed from dispatch by invalidation. Code stays in place.
    Invalidated,
    /// Compilation failed; never registered.
    Discarded,
}

/// Layout of a branch relative to the code that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchShape {
    /// Target 0 is placed right after the branch.
    Next0,
    /// Target 1 is placed right after the branch.
    Next1,
    /// Neither target follows the branch.
    Default,
}

/// What code a branch emits for its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Unconditional jump to target 0.
    Jump,
    /// Jump to target 0 if the condition holds, to target 1 otherwise.
    Cond(Cond),
    /// Jump to target 0 if the condition holds, fall through to the code after the branch.
    Guard(Cond),
}

impl BranchKind {
    pub fn num_targets(self) -> usize {
        match self {
            BranchKind::Cond(_) => 2,
            BranchKind::Jump | BranchKind::Guard(_) => 1,
        }
    }
}

/// Compiled realization of one block id under one context.
#[derive(Debug, Clone)]
pub struct Block {
    pub blockid: BlockId,

    /// Index one past the last instruction of the block.
    pub end_idx: u32,

    /// Context at the start of the block. Never mutated after creation.
    pub ctx: Context,

    pub start_addr: Option<CodePtr>,
    pub end_addr: Option<CodePtr>,

    /// Branches targeting this block.
    pub incoming: Vec<BranchRef>,

    /// Branches out of this block, in emission order.
    pub outgoing: Vec<BranchRef>,

    /// Exit taken when the block's first instruction cannot be compiled.
    pub entry_exit: Option<CodePtr>,

    pub status: BlockStatus,
}

/// Control transfer out of a block.
#[derive(Debug, Clone)]
pub struct Branch {
    /// Block the branch belongs to.
    pub block: BlockRef,

    pub start_addr: Option<CodePtr>,
    pub end_addr: Option<CodePtr>,

    /// Context right after the branch instruction.
    pub src_ctx: Context,

    pub targets: [Option<BlockId>; 2],
    pub target_ctxs: [Context; 2],
    pub blocks: [Option<BlockRef>; 2],

    /// Current jump destinations: compiled blocks or stubs.
    pub dst_addrs: [Option<CodePtr>; 2],

    pub kind: BranchKind,
    pub shape: BranchShape,
}

impl Branch {
    /// Size of the branch code in bytes.
    pub fn code_size(&self) -> usize {
        match (self.start_addr, self.end_addr) {
            (Some(start), Some(end)) => end.raw() - start.raw(),
            _ => 0,
        }
    }
}

/// Arena of blocks and branches.
#[derive(Default)]
pub struct Graph {
    blocks: Vec<Block>,
    branches: Vec<Branch>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_block(&mut self, blockid: BlockId, ctx: Context) -> BlockRef {
        self.blocks.push(Block {
            blockid,
            end_idx: blockid.idx,
            ctx,
            start_addr: None,
            end_addr: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            entry_exit: None,
            status: BlockStatus::Live,
        });
        BlockRef(self.blocks.len() - 1)
    }

    /// Create a branch out of `block` with no targets yet.
    pub fn new_branch(&mut self, block: BlockRef, src_ctx: Context, kind: BranchKind) -> BranchRef {
        self.branches.push(Branch {
            block,
            start_addr: None,
            end_addr: None,
            src_ctx,
            targets: [None; 2],
            target_ctxs: [Context::default(); 2],
            blocks: [None; 2],
            dst_addrs: [None; 2],
            kind,
            shape: BranchShape::Default,
        });
        let branch = BranchRef(self.branches.len() - 1);
        self.blocks[block.0].outgoing.push(branch);
        branch
    }

    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[block.0]
    }

    pub fn block_mut(&mut self, block: BlockRef) -> &mut Block {
        &mut self.blocks[block.0]
    }

    pub fn branch(&self, branch: BranchRef) -> &Branch {
        &self.branches[branch.0]
    }

    pub fn branch_mut(&mut self, branch: BranchRef) -> &mut Branch {
        &mut self.branches[branch.0]
    }

    /// Look up a branch from an untrusted raw handle.
    pub fn checked_branch(&self, raw: u64) -> Option<BranchRef> {
        let idx = usize::try_from(raw).ok()?;
        (idx < self.branches.len()).then_some(BranchRef(idx))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    pub fn block_refs(&self) -> impl Iterator<Item = BlockRef> + '_ {
        (0..self.blocks.len()).map(BlockRef)
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.block_refs()
            .filter(|&b| self.blocks[b.0].status == BlockStatus::Live)
    }

    /// Record that target `idx` of `branch` now leads to `block`.
    pub fn link(&mut self, branch: BranchRef, idx: usize, block: BlockRef) {
        let start = self.blocks[block.0].start_addr;
        let br = &mut self.branches[branch.0];
        br.blocks[idx] = Some(block);
        br.dst_addrs[idx] = start;
        self.blocks[block.0].incoming.push(branch);
    }

    /// Unlink a block that failed to compile from every branch touching it.
    pub fn discard_block(&mut self, block: BlockRef) {
        let incoming = std::mem::take(&mut self.blocks[block.0].incoming);
        for branch in incoming {
            for target in self.branches[branch.0].blocks.iter_mut() {
                if *target == Some(block) {
                    *target = None;
                }
            }
        }

        let outgoing = self.blocks[block.0].outgoing.clone();
        for branch in outgoing {
            let targets = self.branches[branch.0].blocks;
            for succ in targets.into_iter().flatten() {
                self.blocks[succ.0].incoming.retain(|&b| b != branch);
            }
        }

        self.blocks[block.0].status = BlockStatus::Discarded;
    }

    pub fn invalidate_block(&mut self, block: BlockRef) {
        if self.blocks[block.0].status == BlockStatus::Live {
            self.blocks[block.0].status = BlockStatus::Invalidated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(idx: u32) -> BlockId {
        BlockId::new(IseqId(1), idx)
    }

    #[test]
    fn test_branch_links() {
        let mut graph = Graph::new();
        let a = graph.new_block(bid(0), Context::new());
        let b = graph.new_block(bid(4), Context::new());
        graph.block_mut(b).start_addr = Some(CodePtr::from_raw(0x1000));

        let br = graph.new_branch(a, Context::new(), BranchKind::Jump);
        graph.link(br, 0, b);

        assert_eq!(graph.block(a).outgoing, vec![br]);
        assert_eq!(graph.block(b).incoming, vec![br]);
        assert_eq!(graph.branch(br).dst_addrs[0], Some(CodePtr::from_raw(0x1000)));
        assert_eq!(graph.checked_branch(br.as_raw()), Some(br));
        assert_eq!(graph.checked_branch(99), None);
    }

    #[test]
    fn test_discard_unlinks_both_directions() {
        let mut graph = Graph::new();
        let a = graph.new_block(bid(0), Context::new());
        let b = graph.new_block(bid(2), Context::new());
        let c = graph.new_block(bid(4), Context::new());

        let into_b = graph.new_branch(a, Context::new(), BranchKind::Jump);
        graph.link(into_b, 0, b);
        let out_of_b = graph.new_branch(b, Context::new(), BranchKind::Jump);
        graph.link(out_of_b, 0, c);

        graph.discard_block(b);
        assert_eq!(graph.branch(into_b).blocks[0], None);
        assert!(graph.block(c).incoming.is_empty());
        assert_eq!(graph.block(b).status, BlockStatus::Discarded);
        assert_eq!(graph.live_blocks().count(), 2);
    }

    #[test]
    fn test_invalidate_keeps_code() {
        let mut graph = Graph::new();
        let a = graph.new_block(bid(0), Context::new());
        graph.block_mut(a).start_addr = Some(CodePtr::from_raw(0x2000));
        graph.invalidate_block(a);
        assert_eq!(graph.block(a).status, BlockStatus::Invalidated);
        assert_eq!(graph.block(a).start_addr, Some(CodePtr::from_raw(0x2000)));
        assert_eq!(graph.live_blocks().count(), 0);
    }
}
