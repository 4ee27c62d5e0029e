// This module implements the version tables of the block versioning engine. Every bytecode unit
// the JIT knows about is registered with its Iseq handle and gets a version map: for each
// instruction index, the list of block versions compiled for that block id, in the order they
// were added. Lookup walks that list and returns the compatible version with the smallest context
// distance, keeping the first one on ties so guard chains stay anchored on their first version.
// The version limit widens a requested context to a fully generic one (only the stack shape
// survives) when the next version would reach the configured maximum, which bounds the number of
// versions per block id; contexts inside a guard chain are exempt because chains enforce their
// own depth limit. Invalidation takes every version list at once and leaves the tables empty.

//! Per-unit tables of block versions.

use super::block::{BlockId, BlockRef, Graph};
use super::context::{Context, TypeDiff};
use crate::core::error::{JitError, JitResult};
use crate::host::{Iseq, IseqId};
use hashbrown::HashMap;
use std::sync::Arc;

struct IseqPayload {
    iseq: Arc<dyn Iseq>,

    /// Versions per instruction index.
    version_map: Vec<Vec<BlockRef>>,
}

/// Version tables for every registered unit.
#[derive(Default)]
pub struct VersionTable {
    units: HashMap<IseqId, IseqPayload>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a unit known to the JIT. Re-registering an id replaces its handle.
    pub fn register_iseq(&mut self, iseq: Arc<dyn Iseq>) {
        let id = iseq.id();
        match self.units.get_mut(&id) {
            Some(payload) => payload.iseq = iseq,
            None => {
                self.units.insert(
                    id,
                    IseqPayload {
                        iseq,
                        version_map: Vec::new(),
                    },
                );
            }
        }
    }

    pub fn iseq(&self, id: IseqId) -> JitResult<Arc<dyn Iseq>> {
        self.units
            .get(&id)
            .map(|payload| payload.iseq.clone())
            .ok_or(JitError::UnknownIseq(id.0))
    }

    pub fn get_num_versions(&self, blockid: BlockId) -> usize {
        self.units
            .get(&blockid.iseq)
            .and_then(|payload| payload.version_map.get(blockid.idx as usize))
            .map_or(0, Vec::len)
    }

    pub fn versions(&self, blockid: BlockId) -> &[BlockRef] {
        self.units
            .get(&blockid.iseq)
            .and_then(|payload| payload.version_map.get(blockid.idx as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First compatible version of `blockid` for `ctx`, in the order the versions were added.
    pub fn find_block_version(
        &self,
        graph: &Graph,
        blockid: BlockId,
        ctx: &Context,
        max_versions: usize,
        greedy_versioning: bool,
    ) -> Option<BlockRef> {
        let versions = self.versions(blockid);

        // Below the version limit, don't settle for an imperfect match
        let exact_only = greedy_versioning && versions.len() + 1 < max_versions;

        versions.iter().copied().find(|&blockref| {
            match ctx.diff(&graph.block(blockref).ctx) {
                TypeDiff::Compatible(0) => true,
                TypeDiff::Compatible(_) => !exact_only,
                TypeDiff::Incompatible => false,
            }
        })
    }

    /// Context to compile `blockid` with, widened when the version limit would be reached.
    /// Widening keeps the chain depth, so a guard chain still ends at its depth limit.
    ///
    /// Returns the context and whether it was widened.
    pub fn limit_block_versions(
        &self,
        blockid: BlockId,
        ctx: &Context,
        max_versions: usize,
    ) -> (Context, bool) {
        if self.get_num_versions(blockid) + 1 >= max_versions {
            let generic = ctx.generic();
            return (generic, generic != *ctx);
        }

        (*ctx, false)
    }

    /// Register a fully compiled block as a version of its block id.
    pub fn add_block_version(&mut self, graph: &Graph, blockref: BlockRef) -> JitResult<()> {
        let block = graph.block(blockref);
        let blockid = block.blockid;

        // Unit entry blocks start with an empty stack
        assert!(!(blockid.idx == 0 && block.ctx.get_stack_size() > 0));

        let payload = self
            .units
            .get_mut(&blockid.iseq)
            .ok_or(JitError::UnknownIseq(blockid.iseq.0))?;

        let idx = blockid.idx as usize;
        if idx >= payload.version_map.len() {
            payload.version_map.resize_with(idx + 1, Vec::new);
        }
        payload.version_map[idx].push(blockref);
        Ok(())
    }

    /// Unregister a block whose batch failed to compile.
    pub fn remove_block_version(&mut self, graph: &Graph, blockref: BlockRef) {
        let blockid = graph.block(blockref).blockid;
        if let Some(list) = self
            .units
            .get_mut(&blockid.iseq)
            .and_then(|payload| payload.version_map.get_mut(blockid.idx as usize))
        {
            list.retain(|&b| b != blockref);
        }
    }

    /// Drop every version list, returning the blocks that were registered.
    pub fn take_all(&mut self) -> Vec<BlockRef> {
        let mut blocks = Vec::new();
        for payload in self.units.values_mut() {
            for list in payload.version_map.drain(..) {
                blocks.extend(list);
            }
        }
        blocks
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// Registered units, ordered by id.
    pub fn iseqs(&self) -> Vec<Arc<dyn Iseq>> {
        let mut list: Vec<_> = self.units.values().map(|p| p.iseq.clone()).collect();
        list.sort_by_key(|iseq| iseq.id());
        list
    }
}
