// This module provides the JIT's diagnostic counters. JitStats holds compile-time counters that
// the engine bumps while holding the JIT lock: blocks and branches compiled, compilations that
// had to be discarded, branch stub hits, version-limit widenings and invalidation sweeps.
// RuntimeCounters holds counters that generated machine code increments directly with a locked
// add on their address (instructions executed in JIT code, side exits, returns to the
// interpreter, exits from failed stubs), so they live in a heap allocation with a stable
// address for the lifetime of the JIT. Both are exposed read-only through snapshots, and
// JitStats renders itself as a human readable report.

//! Compile-time and runtime statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the compiler itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JitStats {
    /// Blocks successfully compiled and registered as versions.
    pub compiled_block_count: usize,

    /// Branches emitted.
    pub compiled_branch_count: usize,

    /// Blocks discarded because a code buffer ran out of room.
    pub compilation_failure: usize,

    /// Calls into the branch stub handler.
    pub branch_stub_hits: usize,

    /// Times a requested context was widened by the version limit.
    pub version_limit_hits: usize,

    /// Global invalidation sweeps performed.
    pub invalidation_count: usize,

    /// Patch records applied across all sweeps.
    pub patches_applied: usize,

    /// Current frozen watermark of the inline buffer.
    pub frozen_bytes: usize,

    /// Bytes used in the inline buffer.
    pub inline_code_size: usize,

    /// Bytes used in the outlined buffer.
    pub outlined_code_size: usize,

    /// Snapshot of the counters bumped by generated code.
    pub runtime: RuntimeSnapshot,
}

/// Counters incremented by generated code.
#[derive(Debug, Default)]
#[repr(C)]
pub struct RuntimeCounters {
    pub exec_instruction: AtomicU64,
    pub side_exit: AtomicU64,
    pub leave_interp_return: AtomicU64,
    pub exit_from_branch_stub: AtomicU64,
}

/// Names a runtime counter so code generators can take its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ExecInstruction,
    SideExit,
    LeaveInterpReturn,
    ExitFromBranchStub,
}

/// Plain copy of the runtime counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub exec_instruction: u64,
    pub side_exit: u64,
    pub leave_interp_return: u64,
    pub exit_from_branch_stub: u64,
}

impl RuntimeCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ExecInstruction => &self.exec_instruction,
            Counter::SideExit => &self.side_exit,
            Counter::LeaveInterpReturn => &self.leave_interp_return,
            Counter::ExitFromBranchStub => &self.exit_from_branch_stub,
        }
    }

    /// Address generated code adds to.
    pub fn addr(&self, counter: Counter) -> u64 {
        self.slot(counter) as *const AtomicU64 as u64
    }

    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            exec_instruction: self.exec_instruction.load(Ordering::Relaxed),
            side_exit: self.side_exit.load(Ordering::Relaxed),
            leave_interp_return: self.leave_interp_return.load(Ordering::Relaxed),
            exit_from_branch_stub: self.exit_from_branch_stub.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for JitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JIT Statistics:")?;
        writeln!(f, "  Compiled blocks: {}", self.compiled_block_count)?;
        writeln!(f, "  Compiled branches: {}", self.compiled_branch_count)?;
        writeln!(f, "  Compilation failures: {}", self.compilation_failure)?;
        writeln!(f, "  Branch stub hits: {}", self.branch_stub_hits)?;
        writeln!(f, "  Version limit hits: {}", self.version_limit_hits)?;
        writeln!(f, "  Invalidations: {}", self.invalidation_count)?;
        writeln!(f, "  Patches applied: {}", self.patches_applied)?;
        writeln!(f, "  Frozen bytes: {}", self.frozen_bytes)?;
        writeln!(f, "  Inline code size: {} bytes", self.inline_code_size)?;
        writeln!(f, "  Outlined code size: {} bytes", self.outlined_code_size)?;

        let rt = &self.runtime;
        if rt.exec_instruction + rt.side_exit + rt.leave_interp_return + rt.exit_from_branch_stub > 0
        {
            writeln!(f, "  Runtime counters:")?;
            writeln!(f, "    exec_instruction: {}", rt.exec_instruction)?;
            writeln!(f, "    side_exit: {}", rt.side_exit)?;
            writeln!(f, "    leave_interp_return: {}", rt.leave_interp_return)?;
            writeln!(f, "    exit_from_branch_stub: {}", rt.exit_from_branch_stub)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_counter_addresses() {
        let counters = Box::new(RuntimeCounters::default());
        let a = counters.addr(Counter::ExecInstruction);
        let b = counters.addr(Counter::SideExit);
        assert_eq!(b - a, 8);

        counters.incr(Counter::SideExit);
        counters.incr(Counter::SideExit);
        assert_eq!(counters.snapshot().side_exit, 2);
        assert_eq!(counters.snapshot().exec_instruction, 0);
    }

    #[test]
    fn test_stats_display() {
        let stats = JitStats {
            compiled_block_count: 3,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("Compiled blocks: 3"));
        assert!(!text.contains("Runtime counters"));
    }
}
