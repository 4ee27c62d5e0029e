// This module keeps the state of the invalidation protocol: the append-only list of patch
// records and the frozen watermark of the inline buffer. A patch record pairs an instruction
// boundary in inline code with an exit in outlined code that resumes the interpreter at that
// boundary; a sweep rewrites each recorded boundary into an unconditional jump to its exit. Code
// below the frozen watermark may still be running in another execution context, so it is never
// written again: records that lie below the watermark were already applied by an earlier sweep
// and are skipped, which makes a sweep with no new code a no-op. The actual rewriting goes
// through CodeBuffer::rewrite_at with the watermark as its floor, and the backend supplies the
// jump encoding.

//! Patch records and the frozen watermark for global invalidation.

use crate::asm::{CodeBuffer, CodePtr};
use crate::core::error::JitResult;

/// Inline boundary that can be rerouted to an outlined exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    pub inline_patch_pos: usize,
    pub outlined_target_pos: usize,
}

/// Patch records and frozen watermark.
#[derive(Debug, Default)]
pub struct InvalidationState {
    patches: Vec<PatchRecord>,
    frozen_bytes: usize,
}

impl InvalidationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the current inline position may later jump to `outlined_target_pos`.
    pub fn record_patch(&mut self, cb: &CodeBuffer, outlined_target_pos: usize) {
        self.patches.push(PatchRecord {
            inline_patch_pos: cb.get_write_pos(),
            outlined_target_pos,
        });
    }

    pub fn patches(&self) -> &[PatchRecord] {
        &self.patches
    }

    pub fn frozen_bytes(&self) -> usize {
        self.frozen_bytes
    }

    /// Rewrite every patch point at or above the watermark into a jump to its exit.
    ///
    /// Returns the number of patches applied and the inline position just past the last
    /// rewritten byte (or the old write position if that is further).
    pub fn apply(
        &self,
        cb: &mut CodeBuffer,
        ocb: &CodeBuffer,
        gen_jump: impl Fn(&mut CodeBuffer, CodePtr),
    ) -> JitResult<(usize, usize)> {
        let mut applied = 0;
        let mut last_patch_end = self.frozen_bytes;
        let limit = cb.get_mem_size();

        for patch in &self.patches {
            if patch.inline_patch_pos < self.frozen_bytes {
                continue;
            }

            let Some(target) = ocb.get_ptr(patch.outlined_target_pos) else {
                log::error!("Patch target {:#x} out of range", patch.outlined_target_pos);
                continue;
            };

            assert!(
                last_patch_end <= patch.inline_patch_pos,
                "patches should not overlap: {:#x} starts before {last_patch_end:#x}",
                patch.inline_patch_pos
            );

            last_patch_end = cb.rewrite_at(patch.inline_patch_pos, self.frozen_bytes, limit, |cb| {
                gen_jump(cb, target)
            })?;
            applied += 1;
        }

        Ok((applied, cb.get_write_pos()))
    }

    /// Move the watermark up to `pos`. The watermark never moves down.
    pub fn freeze(&mut self, pos: usize) {
        assert!(
            self.frozen_bytes <= pos,
            "frozen bytes should increase monotonically"
        );
        self.frozen_bytes = pos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::memory::SimulatedMemory;
    use std::sync::Arc;

    fn buffers() -> (CodeBuffer, CodeBuffer) {
        let sim = Arc::new(SimulatedMemory::new(4 * SimulatedMemory::PAGE_SIZE));
        CodeBuffer::new_split(sim, 0x1E, 8, false).unwrap()
    }

    fn marker_jump(cb: &mut CodeBuffer, target: CodePtr) {
        cb.write_byte(0xE9);
        cb.write_int(target.as_u64() & 0xFFFF_FFFF, 32);
    }

    #[test]
    fn test_apply_then_freeze() {
        let (mut cb, mut ocb) = buffers();
        let mut state = InvalidationState::new();

        cb.write_bytes(&[0x90; 8]);
        ocb.write_bytes(&[0xCC; 4]);
        state.record_patch(&cb, 2);
        cb.write_bytes(&[0x90; 8]);

        let (applied, end) = state.apply(&mut cb, &ocb, marker_jump).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(end, 16);
        assert_eq!(cb.read_byte(8), 0xE9);
        let target = ocb.get_ptr(2).unwrap().as_u64() as u32;
        assert_eq!(cb.read_bytes(9, 4), target.to_le_bytes().to_vec());

        state.freeze(end);
        let (applied, _) = state.apply(&mut cb, &ocb, marker_jump).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    #[should_panic(expected = "patches should not overlap")]
    fn test_boundaries_too_close_for_a_jump() {
        let (mut cb, mut ocb) = buffers();
        let mut state = InvalidationState::new();

        ocb.write_bytes(&[0xCC; 8]);
        cb.write_bytes(&[0x90; 4]);
        state.record_patch(&cb, 0);
        cb.write_bytes(&[0x90; 2]);
        state.record_patch(&cb, 4);
        cb.write_bytes(&[0x90; 8]);

        let _ = state.apply(&mut cb, &ocb, marker_jump);
    }

    #[test]
    #[should_panic(expected = "monotonically")]
    fn test_freeze_is_monotonic() {
        let mut state = InvalidationState::new();
        state.freeze(10);
        state.freeze(4);
    }
}
