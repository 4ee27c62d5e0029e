// This module implements CodeBuffer, the append-only writer over one half of the executable
// region. Two buffers share a single mapping: the inline buffer receives hot sequential code and
// the outlined buffer receives side exits, stubs and rarely taken paths, so a 32-bit displacement
// always reaches between them. Writes go through the write cursor and never pass the buffer's
// write limit; when they would, the bytes are dropped and a sticky flag is raised so the caller
// can discard the block being compiled. Before a byte is stored the containing page is made
// writable (tracked per page to avoid redundant protection calls), and mark_all_executable flips
// the whole buffer back before anything may jump into it. Labels are declared, bound and
// referenced while a block is being emitted and resolved by link_labels, which refuses to write a
// displacement that is unresolved or does not fit. Previously emitted code is only ever changed
// through rewrite_at, which validates the target range against a floor (the frozen watermark)
// and the capacity before moving the cursor there.

//! Code buffers, labels and checked code patching.

pub mod arm64;
pub mod memory;
pub mod opnd;
pub mod x86_64;

use crate::core::error::{JitError, JitResult};
use memory::{ExecMemory, Protection};
use std::fmt;
use std::sync::Arc;

/// Absolute address of a byte inside a code buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePtr(usize);

impl CodePtr {
    pub const fn from_raw(addr: usize) -> Self {
        Self(addr)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn add_bytes(self, n: usize) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Debug for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePtr({:#x})", self.0)
    }
}

/// Handle of a label declared in a code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
struct LabelRef {
    /// Write position just after the referencing instruction.
    pos: usize,
    label: Label,
    /// Width of the displacement field, which ends at `pos`.
    num_bytes: usize,
}

/// Text attached to a write position, shown in disassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeComment {
    pub pos: usize,
    pub text: String,
}

/// Sentinel for "no page made writable yet"; never page aligned.
const NO_ALIGNED_POS: usize = 1;

/// Block of executable memory code is written into.
pub struct CodeBuffer {
    mem: Arc<dyn ExecMemory>,

    /// Offset of this buffer inside `mem`. Page aligned.
    region_offset: usize,

    /// Size of this buffer in bytes.
    mem_size: usize,

    /// Current writing position.
    write_pos: usize,

    /// Writes at or past this position are dropped. Equal to `mem_size` except during a rewrite.
    write_limit: usize,

    /// Offset in `mem` of the page last made writable.
    current_aligned_write_pos: usize,

    /// Set when a write, label or label reference could not be honoured.
    dropped_bytes: bool,

    label_addrs: Vec<Option<usize>>,
    label_names: Vec<String>,
    label_refs: Vec<LabelRef>,
    label_limit: usize,

    keep_comments: bool,
    comments: Vec<CodeComment>,
}

impl CodeBuffer {
    /// Create one buffer over the whole region.
    pub fn new(mem: Arc<dyn ExecMemory>, fill_byte: u8, label_limit: usize) -> JitResult<Self> {
        let size = mem.size();
        fill_region(mem.as_ref(), size, fill_byte)?;
        Ok(Self::with_region(mem, 0, size, label_limit, false))
    }

    /// Split the region into page aligned inline and outlined halves.
    pub fn new_split(
        mem: Arc<dyn ExecMemory>,
        fill_byte: u8,
        label_limit: usize,
        keep_comments: bool,
    ) -> JitResult<(Self, Self)> {
        let page_size = mem.page_size();
        let half = (mem.size() / 2) / page_size * page_size;
        if half == 0 {
            return Err(JitError::OutOfMemory {
                requested: mem.size(),
                reason: "region must span at least two pages".to_string(),
            });
        }

        fill_region(mem.as_ref(), 2 * half, fill_byte)?;

        let cb = Self::with_region(mem.clone(), 0, half, label_limit, keep_comments);
        let ocb = Self::with_region(mem, half, half, label_limit, keep_comments);
        Ok((cb, ocb))
    }

    fn with_region(
        mem: Arc<dyn ExecMemory>,
        region_offset: usize,
        mem_size: usize,
        label_limit: usize,
        keep_comments: bool,
    ) -> Self {
        Self {
            mem,
            region_offset,
            mem_size,
            write_pos: 0,
            write_limit: mem_size,
            current_aligned_write_pos: NO_ALIGNED_POS,
            dropped_bytes: false,
            label_addrs: Vec::new(),
            label_names: Vec::new(),
            label_refs: Vec::new(),
            label_limit,
            keep_comments,
            comments: Vec::new(),
        }
    }

    pub fn mem(&self) -> &Arc<dyn ExecMemory> {
        &self.mem
    }

    pub fn region_offset(&self) -> usize {
        self.region_offset
    }

    pub fn get_mem_size(&self) -> usize {
        self.mem_size
    }

    pub fn get_write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn has_dropped_bytes(&self) -> bool {
        self.dropped_bytes
    }

    /// True if `num_bytes` more bytes fit before the write limit.
    pub fn has_capacity(&self, num_bytes: usize) -> bool {
        self.write_pos + num_bytes <= self.write_limit
    }

    /// Set the current write position.
    pub fn set_pos(&mut self, pos: usize) {
        assert!(pos < self.mem_size, "write position {pos:#x} out of bounds");
        self.write_pos = pos;
    }

    /// Set the current write position from a pointer.
    pub fn set_write_ptr(&mut self, ptr: CodePtr) {
        match self.ptr_to_pos(ptr) {
            Some(pos) => self.set_pos(pos),
            None => panic!("{ptr:?} is outside of this code buffer"),
        }
    }

    /// Move the write position to `ptr` if at least one byte fits after it. Returns false, leaving
    /// the position alone, when `ptr` is at or past the end of the buffer.
    pub fn try_set_write_ptr(&mut self, ptr: CodePtr) -> bool {
        match self.ptr_to_pos(ptr) {
            Some(pos) if pos < self.write_limit => {
                self.write_pos = pos;
                true
            }
            _ => false,
        }
    }

    /// Align the write position to a multiple of `multiple` bytes.
    pub fn align_pos(&mut self, multiple: usize) {
        let addr = self.get_write_ptr().raw();
        let pad = (multiple - addr % multiple) % multiple;
        if self.write_pos + pad > self.write_limit {
            self.dropped_bytes = true;
            return;
        }
        self.write_pos += pad;
    }

    /// Pointer to the byte at `pos`, or None past the end of the buffer.
    pub fn get_ptr(&self, pos: usize) -> Option<CodePtr> {
        if pos >= self.mem_size {
            return None;
        }
        Some(CodePtr(self.mem.base_addr() + self.region_offset + pos))
    }

    pub fn get_write_ptr(&self) -> CodePtr {
        CodePtr(self.mem.base_addr() + self.region_offset + self.write_pos)
    }

    /// Write position of `ptr` if it lies inside this buffer.
    pub fn ptr_to_pos(&self, ptr: CodePtr) -> Option<usize> {
        let start = self.mem.base_addr() + self.region_offset;
        if ptr.0 < start || ptr.0 >= start + self.mem_size {
            return None;
        }
        Some(ptr.0 - start)
    }

    pub fn contains(&self, ptr: CodePtr) -> bool {
        self.ptr_to_pos(ptr).is_some()
    }

    /// Make the page containing `pos` writable unless it already is.
    pub fn mark_position_writeable(&mut self, pos: usize) {
        let page_size = self.mem.page_size();
        let aligned = (self.region_offset + pos) / page_size * page_size;
        if aligned == self.current_aligned_write_pos {
            return;
        }

        self.current_aligned_write_pos = aligned;
        if let Err(err) = self.mem.protect(aligned, page_size, Protection::ReadWrite) {
            log::error!("Could not make page {aligned:#x} writable: {err}");
            panic!("{err}");
        }
    }

    /// Make the whole buffer executable. Any later write reprotects its page first.
    pub fn mark_all_executable(&mut self) {
        self.current_aligned_write_pos = NO_ALIGNED_POS;
        if let Err(err) = self
            .mem
            .protect(self.region_offset, self.mem_size, Protection::ReadExec)
        {
            log::error!("Could not make code buffer executable: {err}");
            panic!("{err}");
        }
    }

    /// Make the whole buffer writable.
    pub fn mark_all_writeable(&mut self) {
        self.current_aligned_write_pos = NO_ALIGNED_POS;
        if let Err(err) = self
            .mem
            .protect(self.region_offset, self.mem_size, Protection::ReadWrite)
        {
            log::error!("Could not make code buffer writable: {err}");
            panic!("{err}");
        }
    }

    /// Write a single byte at the current position.
    pub fn write_byte(&mut self, byte: u8) {
        let pos = self.write_pos;
        if pos < self.write_limit {
            self.mark_position_writeable(pos);
            self.mem.write_byte(self.region_offset + pos, byte);
            self.write_pos += 1;
        } else {
            self.dropped_bytes = true;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }

    /// Write an integer over `num_bits` bits, little endian.
    pub fn write_int(&mut self, val: u64, num_bits: u8) {
        let bytes = val.to_le_bytes();
        match num_bits {
            8 | 16 | 32 | 64 => self.write_bytes(&bytes[..num_bits as usize / 8]),
            _ => panic!("encoding range violation: invalid immediate width {num_bits}"),
        }
    }

    /// Write a signed immediate that must fit in `num_bits` bits.
    pub fn write_imm(&mut self, val: i64, num_bits: u8) {
        if sig_imm_size(val) > num_bits {
            panic!("encoding range violation: {val} does not fit in {num_bits} bits");
        }
        self.write_int(val as u64, num_bits);
    }

    pub fn read_byte(&self, pos: usize) -> u8 {
        assert!(pos < self.mem_size);
        self.mem.read_byte(self.region_offset + pos)
    }

    pub fn read_bytes(&self, pos: usize, len: usize) -> Vec<u8> {
        assert!(pos + len <= self.mem_size);
        self.mem.read_bytes(self.region_offset + pos, len)
    }

    /// Attach a comment to the current write position.
    pub fn add_comment(&mut self, text: &str) {
        if !self.keep_comments {
            return;
        }
        let pos = self.write_pos;
        if let Some(last) = self.comments.last() {
            if last.pos == pos && last.text == text {
                return;
            }
        }
        self.comments.push(CodeComment {
            pos,
            text: text.to_string(),
        });
    }

    /// Comments attached to positions in `[start, end)`, ordered by position.
    pub fn comments_in(&self, start: usize, end: usize) -> Vec<&CodeComment> {
        let mut found: Vec<&CodeComment> = self
            .comments
            .iter()
            .filter(|c| c.pos >= start && c.pos < end)
            .collect();
        found.sort_by_key(|c| c.pos);
        found
    }

    /// Declare a new label. Past the label limit the buffer is flagged as failed.
    pub fn new_label(&mut self, name: &str) -> Label {
        if self.label_addrs.len() >= self.label_limit {
            log::warn!("Label limit of {} exceeded by {name}", self.label_limit);
            self.dropped_bytes = true;
        }
        self.label_addrs.push(None);
        self.label_names.push(name.to_string());
        Label(self.label_addrs.len() - 1)
    }

    /// Bind a label to the current write position.
    pub fn write_label(&mut self, label: Label) {
        self.label_addrs[label.0] = Some(self.write_pos);
    }

    /// Record that the `num_bytes` bytes just written hold a displacement to `label`,
    /// relative to the current position.
    pub fn label_ref(&mut self, label: Label, num_bytes: usize) {
        if self.label_refs.len() >= self.label_limit {
            self.dropped_bytes = true;
        }
        self.label_refs.push(LabelRef {
            pos: self.write_pos,
            label,
            num_bytes,
        });
    }

    /// Resolve every pending label reference, then forget all labels.
    pub fn link_labels(&mut self) {
        let orig_pos = self.write_pos;
        let refs = std::mem::take(&mut self.label_refs);

        if !self.dropped_bytes {
            for label_ref in refs {
                let Some(target) = self.label_addrs.get(label_ref.label.0).copied().flatten()
                else {
                    log::debug!(
                        "Unresolved label {}",
                        self.label_names[label_ref.label.0]
                    );
                    self.dropped_bytes = true;
                    continue;
                };

                let num_bits = (label_ref.num_bytes * 8) as u8;
                let disp = target as i64 - label_ref.pos as i64;
                if label_ref.pos < label_ref.num_bytes || sig_imm_size(disp) > num_bits {
                    self.dropped_bytes = true;
                    continue;
                }

                self.write_pos = label_ref.pos - label_ref.num_bytes;
                self.write_int(disp as u64, num_bits);
            }
        }

        self.write_pos = orig_pos;
        self.label_addrs.clear();
        self.label_names.clear();
    }

    /// Rewrite code starting at `start` with whatever `emit` writes, without going below `floor`
    /// or writing at or past `limit`. Returns the end position of the rewritten code.
    ///
    /// The cursor is left at the later of its old position and the end of the rewrite.
    pub fn rewrite_at(
        &mut self,
        start: usize,
        floor: usize,
        limit: usize,
        emit: impl FnOnce(&mut CodeBuffer),
    ) -> JitResult<usize> {
        if start < floor || start > self.write_pos || limit > self.mem_size || start > limit {
            return Err(JitError::PatchOutOfBounds { pos: start, limit });
        }

        let old_pos = self.write_pos;
        let old_limit = self.write_limit;
        let old_dropped = self.dropped_bytes;

        self.write_pos = start;
        self.write_limit = limit;
        self.dropped_bytes = false;

        emit(self);

        let end = self.write_pos;
        let overflowed = self.dropped_bytes;

        self.write_limit = old_limit;
        self.dropped_bytes = old_dropped;
        self.write_pos = old_pos.max(end);

        if overflowed {
            return Err(JitError::PatchOverflow { start, end, limit });
        }
        Ok(end)
    }
}

fn fill_region(mem: &dyn ExecMemory, len: usize, fill_byte: u8) -> JitResult<()> {
    mem.protect(0, len, Protection::ReadWrite)?;
    mem.fill(0, len, fill_byte);
    mem.protect(0, len, Protection::ReadExec)
}

/// Number of bits needed to encode a signed value.
pub fn sig_imm_size(imm: i64) -> u8 {
    if imm >= i8::MIN as i64 && imm <= i8::MAX as i64 {
        8
    } else if imm >= i16::MIN as i64 && imm <= i16::MAX as i64 {
        16
    } else if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
        32
    } else {
        64
    }
}

/// Number of bits needed to encode an unsigned value.
pub fn unsig_imm_size(imm: u64) -> u8 {
    if imm <= u8::MAX as u64 {
        8
    } else if imm <= u16::MAX as u64 {
        16
    } else if imm <= u32::MAX as u64 {
        32
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::memory::SimulatedMemory;
    use super::*;

    const PAGE: usize = SimulatedMemory::PAGE_SIZE;

    fn buffer(pages: usize) -> (Arc<SimulatedMemory>, CodeBuffer) {
        let sim = Arc::new(SimulatedMemory::new(pages * PAGE));
        let cb = CodeBuffer::new(sim.clone(), 0xCC, 8).unwrap();
        (sim, cb)
    }

    #[test]
    fn test_imm_sizes() {
        assert_eq!(sig_imm_size(0), 8);
        assert_eq!(sig_imm_size(-128), 8);
        assert_eq!(sig_imm_size(128), 16);
        assert_eq!(sig_imm_size(-32769), 32);
        assert_eq!(sig_imm_size(i64::MAX), 64);
        assert_eq!(unsig_imm_size(255), 8);
        assert_eq!(unsig_imm_size(256), 16);
        assert_eq!(unsig_imm_size(u32::MAX as u64 + 1), 64);
    }

    #[test]
    fn test_cursor_cannot_move_to_the_end() {
        let (_sim, mut cb) = buffer(1);
        let end = cb.get_mem_size();
        cb.write_bytes(&vec![0x90; end]);
        assert_eq!(cb.get_write_pos(), end);

        assert!(!cb.try_set_write_ptr(cb.get_write_ptr()));
        assert_eq!(cb.get_write_pos(), end);

        let back = cb.get_ptr(end - 1).unwrap();
        assert!(cb.try_set_write_ptr(back));
        assert_eq!(cb.get_write_pos(), end - 1);
    }

    #[test]
    fn test_fill_and_write() {
        let (sim, mut cb) = buffer(2);
        assert_eq!(cb.read_byte(100), 0xCC);
        cb.write_int(0x1234_5678, 32);
        assert_eq!(cb.read_bytes(0, 4), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(cb.get_write_pos(), 4);
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_dropped_bytes_at_capacity() {
        let (_sim, mut cb) = buffer(2);
        let size = cb.get_mem_size();
        cb.set_pos(size - 2);
        cb.write_int(u32::MAX as u64, 32);
        assert!(cb.has_dropped_bytes());
        assert_eq!(cb.get_write_pos(), size);
    }

    #[test]
    #[should_panic(expected = "encoding range violation")]
    fn test_write_imm_out_of_range() {
        let (_sim, mut cb) = buffer(2);
        cb.write_imm(300, 8);
    }

    #[test]
    fn test_page_protection_is_tracked() {
        let (sim, mut cb) = buffer(2);
        let base_calls = sim.protect_calls();
        cb.write_bytes(&[1, 2, 3, 4]);
        assert_eq!(sim.protect_calls(), base_calls + 1);

        cb.set_pos(PAGE);
        cb.write_byte(5);
        assert_eq!(sim.protect_calls(), base_calls + 2);

        cb.mark_all_executable();
        cb.write_byte(6);
        assert_eq!(sim.protect_calls(), base_calls + 4);
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_labels_link_forward_and_backward() {
        let (_sim, mut cb) = buffer(2);
        let top = cb.new_label("top");
        let done = cb.new_label("done");
        cb.write_label(top);
        cb.write_bytes(&[0xE9, 0, 0, 0, 0]);
        cb.label_ref(done, 4);
        cb.write_bytes(&[0xE9, 0, 0, 0, 0]);
        cb.label_ref(top, 4);
        cb.write_label(done);
        cb.link_labels();

        assert!(!cb.has_dropped_bytes());
        assert_eq!(cb.get_write_pos(), 10);
        assert_eq!(cb.read_bytes(1, 4), 5i32.to_le_bytes().to_vec());
        assert_eq!(cb.read_bytes(6, 4), (-10i32).to_le_bytes().to_vec());
    }

    #[test]
    fn test_unresolved_label_fails() {
        let (_sim, mut cb) = buffer(2);
        let nowhere = cb.new_label("nowhere");
        cb.write_bytes(&[0xEB, 0]);
        cb.label_ref(nowhere, 1);
        cb.link_labels();
        assert!(cb.has_dropped_bytes());
        assert_eq!(cb.read_byte(1), 0);
    }

    #[test]
    fn test_displacement_must_fit() {
        let (_sim, mut cb) = buffer(2);
        let far = cb.new_label("far");
        cb.write_bytes(&[0xEB, 0]);
        cb.label_ref(far, 1);
        cb.set_pos(1000);
        cb.write_label(far);
        cb.link_labels();
        assert!(cb.has_dropped_bytes());
    }

    #[test]
    fn test_label_limit() {
        let (_sim, mut cb) = buffer(2);
        for i in 0..8 {
            cb.new_label(&format!("l{i}"));
        }
        assert!(!cb.has_dropped_bytes());
        cb.new_label("one_too_many");
        assert!(cb.has_dropped_bytes());
    }

    #[test]
    fn test_rewrite_at_checks_bounds() {
        let (_sim, mut cb) = buffer(2);
        cb.write_bytes(&[0x90; 16]);

        let end = cb.rewrite_at(4, 0, cb.get_mem_size(), |cb| cb.write_bytes(&[1, 2]));
        assert_eq!(end, Ok(6));
        assert_eq!(cb.get_write_pos(), 16);
        assert_eq!(cb.read_bytes(4, 2), vec![1, 2]);

        assert!(matches!(
            cb.rewrite_at(2, 8, cb.get_mem_size(), |_| {}),
            Err(JitError::PatchOutOfBounds { .. })
        ));
        assert!(matches!(
            cb.rewrite_at(20, 0, cb.get_mem_size(), |_| {}),
            Err(JitError::PatchOutOfBounds { .. })
        ));

        let res = cb.rewrite_at(10, 0, 12, |cb| cb.write_bytes(&[7, 7, 7, 7]));
        assert!(matches!(res, Err(JitError::PatchOverflow { .. })));
        assert!(!cb.has_dropped_bytes());
        assert_eq!(cb.get_write_pos(), 16);
    }

    #[test]
    fn test_rewrite_at_end_moves_cursor() {
        let (_sim, mut cb) = buffer(2);
        cb.write_bytes(&[0x90; 4]);
        let end = cb.rewrite_at(4, 0, cb.get_mem_size(), |cb| cb.write_bytes(&[1; 5]));
        assert_eq!(end, Ok(9));
        assert_eq!(cb.get_write_pos(), 9);
    }

    #[test]
    fn test_split_buffers_share_region() {
        let sim = Arc::new(SimulatedMemory::new(8 * PAGE));
        let (cb, ocb) = CodeBuffer::new_split(sim.clone(), 0x1E, 8, true).unwrap();
        assert_eq!(cb.get_mem_size(), 4 * PAGE);
        assert_eq!(ocb.region_offset(), 4 * PAGE);
        assert_eq!(
            ocb.get_write_ptr().raw() - cb.get_write_ptr().raw(),
            4 * PAGE
        );
        assert!(!cb.contains(ocb.get_write_ptr()));
        assert_eq!(ocb.read_byte(0), 0x1E);
    }

    #[test]
    fn test_comments_deduplicated() {
        let sim = Arc::new(SimulatedMemory::new(4 * PAGE));
        let (mut cb, _ocb) = CodeBuffer::new_split(sim, 0x1E, 8, true).unwrap();
        cb.add_comment("guard");
        cb.add_comment("guard");
        cb.write_byte(0x90);
        cb.add_comment("guard");
        assert_eq!(cb.comments_in(0, 10).len(), 2);
    }
}
