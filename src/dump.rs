// This module renders generated code for humans and for external tools. disasm decodes a range of
// a code buffer, with iced-x86's NASM formatter on x86-64 and as raw instruction words on
// AArch64, and prints code comments recorded at each position above the instruction they
// describe. write_object packs both code buffers into the .text section of an ELF relocatable
// built with object::write, the inline buffer first and the outlined buffer after it, and
// defines one text symbol per live block version plus symbols for the shared exits, so the code
// can be inspected with objdump or loaded into a debugger. Addresses in the object are section
// offsets; relative branches between the two buffers are not relocated.

//! Disassembly and object file dumps of generated code.

use crate::asm::CodeBuffer;
use crate::bbv::{BlockId, BlockRef};
use crate::codegen::JitCore;
use crate::core::error::{JitError, JitResult};
use crate::core::options::TargetArch;
use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};
use std::fmt::Write;

/// Disassemble `[start, end)` of `cb`.
pub fn disasm(cb: &CodeBuffer, arch: TargetArch, start: usize, end: usize) -> String {
    let mut out = String::new();
    if end <= start {
        return out;
    }

    let comments = cb.comments_in(start, end);
    let mut comments = comments.iter().peekable();
    let mut emit_comments = |out: &mut String, pos: usize| {
        while let Some(comment) = comments.next_if(|c| c.pos <= pos) {
            let _ = writeln!(out, "  ; {}", comment.text);
        }
    };

    let bytes = cb.read_bytes(start, end - start);
    let ip = cb.get_ptr(start).map_or(start as u64, |ptr| ptr.as_u64());

    match arch {
        TargetArch::X86_64 => {
            let mut decoder = Decoder::with_ip(64, &bytes, ip, DecoderOptions::NONE);
            let mut formatter = NasmFormatter::new();
            formatter.options_mut().set_first_operand_char_index(8);

            let mut insn = Instruction::default();
            let mut text = String::new();
            while decoder.can_decode() {
                decoder.decode_out(&mut insn);
                let pos = start + (insn.ip() - ip) as usize;
                emit_comments(&mut out, pos);

                text.clear();
                formatter.format(&insn, &mut text);
                let _ = writeln!(out, "  {:#x}: {text}", insn.ip());
            }
        }
        TargetArch::Arm64 => {
            for (i, word) in bytes.chunks_exact(4).enumerate() {
                let pos = start + i * 4;
                emit_comments(&mut out, pos);
                let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                let _ = writeln!(out, "  {:#x}: {word:08x}", ip + (i * 4) as u64);
            }
        }
    }

    out
}

/// Disassemble one block version.
pub fn disasm_block(core: &JitCore, block: BlockRef) -> String {
    let b = core.graph().block(block);
    let cb = core.cb();
    let range = b
        .start_addr
        .zip(b.end_addr)
        .and_then(|(start, end)| Some((cb.ptr_to_pos(start)?, cb.ptr_to_pos(end)?)));

    match range {
        Some((start, end)) => format!(
            "block {:?} ({} bytes):\n{}",
            b.blockid,
            end - start,
            disasm(cb, core.backend().arch(), start, end)
        ),
        None => format!("block {:?} has no code\n", b.blockid),
    }
}

/// Build an ELF relocatable holding all generated code.
pub fn write_object(core: &JitCore) -> JitResult<Vec<u8>> {
    let arch = core.backend().arch();
    let architecture = match arch {
        TargetArch::X86_64 => Architecture::X86_64,
        TargetArch::Arm64 => Architecture::Aarch64,
    };

    let mut obj = Object::new(BinaryFormat::Elf, architecture, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);

    let cb = core.cb();
    let ocb = core.ocb();
    let inline_offset = obj.append_section_data(text, &cb.read_bytes(0, cb.get_write_pos()), 64);
    let outlined_offset =
        obj.append_section_data(text, &ocb.read_bytes(0, ocb.get_write_pos()), 64);

    let add_text_symbol = |obj: &mut Object<'_>, name: String, value: u64, size: u64| {
        obj.add_symbol(Symbol {
            name: name.into_bytes(),
            value,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    };

    let mut versions: HashMap<BlockId, usize> = HashMap::new();
    for block in core.graph().live_blocks() {
        let b = core.graph().block(block);
        let (Some(start), Some(end)) = (b.start_addr, b.end_addr) else {
            continue;
        };
        let (Some(start_pos), Some(end_pos)) = (cb.ptr_to_pos(start), cb.ptr_to_pos(end)) else {
            continue;
        };

        let n = versions.entry(b.blockid).or_insert(0);
        let name = format!("bbjit_{}_{}_{}", b.blockid.iseq, b.blockid.idx, n);
        *n += 1;

        add_text_symbol(
            &mut obj,
            name,
            inline_offset + start_pos as u64,
            (end_pos - start_pos) as u64,
        );
    }

    for (name, ptr) in [
        ("bbjit_leave_exit", core.leave_exit()),
        ("bbjit_exit_from_stub", core.exit_from_stub()),
    ] {
        if let Some(pos) = ocb.ptr_to_pos(ptr) {
            add_text_symbol(&mut obj, name.to_string(), outlined_offset + pos as u64, 0);
        }
    }

    obj.write().map_err(|err| JitError::ObjectWrite(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::memory::SimulatedMemory;
    use crate::asm::x86_64::{nop, ret};
    use std::sync::Arc;

    #[test]
    fn test_disasm_interleaves_comments() {
        let sim = Arc::new(SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE));
        let (mut cb, _) = CodeBuffer::new_split(sim, 0x1E, 8, true).unwrap();
        cb.add_comment("padding");
        nop(&mut cb);
        cb.add_comment("done");
        ret(&mut cb);

        let text = disasm(&cb, TargetArch::X86_64, 0, cb.get_write_pos());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("; padding"));
        assert!(lines[1].ends_with("nop"));
        assert!(lines[2].contains("; done"));
        assert!(lines[3].ends_with("ret"));
    }

    #[test]
    fn test_empty_range() {
        let sim = Arc::new(SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE));
        let (cb, _) = CodeBuffer::new_split(sim, 0x1E, 8, false).unwrap();
        assert_eq!(disasm(&cb, TargetArch::Arm64, 0, 0), "");
    }
}
