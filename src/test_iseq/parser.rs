// This module reads the textual bytecode listing accepted by TestIseq. A listing holds one or more
// units; each starts with a header line `iseq <id> <name>` and continues with one instruction per
// line, optionally preceded by `label:` lines. `locals <n>` sets the size of the unit's local
// table. Operands are decimal or 0x-prefixed hexadecimal numbers. The operand of putobject also
// accepts nil, true and false, and a decimal operand there is encoded as a fixnum while a
// hexadecimal one is taken as a raw tagged word. Branch operands name a label and are stored as
// the offset from the end of the branch instruction, the way the interpreter encodes them. A
// `cache <value>` suffix fills the inline cache of the instruction it follows. `#` starts a
// comment. Parsing is two passes: the first lays out instruction indices and label positions and
// the second resolves operands.

//! Parser for textual bytecode listings.

use super::TestIseq;
use crate::bytecode::Opcode;
use crate::host::{IseqId, Value};
use hashbrown::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected `iseq <id> <name>` before any instruction")]
    MissingHeader { line: usize },

    #[error("line {line}: unknown opcode `{name}`")]
    UnknownOpcode { line: usize, name: String },

    #[error("line {line}: `{opcode}` takes {expected} operand(s), got {got}")]
    OperandCount {
        line: usize,
        opcode: &'static str,
        expected: u32,
        got: usize,
    },

    #[error("line {line}: invalid operand `{text}`")]
    InvalidOperand { line: usize, text: String },

    #[error("line {line}: unknown label `{label}`")]
    UnknownLabel { line: usize, label: String },

    #[error("line {line}: label `{label}` defined twice")]
    DuplicateLabel { line: usize, label: String },

    #[error("listing holds {0} units, expected exactly one")]
    UnitCount(usize),
}

struct PendingInsn<'a> {
    line: usize,
    idx: u32,
    opcode: Opcode,
    operands: Vec<&'a str>,
    cache: Option<&'a str>,
}

#[derive(Default)]
struct PendingUnit<'a> {
    id: u32,
    name: String,
    locals: u32,
    insns: Vec<PendingInsn<'a>>,
    labels: HashMap<&'a str, u32>,
    next_idx: u32,
}

/// Parse every unit of a listing.
pub fn parse_units(src: &str) -> Result<Vec<TestIseq>, ParseError> {
    let mut units: Vec<PendingUnit<'_>> = Vec::new();

    for (line_no, raw_line) in src.lines().enumerate() {
        let line = line_no + 1;
        let text = raw_line.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        let mut words = text.split_whitespace();
        let Some(first) = words.next() else {
            continue;
        };

        if first == "iseq" {
            let id = words
                .next()
                .ok_or(ParseError::MissingHeader { line })
                .and_then(|w| parse_number(w, line))?;
            let name = words.next().unwrap_or("unnamed").to_string();
            units.push(PendingUnit {
                id: id as u32,
                name,
                ..PendingUnit::default()
            });
            continue;
        }

        let Some(unit) = units.last_mut() else {
            return Err(ParseError::MissingHeader { line });
        };

        if let Some(label) = first.strip_suffix(':') {
            if unit.labels.insert(label, unit.next_idx).is_some() {
                return Err(ParseError::DuplicateLabel {
                    line,
                    label: label.to_string(),
                });
            }
            continue;
        }

        if first == "locals" {
            let count = words.next().unwrap_or("");
            unit.locals = parse_number(count, line)? as u32;
            continue;
        }

        let opcode = Opcode::from_name(first).ok_or_else(|| ParseError::UnknownOpcode {
            line,
            name: first.to_string(),
        })?;

        let mut operands: Vec<&str> = words.collect();
        let mut cache = None;
        if let Some(pos) = operands.iter().position(|&w| w == "cache") {
            cache = operands.get(pos + 1).copied();
            if cache.is_none() {
                return Err(ParseError::InvalidOperand {
                    line,
                    text: "cache".to_string(),
                });
            }
            operands.truncate(pos);
        }

        if operands.len() != opcode.num_operands() as usize {
            return Err(ParseError::OperandCount {
                line,
                opcode: opcode.name(),
                expected: opcode.num_operands(),
                got: operands.len(),
            });
        }

        unit.insns.push(PendingInsn {
            line,
            idx: unit.next_idx,
            opcode,
            operands,
            cache,
        });
        unit.next_idx += opcode.len();
    }

    units.into_iter().map(resolve_unit).collect()
}

fn resolve_unit(unit: PendingUnit<'_>) -> Result<TestIseq, ParseError> {
    let mut iseq = TestIseq::new(IseqId(unit.id), &unit.name, unit.locals);

    for insn in &unit.insns {
        let mut operands = Vec::with_capacity(insn.operands.len());
        for (n, &text) in insn.operands.iter().enumerate() {
            let jumps = insn.opcode.is_branch() || insn.opcode == Opcode::OptGetinlinecache;
            let value = if n == 0 && jumps {
                branch_offset(&unit, insn, text)?
            } else if insn.opcode == Opcode::Putobject {
                parse_value(text, insn.line)?.as_u64()
            } else {
                parse_number(text, insn.line)?
            };
            operands.push(value);
        }

        let cache = insn
            .cache
            .map(|text| parse_value(text, insn.line))
            .transpose()?;

        iseq.push_insn(insn.opcode, &operands);
        if let Some(value) = cache {
            iseq.set_inline_cache(insn.idx, Some(value));
        }
    }

    Ok(iseq)
}

/// Offset of a label from the end of the instruction referencing it.
fn branch_offset(unit: &PendingUnit<'_>, insn: &PendingInsn<'_>, text: &str) -> Result<u64, ParseError> {
    let target = *unit
        .labels
        .get(text)
        .ok_or_else(|| ParseError::UnknownLabel {
            line: insn.line,
            label: text.to_string(),
        })?;
    let next = insn.idx + insn.opcode.len();
    Ok((target as i64 - next as i64) as u64)
}

fn parse_value(text: &str, line: usize) -> Result<Value, ParseError> {
    match text {
        "nil" => Ok(Value::NIL),
        "true" => Ok(Value::TRUE),
        "false" => Ok(Value::FALSE),
        _ if text.starts_with("0x") => parse_number(text, line).map(Value),
        _ => text
            .parse::<i64>()
            .map(Value::fixnum)
            .map_err(|_| ParseError::InvalidOperand {
                line,
                text: text.to_string(),
            }),
    }
}

fn parse_number(text: &str, line: usize) -> Result<u64, ParseError> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text
            .parse::<u64>()
            .ok()
            .or_else(|| text.parse::<i64>().ok().map(|n| n as u64)),
    };
    parsed.ok_or_else(|| ParseError::InvalidOperand {
        line,
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Iseq;

    #[test]
    fn test_branch_offsets_are_relative_to_next_insn() {
        let units = parse_units(
            "iseq 3 loop\nhead:\n  putnil\n  branchif head\n  jump tail\ntail:\n  leave\n",
        )
        .unwrap();
        let iseq = &units[0];
        assert_eq!(iseq.size(), 6);
        assert_eq!(iseq.opcode_at(1), Opcode::Branchif);
        assert_eq!(iseq.operand(1, 0) as i64, -3);
        assert_eq!(iseq.operand(3, 0) as i64, 0);
        assert_eq!(iseq.opcode_at(5), Opcode::Leave);
    }

    #[test]
    fn test_putobject_operands() {
        let units =
            parse_units("iseq 1 m\n  putobject 5\n  putobject 0x30\n  putobject nil\n").unwrap();
        let iseq = &units[0];
        assert_eq!(Value(iseq.operand(0, 0)), Value::fixnum(5));
        assert_eq!(iseq.operand(2, 0), 0x30);
        assert_eq!(Value(iseq.operand(4, 0)), Value::NIL);
    }

    #[test]
    fn test_inline_cache_and_locals() {
        let units = parse_units(
            "iseq 1 m\n  locals 3\n  opt_getinlinecache done 0 cache 9\n  putnil\ndone:\n  leave\n",
        )
        .unwrap();
        let iseq = &units[0];
        assert_eq!(iseq.local_table_size(), 3);
        assert_eq!(iseq.inline_cache_value(0), Some(Value::fixnum(9)));
        assert_eq!(iseq.operand(0, 0), 1);
    }

    #[test]
    fn test_multiple_units() {
        let units = parse_units("iseq 1 a\n  leave\niseq 2 b\n  nop\n  leave\n").unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].id(), IseqId(2));
        assert_eq!(units[1].size(), 2);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse_units("  nop\n").unwrap_err(),
            ParseError::MissingHeader { line: 1 }
        );
        assert!(matches!(
            parse_units("iseq 1 m\n  frobnicate\n"),
            Err(ParseError::UnknownOpcode { line: 2, .. })
        ));
        assert!(matches!(
            parse_units("iseq 1 m\n  jump nowhere\n"),
            Err(ParseError::UnknownLabel { line: 2, .. })
        ));
        assert!(matches!(
            parse_units("iseq 1 m\n  putobject\n"),
            Err(ParseError::OperandCount { expected: 1, got: 0, .. })
        ));
    }
}
