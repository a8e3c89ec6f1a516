//! Patch inspection for tooling.

use std::collections::BTreeMap;
use std::fmt;

use crate::header::{ArrayValidation, PatchHeader};
use crate::opcode::{decode_body, Instruction};
use crate::PatchError;

/// Decoded view of a patch file: metadata, cache and instruction list.
#[derive(Debug, Clone)]
pub struct PatchSummary {
    pub original: ArrayValidation,
    pub constructed: ArrayValidation,
    pub body: ArrayValidation,
    pub write_cache: Vec<Vec<u8>>,
    pub instructions: Vec<Instruction>,
}

/// Validate and decode a patch without applying it.
pub fn inspect(patch: &[u8]) -> Result<PatchSummary, PatchError> {
    let header = PatchHeader::parse(patch)?;
    let body = header.validated_body(patch)?;
    let instructions = decode_body(body, &header.write_cache)?;
    Ok(PatchSummary {
        original: header.original,
        constructed: header.constructed,
        body: header.body,
        write_cache: header.write_cache,
        instructions,
    })
}

impl PatchSummary {
    /// Instruction counts by opcode family.
    pub fn instruction_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for instr in &self.instructions {
            *counts.entry(family(instr)).or_insert(0) += 1;
        }
        counts
    }

    /// Total literal bytes carried by the patch (writes plus cache entries).
    pub fn write_bytes(&self) -> usize {
        let mut total: usize = self.write_cache.iter().map(Vec::len).sum();
        for instr in &self.instructions {
            total += instr_write_bytes(instr);
        }
        total
    }

    /// True if any instruction (or macro member) matches `pred`.
    pub fn any_instruction(&self, pred: impl Fn(&Instruction) -> bool + Copy) -> bool {
        self.instructions.iter().any(|instr| {
            if pred(instr) {
                return true;
            }
            match instr {
                Instruction::Patch { operations } => operations.iter().any(pred),
                _ => false,
            }
        })
    }
}

fn instr_write_bytes(instr: &Instruction) -> usize {
    match instr {
        Instruction::Write { data } => data.len(),
        Instruction::Patch { operations } => operations.iter().map(instr_write_bytes).sum(),
        _ => 0,
    }
}

fn family(instr: &Instruction) -> &'static str {
    match instr {
        Instruction::Copy { .. } => "COPY",
        Instruction::Write { .. } => "WRITE",
        Instruction::WriteCached { .. } => "WRITE_CACHED",
        Instruction::Addr { old, new } => match *new as i64 - *old as i64 {
            -32_768..=32_767 => "ADDR_SHIFT",
            _ => "ADDR_SET",
        },
        Instruction::Patch { .. } => "PATCH",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Copy { length, .. } => write!(f, " COPY: {length:6} bytes"),
            Instruction::Write { data } => {
                if data.len() < 64 {
                    write!(f, "WRITE: {:6} bytes ({})", data.len(), hex(data))
                } else {
                    write!(f, "WRITE: {:6} bytes ({}...)", data.len(), hex(&data[..64]))
                }
            }
            Instruction::WriteCached { index, length } => {
                write!(f, "WRITE: Cache index {index} ({length} bytes)")
            }
            Instruction::Addr { old, new } => {
                let shift = *new as i64 - *old as i64;
                if (-32_768..=32_767).contains(&shift) {
                    write!(f, " ADDR: shifting {shift} (from {old:08x} to {new:08x})")
                } else {
                    write!(f, " ADDR: now {new:08x} (shift of {shift})")
                }
            }
            Instruction::Patch { operations } => {
                write!(f, "PATCH:")?;
                for op in operations {
                    write!(f, "\n\t{op}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Original File: {:6} bytes", self.original.length)?;
        writeln!(f, "     New File: {:6} bytes", self.constructed.length)?;
        writeln!(
            f,
            "   Patch File: {:6} bytes ({:5} instructions)",
            self.body.length,
            self.instructions.len()
        )?;
        writeln!(f)?;
        writeln!(f, "Write Cache:")?;
        for (idx, entry) in self.write_cache.iter().enumerate() {
            writeln!(f, "\t{idx:2}: {}", hex(entry))?;
        }
        writeln!(f)?;
        writeln!(f, "Instruction Count:")?;
        for (name, count) in self.instruction_counts() {
            writeln!(f, "{name:>16}: {count}")?;
        }
        writeln!(f)?;
        writeln!(f, "Instruction List:")?;
        for instr in &self.instructions {
            writeln!(f, "{instr}")?;
        }
        Ok(())
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
