//! Patch application.
//!
//! Execution is a straight walk of the opcode stream against a cursor into
//! the original image. Every validation failure is reported before the first
//! output byte where possible, and the constructed image is itself checked
//! before being returned.

use crate::header::PatchHeader;
use crate::opcode::{decode_body, Instruction};
use crate::PatchError;

/// Apply `patch` to `original`, producing the constructed image.
pub fn apply(original: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    let header = PatchHeader::parse(patch)?;
    let body = header.validated_body(patch)?;

    if original.len() as u32 != header.original.length {
        return Err(PatchError::OriginalLength {
            expected: header.original.length,
            found: original.len() as u32,
        });
    }
    let original_crc = crc32fast::hash(original);
    if original_crc != header.original.crc {
        return Err(PatchError::OriginalCrc {
            expected: header.original.crc,
            computed: original_crc,
        });
    }

    let instructions = decode_body(body, &header.write_cache)?;

    let mut constructed = Vec::with_capacity(header.constructed.length as usize);
    let mut cursor: u64 = 0;
    for instr in &instructions {
        execute(instr, original, &header.write_cache, &mut cursor, &mut constructed)?;
    }

    if constructed.len() as u32 != header.constructed.length {
        return Err(PatchError::ConstructedLength {
            expected: header.constructed.length,
            found: constructed.len() as u32,
        });
    }
    let constructed_crc = crc32fast::hash(&constructed);
    if constructed_crc != header.constructed.crc {
        return Err(PatchError::ConstructedCrc {
            expected: header.constructed.crc,
            computed: constructed_crc,
        });
    }

    Ok(constructed)
}

fn execute(
    instr: &Instruction,
    original: &[u8],
    cache: &[Vec<u8>],
    cursor: &mut u64,
    out: &mut Vec<u8>,
) -> Result<(), PatchError> {
    match instr {
        Instruction::Copy { length, .. } => {
            let start = *cursor as usize;
            let end = start
                .checked_add(*length as usize)
                .filter(|&e| e <= original.len())
                .ok_or(PatchError::CopyOutOfRange {
                    offset: *cursor,
                    length: *length,
                })?;
            out.extend_from_slice(&original[start..end]);
            *cursor += u64::from(*length);
        }
        Instruction::Write { data } => {
            out.extend_from_slice(data);
            *cursor += data.len() as u64;
        }
        Instruction::WriteCached { index, .. } => {
            // Index validity was established during decode.
            let entry = &cache[usize::from(*index)];
            out.extend_from_slice(entry);
            *cursor += entry.len() as u64;
        }
        Instruction::Addr { new, .. } => {
            *cursor = *new;
        }
        Instruction::Patch { operations } => {
            for op in operations {
                execute(op, original, cache, cursor, out)?;
            }
        }
    }
    Ok(())
}
