//! Patch generation.
//!
//! Quality target is "good enough", not optimal: a candidate diff is built
//! from n-gram matches for several window sizes, cleaned up (pointless
//! jumps, repeated literals, macro folding, write cracking), and the
//! shortest encoding wins. The generated patch is re-applied before being
//! returned; a mismatch is a hard error, never a silent bad patch.

use std::collections::HashMap;

use crate::header::{ArrayValidation, PatchHeader, CACHE_MAX_ENTRIES, CACHE_REGION};
use crate::opcode::Instruction;
use crate::{apply, PatchError};

/// Generate a patch transforming `original` into `new`.
pub fn generate(original: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut best: Option<(Vec<Instruction>, Vec<Vec<u8>>, usize)> = None;

    // Candidate n-gram lengths; the shortest total encoding wins.
    for hash_len in 4..=7 {
        let instructions = naive_diff(original, new, hash_len);
        let instructions = cleanup_jumps(original, instructions);
        let (write_cache, instructions) = common_writes(instructions);
        let instructions = merge_operations(instructions);
        let instructions = merge_crack(original, instructions);

        let encoded: usize = instructions.iter().map(Instruction::encoded_len).sum();
        if best.as_ref().map_or(true, |(_, _, len)| encoded < *len) {
            best = Some((instructions, write_cache, encoded));
        }
    }

    let (instructions, write_cache, _) = best.expect("at least one candidate");

    let mut body = Vec::new();
    for instr in &instructions {
        instr.encode(&mut body);
    }

    let header = PatchHeader {
        original: ArrayValidation::of(original),
        constructed: ArrayValidation::of(new),
        body: ArrayValidation::of(&body),
        write_cache,
    };
    let mut patch = header.to_wire()?.to_vec();
    patch.extend_from_slice(&body);

    // Required self check: the patch must reproduce `new` bit for bit.
    match apply(original, &patch) {
        Ok(constructed) if constructed == new => {
            tracing::debug!(
                original = original.len(),
                new = new.len(),
                patch = patch.len(),
                instructions = instructions.len(),
                "Patch generated"
            );
            Ok(patch)
        }
        _ => Err(PatchError::SelfCheckFailed),
    }
}

/// Greedy n-gram candidate diff.
///
/// Every window of `hash_len` bytes in `old` is indexed; `new` is scanned
/// left to right, extending matches both at the current cursor and at every
/// candidate location, switching source position only for a match at least
/// 8 bytes better than staying put.
fn naive_diff(old: &[u8], new: &[u8], hash_len: usize) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut old_offset: usize = 0;
    let mut new_offset: usize = 0;
    let mut write_start: usize = 0;
    let mut write_pending: usize = 0;

    let mut pre_hash: HashMap<&[u8], Vec<usize>> = HashMap::new();
    let mut prev_val: Option<&[u8]> = None;
    for offset in 0..old.len().saturating_sub(hash_len) {
        let val = &old[offset..offset + hash_len];
        // Collapse runs of the same window (long fills index once).
        if prev_val == Some(val) {
            continue;
        }
        pre_hash.entry(val).or_default().push(offset);
        prev_val = Some(val);
    }

    let match_len = |new_at: usize, old_at: usize| -> usize {
        new[new_at..]
            .iter()
            .zip(&old[old_at.min(old.len())..])
            .take_while(|(a, b)| a == b)
            .count()
    };

    while new_offset < new.len() {
        let candidates = new
            .get(new_offset..new_offset + hash_len)
            .and_then(|window| pre_hash.get(window));

        if let Some(candidates) = candidates {
            if write_pending > 0 {
                instructions.push(Instruction::Write {
                    data: new[write_start..write_start + write_pending].to_vec(),
                });
                write_pending = 0;
            }

            // Staying at the cursor is strongly preferred: a candidate must
            // beat it by more than 8 bytes to be worth a jump.
            let cursor_match: i64 = if candidates.contains(&old_offset) {
                match_len(new_offset, old_offset) as i64
            } else {
                -100
            };

            let mut max_match = cursor_match;
            let mut max_offset = old_offset;
            for &orig_offset in candidates {
                let this_match = match_len(new_offset, orig_offset) as i64;
                if this_match > max_match && this_match > cursor_match + 8 {
                    max_match = this_match;
                    max_offset = orig_offset;
                }
            }

            if max_offset != old_offset {
                instructions.push(Instruction::Addr {
                    old: old_offset as u64,
                    new: max_offset as u64,
                });
            }
            instructions.push(Instruction::Copy {
                length: max_match as u32,
                source: max_offset as u64,
            });
            new_offset += max_match as usize;
            old_offset = max_offset + max_match as usize;
        } else {
            if write_pending == 0 {
                write_start = new_offset;
            }
            write_pending += 1;
            new_offset += 1;
            old_offset += 1;
        }
    }

    if write_pending > 0 {
        instructions.push(Instruction::Write {
            data: new[write_start..write_start + write_pending].to_vec(),
        });
    }

    instructions
}

/// Remove `ADDR, COPY, ADDR` sequences with opposite shifts (and the
/// variant with an embedded write): jumping backwards just to jump straight
/// back is never cheaper than writing the bytes literally. Contiguous
/// writes left behind by the replacement are merged.
fn cleanup_jumps(old: &[u8], instructions: Vec<Instruction>) -> Vec<Instruction> {
    let shift_of = |instr: &Instruction| -> Option<i64> {
        match instr {
            Instruction::Addr { old, new } => Some(*new as i64 - *old as i64),
            _ => None,
        }
    };

    let mut merged: Vec<Instruction> = Vec::new();
    let mut i = 0;
    while i < instructions.len() {
        let instr = &instructions[i];

        if let Instruction::Addr { new: target, .. } = instr {
            let shift = shift_of(instr).expect("addr instruction");
            let copy_len = match instructions.get(i + 1) {
                Some(Instruction::Copy { length, .. }) => Some(*length as usize),
                _ => None,
            };
            if let Some(copy_len) = copy_len {
                let jumped = old.get(*target as usize..*target as usize + copy_len);

                // ADDR, COPY, ADDR with equal and opposite shifts
                if let (Some(bytes), Some(back)) = (jumped, instructions.get(i + 2)) {
                    if shift_of(back) == Some(-shift) {
                        merged.push(Instruction::Write {
                            data: bytes.to_vec(),
                        });
                        i += 3;
                        continue;
                    }
                }
                // ADDR, COPY, WRITE, ADDR variant
                if let (Some(bytes), Some(Instruction::Write { data }), Some(back)) =
                    (jumped, instructions.get(i + 2), instructions.get(i + 3))
                {
                    if shift_of(back) == Some(-shift) {
                        let mut combined = bytes.to_vec();
                        combined.extend_from_slice(data);
                        merged.push(Instruction::Write { data: combined });
                        i += 4;
                        continue;
                    }
                }
            }
        }

        merged.push(instr.clone());
        i += 1;
    }

    // Merge runs of writes created by the pass above.
    let mut cleaned: Vec<Instruction> = Vec::new();
    for instr in merged {
        match (cleaned.last_mut(), instr) {
            (Some(Instruction::Write { data: prev }), Instruction::Write { data }) => {
                prev.extend_from_slice(&data);
            }
            (_, instr) => cleaned.push(instr),
        }
    }
    cleaned
}

/// Select repeated write payloads for the header's write cache and replace
/// their occurrences with `WRITE_CACHED`.
///
/// Only payloads of at least 8 bytes seen at least 3 times qualify; entries
/// are taken by descending byte savings until the 16-entry or 128-byte cache
/// limit is hit. (A knapsack pass could do better; this matches the device
/// implementation.)
fn common_writes(instructions: Vec<Instruction>) -> (Vec<Vec<u8>>, Vec<Instruction>) {
    let mut counts: HashMap<&[u8], (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for instr in &instructions {
        if let Instruction::Write { data } = instr {
            if data.len() < 8 {
                continue;
            }
            let entry = counts.entry(data).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }

    let mut by_savings: Vec<(&[u8], usize, usize)> = counts
        .into_iter()
        .filter(|(_, (count, _))| *count > 2)
        .map(|(data, (count, first))| (data, (count - 1) * data.len(), first))
        .collect();
    by_savings.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let mut cached: Vec<Vec<u8>> = Vec::new();
    let mut allocated = 0usize;
    for (data, _, _) in by_savings {
        if cached.len() >= CACHE_MAX_ENTRIES {
            break;
        }
        if 1 + data.len() + allocated > CACHE_REGION {
            continue;
        }
        allocated += 1 + data.len();
        cached.push(data.to_vec());
    }

    let replaced = instructions
        .into_iter()
        .map(|instr| match instr {
            Instruction::Write { data } => match cached.iter().position(|c| *c == data) {
                Some(index) => Instruction::WriteCached {
                    index: index as u8,
                    length: data.len() as u8,
                },
                None => Instruction::Write { data },
            },
            other => other,
        })
        .collect();

    (cached, replaced)
}

/// Fold runs of short copies and writes into `PATCH` macros.
fn merge_operations(instructions: Vec<Instruction>) -> Vec<Instruction> {
    fn finalise(merged: &mut Vec<Instruction>, to_merge: &mut Vec<Instruction>) {
        match to_merge.len() {
            0 => {}
            1 => merged.push(to_merge.pop().expect("one element")),
            _ => merged.push(Instruction::Patch {
                operations: std::mem::take(to_merge),
            }),
        }
    }

    let mut merged: Vec<Instruction> = Vec::new();
    let mut to_merge: Vec<Instruction> = Vec::new();

    for instr in instructions {
        let starts_group;
        let extends_group;
        match &instr {
            Instruction::Copy { length, .. } => {
                let eligible = *length > 0 && *length < 128;
                // The macro alternates copy/write, starting with a copy.
                extends_group = eligible
                    && matches!(to_merge.last(), Some(Instruction::Write { .. }));
                starts_group = eligible && !extends_group;
            }
            Instruction::Write { data } => {
                extends_group = !data.is_empty()
                    && data.len() < 256
                    && matches!(to_merge.last(), Some(Instruction::Copy { .. }));
                starts_group = false;
            }
            _ => {
                extends_group = false;
                starts_group = false;
            }
        }

        if extends_group {
            to_merge.push(instr);
        } else if starts_group {
            finalise(&mut merged, &mut to_merge);
            to_merge.push(instr);
        } else {
            finalise(&mut merged, &mut to_merge);
            merged.push(instr);
        }
    }
    finalise(&mut merged, &mut to_merge);
    merged
}

/// Crack `WRITE` operations inside a `PATCH` into `WRITE, COPY, WRITE`
/// wherever the literal bytes partially match the implied source position.
/// Copy fragments shorter than 2 bytes are rolled back into the adjacent
/// write; a trailing match is pushed into the following copy instead.
fn merge_crack(old: &[u8], instructions: Vec<Instruction>) -> Vec<Instruction> {
    instructions
        .into_iter()
        .map(|instr| match instr {
            Instruction::Patch { operations } => Instruction::Patch {
                operations: crack_operations(old, operations),
            },
            other => other,
        })
        .collect()
}

fn crack_operations(old: &[u8], mut ops: Vec<Instruction>) -> Vec<Instruction> {
    let mut updated: Vec<Instruction> = Vec::new();
    let mut i = 0;

    while i < ops.len() {
        if i + 1 == ops.len() {
            updated.push(ops[i].clone());
            break;
        }

        let (copy_len, copy_src) = match &ops[i] {
            Instruction::Copy { length, source } => (*length, *source),
            _ => {
                updated.push(ops[i].clone());
                i += 1;
                continue;
            }
        };
        let write_data = match &ops[i + 1] {
            Instruction::Write { data } => data.clone(),
            _ => {
                updated.push(ops[i].clone());
                updated.push(ops[i + 1].clone());
                i += 2;
                continue;
            }
        };
        updated.push(ops[i].clone());
        i += 2;

        let old_offset = copy_src as usize + copy_len as usize;
        if write_data.len() < 4 || old_offset + write_data.len() > old.len() {
            // Too small to crack, or no implied source bytes to compare.
            updated.push(Instruction::Write { data: write_data });
            continue;
        }

        // Alternating run lengths [write, copy, write, ..] over the data.
        let mut split: Vec<usize> = vec![0];
        for (idx, byte) in write_data.iter().enumerate() {
            let matches = old[old_offset + idx] == *byte;
            let on_write = split.len() % 2 == 1;
            match (matches, on_write) {
                (false, true) | (true, false) => *split.last_mut().expect("non-empty") += 1,
                (false, false) | (true, true) => split.push(1),
            }
        }
        debug_assert_eq!(split.iter().sum::<usize>(), write_data.len());

        if split[0] == 0 && split.len() > 1 {
            // Data starts with a match; leave this write alone rather than
            // produce adjacent copies in the macro.
            updated.push(Instruction::Write { data: write_data });
            continue;
        }

        if split.len() % 2 == 0 {
            // Ended on a copy run: push it into the next copy if there is
            // one, otherwise fold it back into the final write.
            let tail_copy = split.pop().expect("even length");
            match ops.get_mut(i) {
                Some(Instruction::Copy { length, source }) => {
                    *length += tail_copy as u32;
                    *source = source.saturating_sub(tail_copy as u64);
                }
                _ => *split.last_mut().expect("non-empty") += tail_copy,
            }
        }

        // Now N*[WRITE, COPY] + [WRITE].
        let mut offset = 0usize;
        while split.len() > 1 {
            let write_len = split.remove(0);
            let copy_len = split.remove(0);
            if copy_len == 1 {
                // A 1-byte copy costs more than it saves; roll both runs
                // into the following write.
                split[0] += write_len + copy_len;
            } else {
                updated.push(Instruction::Write {
                    data: write_data[offset..offset + write_len].to_vec(),
                });
                offset += write_len;
                updated.push(Instruction::Copy {
                    length: copy_len as u32,
                    source: (old_offset + offset) as u64,
                });
                offset += copy_len;
            }
        }
        let final_write = split.pop().expect("one element");
        if final_write > 0 {
            updated.push(Instruction::Write {
                data: write_data[offset..offset + final_write].to_vec(),
            });
        }
    }

    updated
}
