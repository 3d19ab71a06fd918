//! Patch generation.
//!
//! Block matching in the style of rsync: the base is indexed by a rolling
//! hash of every aligned `BLOCK`-byte window, the target is scanned one byte
//! at a time, and each verified hit is extended forwards (and backwards into
//! the pending literal run) before being emitted as a copy.

use std::collections::HashMap;

use super::{Op, Patch};
use crate::hash::ContentHash;

const BLOCK: usize = 32;
const MAX_CANDIDATES: usize = 8;
const PRIME: u64 = 0x0100_0000_01b3;

/// Compute a patch that turns `base` into `target`.
#[must_use]
pub fn diff(base: &[u8], target: &[u8]) -> Patch {
    let mut ops = Vec::new();
    let mut literal_start = 0;

    if base.len() >= BLOCK && target.len() >= BLOCK {
        let index = index_base(base);
        let out_factor = PRIME.wrapping_pow(u32::try_from(BLOCK - 1).unwrap_or(u32::MAX));
        let mut pos = 0;
        let mut hash = window_hash(&target[..BLOCK]);

        while pos + BLOCK <= target.len() {
            if let Some((mut offset, mut len)) = best_match(&index, hash, base, target, pos) {
                let mut start = pos;
                while offset > 0 && start > literal_start && base[offset - 1] == target[start - 1]
                {
                    offset -= 1;
                    start -= 1;
                    len += 1;
                }
                if start > literal_start {
                    ops.push(Op::Insert(target[literal_start..start].to_vec()));
                }
                ops.push(Op::Copy {
                    offset: offset as u64,
                    len: len as u64,
                });
                pos = start + len;
                literal_start = pos;
                if pos + BLOCK <= target.len() {
                    hash = window_hash(&target[pos..pos + BLOCK]);
                }
                continue;
            }

            if pos + BLOCK < target.len() {
                hash = roll(hash, target[pos], target[pos + BLOCK], out_factor);
            }
            pos += 1;
        }
    }

    if literal_start < target.len() {
        ops.push(Op::Insert(target[literal_start..].to_vec()));
    }

    Patch {
        source: ContentHash::of(base),
        target: ContentHash::of(target),
        target_len: target.len() as u64,
        ops,
    }
}

fn index_base(base: &[u8]) -> HashMap<u64, Vec<usize>> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::with_capacity(base.len() / BLOCK + 1);
    let mut offset = 0;
    while offset + BLOCK <= base.len() {
        let slots = index
            .entry(window_hash(&base[offset..offset + BLOCK]))
            .or_default();
        if slots.len() < MAX_CANDIDATES {
            slots.push(offset);
        }
        offset += BLOCK;
    }
    index
}

fn best_match(
    index: &HashMap<u64, Vec<usize>>,
    hash: u64,
    base: &[u8],
    target: &[u8],
    pos: usize,
) -> Option<(usize, usize)> {
    let candidates = index.get(&hash)?;
    let window = &target[pos..pos + BLOCK];
    candidates
        .iter()
        .filter(|&&offset| &base[offset..offset + BLOCK] == window)
        .map(|&offset| {
            let len = base[offset..]
                .iter()
                .zip(&target[pos..])
                .take_while(|(a, b)| a == b)
                .count();
            (offset, len)
        })
        .max_by_key(|&(_, len)| len)
}

fn window_hash(window: &[u8]) -> u64 {
    window
        .iter()
        .fold(0u64, |h, &b| h.wrapping_mul(PRIME).wrapping_add(u64::from(b) + 1))
}

fn roll(hash: u64, outgoing: u8, incoming: u8, out_factor: u64) -> u64 {
    hash.wrapping_sub((u64::from(outgoing) + 1).wrapping_mul(out_factor))
        .wrapping_mul(PRIME)
        .wrapping_add(u64::from(incoming) + 1)
}
