//! Delta codec: binary patches between content-addressed artifacts.
//!
//! A patch names the hash of the base it was computed from and the hash and
//! length of the image it reconstructs, followed by a list of operations that
//! either copy a range of the base or insert literal bytes.
//!
//! Wire format:
//!
//! ```text
//! "SWDP" | version:u8 | source_hash:[u8;32] | target_hash:[u8;32] | target_len:varint
//! ops*   | 0x00
//!
//! op = 0x01 offset:varint len:varint      copy from base
//!    | 0x02 len:varint bytes[len]         insert literal
//! ```
//!
//! [`apply_patch`] is pure and deterministic. It refuses a base whose hash
//! differs from the patch's source hash, but it never checks its own output
//! against the target hash: callers verify the reconstructed bytes.

mod diff;

pub use diff::diff;

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HASH_LEN};

const MAGIC: &[u8; 4] = b"SWDP";
const FORMAT_VERSION: u8 = 1;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Copy `len` bytes of the base starting at `offset`.
    Copy {
        /// Offset into the base.
        offset: u64,
        /// Number of bytes.
        len: u64,
    },
    /// Append literal bytes.
    Insert(Vec<u8>),
}

/// A decoded patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Hash of the base the patch applies to.
    pub source: ContentHash,
    /// Hash of the image the patch reconstructs.
    pub target: ContentHash,
    /// Length of the reconstructed image.
    pub target_len: u64,
    /// Operations in output order.
    pub ops: Vec<Op>,
}

impl Patch {
    /// Serialize to the wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            MAGIC.len() + 1 + 2 * HASH_LEN + 10 + self.ops.len() * 8,
        );
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.target.as_bytes());
        write_varint(&mut out, self.target_len);
        for op in &self.ops {
            match op {
                Op::Copy { offset, len } => {
                    out.push(OP_COPY);
                    write_varint(&mut out, *offset);
                    write_varint(&mut out, *len);
                }
                Op::Insert(bytes) => {
                    out.push(OP_INSERT);
                    write_varint(&mut out, bytes.len() as u64);
                    out.extend_from_slice(bytes);
                }
            }
        }
        out.push(OP_END);
        out
    }

    /// Parse the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PatchMalformed`] for a bad magic, unknown version,
    /// unknown opcode, or truncated input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(Error::PatchMalformed("bad magic".into()));
        }
        let version = reader.byte()?;
        if version != FORMAT_VERSION {
            return Err(Error::PatchMalformed(format!(
                "unsupported patch format version {version}"
            )));
        }
        let source = reader.hash()?;
        let target = reader.hash()?;
        let target_len = reader.varint()?;

        let mut ops = Vec::new();
        loop {
            match reader.byte()? {
                OP_END => break,
                OP_COPY => {
                    let offset = reader.varint()?;
                    let len = reader.varint()?;
                    ops.push(Op::Copy { offset, len });
                }
                OP_INSERT => {
                    let len = usize::try_from(reader.varint()?)
                        .map_err(|_| Error::PatchMalformed("insert too large".into()))?;
                    ops.push(Op::Insert(reader.take(len)?.to_vec()));
                }
                other => {
                    return Err(Error::PatchMalformed(format!("unknown opcode {other:#04x}")))
                }
            }
        }
        if reader.pos != bytes.len() {
            return Err(Error::PatchMalformed("trailing bytes after end marker".into()));
        }

        Ok(Self {
            source,
            target,
            target_len,
            ops,
        })
    }
}

/// Reconstruct a target image from `base` and an encoded patch.
///
/// # Errors
///
/// Returns [`Error::PatchIncompatible`] if `base` does not hash to the
/// patch's source hash, and [`Error::PatchMalformed`] if the patch cannot be
/// decoded, copies outside the base, or produces the wrong length.
pub fn apply_patch(base: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    apply_patch_limited(base, patch, u64::MAX)
}

/// [`apply_patch`] for a patch whose target size is known from elsewhere.
///
/// # Errors
///
/// As [`apply_patch`], and [`Error::PatchMalformed`] if the header declares
/// a target longer than `max_target_len`.
pub fn apply_patch_limited(base: &[u8], patch: &[u8], max_target_len: u64) -> Result<Vec<u8>> {
    let encoded_len = patch.len();
    let patch = Patch::decode(patch)?;
    let actual = ContentHash::of(base);
    if actual != patch.source {
        return Err(Error::PatchIncompatible {
            expected: patch.source,
            actual,
        });
    }
    if patch.target_len > max_target_len {
        return Err(Error::PatchMalformed(format!(
            "patch declares a {}-byte target, at most {max_target_len} expected",
            patch.target_len
        )));
    }

    let target_len = usize::try_from(patch.target_len)
        .map_err(|_| Error::PatchMalformed("target too large".into()))?;
    // The header length is only a hint until the output is produced.
    let mut out = Vec::with_capacity(target_len.min(base.len().saturating_add(encoded_len)));
    for op in &patch.ops {
        match op {
            Op::Copy { offset, len } => {
                let start = usize::try_from(*offset)
                    .map_err(|_| Error::PatchMalformed("copy offset overflow".into()))?;
                let len = usize::try_from(*len)
                    .map_err(|_| Error::PatchMalformed("copy length overflow".into()))?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= base.len())
                    .ok_or_else(|| Error::PatchMalformed("copy outside base".into()))?;
                check_output_room(out.len(), len, target_len)?;
                out.extend_from_slice(&base[start..end]);
            }
            Op::Insert(bytes) => {
                check_output_room(out.len(), bytes.len(), target_len)?;
                out.extend_from_slice(bytes);
            }
        }
    }

    if out.len() != target_len {
        return Err(Error::PatchMalformed(format!(
            "patch produced {} bytes, header declares {target_len}",
            out.len()
        )));
    }
    Ok(out)
}

fn check_output_room(current: usize, adding: usize, target_len: usize) -> Result<()> {
    if current.saturating_add(adding) > target_len {
        return Err(Error::PatchMalformed("output exceeds declared length".into()));
    }
    Ok(())
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        // Truncation to the low seven bits is intended.
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::PatchMalformed("truncated patch".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn hash(&mut self) -> Result<ContentHash> {
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(self.take(HASH_LEN)?);
        Ok(ContentHash::from_bytes(bytes))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.byte()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::PatchMalformed("varint too long".into()))
    }
}
