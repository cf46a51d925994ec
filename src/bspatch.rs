//! bsdiff patch application for SOURCE_BSDIFF operations.
//!
//! Two container formats are understood, both with a 32-byte header followed
//! by the control, diff and extra streams:
//!
//! - `BSDIFF40`: all three streams are bzip2 compressed.
//! - `BSDF2`: the three bytes after the magic select the compression of each
//!   stream individually (0 = none, 1 = bzip2, 2 = brotli).
//!
//! The header stores the compressed lengths of the control and diff streams
//! and the size of the new file. The extra stream runs to the end of the
//! patch.

use std::io::{self, Read};

use bzip2::read::BzDecoder;

use crate::error::{Error, Result};

const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";
const HEADER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamCodec {
    None,
    Bzip2,
    Brotli,
}

impl StreamCodec {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Bzip2),
            2 => Ok(Self::Brotli),
            n => Err(Error::decode("patch", format!("unknown stream compression {n}"))),
        }
    }

    fn reader<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
        match self {
            Self::None => Ok(Box::new(data)),
            Self::Bzip2 => Ok(Box::new(BzDecoder::new(data))),
            Self::Brotli => Err(Error::decode(
                "patch",
                "brotli-compressed patch streams are not supported",
            )),
        }
    }
}

#[derive(Debug)]
struct PatchHeader {
    codecs: [StreamCodec; 3],
    control_len: u64,
    diff_len: u64,
    new_size: u64,
}

/// Decode a sign-magnitude encoded 64-bit integer (bsdiff `offtin`).
fn offtin(buf: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    let negative = bytes[7] & 0x80 != 0;
    bytes[7] &= 0x7f;

    let magnitude = i64::from_le_bytes(bytes);
    if negative { -magnitude } else { magnitude }
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::decode("patch", format!("negative {what}: {value}")))
}

impl PatchHeader {
    fn parse(patch: &[u8]) -> Result<Self> {
        if patch.len() < HEADER_SIZE {
            return Err(Error::decode("patch", "header is truncated"));
        }

        let codecs = if patch.starts_with(BSDIFF40_MAGIC) {
            [StreamCodec::Bzip2; 3]
        } else if patch.starts_with(BSDF2_MAGIC) {
            [
                StreamCodec::from_raw(patch[5])?,
                StreamCodec::from_raw(patch[6])?,
                StreamCodec::from_raw(patch[7])?,
            ]
        } else {
            return Err(Error::decode(
                "patch",
                format!("unknown magic: {:02x?}", &patch[..8]),
            ));
        };

        Ok(Self {
            codecs,
            control_len: non_negative(offtin(&patch[8..16]), "control length")?,
            diff_len: non_negative(offtin(&patch[16..24]), "diff length")?,
            new_size: non_negative(offtin(&patch[24..32]), "new size")?,
        })
    }
}

fn read_stream(reader: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::decode("patch", format!("{what} stream ended early")),
        _ => Error::decode("patch", format!("{what} stream: {e}")),
    })
}

fn invalid_entry(index: usize, reason: impl std::fmt::Display) -> Error {
    Error::decode("patch", format!("control entry {index}: {reason}"))
}

/// End of a run of `len` bytes starting at `pos`, which must not pass
/// `new_size`.
fn run_end(index: usize, what: &str, pos: usize, len: u64, new_size: usize) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| pos.checked_add(len))
        .filter(|&end| end <= new_size)
        .ok_or_else(|| {
            invalid_entry(
                index,
                format!("{what} run of {len} bytes at {pos} exceeds new size {new_size}"),
            )
        })
}

/// Old file byte at `pos`, or 0 outside the old file.
fn old_byte_at(old: &[u8], pos: i64) -> u8 {
    usize::try_from(pos)
        .ok()
        .and_then(|p| old.get(p))
        .copied()
        .unwrap_or(0)
}

/// Apply a bsdiff `patch` to `old`. The patch must produce exactly
/// `expected_size` bytes.
pub fn apply_patch(old: &[u8], patch: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let header = PatchHeader::parse(patch)?;
    if header.new_size != expected_size {
        return Err(Error::LengthMismatch {
            what: "patch output",
            expected: expected_size,
            actual: header.new_size,
        });
    }

    let body = &patch[HEADER_SIZE..];
    let control_end = usize::try_from(header.control_len)
        .ok()
        .filter(|&n| n <= body.len())
        .ok_or_else(|| Error::decode("patch", "control stream exceeds patch size"))?;
    let diff_end = usize::try_from(header.diff_len)
        .ok()
        .and_then(|n| control_end.checked_add(n))
        .filter(|&n| n <= body.len())
        .ok_or_else(|| Error::decode("patch", "diff stream exceeds patch size"))?;

    let [control_codec, diff_codec, extra_codec] = header.codecs;
    let mut control = control_codec.reader(&body[..control_end])?;
    let mut diff = diff_codec.reader(&body[control_end..diff_end])?;
    let mut extra = extra_codec.reader(&body[diff_end..])?;

    let new_size = usize::try_from(header.new_size)
        .map_err(|_| Error::decode("patch", "new size exceeds address space"))?;
    let mut new = vec![0u8; new_size];
    let mut new_pos = 0usize;
    let mut old_pos = 0i64;
    let mut index = 0usize;

    while new_pos < new_size {
        let mut entry = [0u8; 24];
        read_stream(&mut *control, &mut entry, "control")?;

        let diff_len = u64::try_from(offtin(&entry[0..8]))
            .map_err(|_| invalid_entry(index, "negative diff run"))?;
        let extra_len = u64::try_from(offtin(&entry[8..16]))
            .map_err(|_| invalid_entry(index, "negative extra run"))?;
        let seek = offtin(&entry[16..24]);

        // Diff run: new = diff + old.
        let diff_end = run_end(index, "diff", new_pos, diff_len, new_size)?;
        let chunk = &mut new[new_pos..diff_end];
        read_stream(&mut *diff, chunk, "diff")?;

        for (i, byte) in chunk.iter_mut().enumerate() {
            let pos = old_pos.saturating_add(i as i64);
            *byte = byte.wrapping_add(old_byte_at(old, pos));
        }
        new_pos = diff_end;
        old_pos = old_pos.saturating_add(diff_len as i64);

        // Extra run: copied verbatim.
        let extra_end = run_end(index, "extra", new_pos, extra_len, new_size)?;
        read_stream(&mut *extra, &mut new[new_pos..extra_end], "extra")?;
        new_pos = extra_end;

        old_pos = old_pos
            .checked_add(seek)
            .ok_or_else(|| invalid_entry(index, "old file offset overflows"))?;
        index += 1;
    }

    Ok(new)
}
