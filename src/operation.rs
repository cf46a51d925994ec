//! Application of a single install operation to an output image.

use std::io::{self, Read};

use bzip2::read::BzDecoder;
use sha2::{Digest, Sha256};
use tracing::trace;
use xz2::read::XzDecoder;

use crate::bspatch;
use crate::error::{Error, Result};
use crate::extent::{self, ByteRange};
use crate::manifest::{Codec, InstallOperation, OperationKind};
use crate::payload::Payload;
use crate::stream::{ReadAt, WriteAt};

/// Largest single write used when zero-filling.
const ZERO_CHUNK_SIZE: usize = 1024 * 1024;

/// Everything an operation may read from, shared by all operations of an
/// extraction.
pub struct OperationContext<'a, R> {
    pub payload: &'a Payload<R>,
    pub block_size: u32,
    /// Previously installed image, for source-relative operations.
    pub source: Option<&'a dyn ReadAt>,
    /// Check `data_sha256_hash` and `src_sha256_hash` when present.
    pub verify: bool,
}

impl<R> Clone for OperationContext<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for OperationContext<'_, R> {}

fn to_len(n: u64, what: &'static str) -> Result<usize> {
    usize::try_from(n).map_err(|_| Error::LengthMismatch {
        what,
        expected: usize::MAX as u64,
        actual: n,
    })
}

fn verify_sha256(what: &'static str, data: &[u8], expected: Option<&[u8]>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let actual = Sha256::digest(data);
    if actual.as_slice() != expected {
        return Err(Error::checksum(what, expected, &actual));
    }
    Ok(())
}

/// Write `data` across `ranges` in order. `data` must be exactly as long as
/// the ranges combined.
fn scatter(sink: &dyn WriteAt, ranges: &[ByteRange], data: &[u8]) -> Result<()> {
    let mut remaining = data;
    for range in ranges {
        let (chunk, rest) = remaining.split_at(range.length as usize);
        sink.write_all_at(chunk, range.offset)?;
        remaining = rest;
    }
    debug_assert!(remaining.is_empty());
    Ok(())
}

/// Read `ranges` of `source` back to back into one buffer.
fn gather(source: &dyn ReadAt, ranges: &[ByteRange], total: usize) -> Result<Vec<u8>> {
    let size = source.size()?;
    let mut buf = vec![0u8; total];
    let mut pos = 0;

    for range in ranges {
        if range.end() > size {
            return Err(Error::OutOfBounds {
                range: *range,
                limit: size,
                what: "source image",
            });
        }
        let len = range.length as usize;
        source.read_exact_at(&mut buf[pos..pos + len], range.offset)?;
        pos += len;
    }

    Ok(buf)
}

/// Decompress `blob` into a buffer that must end up exactly `expected` bytes
/// long. One extra byte is requested so that overlong streams are detected
/// without inflating them completely.
fn inflate(codec: Codec, blob: &[u8], expected: usize) -> Result<Vec<u8>> {
    let reader: Box<dyn Read + '_> = match codec {
        Codec::Bzip2 => Box::new(BzDecoder::new(blob)),
        Codec::Xz => Box::new(XzDecoder::new(blob)),
    };

    let mut buf = Vec::with_capacity(expected + 1);
    reader
        .take(expected as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(|e| Error::decode(codec.name(), e))?;

    if buf.len() != expected {
        return Err(Error::LengthMismatch {
            what: "decompressed data",
            expected: expected as u64,
            actual: buf.len() as u64,
        });
    }
    Ok(buf)
}

fn zero_fill(sink: &dyn WriteAt, ranges: &[ByteRange]) -> Result<()> {
    let longest = ranges.iter().map(|r| r.length).max().unwrap_or(0);
    let zeros = vec![0u8; (longest as usize).min(ZERO_CHUNK_SIZE)];

    for range in ranges {
        let mut offset = range.offset;
        while offset < range.end() {
            let n = (range.end() - offset).min(zeros.len() as u64) as usize;
            sink.write_all_at(&zeros[..n], offset)?;
            offset += n as u64;
        }
    }
    Ok(())
}

impl<R: ReadAt> OperationContext<'_, R> {
    /// Read and verify the operation's data blob.
    fn read_blob(&self, op: &InstallOperation) -> Result<Vec<u8>> {
        let range = op
            .data
            .ok_or_else(|| Error::InvalidManifest("operation has no data range".to_owned()))?;
        let blob = self.payload.read_data(range.offset, range.length)?;

        if self.verify {
            verify_sha256("operation data", &blob, op.data_sha256.as_deref())?;
        }
        Ok(blob)
    }

    /// Read and verify the operation's source extents. Fails before reading
    /// anything if the source length does not match `dst_len`.
    fn read_source(&self, op: &InstallOperation, dst_len: Option<u64>) -> Result<Vec<u8>> {
        let source = self.source.ok_or(Error::MissingSourceImage)?;
        let ranges = extent::to_byte_ranges(&op.src_extents, self.block_size)?;
        let src_len = extent::total_length(&ranges);

        if let Some(dst_len) = dst_len
            && src_len != dst_len
        {
            return Err(Error::LengthMismatch {
                what: "source extents",
                expected: dst_len,
                actual: src_len,
            });
        }

        let data = gather(source, &ranges, to_len(src_len, "source extents")?)?;
        if self.verify {
            verify_sha256("source data", &data, op.src_sha256.as_deref())?;
        }
        Ok(data)
    }

    fn apply(&self, op: &InstallOperation, sink: &dyn WriteAt) -> Result<()> {
        let dst = extent::to_byte_ranges(&op.dst_extents, self.block_size)?;
        let dst_len = extent::total_length(&dst);

        trace!(kind = ?op.kind, dst_len, "Applying operation");

        match op.kind {
            OperationKind::Replace => {
                let blob = self.read_blob(op)?;
                if blob.len() as u64 != dst_len {
                    return Err(Error::LengthMismatch {
                        what: "operation data",
                        expected: dst_len,
                        actual: blob.len() as u64,
                    });
                }
                scatter(sink, &dst, &blob)
            }
            OperationKind::ReplaceCompressed(codec) => {
                let blob = self.read_blob(op)?;
                let data = inflate(codec, &blob, to_len(dst_len, "destination extents")?)?;
                scatter(sink, &dst, &data)
            }
            OperationKind::Zero => zero_fill(sink, &dst),
            OperationKind::SourceCopy => {
                let data = self.read_source(op, Some(dst_len))?;
                scatter(sink, &dst, &data)
            }
            OperationKind::SourcePatch => {
                let old = self.read_source(op, None)?;
                let patch = self.read_blob(op)?;
                let new = bspatch::apply_patch(&old, &patch, dst_len)?;
                scatter(sink, &dst, &new)
            }
            OperationKind::Unknown(code) => Err(Error::UnsupportedOperation(code)),
        }
    }
}

/// Apply `op` to `sink`. Every check that can fail happens before the first
/// byte is written, except for I/O errors from the sink itself.
pub fn apply_operation<R: ReadAt>(
    ctx: &OperationContext<'_, R>,
    op: &InstallOperation,
    sink: &dyn WriteAt,
) -> Result<()> {
    ctx.apply(op, sink)
}

/// Stream `len` bytes of `image` through SHA-256 in bounded windows.
pub fn sha256_image(image: &dyn ReadAt, len: u64) -> io::Result<[u8; 32]> {
    const WINDOW: u64 = 4 * 1024 * 1024;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; WINDOW.min(len) as usize];
    let mut offset = 0;

    while offset < len {
        let n = (len - offset).min(WINDOW) as usize;
        image.read_exact_at(&mut buf[..n], offset)?;
        hasher.update(&buf[..n]);
        offset += n as u64;
    }

    Ok(hasher.finalize().into())
}
