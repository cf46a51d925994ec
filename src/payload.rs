use std::sync::OnceLock;

use nom::{
    IResult,
    bytes::complete::tag,
    combinator::cond,
    number::complete::{be_u32, be_u64},
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::stream::ReadAt;

/// Chrome OS update payload container.
///
/// Update file format: contains all the operations needed to update a system to
/// a specific version. It can be a full payload which can update from any
/// version, or a delta payload which can only update from a specific version.
///
/// The binary format is:
/// - Magic bytes: "CrAU" (4 bytes)
/// - File format version (8 bytes, big-endian)
/// - Manifest size (8 bytes, big-endian)
/// - [Optional] Metadata signature size (4 bytes, big-endian, only if version >= 2)
/// - Manifest data (variable length, protobuf serialized)
/// - [Optional] Metadata signature (variable length, only if version >= 2)
/// - Operation data (remaining bytes)
pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Size of the largest (version 2) header.
pub const MAX_HEADER_SIZE: u64 = 24;

const SUPPORTED_VERSIONS: [u64; 2] = [1, 2];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Major version of the payload file format.
    pub version: u64,

    /// Size in bytes of the manifest data that follows.
    pub manifest_size: u64,

    /// Size of the metadata signature in bytes.
    /// Only present if version >= 2.
    pub metadata_signature_size: Option<u32>,
}

impl PayloadHeader {
    fn parse_inner(input: &[u8]) -> IResult<&[u8], PayloadHeader> {
        let (input, _) = tag(&PAYLOAD_MAGIC[..])(input)?;
        let (input, version) = be_u64(input)?;
        let (input, manifest_size) = be_u64(input)?;
        // Metadata signature size only exists in version 2+
        let (input, metadata_signature_size) = cond(version > 1, be_u32)(input)?;

        Ok((
            input,
            PayloadHeader {
                version,
                manifest_size,
                metadata_signature_size,
            },
        ))
    }

    /// Parse the fixed header from the first bytes of a payload.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let magic = bytes.get(..PAYLOAD_MAGIC.len()).ok_or(Error::Truncated {
            what: "header",
            needed: PAYLOAD_MAGIC.len() as u64,
            available: bytes.len() as u64,
        })?;
        if magic != PAYLOAD_MAGIC {
            let mut m = [0u8; 4];
            m.copy_from_slice(magic);
            return Err(Error::UnknownMagic(m));
        }

        let (_, header) = Self::parse_inner(bytes).map_err(|_| Error::Truncated {
            what: "header",
            needed: MAX_HEADER_SIZE,
            available: bytes.len() as u64,
        })?;

        if !SUPPORTED_VERSIONS.contains(&header.version) {
            return Err(Error::UnsupportedVersion(header.version));
        }

        Ok(header)
    }

    /// Size of the header itself.
    pub fn size(&self) -> u64 {
        let signature_field = if self.metadata_signature_size.is_some() { 4 } else { 0 };
        PAYLOAD_MAGIC.len() as u64 + 8 + 8 + signature_field
    }

    pub fn signature_size(&self) -> u64 {
        self.metadata_signature_size.map_or(0, u64::from)
    }
}

/// An opened payload. Holds the byte source and serves positional reads of
/// the manifest, the metadata signature and operation data blobs. Nothing
/// beyond the header is read until it is asked for.
#[derive(Debug)]
pub struct Payload<R> {
    source: R,
    source_size: u64,
    header: PayloadHeader,
    manifest: OnceLock<Vec<u8>>,
    signature: OnceLock<Vec<u8>>,
}

impl<R: ReadAt> Payload<R> {
    /// Validate the header of `source` and check that the declared sections
    /// fit inside it.
    pub fn open(source: R) -> Result<Self> {
        let source_size = source.size()?;

        let mut buf = vec![0u8; MAX_HEADER_SIZE.min(source_size) as usize];
        source.read_exact_at(&mut buf, 0)?;
        let header = PayloadHeader::parse(&buf)?;

        let needed = header
            .size()
            .checked_add(header.manifest_size)
            .and_then(|n| n.checked_add(header.signature_size()))
            .ok_or(Error::Truncated {
                what: "metadata",
                needed: u64::MAX,
                available: source_size,
            })?;
        if needed > source_size {
            return Err(Error::Truncated {
                what: "metadata",
                needed,
                available: source_size,
            });
        }

        debug!(
            version = header.version,
            manifest_size = header.manifest_size,
            signature_size = header.signature_size(),
            "Opened payload"
        );

        Ok(Self {
            source,
            source_size,
            header,
            manifest: OnceLock::new(),
            signature: OnceLock::new(),
        })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    /// Serialized `DeltaArchiveManifest`. Read once, then cached.
    pub fn manifest_bytes(&self) -> Result<&[u8]> {
        cached_read(
            &self.manifest,
            &self.source,
            self.header.size(),
            self.header.manifest_size,
        )
    }

    /// Serialized metadata `Signatures` message, if the payload has one.
    /// Read once, then cached.
    pub fn signature_bytes(&self) -> Result<Option<&[u8]>> {
        if self.header.signature_size() == 0 {
            return Ok(None);
        }

        cached_read(
            &self.signature,
            &self.source,
            self.header.size() + self.header.manifest_size,
            self.header.signature_size(),
        )
        .map(Some)
    }

    /// Absolute offset of the operation data region.
    pub fn operation_data_offset(&self) -> u64 {
        self.header.size() + self.header.manifest_size + self.header.signature_size()
    }

    /// Size of the operation data region.
    pub fn operation_data_size(&self) -> u64 {
        self.source_size - self.operation_data_offset()
    }

    /// Read `length` bytes at `offset` within the operation data region.
    pub fn read_data(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let available = self.operation_data_size();
        let out_of_range = || Error::DataOutOfRange {
            offset,
            length,
            available,
        };

        let end = offset.checked_add(length).ok_or_else(out_of_range)?;
        if end > available {
            return Err(out_of_range());
        }
        let length = usize::try_from(length).map_err(|_| out_of_range())?;

        let mut buf = vec![0u8; length];
        self.source
            .read_exact_at(&mut buf, self.operation_data_offset() + offset)?;
        Ok(buf)
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn into_source(self) -> R {
        self.source
    }
}

fn cached_read<'a>(
    cell: &'a OnceLock<Vec<u8>>,
    source: &impl ReadAt,
    offset: u64,
    length: u64,
) -> Result<&'a [u8]> {
    if let Some(data) = cell.get() {
        return Ok(data);
    }

    let length = usize::try_from(length).map_err(|_| Error::Truncated {
        what: "metadata",
        needed: length,
        available: usize::MAX as u64,
    })?;
    let mut data = vec![0u8; length];
    source.read_exact_at(&mut data, offset)?;

    // A concurrent caller may have won the race; both read identical bytes.
    Ok(cell.get_or_init(|| data))
}
