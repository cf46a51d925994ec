use std::fmt;
use std::io;

use thiserror::Error;

use crate::extent::ByteRange;
use crate::manifest::OpCode;

/// Every failure the extraction engine can report.
///
/// Failures that happen while extracting a particular partition are wrapped
/// in [`Error::Partition`] so that diagnostics always name the partition and,
/// when relevant, the operation index. Use [`Error::kind`] to classify an
/// error regardless of wrapping.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown payload magic: {0:02x?}")]
    UnknownMagic([u8; 4]),
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("payload truncated: {what} needs {needed} bytes, but only {available} are available")]
    Truncated {
        what: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("unable to decode manifest")]
    Manifest(#[from] prost::DecodeError),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("operation data {offset}+{length} exceeds the {available} byte data region")]
    DataOutOfRange {
        offset: u64,
        length: u64,
        available: u64,
    },
    #[error("partition not found in payload: {0:?}")]
    NotFound(String),
    #[error("destination ranges {first} and {second} overlap")]
    Overlap { first: ByteRange, second: ByteRange },
    #[error("range {range} exceeds the {limit} byte {what}")]
    OutOfBounds {
        range: ByteRange,
        limit: u64,
        what: &'static str,
    },
    #[error("range {0} is not written by any operation")]
    Uncovered(ByteRange),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(OpCode),
    #[error("corrupt {what} stream: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("{what} length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("{what} sha256 mismatch: expected {expected}, got {actual}")]
    Checksum {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("{0} hash is required but missing")]
    MissingHash(&'static str),
    #[error("source-relative operation requires a source image, but none was supplied")]
    MissingSourceImage,
    #[error("extraction cancelled")]
    Cancelled,
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("{partition}{}: {source}", OperationSuffix(.operation))]
    Partition {
        partition: String,
        operation: Option<usize>,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], independent of partition context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    NotFound,
    Overlap,
    OutOfBounds,
    UnsupportedOperation,
    Decode,
    LengthMismatch,
    Checksum,
    MissingSourceImage,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Format => "FormatError",
            Self::NotFound => "NotFoundError",
            Self::Overlap => "OverlapError",
            Self::OutOfBounds => "OutOfBoundsError",
            Self::UnsupportedOperation => "UnsupportedOperationError",
            Self::Decode => "DecodeError",
            Self::LengthMismatch => "LengthMismatchError",
            Self::Checksum => "ChecksumError",
            Self::MissingSourceImage => "MissingSourceImageError",
            Self::Cancelled => "Cancelled",
            Self::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownMagic(_)
            | Self::UnsupportedVersion(_)
            | Self::Truncated { .. }
            | Self::Manifest(_)
            | Self::InvalidManifest(_)
            | Self::DataOutOfRange { .. } => ErrorKind::Format,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Overlap { .. } => ErrorKind::Overlap,
            Self::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Self::Uncovered(_) | Self::Decode { .. } => ErrorKind::Decode,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            Self::Checksum { .. } | Self::MissingHash(_) => ErrorKind::Checksum,
            Self::MissingSourceImage => ErrorKind::MissingSourceImage,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Partition { source, .. } => source.kind(),
        }
    }

    /// Attach partition (and optionally operation) context. Errors that
    /// already carry context are returned unchanged.
    pub fn in_partition(self, partition: &str, operation: Option<usize>) -> Self {
        match self {
            e @ Self::Partition { .. } => e,
            e => Self::Partition {
                partition: partition.to_owned(),
                operation,
                source: Box::new(e),
            },
        }
    }

    /// Name of the partition the error is scoped to, if any.
    pub fn partition(&self) -> Option<&str> {
        match self {
            Self::Partition { partition, .. } => Some(partition),
            _ => None,
        }
    }

    /// Index of the failing operation, if any.
    pub fn operation(&self) -> Option<usize> {
        match self {
            Self::Partition { operation, .. } => *operation,
            _ => None,
        }
    }

    /// The error without partition context.
    pub fn root(&self) -> &Error {
        match self {
            Self::Partition { source, .. } => source.root(),
            e => e,
        }
    }

    pub(crate) fn checksum(what: &'static str, expected: &[u8], actual: &[u8]) -> Self {
        Self::Checksum {
            what,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }

    pub(crate) fn decode(what: &'static str, reason: impl fmt::Display) -> Self {
        Self::Decode {
            what,
            reason: reason.to_string(),
        }
    }
}

struct OperationSuffix<'a>(&'a Option<usize>);

impl fmt::Display for OperationSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(index) => write!(f, " (operation #{index})"),
            None => Ok(()),
        }
    }
}
