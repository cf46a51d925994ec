//! Validated view of the payload manifest.
//!
//! The protobuf message is decoded with prost, which skips fields it does not
//! know about, so manifests written by newer generators still load. The
//! decoded message is then converted into the types below, which only admit
//! internally consistent values: every extent's byte range fits in 64 bits,
//! every partition size is a whole number of blocks, and every operation
//! carries the fields its opcode needs.

use std::collections::HashSet;
use std::fmt;

use prost::Message;

use crate::error::{Error, Result};
use crate::extent;
use crate::proto::{self, install_operation::Type};

/// Block extent `(start_block, num_blocks)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

/// Raw opcode as stored in the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpCode(pub i32);

impl OpCode {
    pub fn name(&self) -> Option<&'static str> {
        match Type::try_from(self.0) {
            Ok(t) => Some(t.as_str_name()),
            // Newer generators use these tags for compressed replacements.
            Err(_) => match self.0 {
                14 => Some("ZSTD"),
                15 => Some("LZ4"),
                _ => None,
            },
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "unknown type {}", self.0),
        }
    }
}

/// Compression used by a compressed replace operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Bzip2,
    Xz,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Raw data blob copied to the destination.
    Replace,
    /// Compressed data blob, inflated to the destination.
    ReplaceCompressed(Codec),
    /// Destination is zero-filled. Also used for DISCARD.
    Zero,
    /// Destination is copied from the source image.
    SourceCopy,
    /// Destination is a bsdiff patch applied to the source image.
    SourcePatch,
    /// Opcode this engine cannot execute.
    Unknown(OpCode),
}

impl OperationKind {
    fn from_raw(raw: i32) -> Self {
        match Type::try_from(raw) {
            Ok(Type::Replace) => Self::Replace,
            Ok(Type::ReplaceBz) => Self::ReplaceCompressed(Codec::Bzip2),
            Ok(Type::ReplaceXz) => Self::ReplaceCompressed(Codec::Xz),
            Ok(Type::Zero | Type::Discard) => Self::Zero,
            Ok(Type::SourceCopy) => Self::SourceCopy,
            Ok(Type::SourceBsdiff) => Self::SourcePatch,
            _ => Self::Unknown(OpCode(raw)),
        }
    }

    pub fn requires_source(&self) -> bool {
        matches!(self, Self::SourceCopy | Self::SourcePatch)
    }

    pub fn requires_data(&self) -> bool {
        matches!(
            self,
            Self::Replace | Self::ReplaceCompressed(_) | Self::SourcePatch
        )
    }
}

/// Location of an operation's blob, relative to the start of the operation
/// data region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRange {
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, Debug)]
pub struct InstallOperation {
    pub kind: OperationKind,
    pub data: Option<DataRange>,
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// SHA-256 of the data blob.
    pub data_sha256: Option<Vec<u8>>,
    /// SHA-256 of the concatenated source extents.
    pub src_sha256: Option<Vec<u8>>,
}

/// Size and digest of a partition image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub size: u64,
    pub sha256: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct Partition {
    pub name: String,
    /// Declared size of the new image in blocks.
    pub size_blocks: u64,
    pub operations: Vec<InstallOperation>,
    /// Expected SHA-256 of the complete new image.
    pub new_sha256: Option<Vec<u8>>,
    /// Image this partition is patched from, for delta payloads.
    pub old_info: Option<ImageInfo>,
    pub version: Option<String>,
}

impl Partition {
    pub fn requires_source(&self) -> bool {
        self.operations.iter().any(|op| op.kind.requires_source())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicPartitionGroup {
    pub name: String,
    pub size: Option<u64>,
    pub partition_names: Vec<String>,
}

/// Dynamic partition layout. Informational only: the declared partition size
/// always determines the extracted image size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicPartitionMetadata {
    pub groups: Vec<DynamicPartitionGroup>,
    pub snapshot_enabled: bool,
    pub vabc_enabled: bool,
    pub vabc_compression_param: Option<String>,
    pub cow_version: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Manifest {
    block_size: u32,
    minor_version: u32,
    max_timestamp: Option<i64>,
    partial_update: bool,
    security_patch_level: Option<String>,
    signatures: Option<DataRange>,
    partitions: Vec<Partition>,
    dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidManifest(msg.into())
}

impl Manifest {
    /// Decode and validate a serialized `DeltaArchiveManifest`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = proto::DeltaArchiveManifest::decode(bytes)?;
        Self::try_from(raw)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }

    pub fn partial_update(&self) -> bool {
        self.partial_update
    }

    pub fn security_patch_level(&self) -> Option<&str> {
        self.security_patch_level.as_deref()
    }

    /// Location of the payload signature blob in the operation data region.
    pub fn signatures(&self) -> Option<DataRange> {
        self.signatures
    }

    pub fn dynamic_partition_metadata(&self) -> Option<&DynamicPartitionMetadata> {
        self.dynamic_partition_metadata.as_ref()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn find_partition(&self, name: &str) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Whether the payload can be applied without any source image.
    pub fn is_full_payload(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| p.old_info.is_none() && !p.requires_source())
    }

    /// Size of a partition image in bytes.
    pub fn partition_size(&self, partition: &Partition) -> u64 {
        // Cannot overflow: the size was given in bytes in the manifest.
        partition.size_blocks * u64::from(self.block_size)
    }
}

impl TryFrom<proto::DeltaArchiveManifest> for Manifest {
    type Error = Error;

    fn try_from(raw: proto::DeltaArchiveManifest) -> Result<Self> {
        let block_size = raw.block_size();
        if block_size == 0 {
            return Err(invalid("block size is zero"));
        }

        let minor_version = raw.minor_version();
        let partial_update = raw.partial_update();

        let mut names = HashSet::new();
        let mut partitions = Vec::with_capacity(raw.partitions.len());

        for p in raw.partitions {
            if !names.insert(p.partition_name.clone()) {
                return Err(invalid(format!(
                    "duplicate partition: {:?}",
                    p.partition_name,
                )));
            }
            partitions.push(convert_partition(p, block_size)?);
        }

        let signatures = match (raw.signatures_offset, raw.signatures_size) {
            (Some(offset), Some(length)) => Some(DataRange { offset, length }),
            _ => None,
        };

        let dynamic_partition_metadata = raw.dynamic_partition_metadata.map(|m| {
            DynamicPartitionMetadata {
                snapshot_enabled: m.snapshot_enabled(),
                vabc_enabled: m.vabc_enabled(),
                vabc_compression_param: m.vabc_compression_param,
                cow_version: m.cow_version,
                groups: m
                    .groups
                    .into_iter()
                    .map(|g| DynamicPartitionGroup {
                        name: g.name,
                        size: g.size,
                        partition_names: g.partition_names,
                    })
                    .collect(),
            }
        });

        Ok(Self {
            block_size,
            minor_version,
            max_timestamp: raw.max_timestamp,
            partial_update,
            security_patch_level: raw.security_patch_level,
            signatures,
            partitions,
            dynamic_partition_metadata,
        })
    }
}

fn convert_partition(p: proto::PartitionUpdate, block_size: u32) -> Result<Partition> {
    let name = p.partition_name;
    let context = |msg: String| invalid(format!("{name}: {msg}"));

    let new_info = p
        .new_partition_info
        .ok_or_else(|| context("new_partition_info is missing".to_owned()))?;
    let size = new_info
        .size
        .ok_or_else(|| context("new partition size is missing".to_owned()))?;
    if size % u64::from(block_size) != 0 {
        return Err(context(format!(
            "size {size} is not a multiple of the block size {block_size}",
        )));
    }

    let old_info = p.old_partition_info.and_then(|info| {
        info.size.map(|size| ImageInfo {
            size,
            sha256: info.hash,
        })
    });

    let operations = p
        .operations
        .into_iter()
        .enumerate()
        .map(|(i, op)| {
            convert_operation(op, block_size)
                .map_err(|e| context(format!("operation #{i}: {}", e.root())))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Partition {
        size_blocks: size / u64::from(block_size),
        operations,
        new_sha256: new_info.hash,
        old_info,
        version: p.version,
        name,
    })
}

fn convert_extents(raw: Vec<proto::Extent>, block_size: u32) -> Result<Vec<Extent>> {
    let extents = raw
        .into_iter()
        .map(|e| {
            Ok(Extent {
                start_block: e.start_block.ok_or_else(|| invalid("start_block is missing"))?,
                num_blocks: e.num_blocks.ok_or_else(|| invalid("num_blocks is missing"))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Reject anything whose byte arithmetic overflows up front.
    extent::to_byte_ranges(&extents, block_size)?;

    Ok(extents)
}

fn convert_operation(op: proto::InstallOperation, block_size: u32) -> Result<InstallOperation> {
    let kind = OperationKind::from_raw(op.r#type);

    let dst_extents = convert_extents(op.dst_extents, block_size)?;
    if dst_extents.is_empty() {
        return Err(invalid("no destination extents"));
    }

    let src_extents = convert_extents(op.src_extents, block_size)?;
    if kind.requires_source() && src_extents.is_empty() {
        return Err(invalid("no source extents"));
    }

    let data = match (op.data_offset, op.data_length) {
        (Some(offset), Some(length)) => {
            offset
                .checked_add(length)
                .ok_or_else(|| invalid("data range overflows"))?;
            Some(DataRange { offset, length })
        }
        // Zero-length blobs are allowed to omit the offset.
        (None, Some(0)) => Some(DataRange {
            offset: 0,
            length: 0,
        }),
        _ => None,
    };
    if kind.requires_data() && data.is_none() {
        return Err(invalid("data_offset or data_length is missing"));
    }

    Ok(InstallOperation {
        kind,
        data,
        src_extents,
        dst_extents,
        data_sha256: op.data_sha256_hash,
        src_sha256: op.src_sha256_hash,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn raw_extent(start_block: u64, num_blocks: u64) -> proto::Extent {
        proto::Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn raw_partition(name: &str, size: u64, ops: Vec<proto::InstallOperation>) -> proto::PartitionUpdate {
        proto::PartitionUpdate {
            partition_name: name.to_owned(),
            new_partition_info: Some(proto::PartitionInfo {
                size: Some(size),
                hash: None,
            }),
            operations: ops,
            ..Default::default()
        }
    }

    fn raw_op(r#type: i32, dst: Vec<proto::Extent>) -> proto::InstallOperation {
        proto::InstallOperation {
            r#type,
            dst_extents: dst,
            ..Default::default()
        }
    }

    fn raw_manifest(partitions: Vec<proto::PartitionUpdate>) -> proto::DeltaArchiveManifest {
        proto::DeltaArchiveManifest {
            block_size: Some(4096),
            partitions,
            ..Default::default()
        }
    }

    #[test]
    fn block_size_defaults_to_4096() {
        let mut raw = raw_manifest(vec![]);
        raw.block_size = None;

        let manifest = Manifest::parse(&raw.encode_to_vec()).unwrap();
        assert_eq!(manifest.block_size(), 4096);
        assert!(manifest.is_full_payload());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut raw = raw_manifest(vec![]);
        raw.block_size = Some(0);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn truncated_manifest_is_rejected() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            4096,
            vec![raw_op(Type::Zero as i32, vec![raw_extent(0, 1)])],
        )]);
        let bytes = raw.encode_to_vec();

        assert_matches!(
            Manifest::parse(&bytes[..bytes.len() - 3]),
            Err(Error::Manifest(_))
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            8192,
            vec![raw_op(Type::Zero as i32, vec![raw_extent(0, 2)])],
        )]);
        let mut bytes = raw.encode_to_vec();
        // Field 99, length-delimited, 3 bytes.
        bytes.extend_from_slice(&[0x9a, 0x06, 0x03, b'n', b'e', b'w']);

        let manifest = Manifest::parse(&bytes).unwrap();
        let boot = manifest.find_partition("boot").unwrap();
        assert_eq!(boot.size_blocks, 2);
        assert_eq!(boot.operations[0].kind, OperationKind::Zero);
    }

    #[test]
    fn unknown_opcodes_are_retained() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            4096,
            vec![
                raw_op(Type::Puffdiff as i32, vec![raw_extent(0, 1)]),
                raw_op(14, vec![raw_extent(0, 1)]),
                raw_op(1234, vec![raw_extent(0, 1)]),
            ],
        )]);

        let manifest = Manifest::try_from(raw).unwrap();
        let ops = &manifest.partitions()[0].operations;

        assert_eq!(ops[0].kind, OperationKind::Unknown(OpCode(9)));
        assert_eq!(OpCode(9).to_string(), "PUFFDIFF (9)");
        assert_eq!(ops[1].kind, OperationKind::Unknown(OpCode(14)));
        assert_eq!(OpCode(14).to_string(), "ZSTD (14)");
        assert_eq!(ops[2].kind, OperationKind::Unknown(OpCode(1234)));
        assert_eq!(OpCode(1234).to_string(), "unknown type 1234");
    }

    #[test]
    fn overflowing_extents_are_rejected() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            4096,
            vec![raw_op(Type::Zero as i32, vec![raw_extent(u64::MAX / 4096 + 1, 1)])],
        )]);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn duplicate_partitions_are_rejected() {
        let raw = raw_manifest(vec![
            raw_partition("boot", 4096, vec![]),
            raw_partition("boot", 4096, vec![]),
        ]);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn unaligned_partition_size_is_rejected() {
        let raw = raw_manifest(vec![raw_partition("boot", 4097, vec![])]);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn data_carrying_ops_need_a_data_range() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            4096,
            vec![raw_op(Type::ReplaceXz as i32, vec![raw_extent(0, 1)])],
        )]);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn source_ops_need_source_extents() {
        let raw = raw_manifest(vec![raw_partition(
            "boot",
            4096,
            vec![raw_op(Type::SourceCopy as i32, vec![raw_extent(0, 1)])],
        )]);

        assert_matches!(Manifest::try_from(raw), Err(Error::InvalidManifest(_)));
    }

    #[test]
    fn finds_partitions_and_payload_kind() {
        let mut copy = raw_op(Type::SourceCopy as i32, vec![raw_extent(0, 1)]);
        copy.src_extents = vec![raw_extent(3, 1)];

        let raw = raw_manifest(vec![
            raw_partition("boot", 4096, vec![copy]),
            raw_partition("vendor_boot", 4096, vec![]),
        ]);
        let manifest = Manifest::try_from(raw).unwrap();

        assert!(manifest.find_partition("boot").unwrap().requires_source());
        assert!(!manifest.find_partition("vendor_boot").unwrap().requires_source());
        assert_matches!(
            manifest.find_partition("system"),
            Err(Error::NotFound(name)) if name == "system"
        );
    }

    #[test]
    fn header_fields_survive_partition_conversion() {
        let mut raw = raw_manifest(vec![
            raw_partition("boot", 4096, vec![]),
            raw_partition("system", 8192, vec![]),
        ]);
        raw.minor_version = Some(8);
        raw.partial_update = Some(true);
        raw.max_timestamp = Some(1_700_000_000);
        raw.security_patch_level = Some("2024-05-01".to_owned());
        raw.dynamic_partition_metadata = Some(proto::DynamicPartitionMetadata {
            groups: vec![proto::DynamicPartitionGroup {
                name: "main".to_owned(),
                size: Some(1 << 30),
                partition_names: vec!["system".to_owned()],
            }],
            snapshot_enabled: Some(true),
            ..Default::default()
        });

        let manifest = Manifest::parse(&raw.encode_to_vec()).unwrap();

        assert_eq!(manifest.partitions().len(), 2);
        assert_eq!(manifest.minor_version(), 8);
        assert!(manifest.partial_update());
        assert_eq!(manifest.max_timestamp(), Some(1_700_000_000));
        assert_eq!(manifest.security_patch_level(), Some("2024-05-01"));

        let dynamic = manifest.dynamic_partition_metadata().unwrap();
        assert!(dynamic.snapshot_enabled);
        assert_eq!(dynamic.groups[0].name, "main");
        assert_eq!(dynamic.groups[0].partition_names, ["system"]);
    }
}
