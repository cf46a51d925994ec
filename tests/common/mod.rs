#![allow(dead_code)]

use std::io::Write;

use bzip2::write::BzEncoder;
use otaextract::proto::{self, install_operation::Type};
use prost::Message;
use sha2::{Digest, Sha256};
use xz2::write::XzEncoder;

pub const BLOCK_SIZE: u64 = 4096;

/// Assembles `payload.bin` images from manifest parts and data blobs.
pub struct PayloadBuilder {
    version: u64,
    block_size: u32,
    data: Vec<u8>,
    partitions: Vec<proto::PartitionUpdate>,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            version: 2,
            block_size: BLOCK_SIZE as u32,
            data: Vec::new(),
            partitions: Vec::new(),
        }
    }
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Append `blob` to the operation data region and return an operation of
    /// type `r#type` that refers to it.
    pub fn data_op(&mut self, r#type: Type, blob: &[u8], dst: &[(u64, u64)]) -> proto::InstallOperation {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(blob);

        proto::InstallOperation {
            data_offset: Some(offset),
            data_length: Some(blob.len() as u64),
            data_sha256_hash: Some(sha256(blob)),
            ..op(r#type, dst)
        }
    }

    pub fn partition(
        &mut self,
        name: &str,
        blocks: u64,
        hash: Option<Vec<u8>>,
        operations: Vec<proto::InstallOperation>,
    ) -> &mut Self {
        self.partitions.push(proto::PartitionUpdate {
            partition_name: name.to_owned(),
            new_partition_info: Some(proto::PartitionInfo {
                size: Some(blocks * BLOCK_SIZE),
                hash,
            }),
            operations,
            ..Default::default()
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let manifest = proto::DeltaArchiveManifest {
            block_size: Some(self.block_size),
            minor_version: Some(0),
            partitions: self.partitions.clone(),
            ..Default::default()
        }
        .encode_to_vec();
        let signature = b"not a real signature";

        let mut out = b"CrAU".to_vec();
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
        if self.version > 1 {
            out.extend_from_slice(&(signature.len() as u32).to_be_bytes());
        }
        out.extend_from_slice(&manifest);
        if self.version > 1 {
            out.extend_from_slice(signature);
        }
        out.extend_from_slice(&self.data);
        out
    }
}

pub fn extents(ranges: &[(u64, u64)]) -> Vec<proto::Extent> {
    ranges
        .iter()
        .map(|&(start_block, num_blocks)| proto::Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        })
        .collect()
}

pub fn op(r#type: Type, dst: &[(u64, u64)]) -> proto::InstallOperation {
    proto::InstallOperation {
        r#type: r#type as i32,
        dst_extents: extents(dst),
        ..Default::default()
    }
}

pub fn source_op(r#type: Type, src: &[(u64, u64)], dst: &[(u64, u64)]) -> proto::InstallOperation {
    proto::InstallOperation {
        src_extents: extents(src),
        ..op(r#type, dst)
    }
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::best());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic, non-repeating test content.
pub fn pattern(blocks: u64, seed: u8) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 12) as u8)
        .collect()
}

pub fn block(data: &[u8], start: u64, count: u64) -> &[u8] {
    &data[(start * BLOCK_SIZE) as usize..((start + count) * BLOCK_SIZE) as usize]
}

/// Uncompressed BSDF2 patch turning `old` into `new` with a single diff run.
/// Both must have the same length.
pub fn bsdf2_patch(old: &[u8], new: &[u8]) -> Vec<u8> {
    assert_eq!(old.len(), new.len());

    let diff = old
        .iter()
        .zip(new)
        .map(|(o, n)| n.wrapping_sub(*o))
        .collect::<Vec<_>>();
    let mut control = Vec::new();
    control.extend_from_slice(&(new.len() as u64).to_le_bytes());
    control.extend_from_slice(&0u64.to_le_bytes());
    control.extend_from_slice(&0u64.to_le_bytes());

    let mut out = b"BSDF2".to_vec();
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(control.len() as u64).to_le_bytes());
    out.extend_from_slice(&(diff.len() as u64).to_le_bytes());
    out.extend_from_slice(&(new.len() as u64).to_le_bytes());
    out.extend_from_slice(&control);
    out.extend_from_slice(&diff);
    out
}
