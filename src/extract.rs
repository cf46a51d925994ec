//! Partition extraction: planning, parallel execution and verification.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extent;
use crate::manifest::{Manifest, OperationKind, Partition};
use crate::operation::{self, OperationContext};
use crate::payload::Payload;
use crate::stream::{ReadAt, WriteAt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Check the partition digest and per-operation hashes when present.
    pub verify: bool,
    /// Require the partition digest and data hashes to be present. Implies
    /// `verify`.
    pub strict: bool,
    /// Accept partitions whose operations leave parts of the image unwritten.
    /// Unwritten bytes read as zero.
    pub allow_holes: bool,
    /// Return the image digest even if the manifest declares none.
    pub compute_digest: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            verify: true,
            strict: false,
            allow_holes: false,
            compute_digest: false,
        }
    }
}

impl ExtractOptions {
    fn verify(&self) -> bool {
        self.verify || self.strict
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractReport {
    pub name: String,
    pub size: u64,
    /// SHA-256 of the written image, when it was computed.
    pub digest: Option<[u8; 32]>,
}

/// A partition that passed every check not requiring I/O.
#[derive(Clone, Debug)]
pub struct ExtractionPlan<'a> {
    partition: &'a Partition,
    block_size: u32,
    size: u64,
    options: ExtractOptions,
}

impl<'a> ExtractionPlan<'a> {
    /// Validate partition `name` of `manifest` for extraction.
    ///
    /// Checks, in order: the partition exists, hashes required by strict mode
    /// are present, every opcode is supported, a source image is available
    /// if any operation needs one, destination ranges map cleanly (with
    /// SOURCE_COPY and REPLACE lengths matching their destination), they are
    /// in bounds and disjoint, and unless holes are allowed every byte is
    /// written.
    pub fn new(
        manifest: &'a Manifest,
        name: &str,
        source_available: bool,
        options: ExtractOptions,
    ) -> Result<Self> {
        let partition = manifest.find_partition(name)?;
        let block_size = manifest.block_size();
        let size = manifest.partition_size(partition);

        Self::check(partition, block_size, size, source_available, &options)
            .map_err(|(e, op)| e.in_partition(name, op))?;

        Ok(Self {
            partition,
            block_size,
            size,
            options,
        })
    }

    fn check(
        partition: &Partition,
        block_size: u32,
        size: u64,
        source_available: bool,
        options: &ExtractOptions,
    ) -> std::result::Result<(), (Error, Option<usize>)> {
        let ops = &partition.operations;

        if options.strict {
            if partition.new_sha256.is_none() {
                return Err((Error::MissingHash("partition"), None));
            }
            if let Some(i) = ops.iter().position(|op| {
                op.data.is_some_and(|d| d.length > 0) && op.data_sha256.is_none()
            }) {
                return Err((Error::MissingHash("operation data"), Some(i)));
            }
        }

        for (i, op) in ops.iter().enumerate() {
            if let OperationKind::Unknown(code) = op.kind {
                return Err((Error::UnsupportedOperation(code), Some(i)));
            }
        }

        if !source_available
            && let Some(i) = ops.iter().position(|op| op.kind.requires_source())
        {
            return Err((Error::MissingSourceImage, Some(i)));
        }

        let mut ranges = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let dst = extent::to_byte_ranges(&op.dst_extents, block_size).map_err(|e| (e, Some(i)))?;
            let dst_len = extent::total_length(&dst);

            // Lengths that must equal the destination length exactly.
            let fixed = match op.kind {
                OperationKind::SourceCopy => {
                    let src = extent::to_byte_ranges(&op.src_extents, block_size)
                        .map_err(|e| (e, Some(i)))?;
                    Some(("source extents", extent::total_length(&src)))
                }
                OperationKind::Replace => {
                    Some(("operation data", op.data.map_or(0, |d| d.length)))
                }
                _ => None,
            };
            if let Some((what, actual)) = fixed
                && actual != dst_len
            {
                let e = Error::LengthMismatch {
                    what,
                    expected: dst_len,
                    actual,
                };
                return Err((e, Some(i)));
            }

            ranges.extend(dst);
        }
        extent::validate_disjoint(&ranges, size).map_err(|e| (e, None))?;

        if !options.allow_holes
            && let Some(gap) = extent::find_gap(&ranges, size)
        {
            return Err((Error::Uncovered(gap), None));
        }

        Ok(())
    }

    pub fn partition(&self) -> &'a Partition {
        self.partition
    }

    pub fn name(&self) -> &'a str {
        &self.partition.name
    }

    /// Size in bytes of the image this plan produces.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn operation_count(&self) -> usize {
        self.partition.operations.len()
    }

    /// Write the partition image to `sink`.
    ///
    /// Operations run in parallel on the current rayon pool. The first
    /// failure other than a checksum mismatch, or `cancel` becoming set, stops
    /// the operations that have not started yet. On failure the lowest-index
    /// failed operation is reported and the contents of `sink` are undefined.
    pub fn execute<R, W>(
        &self,
        payload: &Payload<R>,
        sink: &W,
        source: Option<&dyn ReadAt>,
        cancel: &AtomicBool,
    ) -> Result<ExtractReport>
    where
        R: ReadAt,
        W: ReadAt + WriteAt,
    {
        self.execute_with_progress(payload, sink, source, cancel, || {})
    }

    /// Same as [`execute`](Self::execute), calling `progress` after every
    /// completed operation.
    pub fn execute_with_progress<R, W, F>(
        &self,
        payload: &Payload<R>,
        sink: &W,
        source: Option<&dyn ReadAt>,
        cancel: &AtomicBool,
        progress: F,
    ) -> Result<ExtractReport>
    where
        R: ReadAt,
        W: ReadAt + WriteAt,
        F: Fn() + Sync,
    {
        let name = self.name();
        self.run(payload, sink, source, cancel, progress)
            .inspect_err(|(e, _)| warn!(partition = name, "Extraction failed: {e}"))
            .map_err(|(e, op)| e.in_partition(name, op))
    }

    fn run<R, W, F>(
        &self,
        payload: &Payload<R>,
        sink: &W,
        source: Option<&dyn ReadAt>,
        cancel: &AtomicBool,
        progress: F,
    ) -> std::result::Result<ExtractReport, (Error, Option<usize>)>
    where
        R: ReadAt,
        W: ReadAt + WriteAt,
        F: Fn() + Sync,
    {
        let ops = &self.partition.operations;
        let verify = self.options.verify();

        if source.is_none()
            && let Some(i) = ops.iter().position(|op| op.kind.requires_source())
        {
            return Err((Error::MissingSourceImage, Some(i)));
        }

        let start = Instant::now();
        info!(
            partition = self.name(),
            size = self.size,
            operations = ops.len(),
            "Extracting partition"
        );

        // Truncate first so that stale contents never survive in holes.
        sink.set_len(0)
            .and_then(|()| sink.set_len(self.size))
            .map_err(|e| (e.into(), None))?;

        let ctx = OperationContext {
            payload,
            block_size: self.block_size,
            source,
            verify,
        };
        let stop = AtomicBool::new(false);

        let failures = ops
            .par_iter()
            .enumerate()
            .filter_map(|(i, op)| {
                if stop.load(Ordering::Acquire) || cancel.load(Ordering::Acquire) {
                    return None;
                }

                match operation::apply_operation(&ctx, op, sink) {
                    Ok(()) => {
                        progress();
                        None
                    }
                    Err(e) => {
                        // A bad checksum leaves other operations meaningful.
                        if !matches!(e, Error::Checksum { .. }) {
                            stop.store(true, Ordering::Release);
                        }
                        debug!(partition = self.name(), operation = i, "Operation failed: {e}");
                        Some((i, e))
                    }
                }
            })
            .collect::<Vec<_>>();

        if let Some((i, e)) = failures.into_iter().next() {
            return Err((e, Some(i)));
        }
        if cancel.load(Ordering::Acquire) {
            return Err((Error::Cancelled, None));
        }

        let expected = self.partition.new_sha256.as_deref().filter(|_| verify);
        let digest = if expected.is_some() || self.options.compute_digest {
            let digest = operation::sha256_image(sink, self.size).map_err(|e| (e.into(), None))?;
            if let Some(expected) = expected
                && digest.as_slice() != expected
            {
                return Err((Error::checksum("partition image", expected, &digest), None));
            }
            Some(digest)
        } else {
            None
        };

        info!(
            partition = self.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            verified = expected.is_some(),
            "Extracted partition"
        );

        Ok(ExtractReport {
            name: self.name().to_owned(),
            size: self.size,
            digest,
        })
    }
}

/// Plan and extract partition `name` into `sink`.
pub fn extract<R, W>(
    manifest: &Manifest,
    name: &str,
    payload: &Payload<R>,
    sink: &W,
    source: Option<&dyn ReadAt>,
    options: ExtractOptions,
    cancel: &AtomicBool,
) -> Result<ExtractReport>
where
    R: ReadAt,
    W: ReadAt + WriteAt,
{
    ExtractionPlan::new(manifest, name, source.is_some(), options)?.execute(payload, sink, source, cancel)
}

/// Path of the image for partition `name` inside `dir`.
pub fn image_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.img"))
}

fn check_file_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if !valid {
        return Err(Error::InvalidManifest(format!(
            "partition name is not a valid file name: {name:?}"
        )));
    }
    Ok(())
}

/// Extract an already planned partition to `<dir>/<name>.img`.
///
/// The image is written to a hidden temporary file in `dir` and only renamed
/// into place once extraction and verification succeeded. On failure the
/// temporary file is removed and any existing image is left untouched.
pub fn execute_to_dir<R: ReadAt>(
    plan: &ExtractionPlan<'_>,
    payload: &Payload<R>,
    dir: &Path,
    source: Option<&dyn ReadAt>,
    cancel: &AtomicBool,
    progress: impl Fn() + Sync,
) -> Result<ExtractReport> {
    let name = plan.name();
    let wrap = |e: Error| e.in_partition(name, None);

    check_file_name(name).map_err(wrap)?;

    let temp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| wrap(e.into()))?;

    let report = plan.execute_with_progress(payload, temp.as_file(), source, cancel, progress)?;

    temp.as_file().sync_all().map_err(|e| wrap(e.into()))?;
    let path = image_path(dir, name);
    temp.persist(&path).map_err(|e| wrap(e.error.into()))?;

    debug!(partition = name, path = %path.display(), "Persisted image");

    Ok(report)
}

/// Plan and extract partition `name` to `<dir>/<name>.img`. Nothing is
/// created in `dir` if planning fails.
pub fn extract_to_dir<R: ReadAt>(
    manifest: &Manifest,
    name: &str,
    payload: &Payload<R>,
    dir: &Path,
    source: Option<&dyn ReadAt>,
    options: ExtractOptions,
    cancel: &AtomicBool,
) -> Result<ExtractReport> {
    let plan = ExtractionPlan::new(manifest, name, source.is_some(), options)?;
    fs::create_dir_all(dir).map_err(|e| Error::from(e).in_partition(name, None))?;
    execute_to_dir(&plan, payload, dir, source, cancel, || {})
}

/// One row of a partition listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionSummary {
    pub name: String,
    pub size_bytes: u64,
    pub operation_count: usize,
    pub requires_source: bool,
}

/// Summarize every partition in manifest order.
pub fn list_partitions(manifest: &Manifest) -> Vec<PartitionSummary> {
    manifest
        .partitions()
        .iter()
        .map(|p| PartitionSummary {
            name: p.name.clone(),
            size_bytes: manifest.partition_size(p),
            operation_count: p.operations.len(),
            requires_source: p.requires_source(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use prost::Message;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::error::ErrorKind;
    use crate::extent::ByteRange;
    use crate::proto::{self, install_operation::Type};
    use crate::stream::MemoryImage;

    const BS: u64 = 4096;

    fn raw_extent(start_block: u64, num_blocks: u64) -> proto::Extent {
        proto::Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn raw_op(r#type: Type, dst: (u64, u64)) -> proto::InstallOperation {
        proto::InstallOperation {
            r#type: r#type as i32,
            dst_extents: vec![raw_extent(dst.0, dst.1)],
            ..Default::default()
        }
    }

    fn replace(dst: (u64, u64), offset: u64, data: &[u8]) -> proto::InstallOperation {
        proto::InstallOperation {
            data_offset: Some(offset),
            data_length: Some(data.len() as u64),
            data_sha256_hash: Some(Sha256::digest(data).to_vec()),
            ..raw_op(Type::Replace, dst)
        }
    }

    fn manifest(blocks: u64, hash: Option<Vec<u8>>, ops: Vec<proto::InstallOperation>) -> Manifest {
        Manifest::try_from(proto::DeltaArchiveManifest {
            partitions: vec![proto::PartitionUpdate {
                partition_name: "boot".to_owned(),
                new_partition_info: Some(proto::PartitionInfo {
                    size: Some(blocks * BS),
                    hash,
                }),
                operations: ops,
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap()
    }

    fn payload(data: &[u8]) -> Payload<Vec<u8>> {
        let manifest = proto::DeltaArchiveManifest::default().encode_to_vec();
        let mut bytes = b"CrAU".to_vec();
        bytes.extend_from_slice(&2u64.to_be_bytes());
        bytes.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&manifest);
        bytes.extend_from_slice(data);
        Payload::open(bytes).unwrap()
    }

    fn plan_error(manifest: &Manifest, source: bool, options: ExtractOptions) -> Error {
        ExtractionPlan::new(manifest, "boot", source, options).unwrap_err()
    }

    #[test]
    fn unknown_partition_is_not_found() {
        let m = manifest(1, None, vec![raw_op(Type::Zero, (0, 1))]);
        assert_matches!(
            ExtractionPlan::new(&m, "vendor", false, ExtractOptions::default()),
            Err(Error::NotFound(name)) if name == "vendor"
        );
    }

    #[test]
    fn unsupported_opcode_is_reported_before_missing_source() {
        let mut copy = raw_op(Type::SourceCopy, (0, 1));
        copy.src_extents = vec![raw_extent(0, 1)];
        let m = manifest(2, None, vec![copy, raw_op(Type::Zucchini, (1, 1))]);

        let err = plan_error(&m, false, ExtractOptions::default());
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(err.partition(), Some("boot"));
        assert_eq!(err.operation(), Some(1));
    }

    #[test]
    fn missing_source_names_first_source_operation() {
        let mut copy = raw_op(Type::SourceCopy, (1, 1));
        copy.src_extents = vec![raw_extent(0, 1)];
        let m = manifest(2, None, vec![raw_op(Type::Zero, (0, 1)), copy]);

        let err = plan_error(&m, false, ExtractOptions::default());
        assert_matches!(err.root(), Error::MissingSourceImage);
        assert_eq!(err.operation(), Some(1));

        ExtractionPlan::new(&m, "boot", true, ExtractOptions::default()).unwrap();
    }

    #[test]
    fn length_mismatches_are_caught_while_planning() {
        let mut copy = raw_op(Type::SourceCopy, (1, 2));
        copy.src_extents = vec![raw_extent(0, 1)];
        let m = manifest(3, None, vec![replace((0, 1), 0, &[7; BS as usize]), copy]);

        let err = plan_error(&m, true, ExtractOptions::default());
        assert_matches!(
            err.root(),
            Error::LengthMismatch { what: "source extents", expected, actual }
                if *expected == 2 * BS && *actual == BS
        );
        assert_eq!(err.partition(), Some("boot"));
        assert_eq!(err.operation(), Some(1));

        let short = replace((1, 1), 0, &[7; 100]);
        let m = manifest(2, None, vec![raw_op(Type::Zero, (0, 1)), short]);

        let err = plan_error(&m, false, ExtractOptions::default());
        assert_matches!(
            err.root(),
            Error::LengthMismatch { what: "operation data", expected, actual: 100 }
                if *expected == BS
        );
        assert_eq!(err.operation(), Some(1));
    }

    #[test]
    fn overlapping_destinations_are_rejected() {
        let m = manifest(
            4,
            None,
            vec![raw_op(Type::Zero, (0, 3)), raw_op(Type::Zero, (2, 2))],
        );

        let err = plan_error(&m, false, ExtractOptions::default());
        assert_matches!(err.root(), Error::Overlap { first, second }
            if *first == ByteRange::new(0, 3 * BS) && *second == ByteRange::new(2 * BS, 2 * BS));
        assert_eq!(err.operation(), None);
    }

    #[test]
    fn destinations_past_partition_end_are_rejected() {
        let m = manifest(2, None, vec![raw_op(Type::Zero, (1, 2))]);
        assert_eq!(
            plan_error(&m, false, ExtractOptions::default()).kind(),
            ErrorKind::OutOfBounds
        );
    }

    #[test]
    fn holes_fail_unless_allowed() {
        let m = manifest(3, None, vec![raw_op(Type::Zero, (0, 1)), raw_op(Type::Zero, (2, 1))]);

        assert_matches!(
            plan_error(&m, false, ExtractOptions::default()).root(),
            Error::Uncovered(gap) if *gap == ByteRange::new(BS, BS)
        );

        let options = ExtractOptions {
            allow_holes: true,
            ..Default::default()
        };
        ExtractionPlan::new(&m, "boot", false, options).unwrap();
    }

    #[test]
    fn strict_mode_requires_hashes() {
        let strict = ExtractOptions {
            strict: true,
            ..Default::default()
        };

        let m = manifest(1, None, vec![raw_op(Type::Zero, (0, 1))]);
        assert_matches!(plan_error(&m, false, strict).root(), Error::MissingHash("partition"));

        let mut op = replace((0, 1), 0, &[0; 4096]);
        op.data_sha256_hash = None;
        let m = manifest(1, Some(vec![0; 32]), vec![op]);
        let err = plan_error(&m, false, strict);
        assert_matches!(err.root(), Error::MissingHash("operation data"));
        assert_eq!(err.operation(), Some(0));
    }

    #[test]
    fn executes_and_verifies_partition() {
        let data = (0..2 * BS).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut image = data.clone();
        image.extend_from_slice(&[0; BS as usize]);
        let digest: [u8; 32] = Sha256::digest(&image).into();

        let m = manifest(
            3,
            Some(digest.to_vec()),
            vec![
                replace((1, 1), BS, &data[BS as usize..]),
                raw_op(Type::Zero, (2, 1)),
                replace((0, 1), 0, &data[..BS as usize]),
            ],
        );
        let payload = payload(&data);
        let sink = MemoryImage::new();

        let report = extract(
            &m,
            "boot",
            &payload,
            &sink,
            None,
            ExtractOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(
            report,
            ExtractReport {
                name: "boot".to_owned(),
                size: 3 * BS,
                digest: Some(digest),
            }
        );
        assert_eq!(sink.into_inner(), image);
    }

    #[test]
    fn image_digest_mismatch_has_no_operation_index() {
        let m = manifest(1, Some(vec![0; 32]), vec![raw_op(Type::Zero, (0, 1))]);
        let payload = payload(&[]);

        let err = extract(
            &m,
            "boot",
            &payload,
            &MemoryImage::new(),
            None,
            ExtractOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap_err();

        assert_matches!(err.root(), Error::Checksum { what: "partition image", .. });
        assert_eq!(err.operation(), None);

        // Not verified, and no digest is computed unless requested.
        let options = ExtractOptions {
            verify: false,
            ..Default::default()
        };
        let report = extract(&m, "boot", &payload, &MemoryImage::new(), None, options, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.digest, None);
    }

    #[test]
    fn cancelled_extraction_fails() {
        let m = manifest(1, None, vec![raw_op(Type::Zero, (0, 1))]);
        let payload = payload(&[]);

        let err = extract(
            &m,
            "boot",
            &payload,
            &MemoryImage::new(),
            None,
            ExtractOptions::default(),
            &AtomicBool::new(true),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn lists_partitions_in_manifest_order() {
        let mut copy = raw_op(Type::SourceCopy, (0, 1));
        copy.src_extents = vec![raw_extent(0, 1)];
        let m = manifest(2, None, vec![copy, raw_op(Type::Zero, (1, 1))]);

        assert_eq!(
            list_partitions(&m),
            [PartitionSummary {
                name: "boot".to_owned(),
                size_bytes: 2 * BS,
                operation_count: 2,
                requires_source: true,
            }]
        );
    }

    #[test]
    fn rejects_partition_names_that_escape_the_directory() {
        check_file_name("system_ext").unwrap();
        assert_matches!(check_file_name("../boot"), Err(Error::InvalidManifest(_)));
        assert_matches!(check_file_name(".."), Err(Error::InvalidManifest(_)));
        assert_matches!(check_file_name(""), Err(Error::InvalidManifest(_)));
    }
}
