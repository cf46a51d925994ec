use crate::error::Error;
use crate::extract::{self, ExtractOptions, ExtractReport, ExtractionPlan};
use crate::manifest::Manifest;
use crate::payload::Payload;
use crate::stream::ReadAt;
use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, ValueHint};
use console::Style;
use crossbeam_channel::unbounded;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};
use memmap2::Mmap;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cmp::Reverse;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use std::env;
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

const PROGRESS_UPDATE_FREQUENCY_HIGH: u8 = 2; // Hz for progress updates when partition count <= 32
const PROGRESS_UPDATE_FREQUENCY_LOW: u8 = 1; // Hz for progress updates when partition count > 32
const MAX_THREADS: usize = 256;

#[derive(Debug, Parser)]
#[clap(
    about,
    author,
    disable_help_subcommand = true,
    help_template = FRIENDLY_HELP,
    propagate_version = true,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cmd {
    /// OTA file, either a .zip file or a payload.bin.
    #[clap(short = 'p', long = "path", value_hint = ValueHint::FilePath, value_name = "PATH")]
    payload: Option<PathBuf>,

    /// List partitions instead of extracting them
    #[clap(
        conflicts_with = "output_dir",
        conflicts_with = "partitions",
        conflicts_with = "source",
        long,
        short
    )]
    list: bool,

    /// Number of threads to use during extraction (0 = all cores)
    #[clap(long, short, env = "OTAEXTRACT_THREADS", value_name = "NUMBER")]
    threads: Option<usize>,

    /// Set output directory
    #[clap(long, short, value_hint = ValueHint::DirPath, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Dump only selected partitions (comma-separated, or "all")
    #[clap(long, value_delimiter = ',', value_name = "PARTITIONS")]
    partitions: Vec<String>,

    /// Previous images for delta payloads: an image file when extracting a
    /// single partition, or a directory containing <name>.img files
    #[clap(long, short, value_hint = ValueHint::AnyPath, value_name = "PATH")]
    source: Option<PathBuf>,

    /// Skip file verification (dangerous!)
    #[clap(long, conflicts_with = "strict")]
    no_verify: bool,

    /// Require manifest hashes for partitions and operations; enforce
    /// verification and fail if any required hash is missing.
    #[clap(long)]
    strict: bool,

    /// Accept partitions whose operations do not write every block. Unwritten
    /// blocks are left zeroed.
    #[clap(long)]
    allow_holes: bool,

    /// Compute and print the SHA-256 of each extracted partition image.
    #[clap(long)]
    print_hash: bool,

    /// Print per-partition and total timing/throughput statistics after extraction.
    #[clap(long)]
    stats: bool,

    /// Positional argument for the payload file
    #[clap(value_hint = ValueHint::FilePath)]
    #[clap(index = 1, value_name = "PATH")]
    positional_payload: Option<PathBuf>,
}

/// Memory-mapped payload. Payloads inside a zip archive are spooled to an
/// anonymous temporary file first; the file is kept open for the lifetime of
/// the mapping.
pub struct PayloadFile {
    map: Mmap,
    _spool: Option<File>,
}

impl ReadAt for PayloadFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.map.read_exact_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.map.len() as u64)
    }
}

/// Result of extracting a single partition, sent back from the workers.
struct Outcome {
    order: usize,
    name: String,
    result: crate::error::Result<ExtractReport>,
    elapsed_ms: u128,
}

impl Cmd {
    pub fn run(&self) -> Result<()> {
        if let Some(t) = self.threads
            && t > MAX_THREADS
        {
            bail!(
                "Thread count must be between 1 and {MAX_THREADS}, got {t}. \
                Use 0 or omit -t to use all available CPU cores (recommended)."
            );
        }

        let payload_path = self.payload.as_ref().or(self.positional_payload.as_ref())
            .ok_or_else(|| anyhow::anyhow!(
                "No payload file specified. Please provide a payload file using -p/--path or as a positional argument.\n\nExamples:\n  otaextract payload.bin\n  otaextract -p ota.zip\n  otaextract --path update.zip"
            ))?;

        let payload = self.open_payload_file(payload_path)?;
        let payload = Payload::open(payload)
            .with_context(|| format!("invalid payload: {payload_path:?}"))?;
        let manifest = Manifest::parse(payload.manifest_bytes()?).context("unable to parse manifest")?;

        if self.list {
            self.print_listing(&payload, &manifest);
            return Ok(());
        }

        self.extract_all(&payload, &manifest)
    }

    fn print_listing(&self, payload: &Payload<PayloadFile>, manifest: &Manifest) {
        let bold = Style::new().bold();
        let bold_green = Style::new().bold().green();
        let dim = Style::new().dim();

        let kind = if manifest.is_full_payload() { "full" } else { "delta" };
        println!(
            "{} v{} ({kind}), block size {}, minor version {}",
            bold.apply_to("Payload"),
            payload.header().version,
            manifest.block_size(),
            manifest.minor_version(),
        );
        if let Some(spl) = manifest.security_patch_level() {
            println!("Security patch level: {spl}");
        }
        println!();

        let partitions = extract::list_partitions(manifest);
        let width = partitions.iter().map(|p| p.name.len()).max().unwrap_or(0);
        for p in &partitions {
            let name = format!("{:<width$}", p.name);
            let delta = if p.requires_source { " (needs source)" } else { "" };
            println!(
                "{} {:>12} {}{}",
                bold_green.apply_to(name),
                HumanBytes(p.size_bytes).to_string(),
                dim.apply_to(format!("{} ops", p.operation_count)),
                delta,
            );
        }
    }

    fn extract_all(&self, payload: &Payload<PayloadFile>, manifest: &Manifest) -> Result<()> {
        let (names, mut failures) = select_partitions(manifest, &self.partitions);
        let options = ExtractOptions {
            verify: !self.no_verify,
            strict: self.strict,
            allow_holes: self.allow_holes,
            compute_digest: self.print_hash,
        };

        if let Some(source) = &self.source
            && source.is_file()
            && names.len() > 1
        {
            bail!("--source is a file, so exactly one partition must be selected with --partitions");
        }

        // Plan everything up front so no file is created for a partition
        // that cannot be extracted.
        let mut jobs = Vec::new();
        for name in names {
            let source = self.open_source(name)?;
            match ExtractionPlan::new(manifest, name, source.is_some(), options) {
                Ok(plan) => jobs.push((plan, source)),
                Err(e) => failures.push((name.to_owned(), e)),
            }
        }
        jobs.sort_unstable_by_key(|(plan, _)| Reverse(plan.size()));

        let total_start = Instant::now();
        let mut outcomes = Vec::new();

        if !jobs.is_empty() {
            let (partition_dir, created_new_dir) = self.create_partition_dir()?;
            outcomes = self.run_jobs(payload, &jobs, &partition_dir)?;

            let any_extracted = outcomes.iter().any(|o| o.result.is_ok());
            if created_new_dir && !any_extracted {
                let _ = fs::remove_dir_all(&partition_dir);
            }
            if any_extracted {
                self.display_output(&partition_dir, &outcomes);
            }
        }

        outcomes.sort_unstable_by_key(|o| o.order);
        if self.print_hash {
            self.print_hashes(&outcomes);
        }
        if self.stats {
            self.print_stats(&outcomes, total_start.elapsed().as_millis());
        }

        let requested = failures.len() + outcomes.len();
        failures.extend(
            outcomes
                .into_iter()
                .filter_map(|o| o.result.err().map(|e| (o.name, e))),
        );

        if failures.is_empty() {
            return Ok(());
        }

        let bold_red = Style::new().bold().red();
        eprintln!();
        for (name, e) in &failures {
            eprintln!(
                "{} {}: {e} [{}]",
                bold_red.apply_to("FAILED"),
                name,
                e.kind(),
            );
        }
        bail!(
            "{} of {} partition(s) could not be extracted. No partial images were kept.",
            failures.len(),
            requested
        );
    }

    fn run_jobs(
        &self,
        payload: &Payload<PayloadFile>,
        jobs: &[(ExtractionPlan<'_>, Option<File>)],
        partition_dir: &Path,
    ) -> Result<Vec<Outcome>> {
        let cancellation_token = Arc::new(AtomicBool::new(false));
        let cancellation_token_ctrlc = Arc::clone(&cancellation_token);
        ctrlc::set_handler(move || {
            eprintln!("\n\n Received interrupt signal (Ctrl+C). Cleaning up and exiting...");
            // Workers stop at the next operation boundary and drop their
            // temporary files.
            cancellation_token_ctrlc.store(true, Ordering::Release);
        })
        .context("Failed to set up Ctrl+C handler")?;

        let threadpool = self.get_threadpool()?;
        if self.threads.is_some_and(|t| t > 0) {
            eprintln!(
                "Using {} worker thread(s)",
                threadpool.current_num_threads()
            );
        }

        let bold_bright_red = Style::new().bold().red();
        let bold_yellow = Style::new().bold().yellow();
        let bold_bright_green = Style::new().bold().green();
        eprintln!(
            "\n{}: do {} close this window! Use {} to cancel safely.",
            bold_yellow.apply_to("Extraction in progress"),
            bold_bright_red.apply_to("NOT"),
            bold_bright_green.apply_to("Ctrl+C")
        );
        eprintln!(
            "Processing {} partitions using {} threads...",
            jobs.len(),
            threadpool.current_num_threads()
        );
        eprintln!();

        let multiprogress = {
            // Setting a fixed update frequency reduces flickering.
            let hz = if jobs.len() > 32 { PROGRESS_UPDATE_FREQUENCY_LOW } else { PROGRESS_UPDATE_FREQUENCY_HIGH };
            MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(hz))
        };

        let (sender, receiver) = unbounded::<Outcome>();
        threadpool.scope(|scope| -> Result<()> {
            for (order, (plan, source)) in jobs.iter().enumerate() {
                let progress_bar = multiprogress.add(self.create_progress_bar(plan)?);
                let sender = sender.clone();
                let cancellation_token = &cancellation_token;

                scope.spawn(move |_| {
                    let start = Instant::now();
                    let source = source.as_ref().map(|f| f as &dyn ReadAt);
                    let result = extract::execute_to_dir(
                        plan,
                        payload,
                        partition_dir,
                        source,
                        cancellation_token,
                        || progress_bar.inc(1),
                    );

                    if result.is_err() {
                        progress_bar.abandon();
                    }
                    let _ = sender.send(Outcome {
                        order,
                        name: plan.name().to_owned(),
                        result,
                        elapsed_ms: start.elapsed().as_millis(),
                    });
                });
            }
            Ok(())
        })?;
        drop(sender);

        if cancellation_token.load(Ordering::Acquire) {
            eprintln!("Extraction cancelled. Partially extracted images have been removed.");
        }

        Ok(receiver.iter().collect())
    }

    fn create_progress_bar(&self, plan: &ExtractionPlan<'_>) -> Result<ProgressBar> {
        let finish = ProgressFinish::AndLeave;
        let style = ProgressStyle::with_template(
            "{prefix:>16!.green.bold} [{wide_bar:.white.dim}] {percent:>3.white}%",
        )
        .context("unable to build progress bar template")?
        .progress_chars("=> ");
        let bar = ProgressBar::new(plan.operation_count() as u64)
            .with_finish(finish)
            .with_prefix(plan.name().to_string())
            .with_style(style);
        Ok(bar)
    }

    /// A zip archive has its `payload.bin` spooled to a temporary file, which
    /// is then memory-mapped like a bare payload.
    fn open_payload_file(&self, path: &Path) -> Result<PayloadFile> {
        let file = File::open(path)
            .with_context(|| format!("unable to open file for reading: {path:?}"))?;

        // Attempt to open as a zip archive. If it fails with InvalidArchive,
        // we assume it's a raw payload.bin file.
        let spool = match ZipArchive::new(&file) {
            Ok(mut archive) => {
                let mut zipfile = archive
                    .by_name("payload.bin")
                    .context("could not find payload.bin file in archive")?;

                let mut spool = tempfile::tempfile().context("failed to create temporary file")?;
                io::copy(&mut zipfile, &mut spool)
                    .context("failed to decompress payload.bin from archive")?;
                debug!(size = zipfile.size(), "Spooled payload.bin from archive");
                Some(spool)
            }
            Err(ZipError::InvalidArchive(_)) => None,
            Err(e) => return Err(e).context("failed to open zip archive"),
        };

        // SAFETY: the payload is only read, and the file is not expected to
        // change while it is being extracted.
        let map = unsafe { Mmap::map(spool.as_ref().unwrap_or(&file)) }
            .with_context(|| format!("failed to mmap file: {path:?}"))?;

        Ok(PayloadFile { map, _spool: spool })
    }

    /// Open the previous image of partition `name`, if one was supplied.
    fn open_source(&self, name: &str) -> Result<Option<File>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };

        let path = if source.is_dir() {
            let path = extract::image_path(source, name);
            if !path.exists() {
                return Ok(None);
            }
            path
        } else {
            source.clone()
        };

        let file = File::open(&path)
            .with_context(|| format!("unable to open source image: {path:?}"))?;
        Ok(Some(file))
    }

    fn create_partition_dir(&self) -> Result<(PathBuf, bool)> {
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => {
                // When no -o is specified, create timestamped folder in current directory
                let now = Local::now();
                let current_dir = env::current_dir().with_context(|| {
                    "Failed to determine current directory. Please specify --output-dir explicitly."
                })?;
                current_dir.join(now.format("extracted_%Y%m%d_%H%M%S").to_string())
            }
        };
        let existed = dir.exists();
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create output directory: {dir:?}"))?;
        Ok((dir, !existed))
    }

    fn get_threadpool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(t) = self.threads
            && t > 0
        {
            builder = builder.num_threads(t);
        }
        builder.build().context("unable to start threadpool")
    }

    fn print_hashes(&self, outcomes: &[Outcome]) {
        let hashes = outcomes
            .iter()
            .filter_map(|o| {
                let report = o.result.as_ref().ok()?;
                Some((&report.name, report.digest?))
            })
            .collect::<Vec<_>>();
        if hashes.is_empty() {
            return;
        }

        println!("Partition hashes (SHA-256):");
        for (name, digest) in hashes {
            println!("{}: sha256={}", name, hex::encode(digest));
        }
    }

    fn print_stats(&self, outcomes: &[Outcome], wall_ms: u128) {
        let done = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|r| (r, o.elapsed_ms)))
            .collect::<Vec<_>>();
        if done.is_empty() {
            return;
        }

        let gbps = |bytes: u64, ms: u128| {
            if ms > 0 {
                (bytes as f64) / (ms as f64) / 1_000_000.0
            } else {
                0.0
            }
        };

        eprintln!("\nExtraction statistics:");
        for (report, ms) in &done {
            eprintln!(
                "  - {}: {} in {} ms ({:.2} GB/s)",
                report.name,
                HumanBytes(report.size),
                ms,
                gbps(report.size, *ms)
            );
        }
        let total_bytes: u64 = done.iter().map(|(r, _)| r.size).sum();
        eprintln!(
            "  Total: {} in {} ms ({:.2} GB/s)",
            HumanBytes(total_bytes),
            wall_ms,
            gbps(total_bytes, wall_ms)
        );
    }

    fn display_output(&self, partition_dir: &Path, outcomes: &[Outcome]) {
        let total_size: u64 = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.size)
            .sum();

        println!("\nOutput directory: {}", partition_dir.display());
        println!("Total extracted size: {}", HumanBytes(total_size));
    }
}

/// Resolve the requested partition names against `manifest`, in request
/// order and without duplicates. An empty request or `all` selects every
/// partition. Names missing from the manifest are returned as failures so the
/// remaining partitions can still be extracted.
fn select_partitions<'a>(
    manifest: &'a Manifest,
    requested: &[String],
) -> (Vec<&'a str>, Vec<(String, Error)>) {
    if requested.is_empty() || requested.iter().any(|p| p == "all") {
        let all = manifest.partitions().iter().map(|p| p.name.as_str()).collect();
        return (all, Vec::new());
    }

    let mut selected = Vec::with_capacity(requested.len());
    let mut missing = Vec::new();
    for name in requested {
        match manifest.find_partition(name) {
            Ok(p) if !selected.contains(&p.name.as_str()) => selected.push(p.name.as_str()),
            Ok(_) => {}
            Err(e) if !missing.iter().any(|(m, _)| m == name) => missing.push((name.clone(), e)),
            Err(_) => {}
        }
    }
    (selected, missing)
}

// Friendlier, task-oriented help template shown for -h/--help
const FRIENDLY_HELP: &str = color_print::cstr!(
    "\
{before-help}<bold><underline>{name} {version}</underline></bold>
{about}

Quick start:
  otaextract [path-to-ota.zip|payload.bin]

Common tasks:
  - List partitions only:
    otaextract -l [ota.zip]
  - Extract everything into a timestamped folder:
    otaextract [ota.zip]
  - Extract specific partition(s):
    otaextract [ota.zip] --partitions boot,init_boot
  - Extract from a delta (incremental) OTA:
    otaextract [ota.zip] -s old_images/
  - Choose output directory and threads:
    otaextract [ota.zip] -o out -t 8

Safety and integrity:
  - Verification is on by default (SHA-256).
  - Use --strict to require hashes; do NOT combine with --no-verify.
  - Images are written to temporary files and only renamed into place once
    they are complete and verified.

Logging:
  - Set OTAEXTRACT_LOG (e.g. OTAEXTRACT_LOG=debug) for diagnostic output.

{usage-heading}
{usage}

Options:
{all-args}
{after-help}"
);
