//! Per-dataset download pipelines.
//!
//! Each dataset runs through a strictly linear state machine:
//!
//! ```text
//! Pending → Downloaded → Transcoded → Tabled → Placed
//!    └──────────┴────────────┴───────────┴──→ Failed
//! ```
//!
//! Every artifact is built under a private staging directory, first as an
//! anonymous temporary file and then renamed to its final name once the stage
//! that produced it returns successfully. Nothing reaches the sync root until
//! the last stage, where artifacts are moved (never copied in place, never
//! overwritten) into their versioned directories. A failing dataset is logged
//! and recorded; the remaining datasets still run.
//!
//! Two families share this machinery:
//! - [`PortalPipeline`] - JSON reports fetched with a [`RawFetcher`], stamped
//!   with the download instant
//! - [`OpenDataPipeline`] - CSV exports fetched with an [`OpenDataClient`],
//!   stamped (in file names only) with the platform's `rowsUpdatedAt`

use crate::config::{OPEN_DATA_FAMILY, OpenDataset, PipelineConfig, Retention};
use crate::endpoint::{Endpoint, artifact_file_name};
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::fetch::{OpenDataClient, RawFetcher};
use crate::io::compression::{auto_detect_writer, compress_file, open_decompressed};
use crate::io::parquet::{TableFormat, write_table};
use crate::io::transcode::transcode;
use crate::layout::{DirScheme, Layout, create_dir_idempotent};
use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{error, info};

/// Progress of one dataset through its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Downloaded,
    Transcoded,
    Tabled,
    Placed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a batch of datasets is scheduled.
#[derive(Clone, Copy, Debug, Default)]
pub enum ExecMode {
    /// One dataset at a time, in table order.
    #[default]
    Sequential,
    /// Datasets fanned out over a rayon pool.
    #[cfg(feature = "parallel-io")]
    Parallel { threads: Option<usize> },
}

/// Outcome of one dataset run.
#[derive(Debug)]
pub struct RunReport {
    pub dataset: String,
    pub state: RunState,
    /// Instant embedded in the artifact names, once known.
    pub stamped_at: Option<DateTime<Utc>>,
    /// Rows written to the columnar artifact.
    pub rows: Option<u64>,
    /// Final paths of artifacts moved into the sync root.
    pub placed: Vec<PathBuf>,
    pub error: Option<Error>,
}

impl RunReport {
    fn pending(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            state: RunState::Pending,
            stamped_at: None,
            rows: None,
            placed: Vec::new(),
            error: None,
        }
    }

    fn advance(&mut self, next: RunState) {
        info!(dataset = %self.dataset, from = %self.state, to = %next, "stage complete");
        self.state = next;
    }

    fn fail(mut self, e: Error) -> Self {
        let stage = match &e {
            Error::Stage { stage, .. } => stage.to_string(),
            _ => "unknown".to_string(),
        };
        error!(dataset = %self.dataset, stage = %stage, from = %self.state, error = %e, "dataset failed");
        self.state = RunState::Failed;
        self.error = Some(e);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Placed
    }
}

/// Reports for every dataset attempted in one invocation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub runs: Vec<RunReport>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &RunReport> {
        self.runs.iter().filter(|r| !r.succeeded())
    }

    /// `Ok` with all reports if every dataset was placed.
    ///
    /// # Errors
    /// [`Error::Aggregate`] naming the failed datasets.
    pub fn into_result(self) -> Result<Vec<RunReport>> {
        let failed: Vec<String> = self.failed().map(|r| r.dataset.clone()).collect();
        if failed.is_empty() {
            Ok(self.runs)
        } else {
            Err(Error::Aggregate { failed })
        }
    }
}

// ============================================================================
// Portal family
// ============================================================================

/// Download → transcode → table → place for JSON report endpoints.
///
/// Artifacts land in `sync_root/{name}/{format}_{version}/` as
/// `{name}_{stamp}.json.bz2`, `.jsonl.bz2`, and `.parquet`.
pub struct PortalPipeline<F: RawFetcher> {
    fetcher: F,
    layout: Layout,
    config: PipelineConfig,
}

impl<F: RawFetcher> PortalPipeline<F> {
    pub fn new(fetcher: F, config: PipelineConfig) -> Self {
        let layout = Layout::new(config.sync_root.clone(), DirScheme::FormatVersion);
        Self {
            fetcher,
            layout,
            config,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Run every endpoint, isolating failures per endpoint.
    pub fn run_all(&self, endpoints: &[Endpoint], mode: ExecMode) -> BatchReport {
        run_batch(endpoints, mode, |ep| self.run(ep))
    }

    /// Run one endpoint, stamped with the current instant in whole seconds.
    ///
    /// File names carry one-second resolution, so a second run of the same
    /// endpoint within that second finds its artifacts taken and fails at
    /// the place stage rather than replacing them.
    pub fn run(&self, endpoint: &Endpoint) -> RunReport {
        self.run_at(endpoint, Utc::now().trunc_subsecs(0))
    }

    /// Run one endpoint with an explicit `downloaded_at`.
    pub fn run_at(&self, endpoint: &Endpoint, downloaded_at: DateTime<Utc>) -> RunReport {
        info!(dataset = endpoint.name(), version = endpoint.version(), %downloaded_at, "starting");
        let mut report = RunReport::pending(endpoint.name());
        report.stamped_at = Some(downloaded_at);
        match self.execute(endpoint, downloaded_at, &mut report) {
            Ok(()) => report,
            Err(e) => report.fail(e),
        }
    }

    fn execute(
        &self,
        ep: &Endpoint,
        downloaded_at: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let name = ep.name();
        let staging = staging_dir(&self.config).map_err(|e| e.at_stage(name, Stage::Download))?;
        let dir = staging.path();

        let raw_name = ep.file_name(downloaded_at, "json.bz2");
        let raw = stage_artifact(dir, &raw_name, |file| {
            let mut w = auto_detect_writer(file, &raw_name)?;
            self.fetcher.fetch(ep.location(), &mut w)?;
            w.finish().at_path(&raw_name)
        })
        .map_err(|e| e.at_stage(name, Stage::Download))?;
        report.advance(RunState::Downloaded);

        let jsonl_name = ep.file_name(downloaded_at, "jsonl.bz2");
        let jsonl = stage_artifact(dir, &jsonl_name, |file| {
            let mut w = auto_detect_writer(file, &jsonl_name)?;
            let n = transcode(open_decompressed(&raw.path)?, ep.shape(), downloaded_at, &mut w)?;
            w.finish().at_path(&jsonl_name)?;
            Ok(n)
        })
        .map_err(|e| e.at_stage(name, Stage::Transcode))?;
        info!(dataset = name, records = jsonl.value, "transcoded");
        report.advance(RunState::Transcoded);

        let table_name = ep.file_name(downloaded_at, "parquet");
        let table = stage_artifact(dir, &table_name, |file| {
            write_table(&jsonl.path, TableFormat::Jsonl, &self.config.table, file)
        })
        .map_err(|e| e.at_stage(name, Stage::Table))?;
        report.rows = Some(table.value);
        report.advance(RunState::Tabled);

        let mut artifacts = Vec::with_capacity(3);
        if self.config.retention == Retention::All {
            artifacts.push(("json", raw.path));
            artifacts.push(("jsonl", jsonl.path));
        }
        artifacts.push(("parquet", table.path));
        for (format, src) in artifacts {
            let placed = self
                .place(ep, format, &src)
                .map_err(|e| e.at_stage(name, Stage::Place))?;
            report.placed.push(placed);
        }
        report.advance(RunState::Placed);
        Ok(())
    }

    fn place(&self, ep: &Endpoint, format: &str, src: &Path) -> Result<PathBuf> {
        let file_name = file_name_of(src)?;
        let dest = self
            .layout
            .artifact_path(ep.name(), format, ep.version(), file_name)?;
        move_no_clobber(src, &dest)?;
        Ok(dest)
    }
}

// ============================================================================
// Open-data family
// ============================================================================

/// Metadata → CSV download → table → compress → place for open-data datasets.
///
/// Artifacts land in `sync_root/HHS/{name}/{version}/{csv|parquet}/`, named
/// after the platform's `rowsUpdatedAt` rather than the download instant. A
/// dataset whose artifacts for that stamp are already placed is not
/// downloaded again and counts as a success.
pub struct OpenDataPipeline<C: OpenDataClient> {
    client: C,
    layout: Layout,
    config: PipelineConfig,
}

impl<C: OpenDataClient> OpenDataPipeline<C> {
    pub fn new(client: C, config: PipelineConfig) -> Self {
        let layout = Layout::new(
            config.sync_root.clone(),
            DirScheme::VersionFormat {
                family: OPEN_DATA_FAMILY.to_string(),
            },
        );
        Self {
            client,
            layout,
            config,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run every dataset, isolating failures per dataset.
    pub fn run_all(&self, datasets: &[OpenDataset], mode: ExecMode) -> BatchReport {
        run_batch(datasets, mode, |ds| self.run(ds))
    }

    pub fn run(&self, dataset: &OpenDataset) -> RunReport {
        info!(dataset = dataset.name(), id = dataset.id(), "starting");
        let mut report = RunReport::pending(dataset.name());
        match self.execute(dataset, &mut report) {
            Ok(()) => report,
            Err(e) => report.fail(e),
        }
    }

    fn execute(&self, ds: &OpenDataset, report: &mut RunReport) -> Result<()> {
        let name = ds.name();
        let at_download = |e: Error| e.at_stage(name, Stage::Download);

        let meta = self.client.get_metadata(ds.id()).map_err(at_download)?;
        let stamped_at = meta.rows_updated().map_err(at_download)?;
        report.stamped_at = Some(stamped_at);

        // Names derive from rowsUpdatedAt, so existing files hold this exact upstream version.
        if self
            .expected_artifacts(ds, stamped_at)
            .iter()
            .all(|path| path.is_file())
        {
            info!(dataset = name, %stamped_at, "upstream unchanged; artifacts already placed");
            report.advance(RunState::Placed);
            return Ok(());
        }

        let staging = staging_dir(&self.config).map_err(at_download)?;
        let dir = staging.path();
        let csv_name = artifact_file_name(name, stamped_at, "csv");
        let csv = stage_artifact(dir, &csv_name, |file| {
            let mut w = BufWriter::new(file);
            self.client.fetch_rows_as_csv(ds.id(), &mut w)?;
            w.flush().at_path(&csv_name)
        })
        .map_err(at_download)?;
        report.advance(RunState::Downloaded);

        let table_name = artifact_file_name(name, stamped_at, "parquet");
        let table = stage_artifact(dir, &table_name, |file| {
            write_table(&csv.path, TableFormat::Csv, &self.config.table, file)
        })
        .map_err(|e| e.at_stage(name, Stage::Table))?;
        report.rows = Some(table.value);
        report.advance(RunState::Tabled);

        let mut artifacts = Vec::with_capacity(2);
        if self.config.retention == Retention::All {
            let archived = compress_file(&csv.path).map_err(|e| e.at_stage(name, Stage::Compress))?;
            artifacts.push(("csv", archived));
        }
        artifacts.push(("parquet", table.path));
        for (format, src) in artifacts {
            let placed = self
                .place(ds, format, &src)
                .map_err(|e| e.at_stage(name, Stage::Place))?;
            report.placed.extend(placed);
        }
        report.advance(RunState::Placed);
        Ok(())
    }

    /// Final paths of every artifact a run stamped `stamped_at` would place.
    fn expected_artifacts(&self, ds: &OpenDataset, stamped_at: DateTime<Utc>) -> Vec<PathBuf> {
        let mut formats = Vec::with_capacity(2);
        if self.config.retention == Retention::All {
            formats.push(("csv", "csv.bz2"));
        }
        formats.push(("parquet", "parquet"));
        formats
            .into_iter()
            .map(|(format, ext)| {
                self.layout
                    .dir_for(ds.name(), format, ds.version())
                    .join(artifact_file_name(ds.name(), stamped_at, ext))
            })
            .collect()
    }

    /// Move `src` into place. An artifact already there for the same
    /// `rowsUpdatedAt` is kept as is and `None` is returned.
    fn place(&self, ds: &OpenDataset, format: &str, src: &Path) -> Result<Option<PathBuf>> {
        let file_name = file_name_of(src)?;
        let dest = self
            .layout
            .artifact_path(ds.name(), format, ds.version(), file_name)?;
        if dest.is_file() {
            info!(dest = %dest.display(), "already placed; keeping existing artifact");
            return Ok(None);
        }
        move_no_clobber(src, &dest)?;
        Ok(Some(dest))
    }
}

// ============================================================================
// Shared plumbing
// ============================================================================

fn run_batch<T, R>(items: &[T], mode: ExecMode, run: R) -> BatchReport
where
    T: Sync,
    R: Fn(&T) -> RunReport + Sync,
{
    let runs: Vec<RunReport> = match mode {
        ExecMode::Sequential => items.iter().map(run).collect(),
        #[cfg(feature = "parallel-io")]
        ExecMode::Parallel { threads } => {
            use rayon::prelude::*;
            let pool = threads
                .map(|t| rayon::ThreadPoolBuilder::new().num_threads(t).build())
                .transpose();
            match pool {
                Ok(Some(pool)) => pool.install(|| items.par_iter().map(&run).collect()),
                Ok(None) => items.par_iter().map(&run).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "could not build thread pool; running sequentially");
                    items.iter().map(run).collect()
                }
            }
        }
    };
    let report = BatchReport { runs };
    let failed = report.failed().count();
    if failed == 0 {
        info!(datasets = report.runs.len(), "all done");
    } else {
        error!(datasets = report.runs.len(), failed, "finished with failures");
    }
    report
}

/// A finished artifact inside the staging directory.
struct Staged<T> {
    path: PathBuf,
    value: T,
}

/// Build `name` inside `dir`: `build` writes into an anonymous temp file that
/// is renamed to `name` only if `build` succeeds. On failure the temp file is
/// removed and no file called `name` exists.
fn stage_artifact<T>(
    dir: &Path,
    name: &str,
    build: impl FnOnce(&File) -> Result<T>,
) -> Result<Staged<T>> {
    let tmp = NamedTempFile::new_in(dir).at_path(dir)?;
    let value = build(tmp.as_file())?;
    tmp.as_file().sync_all().at_path(tmp.path())?;
    let path = dir.join(name);
    tmp.persist_noclobber(&path)
        .map_err(|e| Error::fs(&path, e.error))?;
    Ok(Staged { path, value })
}

fn staging_dir(config: &PipelineConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".dataset-sync-");
    match &config.work_dir {
        Some(dir) => {
            create_dir_idempotent(dir)?;
            builder.tempdir_in(dir).at_path(dir)
        }
        None => builder.tempdir().at_path(std::env::temp_dir()),
    }
}

fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::fs(path, std::io::Error::new(ErrorKind::InvalidInput, "no file name")))
}

/// Move `src` to `dest`, refusing to replace an existing `dest`.
///
/// The move is a hard link to `dest` followed by removing `src`. Creating the
/// link fails atomically if `dest` exists, so a file appearing at `dest` from
/// another process is never replaced. Across filesystems, or where hard links
/// are unsupported, `src` is copied to a hidden temp file in `dest`'s directory
/// and persisted without clobbering, so `dest` only ever appears complete.
///
/// # Errors
/// [`Error::Filesystem`] if `dest` exists or the move fails.
pub fn move_no_clobber(src: &Path, dest: &Path) -> Result<()> {
    match fs::hard_link(src, dest) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(refuse_overwrite(dest)),
        Err(e) if matches!(e.kind(), ErrorKind::CrossesDevices | ErrorKind::Unsupported) => {
            copy_no_clobber(src, dest)?;
        }
        Err(e) => return Err(Error::fs(dest, e)),
    }
    fs::remove_file(src).at_path(src)?;
    info!(dest = %dest.display(), "placed");
    Ok(())
}

fn copy_no_clobber(src: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(dir)
        .at_path(dir)?;
    fs::copy(src, tmp.path()).at_path(tmp.path())?;
    tmp.as_file().sync_all().at_path(tmp.path())?;
    tmp.persist_noclobber(dest).map_err(|e| {
        if e.error.kind() == ErrorKind::AlreadyExists {
            refuse_overwrite(dest)
        } else {
            Error::fs(dest, e.error)
        }
    })?;
    Ok(())
}

fn refuse_overwrite(dest: &Path) -> Error {
    Error::fs(
        dest,
        std::io::Error::new(ErrorKind::AlreadyExists, "refusing to overwrite artifact"),
    )
}
