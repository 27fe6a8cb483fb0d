use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dataset_sync::config::resolve_app_token;
use dataset_sync::fetch::{DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_OPEN_DATA_TIMEOUT};
use dataset_sync::{
    BatchReport, EndpointTable, ExecMode, HttpFetcher, OpenDataPipeline, PipelineConfig,
    PortalPipeline, Retention, SocrataClient, TableOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download public-health datasets into a sync directory", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the Bioportal JSON reports
    Bioportal(CommonArgs),
    /// Download the HHS/CDC datasets from their open-data platforms
    Hhs(HhsArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory to which to deposit the output files for sync
    #[arg(long = "sync-dir", alias = "s3-sync-dir")]
    sync_dir: PathBuf,

    /// Parent directory for per-run staging (defaults to the system temp dir)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// JSON endpoint table replacing the built-in one
    #[arg(long)]
    endpoints: Option<PathBuf>,

    /// Which artifacts to keep in the sync directory
    #[arg(long, value_enum, default_value_t = Retention::All)]
    retain: Retention,

    /// Maximum rows per Parquet row group
    #[arg(long, default_value_t = dataset_sync::io::parquet::DEFAULT_MAX_ROW_GROUP_SIZE)]
    row_group_size: usize,

    /// Process datasets concurrently with this many threads
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Args, Debug)]
struct HhsArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Socrata API app token. Not required, but requests get throttled
    /// without it. Takes precedence over --socrata-app-token-env-var.
    #[arg(long)]
    socrata_app_token: Option<String>,

    /// Environment variable from which to read the Socrata API app token
    #[arg(long)]
    socrata_app_token_env_var: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl CommonArgs {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sync_root: self.sync_dir.clone(),
            work_dir: self.work_dir.clone(),
            retention: self.retain,
            table: TableOptions {
                max_row_group_size: self.row_group_size,
                ..TableOptions::default()
            },
        }
    }

    fn endpoint_table(&self) -> Result<EndpointTable> {
        match &self.endpoints {
            Some(path) => EndpointTable::load(path)
                .with_context(|| format!("load endpoint table {}", path.display())),
            None => Ok(EndpointTable::default()),
        }
    }

    #[cfg(feature = "parallel-io")]
    fn exec_mode(&self) -> ExecMode {
        match self.jobs {
            Some(n) if n > 1 => ExecMode::Parallel { threads: Some(n) },
            _ => ExecMode::Sequential,
        }
    }

    #[cfg(not(feature = "parallel-io"))]
    fn exec_mode(&self) -> ExecMode {
        if self.jobs.is_some_and(|n| n > 1) {
            tracing::warn!("built without parallel-io; running datasets sequentially");
        }
        ExecMode::Sequential
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run_bioportal(args: &CommonArgs) -> Result<BatchReport> {
    let endpoints = args.endpoint_table()?.bioportal_endpoints()?;
    let fetcher = HttpFetcher::new(DEFAULT_DOWNLOAD_TIMEOUT)?;
    let pipeline = PortalPipeline::new(fetcher, args.pipeline_config());
    Ok(pipeline.run_all(&endpoints, args.exec_mode()))
}

fn run_hhs(args: &HhsArgs) -> Result<BatchReport> {
    let table = args.common.endpoint_table()?;
    let token = resolve_app_token(
        args.socrata_app_token.as_deref(),
        args.socrata_app_token_env_var.as_deref(),
    )?;
    let mut combined = BatchReport::default();
    for source in &table.open_data {
        info!(domain = %source.domain, datasets = source.datasets.len(), "fetching from open-data domain");
        let client = SocrataClient::new(&source.domain, token.as_deref(), DEFAULT_OPEN_DATA_TIMEOUT)?;
        let pipeline = OpenDataPipeline::new(client, args.common.pipeline_config());
        let report = pipeline.run_all(&source.datasets, args.common.exec_mode());
        combined.runs.extend(report.runs);
    }
    Ok(combined)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let outcome = match &cli.command {
        Command::Bioportal(args) => run_bioportal(args),
        Command::Hhs(args) => run_hhs(args),
    }
    .and_then(|report| report.into_result().map_err(anyhow::Error::from));

    match outcome {
        Ok(runs) => {
            info!(datasets = runs.len(), "sync tree up to date");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("run failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
