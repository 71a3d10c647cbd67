use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use gitpusher::compose::LabelDefaults;
use gitpusher::pacing::{PushSettings, RetryPolicy, BUDGET_ENDPOINT};
use gitpusher::{
    build_map, link_all, push_all, IssueTracker, LinkReport, OctocrabContentStore,
    OctocrabTracker, PushContext, PushReport, ReconciliationMap,
};
use mstorage::patch::{patch_export_dir, FlatFileFormat, PatchReport};
use mstorage::models::{RecordCategory, RecordState};
use mstorage::{config::StorageConfig, MStorage};
use rounduppusher::{read_members, RoundupReport, RoundupTracker, XmlRpcTracker};
use serde::Serialize;
use tigrisfetcher::{
    download_batches, load_records, probe_highest, BatchOptions, FetchSummary, LoadedRecords,
    TigrisClient, TrackerSource,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs the command line interface of the migration tool.
pub async fn run_cli() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(command) => run_command(command).await?,
        None => {
            println!("No subcommand provided. Use --help to see available commands.");
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "Moves a Tigris issue tracker to GitHub or Roundup")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Finds the highest issue id of the source project
    Probe(ProbeArgs),
    /// Downloads the source issues into the raw directory
    Fetch(FetchArgs),
    /// Builds the source id to destination number map
    Map(MapArgs),
    /// Creates and populates the destination issues
    Push(PushArgs),
    /// Adds cross-references between migrated issues
    Link(PushArgs),
    /// Imports the source issues into a Roundup tracker
    Roundup(RoundupArgs),
    /// Restores original timestamps in a Roundup flat export
    Patch(PatchArgs),
    /// Shows per-record progress and the last known API quota
    Status(StorageArgs),
}

#[derive(Args)]
struct StorageArgs {
    /// Working directory holding raw exports, indexes, catalog and map
    #[arg(long, env = "MIGRATOR_BASE_PATH")]
    base_path: PathBuf,
}

#[derive(Args)]
struct SourceArgs {
    /// Tigris project name, e.g. `scons`
    #[arg(long, env = "TIGRIS_PROJECT")]
    project: String,
}

#[derive(Args)]
struct ProbeArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = 1)]
    start: u64,
    #[arg(long, default_value_t = tigrisfetcher::probe::DEFAULT_STRIDE)]
    stride: u64,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value_t = 1)]
    start: u64,
    /// Last id to fetch; probed when omitted
    #[arg(long)]
    end: Option<u64>,
    #[arg(long, default_value_t = 50)]
    batch_size: u64,
    /// Leave attachment payloads out of the export
    #[arg(long, default_value_t = false)]
    no_attachments: bool,
    /// Keep batch files that are already on disk
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Args)]
struct GitHubArgs {
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: Option<String>,
    /// Owner of the destination repositories
    #[arg(long)]
    owner: String,
    /// Repository receiving the issues
    #[arg(long)]
    repo: String,
}

#[derive(Args)]
struct MapArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    github: GitHubArgs,
    /// Highest source id; taken from the fetched records when omitted
    #[arg(long)]
    max_source_id: Option<u64>,
    /// Replace an existing map
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Args)]
struct PushArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    github: GitHubArgs,
    /// Repository receiving attachment files
    #[arg(long)]
    attachment_repo: String,
    /// Value of component/subcomponent that gets no label
    #[arg(long, default_value = "scons")]
    default_component: String,
    #[arg(long, default_value_t = 50)]
    rate_threshold: u64,
    #[arg(long, default_value_t = 1000)]
    min_interval_ms: u64,
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
    #[arg(long, default_value_t = 10)]
    retry_delay_secs: u64,
    /// Redo records the catalog already reports as done
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Args)]
struct RoundupArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    source: SourceArgs,
    /// XML-RPC endpoint with credentials, e.g. `http://admin:pw@localhost:8917/demo/xmlrpc`
    #[arg(long, env = "ROUNDUP_XMLRPC_URL")]
    url: String,
    /// `username;realname;roles` list of project members to create first
    #[arg(long)]
    fullnames: Option<PathBuf>,
}

#[derive(Args)]
struct PatchArgs {
    #[command(flatten)]
    storage: StorageArgs,
    /// Directory containing file.csv, issue.csv and msg.csv
    #[arg(long)]
    export_dir: PathBuf,
    #[arg(long, default_value_t = ':')]
    delimiter: char,
}

async fn open_storage(args: &StorageArgs) -> anyhow::Result<MStorage> {
    MStorage::new(StorageConfig::new(&args.base_path))
        .await
        .with_context(|| format!("failed to open storage at {}", args.base_path.display()))
}

fn source_client(args: &SourceArgs, include_attachments: bool) -> anyhow::Result<TigrisClient> {
    Ok(TigrisClient::for_project(&args.project)
        .context("invalid Tigris project")?
        .with_attachments(include_attachments))
}

fn push_context(args: &PushArgs, storage: &MStorage) -> anyhow::Result<PushContext> {
    let tracker = OctocrabTracker::new(
        args.github.github_token.clone(),
        &args.github.owner,
        &args.github.repo,
    )
    .context("failed to initialize GitHub client")?;
    let content = OctocrabContentStore::new(
        args.github.github_token.clone(),
        &args.github.owner,
        &args.attachment_repo,
    )
    .context("failed to initialize GitHub content client")?;
    let source = source_client(&args.source, true)?;

    let settings = PushSettings {
        rate_threshold: args.rate_threshold,
        min_interval: Duration::from_millis(args.min_interval_ms),
        retry: RetryPolicy::linear(args.max_attempts, Duration::from_secs(args.retry_delay_secs)),
        ..PushSettings::default()
    };
    let labels = LabelDefaults {
        component: args.default_component.clone(),
        subcomponent: args.default_component.clone(),
        ..LabelDefaults::default()
    };

    Ok(PushContext::new(Arc::new(tracker), Arc::new(content), Arc::new(source))
        .with_settings(settings)
        .with_labels(labels)
        .with_catalog(storage.catalog.clone())
        .with_resume(!args.force))
}

async fn run_command(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Probe(args) => {
            let storage = open_storage(&args.storage).await?;
            let client = source_client(&args.source, false)?;
            let highest = probe_phase(&storage, &client, args.start, args.stride).await?;
            println!("{highest}");
        }
        Command::Fetch(args) => {
            let storage = open_storage(&args.storage).await?;
            let client = source_client(&args.source, !args.no_attachments)?;
            let options = BatchOptions {
                batch_size: args.batch_size,
                skip_existing: args.skip_existing,
            };
            let summary = fetch_phase(&storage, &client, args.start, args.end, options).await?;
            print_outcome(&PhaseOutcome::from_fetch(&summary))?;
        }
        Command::Map(args) => {
            let storage = open_storage(&args.storage).await?;
            let tracker = OctocrabTracker::new(
                args.github.github_token.clone(),
                &args.github.owner,
                &args.github.repo,
            )
            .context("failed to initialize GitHub client")?;
            let map = map_phase(&storage, &tracker, args.max_source_id, args.force).await?;
            let moved: Vec<String> = map
                .relocated()
                .map(|(source, dest)| format!("{source}->{dest}"))
                .collect();
            print_outcome(&PhaseOutcome::new("map", map.len(), 0, moved))?;
        }
        Command::Push(args) => {
            let storage = open_storage(&args.storage).await?;
            let ctx = push_context(&args, &storage)?;
            let report = push_phase(&storage, &ctx).await?;
            print_outcome(&PhaseOutcome::from_push(&report))?;
        }
        Command::Link(args) => {
            let storage = open_storage(&args.storage).await?;
            let ctx = push_context(&args, &storage)?;
            let report = link_phase(&storage, &ctx).await?;
            print_outcome(&PhaseOutcome::from_link(&report))?;
        }
        Command::Roundup(args) => {
            let storage = open_storage(&args.storage).await?;
            let source = source_client(&args.source, true)?;
            let tracker = XmlRpcTracker::new(&args.url);
            let report =
                roundup_phase(&storage, &tracker, &source, args.fullnames.as_deref()).await?;
            print_outcome(&PhaseOutcome::from_roundup(&report))?;
        }
        Command::Patch(args) => {
            let storage = open_storage(&args.storage).await?;
            let delimiter = u8::try_from(args.delimiter)
                .context("delimiter must be a single-byte character")?;
            let format = FlatFileFormat {
                delimiter,
                ..FlatFileFormat::default()
            };
            let reports = patch_phase(&storage, &args.export_dir, &format).await?;
            for (category, report) in reports {
                println!(
                    "{}: {} of {} lines patched, {} without recorded times",
                    category.export_file_name(),
                    report.patched,
                    report.lines,
                    report.unmatched
                );
            }
        }
        Command::Status(args) => {
            let storage = open_storage(&args).await?;
            println!("{}", serde_json::to_string_pretty(&status_report(&storage)?)?);
        }
    }
    Ok(())
}

/// Machine-readable summary printed after a phase.
#[derive(Debug, Serialize)]
pub struct PhaseOutcome {
    pub phase: &'static str,
    pub done: usize,
    pub failed: usize,
    pub details: Vec<String>,
}

impl PhaseOutcome {
    fn new(phase: &'static str, done: usize, failed: usize, details: Vec<String>) -> Self {
        Self {
            phase,
            done,
            failed,
            details,
        }
    }

    fn from_fetch(summary: &FetchSummary) -> Self {
        let details = summary
            .skipped
            .iter()
            .map(|(first, last)| format!("kept {first}-{last}"))
            .collect();
        Self::new("fetch", summary.written.len(), 0, details)
    }

    fn from_push(report: &PushReport) -> Self {
        let details = report
            .failed
            .iter()
            .map(|(id, err)| format!("{id}: {err}"))
            .chain(
                report
                    .placeholders
                    .iter()
                    .map(|number| format!("#{number}: placeholder left")),
            )
            .collect();
        Self::new("push", report.pushed.len(), report.failed.len(), details)
    }

    fn from_link(report: &LinkReport) -> Self {
        let details = report
            .failed
            .iter()
            .map(|(id, err)| format!("{id}: {err}"))
            .chain(
                report
                    .unpopulated
                    .iter()
                    .map(|id| format!("{id}: not pushed yet")),
            )
            .collect();
        Self::new("link", report.linked.len(), report.failed.len(), details)
    }

    fn from_roundup(report: &RoundupReport) -> Self {
        let details = report
            .failed
            .iter()
            .map(|(id, err)| format!("{id}: {err}"))
            .collect();
        Self::new("roundup", report.pushed.len(), report.failed.len(), details)
    }
}

fn print_outcome(outcome: &PhaseOutcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

/// Runs `work` inside a task log row of the catalog.
async fn tracked<T, Fut>(
    storage: &MStorage,
    name: &str,
    work: Fut,
    describe: impl FnOnce(&T) -> String,
) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let task_id = storage.catalog.create_task_log(name)?;
    match work.await {
        Ok(value) => {
            let details = describe(&value);
            info!(task = name, "{details}");
            storage
                .catalog
                .update_task_log_status(task_id, "SUCCESS", &details)?;
            Ok(value)
        }
        Err(err) => {
            error!(task = name, "{err:#}");
            storage
                .catalog
                .update_task_log_status(task_id, "FAILED", &format!("{err:#}"))?;
            Err(err)
        }
    }
}

/// Decodes the lake, warning about batches that could not be read.
async fn load_source(storage: &MStorage) -> anyhow::Result<LoadedRecords> {
    let loaded = load_records(&storage.lake)
        .await
        .context("listing fetched batches failed")?;
    for err in &loaded.failed_batches {
        warn!("{err}; its records are left out of this run");
    }
    Ok(loaded)
}

pub async fn probe_phase<S>(
    storage: &MStorage,
    source: &S,
    start: u64,
    stride: u64,
) -> anyhow::Result<u64>
where
    S: TrackerSource + ?Sized,
{
    tracked(
        storage,
        "probe",
        async {
            probe_highest(source, start, stride)
                .await
                .context("probing the source failed")
        },
        |highest| format!("highest source id {highest}"),
    )
    .await
}

pub async fn fetch_phase<S>(
    storage: &MStorage,
    source: &S,
    start: u64,
    end: Option<u64>,
    options: BatchOptions,
) -> anyhow::Result<FetchSummary>
where
    S: TrackerSource + ?Sized,
{
    let end = match end {
        Some(end) => end,
        None => probe_phase(storage, source, start, tigrisfetcher::probe::DEFAULT_STRIDE).await?,
    };
    if end < start {
        warn!("nothing to fetch: range {start}-{end} is empty");
    }
    tracked(
        storage,
        "fetch",
        async {
            download_batches(source, &storage.lake, start, end, options)
                .await
                .context("fetching batches failed")
        },
        |summary| {
            format!(
                "{} batches written, {} kept",
                summary.written.len(),
                summary.skipped.len()
            )
        },
    )
    .await
}

pub async fn map_phase<T>(
    storage: &MStorage,
    tracker: &T,
    max_source_id: Option<u64>,
    force: bool,
) -> anyhow::Result<ReconciliationMap>
where
    T: IssueTracker + ?Sized,
{
    let path = storage.config.mapping_path.clone();
    if path.exists() && !force {
        bail!(
            "{} already exists; the map must not change once issues are pushed (use --force to rebuild)",
            path.display()
        );
    }

    tracked(
        storage,
        "map",
        async {
            let max_source_id = match max_source_id {
                Some(max) => max,
                None => load_source(storage).await?.highest_fetched,
            };
            let reserved = tracker
                .reserved_numbers()
                .await
                .context("listing pull requests failed")?;
            let map = build_map(max_source_id, &reserved);
            map.verify()?;
            storage.write_json(&path, &map).await?;
            Ok(map)
        },
        |map| {
            format!(
                "{} ids mapped, {} relocated",
                map.len(),
                map.relocated().count()
            )
        },
    )
    .await
}

async fn load_map(storage: &MStorage) -> anyhow::Result<ReconciliationMap> {
    let map: ReconciliationMap = storage
        .read_json(&storage.config.mapping_path)
        .await
        .context("no id map found; run the map phase first")?;
    map.verify()?;
    Ok(map)
}

pub async fn push_phase(storage: &MStorage, ctx: &PushContext) -> anyhow::Result<PushReport> {
    let map = load_map(storage).await?;
    let records = load_source(storage).await?.records;
    tracked(
        storage,
        "push",
        async {
            let mut writer = storage.timestamp_writer()?;
            Ok(push_all(ctx, &records, &map, &mut writer).await?)
        },
        |report| report.summary(),
    )
    .await
}

pub async fn link_phase(storage: &MStorage, ctx: &PushContext) -> anyhow::Result<LinkReport> {
    let map = load_map(storage).await?;
    let records = load_source(storage).await?.records;
    tracked(
        storage,
        "link",
        async { Ok(link_all(ctx, &records, &map).await?) },
        |report| report.summary(),
    )
    .await
}

/// Imports every fetched record into a Roundup tracker, recording the ids it
/// assigns for the patch phase.
pub async fn roundup_phase<T, S>(
    storage: &MStorage,
    tracker: &T,
    source: &S,
    fullnames: Option<&Path>,
) -> anyhow::Result<RoundupReport>
where
    T: RoundupTracker + ?Sized,
    S: TrackerSource + ?Sized,
{
    let members = match fullnames {
        Some(path) => read_members(path)
            .with_context(|| format!("reading {} failed", path.display()))?,
        None => Vec::new(),
    };
    let records = load_source(storage).await?.records;
    tracked(
        storage,
        "roundup",
        async {
            let mut writer = storage.timestamp_writer()?;
            Ok(rounduppusher::push_all(tracker, source, &records, &members, &mut writer).await?)
        },
        |report| report.summary(),
    )
    .await
}

/// Progress of a GitHub migration as recorded in the catalog.
#[derive(Debug, Default, Serialize)]
pub struct StatusReport {
    /// Source ids whose issue exists but was never filled in.
    pub unfinished: Vec<u64>,
    pub populated: usize,
    pub linked: usize,
    pub requests_left: Option<i64>,
    /// Unix time at which the quota resets.
    pub quota_reset: Option<i64>,
}

pub fn status_report(storage: &MStorage) -> anyhow::Result<StatusReport> {
    let catalog = &storage.catalog;
    let budget = catalog.get_api_budget(BUDGET_ENDPOINT)?;
    Ok(StatusReport {
        unfinished: catalog
            .records_in_state(RecordState::Created)?
            .iter()
            .map(|progress| progress.source_id)
            .collect(),
        populated: catalog.records_in_state(RecordState::Populated)?.len(),
        linked: catalog.records_in_state(RecordState::Linked)?.len(),
        requests_left: budget.as_ref().map(|b| b.requests_left),
        quota_reset: budget.map(|b| b.reset_time),
    })
}

pub async fn patch_phase(
    storage: &MStorage,
    export_dir: &Path,
    format: &FlatFileFormat,
) -> anyhow::Result<Vec<(RecordCategory, PatchReport)>> {
    tracked(
        storage,
        "patch",
        async {
            patch_export_dir(export_dir, &storage.config, format)
                .with_context(|| format!("patching {} failed", export_dir.display()))
        },
        |reports| {
            let patched: usize = reports.iter().map(|(_, r)| r.patched).sum();
            format!("{patched} lines patched in {} files", reports.len())
        },
    )
    .await
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
