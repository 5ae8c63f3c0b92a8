//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};

use mineassembler_api::{ApiClient, NominatimGeocoder};
use mineassembler_core::leads::{drop_completed, read_id_file, read_url_file};
use mineassembler_core::{
    BatchOrchestrator, GeocodingEnricher, Ledger, ListingCache, OrchestratorSettings,
    ProgressReporter, Resolver, ResolverSettings, RunSummary,
};
use mineassembler_scraper::{BrowserlessFactory, PoolSettings, ScrapePool, Scraper};
use mineassembler_shared::{
    AppConfig, AssemblyError, BatchMetrics, ProjectLead, init_config, load_config,
    load_config_from, validate_config, validate_credential,
};
use mineassembler_storage::{RunSink, Storage};

const DB_FILE_NAME: &str = "assembly.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// mineassembler — assemble enriched mining-project records.
#[derive(Parser)]
#[command(
    name = "mineassembler",
    version,
    about = "Resolve mining projects into deduplicated, enriched records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.mineassembler/mineassembler.toml).
    #[arg(long, global = true, env = "MINEASSEMBLER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Assemble projects from country listings, id files and URL lists.
    Run(RunArgs),

    /// Show what the local database holds.
    Status {
        /// Output directory holding the database.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// File of project identifiers (whitespace or comma separated).
    #[arg(long)]
    pub ids: Vec<PathBuf>,

    /// File of `project_url[,company_url]` lines.
    #[arg(long)]
    pub urls: Vec<PathBuf>,

    /// Countries whose listings seed the run (comma-separated).
    /// Defaults to the configured countries when no id or URL file is given.
    #[arg(long, value_delimiter = ',')]
    pub countries: Vec<String>,

    /// Output directory.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Browser sessions in the scrape pool.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Skip reverse geocoding.
    #[arg(long)]
    pub no_geocode: bool,

    /// Never fall back to scraping.
    #[arg(long)]
    pub no_scrape: bool,

    /// Skip identifiers a previous run already assembled.
    #[arg(long)]
    pub resume: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "mineassembler=info",
        1 => "mineassembler=debug",
        _ => "mineassembler=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    match cli.command {
        Command::Run(args) => cmd_run(config_path.as_deref(), args).await,
        Command::Status { out } => cmd_status(config_path.as_deref(), out).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_deref()).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Fold CLI flags over the file config. The result is fixed for the run.
fn apply_overrides(mut config: AppConfig, args: &RunArgs) -> Result<AppConfig> {
    if let Some(out) = &args.out {
        config.defaults.output_dir = out.to_string_lossy().into_owned();
    }
    if !args.countries.is_empty() {
        config.defaults.countries = args.countries.clone();
    }
    if let Some(size) = args.batch_size {
        config.batch.size = size;
    }
    if let Some(workers) = args.workers {
        config.scrape.workers = workers;
    }
    if args.no_geocode {
        config.geocoding.enabled = false;
    }
    if args.no_scrape {
        config.scrape.enabled = false;
    }
    validate_config(&config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = apply_overrides(resolve_config(config_path)?, &args)?;
    // Missing credential is fatal before any work starts.
    let token = validate_credential(&config)?;

    let out_dir = PathBuf::from(&config.defaults.output_dir);
    let storage = Arc::new(Storage::open(&out_dir.join(DB_FILE_NAME)).await?);

    let api = Arc::new(ApiClient::new(&config.api, token)?);
    let listings = Arc::new(ListingCache::new(api.clone(), config.defaults.countries.clone()));

    let mut leads = gather_leads(&args, &config, &listings).await?;
    if args.resume {
        let completed = storage.completed_ids().await?;
        let before = leads.len();
        leads = drop_completed(leads, &completed);
        info!(skipped = before - leads.len(), "resuming previous work");
    }
    if leads.is_empty() {
        println!("Nothing to do: no leads.");
        return Ok(());
    }

    let pool = config.scrape.enabled.then(|| {
        Arc::new(ScrapePool::start(
            Arc::new(BrowserlessFactory::from_config(&config.scrape)),
            PoolSettings::from(&config.scrape),
        ))
    });
    let scraper = pool.clone().map(|p| p as Arc<dyn Scraper>);
    let resolver = Arc::new(Resolver::new(
        api.clone(),
        listings,
        scraper,
        ResolverSettings::from(&config),
    ));

    let enricher = if config.geocoding.enabled {
        let geocoder = Arc::new(NominatimGeocoder::new(&config.geocoding)?);
        Some(Arc::new(GeocodingEnricher::new(
            geocoder,
            storage.clone(),
            config.geocoding.precision,
        )))
    } else {
        None
    };

    let config_json = serde_json::to_string(&config)?;
    let sink = Arc::new(RunSink::begin(storage.clone(), &out_dir, Some(config_json.as_str())).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight projects");
            shutdown_tx.send(true).ok();
        }
    });

    let ledger = Arc::new(Ledger::new());
    let orchestrator = BatchOrchestrator::new(
        resolver,
        enricher.clone(),
        ledger.clone(),
        sink.clone(),
        OrchestratorSettings::from(&config),
        shutdown_rx,
    );

    info!(run_id = sink.run_id(), leads = leads.len(), "assembling projects");
    let reporter = CliProgress::new();
    let outcome = orchestrator.run(leads, &reporter).await;
    reporter.finish();

    if let Some(pool) = &pool {
        pool.shutdown().await;
    }

    let (summary, abort) = match outcome {
        Ok(summary) => (summary, None),
        Err(aborted) => (aborted.summary, Some(aborted.source)),
    };
    let report = sink.finish(&ledger.projects(), &summary).await?;

    print_summary(sink.run_id(), &summary, &report);
    if let Some(enricher) = &enricher {
        let stats = enricher.stats();
        println!(
            "  Geocoding: {} cache hits, {} remote calls, {} failures",
            stats.cache_hits, stats.remote_calls, stats.failures
        );
    }
    println!("  API calls: {}", api.calls());
    println!();

    match abort {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Collect leads from id files, URL lists and country listings.
async fn gather_leads(
    args: &RunArgs,
    config: &AppConfig,
    listings: &ListingCache,
) -> Result<Vec<ProjectLead>> {
    let mut leads = Vec::new();
    for path in &args.ids {
        leads.extend(read_id_file(path)?);
    }
    for path in &args.urls {
        leads.extend(read_url_file(path)?);
    }

    // Listings seed the run when asked explicitly or when nothing else was given.
    let seed_from_listings = !args.countries.is_empty() || leads.is_empty();
    if seed_from_listings {
        for country in &config.defaults.countries {
            let found = listings
                .leads(country)
                .await
                .map_err(AssemblyError::from)?;
            info!(country = %country, leads = found.len(), "listing leads");
            leads.extend(found);
        }
        info!(countries = listings.fetched(), "country listings loaded");
    }

    if leads.is_empty() {
        warn!("no leads found");
    }
    Ok(leads)
}

fn print_summary(run_id: &str, summary: &RunSummary, report: &Path) {
    println!();
    if let Some(reason) = &summary.aborted {
        println!("  Run aborted: {reason}");
    } else if summary.interrupted {
        println!("  Run interrupted.");
    } else {
        println!("  Run complete.");
    }
    println!("  Run:        {run_id}");
    println!("  Attempted:  {}", summary.attempted);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Failed:     {}", summary.failed);
    for (reason, count) in &summary.failed_by_reason {
        println!("    {reason}: {count}");
    }
    println!("  Duplicates: {}", summary.duplicates);
    println!("  Abandoned:  {}", summary.abandoned);
    println!(
        "  Time:       {:.1}s",
        summary.elapsed_ms as f64 / 1000.0
    );
    println!("  Report:     {}", report.display());
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn started(&self, total_leads: usize, batches: usize) {
        self.bar.set_length(total_leads as u64);
        self.bar.set_message(format!("{batches} batches"));
    }

    fn identifier_done(&self, id: &str, succeeded: bool) {
        self.bar.inc(1);
        if !succeeded {
            self.bar.set_message(format!("failed {id}"));
        }
    }

    fn batch_done(&self, metrics: &BatchMetrics) {
        // Skipped leads never reach identifier_done.
        self.bar.inc((metrics.duplicates + metrics.abandoned) as u64);
        self.bar.println(format!(
            "batch {}: {} ok, {} failed, {} duplicate ({:.1}s)",
            metrics.batch_id,
            metrics.succeeded,
            metrics.failed(),
            metrics.duplicates,
            metrics.elapsed().as_secs_f64()
        ));
    }
}

// ---------------------------------------------------------------------------
// status / config
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>, out: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let out_dir = out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    let db_path = out_dir.join(DB_FILE_NAME);
    if !db_path.exists() {
        return Err(eyre!("no database at '{}': run `mineassembler run` first", db_path.display()));
    }

    let storage = Storage::open(&db_path).await?;
    println!("  Database:       {}", db_path.display());
    println!("  Projects:       {}", storage.project_count().await?);
    println!("  Completed ids:  {}", storage.completed_ids().await?.len());
    println!("  Geocode cache:  {}", storage.geocode_cache_size().await?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
