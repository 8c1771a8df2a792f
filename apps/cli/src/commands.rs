//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use tenderflow_core::pipeline::{Pipeline, PipelineReport, ProgressReporter, RunGuard};
use tenderflow_core::proposal::MarkdownAssembler;
use tenderflow_embedding::HashEmbedder;
use tenderflow_extraction::OracleClient;
use tenderflow_shared::{
    AppConfig, CatalogItem, PipelineConfig, Tender, TenderId, TenderStatus, init_config,
    load_config, validate_config,
};
use tenderflow_storage::Storage;

/// Database file name under the data directory.
const DB_FILE_NAME: &str = "tenderflow.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// TenderFlow — turn free-text tenders into priced proposals.
#[derive(Parser)]
#[command(
    name = "tenderflow",
    version,
    about = "Extract tender requirements, match them against the catalog, and price a proposal.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory override (defaults to the configured one).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

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
    /// Tender management.
    Tender {
        #[command(subcommand)]
        action: TenderAction,
    },

    /// Catalog (SKU) management.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Run the pipeline for a tender.
    Run {
        /// Tender identifier.
        id: String,
    },

    /// Show a tender's status and latest run.
    Status {
        /// Tender identifier.
        id: String,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Tender subcommands.
#[derive(Subcommand)]
pub(crate) enum TenderAction {
    /// Create a tender (published unless --draft).
    Add {
        /// Tender title.
        title: String,

        /// Free-text body.
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the body from a file instead.
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Attached file names (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,

        /// Create as draft instead of publishing immediately.
        #[arg(long)]
        draft: bool,
    },

    /// Publish a draft tender so the pipeline can run on it.
    Publish {
        /// Tender identifier.
        id: String,
    },

    /// List all tenders.
    List,

    /// Show a tender with its latest run's batches.
    Show {
        /// Tender identifier.
        id: String,
    },

    /// Summarize a tender via the oracle and store the payload.
    Summarize {
        /// Tender identifier.
        id: String,
    },
}

/// Catalog subcommands.
#[derive(Subcommand)]
pub(crate) enum CatalogAction {
    /// Add one catalog item.
    Add {
        /// Short SKU code (unique).
        code: String,

        /// Free-text description, the matching surface.
        description: String,

        /// Base unit price.
        price: f64,
    },

    /// List the catalog.
    List,

    /// Seed the catalog from a TOML file, or with the built-in example set.
    Seed {
        /// TOML file with `[[items]]` entries (code, description, base_price).
        #[arg(long)]
        file: Option<PathBuf>,
    },
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
        0 => "tenderflow=info",
        1 => "tenderflow=debug",
        _ => "tenderflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = match &cli.command {
        // `config init` must work before a valid config exists.
        Command::Config { .. } => None,
        _ => Some(AppContext::load(cli.data_dir.clone())?),
    };

    match cli.command {
        Command::Tender { action } => {
            let ctx = ctx.expect("context loaded");
            match action {
                TenderAction::Add {
                    title,
                    body,
                    body_file,
                    files,
                    draft,
                } => cmd_tender_add(&ctx, &title, body, body_file, files, draft).await,
                TenderAction::Publish { id } => cmd_tender_publish(&ctx, &id).await,
                TenderAction::List => cmd_tender_list(&ctx).await,
                TenderAction::Show { id } => cmd_tender_show(&ctx, &id).await,
                TenderAction::Summarize { id } => cmd_tender_summarize(&ctx, &id).await,
            }
        }
        Command::Catalog { action } => {
            let ctx = ctx.expect("context loaded");
            match action {
                CatalogAction::Add {
                    code,
                    description,
                    price,
                } => cmd_catalog_add(&ctx, &code, &description, price).await,
                CatalogAction::List => cmd_catalog_list(&ctx).await,
                CatalogAction::Seed { file } => cmd_catalog_seed(&ctx, file.as_deref()).await,
            }
        }
        Command::Run { id } => cmd_run(&ctx.expect("context loaded"), &id).await,
        Command::Status { id } => cmd_status(&ctx.expect("context loaded"), &id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared command context
// ---------------------------------------------------------------------------

/// Resolved config plus the pipeline configuration every command needs.
struct AppContext {
    config: AppConfig,
    pipeline: PipelineConfig,
}

impl AppContext {
    fn load(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let config = load_config()?;
        validate_config(&config)?;

        let mut pipeline = PipelineConfig::from(&config);
        if let Some(data_dir) = data_dir_override {
            pipeline.data_dir = data_dir;
        }

        Ok(Self { config, pipeline })
    }

    async fn open_storage(&self) -> Result<Storage> {
        let db_path = self.pipeline.data_dir.join(DB_FILE_NAME);
        Ok(Storage::open(&db_path).await?)
    }

    fn oracle(&self) -> Result<OracleClient> {
        Ok(OracleClient::new(&self.config.oracle)?)
    }
}

fn parse_tender_id(id: &str) -> Result<TenderId> {
    id.parse()
        .map_err(|e| eyre!("invalid tender id '{id}': {e}"))
}

async fn load_tender(storage: &Storage, id: &str) -> Result<Tender> {
    let tender_id = parse_tender_id(id)?;
    storage
        .get_tender(&tender_id)
        .await?
        .ok_or_else(|| eyre!("tender {tender_id} not found"))
}

// ---------------------------------------------------------------------------
// Tender commands
// ---------------------------------------------------------------------------

async fn cmd_tender_add(
    ctx: &AppContext,
    title: &str,
    body: Option<String>,
    body_file: Option<PathBuf>,
    files: Vec<String>,
    draft: bool,
) -> Result<()> {
    let body = match (body, body_file) {
        (Some(body), _) => body,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| eyre!("cannot read body file '{}': {e}", path.display()))?,
        (None, None) => return Err(eyre!("provide the tender body via --body or --body-file")),
    };

    let status = if draft {
        TenderStatus::Draft
    } else {
        TenderStatus::Public
    };
    let now = chrono::Utc::now();
    let tender = Tender {
        id: TenderId::new(),
        title: title.to_string(),
        body,
        status,
        summary: None,
        files,
        created_at: now,
        updated_at: now,
    };

    let storage = ctx.open_storage().await?;
    storage.insert_tender(&tender).await?;

    info!(tender_id = %tender.id, status = %tender.status, "tender created");
    println!("Tender created: {} ({})", tender.id, tender.status);
    Ok(())
}

async fn cmd_tender_publish(ctx: &AppContext, id: &str) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let tender = load_tender(&storage, id).await?;

    if !tender.status.can_advance_to(TenderStatus::Public) {
        return Err(eyre!(
            "tender {} is '{}', only drafts can be published",
            tender.id,
            tender.status
        ));
    }

    storage
        .set_tender_status(&tender.id, TenderStatus::Public)
        .await?;
    println!("Tender {} published", tender.id);
    Ok(())
}

async fn cmd_tender_list(ctx: &AppContext) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let tenders = storage.list_tenders().await?;

    if tenders.is_empty() {
        println!("No tenders.");
        return Ok(());
    }

    for tender in tenders {
        println!("{}  {:<10}  {}", tender.id, tender.status, tender.title);
    }
    Ok(())
}

async fn cmd_tender_show(ctx: &AppContext, id: &str) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let tender = load_tender(&storage, id).await?;

    println!("Tender:  {}", tender.id);
    println!("Title:   {}", tender.title);
    println!("Status:  {}", tender.status);
    println!("Created: {}", tender.created_at.to_rfc3339());
    if !tender.files.is_empty() {
        println!("Files:   {}", tender.files.join(", "));
    }
    if let Some(summary) = &tender.summary {
        println!("Summary: {}", serde_json::to_string_pretty(summary)?);
    }

    let Some(run) = storage.latest_run(&tender.id).await? else {
        println!("\nNo pipeline runs yet.");
        return Ok(());
    };

    let run_key = run.id.to_string();
    println!("\nLatest run: {}", run.id);
    println!("  Started:  {}", run.started_at.to_rfc3339());
    match &run.finished_at {
        Some(finished) => println!("  Finished: {}", finished.to_rfc3339()),
        None => println!("  Finished: (in progress or interrupted)"),
    }
    if let Some(error) = &run.error {
        println!("  Error:    {error}");
    }

    let requirements = storage.list_requirements(&tender.id, &run_key).await?;
    println!("\nRequirements ({}):", requirements.len());
    for requirement in &requirements {
        println!(
            "  - {} (x{}, confidence {:.2})",
            requirement.text, requirement.quantity, requirement.confidence
        );
    }

    let matches = storage.list_matches(&tender.id, &run_key).await?;
    println!("\nMatches: {}", matches.len());

    if let Some(pricing) = storage.get_pricing(&tender.id, &run_key).await? {
        println!("\nPricing:");
        for item in &pricing.line_items {
            println!("  - {} x {}: {:.2}", item.code, item.quantity, item.amount);
        }
        println!(
            "  Margin ({}%): {:.2}",
            pricing.margin_percent, pricing.margin
        );
        println!("  Total: {:.2}", pricing.total);
    }
    Ok(())
}

async fn cmd_tender_summarize(ctx: &AppContext, id: &str) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let tender = load_tender(&storage, id).await?;

    let oracle = ctx.oracle()?;
    info!(tender_id = %tender.id, "requesting tender summary");

    let spinner = make_spinner();
    spinner.set_message("Summarizing tender");
    let summary = oracle.summarize(&tender.title, &tender.body).await?;
    spinner.finish_and_clear();

    storage.set_tender_summary(&tender.id, &summary).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog commands
// ---------------------------------------------------------------------------

async fn cmd_catalog_add(ctx: &AppContext, code: &str, description: &str, price: f64) -> Result<()> {
    if price < 0.0 {
        return Err(eyre!("base price must not be negative"));
    }

    let storage = ctx.open_storage().await?;
    let item = CatalogItem {
        id: uuid::Uuid::now_v7().to_string(),
        code: code.to_string(),
        description: description.to_string(),
        base_price: price,
        created_at: chrono::Utc::now(),
    };

    if storage.insert_catalog_item(&item).await? {
        println!("Catalog item added: {code}");
    } else {
        println!("Catalog item {code} already exists, skipped");
    }
    Ok(())
}

async fn cmd_catalog_list(ctx: &AppContext) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let items = storage.list_catalog_items().await?;

    if items.is_empty() {
        println!("Catalog is empty. Seed it with `tenderflow catalog seed`.");
        return Ok(());
    }

    for item in items {
        println!("{:<12} {:>10.2}  {}", item.code, item.base_price, item.description);
    }
    Ok(())
}

/// Shape of a `catalog seed --file` TOML document.
#[derive(serde::Deserialize)]
struct SeedFile {
    items: Vec<SeedItem>,
}

#[derive(serde::Deserialize)]
struct SeedItem {
    code: String,
    description: String,
    base_price: f64,
}

/// Built-in example SKUs, used when no seed file is given.
fn builtin_seed() -> Vec<SeedItem> {
    vec![
        SeedItem {
            code: "LAPTOP123".into(),
            description: "Laptop i7 16GB 512SSD".into(),
            base_price: 45000.0,
        },
        SeedItem {
            code: "LAPTOP124".into(),
            description: "Laptop i5 8GB 256SSD".into(),
            base_price: 30000.0,
        },
        SeedItem {
            code: "MON100".into(),
            description: "24 inch monitor".into(),
            base_price: 8000.0,
        },
    ]
}

async fn cmd_catalog_seed(ctx: &AppContext, file: Option<&std::path::Path>) -> Result<()> {
    let items = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| eyre!("cannot read seed file '{}': {e}", path.display()))?;
            let seed: SeedFile = toml::from_str(&content)
                .map_err(|e| eyre!("invalid seed file '{}': {e}", path.display()))?;
            seed.items
        }
        None => builtin_seed(),
    };

    let storage = ctx.open_storage().await?;
    let mut added = 0usize;
    let mut skipped = 0usize;

    for item in items {
        let inserted = storage
            .insert_catalog_item(&CatalogItem {
                id: uuid::Uuid::now_v7().to_string(),
                code: item.code,
                description: item.description,
                base_price: item.base_price,
                created_at: chrono::Utc::now(),
            })
            .await?;
        if inserted {
            added += 1;
        } else {
            skipped += 1;
        }
    }

    println!("Catalog seeded: {added} added, {skipped} already present");
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_run(ctx: &AppContext, id: &str) -> Result<()> {
    let tender_id = parse_tender_id(id)?;
    let storage = ctx.open_storage().await?;
    let oracle = ctx.oracle()?;
    let embedder = HashEmbedder;
    let assembler = MarkdownAssembler::new(ctx.pipeline.data_dir.join("proposals"));
    let guard = std::sync::Arc::new(RunGuard::new());

    let pipeline = Pipeline::new(
        &storage,
        &oracle,
        &embedder,
        &assembler,
        guard,
        ctx.pipeline.clone(),
    );

    info!(%tender_id, "starting pipeline run");
    let reporter = CliProgress::new();
    let report = pipeline.execute(tender_id, &reporter).await?;

    println!();
    println!("  Pipeline run complete!");
    println!("  Run:          {}", report.run_id);
    if report.resumed {
        println!("  Resumed:      yes");
    }
    println!("  Requirements: {}", report.requirement_count);
    if let Some(reason) = &report.extraction_degraded {
        println!("  Degraded:     extraction fell back to an empty batch ({reason})");
    }
    println!("  Matches:      {}", report.match_count);
    println!("  Line items:   {}", report.line_item_count);
    println!(
        "  Total:        {:.2} (base {:.2} + margin {:.2})",
        report.total, report.total_base, report.margin
    );
    match &report.proposal_path {
        Some(path) => println!("  Proposal:     {}", path.display()),
        None => println!("  Proposal:     (not written, see warnings)"),
    }
    println!("  Time:         {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_status(ctx: &AppContext, id: &str) -> Result<()> {
    let storage = ctx.open_storage().await?;
    let tender = load_tender(&storage, id).await?;

    println!("{}: {}", tender.id, tender.status);

    if let Some(run) = storage.latest_run(&tender.id).await? {
        let state = match (&run.finished_at, &run.error) {
            (Some(_), _) => "finished".to_string(),
            (None, Some(error)) => format!("interrupted ({error})"),
            (None, None) => "in flight".to_string(),
        };
        let stage = run
            .last_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(none committed)".into());
        println!("Latest run {}: {state}, last stage {stage}", run.id);
    } else {
        println!("No pipeline runs yet.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

fn make_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}

/// Pipeline progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            spinner: make_spinner(),
        }
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, status: TenderStatus) {
        let label = match status {
            TenderStatus::Extracting => "Extracting requirements",
            TenderStatus::Matching => "Matching against catalog",
            TenderStatus::Pricing => "Computing pricing",
            TenderStatus::Completed => "Assembling proposal",
            _ => "Working",
        };
        self.spinner.set_message(label);
    }

    fn done(&self, _report: &PipelineReport) {
        self.spinner.finish_and_clear();
    }
}
