//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use catalogsync_core::pipeline::{
    ProgressReporter, RunOptions, Services, fetch_only, restore_run, run_pipeline,
};
use catalogsync_core::report::RunReport;
use catalogsync_shared::{
    AppConfig, RunStatus, init_config, load_config, resolve_config_path, validate_credentials,
};
use catalogsync_storage::{BatchStore, DB_FILE_NAME, FileBatchStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// catalogsync: keep a storefront search index in step with a vendor catalog.
#[derive(Parser)]
#[command(
    name = "catalogsync",
    version,
    about = "Ingest a vendor product catalog, reconcile descriptions and sync the search index.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./catalogsync.toml, then ~/.catalogsync/catalogsync.toml).
    #[arg(long, global = true, env = "CATALOGSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Run the whole pipeline once.
    Run {
        /// Ignore batch history when deduplicating.
        #[arg(long)]
        reingest: bool,

        /// Read upstream services but write nothing to them.
        #[arg(long)]
        dry_run: bool,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,

        /// Remove a stale lock left by a dead run.
        #[arg(long)]
        break_lock: bool,
    },

    /// Extract and deduplicate only, appending a batch to history.
    Fetch {
        /// Ignore batch history when deduplicating.
        #[arg(long)]
        reingest: bool,

        /// Remove a stale lock left by a dead run.
        #[arg(long)]
        break_lock: bool,
    },

    /// List stored batches.
    History,

    /// List recent runs from the run ledger.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the report of a past run.
    Report {
        /// Run id.
        run_id: String,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Put back the index documents a run deleted.
    Restore {
        /// Run id.
        run_id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Check the configuration and service credentials.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "catalogsync=info",
        1 => "catalogsync=debug",
        _ => "catalogsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            reingest,
            dry_run,
            json,
            break_lock,
        } => {
            let options = RunOptions {
                reingest,
                dry_run,
                break_lock,
            };
            cmd_run(config_path, options, json).await
        }
        Command::Fetch {
            reingest,
            break_lock,
        } => cmd_fetch(config_path, reingest, break_lock).await,
        Command::History => cmd_history(config_path).await,
        Command::Runs { limit } => cmd_runs(config_path, limit).await,
        Command::Report { run_id, json } => cmd_report(config_path, &run_id, json).await,
        Command::Restore { run_id } => cmd_restore(config_path, &run_id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path).await,
            ConfigAction::Show => cmd_config_show(config_path).await,
            ConfigAction::Validate => cmd_config_validate(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, options: RunOptions, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    validate_credentials(&config)?;

    let real = Services::http(&config)?;
    let services = if options.dry_run {
        Services::dry_run_from(&real).await?
    } else {
        real
    };

    info!(
        source = %config.source_label(),
        dry_run = options.dry_run,
        reingest = options.reingest,
        "starting catalog run"
    );

    let progress = CliProgress::new();
    let report = run_pipeline(&config, &services, options, &progress).await?;
    print_report(&report, json)?;

    if report.status == RunStatus::RolledBack {
        return Err(eyre!(
            "index writes failed and deletions were rolled back (run {})",
            report.run_id
        ));
    }
    Ok(())
}

async fn cmd_fetch(config_path: Option<&Path>, reingest: bool, break_lock: bool) -> Result<()> {
    let config = load_config(config_path)?;
    info!(source = %config.source_label(), reingest, "fetching vendor catalog");

    let progress = CliProgress::new();
    let report = fetch_only(&config, reingest, break_lock, &progress).await?;

    println!();
    println!("  Fetched:   {}", report.fetch.products_fetched);
    println!("  Retained:  {}", report.retained);
    println!("  Skipped:   {}", report.skipped.len());
    println!(
        "  Batch:     {}",
        report.batch_id.as_deref().unwrap_or("(nothing new)")
    );
    println!();
    Ok(())
}

async fn cmd_history(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = FileBatchStore::new(&config.run.state_dir_path()?);
    let batches = store.load_batches()?;

    if batches.is_empty() {
        println!("No batches in {}", store.dir().display());
        return Ok(());
    }

    println!();
    for batch in &batches {
        println!(
            "  {}  {}  {:>5} products  {}",
            batch.id,
            batch.extracted_at.format("%Y-%m-%d %H:%M:%S"),
            batch.products.len(),
            batch.source
        );
    }
    println!();
    println!("  Total: {} batches", batches.len());
    println!();
    Ok(())
}

async fn cmd_runs(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let storage = open_ledger(config_path).await?;
    let runs = storage.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!();
    for run in &runs {
        println!(
            "  {}  {}  {:<22}{}  {}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.status.as_str(),
            if run.dry_run { " (dry run)" } else { "" },
            run.source
        );
    }
    println!();
    Ok(())
}

async fn cmd_report(config_path: Option<&Path>, run_id: &str, json: bool) -> Result<()> {
    let storage = open_ledger(config_path).await?;
    let run = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| eyre!("no run with id '{run_id}'"))?;
    let raw = run
        .report_json
        .ok_or_else(|| eyre!("run '{run_id}' has no report (status: {})", run.status))?;

    match serde_json::from_str::<RunReport>(&raw) {
        Ok(report) => print_report(&report, json),
        // Failed runs store only an error object.
        Err(_) => {
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

async fn cmd_restore(config_path: Option<&Path>, run_id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    validate_credentials(&config)?;
    let services = Services::http(&config)?;

    info!(run_id, "restoring deleted index documents");
    let summary = restore_run(&config, services.index, run_id).await?;

    println!();
    println!("  Restored:          {}", summary.restored);
    println!("  Already restored:  {}", summary.already_restored);
    println!("  Failed:            {}", summary.failed);
    println!();

    if summary.failed > 0 {
        return Err(eyre!("{} documents could not be restored", summary.failed));
    }
    Ok(())
}

async fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = init_config(config_path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config: AppConfig = load_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_validate(config_path: Option<&Path>) -> Result<()> {
    let source = resolve_config_path(config_path)?;
    let config = load_config(config_path)?;
    config.validate()?;
    validate_credentials(&config)?;

    match source {
        Some(path) => println!("Config OK: {}", path.display()),
        None => println!("Config OK (defaults)"),
    }
    Ok(())
}

async fn open_ledger(config_path: Option<&Path>) -> Result<Storage> {
    let config = load_config(config_path)?;
    let db_path = config.run.state_dir_path()?.join(DB_FILE_NAME);
    Ok(Storage::open_readonly(&db_path).await?)
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!();
        print!("{}", report.render());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    phase: Mutex<String>,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            phase: Mutex::new(String::new()),
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        *phase = name.to_string();
        self.spinner.set_message(name.to_string());
    }

    fn items(&self, current: usize, total: usize) {
        let phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        self.spinner
            .set_message(format!("{phase} [{current}/{total}]"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}
