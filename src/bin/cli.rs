//! Pilgrim CLI
//!
//! CI entry point: scan the catalog, mirror the store, prune provenance refs.
//! The last stdout line is `status=<...>` for commit messaging.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pilgrim::{
    error::Result,
    models::{Config, IdRange, MirrorMode, MirrorTarget, RunStatus, StoredPolicy},
    pipeline::{self, Crawler, ScanOptions},
    services::{CatalogApi, GitRemote, HttpCatalog, Notifier, Severity, notifier},
    storage::{LocalStore, RecordStore, ScanState},
    utils::log as runlog,
};
use serde::Serialize;

/// Exit code when another run holds the store lock (EX_TEMPFAIL).
const EXIT_ALREADY_RUNNING: u8 = 75;

/// Pilgrim - anime pilgrimage catalog crawler
#[derive(Parser, Debug)]
#[command(
    name = "pilgrim",
    version,
    about = "Anime pilgrimage catalog crawler and mirror distributor"
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "pilgrim.toml")]
    config: PathBuf,

    /// Record store directory
    #[arg(long, default_value = "pic/data")]
    base_dir: PathBuf,

    /// Notification endpoint (overrides [notify] url)
    #[arg(long, env = "NOTIFY_URL", hide_env_values = true)]
    notify_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan an id range of the catalog API into the record store
    Scan {
        /// First id to scan (inclusive)
        #[arg(long, allow_negative_numbers = true)]
        start: Option<i64>,

        /// End of the range (exclusive)
        #[arg(long, allow_negative_numbers = true)]
        end: Option<i64>,

        /// Requests per second across all workers (0 = unlimited)
        #[arg(long)]
        rate_limit: Option<f64>,

        /// Concurrent lookups
        #[arg(long)]
        workers: Option<usize>,

        /// Consecutive unresolved lookups before the scan stops
        #[arg(long)]
        max_api_failures: Option<u32>,

        /// Wall-clock budget in hours
        #[arg(long)]
        max_hours: Option<f64>,

        /// Retries per lookup after a transient failure
        #[arg(long)]
        max_wait_attempts: Option<u32>,

        /// Merge records by group key and partial names
        #[arg(long)]
        aggressive: bool,

        /// Write the JSON scan result here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Push the record store to mirror repositories
    Mirror {
        /// Repositories that receive the whole store
        #[arg(long, value_delimiter = ',')]
        mirrors: Vec<String>,

        /// Split folders across --load-balance-repos
        #[arg(long)]
        load_balance: bool,

        /// Repositories that share the store between them
        #[arg(long, value_delimiter = ',')]
        load_balance_repos: Vec<String>,

        /// Explicit folder ranges, e.g. [[[1,700]],[[701,null]]]
        #[arg(long)]
        folder_ranges: Option<String>,

        /// Branch to push (overrides [mirror] branch)
        #[arg(long)]
        branch: Option<String>,

        /// Push token for targets without their own token_env
        #[arg(long, env = "MIRROR_TOKEN", hide_env_values = true)]
        mirror_token: Option<String>,

        /// Write the JSON distribution report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Drop redundant origin refs older than the grace period
    PruneOrigins {
        #[arg(long, default_value_t = 30)]
        grace_days: i64,
    },

    /// Validate configuration
    Validate,

    /// Show store and scan state
    Info,
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = Config::load_or_default(&cli.config);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log::error!("Setup error: cannot load {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = &cli.notify_url {
        config.notify.url = Some(url.clone());
    }

    match run(&cli, config).await {
        Ok(Some(status)) => {
            println!("status={status}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) if e.is_lock_held() => {
            log::warn!("Skipping: {e}");
            ExitCode::from(EXIT_ALREADY_RUNNING)
        }
        Err(e) => {
            if e.is_fatal_setup() {
                log::error!("Setup error: {e}");
            } else {
                log::error!("Run failed: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: Config) -> Result<Option<RunStatus>> {
    let sink = notifier::from_config(&config.notify);
    let store = LocalStore::new(&cli.base_dir);
    let state = ScanState::new(&cli.base_dir, &config.state);

    match &cli.command {
        Command::Scan {
            start,
            end,
            rate_limit,
            workers,
            max_api_failures,
            max_hours,
            max_wait_attempts,
            aggressive,
            report,
        } => {
            let mut config = config;
            let crawler = &mut config.crawler;
            let range = IdRange::new(
                start.unwrap_or(crawler.start_id as i64),
                end.unwrap_or(crawler.end_id as i64),
            )?;
            crawler.start_id = range.start;
            crawler.end_id = range.end;
            crawler.rate_limit = rate_limit.unwrap_or(crawler.rate_limit);
            crawler.max_concurrent = workers.unwrap_or(crawler.max_concurrent);
            crawler.max_api_failures = max_api_failures.unwrap_or(crawler.max_api_failures);
            crawler.max_runtime_hours = max_hours.unwrap_or(crawler.max_runtime_hours);
            crawler.max_wait_attempts = max_wait_attempts.unwrap_or(crawler.max_wait_attempts);
            crawler.aggressive_matching |= *aggressive;
            config.validate()?;

            let outcome = scan(&config, &store, &state, range, report.as_deref()).await;
            announce(sink.as_ref(), "Pilgrim scan", outcome).await
        }

        Command::Mirror {
            mirrors,
            load_balance,
            load_balance_repos,
            folder_ranges,
            branch,
            mirror_token,
            report,
        } => {
            config.validate()?;
            let targets = mirror_targets(
                &config,
                mirrors,
                load_balance_repos,
                *load_balance,
                mirror_token.as_deref(),
            );
            if targets.is_empty() {
                log::warn!("No mirror targets configured; nothing to push");
                return Ok(Some(RunStatus::NothingToDo));
            }

            let mut remote = GitRemote::new(&config.mirror);
            if let Some(branch) = branch {
                remote = remote.with_branch(branch);
            }

            let outcome = state
                .with_lock(|| {
                    pipeline::run_mirror(
                        &store,
                        &remote,
                        &targets,
                        folder_ranges.as_deref(),
                        &config.state.policy_file,
                    )
                })
                .await
                .and_then(|dist| {
                    write_report(report.as_deref(), &dist)?;
                    let failed: Vec<&str> =
                        dist.failed().map(|r| r.destination.as_str()).collect();
                    let mut message = format!(
                        "{} destinations, {} pushed",
                        dist.outcomes.len(),
                        dist.pushed_count()
                    );
                    if !failed.is_empty() {
                        message.push_str(&format!(", failed: {}", failed.join(", ")));
                    }
                    Ok((dist.status(), message))
                });
            announce(sink.as_ref(), "Pilgrim mirror", outcome).await
        }

        Command::PruneOrigins { grace_days } => {
            let grace = chrono::Duration::days(*grace_days);
            let pruned = state
                .with_lock(|| pipeline::prune_origins(&store, grace, chrono::Utc::now()))
                .await?;
            let status = if pruned.origins_removed > 0 {
                RunStatus::Completed
            } else {
                RunStatus::NothingToDo
            };
            Ok(Some(status))
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK ({} mirror targets)", config.mirror.targets.len());

            let folders = store.list_folders().await?;
            let catalog = store.load_catalog().await?;
            log::info!(
                "✓ Store OK: {} folders, {} entries",
                folders.len(),
                catalog.len()
            );
            log::info!("All validations passed!");
            Ok(None)
        }

        Command::Info => {
            info(cli, &config, &store, &state).await?;
            Ok(None)
        }
    }
}

async fn scan(
    config: &Config,
    store: &LocalStore,
    state: &ScanState,
    range: IdRange,
    report: Option<&Path>,
) -> Result<(RunStatus, String)> {
    let api: Arc<dyn CatalogApi> = Arc::new(HttpCatalog::from_config(&config.crawler)?);
    let crawler = Crawler::new(api, ScanOptions::from_config(&config.crawler, range));

    let result = state.with_lock(|| crawler.scan(store, state)).await?;
    write_report(report, &result)?;

    let mut message = format!(
        "[{}, {}): next_id {}, {} matched, {} new, {} updated",
        range.start,
        range.end,
        result.cursor.next_id,
        result.matched.len(),
        result.created.len(),
        result.updated.len()
    );
    if !result.matched.is_empty() {
        message.push_str(&format!(" ({})", runlog::id_list(&result.matched, 10)));
    }
    if !result.rejected.is_empty() {
        message.push_str(&format!(", {} rejected", result.rejected.len()));
    }
    Ok((result.status.run_status(), message))
}

/// Send the run summary and pass the status through. A held lock is not
/// announced: the owning run reports for itself.
async fn announce(
    notifier: &dyn Notifier,
    title: &str,
    outcome: Result<(RunStatus, String)>,
) -> Result<Option<RunStatus>> {
    match outcome {
        Ok((status, message)) => {
            let severity = match status {
                RunStatus::Partial => Severity::Warning,
                RunStatus::Completed | RunStatus::NothingToDo => Severity::Info,
            };
            notifier
                .notify(title, &format!("{status}: {message}"), severity)
                .await;
            Ok(Some(status))
        }
        Err(e) if e.is_lock_held() => Err(e),
        Err(e) => {
            notifier
                .notify(title, &format!("failed: {e}"), Severity::Error)
                .await;
            Err(e)
        }
    }
}

fn mirror_targets(
    config: &Config,
    mirrors: &[String],
    load_balance_repos: &[String],
    load_balance: bool,
    token: Option<&str>,
) -> Vec<MirrorTarget> {
    let mut targets: Vec<MirrorTarget> = config
        .mirror
        .targets
        .iter()
        .map(|t| t.resolve(token))
        .collect();

    if !load_balance && !load_balance_repos.is_empty() {
        log::warn!("--load-balance-repos given without --load-balance; pushing them in full");
    }
    let balanced_mode = if load_balance {
        MirrorMode::Partitioned
    } else {
        MirrorMode::Full
    };

    let from_flags = mirrors
        .iter()
        .map(|url| (url, MirrorMode::Full))
        .chain(load_balance_repos.iter().map(|url| (url, balanced_mode)));
    for (url, mode) in from_flags {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        let id = MirrorTarget::id_from_url(url);
        if targets.iter().any(|t| t.id == id) {
            log::warn!("Mirror {id} listed twice; keeping the first");
            continue;
        }
        targets.push(MirrorTarget::new(id, url, mode, token.map(str::to_string)));
    }
    targets
}

fn write_report<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    log::info!("Report written to {}", path.display());
    Ok(())
}

async fn info(cli: &Cli, config: &Config, store: &LocalStore, state: &ScanState) -> Result<()> {
    runlog::header("Pilgrim store");
    log::info!("Store directory: {}", cli.base_dir.display());

    let folders = store.list_folders().await?;
    log::info!(
        "Folders: {} ({})",
        folders.len(),
        match (folders.first(), folders.last()) {
            (Some(first), Some(last)) => format!("{first}..={last}"),
            _ => "empty".to_string(),
        }
    );

    let cursor = state.load().await?;
    log::info!(
        "Cursor: next_id={} attempt={} covered={} unresolved={}",
        cursor.next_id,
        cursor.attempt,
        cursor.covered.count(),
        cursor.unresolved.len()
    );
    log::info!("Last updated: {}", cursor.updated_at.to_rfc3339());

    match state.lock().holder() {
        Some(holder) => log::info!(
            "Lock: held by {} (pid {}) since {}",
            holder.owner,
            holder.pid,
            holder.acquired_at.to_rfc3339()
        ),
        None => log::info!("Lock: free"),
    }

    match store.read_json::<StoredPolicy>(&config.state.policy_file).await {
        Ok(Some(stored)) => log::info!(
            "Folder policy: {} (since {})",
            stored.policy.to_wire(&stored.destinations),
            stored.created_at.to_rfc3339()
        ),
        Ok(None) => log::info!("Folder policy: none saved"),
        Err(e) => log::warn!("Folder policy unreadable: {e}"),
    }

    if config.mirror.targets.is_empty() {
        log::info!("Mirror targets: none configured");
    }
    for target in &config.mirror.targets {
        log::info!("Mirror target: {} ({})", target.id, target.mode);
    }
    Ok(())
}
