//! vaultsync CLI
//!
//! Syncs an Obsidian vault into a Confluence space, once or on an interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vaultsync::error::{Result, SyncError};
use vaultsync::remote::{ConfluenceClient, RemoteClient, RetryPolicy, RetryingClient};
use vaultsync::report::write_run_artifacts;
use vaultsync::storage::IdentityStore;
use vaultsync::sync::{CancelToken, SyncEngine};
use vaultsync::types::*;
use vaultsync::vault::{scan_vault, StorageFormatConverter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StorageModeArg {
    Local,
    CloudSafe,
}

impl From<StorageModeArg> for StorageMode {
    fn from(arg: StorageModeArg) -> Self {
        match arg {
            StorageModeArg::Local => StorageMode::Local,
            StorageModeArg::CloudSafe => StorageMode::CloudSafe,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ChangeSignalArg {
    /// Only a new version number counts as a remote change
    Version,
    /// A new version, or a page touched after the last sync
    VersionAndTimestamp,
}

impl From<ChangeSignalArg> for ChangeSignal {
    fn from(arg: ChangeSignalArg) -> Self {
        match arg {
            ChangeSignalArg::Version => ChangeSignal::VersionOnly,
            ChangeSignalArg::VersionAndTimestamp => ChangeSignal::VersionAndTimestamp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vaultsync")]
#[command(about = "One-way sync of an Obsidian vault into Confluence")]
#[command(version)]
struct Cli {
    /// Confluence site URL, e.g. https://example.atlassian.net/wiki
    #[arg(long, env = "CONFLUENCE_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "CONFLUENCE_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "CONFLUENCE_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    #[arg(long, env = "CONFLUENCE_SPACE_KEY")]
    space_key: Option<String>,

    /// Title of the page everything is synced under
    #[arg(long, env = "CONFLUENCE_ROOT_PAGE_TITLE", default_value = "Knowledge Base")]
    root_page_title: String,

    /// Vault directory
    #[arg(long, env = "OBSIDIAN_VAULT_PATH")]
    vault_path: Option<String>,

    /// State database path
    #[arg(
        long,
        env = "VAULTSYNC_STATE_PATH",
        default_value = "~/.local/share/vaultsync/state.db"
    )]
    state_path: String,

    /// Journal mode for the state database
    #[arg(long, env = "VAULTSYNC_STORAGE_MODE", value_enum, default_value = "local")]
    storage_mode: StorageModeArg,

    /// Minutes between scheduled runs
    #[arg(long, env = "SYNC_INTERVAL_MINUTES", default_value = "60")]
    interval_minutes: u64,

    /// Plan only, never write to Confluence
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Maximum page writes in flight
    #[arg(long, env = "VAULTSYNC_CONCURRENCY", default_value = "4")]
    concurrency: usize,

    /// What counts as a remote change
    #[arg(long, env = "VAULTSYNC_CHANGE_SIGNAL", value_enum, default_value = "version")]
    change_signal: ChangeSignalArg,

    /// Attempts per remote call, including the first
    #[arg(long, env = "VAULTSYNC_MAX_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    /// Timeout for a single remote call, in seconds
    #[arg(long, env = "VAULTSYNC_CALL_TIMEOUT_SECS", default_value = "30")]
    call_timeout_secs: u64,

    /// Where dry-run plans are written
    #[arg(long, env = "VAULTSYNC_REPORTS_DIR", default_value = "reports")]
    reports_dir: PathBuf,

    /// Where conflict reports are written
    #[arg(long, env = "VAULTSYNC_CONFLICTS_DIR", default_value = "conflicts")]
    conflicts_dir: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single sync cycle
    Run,
    /// Run on an interval until interrupted (first run is immediate)
    Watch,
    /// Compute and write the plan without touching Confluence
    Plan,
    /// Print the identity store as JSON
    Bindings,
    /// Get or create the root page
    EnsureRoot,
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init(),
    }
}

fn required(value: &Option<String>, var: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SyncError::Config(format!("{} is required", var)))
}

fn open_store(cli: &Cli) -> Result<IdentityStore> {
    let store = IdentityStore::open(StorageConfig {
        db_path: shellexpand::tilde(&cli.state_path).to_string(),
        storage_mode: cli.storage_mode.into(),
    })?;
    if let Some(warning) = store.storage_mode_warning() {
        tracing::warn!("{}", warning);
    }
    Ok(store)
}

fn build_remote(cli: &Cli) -> Result<Arc<dyn RemoteClient>> {
    let config = RemoteConfig {
        base_url: required(&cli.base_url, "CONFLUENCE_BASE_URL")?,
        email: required(&cli.email, "CONFLUENCE_EMAIL")?,
        api_token: required(&cli.api_token, "CONFLUENCE_API_TOKEN")?,
        space_key: required(&cli.space_key, "CONFLUENCE_SPACE_KEY")?,
    };
    let policy = RetryPolicy {
        max_attempts: cli.max_attempts.max(1),
        call_timeout: Duration::from_secs(cli.call_timeout_secs.max(1)),
        ..Default::default()
    };
    let client = ConfluenceClient::new(config)?;
    Ok(Arc::new(RetryingClient::new(client, policy)))
}

fn sync_config(cli: &Cli) -> SyncConfig {
    SyncConfig {
        root_page_title: cli.root_page_title.clone(),
        concurrency: cli.concurrency.max(1),
        change_signal: cli.change_signal.into(),
        ..Default::default()
    }
}

/// Scan the vault and run one sync cycle
async fn run_cycle(
    cli: &Cli,
    vault: &Path,
    remote: Arc<dyn RemoteClient>,
    store: IdentityStore,
    mode: SyncMode,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let scan_root = vault.to_path_buf();
    let documents = tokio::task::spawn_blocking(move || scan_vault(&scan_root))
        .await
        .map_err(|e| SyncError::Internal(format!("vault scan task failed: {}", e)))??;

    let converter =
        StorageFormatConverter::with_titles(documents.iter().map(|d| d.display_title().to_string()));
    let engine = SyncEngine::new(remote, store, Arc::new(converter), sync_config(cli));
    let report = engine.run(&documents, mode, cancel).await?;

    write_run_artifacts(&report, &cli.reports_dir, &cli.conflicts_dir)?;
    Ok(report)
}

fn spawn_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mode = match (&cli.command, cli.dry_run) {
        (Commands::Plan, _) | (_, true) => SyncMode::Simulate,
        _ => SyncMode::Live,
    };

    match cli.command {
        Commands::Bindings => {
            let store = open_store(&cli)?;
            println!("{}", serde_json::to_string_pretty(&store.all())?);
        }
        Commands::EnsureRoot => {
            let store = open_store(&cli)?;
            let engine = SyncEngine::new(
                build_remote(&cli)?,
                store,
                Arc::new(StorageFormatConverter::new()),
                sync_config(&cli),
            );
            let root = engine.ensure_root(mode).await?;
            println!(
                "{} {}",
                root.page_id.as_deref().unwrap_or("-"),
                root.outcome.as_str()
            );
        }
        Commands::Run | Commands::Plan => {
            let vault = PathBuf::from(required(&cli.vault_path, "OBSIDIAN_VAULT_PATH")?);
            let store = open_store(&cli)?;
            let remote = build_remote(&cli)?;
            let cancel = CancelToken::new();
            spawn_ctrl_c(cancel.clone());

            let report = run_cycle(&cli, &vault, remote, store, mode, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report.summary)?);
            if report.has_failures() {
                std::process::exit(1);
            }
        }
        Commands::Watch => {
            let vault = PathBuf::from(required(&cli.vault_path, "OBSIDIAN_VAULT_PATH")?);
            let store = open_store(&cli)?;
            let remote = build_remote(&cli)?;
            let cancel = CancelToken::new();
            spawn_ctrl_c(cancel.clone());

            let interval = Duration::from_secs(cli.interval_minutes.max(1) * 60);
            tracing::info!(
                interval_minutes = cli.interval_minutes,
                simulated = mode == SyncMode::Simulate,
                "Starting scheduler"
            );

            // Cycles run strictly one after another; the store has a single writer
            while !cancel.is_cancelled() {
                match run_cycle(&cli, &vault, remote.clone(), store.clone(), mode, &cancel).await {
                    Ok(report) => tracing::info!(
                        run_id = %report.run_id,
                        failed = report.summary.failed,
                        "Scheduled run complete"
                    ),
                    Err(e) => tracing::error!(error_kind = e.kind(), error = %e, "Scheduled run failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            tracing::info!("Scheduler stopped");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_flags_parse() {
        let cli = Cli::try_parse_from([
            "vaultsync",
            "--storage-mode",
            "cloud-safe",
            "--change-signal",
            "version-and-timestamp",
            "run",
        ])
        .unwrap();
        assert_eq!(StorageMode::from(cli.storage_mode), StorageMode::CloudSafe);
        assert_eq!(
            sync_config(&cli).change_signal,
            ChangeSignal::VersionAndTimestamp
        );
    }

    #[test]
    fn test_unknown_enum_values_are_rejected() {
        assert!(Cli::try_parse_from(["vaultsync", "--storage-mode", "cloudsafe", "run"]).is_err());
        assert!(Cli::try_parse_from(["vaultsync", "--change-signal", "sometimes", "run"]).is_err());
    }
}
