//! vsd: vaultsync folder daemon
//!
//! Usage:
//!   vsd [--config /etc/vaultsync/config.toml] run
//!   vsd secret new
//!   vsd secret derive --level read-only <SECRET>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vs_core::config::VaultConfig;
use vs_crypto::{Secret, SecretLevel};
use vs_sync::FolderGroup;

#[derive(Parser, Debug)]
#[command(name = "vsd", version, about = "vaultsync folder daemon")]
struct Cli {
    /// Path to the vaultsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "VAULTSYNC_CONFIG",
        default_value = "/etc/vaultsync/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "VAULTSYNC_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "VAULTSYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open, scan and synchronize every configured folder
    Run,
    /// Folder secret utilities
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Generate a new owner secret for a fresh folder
    New,
    /// Derive a lower-privilege secret (read-write, read-only, untrusted)
    Derive {
        #[arg(long, default_value = "read-only")]
        level: String,
        secret: String,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Secret { action } => secret_command(action),
        Command::Run => {
            let (config, found) = load_config(&cli.config).await?;
            let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
            let format = match &cli.log_format {
                Some(format) => format.clone(),
                None => LogFormat::from_str(&config.daemon.log_format, true)
                    .map_err(|e| anyhow::anyhow!("daemon.log_format: {e}"))?,
            };
            init_logging(&level, &format);

            info!(
                version = env!("CARGO_PKG_VERSION"),
                config = %cli.config.display(),
                "vsd starting"
            );
            if !found {
                warn!(
                    "config file not found: {}  (using defaults)",
                    cli.config.display()
                );
            }
            run(config).await
        }
    }
}

fn secret_command(action: &SecretAction) -> Result<()> {
    match action {
        SecretAction::New => {
            let secret = Secret::generate().context("generating folder secret")?;
            println!("{secret}");
        }
        SecretAction::Derive { level, secret } => {
            let level: SecretLevel = level
                .parse()
                .with_context(|| format!("unknown secret level: {level}"))?;
            let secret: Secret = secret.parse().context("parsing secret")?;
            let derived = secret
                .derive(level)
                .with_context(|| format!("deriving {level:?} secret"))?;
            println!("{derived}");
        }
    }
    Ok(())
}

async fn run(config: VaultConfig) -> Result<()> {
    if config.folders.is_empty() {
        warn!("no folders configured, nothing to do");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for folder in &config.folders {
        let group = FolderGroup::open(folder, &config)
            .with_context(|| format!("opening folder {}", folder.path.display()))?;
        let changed = group
            .scan()
            .await
            .with_context(|| format!("scanning folder {}", folder.path.display()))?;
        info!(folder_id = %group.folder_id(), changed, "folder ready");
        tasks.spawn(group.run(shutdown_rx.clone()));
    }

    wait_for_shutdown().await?;
    info!("shutdown signal received, stopping folders");
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("folder task failed: {e}");
        }
    }
    info!("vsd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")
}

/// Returns the parsed config and whether the file existed.
async fn load_config(path: &Path) -> Result<(VaultConfig, bool)> {
    if !path.exists() {
        return Ok((VaultConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = VaultConfig::from_toml(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
