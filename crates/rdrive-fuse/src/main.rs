//! rdrive - Mount FTP, SFTP or Google Drive storage as a FUSE filesystem.
//!
//! Usage: rdrive --backend <url> <mountpoint>
//!        rdrive --config mount.json <mountpoint>
//!
//! Secrets are read from `RDRIVE_PASSWORD`, `RDRIVE_KEY_PASSPHRASE`,
//! `RDRIVE_ACCESS_TOKEN`, `RDRIVE_REFRESH_TOKEN`, `RDRIVE_CLIENT_ID` and
//! `RDRIVE_CLIENT_SECRET`.

use anyhow::{Context, Result};
use clap::Parser;
use rdrive_fuse::{BackendTarget, MountConfig, Secrets, build_backend, mount};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rdrive")]
#[command(about = "Mount FTP, SFTP or Google Drive storage as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// Backend URL: ftp://[user@]host[:port], sftp://user@host[:port] or gdrive://[root-id]
    #[arg(short, long, required_unless_present = "config")]
    backend: Option<String>,

    /// JSON mount configuration; --backend overrides its backend
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Password for FTP/SFTP
    #[arg(short, long, env = "RDRIVE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// SFTP private key file
    #[arg(short = 'i', long, value_name = "FILE")]
    identity: Option<PathBuf>,

    /// Authenticate SFTP with the running SSH agent
    #[arg(long)]
    agent: bool,

    /// SFTP known-hosts fingerprint file
    #[arg(long, value_name = "FILE")]
    known_hosts: Option<PathBuf>,

    /// Persisted path-to-id cache for Google Drive
    #[arg(long, value_name = "FILE")]
    path_ids: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let mountpoint = cli.mount.clone();
    if !mountpoint.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", mountpoint.display());
    }

    let mut config = load_config(&cli)?;
    config.read_only |= cli.read_only;

    let mut secrets = Secrets::from_env();
    if cli.password.is_some() {
        secrets.password.clone_from(&cli.password);
    }

    info!(backend = %config.label(), mount = %mountpoint.display(), "Mounting backend");
    let backend = build_backend(&config, &secrets).context("Failed to set up backend")?;
    let handle = mount(&config, backend, &mountpoint).context("Failed to mount filesystem")?;

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounted at {} (press Ctrl+C to unmount)", mountpoint.display());
    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount();
    info!("Filesystem unmounted");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<MountConfig> {
    let from_file = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Some(MountConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))?)
        }
        None => None,
    };

    let target = match &cli.backend {
        Some(url) => Some(BackendTarget::parse(url).map_err(anyhow::Error::msg)?),
        None => None,
    };

    let mut config = match (from_file, target) {
        (Some(mut config), Some(target)) => {
            config.backend = target;
            config
        }
        (Some(config), None) => config,
        (None, Some(target)) => MountConfig::new(target),
        (None, None) => anyhow::bail!("no backend given (pass a URL or --config)"),
    };

    apply_backend_flags(cli, &mut config.backend);
    Ok(config)
}

fn apply_backend_flags(cli: &Cli, target: &mut BackendTarget) {
    match target {
        BackendTarget::Sftp {
            key_path,
            agent,
            known_hosts,
            ..
        } => {
            if cli.identity.is_some() {
                key_path.clone_from(&cli.identity);
            }
            *agent |= cli.agent;
            if cli.known_hosts.is_some() {
                known_hosts.clone_from(&cli.known_hosts);
            }
        }
        BackendTarget::Drive { path_id_file, .. } => {
            if cli.path_ids.is_some() {
                path_id_file.clone_from(&cli.path_ids);
            }
        }
        BackendTarget::Ftp { .. } => {}
    }
}
