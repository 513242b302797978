//! Wiring a [`MountConfig`] into a running FUSE mount.
//!
//! [`build_backend`] turns the backend target plus secrets into a
//! [`Connector`]; [`mount`] builds the pool, bridge and worker pool around it
//! and starts a background fuser session.

use crate::bridge::RemoteFs;
use crate::config::{BackendTarget, MountConfig};
use crate::filesystem::RdriveFs;
use crate::workers::WorkerPool;
use fuser::{BackgroundSession, MountOption};
use rdrive_core::auth::{GOOGLE_TOKEN_URL, HttpTokenEndpoint};
use rdrive_core::ftp::{FtpConnector, FtpSettings};
use rdrive_core::gdrive::{DriveConnector, DriveSettings, PathIdCache};
use rdrive_core::sftp::{SftpConnector, SftpSettings};
use rdrive_core::{
    Connector, Credentials, KeepaliveHandle, KnownHosts, OAuthTokens, RemoteError, SessionPool, TokenManager,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Secret material that never appears in the config document.
#[derive(Clone, Default)]
pub struct Secrets {
    pub password: Option<String>,
    pub key_passphrase: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Secrets {
    /// Reads `RDRIVE_PASSWORD`, `RDRIVE_KEY_PASSPHRASE`, `RDRIVE_ACCESS_TOKEN`,
    /// `RDRIVE_REFRESH_TOKEN`, `RDRIVE_CLIENT_ID` and `RDRIVE_CLIENT_SECRET`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            password: var("RDRIVE_PASSWORD"),
            key_passphrase: var("RDRIVE_KEY_PASSPHRASE"),
            access_token: var("RDRIVE_ACCESS_TOKEN"),
            refresh_token: var("RDRIVE_REFRESH_TOKEN"),
            client_id: var("RDRIVE_CLIENT_ID"),
            client_secret: var("RDRIVE_CLIENT_SECRET"),
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("password", &set(&self.password))
            .field("key_passphrase", &set(&self.key_passphrase))
            .field("access_token", &set(&self.access_token))
            .field("refresh_token", &set(&self.refresh_token))
            .field("client_id", &set(&self.client_id))
            .field("client_secret", &set(&self.client_secret))
            .finish()
    }
}

fn required(value: Option<&String>, name: &'static str) -> Result<String, SetupError> {
    value.cloned().ok_or(SetupError::MissingCredential(name))
}

/// A connector plus the state that must be persisted at unmount.
pub struct Backend {
    pub connector: Arc<dyn Connector>,
    pub path_ids: Option<Arc<PathIdCache>>,
}

/// Builds the connector for the configured backend.
pub fn build_backend(config: &MountConfig, secrets: &Secrets) -> Result<Backend, SetupError> {
    let timeout = config.connection.operation_timeout;
    match &config.backend {
        BackendTarget::Ftp {
            host,
            port,
            username,
            passive,
        } => {
            let credentials = match username {
                Some(username) => Some(Credentials::Password {
                    username: username.clone(),
                    password: required(secrets.password.as_ref(), "RDRIVE_PASSWORD")?,
                }),
                None => None,
            };
            let mut settings = FtpSettings::new(host.clone());
            settings.port = *port;
            settings.credentials = credentials;
            settings.passive = *passive;
            settings.timeout = timeout;
            Ok(Backend {
                connector: Arc::new(FtpConnector::new(settings)),
                path_ids: None,
            })
        }
        BackendTarget::Sftp {
            host,
            port,
            username,
            key_path,
            agent,
            known_hosts,
        } => {
            let credentials = match (key_path, agent) {
                (Some(key_path), _) => Credentials::PrivateKey {
                    username: username.clone(),
                    key_path: key_path.clone(),
                    passphrase: secrets.key_passphrase.clone(),
                },
                (None, true) => Credentials::Agent {
                    username: username.clone(),
                },
                (None, false) => Credentials::Password {
                    username: username.clone(),
                    password: required(secrets.password.as_ref(), "RDRIVE_PASSWORD")?,
                },
            };
            let known_hosts = match known_hosts {
                Some(path) => KnownHosts::load(path.clone())?,
                None => {
                    warn!("No known_hosts file configured; host keys are trusted for this run only");
                    KnownHosts::in_memory()
                }
            };
            let mut settings = SftpSettings::new(host.clone(), credentials);
            settings.port = *port;
            settings.timeout = timeout;
            Ok(Backend {
                connector: Arc::new(SftpConnector::new(settings, Arc::new(known_hosts))?),
                path_ids: None,
            })
        }
        BackendTarget::Drive {
            root_id,
            path_id_file,
            token_url,
        } => {
            let tokens = OAuthTokens {
                client_id: required(secrets.client_id.as_ref(), "RDRIVE_CLIENT_ID")?,
                client_secret: required(secrets.client_secret.as_ref(), "RDRIVE_CLIENT_SECRET")?,
                access_token: secrets.access_token.clone().unwrap_or_default(),
                refresh_token: required(secrets.refresh_token.as_ref(), "RDRIVE_REFRESH_TOKEN")?,
                expires_at: None,
            };
            let endpoint = HttpTokenEndpoint::with_url(token_url.as_deref().unwrap_or(GOOGLE_TOKEN_URL), timeout)?;
            let tokens = Arc::new(TokenManager::new(tokens, Box::new(endpoint)));
            let path_ids = Arc::new(match path_id_file {
                Some(file) => PathIdCache::load(file.clone(), config.path_id_ttl),
                None => PathIdCache::in_memory(config.path_id_ttl),
            });
            let settings = DriveSettings {
                root_id: root_id.clone(),
                timeout,
                ..DriveSettings::default()
            };
            Ok(Backend {
                connector: Arc::new(DriveConnector::new(settings, tokens, Arc::clone(&path_ids))?),
                path_ids: Some(path_ids),
            })
        }
    }
}

/// Builds the bridge for `connector` as configured. Also used by tests,
/// which mount nothing.
pub fn build_remote_fs(config: &MountConfig, connector: Arc<dyn Connector>) -> RemoteFs {
    let pool = Arc::new(SessionPool::new(connector, config.connection.clone()));
    RemoteFs::new(pool, config.cache.clone(), config.buffer.clone()).with_volume(config.label(), config.capacity_bytes)
}

/// A live mount. Dropping it unmounts.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    keepalive: Option<KeepaliveHandle>,
    path_ids: Option<Arc<PathIdCache>>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts, flushing open handles, and persists backend state.
    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(mountpoint = %self.mountpoint.display(), "Joining FUSE session");
            session.join();
        }
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if let Some(path_ids) = self.path_ids.take()
            && let Err(e) = path_ids.save()
        {
            warn!(error = %e, "Failed to persist path-id cache");
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Mounts `backend` at `mountpoint` in a background session.
pub fn mount(config: &MountConfig, backend: Backend, mountpoint: &Path) -> Result<MountHandle, SetupError> {
    let fs = build_remote_fs(config, backend.connector);
    let keepalive = fs.pool().spawn_keepalive()?;
    let workers = WorkerPool::new(config.connection.pool_size, config.connection.acquire_timeout)?;
    let label = config.label();
    let rdrive = RdriveFs::new(fs, workers, config.attr_ttl, config.read_only);

    let mut options = vec![
        MountOption::FSName(label.clone()),
        MountOption::Subtype("rdrive".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    #[cfg(target_os = "macos")]
    options.push(MountOption::CUSTOM(format!("volname={label}")));
    options.push(if config.read_only { MountOption::RO } else { MountOption::RW });

    let session = fuser::spawn_mount2(rdrive, mountpoint, &options)?;
    info!(mountpoint = %mountpoint.display(), backend = %label, "Filesystem mounted");

    Ok(MountHandle {
        session: Some(session),
        keepalive: Some(keepalive),
        path_ids: backend.path_ids,
        mountpoint: mountpoint.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sftp_config(key_path: Option<PathBuf>, agent: bool) -> MountConfig {
        MountConfig::new(BackendTarget::Sftp {
            host: "files.example.org".into(),
            port: 22,
            username: "alice".into(),
            key_path,
            agent,
            known_hosts: None,
        })
    }

    #[test]
    fn test_sftp_password_requires_secret() {
        let err = build_backend(&sftp_config(None, false), &Secrets::default()).err().unwrap();
        assert!(matches!(err, SetupError::MissingCredential("RDRIVE_PASSWORD")));
    }

    #[test]
    fn test_sftp_agent_needs_no_secret() {
        let backend = build_backend(&sftp_config(None, true), &Secrets::default()).unwrap();
        assert_eq!(backend.connector.identity().to_string(), "sftp://alice@files.example.org:22");
        assert!(backend.path_ids.is_none());
    }

    #[test]
    fn test_anonymous_ftp() {
        let config = MountConfig::new(BackendTarget::parse("ftp://ftp.example.org").unwrap());
        let backend = build_backend(&config, &Secrets::default()).unwrap();
        assert_eq!(backend.connector.identity().host, "ftp.example.org");
    }

    #[test]
    fn test_drive_requires_refresh_token() {
        let config = MountConfig::new(BackendTarget::parse("gdrive://").unwrap());
        let secrets = Secrets {
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            ..Secrets::default()
        };
        let err = build_backend(&config, &secrets).err().unwrap();
        assert!(matches!(err, SetupError::MissingCredential("RDRIVE_REFRESH_TOKEN")));
    }

    #[test]
    fn test_secrets_debug_hides_values() {
        let secrets = Secrets {
            password: Some("hunter2".into()),
            ..Secrets::default()
        };
        let shown = format!("{secrets:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<set>"));
    }
}
