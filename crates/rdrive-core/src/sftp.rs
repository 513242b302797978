//! SFTP backend over `russh` and `russh-sftp`.
//!
//! The SSH stack is async; the rest of the crate is not. Each connector owns a
//! small private tokio runtime and every session call is a `block_on` bounded
//! by the operation timeout. Callers are FUSE worker threads, never runtime
//! threads, so blocking here is safe.
//!
//! Host keys are checked against a [`KnownHosts`] store (trust on first use).

use crate::auth::Credentials;
use crate::backend::{BackendId, BackendKind, Connector, RemoteSession, UploadSource};
use crate::entry::{EntryAttributes, RemoteEntry};
use crate::error::{RemoteError, RemoteResult};
use crate::known_hosts::KnownHosts;
use crate::path::RemotePath;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use std::future::Future;
use std::io::{self, Read, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Default SSH port.
pub const DEFAULT_SFTP_PORT: u16 = 22;

/// Chunk size for streaming transfers.
const TRANSFER_CHUNK: usize = 64 * 1024;

/// Unix permission bits marking a file read-only for its owner.
const OWNER_WRITE: u32 = 0o200;

/// Connection settings for an SSH server.
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub timeout: Duration,
}

impl SftpSettings {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SFTP_PORT,
            credentials,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opens authenticated SFTP sessions.
pub struct SftpConnector {
    settings: SftpSettings,
    known_hosts: Arc<KnownHosts>,
    runtime: Arc<Runtime>,
}

impl SftpConnector {
    pub fn new(settings: SftpSettings, known_hosts: Arc<KnownHosts>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rdrive-sftp")
            .enable_all()
            .build()?;
        Ok(Self {
            settings,
            known_hosts,
            runtime: Arc::new(runtime),
        })
    }

    pub fn known_hosts(&self) -> &Arc<KnownHosts> {
        &self.known_hosts
    }

    async fn establish(&self) -> RemoteResult<(Handle<HostKeyCheck>, SftpSession)> {
        let host_id = KnownHosts::host_key(&self.settings.host, self.settings.port);
        let rejection = Arc::new(Mutex::new(None));
        let handler = HostKeyCheck {
            host: host_id.clone(),
            known_hosts: Arc::clone(&self.known_hosts),
            rejection: Arc::clone(&rejection),
        };
        let config = Config {
            inactivity_timeout: None,
            ..<_>::default()
        };

        let addr = (self.settings.host.as_str(), self.settings.port);
        let mut session = match client::connect(Arc::new(config), addr, handler).await {
            Ok(session) => session,
            Err(e) => {
                // A rejected host key surfaces as a generic russh error
                if let Some(err) = rejection.lock().take() {
                    return Err(err);
                }
                return Err(map_ssh_error(&e));
            }
        };

        self.authenticate(&mut session).await?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| map_ssh_error(&e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| map_ssh_error(&e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_sftp_error(&e, "/"))?;
        sftp.set_timeout(self.settings.timeout.as_secs().max(1));

        info!(host = %host_id, user = self.settings.credentials.username(), "SFTP session established");
        Ok((session, sftp))
    }

    async fn authenticate(&self, session: &mut Handle<HostKeyCheck>) -> RemoteResult<()> {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let accepted = match &self.settings.credentials {
            Credentials::Password { username, password } => session
                .authenticate_password(username, password)
                .await
                .map_err(|e| map_ssh_error(&e))?
                .success(),
            Credentials::PrivateKey {
                username,
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref()).map_err(|e| {
                    RemoteError::auth(format!("cannot load key {}: {e}", key_path.display()))
                })?;
                session
                    .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                    .await
                    .map_err(|e| map_ssh_error(&e))?
                    .success()
            }
            Credentials::Agent { username } => {
                let mut agent = AgentClient::connect_env()
                    .await
                    .map_err(|e| RemoteError::auth(format!("SSH agent unavailable: {e}")))?;
                let keys = agent
                    .request_identities()
                    .await
                    .map_err(|e| RemoteError::auth(format!("SSH agent: {e}")))?;
                let mut accepted = false;
                for key in keys {
                    debug!(fingerprint = %key.fingerprint(HashAlg::Sha256), "Trying agent key");
                    match session
                        .authenticate_publickey_with(username, key, hash_alg, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => {
                            accepted = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Agent key authentication error"),
                    }
                }
                accepted
            }
            Credentials::OAuth(_) => {
                return Err(RemoteError::auth("SFTP does not accept OAuth credentials"));
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(RemoteError::auth(format!(
                "server rejected credentials for {}",
                self.settings.credentials.username()
            )))
        }
    }
}

impl Connector for SftpConnector {
    fn identity(&self) -> BackendId {
        BackendId::new(
            BackendKind::Sftp,
            self.settings.host.clone(),
            self.settings.port,
            self.settings.credentials.username(),
        )
    }

    fn connect(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let timeout = self.settings.timeout;
        let (handle, sftp) = block_on_timeout(&self.runtime, timeout, "sftp connect", self.establish())?;
        Ok(Box::new(SftpRemoteSession {
            runtime: Arc::clone(&self.runtime),
            timeout,
            handle,
            sftp,
        }))
    }
}

/// russh client handler enforcing trust on first use.
struct HostKeyCheck {
    host: String,
    known_hosts: Arc<KnownHosts>,
    rejection: Arc<Mutex<Option<RemoteError>>>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match self.known_hosts.verify(&self.host, &fingerprint) {
            Ok(_) => Ok(true),
            Err(e) => {
                *self.rejection.lock() = Some(e);
                Ok(false)
            }
        }
    }
}

/// One SSH connection with an open SFTP subsystem channel.
pub struct SftpRemoteSession {
    runtime: Arc<Runtime>,
    timeout: Duration,
    handle: Handle<HostKeyCheck>,
    sftp: SftpSession,
}

fn block_on_timeout<T>(
    runtime: &Runtime,
    timeout: Duration,
    operation: &str,
    fut: impl Future<Output = RemoteResult<T>>,
) -> RemoteResult<T> {
    runtime.block_on(async {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| RemoteError::timeout(operation))?
    })
}

fn map_ssh_error(err: &russh::Error) -> RemoteError {
    match err {
        russh::Error::ConnectionTimeout | russh::Error::InactivityTimeout => RemoteError::timeout("ssh"),
        russh::Error::NotAuthenticated => RemoteError::auth(err.to_string()),
        _ => RemoteError::disconnected(err.to_string()),
    }
}

fn map_sftp_error(err: &SftpError, path: &str) -> RemoteError {
    match err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => RemoteError::not_found(path),
            StatusCode::PermissionDenied => RemoteError::access_denied(path),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                RemoteError::disconnected(status.error_message.clone())
            }
            StatusCode::OpUnsupported => RemoteError::access_denied(path),
            _ => RemoteError::disconnected(format!("{path}: {}", status.error_message)),
        },
        SftpError::Timeout => RemoteError::timeout(format!("sftp {path}")),
        other => RemoteError::disconnected(other.to_string()),
    }
}

fn is_failure_status(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::Failure)
}

fn unix_time(secs: Option<u32>) -> SystemTime {
    secs.map_or(UNIX_EPOCH, |s| UNIX_EPOCH + Duration::from_secs(u64::from(s)))
}

fn to_entry(name: impl Into<String>, attrs: &FileAttributes) -> RemoteEntry {
    let modified = unix_time(attrs.mtime);
    let mut entry = if attrs.is_dir() {
        RemoteEntry::directory(name, modified)
    } else {
        RemoteEntry::file(name, attrs.size.unwrap_or(0), modified)
    };
    if let Some(atime) = attrs.atime {
        // SFTPv3 has no creation time; the access time is the closest proxy
        entry = entry.with_created(unix_time(Some(atime)));
    }
    if attrs.permissions.is_some_and(|mode| mode & OWNER_WRITE == 0) {
        let attributes = entry.attributes.with(EntryAttributes::READONLY);
        entry = entry.with_attributes(attributes);
    }
    entry
}

impl SftpRemoteSession {
    fn call<T>(&self, operation: &str, fut: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        block_on_timeout(&self.runtime, self.timeout, operation, fut)
    }

    async fn is_present(&self, path: &str) -> bool {
        self.sftp.try_exists(path).await.unwrap_or(false)
    }
}

impl RemoteSession for SftpRemoteSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Sftp
    }

    fn list(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        self.call("list", async {
            let dir = self
                .sftp
                .read_dir(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))?;
            Ok(dir
                .filter(|entry| {
                    let name = entry.file_name();
                    name != "." && name != ".."
                })
                .map(|entry| to_entry(entry.file_name(), &entry.metadata()))
                .collect())
        })
    }

    fn stat(&mut self, path: &RemotePath) -> RemoteResult<RemoteEntry> {
        let Some(name) = path.file_name() else {
            return Ok(RemoteEntry::root());
        };
        self.call("stat", async {
            let attrs = self
                .sftp
                .metadata(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))?;
            Ok(to_entry(name, &attrs))
        })
    }

    fn supports_range_read(&self) -> bool {
        true
    }

    fn read_range(&mut self, path: &RemotePath, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        self.call("read_range", async {
            let mut file = self
                .sftp
                .open(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            let _ = file.shutdown().await;
            Ok(buf)
        })
    }

    fn read_full(&mut self, path: &RemotePath, sink: &mut dyn Write) -> RemoteResult<u64> {
        self.call("read_full", async {
            let mut file = self
                .sftp
                .open(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))?;
            let mut chunk = vec![0u8; TRANSFER_CHUNK];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&chunk[..n])?;
                total += n as u64;
            }
            let _ = file.shutdown().await;
            Ok(total)
        })
    }

    fn write_full(
        &mut self,
        path: &RemotePath,
        source: &mut dyn UploadSource,
        len: u64,
    ) -> RemoteResult<()> {
        self.call("write_full", async {
            let mut file = self
                .sftp
                .open_with_flags(
                    path.as_str(),
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))?;
            let mut remaining = len;
            let mut chunk = vec![0u8; TRANSFER_CHUNK];
            while remaining > 0 {
                let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(TRANSFER_CHUNK);
                let n = source.read(&mut chunk[..want])?;
                if n == 0 {
                    return Err(RemoteError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upload source ended early",
                    )));
                }
                file.write_all(&chunk[..n]).await?;
                remaining -= n as u64;
            }
            file.shutdown().await?;
            Ok(())
        })
    }

    fn create_empty(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.call("create_empty", async {
            let mut file = self
                .sftp
                .open_with_flags(
                    path.as_str(),
                    OpenFlags::CREATE | OpenFlags::EXCLUDE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| {
                    if is_failure_status(&e) {
                        RemoteError::already_exists(path.as_str())
                    } else {
                        map_sftp_error(&e, path.as_str())
                    }
                })?;
            file.shutdown().await?;
            Ok(())
        })
    }

    fn delete(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.call("delete", async {
            self.sftp
                .remove_file(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))
        })
    }

    fn mkdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.call("mkdir", async {
            match self.sftp.create_dir(path.as_str()).await {
                Ok(()) => Ok(()),
                Err(e) if is_failure_status(&e) && self.is_present(path.as_str()).await => {
                    Err(RemoteError::already_exists(path.as_str()))
                }
                Err(e) => Err(map_sftp_error(&e, path.as_str())),
            }
        })
    }

    fn rmdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.call("rmdir", async {
            match self.sftp.remove_dir(path.as_str()).await {
                Ok(()) => Ok(()),
                // SFTPv3 reports a non-empty directory as a generic failure
                Err(e) if is_failure_status(&e) && self.is_present(path.as_str()).await => {
                    Err(RemoteError::not_empty(path.as_str()))
                }
                Err(e) => Err(map_sftp_error(&e, path.as_str())),
            }
        })
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        self.call("rename", async {
            match self.sftp.rename(from.as_str(), to.as_str()).await {
                Ok(()) => Ok(()),
                Err(e) if is_failure_status(&e) && self.is_present(to.as_str()).await => {
                    Err(RemoteError::already_exists(to.as_str()))
                }
                Err(e) => Err(map_sftp_error(&e, from.as_str())),
            }
        })
    }

    fn exists(&mut self, path: &RemotePath) -> RemoteResult<bool> {
        self.call("exists", async {
            self.sftp
                .try_exists(path.as_str())
                .await
                .map_err(|e| map_sftp_error(&e, path.as_str()))
        })
    }

    fn probe(&mut self) -> RemoteResult<()> {
        self.call("probe", async {
            self.sftp
                .canonicalize(".")
                .await
                .map(|_| ())
                .map_err(|e| map_sftp_error(&e, "."))
        })
    }

    fn close(&mut self) {
        let timeout = self.timeout;
        let _ = block_on_timeout(&self.runtime, timeout, "close", async {
            let _ = self.sftp.close().await;
            self.handle
                .disconnect(Disconnect::ByApplication, "rdrive closing session", "en")
                .await
                .map_err(|e| map_ssh_error(&e))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use russh_sftp::protocol::Status;

    fn status(code: StatusCode) -> SftpError {
        SftpError::Status(Status {
            id: 1,
            status_code: code,
            error_message: "boom".to_string(),
            language_tag: "en".to_string(),
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_sftp_error(&status(StatusCode::NoSuchFile), "/a").kind(), ErrorKind::NotFound);
        assert_eq!(
            map_sftp_error(&status(StatusCode::PermissionDenied), "/a").kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            map_sftp_error(&status(StatusCode::ConnectionLost), "/a").kind(),
            ErrorKind::Transient
        );
        assert_eq!(map_sftp_error(&SftpError::Timeout, "/a").kind(), ErrorKind::Timeout);
        assert!(is_failure_status(&status(StatusCode::Failure)));
        assert!(!is_failure_status(&status(StatusCode::NoSuchFile)));
    }

    #[test]
    fn test_attributes_to_entry() {
        let mut attrs = FileAttributes::default();
        attrs.size = Some(42);
        attrs.mtime = Some(1_700_000_000);
        attrs.permissions = Some(0o100_444);
        let entry = to_entry("notes.txt", &attrs);
        assert_eq!(entry.size, 42);
        assert!(!entry.is_directory);
        assert!(entry.attributes.contains(EntryAttributes::READONLY));
        assert_eq!(entry.modified, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    }

    #[test]
    fn test_identity() {
        let connector = SftpConnector::new(
            SftpSettings::new(
                "files.example.org",
                Credentials::Agent {
                    username: "alice".into(),
                },
            ),
            Arc::new(KnownHosts::in_memory()),
        )
        .unwrap();
        assert_eq!(connector.identity().to_string(), "sftp://alice@files.example.org:22");
    }
}
