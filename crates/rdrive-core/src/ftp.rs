//! FTP backend over `suppaftp`.
//!
//! FTP has no way to patch or partially read an object portably, so this
//! backend advertises no ranged reads: the bridge fetches the whole object
//! once per handle. Metadata comes from parsing `LIST` output; single-object
//! `stat` lists the parent directory and picks the entry out.

use crate::auth::Credentials;
use crate::backend::{BackendId, BackendKind, Connector, RemoteSession, UploadSource};
use crate::entry::RemoteEntry;
use crate::error::{RemoteError, RemoteResult};
use crate::path::RemotePath;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, trace};

/// Default FTP control port.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Connection settings for an FTP server.
#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    /// `None` logs in anonymously.
    pub credentials: Option<Credentials>,
    pub passive: bool,
    pub timeout: Duration,
}

impl FtpSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_FTP_PORT,
            credentials: None,
            passive: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opens authenticated FTP sessions.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    settings: FtpSettings,
}

impl FtpConnector {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }

    fn resolve(&self) -> RemoteResult<SocketAddr> {
        (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::disconnected(format!("resolve {}: {e}", self.settings.host)))?
            .next()
            .ok_or_else(|| RemoteError::disconnected(format!("no address for {}", self.settings.host)))
    }

    fn login_pair(&self) -> RemoteResult<(String, String)> {
        match &self.settings.credentials {
            None => Ok(("anonymous".to_string(), "anonymous@".to_string())),
            Some(Credentials::Password { username, password }) => Ok((username.clone(), password.clone())),
            Some(other) => Err(RemoteError::auth(format!(
                "FTP supports password logins only, got {other:?}"
            ))),
        }
    }
}

impl Connector for FtpConnector {
    fn identity(&self) -> BackendId {
        let user = self
            .settings
            .credentials
            .as_ref()
            .map_or("anonymous", Credentials::username);
        BackendId::new(BackendKind::Ftp, self.settings.host.clone(), self.settings.port, user)
    }

    fn connect(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let addr = self.resolve()?;
        let (user, password) = self.login_pair()?;

        let mut ftp = FtpStream::connect_timeout(addr, self.settings.timeout).map_err(|e| map_ftp_error(&e, "/"))?;
        let stream = ftp.get_ref();
        stream.set_read_timeout(Some(self.settings.timeout))?;
        stream.set_write_timeout(Some(self.settings.timeout))?;

        ftp.login(&user, &password).map_err(|e| match map_ftp_error(&e, "/") {
            err if err.is_retryable() => err,
            _ => RemoteError::auth(format!("FTP login rejected for {user}: {e}")),
        })?;
        ftp.set_mode(if self.settings.passive { Mode::Passive } else { Mode::Active });
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| map_ftp_error(&e, "/"))?;

        debug!(host = %self.settings.host, port = self.settings.port, user, "FTP session established");
        Ok(Box::new(FtpSession { ftp }))
    }
}

/// One FTP control connection.
pub struct FtpSession {
    ftp: FtpStream,
}

impl FtpSession {
    fn list_raw(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        let lines = self
            .ftp
            .list(Some(path.as_str()))
            .map_err(|e| map_ftp_error(&e, path.as_str()))?;
        Ok(lines.iter().filter_map(|line| parse_list_line(line)).collect())
    }
}

/// Parses one `LIST` line, skipping `.`/`..` and lines the parser rejects.
fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    let parsed = match ListEntry::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            trace!(line, error = ?e, "Skipping unparseable LIST line");
            return None;
        }
    };
    let name = parsed.name();
    if name == "." || name == ".." {
        return None;
    }
    let modified: SystemTime = parsed.modified();
    Some(if parsed.is_directory() {
        RemoteEntry::directory(name, modified)
    } else {
        RemoteEntry::file(name, parsed.size() as u64, modified)
    })
}

/// Maps an FTP failure onto the shared taxonomy.
///
/// 550 is overloaded by servers; the reply text disambiguates it.
/// Many servers answer `LIST` on a missing directory with an empty listing
/// instead of a 550, so an empty result is checked against the parent.
fn confirm_listing(
    path: &RemotePath,
    entries: Vec<RemoteEntry>,
    stat: impl FnOnce() -> RemoteResult<RemoteEntry>,
) -> RemoteResult<Vec<RemoteEntry>> {
    if !entries.is_empty() || path.is_root() {
        return Ok(entries);
    }
    match stat()? {
        entry if entry.is_directory => Ok(entries),
        _ => Err(RemoteError::not_found(path.as_str())),
    }
}

fn map_ftp_error(err: &FtpError, path: &str) -> RemoteError {
    match err {
        FtpError::ConnectionError(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
            RemoteError::timeout(format!("ftp {path}"))
        }
        FtpError::ConnectionError(e) => RemoteError::disconnected(e.to_string()),
        FtpError::UnexpectedResponse(response) => {
            let text = String::from_utf8_lossy(&response.body).to_lowercase();
            match response.status.code() {
                550 if text.contains("not empty") => RemoteError::not_empty(path),
                550 if text.contains("exists") => RemoteError::already_exists(path),
                550 if text.contains("permission") || text.contains("denied") => RemoteError::access_denied(path),
                550 | 450 => RemoteError::not_found(path),
                530 | 332 => RemoteError::auth(text),
                552 | 452 => RemoteError::quota(text),
                553 | 532 => RemoteError::access_denied(path),
                421 | 425 | 426 => RemoteError::disconnected(text),
                _ => RemoteError::disconnected(format!("unexpected FTP reply {}: {text}", response.status.code())),
            }
        }
        other => RemoteError::disconnected(other.to_string()),
    }
}

impl RemoteSession for FtpSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Ftp
    }

    fn list(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        let entries = self.list_raw(path)?;
        confirm_listing(path, entries, || self.stat(path))
    }

    fn stat(&mut self, path: &RemotePath) -> RemoteResult<RemoteEntry> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(RemoteEntry::root());
        };
        self.list_raw(&parent)?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| RemoteError::not_found(path.as_str()))
    }

    fn supports_range_read(&self) -> bool {
        false
    }

    fn read_range(&mut self, path: &RemotePath, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        // Fallback for callers that ignore supports_range_read().
        let mut all = Vec::new();
        self.read_full(path, &mut all)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(all.len());
        let end = start.saturating_add(len).min(all.len());
        Ok(all[start..end].to_vec())
    }

    fn read_full(&mut self, path: &RemotePath, sink: &mut dyn Write) -> RemoteResult<u64> {
        let mut stream = self
            .ftp
            .retr_as_stream(path.as_str())
            .map_err(|e| map_ftp_error(&e, path.as_str()))?;
        let copied = io::copy(&mut stream, sink);
        self.ftp
            .finalize_retr_stream(stream)
            .map_err(|e| map_ftp_error(&e, path.as_str()))?;
        Ok(copied?)
    }

    fn write_full(
        &mut self,
        path: &RemotePath,
        source: &mut dyn UploadSource,
        len: u64,
    ) -> RemoteResult<()> {
        let mut limited = Read::take(&mut *source, len);
        self.ftp
            .put_file(path.as_str(), &mut limited)
            .map_err(|e| map_ftp_error(&e, path.as_str()))?;
        Ok(())
    }

    fn create_empty(&mut self, path: &RemotePath) -> RemoteResult<()> {
        if self.exists(path)? {
            return Err(RemoteError::already_exists(path.as_str()));
        }
        self.ftp
            .put_file(path.as_str(), &mut io::empty())
            .map_err(|e| map_ftp_error(&e, path.as_str()))?;
        Ok(())
    }

    fn delete(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.ftp.rm(path.as_str()).map_err(|e| map_ftp_error(&e, path.as_str()))
    }

    fn mkdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        match self.ftp.mkdir(path.as_str()) {
            Ok(()) => Ok(()),
            Err(e) => match map_ftp_error(&e, path.as_str()) {
                // Many servers answer a bare 550 for an existing directory
                RemoteError::NotFound { .. } if self.exists(path)? => Err(RemoteError::already_exists(path.as_str())),
                other => Err(other),
            },
        }
    }

    fn rmdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        match self.ftp.rmdir(path.as_str()) {
            Ok(()) => Ok(()),
            Err(e) => match map_ftp_error(&e, path.as_str()) {
                // Plain 550 on an existing directory means it still has children
                RemoteError::NotFound { .. } if self.exists(path)? => Err(RemoteError::not_empty(path.as_str())),
                other => Err(other),
            },
        }
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        self.ftp
            .rename(from.as_str(), to.as_str())
            .map_err(|e| map_ftp_error(&e, from.as_str()))
    }

    fn probe(&mut self) -> RemoteResult<()> {
        self.ftp.noop().map_err(|e| map_ftp_error(&e, "/"))
    }

    fn close(&mut self) {
        let _ = self.ftp.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_list_lines() {
        let file = parse_list_line("-rw-r--r-- 1 user group 1234 Nov 5 13:46 report.txt").unwrap();
        assert_eq!(file.name, "report.txt");
        assert_eq!(file.size, 1234);
        assert!(!file.is_directory);

        let dir = parse_list_line("drwxr-xr-x 2 user group 4096 Nov 5 13:46 photos").unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_parse_skips_dot_entries_and_garbage() {
        assert!(parse_list_line("drwxr-xr-x 2 user group 4096 Nov 5 13:46 .").is_none());
        assert!(parse_list_line("total 12").is_none());
    }

    #[test]
    fn test_empty_listing_of_missing_directory_is_not_found() {
        let path = RemotePath::new("/gone");
        let result = confirm_listing(&path, Vec::new(), || Err(RemoteError::not_found("/gone")));
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::NotFound);

        let file = || Ok(RemoteEntry::file("gone", 3, SystemTime::now()));
        assert_eq!(confirm_listing(&path, Vec::new(), file).unwrap_err().kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_empty_listing_of_existing_directory_is_kept() {
        let path = RemotePath::new("/empty");
        let dir = || Ok(RemoteEntry::directory("empty", SystemTime::now()));
        assert!(confirm_listing(&path, Vec::new(), dir).unwrap().is_empty());

        let unused = || -> RemoteResult<RemoteEntry> { panic!("root and non-empty listings need no stat") };
        assert!(confirm_listing(&RemotePath::root(), Vec::new(), unused).unwrap().is_empty());
        let listed = vec![RemoteEntry::file("a", 1, SystemTime::now())];
        assert_eq!(confirm_listing(&path, listed, unused).unwrap().len(), 1);
    }

    #[test]
    fn test_identity_defaults_to_anonymous() {
        let connector = FtpConnector::new(FtpSettings::new("ftp.example.org"));
        let id = connector.identity();
        assert_eq!(id.to_string(), "ftp://anonymous@ftp.example.org:21");
    }
}
