//! Mount configuration.
//!
//! A [`MountConfig`] is normally loaded from a JSON document and then
//! adjusted by command-line flags. Every section except the backend target
//! has defaults, so a minimal document is just:
//!
//! ```json
//! { "backend": { "type": "sftp", "host": "files.example.org", "username": "alice" } }
//! ```

use rdrive_core::ConnectionConfig;
use rdrive_core::ftp::DEFAULT_FTP_PORT;
use rdrive_core::gdrive::DEFAULT_PATH_ID_TTL;
use rdrive_core::sftp::DEFAULT_SFTP_PORT;
use rdrive_mount::{BufferConfig, CacheConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Kernel attribute/entry TTL.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Nominal capacity reported by statfs (1 TiB).
pub const DEFAULT_CAPACITY: u64 = 1 << 40;

/// Which backend to mount and how to reach it. Secrets are never part of the
/// document; they come from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendTarget {
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        /// Anonymous login when unset.
        #[serde(default)]
        username: Option<String>,
        #[serde(default = "default_true")]
        passive: bool,
    },
    Sftp {
        host: String,
        #[serde(default = "default_sftp_port")]
        port: u16,
        username: String,
        /// Private key file; password or agent auth is used when unset.
        #[serde(default)]
        key_path: Option<PathBuf>,
        /// Authenticate with identities from the running SSH agent.
        #[serde(default)]
        agent: bool,
        /// Trust-on-first-use fingerprint store.
        #[serde(default)]
        known_hosts: Option<PathBuf>,
    },
    #[serde(rename = "gdrive")]
    Drive {
        /// Shared drive or folder id mounted as `/`.
        #[serde(default)]
        root_id: Option<String>,
        /// Persisted path-to-id cache.
        #[serde(default)]
        path_id_file: Option<PathBuf>,
        #[serde(default)]
        token_url: Option<String>,
    },
}

fn default_ftp_port() -> u16 {
    DEFAULT_FTP_PORT
}

fn default_sftp_port() -> u16 {
    DEFAULT_SFTP_PORT
}

fn default_true() -> bool {
    true
}

impl BackendTarget {
    /// Parses `ftp://[user@]host[:port]`, `sftp://user@host[:port]` or
    /// `gdrive://[root-id]`.
    pub fn parse(url: &str) -> Result<Self, String> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| format!("'{url}' is not a backend URL (expected scheme://...)"))?;
        let rest = rest.trim_end_matches('/');

        if scheme == "gdrive" {
            return Ok(Self::Drive {
                root_id: (!rest.is_empty()).then(|| rest.to_string()),
                path_id_file: None,
                token_url: None,
            });
        }

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, rest),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| format!("invalid port in '{url}'"))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(format!("missing host in '{url}'"));
        }

        match scheme {
            "ftp" => Ok(Self::Ftp {
                host: host.to_string(),
                port: port.unwrap_or(DEFAULT_FTP_PORT),
                username: user,
                passive: true,
            }),
            "sftp" => Ok(Self::Sftp {
                host: host.to_string(),
                port: port.unwrap_or(DEFAULT_SFTP_PORT),
                username: user.ok_or_else(|| format!("sftp URL '{url}' needs a user"))?,
                key_path: None,
                agent: false,
                known_hosts: None,
            }),
            other => Err(format!("unsupported scheme '{other}' (use ftp, sftp or gdrive)")),
        }
    }

    /// Short label used for the mount's fsname.
    pub fn label(&self) -> String {
        match self {
            Self::Ftp { host, .. } => format!("ftp:{host}"),
            Self::Sftp { host, username, .. } => format!("sftp:{username}@{host}"),
            Self::Drive { root_id, .. } => format!("gdrive:{}", root_id.as_deref().unwrap_or("root")),
        }
    }
}

/// Everything needed to mount one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub backend: BackendTarget,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default = "default_path_id_ttl", with = "humantime_serde")]
    pub path_id_ttl: Duration,

    /// How long the kernel may cache attributes and lookups.
    #[serde(default = "default_attr_ttl", with = "humantime_serde")]
    pub attr_ttl: Duration,

    /// Volume label; derived from the backend when unset.
    #[serde(default)]
    pub volume_label: Option<String>,

    /// Capacity reported to statfs. Remote quotas are not queried.
    #[serde(default = "default_capacity")]
    pub capacity_bytes: u64,

    #[serde(default)]
    pub read_only: bool,
}

fn default_path_id_ttl() -> Duration {
    DEFAULT_PATH_ID_TTL
}

fn default_attr_ttl() -> Duration {
    DEFAULT_ATTR_TTL
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

impl MountConfig {
    pub fn new(backend: BackendTarget) -> Self {
        Self {
            backend,
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            buffer: BufferConfig::default(),
            path_id_ttl: DEFAULT_PATH_ID_TTL,
            attr_ttl: DEFAULT_ATTR_TTL,
            volume_label: None,
            capacity_bytes: DEFAULT_CAPACITY,
            read_only: false,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn label(&self) -> String {
        self.volume_label.clone().unwrap_or_else(|| self.backend.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sftp_url() {
        let target = BackendTarget::parse("sftp://alice@files.example.org:2222").unwrap();
        assert_eq!(
            target,
            BackendTarget::Sftp {
                host: "files.example.org".into(),
                port: 2222,
                username: "alice".into(),
                key_path: None,
                agent: false,
                known_hosts: None,
            }
        );
    }

    #[test]
    fn test_parse_ftp_url_defaults() {
        let target = BackendTarget::parse("ftp://ftp.example.org/").unwrap();
        assert_eq!(
            target,
            BackendTarget::Ftp {
                host: "ftp.example.org".into(),
                port: 21,
                username: None,
                passive: true,
            }
        );
    }

    #[test]
    fn test_parse_gdrive_url() {
        let target = BackendTarget::parse("gdrive://0AAbc").unwrap();
        assert_eq!(target.label(), "gdrive:0AAbc");
        assert_eq!(BackendTarget::parse("gdrive://").unwrap().label(), "gdrive:root");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(BackendTarget::parse("files.example.org").is_err());
        assert!(BackendTarget::parse("sftp://files.example.org").is_err());
        assert!(BackendTarget::parse("http://x").is_err());
        assert!(BackendTarget::parse("ftp://host:notaport").is_err());
    }

    #[test]
    fn test_minimal_json_document() {
        let config = MountConfig::from_json(
            r#"{"backend": {"type": "sftp", "host": "h", "username": "u"},
                "cache": {"dir_ttl": "10s"},
                "connection": {"pool_size": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.dir_ttl, Duration::from_secs(10));
        assert_eq!(config.cache.meta_ttl, Duration::from_secs(60));
        assert_eq!(config.connection.pool_size, 8);
        assert_eq!(config.path_id_ttl, Duration::from_secs(120));
        assert_eq!(config.buffer.spool_threshold, 8 * 1024 * 1024);
        assert_eq!(config.label(), "sftp:u@h");
    }

    #[test]
    fn test_gdrive_json_tag() {
        let config = MountConfig::from_json(r#"{"backend": {"type": "gdrive", "root_id": "abc"}}"#).unwrap();
        assert!(matches!(config.backend, BackendTarget::Drive { root_id: Some(ref id), .. } if id == "abc"));
    }
}
