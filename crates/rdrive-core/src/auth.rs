//! Credential material and OAuth token refresh.
//!
//! Password and key credentials are static for the lifetime of a mount. OAuth
//! credentials are not: the access token expires and must be re-derived from
//! the refresh token. [`TokenManager`] owns that state for one backend and is
//! shared by every session of the pool, so a refreshed token is visible to all
//! of them and concurrent refreshes collapse into a single request.

use crate::error::{RemoteError, RemoteResult};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Tokens are treated as expired this long before their stated expiry.
pub const REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);

/// Authentication bootstrap for one backend.
#[derive(Clone)]
pub enum Credentials {
    /// Username/password (FTP, SFTP).
    Password { username: String, password: String },
    /// Private key file with optional passphrase (SFTP).
    PrivateKey {
        username: String,
        key_path: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys offered by the running SSH agent (SFTP).
    Agent { username: String },
    /// OAuth access/refresh token pair (cloud drive).
    OAuth(OAuthTokens),
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. }
            | Self::PrivateKey { username, .. }
            | Self::Agent { username } => username,
            Self::OAuth(_) => "oauth",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::PrivateKey {
                username, key_path, ..
            } => f
                .debug_struct("PrivateKey")
                .field("username", username)
                .field("key_path", key_path)
                .finish_non_exhaustive(),
            Self::Agent { username } => f.debug_struct("Agent").field("username", username).finish(),
            Self::OAuth(_) => f.write_str("OAuth(..)"),
        }
    }
}

/// OAuth client registration plus the current token pair.
#[derive(Clone)]
pub struct OAuthTokens {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    /// `None` means unknown; the first call refreshes.
    pub expires_at: Option<SystemTime>,
}

/// Response body of a refresh-token grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Present only when the server rotates refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a new access token.
pub trait TokenEndpoint: Send + Sync {
    fn refresh(&self, client_id: &str, client_secret: &str, refresh_token: &str) -> RemoteResult<TokenGrant>;
}

struct TokenState {
    access_token: String,
    refresh_token: String,
    expires_at: Option<SystemTime>,
    /// Bumped on every successful refresh.
    generation: u64,
}

impl TokenState {
    fn needs_refresh(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => SystemTime::now() + skew >= expires_at,
            None => true,
        }
    }
}

/// Snapshot of the access token handed to a request.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Pass back to [`TokenManager::invalidate`] if the server rejects it.
    pub generation: u64,
}

/// Single-flight OAuth token refresher shared by all sessions of a backend.
pub struct TokenManager {
    client_id: String,
    client_secret: String,
    state: RwLock<TokenState>,
    /// Held for the duration of a refresh; late arrivals wait here and then
    /// find the generation already bumped.
    refresh_flight: Mutex<()>,
    endpoint: Box<dyn TokenEndpoint>,
    skew: Duration,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("generation", &self.state.read().generation)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(tokens: OAuthTokens, endpoint: Box<dyn TokenEndpoint>) -> Self {
        Self {
            client_id: tokens.client_id,
            client_secret: tokens.client_secret,
            state: RwLock::new(TokenState {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at: tokens.expires_at,
                generation: 0,
            }),
            refresh_flight: Mutex::new(()),
            endpoint,
            skew: REFRESH_SKEW,
        }
    }

    #[must_use]
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Returns a usable access token, refreshing first if it is near expiry.
    pub fn access_token(&self) -> RemoteResult<AccessToken> {
        let seen = {
            let state = self.state.read();
            if !state.needs_refresh(self.skew) {
                return Ok(AccessToken {
                    token: state.access_token.clone(),
                    generation: state.generation,
                });
            }
            state.generation
        };
        self.refresh_after(seen)
    }

    /// Forces a refresh after the server rejected the token of `generation`.
    ///
    /// If another caller already refreshed past that generation, its token is
    /// returned without a second request.
    pub fn invalidate(&self, generation: u64) -> RemoteResult<AccessToken> {
        self.refresh_after(generation)
    }

    fn refresh_after(&self, seen_generation: u64) -> RemoteResult<AccessToken> {
        let _flight = self.refresh_flight.lock();

        let refresh_token = {
            let state = self.state.read();
            if state.generation != seen_generation {
                debug!(generation = state.generation, "Token already refreshed by another caller");
                return Ok(AccessToken {
                    token: state.access_token.clone(),
                    generation: state.generation,
                });
            }
            state.refresh_token.clone()
        };

        let grant = self
            .endpoint
            .refresh(&self.client_id, &self.client_secret, &refresh_token)?;

        let mut state = self.state.write();
        state.access_token = grant.access_token;
        if let Some(rotated) = grant.refresh_token {
            state.refresh_token = rotated;
        }
        state.expires_at = Some(SystemTime::now() + Duration::from_secs(grant.expires_in));
        state.generation += 1;
        info!(generation = state.generation, expires_in = grant.expires_in, "Refreshed OAuth access token");
        Ok(AccessToken {
            token: state.access_token.clone(),
            generation: state.generation,
        })
    }

    /// Current refresh token, for persisting rotated tokens externally.
    pub fn refresh_token(&self) -> String {
        self.state.read().refresh_token.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }
}

/// Google's OAuth token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresh-token grant over HTTPS.
pub struct HttpTokenEndpoint {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpTokenEndpoint {
    pub fn new(timeout: Duration) -> RemoteResult<Self> {
        Self::with_url(GOOGLE_TOKEN_URL, timeout)
    }

    pub fn with_url(url: impl Into<String>, timeout: Duration) -> RemoteResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::disconnected(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn refresh(&self, client_id: &str, client_secret: &str, refresh_token: &str) -> RemoteResult<TokenGrant> {
        let response = self
            .client
            .post(&self.url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::timeout("token refresh")
                } else {
                    RemoteError::disconnected(format!("token refresh: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenGrant>()
                .map_err(|e| RemoteError::disconnected(format!("token response: {e}")));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(RemoteError::disconnected(format!("token endpoint returned {status}")));
        }
        let reason = match response.json::<OAuthErrorBody>() {
            Ok(body) => match body.error_description {
                Some(description) => format!("{}: {description}", body.error),
                None => body.error,
            },
            Err(_) => format!("token endpoint returned {status}"),
        };
        Err(RemoteError::auth(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct CountingEndpoint {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    impl TokenEndpoint for CountingEndpoint {
        fn refresh(&self, _: &str, _: &str, refresh_token: &str) -> RemoteResult<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.delay);
            if self.fail {
                return Err(RemoteError::auth("invalid_grant"));
            }
            assert_eq!(refresh_token, "refresh-0");
            Ok(TokenGrant {
                access_token: format!("access-{n}"),
                expires_in: 3600,
                refresh_token: None,
            })
        }
    }

    fn tokens(expires_at: Option<SystemTime>) -> OAuthTokens {
        OAuthTokens {
            client_id: "id".into(),
            client_secret: "secret".into(),
            access_token: "access-0".into(),
            refresh_token: "refresh-0".into(),
            expires_at,
        }
    }

    fn manager(expires_at: Option<SystemTime>, delay: Duration, fail: bool) -> (TokenManager, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = CountingEndpoint {
            calls: Arc::clone(&calls),
            delay,
            fail,
        };
        (TokenManager::new(tokens(expires_at), Box::new(endpoint)), calls)
    }

    #[test]
    fn test_fresh_token_is_used_without_refresh() {
        let later = SystemTime::now() + Duration::from_secs(3600);
        let (mgr, calls) = manager(Some(later), Duration::ZERO, false);

        assert_eq!(mgr.access_token().unwrap().token, "access-0");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_near_expiry_token_is_refreshed() {
        let soon = SystemTime::now() + Duration::from_secs(60);
        let (mgr, calls) = manager(Some(soon), Duration::ZERO, false);

        let token = mgr.access_token().unwrap();
        assert_eq!(token.token, "access-1");
        assert_eq!(token.generation, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Now fresh for an hour
        assert_eq!(mgr.access_token().unwrap().token, "access-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_refreshes_collapse_into_one() {
        let (mgr, calls) = manager(None, Duration::from_millis(50), false);
        let mgr = Arc::new(mgr);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mgr.access_token().unwrap().token
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "access-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_stale_generation_does_not_refresh_twice() {
        let later = SystemTime::now() + Duration::from_secs(3600);
        let (mgr, calls) = manager(Some(later), Duration::ZERO, false);

        let first = mgr.invalidate(0).unwrap();
        assert_eq!(first.generation, 1);
        // A second caller that also saw generation 0 gets the new token
        let second = mgr.invalidate(0).unwrap();
        assert_eq!(second.token, first.token);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejected_refresh_is_fatal() {
        let (mgr, _) = manager(None, Duration::ZERO, true);
        assert!(mgr.access_token().unwrap_err().is_fatal());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials::Password {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }
}
