//! Cloud drive backend over the Drive v3 REST API.
//!
//! Drive addresses objects by opaque id, so every path is resolved by walking
//! from the root (or a configured shared-drive root) one component at a time.
//! Resolved ids live in a [`PathIdCache`] shared by all sessions and
//! persisted across restarts. A cached id that the server no longer knows is
//! dropped and the path resolved again once.
//!
//! Authorization goes through the shared [`TokenManager`]: a 401 forces one
//! refresh and a replay; a second 401 is Fatal.

mod path_ids;

pub use path_ids::{DEFAULT_PATH_ID_TTL, PathIdCache};

use crate::auth::TokenManager;
use crate::backend::{BackendId, BackendKind, Connector, RemoteSession, UploadSource};
use crate::entry::{EntryAttributes, RemoteEntry};
use crate::error::{RemoteError, RemoteResult};
use crate::path::RemotePath;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

pub const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime,capabilities/canEdit";
const PAGE_SIZE: &str = "1000";

/// Uploads larger than this are spooled to a temp file rather than memory.
const UPLOAD_SPOOL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Settings for one Drive account.
#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub api_base: String,
    pub upload_base: String,
    /// Shared drive (or folder) id used as `/`; `None` means "My Drive".
    pub root_id: Option<String>,
    pub timeout: Duration,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            api_base: DRIVE_API.to_string(),
            upload_base: DRIVE_UPLOAD_API.to_string(),
            root_id: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opens Drive sessions sharing one token manager and id cache.
pub struct DriveConnector {
    settings: DriveSettings,
    tokens: Arc<TokenManager>,
    ids: Arc<PathIdCache>,
    http: Client,
}

impl DriveConnector {
    pub fn new(settings: DriveSettings, tokens: Arc<TokenManager>, ids: Arc<PathIdCache>) -> RemoteResult<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .user_agent(concat!("rdrive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::disconnected(format!("HTTP client: {e}")))?;
        Ok(Self {
            settings,
            tokens,
            ids,
            http,
        })
    }

    pub fn path_ids(&self) -> &Arc<PathIdCache> {
        &self.ids
    }
}

impl Connector for DriveConnector {
    fn identity(&self) -> BackendId {
        let root = self.settings.root_id.as_deref().unwrap_or("root");
        BackendId::new(BackendKind::Drive, "www.googleapis.com", 443, format!("oauth/{root}"))
    }

    fn connect(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let mut session = DriveSession {
            settings: self.settings.clone(),
            tokens: Arc::clone(&self.tokens),
            ids: Arc::clone(&self.ids),
            http: self.http.clone(),
        };
        // Validates the token before the session is pooled
        session.probe()?;
        debug!("Drive session established");
        Ok(Box::new(session))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    capabilities: Option<Capabilities>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Capabilities {
    #[serde(default = "yes")]
    can_edit: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    fn to_entry(&self) -> RemoteEntry {
        let modified = self.modified_time.map_or(SystemTime::UNIX_EPOCH, SystemTime::from);
        let mut entry = if self.is_folder() {
            RemoteEntry::directory(&self.name, modified)
        } else {
            let size = self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
            RemoteEntry::file(&self.name, size, modified)
        };
        if let Some(created) = self.created_time {
            entry = entry.with_created(created.into());
        }
        if self.capabilities.as_ref().is_some_and(|c| !c.can_edit) {
            let attributes = entry.attributes.with(EntryAttributes::READONLY);
            entry = entry.with_attributes(attributes);
        }
        entry
    }
}

/// Escapes a literal for a Drive `q` expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Maps a non-success HTTP status (and its JSON error body) to the taxonomy.
fn map_status(status: StatusCode, body: &str, path: &str) -> RemoteError {
    let reasons: Vec<String> = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/errors").and_then(|errs| errs.as_array()).map(|errs| {
                errs.iter()
                    .filter_map(|e| e.get("reason").and_then(|r| r.as_str()).map(str::to_string))
                    .collect()
            })
        })
        .unwrap_or_default();
    let has = |reason: &str| reasons.iter().any(|r| r == reason);

    match status.as_u16() {
        404 => RemoteError::not_found(path),
        401 => RemoteError::auth(format!("access token rejected for {path}")),
        403 if has("storageQuotaExceeded") || has("quotaExceeded") => RemoteError::quota(body.to_string()),
        403 if has("rateLimitExceeded") || has("userRateLimitExceeded") => {
            RemoteError::disconnected(format!("rate limited on {path}"))
        }
        403 => RemoteError::access_denied(path),
        408 => RemoteError::timeout(format!("drive {path}")),
        409 => RemoteError::already_exists(path),
        429 => RemoteError::disconnected(format!("rate limited on {path}")),
        code if (500..600).contains(&code) => RemoteError::disconnected(format!("server error {code} on {path}")),
        code => RemoteError::disconnected(format!("unexpected status {code} on {path}")),
    }
}

fn map_transport(err: &reqwest::Error, path: &str) -> RemoteError {
    if err.is_timeout() {
        RemoteError::timeout(format!("drive {path}"))
    } else {
        RemoteError::disconnected(format!("{path}: {err}"))
    }
}

/// Upload payload that can be replayed after a token refresh.
enum UploadBody {
    Memory(Vec<u8>),
    Spooled(File, u64),
}

impl UploadBody {
    fn capture(source: &mut dyn UploadSource, len: u64) -> io::Result<Self> {
        let mut limited = source.take(len);
        if len <= UPLOAD_SPOOL_THRESHOLD {
            let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
            limited.read_to_end(&mut buf)?;
            return Ok(Self::Memory(buf));
        }
        let mut file = tempfile::tempfile()?;
        let copied = io::copy(&mut limited, &mut file)?;
        Ok(Self::Spooled(file, copied))
    }

    fn body(&mut self) -> io::Result<Body> {
        match self {
            Self::Memory(buf) => Ok(Body::from(buf.clone())),
            Self::Spooled(file, len) => {
                file.seek(SeekFrom::Start(0))?;
                Ok(Body::sized(file.try_clone()?, *len))
            }
        }
    }
}

/// One logical Drive "connection". HTTP connections themselves are pooled by
/// `reqwest`; the session holds the shared token and id state.
pub struct DriveSession {
    settings: DriveSettings,
    tokens: Arc<TokenManager>,
    ids: Arc<PathIdCache>,
    http: Client,
}

impl DriveSession {
    fn api(&self, tail: &str) -> String {
        format!("{}/{tail}", self.settings.api_base)
    }

    fn root_id(&self) -> &str {
        self.settings.root_id.as_deref().unwrap_or("root")
    }

    /// Sends an authorized request, refreshing the token once on 401.
    fn send(
        &self,
        path: &str,
        mut build: impl FnMut(&Client) -> RemoteResult<RequestBuilder>,
    ) -> RemoteResult<Response> {
        let mut token = self.tokens.access_token()?;
        let mut refreshed = false;
        loop {
            let response = build(&self.http)?
                .bearer_auth(&token.token)
                .send()
                .map_err(|e| map_transport(&e, path))?;
            let status = response.status();
            if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!(path, generation = token.generation, "Access token rejected, refreshing");
                token = self.tokens.invalidate(token.generation)?;
                refreshed = true;
                continue;
            }
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(response);
            }
            let body = response.text().unwrap_or_default();
            trace!(path, %status, body, "Drive request failed");
            return Err(map_status(status, &body, path));
        }
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        build: impl FnMut(&Client) -> RemoteResult<RequestBuilder>,
    ) -> RemoteResult<T> {
        self.send(path, build)?
            .json()
            .map_err(|e| RemoteError::disconnected(format!("{path}: malformed response: {e}")))
    }

    fn file_by_id(&self, id: &str, path: &str) -> RemoteResult<DriveFile> {
        let url = self.api(&format!("files/{id}"));
        self.get_json(path, |http| {
            Ok(http
                .get(&url)
                .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")]))
        })
    }

    fn child_by_name(&self, parent_id: &str, name: &str, path: &str) -> RemoteResult<Option<DriveFile>> {
        let q = format!("{} in parents and name = {} and trashed = false", quote(parent_id), quote(name));
        let fields = format!("files({FILE_FIELDS})");
        let url = self.api("files");
        let list: FileList = self.get_json(path, |http| {
            Ok(http.get(&url).query(&[
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "10"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]))
        })?;
        Ok(list.files.into_iter().next())
    }

    fn children(&self, parent_id: &str, path: &str) -> RemoteResult<Vec<DriveFile>> {
        let q = format!("{} in parents and trashed = false", quote(parent_id));
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let url = self.api("files");
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let list: FileList = self.get_json(path, |http| {
                let mut request = http.get(&url).query(&[
                    ("q", q.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", PAGE_SIZE),
                    ("orderBy", "name"),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ]);
                if let Some(token) = &page_token {
                    request = request.query(&[("pageToken", token.as_str())]);
                }
                Ok(request)
            })?;
            all.extend(list.files);
            match list.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(all),
            }
        }
    }

    /// Resolves `path` to an id, walking from the nearest cached ancestor.
    fn resolve(&self, path: &RemotePath) -> RemoteResult<String> {
        if path.is_root() {
            return Ok(self.root_id().to_string());
        }
        if let Some(id) = self.ids.get(path) {
            return Ok(id);
        }
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(self.root_id().to_string());
        };
        let parent_id = self.resolve(&parent)?;
        let child = self
            .child_by_name(&parent_id, name, path.as_str())?
            .ok_or_else(|| RemoteError::not_found(path.as_str()))?;
        self.ids.insert(path, &child.id);
        Ok(child.id)
    }

    /// Runs `op` with the id of `path`, re-resolving once if a cached id
    /// turned out to be stale.
    fn with_id<T>(&self, path: &RemotePath, mut op: impl FnMut(&str) -> RemoteResult<T>) -> RemoteResult<T> {
        let was_cached = self.ids.get(path).is_some();
        let id = self.resolve(path)?;
        match op(&id) {
            Err(e) if was_cached && matches!(e, RemoteError::NotFound { .. }) => {
                debug!(path = %path, "Cached id is stale, re-resolving");
                self.ids.invalidate_subtree(path);
                let id = self.resolve(path)?;
                op(&id)
            }
            other => other,
        }
    }

    fn lookup(&self, path: &RemotePath) -> RemoteResult<Option<String>> {
        match self.resolve(path) {
            Ok(id) => Ok(Some(id)),
            Err(RemoteError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_object(&self, path: &RemotePath, folder: bool) -> RemoteResult<String> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(RemoteError::already_exists(path.as_str()));
        };
        if self.lookup(path)?.is_some() {
            return Err(RemoteError::already_exists(path.as_str()));
        }
        let parent_id = self.resolve(&parent)?;
        let mut metadata = json!({ "name": name, "parents": [parent_id] });
        if folder {
            metadata["mimeType"] = json!(FOLDER_MIME);
        }
        let url = self.api("files");
        let created: DriveFile = self.get_json(path.as_str(), |http| {
            Ok(http
                .post(&url)
                .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                .json(&metadata))
        })?;
        self.ids.insert(path, &created.id);
        Ok(created.id)
    }

    fn trash(&self, path: &RemotePath) -> RemoteResult<()> {
        self.with_id(path, |id| {
            let url = self.api(&format!("files/{id}"));
            self.send(path.as_str(), |http| {
                Ok(http
                    .patch(&url)
                    .query(&[("supportsAllDrives", "true")])
                    .json(&json!({ "trashed": true })))
            })
            .map(drop)
        })?;
        self.ids.invalidate_subtree(path);
        Ok(())
    }
}

impl RemoteSession for DriveSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Drive
    }

    fn list(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        let files = self.with_id(path, |id| self.children(id, path.as_str()))?;
        Ok(files
            .iter()
            .map(|file| {
                self.ids.insert(&path.join(&file.name), &file.id);
                file.to_entry()
            })
            .collect())
    }

    fn stat(&mut self, path: &RemotePath) -> RemoteResult<RemoteEntry> {
        if path.is_root() {
            return Ok(RemoteEntry::root());
        }
        self.with_id(path, |id| self.file_by_id(id, path.as_str()))
            .map(|file| file.to_entry())
    }

    fn supports_range_read(&self) -> bool {
        true
    }

    fn read_range(&mut self, path: &RemotePath, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let last = offset + len as u64 - 1;
        self.with_id(path, |id| {
            let url = self.api(&format!("files/{id}"));
            let response = self.send(path.as_str(), |http| {
                Ok(http
                    .get(&url)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")])
                    .header(RANGE, format!("bytes={offset}-{last}")))
            })?;
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(Vec::new());
            }
            let mut bytes = response
                .bytes()
                .map_err(|e| map_transport(&e, path.as_str()))?
                .to_vec();
            // Servers that ignore Range send the whole object
            if bytes.len() > len {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                bytes = bytes[start..end].to_vec();
            }
            Ok(bytes)
        })
    }

    fn read_full(&mut self, path: &RemotePath, sink: &mut dyn Write) -> RemoteResult<u64> {
        self.with_id(path, |id| {
            let url = self.api(&format!("files/{id}"));
            let mut response = self.send(path.as_str(), |http| {
                Ok(http
                    .get(&url)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")]))
            })?;
            response
                .copy_to(&mut *sink)
                .map_err(|e| map_transport(&e, path.as_str()))
        })
    }

    fn write_full(
        &mut self,
        path: &RemotePath,
        source: &mut dyn UploadSource,
        len: u64,
    ) -> RemoteResult<()> {
        let id = match self.lookup(path)? {
            Some(id) => id,
            None => self.create_object(path, false)?,
        };
        let mut payload = UploadBody::capture(source, len)?;
        let url = format!("{}/files/{id}", self.settings.upload_base);
        self.send(path.as_str(), |http| {
            Ok(http
                .patch(&url)
                .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(payload.body()?))
        })
        .map_err(|e| {
            if matches!(e, RemoteError::NotFound { .. }) {
                self.ids.invalidate(path);
            }
            e
        })?;
        debug!(path = %path, bytes = len, "Uploaded object");
        Ok(())
    }

    fn create_empty(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.create_object(path, false).map(drop)
    }

    fn delete(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.trash(path)
    }

    fn mkdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.create_object(path, true).map(drop)
    }

    fn rmdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        let has_children = self.with_id(path, |id| self.children(id, path.as_str()))?;
        if !has_children.is_empty() {
            return Err(RemoteError::not_empty(path.as_str()));
        }
        self.trash(path)
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        let (Some(from_parent), Some(to_parent), Some(new_name)) = (from.parent(), to.parent(), to.file_name())
        else {
            return Err(RemoteError::access_denied(from.as_str()));
        };
        if self.lookup(to)?.is_some() {
            return Err(RemoteError::already_exists(to.as_str()));
        }
        let old_parent_id = self.resolve(&from_parent)?;
        let new_parent_id = self.resolve(&to_parent)?;
        self.with_id(from, |id| {
            let url = self.api(&format!("files/{id}"));
            self.send(from.as_str(), |http| {
                let mut request = http
                    .patch(&url)
                    .query(&[("supportsAllDrives", "true")])
                    .json(&json!({ "name": new_name }));
                if old_parent_id != new_parent_id {
                    request = request.query(&[
                        ("addParents", new_parent_id.as_str()),
                        ("removeParents", old_parent_id.as_str()),
                    ]);
                }
                Ok(request)
            })
            .map(drop)
        })?;
        self.ids.invalidate_subtree(from);
        self.ids.invalidate_subtree(to);
        Ok(())
    }

    fn probe(&mut self) -> RemoteResult<()> {
        let url = self.api("about");
        self.send("/", |http| Ok(http.get(&url).query(&[("fields", "user/emailAddress")])))
            .map(drop)
    }

    fn close(&mut self) {
        if let Err(e) = self.ids.save() {
            warn!(error = %e, "Failed to persist path-id cache");
        }
    }
}
