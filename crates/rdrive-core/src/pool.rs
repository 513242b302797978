//! Bounded session pool with retry, keepalive and fatal-error suspension.
//!
//! Every backend call in the mount goes through a [`SessionPool`]. The pool
//! owns all live sessions for one backend identity and lends each one to a
//! single caller at a time.
//!
//! # Lifecycle
//!
//! 1. **Acquire**: reuse the most recently released idle session, probing it
//!    first if it sat idle longer than the keepalive interval. With no idle
//!    session and spare capacity, connect a new one (retrying transient
//!    failures with backoff). With no spare capacity, wait up to
//!    `acquire_timeout` and fail with `Timeout`.
//! 2. **Use**: [`SessionPool::run`] retries transient failures of the
//!    operation itself on a fresh session; semantic failures surface at once.
//! 3. **Release**: healthy sessions go back to the idle list, unhealthy ones
//!    are closed and their slot freed.
//!
//! A Fatal error (rejected credentials, host key mismatch) suspends the pool:
//! every later acquire fails immediately until [`SessionPool::reset`] is
//! called.
//!
//! Network probes never run while the pool lock is held.

use crate::backend::{BackendId, BackendKind, Connector, RemoteSession, UploadSource};
use crate::config::ConnectionConfig;
use crate::entry::RemoteEntry;
use crate::error::{RemoteError, RemoteResult};
use crate::path::RemotePath;
use crate::retry::Backoff;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Counters describing pool activity.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub created: AtomicU64,
    pub reused: AtomicU64,
    pub discarded: AtomicU64,
    pub probes: AtomicU64,
    pub probe_failures: AtomicU64,
    pub retries: AtomicU64,
    pub acquire_timeouts: AtomicU64,
}

impl PoolStats {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn reused_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn acquire_timeout_count(&self) -> u64 {
        self.acquire_timeouts.load(Ordering::Relaxed)
    }
}

struct IdleSession {
    session: Box<dyn RemoteSession>,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Most recently released last.
    idle: Vec<IdleSession>,
    /// Sessions in existence: idle, lent out, or being probed/connected.
    live: usize,
}

/// Bounded pool of sessions for one backend.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    identity: BackendId,
    config: ConnectionConfig,
    backoff: Backoff,
    state: Mutex<PoolState>,
    available: Condvar,
    suspended: RwLock<Option<String>>,
    stats: PoolStats,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("identity", &self.identity)
            .field("pool_size", &self.config.pool_size)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let identity = connector.identity();
        Self {
            connector,
            identity,
            backoff: Backoff::from_config(&config),
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            suspended: RwLock::new(None),
            stats: PoolStats::default(),
        }
    }

    pub fn identity(&self) -> &BackendId {
        &self.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.read().is_some()
    }

    /// Clears a Fatal suspension so the pool may reconnect again.
    pub fn reset(&self) {
        if let Some(reason) = self.suspended.write().take() {
            info!(backend = %self.identity, %reason, "Backend suspension cleared");
        }
    }

    fn check_suspended(&self) -> RemoteResult<()> {
        match self.suspended.read().as_ref() {
            Some(reason) => Err(RemoteError::Suspended {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn suspend(&self, cause: &RemoteError) {
        {
            let mut suspended = self.suspended.write();
            if suspended.is_some() {
                return;
            }
            *suspended = Some(cause.to_string());
        }
        error!(
            backend = %self.identity,
            error = %cause,
            "Fatal backend error, reconnects suspended until reset"
        );
        let idle = std::mem::take(&mut self.state.lock().idle);
        for idle in idle {
            self.discard(idle.session);
        }
    }

    /// Borrows a session, connecting or waiting as needed.
    pub fn acquire(&self) -> RemoteResult<PooledSession<'_>> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            self.check_suspended()?;

            let mut state = self.state.lock();
            if let Some(idle) = state.idle.pop() {
                drop(state);
                if idle.last_used.elapsed() >= self.config.keepalive_interval {
                    match self.probe_session(idle.session) {
                        Some(session) => return Ok(self.lend(session)),
                        None => continue,
                    }
                }
                PoolStats::bump(&self.stats.reused);
                return Ok(self.lend(idle.session));
            }

            if state.live < self.config.pool_size {
                state.live += 1;
                drop(state);
                return match self.connect_with_retry() {
                    Ok(session) => Ok(self.lend(session)),
                    Err(e) => {
                        self.free_slot();
                        Err(e)
                    }
                };
            }

            if self.available.wait_until(&mut state, deadline).timed_out()
                && state.idle.is_empty()
                && state.live >= self.config.pool_size
            {
                PoolStats::bump(&self.stats.acquire_timeouts);
                warn!(
                    backend = %self.identity,
                    pool_size = self.config.pool_size,
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for a free session"
                );
                return Err(RemoteError::timeout("session acquire"));
            }
        }
    }

    fn lend(&self, session: Box<dyn RemoteSession>) -> PooledSession<'_> {
        PooledSession {
            pool: self,
            session,
            healthy: true,
            attached: true,
        }
    }

    /// Returns a session to the pool, or tears it down if unhealthy.
    pub fn release(&self, session: Box<dyn RemoteSession>, healthy: bool) {
        if !healthy || self.is_suspended() {
            self.discard(session);
            return;
        }
        let mut state = self.state.lock();
        state.idle.push(IdleSession {
            session,
            last_used: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, mut session: Box<dyn RemoteSession>) {
        session.close();
        drop(session);
        PoolStats::bump(&self.stats.discarded);
        self.free_slot();
    }

    fn free_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Probes a session outside the pool lock. Dead sessions are discarded.
    fn probe_session(&self, mut session: Box<dyn RemoteSession>) -> Option<Box<dyn RemoteSession>> {
        PoolStats::bump(&self.stats.probes);
        match session.probe() {
            Ok(()) => Some(session),
            Err(e) => {
                PoolStats::bump(&self.stats.probe_failures);
                debug!(backend = %self.identity, error = %e, "Idle session failed keepalive probe");
                self.discard(session);
                None
            }
        }
    }

    fn connect_with_retry(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        let mut attempt = 0;
        loop {
            match self.connector.connect() {
                Ok(session) => {
                    PoolStats::bump(&self.stats.created);
                    if attempt > 0 {
                        info!(backend = %self.identity, attempt, "Connected after retry");
                    } else {
                        debug!(backend = %self.identity, "Opened new session");
                    }
                    return Ok(session);
                }
                Err(e) if e.is_fatal() => {
                    self.suspend(&e);
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= self.backoff.attempts() {
                        warn!(backend = %self.identity, attempts = attempt, error = %e, "Connect failed");
                        return Err(e);
                    }
                    self.pause_before_retry("connect", attempt, &e);
                }
            }
        }
    }

    fn pause_before_retry(&self, operation: &str, attempt: u32, cause: &RemoteError) {
        PoolStats::bump(&self.stats.retries);
        let delay = self.backoff.delay(attempt - 1);
        warn!(
            backend = %self.identity,
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Transient failure, retrying"
        );
        thread::sleep(delay);
    }

    /// Runs `op` against a pooled session, retrying transient failures.
    ///
    /// The closure may be invoked several times; each attempt gets a session
    /// that has not seen a failure. Semantic errors are returned on the
    /// first occurrence and leave the session in the pool.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> RemoteResult<T>
    where
        F: FnMut(&mut dyn RemoteSession) -> RemoteResult<T>,
    {
        let mut attempt = 0;
        loop {
            let mut session = self.acquire()?;
            let err = match op(&mut *session) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if err.poisons_session() {
                session.mark_unhealthy();
            }
            drop(session);

            if err.is_fatal() {
                self.suspend(&err);
                return Err(err);
            }
            attempt += 1;
            if !err.is_retryable() || attempt >= self.backoff.attempts() {
                return Err(err);
            }
            self.pause_before_retry(operation, attempt, &err);
        }
    }

    /// Probes every idle session that has been unused for a keepalive interval.
    ///
    /// Stale sessions are taken out of the idle list, probed without the pool
    /// lock, then returned or discarded.
    pub fn probe_idle(&self) {
        let stale: Vec<IdleSession> = {
            let mut state = self.state.lock();
            let interval = self.config.keepalive_interval;
            let (stale, fresh) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| idle.last_used.elapsed() >= interval);
            state.idle = fresh;
            stale
        };
        if stale.is_empty() {
            return;
        }
        debug!(backend = %self.identity, count = stale.len(), "Probing idle sessions");
        for idle in stale {
            if let Some(session) = self.probe_session(idle.session) {
                self.release(session, true);
            }
        }
    }

    /// Starts a background thread that probes idle sessions every keepalive interval.
    ///
    /// The thread stops when the handle is dropped or the pool is gone.
    pub fn spawn_keepalive(self: &Arc<Self>) -> std::io::Result<KeepaliveHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.keepalive_interval.max(Duration::from_millis(10));
        let thread = thread::Builder::new()
            .name(format!("rdrive-keepalive-{}", self.identity.kind))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match pool.upgrade() {
                            Some(pool) => pool.probe_idle(),
                            None => break,
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(KeepaliveHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Closes every idle session.
    pub fn shutdown(&self) {
        let idle = std::mem::take(&mut self.state.lock().idle);
        for idle in idle {
            self.discard(idle.session);
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        for mut idle in std::mem::take(&mut self.state.get_mut().idle) {
            idle.session.close();
        }
    }
}

/// A session on loan from a [`SessionPool`].
///
/// Returned to the pool on drop; call [`mark_unhealthy`](Self::mark_unhealthy)
/// to have it discarded instead.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Box<dyn RemoteSession>,
    healthy: bool,
    attached: bool,
}

impl PooledSession<'_> {
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl Deref for PooledSession<'_> {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if self.attached {
            self.attached = false;
            let session = std::mem::replace(&mut self.session, Box::new(Detached));
            self.pool.release(session, self.healthy);
        }
    }
}

/// Placeholder left behind in a [`PooledSession`] once its session went home.
struct Detached;

impl Detached {
    fn gone<T>() -> RemoteResult<T> {
        Err(RemoteError::disconnected("session already released"))
    }
}

impl RemoteSession for Detached {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
    fn list(&mut self, _: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        Self::gone()
    }
    fn stat(&mut self, _: &RemotePath) -> RemoteResult<RemoteEntry> {
        Self::gone()
    }
    fn supports_range_read(&self) -> bool {
        false
    }
    fn read_range(&mut self, _: &RemotePath, _: u64, _: usize) -> RemoteResult<Vec<u8>> {
        Self::gone()
    }
    fn read_full(&mut self, _: &RemotePath, _: &mut dyn Write) -> RemoteResult<u64> {
        Self::gone()
    }
    fn write_full(&mut self, _: &RemotePath, _: &mut dyn UploadSource, _: u64) -> RemoteResult<()> {
        Self::gone()
    }
    fn create_empty(&mut self, _: &RemotePath) -> RemoteResult<()> {
        Self::gone()
    }
    fn delete(&mut self, _: &RemotePath) -> RemoteResult<()> {
        Self::gone()
    }
    fn mkdir(&mut self, _: &RemotePath) -> RemoteResult<()> {
        Self::gone()
    }
    fn rmdir(&mut self, _: &RemotePath) -> RemoteResult<()> {
        Self::gone()
    }
    fn rename(&mut self, _: &RemotePath, _: &RemotePath) -> RemoteResult<()> {
        Self::gone()
    }
    fn probe(&mut self) -> RemoteResult<()> {
        Self::gone()
    }
}

/// Stops the keepalive thread when dropped.
pub struct KeepaliveHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl KeepaliveHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hands out one shared pool per backend identity.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pools: DashMap<BackendId, Arc<SessionPool>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for the connector's identity, creating it on first use.
    pub fn pool_for(&self, connector: Arc<dyn Connector>, config: &ConnectionConfig) -> Arc<SessionPool> {
        let identity = connector.identity();
        self.pools
            .entry(identity)
            .or_insert_with(|| Arc::new(SessionPool::new(connector, config.clone())))
            .clone()
    }

    pub fn get(&self, identity: &BackendId) -> Option<Arc<SessionPool>> {
        self.pools.get(identity).map(|p| Arc::clone(&p))
    }

    /// Drops the pool for an identity, closing its idle sessions.
    pub fn remove(&self, identity: &BackendId) {
        if let Some((_, pool)) = self.pools.remove(identity) {
            pool.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
