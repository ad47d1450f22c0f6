use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::BackendGateway;
use super::config::PoolConfig;
use super::error::GatewayError;

/// One chat session on the backend, minted under credential `credential_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    pub session_id: String,
    pub created_at_unix_ms: u64,
    pub credential_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub checked_out: usize,
    pub minting: usize,
    pub target_size: usize,
    pub minted_total: u64,
    pub fallback_mints: u64,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<BackendSession>,
    checked_out: usize,
    minting: usize,
    consecutive_failures: u32,
}

struct PoolShared {
    cfg: PoolConfig,
    gateway: Arc<BackendGateway>,
    state: Mutex<PoolState>,
    // Signalled when a session lands in `available`.
    session_ready: Notify,
    // Wakes the maintenance loop ahead of its next tick.
    wake: Notify,
    cancel: CancellationToken,
    minted_total: AtomicU64,
    fallback_mints: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Exclusive ownership of a checked-out session. Dropping the lease checks the session back in.
pub struct SessionLease {
    session: BackendSession,
    shared: Arc<PoolShared>,
    released: bool,
}

impl SessionLease {
    pub fn session(&self) -> &BackendSession {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn credential_version(&self) -> u64 {
        self.session.credential_version
    }

    fn release(mut self, keep: bool) {
        self.released = true;
        self.shared.release(&self.session, keep);
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.session, true);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("credential_version", &self.session.credential_version)
            .finish_non_exhaustive()
    }
}

fn backoff_delay(cfg: &PoolConfig, failures: u32) -> Duration {
    let base = cfg.backoff_base_ms.max(1);
    let exp = failures.saturating_sub(1).min(16);
    let capped = base
        .saturating_mul(1u64 << exp)
        .min(cfg.backoff_max_ms.max(base));
    let half = capped / 2;
    Duration::from_millis(half + fastrand::u64(0..=capped - half))
}

impl PoolShared {
    fn current_version(&self) -> Option<u64> {
        self.gateway.credentials().valid_version()
    }

    fn lease(self: &Arc<Self>, session: BackendSession) -> SessionLease {
        SessionLease {
            session,
            shared: self.clone(),
            released: false,
        }
    }

    fn drop_stale(state: &mut PoolState, current: Option<u64>) -> usize {
        let before = state.available.len();
        match current {
            Some(v) => state.available.retain(|s| s.credential_version == v),
            None => state.available.clear(),
        }
        before - state.available.len()
    }

    fn try_take(self: &Arc<Self>) -> Option<SessionLease> {
        let current = self.current_version();
        let mut st = self.state.lock();
        Self::drop_stale(&mut st, current);
        let session = st.available.pop_front()?;
        st.checked_out += 1;
        Some(self.lease(session))
    }

    fn release(&self, session: &BackendSession, keep: bool) {
        let current = self.current_version();
        let returned = {
            let mut st = self.state.lock();
            st.checked_out = st.checked_out.saturating_sub(1);
            let fits = st.available.len() + st.checked_out + st.minting < self.cfg.target_size;
            if keep && fits && current == Some(session.credential_version) {
                st.available.push_back(session.clone());
                true
            } else {
                false
            }
        };
        if returned {
            self.session_ready.notify_waiters();
        } else {
            log::debug!("discarded backend session minted under v{}", session.credential_version);
            self.wake.notify_one();
        }
    }

    fn offer(&self, session: BackendSession) {
        let current = self.current_version();
        let accepted = {
            let mut st = self.state.lock();
            st.minting = st.minting.saturating_sub(1);
            if !self.cancel.is_cancelled() && current == Some(session.credential_version) {
                st.available.push_back(session);
                true
            } else {
                false
            }
        };
        if accepted {
            self.session_ready.notify_waiters();
        }
    }

    fn sweep(&self) -> usize {
        let current = self.current_version();
        let evicted = Self::drop_stale(&mut self.state.lock(), current);
        if evicted > 0 {
            log::info!("evicted {evicted} stale backend session(s) from the pool");
        }
        evicted
    }

    /// Mints up to `limit` sessions towards the target size. Returns how many were added.
    async fn top_up(&self, limit: usize) -> Result<usize, GatewayError> {
        let wanted = {
            let mut st = self.state.lock();
            let have = st.available.len() + st.checked_out + st.minting;
            let n = self.cfg.target_size.saturating_sub(have).min(limit);
            st.minting += n;
            n
        };
        if wanted == 0 {
            return Ok(0);
        }

        let results = futures_util::future::join_all(
            (0..wanted).map(|_| self.gateway.create_session()),
        )
        .await;

        let mut added = 0;
        let mut first_err = None;
        for r in results {
            match r {
                Ok(session) => {
                    self.minted_total.fetch_add(1, Ordering::Relaxed);
                    self.offer(session);
                    added += 1;
                }
                Err(e) => {
                    let mut st = self.state.lock();
                    st.minting = st.minting.saturating_sub(1);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => {
                self.state.lock().consecutive_failures += 1;
                Err(e)
            }
            None => {
                self.state.lock().consecutive_failures = 0;
                Ok(added)
            }
        }
    }
}

async fn maintenance_loop(shared: Arc<PoolShared>) {
    let tick = Duration::from_millis(shared.cfg.maintain_interval_ms.max(10));
    log::info!(
        "session pool maintenance started (target={}, every {}ms)",
        shared.cfg.target_size,
        tick.as_millis()
    );
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        shared.sweep();
        let (delay, backing_off) = match shared.top_up(usize::MAX).await {
            Ok(added) => {
                if added > 0 {
                    log::debug!("pool topped up with {added} session(s)");
                }
                (tick, false)
            }
            Err(e) => {
                let failures = shared.state.lock().consecutive_failures;
                let delay = backoff_delay(&shared.cfg, failures);
                log::warn!(
                    "session mint failed ({failures} in a row), retrying in {}ms: {e}",
                    delay.as_millis()
                );
                (delay, true)
            }
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified(), if !backing_off => {}
        }
    }
    log::info!("session pool maintenance stopped");
}

/// Warm backend chat sessions ready for checkout. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    /// Builds an idle pool. Call [`start`](Self::start) to run the maintenance loop.
    pub fn new(cfg: PoolConfig, gateway: Arc<BackendGateway>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                cfg,
                gateway,
                state: Mutex::new(PoolState::default()),
                session_ready: Notify::new(),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                minted_total: AtomicU64::new(0),
                fallback_mints: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn gateway(&self) -> &Arc<BackendGateway> {
        &self.shared.gateway
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.cfg.checkout_timeout_ms)
    }

    pub fn start(&self) {
        let mut task = self.shared.task.lock();
        if task.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(maintenance_loop(self.shared.clone())));
    }

    /// Mints up to `count` sessions right away, never beyond the target size. Does nothing once
    /// the pool is shut down.
    pub async fn warm(&self, count: usize) -> Result<usize, GatewayError> {
        if self.shared.cancel.is_cancelled() {
            return Ok(0);
        }
        self.shared.top_up(count).await
    }

    pub async fn checkout(&self) -> Result<SessionLease, GatewayError> {
        self.checkout_within(self.checkout_timeout()).await
    }

    /// Hands out a session minted under the current credential. Waits up to `timeout` for the
    /// maintenance loop, then mints one synchronously.
    pub async fn checkout_within(&self, timeout: Duration) -> Result<SessionLease, GatewayError> {
        let started = Instant::now();
        let deadline = started + timeout;
        if self.shared.cfg.target_size > 0 {
            loop {
                let ready = self.shared.session_ready.notified();
                if let Some(lease) = self.shared.try_take() {
                    return Ok(lease);
                }
                self.shared.wake.notify_one();
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || tokio::time::timeout(remaining, ready).await.is_err() {
                    break;
                }
            }
        }

        self.shared.fallback_mints.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "session pool empty after {}ms, minting a session inline",
            started.elapsed().as_millis()
        );
        let session = self.shared.gateway.create_session().await?;
        self.shared.minted_total.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().checked_out += 1;
        Ok(self.shared.lease(session))
    }

    /// Returns the session for reuse if it is still current, otherwise drops it.
    pub fn checkin(&self, lease: SessionLease) {
        lease.release(true);
    }

    /// Drops the session without returning it. Nothing is sent to the backend.
    pub fn evict(&self, lease: SessionLease) {
        lease.release(false);
    }

    /// Drops available sessions minted under a credential version that is no longer current.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock();
        PoolStats {
            available: st.available.len(),
            checked_out: st.checked_out,
            minting: st.minting,
            target_size: self.shared.cfg.target_size,
            minted_total: self.shared.minted_total.load(Ordering::Relaxed),
            fallback_mints: self.shared.fallback_mints.load(Ordering::Relaxed),
            consecutive_failures: st.consecutive_failures,
        }
    }

    /// Stops maintenance and forgets every available session.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let dropped = {
            let mut st = self.shared.state.lock();
            let n = st.available.len();
            st.available.clear();
            n
        };
        log::info!("session pool shut down ({dropped} idle session(s) dropped)");
    }
}
