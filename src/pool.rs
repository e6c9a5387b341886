//! Per-NDS bounded connection pools.
//!
//! Each configured NDS owns one [`NdsPool`]: a capacity semaphore plus a
//! shelf of idle sessions. Acquire takes a permit (FIFO, so waiters cannot
//! starve), prefers a healthy idle session, and only dials when none is
//! reusable. Release puts the session back on the shelf; a sweeper retires
//! sessions idle past their lifetime. Removing an NDS closes its semaphore,
//! which both drains the shelf and fails queued acquirers with
//! `NotConfigured`.
//!
//! The pool is generic over [`PoolClient`] so its bookkeeping is exercised
//! in tests with stub sessions; production code only ever uses
//! [`NdsPool`]`<NdsClient>`.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info};

use crate::error::{ErrorKind, NdsError, Result};
use crate::nds::{NdsClient, NdsConfig, SessionParams};

const MODULE: &str = "pool";

/// How often the background sweeper visits the pools.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle lifetime after which a session is retired.
pub const MAX_IDLE: Duration = Duration::from_secs(300);

/// Session operations the pool needs from its clients.
#[async_trait]
pub trait PoolClient: Send + Sized + 'static {
    async fn open(params: &SessionParams) -> Result<Self>;
    async fn healthy(&mut self) -> bool;
    async fn shutdown(&mut self);
}

#[async_trait]
impl PoolClient for NdsClient {
    async fn open(params: &SessionParams) -> Result<Self> {
        NdsClient::connect(params).await
    }

    async fn healthy(&mut self) -> bool {
        self.check_alive().await
    }

    async fn shutdown(&mut self) {
        self.close().await;
    }
}

/// Pool configuration for one NDS.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub params: SessionParams,
    pub pool_size: usize,
    pub max_idle: Duration,
}

impl From<&NdsConfig> for PoolSettings {
    fn from(config: &NdsConfig) -> Self {
        Self {
            params: SessionParams::from(config),
            pool_size: config.pool_size.max(1),
            max_idle: MAX_IDLE,
        }
    }
}

/// Point-in-time pool counters, served by the gateway's `/nds/status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub max: usize,
}

struct IdleSession<C> {
    client: C,
    since: Instant,
}

/// Bounded session pool for one NDS.
pub struct NdsPool<C: PoolClient = NdsClient> {
    settings: PoolSettings,
    capacity: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession<C>>>,
}

impl<C: PoolClient> NdsPool<C> {
    pub fn new(settings: PoolSettings) -> Self {
        let capacity = Arc::new(Semaphore::new(settings.pool_size));
        Self { settings, capacity, idle: Mutex::new(Vec::new()) }
    }

    /// Borrow a session, waiting for capacity when the pool is saturated.
    ///
    /// Idle sessions are health-checked before reuse; dead ones are closed
    /// and replaced. There is no acquire deadline; impatient callers cancel
    /// the future.
    ///
    /// # Errors
    ///
    /// `NotConfigured` once the pool has been drained, `ConnectFailed` when
    /// a fresh session cannot be dialed.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession<C>> {
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| NdsError::new(ErrorKind::NotConfigured, MODULE, "pool removed"))?;

        // Prefer the most recently parked session: it is the most likely to
        // still be alive.
        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(mut parked) => {
                    if parked.client.healthy().await {
                        return Ok(PooledSession {
                            client: Some(parked.client),
                            pool: Arc::clone(self),
                            _permit: permit,
                        });
                    }
                    debug!(module = MODULE, "discarding unhealthy idle session");
                    parked.client.shutdown().await;
                }
                None => break,
            }
        }

        match C::open(&self.settings.params).await {
            Ok(client) => Ok(PooledSession { client: Some(client), pool: Arc::clone(self), _permit: permit }),
            Err(err) => Err(err),
        }
    }

    /// Close idle sessions and reject current and future acquirers.
    pub async fn drain(&self) {
        self.capacity.close();
        let mut idle = self.idle.lock().await;
        for mut parked in idle.drain(..) {
            parked.client.shutdown().await;
        }
    }

    /// Retire sessions idle past the configured lifetime.
    pub async fn sweep(&self) {
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock().await;
            let now = Instant::now();
            let mut kept = Vec::with_capacity(idle.len());
            for parked in idle.drain(..) {
                if now.duration_since(parked.since) > self.settings.max_idle {
                    expired.push(parked);
                } else {
                    kept.push(parked);
                }
            }
            *idle = kept;
        }
        for mut parked in expired {
            debug!(module = MODULE, "closing idle session past max lifetime");
            parked.client.shutdown().await;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let idle = self.idle.lock().await.len();
        let active = self.settings.pool_size.saturating_sub(self.capacity.available_permits());
        PoolStatus { total: active + idle, active, idle, max: self.settings.pool_size }
    }
}

/// A session borrowed from a pool.
///
/// Give it back with [`PooledSession::release`] when the session is still
/// good, or [`PooledSession::discard`] after a failure. Dropping it without
/// either simply closes the underlying transport and frees the capacity.
pub struct PooledSession<C: PoolClient = NdsClient> {
    client: Option<C>,
    pool: Arc<NdsPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: PoolClient> std::fmt::Debug for PooledSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish()
    }
}

impl<C: PoolClient> PooledSession<C> {
    /// Park the session for reuse and wake one waiter.
    pub async fn release(mut self) {
        if let Some(client) = self.client.take() {
            let mut idle = self.pool.idle.lock().await;
            idle.push(IdleSession { client, since: Instant::now() });
        }
        // Dropping self frees the capacity permit.
    }

    /// Close the session instead of parking it.
    pub async fn discard(mut self) {
        if let Some(mut client) = self.client.take() {
            client.shutdown().await;
        }
    }
}

impl<C: PoolClient> Deref for PooledSession<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client.as_ref().expect("session taken")
    }
}

impl<C: PoolClient> DerefMut for PooledSession<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client.as_mut().expect("session taken")
    }
}

/// The gateway-wide `nds id → pool` map.
pub struct PoolMap<C: PoolClient = NdsClient> {
    pools: RwLock<HashMap<i64, Arc<NdsPool<C>>>>,
}

impl<C: PoolClient> Default for PoolMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PoolClient> PoolMap<C> {
    pub fn new() -> Self {
        Self { pools: RwLock::new(HashMap::new()) }
    }

    /// Add or replace the pool for one NDS. A replaced pool is drained, so
    /// credential updates take effect on the next acquire.
    pub async fn upsert(&self, nds_id: i64, settings: PoolSettings) {
        let pool = Arc::new(NdsPool::new(settings));
        let previous = self.pools.write().await.insert(nds_id, pool);
        if let Some(previous) = previous {
            previous.drain().await;
            info!(module = MODULE, nds_id, "pool replaced");
        } else {
            info!(module = MODULE, nds_id, "pool added");
        }
    }

    /// Drop one NDS. Absent ids are not an error.
    pub async fn remove(&self, nds_id: i64) {
        let removed = self.pools.write().await.remove(&nds_id);
        if let Some(pool) = removed {
            pool.drain().await;
            info!(module = MODULE, nds_id, "pool removed");
        }
    }

    pub async fn contains(&self, nds_id: i64) -> bool {
        self.pools.read().await.contains_key(&nds_id)
    }

    /// Borrow a session from one NDS's pool.
    ///
    /// # Errors
    ///
    /// `NotConfigured` when the NDS has no pool.
    pub async fn acquire(&self, nds_id: i64) -> Result<PooledSession<C>> {
        let pool = self
            .pools
            .read()
            .await
            .get(&nds_id)
            .cloned()
            .ok_or_else(|| NdsError::not_configured(MODULE, nds_id))?;
        pool.acquire().await
    }

    pub async fn status(&self) -> HashMap<i64, PoolStatus> {
        let pools: Vec<(i64, Arc<NdsPool<C>>)> =
            self.pools.read().await.iter().map(|(id, pool)| (*id, Arc::clone(pool))).collect();
        let mut out = HashMap::with_capacity(pools.len());
        for (id, pool) in pools {
            out.insert(id, pool.status().await);
        }
        out
    }

    /// One sweep pass over every pool.
    pub async fn sweep(&self) {
        let pools: Vec<Arc<NdsPool<C>>> = self.pools.read().await.values().cloned().collect();
        for pool in pools {
            pool.sweep().await;
        }
    }

    /// Drain everything; used at shutdown.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<NdsPool<C>>> = {
            let mut map = self.pools.write().await;
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.drain().await;
        }
        info!(module = MODULE, "all pools drained");
    }
}

/// Run the idle sweeper until `shutdown` flips.
pub async fn run_sweeper<C: PoolClient>(
    pools: Arc<PoolMap<C>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if crate::signal::wait_or_shutdown(&mut shutdown, SWEEP_INTERVAL).await {
            debug!(module = MODULE, "sweeper stopping");
            return;
        }
        pools.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::nds::Protocol;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::OnceLock;

    fn opens() -> &'static StdMutex<HashMap<String, usize>> {
        static OPENS: OnceLock<StdMutex<HashMap<String, usize>>> = OnceLock::new();
        OPENS.get_or_init(|| StdMutex::new(HashMap::new()))
    }

    fn sick_hosts() -> &'static StdMutex<HashSet<String>> {
        static SICK: OnceLock<StdMutex<HashSet<String>>> = OnceLock::new();
        SICK.get_or_init(|| StdMutex::new(HashSet::new()))
    }

    fn open_count(host: &str) -> usize {
        opens().lock().unwrap().get(host).copied().unwrap_or(0)
    }

    struct FakeSession {
        host: String,
    }

    #[async_trait]
    impl PoolClient for FakeSession {
        async fn open(params: &SessionParams) -> Result<Self> {
            *opens().lock().unwrap().entry(params.host.clone()).or_insert(0) += 1;
            Ok(Self { host: params.host.clone() })
        }

        async fn healthy(&mut self) -> bool {
            !sick_hosts().lock().unwrap().contains(&self.host)
        }

        async fn shutdown(&mut self) {}
    }

    fn settings(host: &str, pool_size: usize) -> PoolSettings {
        PoolSettings {
            params: SessionParams {
                protocol: Protocol::Ftp,
                host: host.to_string(),
                port: 21,
                account: "u".into(),
                password: "p".into(),
                verify_host_key: false,
            },
            pool_size,
            max_idle: MAX_IDLE,
        }
    }

    #[tokio::test]
    async fn sessions_are_reused_after_release() {
        let pool = Arc::new(NdsPool::<FakeSession>::new(settings("reuse", 2)));
        let session = pool.acquire().await.unwrap();
        session.release().await;
        let session = pool.acquire().await.unwrap();
        session.release().await;
        assert_eq!(open_count("reuse"), 1);
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_sessions() {
        let pool = Arc::new(NdsPool::<FakeSession>::new(settings("bounded", 2)));
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();

        // Third acquire must wait until one of the first two is released.
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire().await.unwrap().release().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(open_count("bounded"), 2);

        first.release().await;
        waiter.await.unwrap();
        assert_eq!(open_count("bounded"), 2);
        second.release().await;
        assert_eq!(pool.status().await.active, 0);
    }

    #[tokio::test]
    async fn unhealthy_idle_sessions_are_replaced() {
        let pool = Arc::new(NdsPool::<FakeSession>::new(settings("sick", 1)));
        pool.acquire().await.unwrap().release().await;
        assert_eq!(open_count("sick"), 1);

        sick_hosts().lock().unwrap().insert("sick".to_string());
        let session = pool.acquire().await.unwrap();
        // The parked session failed its health check and was replaced.
        assert_eq!(open_count("sick"), 2);
        session.discard().await;
    }

    #[tokio::test]
    async fn drained_pool_rejects_with_not_configured() {
        let pool = Arc::new(NdsPool::<FakeSession>::new(settings("drained", 1)));
        pool.drain().await;
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConfigured);
    }

    #[tokio::test]
    async fn sweep_retires_sessions_past_max_idle() {
        let mut settings = settings("sweep", 2);
        settings.max_idle = Duration::from_millis(0);
        let pool = Arc::new(NdsPool::<FakeSession>::new(settings));
        pool.acquire().await.unwrap().release().await;
        assert_eq!(pool.status().await.idle, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.sweep().await;
        assert_eq!(pool.status().await.idle, 0);
    }

    #[tokio::test]
    async fn map_acquire_on_unknown_nds_is_not_configured() {
        let map = PoolMap::<FakeSession>::new();
        let err = map.acquire(404).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConfigured);
    }

    #[tokio::test]
    async fn map_remove_is_idempotent() {
        let map = PoolMap::<FakeSession>::new();
        map.upsert(1, settings("map", 1)).await;
        assert!(map.contains(1).await);
        map.remove(1).await;
        map.remove(1).await;
        assert!(!map.contains(1).await);
    }
}
