//! Per-address connection pooling.
//!
//! Every server address gets its own [`Slot`]: a semaphore bounding how many
//! connections may be handed out at once, the idle connections waiting for
//! reuse, and a few counters. The map from address to slot is only locked
//! for lookup and insert, never across I/O.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::address::Address;
use crate::channel::{Channel, ChannelConfig};
use crate::connection::{Connection, ConnectionSettings};
use crate::error::DriverError;

/// Creates authenticated connections for the pool.
#[async_trait]
pub trait Opener: Send + Sync + 'static {
    async fn open(&self, address: &Address) -> Result<Connection, DriverError>;
}

/// Opens TCP (or TLS) connections.
#[derive(Debug, Clone)]
pub struct TcpOpener {
    channel: ChannelConfig,
    settings: ConnectionSettings,
}

impl TcpOpener {
    pub fn new(channel: ChannelConfig, settings: ConnectionSettings) -> Self {
        Self { channel, settings }
    }
}

#[async_trait]
impl Opener for TcpOpener {
    async fn open(&self, address: &Address) -> Result<Connection, DriverError> {
        let channel = Channel::connect(address, &self.channel).await?;
        Connection::open(channel, &self.settings).await
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections handed out at once, per address.
    pub max_size: usize,
    /// Connections older than this are closed instead of reused.
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

/// Counters for one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub closed: u64,
    pub acquired: u64,
    pub timeouts: u64,
}

struct Slot {
    max_size: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    created: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    timeouts: AtomicU64,
}

impl Slot {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    fn in_use(&self) -> usize {
        self.max_size
            .saturating_sub(self.permits.available_permits())
    }

    async fn discard(&self, mut conn: Connection) {
        conn.close().await;
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolInner {
    opener: Arc<dyn Opener>,
    config: PoolConfig,
    slots: RwLock<HashMap<Address, Arc<Slot>>>,
    closed: AtomicBool,
    /// Bumped by [`ConnectionPool::mark_all_stale`]; loans from an older
    /// generation are closed when they come back.
    generation: AtomicU64,
}

/// Hands out connections by address. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(opener: Arc<dyn Opener>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                opener,
                config,
                slots: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn slot(&self, address: &Address) -> Arc<Slot> {
        if let Some(slot) = self.inner.slots.read().get(address) {
            return slot.clone();
        }
        self.inner
            .slots
            .write()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Slot::new(self.inner.config.max_size)))
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Borrows a connection to `address` within `timeout`.
    ///
    /// The deadline covers the whole acquisition: waiting for a free slot,
    /// checking idle connections and opening a new one. Idle connections are
    /// reused unless broken or too old; one idle for longer than
    /// `liveness_check_timeout` is checked with RESET first. Failing to
    /// connect deactivates the address.
    pub async fn acquire(
        &self,
        address: &Address,
        timeout: Duration,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection, DriverError> {
        if self.is_closed() {
            return Err(DriverError::client("connection pool is closed"));
        }
        let slot = self.slot(address);
        let deadline = Instant::now() + timeout;
        let acquired = tokio::time::timeout_at(
            deadline,
            self.acquire_within(&slot, address, liveness_check_timeout),
        )
        .await;
        match acquired {
            Ok(result) => result,
            Err(_) => {
                slot.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(address = %address, timeout = ?timeout, "connection acquisition timed out");
                Err(DriverError::client(format!(
                    "failed to obtain a connection from the pool within {timeout:?}"
                )))
            }
        }
    }

    async fn acquire_within(
        &self,
        slot: &Arc<Slot>,
        address: &Address,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection, DriverError> {
        let Ok(permit) = slot.permits.clone().acquire_owned().await else {
            return Err(DriverError::client("connection pool is closed"));
        };

        loop {
            let candidate = slot.idle.lock().pop_back();
            let Some(mut conn) = candidate else { break };

            if conn.is_defunct() || conn.age() >= self.inner.config.max_lifetime {
                tracing::debug!(address = %address, "closing stale idle connection");
                slot.discard(conn).await;
                continue;
            }
            if let Some(limit) = liveness_check_timeout {
                if conn.is_idle_for(limit) {
                    if let Err(e) = conn.reset().await {
                        tracing::debug!(address = %address, error = %e, "liveness check failed");
                        slot.discard(conn).await;
                        continue;
                    }
                }
            }
            return Ok(self.hand_out(slot.clone(), conn, permit));
        }

        match self.inner.opener.open(address).await {
            Ok(conn) => {
                slot.created.fetch_add(1, Ordering::Relaxed);
                Ok(self.hand_out(slot.clone(), conn, permit))
            }
            Err(e) => {
                drop(permit);
                if matches!(e, DriverError::ServiceUnavailable { .. }) {
                    self.deactivate(address).await;
                }
                Err(e)
            }
        }
    }

    fn hand_out(
        &self,
        slot: Arc<Slot>,
        conn: Connection,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        slot.acquired.fetch_add(1, Ordering::Relaxed);
        PooledConnection {
            conn: Some(conn),
            slot,
            pool: self.clone(),
            permit: Some(permit),
            generation: self.generation(),
        }
    }

    /// Puts a connection back: cleaned with RESET if needed, closed if it
    /// cannot be cleaned or is no longer wanted.
    async fn reclaim(&self, slot: &Slot, mut conn: Connection, generation: u64) {
        if conn.is_defunct()
            || self.is_closed()
            || generation != self.generation()
            || conn.age() >= self.inner.config.max_lifetime
        {
            slot.discard(conn).await;
            return;
        }
        if !conn.is_ready() {
            if let Err(e) = conn.reset().await {
                tracing::debug!(address = %conn.address(), error = %e, "reset on release failed");
                slot.discard(conn).await;
                return;
            }
        }
        if self.is_closed() {
            slot.discard(conn).await;
            return;
        }
        slot.idle.lock().push_back(conn);
    }

    /// Closes every idle connection to `address`. Connections currently in
    /// use are checked again when they come back.
    pub async fn deactivate(&self, address: &Address) {
        let slot = self.inner.slots.read().get(address).cloned();
        let Some(slot) = slot else { return };
        let idle: Vec<Connection> = slot.idle.lock().drain(..).collect();
        if !idle.is_empty() {
            tracing::debug!(address = %address, count = idle.len(), "deactivating address");
        }
        for conn in idle {
            slot.discard(conn).await;
        }
    }

    /// Closes the idle connections of every address missing from `keep`.
    /// Called after a routing table refresh with the addresses still known.
    pub async fn retain(&self, keep: &[Address]) {
        let gone: Vec<Address> = self
            .inner
            .slots
            .read()
            .keys()
            .filter(|address| !keep.contains(address))
            .cloned()
            .collect();
        for address in gone {
            self.deactivate(&address).await;
        }
    }

    /// Retires every connection opened so far: idle ones are closed now,
    /// loaned ones when they come back. Used when the credentials behind
    /// them stop being valid.
    pub async fn mark_all_stale(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let slots: Vec<Arc<Slot>> = self.inner.slots.read().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            let idle: Vec<Connection> = slot.idle.lock().drain(..).collect();
            count += idle.len();
            for conn in idle {
                slot.discard(conn).await;
            }
        }
        tracing::debug!(closed = count, "all pooled connections marked stale");
    }

    /// Closes every idle connection and refuses further acquisitions.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let slots: Vec<Arc<Slot>> = self.inner.slots.read().values().cloned().collect();
        for slot in slots {
            slot.permits.close();
            let idle: Vec<Connection> = slot.idle.lock().drain(..).collect();
            for conn in idle {
                slot.discard(conn).await;
            }
        }
    }

    pub fn in_use_count(&self, address: &Address) -> usize {
        self.inner
            .slots
            .read()
            .get(address)
            .map_or(0, |slot| slot.in_use())
    }

    pub fn idle_count(&self, address: &Address) -> usize {
        self.inner
            .slots
            .read()
            .get(address)
            .map_or(0, |slot| slot.idle.lock().len())
    }

    /// Addresses this pool has ever connected to.
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.slots.read().keys().cloned().collect()
    }

    pub fn metrics(&self) -> HashMap<Address, PoolMetrics> {
        self.inner
            .slots
            .read()
            .iter()
            .map(|(address, slot)| {
                let metrics = PoolMetrics {
                    idle: slot.idle.lock().len(),
                    in_use: slot.in_use(),
                    created: slot.created.load(Ordering::Relaxed),
                    closed: slot.closed.load(Ordering::Relaxed),
                    acquired: slot.acquired.load(Ordering::Relaxed),
                    timeouts: slot.timeouts.load(Ordering::Relaxed),
                };
                (address.clone(), metrics)
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A connection on loan from the pool.
///
/// Hand it back with [`PooledConnection::release`]. Dropping it also returns
/// it: a clean connection goes straight back to the idle list, anything else
/// is reset (or closed) on a background task.
pub struct PooledConnection {
    conn: Option<Connection>,
    slot: Arc<Slot>,
    pool: ConnectionPool,
    permit: Option<OwnedSemaphorePermit>,
    generation: u64,
}

impl PooledConnection {
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.reclaim(&self.slot, conn, self.generation).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is only taken on release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is only taken on release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let pool = &self.pool;

        // Also covers a connection whose read or write was cut off mid-frame.
        if conn.is_defunct() {
            self.slot.closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if conn.is_ready()
            && !pool.is_closed()
            && self.generation == pool.generation()
            && conn.age() < pool.inner.config.max_lifetime
        {
            self.slot.idle.lock().push_back(conn);
            return;
        }

        // Cleaning up needs I/O; the permit stays held until that is done.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = pool.clone();
                let slot = self.slot.clone();
                let permit = self.permit.take();
                let generation = self.generation;
                handle.spawn(async move {
                    pool.reclaim(&slot, conn, generation).await;
                    drop(permit);
                });
            }
            Err(_) => {
                self.slot.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoltDict, BoltValue};
    use crate::testkit::{FakeCluster, Reply};

    const WAIT: Duration = Duration::from_secs(5);

    fn pool(cluster: &FakeCluster, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(cluster.clone()), config)
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert_eq!(pool.in_use_count(&a), 1);
        conn.release().await;
        assert_eq!(pool.in_use_count(&a), 0);
        assert_eq!(pool.idle_count(&a), 1);

        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert_eq!(cluster.opened("a:7687"), 1);
        conn.release().await;

        let metrics = &pool.metrics()[&a];
        assert_eq!(metrics.created, 1);
        assert_eq!(metrics.acquired, 2);
    }

    #[tokio::test]
    async fn dropped_connection_returns_to_idle() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        assert_eq!(pool.idle_count(&a), 1);
        assert_eq!(pool.in_use_count(&a), 0);
    }

    #[tokio::test]
    async fn acquisition_times_out_when_exhausted() {
        let cluster = FakeCluster::new();
        let pool = pool(
            &cluster,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );
        let a = addr("a:7687");

        let held = pool.acquire(&a, WAIT, None).await.unwrap();
        let err = pool
            .acquire(&a, Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Client(_)), "{err}");
        assert!(err.to_string().contains("failed to obtain a connection"));
        assert_eq!(pool.in_use_count(&a), 1);
        assert_eq!(pool.metrics()[&a].timeouts, 1);

        held.release().await;
        assert_eq!(pool.in_use_count(&a), 0);
    }

    #[tokio::test]
    async fn waiter_gets_released_connection() {
        let cluster = FakeCluster::new();
        let pool = pool(
            &cluster,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );
        let a = addr("a:7687");

        let held = pool.acquire(&a, WAIT, None).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let conn = pool.acquire(&a, WAIT, None).await?;
                Ok::<_, DriverError>(conn.connection_id().to_string())
            })
        };
        tokio::task::yield_now().await;
        let id = held.connection_id().to_string();
        held.release().await;

        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(cluster.opened("a:7687"), 1);
    }

    #[tokio::test]
    async fn failed_connection_that_cannot_reset_is_closed() {
        let cluster = FakeCluster::new();
        let server = cluster.server("a:7687");
        server.fail_resets(true);
        server.push_reply(Reply::failure("Neo.ClientError.Statement.SyntaxError", "bad"));
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let mut conn = pool.acquire(&a, WAIT, None).await.unwrap();
        let first = conn.connection_id().to_string();
        conn.run("RETURN", BoltDict::new(), BoltDict::new()).unwrap();
        conn.pull(-1).unwrap();
        conn.send_all().await.unwrap();
        assert!(conn.fetch_summary().await.is_err());
        conn.release().await;

        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.metrics()[&a].closed, 1);

        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert_ne!(conn.connection_id(), first);
        assert_eq!(cluster.opened("a:7687"), 2);
    }

    #[tokio::test]
    async fn streaming_connection_is_reset_before_reuse() {
        let cluster = FakeCluster::new();
        let server = cluster.server("a:7687");
        server.push_reply(Reply::records(&["n"], vec![vec![BoltValue::Integer(1)], vec![BoltValue::Integer(2)]]));
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let mut conn = pool.acquire(&a, WAIT, None).await.unwrap();
        conn.run("UNWIND [1,2] AS n RETURN n", BoltDict::new(), BoltDict::new())
            .unwrap();
        conn.send_all().await.unwrap();
        conn.fetch_summary().await.unwrap();
        conn.release().await;

        assert_eq!(server.count("RESET"), 1);
        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(cluster.opened("a:7687"), 1);
    }

    #[tokio::test]
    async fn dropped_streaming_connection_is_reset_in_background() {
        let cluster = FakeCluster::new();
        let server = cluster.server("a:7687");
        server.push_reply(Reply::records(&["n"], vec![vec![BoltValue::Integer(1)]]));
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let mut conn = pool.acquire(&a, WAIT, None).await.unwrap();
        conn.run("RETURN 1 AS n", BoltDict::new(), BoltDict::new()).unwrap();
        conn.send_all().await.unwrap();
        conn.fetch_summary().await.unwrap();
        drop(conn);

        server.wait_for("RESET").await;
        for _ in 0..100 {
            if pool.idle_count(&a) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.idle_count(&a), 1);
        assert_eq!(pool.in_use_count(&a), 0);
    }

    #[tokio::test]
    async fn connections_past_max_lifetime_are_replaced() {
        let cluster = FakeCluster::new();
        let pool = pool(
            &cluster,
            PoolConfig {
                max_lifetime: Duration::ZERO,
                ..Default::default()
            },
        );
        let a = addr("a:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        let _conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert_eq!(cluster.opened("a:7687"), 2);
    }

    #[tokio::test]
    async fn idle_connections_are_checked_with_reset() {
        let cluster = FakeCluster::new();
        let server = cluster.server("a:7687");
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        let _conn = pool
            .acquire(&a, WAIT, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(server.count("RESET"), 1);
        assert_eq!(cluster.opened("a:7687"), 1);
    }

    #[tokio::test]
    async fn unreachable_address_is_deactivated() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        assert_eq!(pool.idle_count(&a), 1);
        pool.deactivate(&a).await;
        assert_eq!(pool.idle_count(&a), 0);

        cluster.set_unreachable("a:7687", true);
        let err = pool.acquire(&a, WAIT, None).await.unwrap_err();
        assert!(matches!(err, DriverError::ServiceUnavailable { .. }), "{err}");
        assert_eq!(err.address(), Some(&a));
        assert_eq!(pool.in_use_count(&a), 0);
    }

    #[tokio::test]
    async fn connection_cut_off_mid_response_is_not_reused() {
        let cluster = FakeCluster::new();
        cluster.server("a:7687").push_reply(Reply::Stall);
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let mut conn = pool.acquire(&a, WAIT, None).await.unwrap();
        conn.run("RETURN 1 AS n", BoltDict::new(), BoltDict::new()).unwrap();
        conn.pull(-1).unwrap();
        conn.send_all().await.unwrap();
        let read = tokio::time::timeout(Duration::from_millis(50), conn.fetch_message()).await;
        assert!(read.is_err());
        drop(conn);

        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.in_use_count(&a), 0);
        assert_eq!(pool.metrics()[&a].closed, 1);

        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(cluster.opened("a:7687"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_deadline_covers_connection_setup() {
        let cluster = FakeCluster::new();
        cluster.server("a:7687").go_silent(true);
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let started = Instant::now();
        let err = pool
            .acquire(&a, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Client(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.in_use_count(&a), 0);
        assert_eq!(pool.metrics()[&a].timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_timeout_bounds_handshake() {
        let cluster = FakeCluster::with_settings(ConnectionSettings {
            connection_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        cluster.server("a:7687").go_silent(true);
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let err = pool.acquire(&a, Duration::from_secs(60), None).await.unwrap_err();
        assert!(matches!(err, DriverError::ServiceUnavailable { .. }), "{err}");
        assert_eq!(pool.in_use_count(&a), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_gives_back_nothing() {
        let cluster = FakeCluster::new();
        let pool = pool(
            &cluster,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );
        let a = addr("a:7687");

        let held = pool.acquire(&a, WAIT, None).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), pool.acquire(&a, WAIT, None)).await;
        assert!(waiting.is_err());
        assert_eq!(pool.in_use_count(&a), 1);

        held.release().await;
        assert_eq!(pool.in_use_count(&a), 0);
        let conn = pool.acquire(&a, Duration::from_millis(50), None).await.unwrap();
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn aborted_acquire_mid_open_returns_permit() {
        let cluster = FakeCluster::new();
        cluster.server("a:7687").go_silent(true);
        let pool = pool(
            &cluster,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );
        let a = addr("a:7687");

        let task = {
            let pool = pool.clone();
            let a = a.clone();
            tokio::spawn(async move { pool.acquire(&a, WAIT, None).await.map(drop) })
        };
        for _ in 0..100 {
            if pool.in_use_count(&a) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.in_use_count(&a), 1);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(pool.in_use_count(&a), 0);
        assert_eq!(pool.metrics()[&a].in_use, 0);

        cluster.server("a:7687").go_silent(false);
        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn full_address_does_not_block_others() {
        let cluster = FakeCluster::new();
        let pool = pool(
            &cluster,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );
        let a = addr("a:7687");
        let b = addr("b:7687");

        let _held = pool.acquire(&a, WAIT, None).await.unwrap();
        let other = pool.acquire(&b, Duration::from_millis(200), None).await.unwrap();
        assert_eq!(other.address(), &b);
        assert_eq!(pool.in_use_count(&a), 1);
        assert_eq!(pool.in_use_count(&b), 1);
    }

    #[tokio::test]
    async fn stale_connections_are_closed_now_or_on_return() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        let first = pool.acquire(&a, WAIT, None).await.unwrap();
        let second = pool.acquire(&a, WAIT, None).await.unwrap();
        first.release().await;
        assert_eq!(pool.idle_count(&a), 1);

        pool.mark_all_stale().await;
        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.metrics()[&a].closed, 1);

        second.release().await;
        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.metrics()[&a].closed, 2);

        let conn = pool.acquire(&a, WAIT, None).await.unwrap();
        conn.release().await;
        assert_eq!(cluster.opened("a:7687"), 3);
        assert_eq!(pool.idle_count(&a), 1);
    }

    #[tokio::test]
    async fn retain_closes_forgotten_addresses() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");
        let b = addr("b:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        drop(pool.acquire(&b, WAIT, None).await.unwrap());
        pool.retain(&[a.clone()]).await;

        assert_eq!(pool.idle_count(&a), 1);
        assert_eq!(pool.idle_count(&b), 0);
        assert_eq!(pool.metrics()[&b].closed, 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let cluster = FakeCluster::new();
        let pool = pool(&cluster, PoolConfig::default());
        let a = addr("a:7687");

        drop(pool.acquire(&a, WAIT, None).await.unwrap());
        pool.close().await;
        assert_eq!(pool.idle_count(&a), 0);
        assert!(matches!(
            pool.acquire(&a, WAIT, None).await,
            Err(DriverError::Client(_))
        ));
    }
}
