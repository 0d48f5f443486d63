//! Cluster routing: per-database routing tables, refreshed lazily from the
//! cluster's routers.
//!
//! Each database has its own [`RoutingTable`], looked up by name (the empty
//! name is the user's home database). Readers clone the current `Arc` and
//! never wait; a refresh asks the routers one by one and swaps in the first
//! usable answer. Refreshes are serialized so a burst of sessions hitting an
//! expired table causes a single round of discovery.

pub mod table;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::address::Address;
use crate::config::{AccessMode, StaleRoutingPolicy};
use crate::error::DriverError;
use crate::pool::ConnectionPool;
use crate::types::BoltDict;

pub use table::RoutingTable;

/// Asks one router for a database's routing table.
#[async_trait]
pub trait RouteFetcher: Send + Sync + 'static {
    /// Returns the `rt` dictionary of the ROUTE summary.
    async fn fetch(
        &self,
        router: &Address,
        database: Option<&str>,
        bookmarks: &[String],
        impersonated_user: Option<&str>,
    ) -> Result<BoltDict, DriverError>;
}

/// Fetches routing tables over pooled connections.
#[derive(Debug, Clone)]
pub struct PoolRouteFetcher {
    pool: ConnectionPool,
    routing_context: BoltDict,
    acquisition_timeout: Duration,
    liveness_check_timeout: Option<Duration>,
}

impl PoolRouteFetcher {
    pub fn new(
        pool: ConnectionPool,
        routing_context: BoltDict,
        acquisition_timeout: Duration,
        liveness_check_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            routing_context,
            acquisition_timeout,
            liveness_check_timeout,
        }
    }
}

#[async_trait]
impl RouteFetcher for PoolRouteFetcher {
    async fn fetch(
        &self,
        router: &Address,
        database: Option<&str>,
        bookmarks: &[String],
        impersonated_user: Option<&str>,
    ) -> Result<BoltDict, DriverError> {
        let mut conn = self
            .pool
            .acquire(router, self.acquisition_timeout, self.liveness_check_timeout)
            .await?;
        let result = conn
            .route(
                self.routing_context.clone(),
                bookmarks.to_vec(),
                database,
                impersonated_user,
            )
            .await;
        let broken = conn.is_defunct();
        conn.release().await;
        if broken {
            self.pool.deactivate(router).await;
        }
        result
    }
}

enum Mode {
    Direct(Arc<RoutingTable>),
    Routing {
        initial: Address,
        fetcher: Arc<dyn RouteFetcher>,
        policy: StaleRoutingPolicy,
        purge_delay: Duration,
    },
}

/// Keeps one routing table per database and decides which server serves a
/// session.
pub struct RoutingTableManager {
    mode: Mode,
    tables: RwLock<HashMap<String, Arc<RoutingTable>>>,
    refresh: tokio::sync::Mutex<()>,
}

impl RoutingTableManager {
    /// Routing through a cluster, starting from the seed router `initial`.
    pub fn routing(
        initial: Address,
        fetcher: Arc<dyn RouteFetcher>,
        policy: StaleRoutingPolicy,
        purge_delay: Duration,
    ) -> Self {
        Self {
            mode: Mode::Routing {
                initial,
                fetcher,
                policy,
                purge_delay,
            },
            tables: RwLock::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// A single server for every role; nothing is ever refreshed.
    pub fn direct(address: Address) -> Self {
        Self {
            mode: Mode::Direct(Arc::new(RoutingTable::direct(address))),
            tables: RwLock::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_routing(&self) -> bool {
        matches!(self.mode, Mode::Routing { .. })
    }

    /// The cached table for `database`, fresh or not.
    pub fn table(&self, database: Option<&str>) -> Option<Arc<RoutingTable>> {
        match &self.mode {
            Mode::Direct(table) => Some(table.clone()),
            Mode::Routing { .. } => self.tables.read().get(database.unwrap_or("")).cloned(),
        }
    }

    /// Returns a table that can serve `mode`, refreshing it first if it is
    /// expired or lacks the servers `mode` needs.
    pub async fn ensure_fresh(
        &self,
        database: Option<&str>,
        mode: AccessMode,
        bookmarks: &[String],
        impersonated_user: Option<&str>,
    ) -> Result<Arc<RoutingTable>, DriverError> {
        let Mode::Routing {
            initial,
            fetcher,
            policy,
            purge_delay,
        } = &self.mode
        else {
            return self.table(database).ok_or_else(|| {
                DriverError::service_unavailable("direct driver has no routing table")
            });
        };
        let key = database.unwrap_or("");

        if let Some(table) = self.table(database) {
            if table.is_fresh(mode) {
                return Ok(table);
            }
        }

        let _guard = self.refresh.lock().await;
        self.purge(key, *purge_delay);
        let previous = self.table(database);
        if let Some(table) = &previous {
            if table.is_fresh(mode) {
                return Ok(table.clone());
            }
        }

        let routers = router_order(initial, previous.as_deref());
        match self
            .discover(fetcher.as_ref(), key, &routers, database, bookmarks, impersonated_user)
            .await
        {
            Ok(table) => {
                tracing::debug!(
                    database = key,
                    routers = ?table.routers,
                    readers = ?table.readers,
                    writers = ?table.writers,
                    ttl = ?table.ttl,
                    "routing table updated"
                );
                let table = Arc::new(table);
                self.tables.write().insert(key.to_string(), table.clone());
                Ok(table)
            }
            Err(e) => match previous {
                Some(stale)
                    if *policy == StaleRoutingPolicy::ServeExpired && stale.can_serve(mode) =>
                {
                    tracing::warn!(database = key, error = %e, "serving expired routing table");
                    Ok(stale)
                }
                _ => Err(e),
            },
        }
    }

    async fn discover(
        &self,
        fetcher: &dyn RouteFetcher,
        key: &str,
        routers: &[Address],
        database: Option<&str>,
        bookmarks: &[String],
        impersonated_user: Option<&str>,
    ) -> Result<RoutingTable, DriverError> {
        let mut last_error = None;
        for router in routers {
            let answer = fetcher
                .fetch(router, database, bookmarks, impersonated_user)
                .await
                .and_then(|rt| RoutingTable::parse(key, &rt));
            match answer {
                Ok(table) if table.is_usable() => return Ok(table),
                Ok(_) => {
                    tracing::debug!(router = %router, database = key, "router returned an unusable table");
                    last_error = Some(DriverError::protocol(format!(
                        "{router} returned a routing table without routers or readers"
                    )));
                }
                Err(e) if e.is_fatal_during_discovery() => return Err(e),
                Err(e) => {
                    tracing::debug!(router = %router, database = key, error = %e, "router failed");
                    self.deactivate(router);
                    last_error = Some(e);
                }
            }
        }
        let reason = last_error.map_or_else(|| "no routers known".to_string(), |e| e.to_string());
        Err(DriverError::service_unavailable(format!(
            "unable to retrieve routing information for database '{}': {reason}",
            if key.is_empty() { "<default>" } else { key }
        )))
    }

    /// Picks a server for `mode` from the cached table.
    pub fn select(&self, database: Option<&str>, mode: AccessMode) -> Result<Address, DriverError> {
        self.table(database)
            .ok_or_else(|| {
                DriverError::SessionExpired(format!(
                    "no routing table for database '{}'",
                    database.unwrap_or("<default>")
                ))
            })?
            .select(mode)
    }

    /// Forgets `address` in every table.
    pub fn deactivate(&self, address: &Address) {
        if !self.is_routing() {
            return;
        }
        let mut tables = self.tables.write();
        for table in tables.values_mut() {
            if table.contains(address) {
                *table = Arc::new(table.without(address));
            }
        }
    }

    /// Stops sending writes for `database` to `address`.
    pub fn on_write_failure(&self, database: Option<&str>, address: &Address) {
        if !self.is_routing() {
            return;
        }
        if let Some(table) = self.tables.write().get_mut(database.unwrap_or("")) {
            *table = Arc::new(table.without_writer(address));
        }
    }

    /// Every server address any cached table mentions.
    pub fn known_addresses(&self) -> Vec<Address> {
        let mut out = Vec::new();
        let tables: Vec<Arc<RoutingTable>> = match &self.mode {
            Mode::Direct(table) => vec![table.clone()],
            Mode::Routing { .. } => self.tables.read().values().cloned().collect(),
        };
        for table in tables {
            for address in table.routers.iter().chain(&table.readers).chain(&table.writers) {
                if !out.contains(address) {
                    out.push(address.clone());
                }
            }
        }
        out
    }

    fn purge(&self, keep: &str, delay: Duration) {
        let mut tables = self.tables.write();
        tables.retain(|name, table| {
            let purge = name != keep && table.is_purgeable(delay);
            if purge {
                tracing::debug!(database = %name, "dropping unused routing table");
            }
            !purge
        });
    }
}

impl std::fmt::Debug for RoutingTableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTableManager")
            .field("routing", &self.is_routing())
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Routers to ask, in order: the known routers, then the seed. The seed goes
/// first when the last answer had no writers.
fn router_order(initial: &Address, previous: Option<&RoutingTable>) -> Vec<Address> {
    let Some(table) = previous else {
        return vec![initial.clone()];
    };
    let known = table.routers.iter().filter(|r| *r != initial).cloned();
    if table.initialized_without_writers {
        std::iter::once(initial.clone()).chain(known).collect()
    } else {
        known.chain(std::iter::once(initial.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::ServerError;
    use crate::testkit::routing_table;

    enum Answer {
        Table(BoltDict),
        Unavailable,
        Fatal(&'static str),
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        answers: Mutex<HashMap<Address, VecDeque<Answer>>>,
        calls: Mutex<Vec<Address>>,
    }

    impl ScriptedFetcher {
        fn answer(&self, router: &str, answer: Answer) {
            self.answers
                .lock()
                .entry(addr(router))
                .or_default()
                .push_back(answer);
        }

        fn calls(&self) -> Vec<Address> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RouteFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            router: &Address,
            _database: Option<&str>,
            _bookmarks: &[String],
            _impersonated_user: Option<&str>,
        ) -> Result<BoltDict, DriverError> {
            self.calls.lock().push(router.clone());
            let answer = self
                .answers
                .lock()
                .get_mut(router)
                .and_then(VecDeque::pop_front);
            match answer {
                Some(Answer::Table(rt)) => Ok(rt),
                Some(Answer::Fatal(code)) => {
                    Err(DriverError::from_server_error(ServerError::new(code, "nope")))
                }
                Some(Answer::Unavailable) | None => Err(DriverError::unavailable_at(router, "down")),
            }
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn manager(fetcher: &Arc<ScriptedFetcher>, policy: StaleRoutingPolicy) -> RoutingTableManager {
        RoutingTableManager::routing(
            addr("seed:7687"),
            fetcher.clone(),
            policy,
            Duration::from_secs(30),
        )
    }

    fn cluster_table(ttl: i64) -> BoltDict {
        routing_table(ttl, &["r1:7687", "r2:7687"], &["s1:7687", "s2:7687"], &["w1:7687"])
    }

    #[tokio::test]
    async fn first_use_asks_the_seed() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);

        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();
        assert_eq!(routing.select(None, AccessMode::Read).unwrap(), addr("s1:7687"));
        assert_eq!(routing.select(None, AccessMode::Read).unwrap(), addr("s2:7687"));
        assert_eq!(routing.select(None, AccessMode::Write).unwrap(), addr("w1:7687"));

        // Still fresh: no second round trip.
        routing.ensure_fresh(None, AccessMode::Write, &[], None).await.unwrap();
        assert_eq!(fetcher.calls(), vec![addr("seed:7687")]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_table_refreshes_once_from_known_router() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(10)));
        fetcher.answer(
            "r1:7687",
            Answer::Table(routing_table(10, &["r1:7687"], &["s3:7687"], &["w1:7687"])),
        );
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let table = routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();
        let reader = table.select(AccessMode::Read).unwrap();
        assert_eq!(reader, addr("s3:7687"));
        assert!(table.readers.contains(&reader));
        assert_eq!(fetcher.calls(), vec![addr("seed:7687"), addr("r1:7687")]);
    }

    #[tokio::test]
    async fn failing_router_is_skipped_and_forgotten() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(0)));
        fetcher.answer("r1:7687", Answer::Unavailable);
        fetcher.answer("r2:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);

        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();
        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();
        assert_eq!(
            fetcher.calls(),
            vec![addr("seed:7687"), addr("r1:7687"), addr("r2:7687")]
        );
    }

    #[tokio::test]
    async fn client_errors_fail_discovery_fast() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(0)));
        fetcher.answer("r1:7687", Answer::Fatal("Neo.ClientError.Database.DatabaseNotFound"));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);

        routing.ensure_fresh(Some("movies"), AccessMode::Read, &[], None).await.unwrap();
        let err = routing
            .ensure_fresh(Some("movies"), AccessMode::Read, &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("Neo.ClientError.Database.DatabaseNotFound"));
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn all_routers_down_is_service_unavailable() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        let err = routing
            .ensure_fresh(None, AccessMode::Write, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ServiceUnavailable { .. }), "{err}");
    }

    #[tokio::test]
    async fn stale_table_served_only_when_allowed() {
        for (policy, served) in [
            (StaleRoutingPolicy::Fail, false),
            (StaleRoutingPolicy::ServeExpired, true),
        ] {
            let fetcher = Arc::new(ScriptedFetcher::default());
            fetcher.answer("seed:7687", Answer::Table(cluster_table(0)));
            let routing = manager(&fetcher, policy);
            routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();

            let again = routing.ensure_fresh(None, AccessMode::Read, &[], None).await;
            assert_eq!(again.is_ok(), served, "{policy:?}");
        }
    }

    #[tokio::test]
    async fn seed_goes_first_after_a_table_without_writers() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer(
            "seed:7687",
            Answer::Table(routing_table(300, &["r1:7687"], &["s1:7687"], &[])),
        );
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);

        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();
        routing.ensure_fresh(None, AccessMode::Write, &[], None).await.unwrap();
        assert_eq!(fetcher.calls(), vec![addr("seed:7687"), addr("seed:7687")]);
        assert_eq!(routing.select(None, AccessMode::Write).unwrap(), addr("w1:7687"));
    }

    #[tokio::test]
    async fn write_without_writers_is_session_expired() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        for _ in 0..2 {
            fetcher.answer(
                "seed:7687",
                Answer::Table(routing_table(300, &["seed:7687"], &["s1:7687"], &[])),
            );
        }
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        routing.ensure_fresh(None, AccessMode::Write, &[], None).await.unwrap();
        assert!(matches!(
            routing.select(None, AccessMode::Write),
            Err(DriverError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn deactivation_and_write_failures() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        routing.ensure_fresh(None, AccessMode::Read, &[], None).await.unwrap();

        routing.deactivate(&addr("s1:7687"));
        let table = routing.table(None).unwrap();
        assert_eq!(table.readers, vec![addr("s2:7687")]);

        routing.on_write_failure(None, &addr("w1:7687"));
        let table = routing.table(None).unwrap();
        assert!(table.writers.is_empty());
        assert!(!table.is_fresh(AccessMode::Write));
    }

    #[tokio::test(start_paused = true)]
    async fn unused_tables_are_purged() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(1)));
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        routing.ensure_fresh(Some("a"), AccessMode::Read, &[], None).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        routing.ensure_fresh(Some("b"), AccessMode::Read, &[], None).await.unwrap();
        assert!(routing.table(Some("a")).is_none());
        assert!(routing.table(Some("b")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_lookups_do_not_purge() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        fetcher.answer("seed:7687", Answer::Table(cluster_table(1)));
        fetcher.answer("seed:7687", Answer::Table(cluster_table(300)));
        let routing = manager(&fetcher, StaleRoutingPolicy::Fail);
        routing.ensure_fresh(Some("b"), AccessMode::Read, &[], None).await.unwrap();
        routing.ensure_fresh(Some("a"), AccessMode::Read, &[], None).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        routing.ensure_fresh(Some("b"), AccessMode::Read, &[], None).await.unwrap();
        assert!(routing.table(Some("a")).is_some());
        assert_eq!(fetcher.calls().len(), 2);

        routing.ensure_fresh(Some("c"), AccessMode::Read, &[], None).await.unwrap();
        assert!(routing.table(Some("a")).is_none());
        assert!(routing.table(Some("b")).is_some());
    }

    #[tokio::test]
    async fn direct_mode_serves_one_address() {
        let routing = RoutingTableManager::direct(addr("db:7687"));
        assert!(!routing.is_routing());
        routing.ensure_fresh(None, AccessMode::Write, &[], None).await.unwrap();
        assert_eq!(routing.select(Some("x"), AccessMode::Write).unwrap(), addr("db:7687"));
        assert_eq!(routing.select(None, AccessMode::Read).unwrap(), addr("db:7687"));
    }
}
