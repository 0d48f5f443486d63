//! The driver: owns the connection pool and routing state every session
//! shares.
//!
//! ```no_run
//! use graphwire::{AuthToken, Config, Driver, SessionConfig};
//! use graphwire::types::BoltDict;
//!
//! # async fn demo() -> Result<(), graphwire::DriverError> {
//! let driver = Driver::new(
//!     "neo4j://localhost:7687",
//!     AuthToken::basic("neo4j", "secret"),
//!     Config::default(),
//! )?;
//! driver.verify_connectivity().await?;
//!
//! let mut session = driver.session(SessionConfig::default());
//! let mut result = session.run("RETURN 1 AS n", BoltDict::new()).await?;
//! while let Some(record) = result.next().await {
//!     println!("{:?}", record?.get("n"));
//! }
//! drop(result);
//! session.close().await?;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::Address;
use crate::auth::AuthToken;
use crate::config::{AccessMode, Config, SessionConfig, Trust};
use crate::connection::ConnectionSettings;
use crate::error::DriverError;
use crate::pool::{ConnectionPool, Opener, PoolConfig, PoolMetrics, PooledConnection, TcpOpener};
use crate::routing::{PoolRouteFetcher, RoutingTableManager};
use crate::session::Session;
use crate::types::{BoltDict, BoltValue};

/// State shared by a driver and all of its sessions.
pub(crate) struct DriverCore {
    pub(crate) config: Config,
    pub(crate) pool: ConnectionPool,
    pub(crate) routing: RoutingTableManager,
}

impl DriverCore {
    /// Borrows a connection to a server that can serve `mode` for
    /// `database`, refreshing the routing table first if needed.
    ///
    /// With routing, an unreachable server is dropped from the routing table
    /// and the next candidate is tried; once no candidate is left the error is
    /// [`DriverError::SessionExpired`].
    pub(crate) async fn acquire(
        &self,
        database: Option<&str>,
        mode: AccessMode,
        bookmarks: &[String],
        impersonated_user: Option<&str>,
    ) -> Result<PooledConnection, DriverError> {
        let before = self.routing.table(database);
        let table = self
            .routing
            .ensure_fresh(database, mode, bookmarks, impersonated_user)
            .await?;
        let refreshed = !before.is_some_and(|old| Arc::ptr_eq(&old, &table));
        if refreshed && self.routing.is_routing() {
            self.pool.retain(&self.routing.known_addresses()).await;
        }
        loop {
            let address = self.routing.select(database, mode)?;
            let acquired = self
                .pool
                .acquire(
                    &address,
                    self.config.connection_acquisition_timeout,
                    self.config.liveness_check_timeout,
                )
                .await;
            match acquired {
                Ok(conn) => return Ok(conn),
                Err(
                    e @ (DriverError::ServiceUnavailable { .. } | DriverError::SessionExpired(_)),
                ) if self.routing.is_routing() => {
                    tracing::debug!(address = %address, error = %e, "server unavailable, trying another");
                    self.routing.deactivate(&address);
                    self.pool.deactivate(&address).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Updates routing and pool state after `err` happened on a connection
    /// to `address`.
    pub(crate) async fn on_error(
        &self,
        err: &DriverError,
        address: &Address,
        database: Option<&str>,
    ) {
        if err.is_authorization_expired() {
            tracing::debug!(address = %address, "authorization expired, retiring pooled connections");
            self.pool.mark_all_stale().await;
        } else if err.is_write_failure() {
            tracing::debug!(address = %address, database = ?database, "server no longer accepts writes");
            self.routing.on_write_failure(database, address);
        } else if matches!(
            err,
            DriverError::ServiceUnavailable { .. } | DriverError::IncompleteCommit(_)
        ) {
            self.routing.deactivate(address);
            self.pool.deactivate(address).await;
        }
    }
}

/// Entry point: a pool of connections to one server or one cluster.
///
/// Cheap to clone; clones share the pool. Create one per application.
#[derive(Clone)]
pub struct Driver {
    core: Arc<DriverCore>,
}

impl Driver {
    /// Creates a driver for `uri`. No connection is made until the first
    /// session needs one; use [`Driver::verify_connectivity`] to check
    /// reachability up front.
    ///
    /// Schemes: `bolt://` connects to one server, `neo4j://` routes through a
    /// cluster. A `+s` suffix turns on TLS with certificate verification,
    /// `+ssc` turns on TLS and accepts any certificate. A `neo4j://` URI may
    /// carry a routing context as its query string.
    pub fn new(uri: &str, auth: AuthToken, config: Config) -> Result<Self, DriverError> {
        let target = Target::parse(uri)?;
        let config = target.apply(config)?;
        let settings = ConnectionSettings {
            user_agent: config.user_agent.clone(),
            auth,
            routing_context: target.routing.then(|| config.routing_context.clone()),
            connection_timeout: Some(config.connection_timeout),
        };
        let opener = Arc::new(TcpOpener::new(config.channel_config(), settings));
        Self::build(target, config, opener)
    }

    /// Like [`Driver::new`], but connections come from `opener`, which is
    /// then responsible for authentication. Useful for custom transports
    /// and in-process test servers.
    pub fn with_opener(
        uri: &str,
        config: Config,
        opener: Arc<dyn Opener>,
    ) -> Result<Self, DriverError> {
        let target = Target::parse(uri)?;
        let config = target.apply(config)?;
        Self::build(target, config, opener)
    }

    fn build(target: Target, config: Config, opener: Arc<dyn Opener>) -> Result<Self, DriverError> {
        validate(&config)?;
        let pool = ConnectionPool::new(
            opener,
            PoolConfig {
                max_size: config.max_connection_pool_size,
                max_lifetime: config.max_connection_lifetime,
            },
        );
        let routing = if target.routing {
            let fetcher = PoolRouteFetcher::new(
                pool.clone(),
                config.routing_context.clone(),
                config.connection_acquisition_timeout,
                config.liveness_check_timeout,
            );
            RoutingTableManager::routing(
                target.address.clone(),
                Arc::new(fetcher),
                config.stale_routing_policy,
                config.routing_table_purge_delay,
            )
        } else {
            RoutingTableManager::direct(target.address.clone())
        };
        tracing::info!(
            address = %target.address,
            routing = target.routing,
            encrypted = config.encrypted,
            "driver created"
        );
        Ok(Self {
            core: Arc::new(DriverCore {
                config,
                pool,
                routing,
            }),
        })
    }

    pub fn session(&self, config: SessionConfig) -> Session {
        Session::new(self.core.clone(), config)
    }

    /// Opens (or reuses) a connection to a server able to serve reads,
    /// fetching a routing table first when routing.
    pub async fn verify_connectivity(&self) -> Result<(), DriverError> {
        let conn = self.core.acquire(None, AccessMode::Read, &[], None).await?;
        tracing::debug!(address = %conn.address(), agent = conn.server_agent(), "connectivity verified");
        conn.release().await;
        Ok(())
    }

    /// Closes every pooled connection. Sessions still open fail on their
    /// next request.
    pub async fn close(&self) {
        self.core.pool.close().await;
        tracing::info!("driver closed");
    }

    pub fn is_routing(&self) -> bool {
        self.core.routing.is_routing()
    }

    pub fn is_encrypted(&self) -> bool {
        self.core.config.encrypted
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Pool counters per server address.
    pub fn pool_metrics(&self) -> HashMap<Address, PoolMetrics> {
        self.core.pool.metrics()
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("routing", &self.is_routing())
            .field("pool", &self.core.pool)
            .finish_non_exhaustive()
    }
}

fn validate(config: &Config) -> Result<(), DriverError> {
    if config.max_connection_pool_size == 0 {
        return Err(DriverError::Configuration(
            "max_connection_pool_size must be at least 1".into(),
        ));
    }
    if config.fetch_size == 0 || config.fetch_size < -1 {
        return Err(DriverError::Configuration(format!(
            "fetch_size must be positive or -1, got {}",
            config.fetch_size
        )));
    }
    if !(config.retry_delay_multiplier >= 1.0) {
        return Err(DriverError::Configuration(format!(
            "retry_delay_multiplier must be at least 1.0, got {}",
            config.retry_delay_multiplier
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    /// Whatever `Config::encrypted` says.
    Configured,
    Verified,
    SelfSigned,
}

/// What a connection URI asks for.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    address: Address,
    routing: bool,
    security: Security,
    routing_context: BoltDict,
}

impl Target {
    fn parse(uri: &str) -> Result<Self, DriverError> {
        let invalid = |why: &str| DriverError::Configuration(format!("invalid URI '{uri}': {why}"));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let (routing, security) = match scheme.to_ascii_lowercase().as_str() {
            "bolt" => (false, Security::Configured),
            "bolt+s" => (false, Security::Verified),
            "bolt+ssc" => (false, Security::SelfSigned),
            "neo4j" => (true, Security::Configured),
            "neo4j+s" => (true, Security::Verified),
            "neo4j+ssc" => (true, Security::SelfSigned),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let authority = match location.split_once('/') {
            Some((authority, "")) => authority,
            Some(_) => return Err(invalid("paths are not supported")),
            None => location,
        };
        if authority.contains('@') {
            return Err(invalid("credentials belong in the auth token, not the URI"));
        }
        let address = Address::parse(authority).map_err(|e| invalid(&e.to_string()))?;

        let mut routing_context = BoltDict::new();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            if !routing {
                return Err(invalid("routing context is only allowed for neo4j:// URIs"));
            }
            for pair in query.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                    .ok_or_else(|| invalid(&format!("malformed routing context entry '{pair}'")))?;
                if key == "address" {
                    return Err(invalid("'address' is reserved in the routing context"));
                }
                if routing_context
                    .insert(key.to_string(), BoltValue::from(value))
                    .is_some()
                {
                    return Err(invalid(&format!("duplicate routing context key '{key}'")));
                }
            }
        }
        if routing {
            routing_context.insert(
                "address".into(),
                BoltValue::String(address.to_string()),
            );
        }

        Ok(Self {
            address,
            routing,
            security,
            routing_context,
        })
    }

    /// Folds the URI's security and routing context into `config`.
    fn apply(&self, mut config: Config) -> Result<Config, DriverError> {
        match self.security {
            Security::Configured => {}
            Security::SelfSigned => {
                config.encrypted = true;
                config.trust = Trust::AllCertificates;
            }
            Security::Verified => {
                // No platform certificate store is bundled; verification
                // needs the CA files named in the config.
                if !matches!(config.trust, Trust::CustomCertificates(_)) {
                    return Err(DriverError::Configuration(
                        "+s schemes verify certificates and need Trust::CustomCertificates; \
                         use +ssc to accept any certificate"
                            .into(),
                    ));
                }
                config.encrypted = true;
            }
        }
        if self.routing {
            let mut context = config.routing_context.clone();
            context.extend(self.routing_context.clone());
            config.routing_context = context;
        }
        Ok(config)
    }
}
