//! Driver and session configuration.
//!
//! Both configs are plain structs with sensible defaults and a consuming
//! builder:
//!
//! ```
//! use std::time::Duration;
//! use graphwire::config::Config;
//!
//! let config = Config::builder()
//!     .max_connection_pool_size(10)
//!     .connection_acquisition_timeout(Duration::from_secs(5))
//!     .build();
//! assert_eq!(config.max_connection_pool_size, 10);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::types::BoltDict;

/// The user agent sent in HELLO unless configured otherwise.
pub fn default_user_agent() -> String {
    format!("graphwire/{}", env!("CARGO_PKG_VERSION"))
}

/// Whether a session reads or writes; decides which cluster member serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}

/// What to do when every router is unreachable but an expired routing table
/// is still cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleRoutingPolicy {
    /// Report `ServiceUnavailable`.
    #[default]
    Fail,
    /// Keep using the expired table, with a warning.
    ServeExpired,
}

/// Which server certificates an encrypted connection accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trust {
    /// Any certificate. Encrypts, but does not authenticate the server.
    AllCertificates,
    /// Certificates signed by one of the CAs in these PEM files.
    CustomCertificates(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub trust: Trust,
}

/// Driver-wide settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_connection_pool_size: usize,
    pub connection_acquisition_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connection_lifetime: Duration,
    /// Idle connections older than this are checked with RESET before reuse.
    pub liveness_check_timeout: Option<Duration>,
    pub encrypted: bool,
    pub trust: Trust,
    pub max_transaction_retry_time: Duration,
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub user_agent: String,
    /// Records per PULL; `-1` pulls everything at once.
    pub fetch_size: i64,
    pub stale_routing_policy: StaleRoutingPolicy,
    /// Merged with the routing context taken from a `neo4j://` URI query.
    pub routing_context: BoltDict,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// How long an unused routing table outlives its TTL.
    pub routing_table_purge_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connection_pool_size: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            max_connection_lifetime: Duration::from_secs(3600),
            liveness_check_timeout: None,
            encrypted: false,
            trust: Trust::AllCertificates,
            max_transaction_retry_time: Duration::from_secs(30),
            initial_retry_delay: Duration::from_secs(1),
            retry_delay_multiplier: 2.0,
            user_agent: default_user_agent(),
            fetch_size: 1000,
            stale_routing_policy: StaleRoutingPolicy::Fail,
            routing_context: BoltDict::new(),
            read_timeout: None,
            write_timeout: None,
            routing_table_purge_delay: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Self::default(),
        }
    }

    /// Socket settings for every channel the driver opens.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Some(self.connection_timeout),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            tls: self.encrypted.then(|| TlsConfig {
                trust: self.trust.clone(),
            }),
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn max_connection_pool_size(mut self, size: usize) -> Self {
        self.config.max_connection_pool_size = size;
        self
    }

    pub fn connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_acquisition_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_connection_lifetime = lifetime;
        self
    }

    pub fn liveness_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_check_timeout = Some(timeout);
        self
    }

    /// Turns on TLS with the given trust strategy.
    pub fn encrypted(mut self, trust: Trust) -> Self {
        self.config.encrypted = true;
        self.config.trust = trust;
        self
    }

    pub fn max_transaction_retry_time(mut self, budget: Duration) -> Self {
        self.config.max_transaction_retry_time = budget;
        self
    }

    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.config.initial_retry_delay = delay;
        self
    }

    pub fn retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_delay_multiplier = multiplier;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn fetch_size(mut self, size: i64) -> Self {
        self.config.fetch_size = size;
        self
    }

    pub fn stale_routing_policy(mut self, policy: StaleRoutingPolicy) -> Self {
        self.config.stale_routing_policy = policy;
        self
    }

    pub fn routing_context(mut self, context: BoltDict) -> Self {
        self.config.routing_context = context;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    pub fn routing_table_purge_delay(mut self, delay: Duration) -> Self {
        self.config.routing_table_purge_delay = delay;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Target database; `None` is the user's home database.
    pub database: Option<String>,
    pub access_mode: AccessMode,
    /// Bookmarks the session's first transaction must observe.
    pub bookmarks: Vec<String>,
    /// Overrides [`Config::fetch_size`].
    pub fetch_size: Option<i64>,
    pub impersonated_user: Option<String>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn access_mode(mut self, mode: AccessMode) -> Self {
        self.config.access_mode = mode;
        self
    }

    pub fn bookmarks<I, S>(mut self, bookmarks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.bookmarks = bookmarks.into_iter().map(Into::into).collect();
        self
    }

    pub fn fetch_size(mut self, size: i64) -> Self {
        self.config.fetch_size = Some(size);
        self
    }

    pub fn impersonated_user(mut self, user: impl Into<String>) -> Self {
        self.config.impersonated_user = Some(user.into());
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
