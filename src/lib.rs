//! graphwire: a pure-Rust Bolt client runtime for graph database clusters.
//!
//! The crate speaks the Bolt binary protocol (versions 4.4 and 5.0 to 5.4),
//! pools connections per server, follows cluster topology through routing
//! tables and runs transactions with bookmark-based causal consistency and
//! automatic retries.
//!
//! # Architecture
//!
//! - **`packstream`**: binary encoding/decoding of values
//! - **`chunk`**: message framing (2-byte length-prefixed chunks)
//! - **`message`**: protocol messages in both directions
//! - **`types`**: Bolt values (scalars, graph structures, temporal, spatial)
//! - **`channel`**: one TCP or TLS stream with timeouts
//! - **`connection`**: handshake, authentication and request pipelining
//! - **`pool`**: per-address connection pools
//! - **`routing`**: per-database routing tables
//! - **`session`**: auto-commit queries, transactions, retries, bookmarks
//! - **`driver`**: the entry point tying it together
//! - **`blocking`**: the same API for callers without an async runtime
//!
//! # Example
//!
//! ```no_run
//! use graphwire::{AuthToken, Config, Driver, SessionConfig};
//! use graphwire::types::{BoltDict, BoltValue};
//!
//! # async fn demo() -> Result<(), graphwire::DriverError> {
//! let driver = Driver::new("neo4j://localhost", AuthToken::basic("neo4j", "secret"), Config::default())?;
//! let mut session = driver.session(SessionConfig::default());
//!
//! let created = session
//!     .execute_write(|tx| {
//!         Box::pin(async move {
//!             let params = BoltDict::from([("name".to_string(), BoltValue::from("Ada"))]);
//!             let summary = tx.run("CREATE (:Person {name: $name})", params).await?.consume().await?;
//!             Ok(summary.counters.nodes_created)
//!         })
//!     })
//!     .await?;
//! assert_eq!(created, 1);
//!
//! session.close().await?;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod auth;
pub mod blocking;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod message;
pub mod packstream;
pub mod pool;
pub mod routing;
pub mod session;
pub mod types;
pub mod version;

#[cfg(any(test, feature = "testkit"))]
#[doc(hidden)]
pub mod testkit;

pub use address::Address;
pub use auth::AuthToken;
pub use config::{AccessMode, Config, SessionConfig, StaleRoutingPolicy, Trust};
pub use driver::Driver;
pub use error::{DriverError, ServerError};
pub use session::{
    Bookmarks, EagerResult, Record, RecordStream, ResultSummary, Session, Transaction,
    TransactionConfig,
    TxFuture,
};
