//! Blocking API for callers on ordinary threads.
//!
//! The blocking driver owns a multi-threaded tokio runtime and runs the async
//! driver on it; every call blocks the calling thread until done. Results are
//! read eagerly. Managed transactions go through the async retry loop, with
//! the transaction function itself run on the calling thread. Do not call
//! into this module from inside an async context.
//!
//! ```no_run
//! use graphwire::blocking::Driver;
//! use graphwire::{AuthToken, Config, SessionConfig};
//! use graphwire::types::BoltDict;
//!
//! # fn main() -> Result<(), graphwire::DriverError> {
//! let driver = Driver::new("bolt://localhost:7687", AuthToken::none(), Config::default())?;
//! let mut session = driver.session(SessionConfig::default());
//! let result = session.run("RETURN 1 AS n", BoltDict::new())?;
//! assert_eq!(result.records.len(), 1);
//! session.close()?;
//! driver.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};

use crate::address::Address;
use crate::auth::AuthToken;
use crate::config::{AccessMode, Config, SessionConfig};
use crate::driver;
use crate::error::DriverError;
use crate::pool::{Opener, PoolMetrics};
use crate::session::{self, EagerResult, TransactionConfig, TransactionState};
use crate::types::BoltDict;

/// Blocking counterpart of [`crate::Driver`].
#[derive(Clone)]
pub struct Driver {
    inner: driver::Driver,
    runtime: Arc<Runtime>,
}

impl Driver {
    pub fn new(uri: &str, auth: AuthToken, config: Config) -> Result<Self, DriverError> {
        let runtime = runtime()?;
        let inner = driver::Driver::new(uri, auth, config)?;
        Ok(Self { inner, runtime })
    }

    pub fn with_opener(
        uri: &str,
        config: Config,
        opener: Arc<dyn Opener>,
    ) -> Result<Self, DriverError> {
        let runtime = runtime()?;
        let inner = driver::Driver::with_opener(uri, config, opener)?;
        Ok(Self { inner, runtime })
    }

    pub fn session(&self, config: SessionConfig) -> Session {
        Session {
            inner: Some(self.inner.session(config)),
            runtime: self.runtime.clone(),
        }
    }

    pub fn verify_connectivity(&self) -> Result<(), DriverError> {
        self.runtime.block_on(self.inner.verify_connectivity())
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }

    pub fn pool_metrics(&self) -> HashMap<Address, PoolMetrics> {
        self.inner.pool_metrics()
    }

    /// The async driver sharing this driver's pool.
    pub fn as_async(&self) -> &driver::Driver {
        &self.inner
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("inner", &self.inner).finish_non_exhaustive()
    }
}

fn runtime() -> Result<Arc<Runtime>, DriverError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("graphwire")
        .enable_all()
        .build()?;
    Ok(Arc::new(runtime))
}

/// Blocking counterpart of [`crate::Session`].
pub struct Session {
    // Only `None` while dropping.
    inner: Option<session::Session>,
    runtime: Arc<Runtime>,
}

impl Session {
    fn parts(&mut self) -> Result<(&mut session::Session, &Runtime), DriverError> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| DriverError::client("session is closed"))?;
        Ok((inner, &self.runtime))
    }

    /// Runs an auto-commit query and reads the whole result.
    pub fn run(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
    ) -> Result<EagerResult, DriverError> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(async move { inner.run(query, parameters).await?.to_eager_result().await })
    }

    pub fn begin_transaction(
        &mut self,
        config: TransactionConfig,
    ) -> Result<Transaction<'_, '_>, DriverError> {
        let (inner, runtime) = self.parts()?;
        let inner = runtime.block_on(inner.begin_transaction(config))?;
        Ok(Transaction {
            inner: TxRef::Owned(inner),
            handle: runtime.handle().clone(),
        })
    }

    /// Runs `work` in a read transaction, retrying on transient failures.
    pub fn execute_read<F, T>(&mut self, work: F) -> Result<T, DriverError>
    where
        F: FnMut(&mut Transaction<'_, '_>) -> Result<T, DriverError>,
        T: Send + 'static,
    {
        self.execute(AccessMode::Read, TransactionConfig::default(), work)
    }

    /// Runs `work` in a write transaction, retrying on transient failures.
    pub fn execute_write<F, T>(&mut self, work: F) -> Result<T, DriverError>
    where
        F: FnMut(&mut Transaction<'_, '_>) -> Result<T, DriverError>,
        T: Send + 'static,
    {
        self.execute(AccessMode::Write, TransactionConfig::default(), work)
    }

    /// Blocking form of [`crate::Session::execute`]: same commit, rollback
    /// and retry rules.
    pub fn execute<F, T>(
        &mut self,
        mode: AccessMode,
        tx_config: TransactionConfig,
        mut work: F,
    ) -> Result<T, DriverError>
    where
        F: FnMut(&mut Transaction<'_, '_>) -> Result<T, DriverError>,
        T: Send + 'static,
    {
        let (inner, runtime) = self.parts()?;
        let handle = runtime.handle().clone();
        runtime.block_on(inner.execute(mode, tx_config, |tx| {
            // Leaves the runtime context so `work` may block on it again.
            let result = tokio::task::block_in_place(|| {
                let mut tx = Transaction {
                    inner: TxRef::Borrowed(tx),
                    handle: handle.clone(),
                };
                work(&mut tx)
            });
            Box::pin(std::future::ready(result))
        }))
    }

    pub fn last_bookmarks(&self) -> Vec<String> {
        self.inner
            .as_ref()
            .map(session::Session::last_bookmarks)
            .unwrap_or_default()
    }

    pub fn close(&mut self) -> Result<(), DriverError> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(inner.close())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Returning the connection may spawn cleanup, which needs the runtime.
        let _guard = self.runtime.enter();
        self.inner.take();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("inner", &self.inner).finish_non_exhaustive()
    }
}

/// Blocking counterpart of [`crate::Transaction`].
///
/// Either owns the async transaction (explicit transactions) or borrows the
/// one a managed transaction handed to its function.
pub struct Transaction<'t, 's> {
    inner: TxRef<'t, 's>,
    handle: Handle,
}

enum TxRef<'t, 's> {
    Owned(session::Transaction<'s>),
    Borrowed(&'t mut session::Transaction<'s>),
}

impl<'s> TxRef<'_, 's> {
    fn get(&self) -> &session::Transaction<'s> {
        match self {
            Self::Owned(tx) => tx,
            Self::Borrowed(tx) => tx,
        }
    }

    fn get_mut(&mut self) -> &mut session::Transaction<'s> {
        match self {
            Self::Owned(tx) => tx,
            Self::Borrowed(tx) => tx,
        }
    }
}

impl Transaction<'_, '_> {
    pub fn run(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
    ) -> Result<EagerResult, DriverError> {
        let inner = self.inner.get_mut();
        self.handle
            .block_on(async move { inner.run(query, parameters).await?.to_eager_result().await })
    }

    pub fn commit(&mut self) -> Result<(), DriverError> {
        self.handle.block_on(self.inner.get_mut().commit())
    }

    pub fn rollback(&mut self) -> Result<(), DriverError> {
        self.handle.block_on(self.inner.get_mut().rollback())
    }

    pub fn close(&mut self) -> Result<(), DriverError> {
        self.handle.block_on(self.inner.get_mut().close())
    }

    pub fn state(&self) -> TransactionState {
        self.inner.get().state()
    }
}

impl std::fmt::Debug for Transaction<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.inner.get(), f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testkit::{FakeCluster, Reply};
    use crate::types::BoltValue;

    fn driver(cluster: &FakeCluster) -> Driver {
        let config = Config::builder()
            .initial_retry_delay(Duration::from_millis(5))
            .build();
        Driver::with_opener("bolt://db:7687", config, Arc::new(cluster.clone())).unwrap()
    }

    #[test]
    fn run_reads_everything() {
        let cluster = FakeCluster::new();
        cluster.server("db:7687").push_reply(Reply::records(
            &["n"],
            vec![vec![BoltValue::Integer(1)], vec![BoltValue::Integer(2)]],
        ));
        let driver = driver(&cluster);
        driver.verify_connectivity().unwrap();

        let mut session = driver.session(SessionConfig::builder().fetch_size(1).build());
        let result = session.run("UNWIND [1, 2] AS n RETURN n", BoltDict::new()).unwrap();
        assert_eq!(result.keys, vec!["n".to_string()]);
        assert_eq!(result.records.len(), 2);
        assert!(result.summary.bookmark.is_some());
        assert_eq!(session.last_bookmarks().len(), 1);
        session.close().unwrap();
        driver.close();
    }

    #[test]
    fn explicit_transaction_commits() {
        let cluster = FakeCluster::new();
        let server = cluster.server("db:7687");
        let driver = driver(&cluster);
        let mut session = driver.session(SessionConfig::default());

        let mut tx = session.begin_transaction(TransactionConfig::default()).unwrap();
        tx.run("CREATE (n)", BoltDict::new()).unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        drop(tx);

        assert_eq!(server.count("COMMIT"), 1);
        assert_eq!(session.last_bookmarks().len(), 1);
    }

    #[test]
    fn managed_transactions_retry() {
        let cluster = FakeCluster::new();
        let server = cluster.server("db:7687");
        server.push_reply(Reply::failure(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        ));
        server.push_reply(Reply::records(&["n"], vec![vec![BoltValue::Integer(3)]]));
        let driver = driver(&cluster);
        let mut session = driver.session(SessionConfig::default());

        let mut calls = 0;
        let n = session
            .execute_write(|tx| {
                calls += 1;
                let result = tx.run("RETURN 3 AS n", BoltDict::new())?;
                Ok(result.records[0].get("n").and_then(BoltValue::as_int))
            })
            .unwrap();

        assert_eq!(n, Some(3));
        assert_eq!(calls, 2);
        assert_eq!(server.count("COMMIT"), 1);
    }

    #[test]
    fn failed_work_is_rolled_back_once() {
        let cluster = FakeCluster::new();
        let server = cluster.server("db:7687");
        let driver = driver(&cluster);
        let mut session = driver.session(SessionConfig::default());

        let mut calls = 0;
        let err = session
            .execute_write(|tx| {
                calls += 1;
                tx.run("CREATE (n)", BoltDict::new())?;
                Err::<(), _>(DriverError::client("changed my mind"))
            })
            .unwrap_err();

        assert!(matches!(err, DriverError::Client(_)));
        assert_eq!(calls, 1);
        assert_eq!(server.count("ROLLBACK"), 1);
        assert_eq!(server.count("COMMIT"), 0);
        assert!(session.last_bookmarks().is_empty());
    }

    #[test]
    fn dropping_a_session_returns_its_connection() {
        let cluster = FakeCluster::new();
        let driver = driver(&cluster);
        let mut session = driver.session(SessionConfig::default());
        let mut tx = session.begin_transaction(TransactionConfig::default()).unwrap();
        tx.run("CREATE (n)", BoltDict::new()).unwrap();
        drop(tx);
        drop(session);

        let address = Address::new("db", 7687);
        // The abandoned transaction is reset on a runtime task.
        for _ in 0..200 {
            let metrics = driver.pool_metrics()[&address].clone();
            if metrics.idle == 1 && metrics.in_use == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(driver.pool_metrics()[&address].idle, 1);
        assert_eq!(driver.pool_metrics()[&address].in_use, 0);
    }
}
