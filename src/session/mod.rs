//! Sessions: auto-commit queries, explicit transactions and retried
//! transaction functions, chained together by bookmarks.
//!
//! A session borrows one connection at a time from the pool. Auto-commit
//! queries and transactions each pick a server for the session's access mode
//! when they start, so a session follows the cluster as its routing table
//! changes. The bookmark of every finished unit of work is kept and sent with
//! the next one, which makes a session causally consistent even when its work
//! lands on different cluster members.

pub mod bookmarks;
pub mod result;
pub mod retry;
pub mod transaction;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{AccessMode, SessionConfig};
use crate::connection::ConnectionState;
use crate::driver::DriverCore;
use crate::error::DriverError;
use crate::message::TransactionExtra;
use crate::pool::PooledConnection;
use crate::types::BoltDict;

pub use bookmarks::Bookmarks;
pub use result::{Counters, EagerResult, QueryType, Record, RecordStream, ResultSummary};
pub use retry::{RetryPolicy, RetryState};
pub use transaction::{Transaction, TransactionConfig, TransactionState, TxFuture};

/// A logical sequence of work against one database.
///
/// Methods take `&mut self`: a session is used by one task at a time. Open
/// as many sessions as there are concurrent units of work; they are cheap.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    core: Arc<DriverCore>,
    conn: Option<PooledConnection>,
    bookmarks: Bookmarks,
    fetch_size: i64,
    closed: bool,
}

impl Session {
    pub(crate) fn new(core: Arc<DriverCore>, config: SessionConfig) -> Self {
        let bookmarks = config.bookmarks.iter().cloned().collect();
        let fetch_size = config.fetch_size.unwrap_or(core.config.fetch_size);
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, database = ?config.database, mode = ?config.access_mode, "session opened");
        Self {
            id,
            config,
            core,
            conn: None,
            bookmarks,
            fetch_size,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs an auto-commit query.
    ///
    /// RUN and the first PULL go out together; records are pulled in batches
    /// of the session's fetch size as the stream is read.
    pub async fn run(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
    ) -> Result<RecordStream<'_>, DriverError> {
        self.run_with_config(query, parameters, TransactionConfig::default())
            .await
    }

    /// Like [`Session::run`], with a timeout and metadata for the implicit
    /// transaction.
    pub async fn run_with_config(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
        tx_config: TransactionConfig,
    ) -> Result<RecordStream<'_>, DriverError> {
        self.ensure_open()?;
        self.release_connection().await?;
        let mode = self.config.access_mode;
        let extra = TransactionExtra {
            bookmarks: self.bookmarks.to_vec(),
            database: self.config.database.clone(),
            read_only: mode == AccessMode::Read,
            timeout: tx_config.timeout,
            metadata: tx_config.metadata,
            impersonated_user: self.config.impersonated_user.clone(),
        }
        .into_dict();

        let pooled = self.connect(mode).await?;
        let conn = self.conn.insert(pooled);
        RecordStream::start(
            conn,
            &self.core,
            Some(&mut self.bookmarks),
            self.config.database.clone(),
            self.fetch_size,
            query.into(),
            parameters,
            extra,
        )
        .await
    }

    /// Begins an explicit transaction in the session's access mode.
    pub async fn begin_transaction(
        &mut self,
        tx_config: TransactionConfig,
    ) -> Result<Transaction<'_>, DriverError> {
        self.begin_in_mode(self.config.access_mode, tx_config).await
    }

    /// Runs `work` in a read transaction, retrying on transient failures.
    ///
    /// `work` may be invoked several times and must be safe to repeat.
    ///
    /// ```no_run
    /// # use graphwire::{Driver, SessionConfig, DriverError};
    /// # use graphwire::types::BoltDict;
    /// # async fn demo(driver: Driver) -> Result<(), DriverError> {
    /// let mut session = driver.session(SessionConfig::default());
    /// let names = session
    ///     .execute_read(|tx| {
    ///         Box::pin(async move {
    ///             let mut result = tx.run("MATCH (p:Person) RETURN p.name", BoltDict::new()).await?;
    ///             result.collect().await
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_read<F, T>(&mut self, work: F) -> Result<T, DriverError>
    where
        F: for<'t, 's> FnMut(&'t mut Transaction<'s>) -> TxFuture<'t, T>,
    {
        self.execute(AccessMode::Read, TransactionConfig::default(), work)
            .await
    }

    /// Runs `work` in a write transaction, retrying on transient failures.
    pub async fn execute_write<F, T>(&mut self, work: F) -> Result<T, DriverError>
    where
        F: for<'t, 's> FnMut(&'t mut Transaction<'s>) -> TxFuture<'t, T>,
    {
        self.execute(AccessMode::Write, TransactionConfig::default(), work)
            .await
    }

    /// Runs a transaction function with explicit mode and settings.
    ///
    /// Each attempt begins a fresh transaction; `work` returning `Ok`
    /// commits it (unless `work` ended it itself), returning `Err` rolls it
    /// back. Retryable failures are retried with exponential backoff until
    /// the driver's retry budget is spent; the last error is then returned
    /// unchanged.
    pub async fn execute<F, T>(
        &mut self,
        mode: AccessMode,
        tx_config: TransactionConfig,
        mut work: F,
    ) -> Result<T, DriverError>
    where
        F: for<'t, 's> FnMut(&'t mut Transaction<'s>) -> TxFuture<'t, T>,
    {
        self.ensure_open()?;
        let mut retry = RetryState::new(self.retry_policy());
        let mut attempt: u32 = 1;
        loop {
            let outcome = self.attempt(mode, tx_config.clone(), &mut work).await;
            let released = self.release_connection().await;
            let err = match outcome {
                Ok(value) => {
                    if let Err(e) = released {
                        tracing::debug!(session = %self.id, error = %e, "releasing connection after commit failed");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            match retry.next_delay(&err) {
                Some(delay) => {
                    tracing::warn!(
                        session = %self.id,
                        attempt,
                        error = %err,
                        delay = ?delay,
                        "transaction function failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    if attempt > 1 {
                        tracing::debug!(session = %self.id, attempt, error = %err, "giving up on transaction function");
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<F, T>(
        &mut self,
        mode: AccessMode,
        tx_config: TransactionConfig,
        work: &mut F,
    ) -> Result<T, DriverError>
    where
        F: for<'t, 's> FnMut(&'t mut Transaction<'s>) -> TxFuture<'t, T>,
    {
        let mut tx = self.begin_in_mode(mode, tx_config).await?;
        match work(&mut tx).await {
            Ok(value) => {
                if matches!(
                    tx.state(),
                    TransactionState::Active | TransactionState::Failed
                ) {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(close_err) = tx.close().await {
                    tracing::debug!(transaction = %tx.id(), error = %close_err, "rollback after failed work failed");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn begin_in_mode(
        &mut self,
        mode: AccessMode,
        tx_config: TransactionConfig,
    ) -> Result<Transaction<'_>, DriverError> {
        self.ensure_open()?;
        self.release_connection().await?;
        let extra = TransactionExtra {
            bookmarks: self.bookmarks.to_vec(),
            database: self.config.database.clone(),
            read_only: mode == AccessMode::Read,
            timeout: tx_config.timeout,
            metadata: tx_config.metadata,
            impersonated_user: self.config.impersonated_user.clone(),
        }
        .into_dict();

        let pooled = self.connect(mode).await?;
        let conn = self.conn.insert(pooled);
        if let Err(e) = conn.begin(extra).await {
            let address = conn.address().clone();
            self.core
                .on_error(&e, &address, self.config.database.as_deref())
                .await;
            return Err(e);
        }
        Ok(Transaction::new(
            conn,
            &mut self.bookmarks,
            &self.core,
            self.config.database.clone(),
            self.fetch_size,
        ))
    }

    /// The bookmarks the next unit of work will wait for: the initial
    /// bookmarks plus the bookmark of everything committed so far.
    pub fn last_bookmarks(&self) -> Vec<String> {
        self.bookmarks.to_vec()
    }

    /// Discards an unfinished result, rolls back an unfinished transaction
    /// and returns the connection to the pool. Further use fails.
    pub async fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        let released = self.release_connection().await;
        self.closed = true;
        tracing::debug!(session = %self.id, "session closed");
        released
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.core.config)
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::client("session is closed"));
        }
        Ok(())
    }

    async fn connect(&self, mode: AccessMode) -> Result<PooledConnection, DriverError> {
        let bookmarks = self.bookmarks.to_vec();
        self.core
            .acquire(
                self.config.database.as_deref(),
                mode,
                &bookmarks,
                self.config.impersonated_user.as_deref(),
            )
            .await
    }

    /// Finishes whatever the current connection is doing and hands it back
    /// to the pool. An auto-commit result still being streamed is discarded
    /// and its bookmark kept.
    pub(crate) async fn release_connection(&mut self) -> Result<(), DriverError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let state = conn.state();
        let drainable = !conn.is_defunct()
            && !state.in_transaction()
            && state != ConnectionState::Failed;
        let drained = if drainable {
            result::drain(&mut conn).await
        } else {
            Ok(None)
        };
        let outcome = match drained {
            Ok(Some(bookmark)) => {
                self.bookmarks.advance(bookmark);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                let address = conn.address().clone();
                self.core
                    .on_error(&e, &address, self.config.database.as_deref())
                    .await;
                Err(e)
            }
        };
        conn.release().await;
        outcome
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("database", &self.config.database)
            .field("access_mode", &self.config.access_mode)
            .field("bookmarks", &self.bookmarks)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
