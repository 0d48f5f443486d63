//! Explicit transactions.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use uuid::Uuid;

use crate::connection::ConnectionState;
use crate::driver::DriverCore;
use crate::error::DriverError;
use crate::pool::PooledConnection;
use crate::session::bookmarks::Bookmarks;
use crate::session::result::RecordStream;
use crate::types::BoltDict;

/// The future a transaction function returns. It may borrow the transaction
/// it was handed.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 't>>;

/// Settings sent with BEGIN (or with an auto-commit RUN).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionConfig {
    /// Server-side timeout; the server aborts the transaction after it.
    pub timeout: Option<Duration>,
    /// Attached to the transaction for monitoring (`dbms.listTransactions`).
    pub metadata: BoltDict,
}

impl TransactionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: BoltDict) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// A query failed; the server has already rolled back.
    Failed,
}

/// A transaction opened with BEGIN, borrowing its session's connection until
/// it is dropped.
///
/// A transaction dropped while still active is rolled back when its
/// connection is reset on the way back into the pool.
pub struct Transaction<'s> {
    id: Uuid,
    conn: &'s mut PooledConnection,
    bookmarks: &'s mut Bookmarks,
    core: &'s DriverCore,
    database: Option<String>,
    fetch_size: i64,
    state: TransactionState,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(
        conn: &'s mut PooledConnection,
        bookmarks: &'s mut Bookmarks,
        core: &'s DriverCore,
        database: Option<String>,
        fetch_size: i64,
    ) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(transaction = %id, address = %conn.address(), "transaction started");
        Self {
            id,
            conn,
            bookmarks,
            core,
            database,
            fetch_size,
            state: TransactionState::Active,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Runs a query inside the transaction. An earlier result that was not
    /// read to the end is discarded first.
    pub async fn run(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
    ) -> Result<RecordStream<'_>, DriverError> {
        self.check_open()?;
        if let Err(e) = self.conn.discard_pending_results().await {
            return Err(self.failed(e).await);
        }
        RecordStream::start(
            &mut *self.conn,
            self.core,
            None,
            self.database.clone(),
            self.fetch_size,
            query.into(),
            parameters,
            BoltDict::new(),
        )
        .await
    }

    /// Commits and makes the new bookmark the session's only bookmark.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        let outcome = async {
            self.conn.discard_pending_results().await?;
            self.conn.commit().await
        }
        .await;
        match outcome {
            Ok(bookmark) => {
                self.state = TransactionState::Committed;
                if let Some(bookmark) = bookmark {
                    self.bookmarks.advance(bookmark);
                }
                tracing::debug!(transaction = %self.id, "transaction committed");
                Ok(())
            }
            Err(e) => Err(self.failed(e).await),
        }
    }

    /// Rolls back. A transaction that already failed has nothing left to
    /// roll back on the server and simply ends.
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        match self.state {
            TransactionState::Committed => {
                return Err(DriverError::client("transaction has already been committed"));
            }
            TransactionState::RolledBack => {
                return Err(DriverError::client("transaction has already been rolled back"));
            }
            TransactionState::Failed => {
                self.state = TransactionState::RolledBack;
                return Ok(());
            }
            TransactionState::Active => {}
        }
        if self.connection_broken() {
            self.state = TransactionState::RolledBack;
            return Ok(());
        }
        let outcome = async {
            self.conn.discard_pending_results().await?;
            self.conn.rollback().await
        }
        .await;
        self.state = TransactionState::RolledBack;
        match outcome {
            Ok(()) => {
                tracing::debug!(transaction = %self.id, "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                let address = self.conn.address().clone();
                self.core
                    .on_error(&e, &address, self.database.as_deref())
                    .await;
                Err(e)
            }
        }
    }

    /// Rolls back if still active; otherwise does nothing.
    pub async fn close(&mut self) -> Result<(), DriverError> {
        match self.state {
            TransactionState::Active | TransactionState::Failed => self.rollback().await,
            TransactionState::Committed | TransactionState::RolledBack => Ok(()),
        }
    }

    fn connection_broken(&self) -> bool {
        self.conn.is_defunct() || self.conn.state() == ConnectionState::Failed
    }

    fn check_open(&mut self) -> Result<(), DriverError> {
        if self.state == TransactionState::Active && self.connection_broken() {
            self.state = TransactionState::Failed;
        }
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Failed => Err(DriverError::client(
                "transaction has failed and can only be rolled back",
            )),
            TransactionState::Committed => {
                Err(DriverError::client("transaction has already been committed"))
            }
            TransactionState::RolledBack => {
                Err(DriverError::client("transaction has already been rolled back"))
            }
        }
    }

    async fn failed(&mut self, err: DriverError) -> DriverError {
        self.state = TransactionState::Failed;
        let address = self.conn.address().clone();
        self.core
            .on_error(&err, &address, self.database.as_deref())
            .await;
        err
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}
