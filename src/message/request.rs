//! Client-to-server Bolt messages.

use std::time::Duration;

use crate::types::{BoltDict, BoltValue};

/// A message sent from the client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Initialize connection. Sent once after handshake.
    Hello { extra: BoltDict },

    /// Authenticate after HELLO (Bolt 5.1+).
    Logon { auth: BoltDict },

    /// De-authenticate (Bolt 5.1+).
    Logoff,

    /// Gracefully close the connection.
    Goodbye,

    /// Reset the connection to a clean state, aborting any pending work.
    Reset,

    /// Execute a query (auto-commit or within a transaction).
    Run {
        query: String,
        parameters: BoltDict,
        extra: BoltDict,
    },

    /// Pull results from the last RUN.
    Pull { extra: BoltDict },

    /// Discard results from the last RUN.
    Discard { extra: BoltDict },

    /// Begin an explicit transaction.
    Begin { extra: BoltDict },

    /// Commit the current explicit transaction.
    Commit,

    /// Roll back the current explicit transaction.
    Rollback,

    /// Ask for the routing table of a database (Bolt 4.4+ layout).
    Route {
        routing: BoltDict,
        bookmarks: Vec<String>,
        extra: BoltDict,
    },
}

impl ClientMessage {
    /// Creates a PULL message requesting `n` records (`-1` for all).
    pub fn pull_n(n: i64) -> Self {
        Self::Pull {
            extra: BoltDict::from([("n".to_string(), BoltValue::Integer(n))]),
        }
    }

    pub fn pull_all() -> Self {
        Self::pull_n(-1)
    }

    /// Creates a DISCARD message discarding all remaining records.
    pub fn discard_all() -> Self {
        Self::Discard {
            extra: BoltDict::from([("n".to_string(), BoltValue::Integer(-1))]),
        }
    }

    /// Message name as it appears in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Logon { .. } => "LOGON",
            Self::Logoff => "LOGOFF",
            Self::Goodbye => "GOODBYE",
            Self::Reset => "RESET",
            Self::Run { .. } => "RUN",
            Self::Pull { .. } => "PULL",
            Self::Discard { .. } => "DISCARD",
            Self::Begin { .. } => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Route { .. } => "ROUTE",
        }
    }
}

/// Extra fields shared by BEGIN and auto-commit RUN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionExtra {
    pub bookmarks: Vec<String>,
    pub database: Option<String>,
    pub read_only: bool,
    pub timeout: Option<Duration>,
    pub metadata: BoltDict,
    pub impersonated_user: Option<String>,
}

impl TransactionExtra {
    pub fn into_dict(self) -> BoltDict {
        let mut extra = BoltDict::new();
        if !self.bookmarks.is_empty() {
            extra.insert(
                "bookmarks".into(),
                BoltValue::List(self.bookmarks.into_iter().map(BoltValue::String).collect()),
            );
        }
        if let Some(db) = self.database {
            extra.insert("db".into(), BoltValue::String(db));
        }
        if self.read_only {
            extra.insert("mode".into(), BoltValue::String("r".into()));
        }
        if let Some(timeout) = self.timeout {
            // Rounded up so a sub-millisecond timeout never becomes "no timeout".
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            extra.insert(
                "tx_timeout".into(),
                BoltValue::Integer(i64::try_from(millis).unwrap_or(i64::MAX)),
            );
        }
        if !self.metadata.is_empty() {
            extra.insert("tx_metadata".into(), BoltValue::Dict(self.metadata));
        }
        if let Some(user) = self.impersonated_user {
            extra.insert("imp_user".into(), BoltValue::String(user));
        }
        extra
    }
}
