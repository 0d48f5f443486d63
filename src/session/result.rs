//! Query results: records, summaries and the lazily-pulled record stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::connection::Connection;
use crate::driver::DriverCore;
use crate::error::DriverError;
use crate::message::ServerMessage;
use crate::pool::PooledConnection;
use crate::session::bookmarks::Bookmarks;
use crate::types::{BoltDict, BoltValue};

/// One row of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    keys: Arc<Vec<String>>,
    values: Vec<BoltValue>,
}

impl Record {
    pub fn new(keys: Arc<Vec<String>>, values: Vec<BoltValue>) -> Self {
        Self { keys, values }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[BoltValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<BoltValue> {
        self.values
    }

    pub fn get(&self, key: &str) -> Option<&BoltValue> {
        let index = self.keys.iter().position(|k| k == key)?;
        self.values.get(index)
    }

    pub fn get_index(&self, index: usize) -> Option<&BoltValue> {
        self.values.get(index)
    }

    /// The record as a map from column name to value.
    pub fn data(&self) -> BoltDict {
        self.keys
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What kind of work a query did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    SchemaWrite,
}

impl QueryType {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "r" => Some(Self::ReadOnly),
            "rw" => Some(Self::ReadWrite),
            "w" => Some(Self::WriteOnly),
            "s" => Some(Self::SchemaWrite),
            _ => None,
        }
    }
}

/// Update statistics reported in the summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub nodes_created: i64,
    pub nodes_deleted: i64,
    pub relationships_created: i64,
    pub relationships_deleted: i64,
    pub properties_set: i64,
    pub labels_added: i64,
    pub labels_removed: i64,
    pub indexes_added: i64,
    pub indexes_removed: i64,
    pub constraints_added: i64,
    pub constraints_removed: i64,
    pub system_updates: i64,
    /// Set by the server; otherwise derived from the other counters.
    pub contains_updates: bool,
    pub contains_system_updates: bool,
}

impl Counters {
    fn from_stats(stats: &BoltDict) -> Self {
        let get = |key: &str| stats.get(key).and_then(BoltValue::as_int).unwrap_or(0);
        let mut counters = Self {
            nodes_created: get("nodes-created"),
            nodes_deleted: get("nodes-deleted"),
            relationships_created: get("relationships-created"),
            relationships_deleted: get("relationships-deleted"),
            properties_set: get("properties-set"),
            labels_added: get("labels-added"),
            labels_removed: get("labels-removed"),
            indexes_added: get("indexes-added"),
            indexes_removed: get("indexes-removed"),
            constraints_added: get("constraints-added"),
            constraints_removed: get("constraints-removed"),
            system_updates: get("system-updates"),
            contains_updates: false,
            contains_system_updates: false,
        };
        counters.contains_updates = stats
            .get("contains-updates")
            .and_then(BoltValue::as_bool)
            .unwrap_or_else(|| {
                [
                    counters.nodes_created,
                    counters.nodes_deleted,
                    counters.relationships_created,
                    counters.relationships_deleted,
                    counters.properties_set,
                    counters.labels_added,
                    counters.labels_removed,
                    counters.indexes_added,
                    counters.indexes_removed,
                    counters.constraints_added,
                    counters.constraints_removed,
                ]
                .iter()
                .any(|n| *n > 0)
            });
        counters.contains_system_updates = stats
            .get("contains-system-updates")
            .and_then(BoltValue::as_bool)
            .unwrap_or(counters.system_updates > 0);
        counters
    }
}

/// Everything the server said about a finished query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    /// RUN and final PULL/DISCARD metadata, merged.
    pub metadata: BoltDict,
    pub bookmark: Option<String>,
    pub database: Option<String>,
    pub query_type: Option<QueryType>,
    pub counters: Counters,
    pub server: Address,
    pub result_available_after: Option<Duration>,
    pub result_consumed_after: Option<Duration>,
}

impl ResultSummary {
    fn new(server: Address, mut metadata: BoltDict, last: BoltDict) -> Self {
        metadata.extend(last);
        let millis = |key: &str| {
            metadata
                .get(key)
                .and_then(BoltValue::as_int)
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis)
        };
        let result_available_after = millis("t_first");
        let result_consumed_after = millis("t_last");
        let text = |key: &str| metadata.get(key).and_then(BoltValue::as_str).map(str::to_string);
        let bookmark = text("bookmark");
        let database = text("db");
        let query_type = metadata
            .get("type")
            .and_then(BoltValue::as_str)
            .and_then(QueryType::from_code);
        let counters = metadata
            .get("stats")
            .and_then(BoltValue::as_dict)
            .map(Counters::from_stats)
            .unwrap_or_default();
        Self {
            metadata,
            bookmark,
            database,
            query_type,
            counters,
            server,
            result_available_after,
            result_consumed_after,
        }
    }
}

/// A result read to the end: its columns, every record and the summary.
#[derive(Debug, Clone, PartialEq)]
pub struct EagerResult {
    pub keys: Vec<String>,
    pub records: Vec<Record>,
    pub summary: ResultSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A PULL is in flight; records and its summary are coming.
    Pulling,
    /// The last batch ended with `has_more`; the next read sends PULL.
    Paused,
    Done,
}

/// Records of one query, pulled from the server in batches as they are
/// read.
///
/// The stream borrows the connection it reads from, so the session (or
/// transaction) that produced it cannot be used until the stream is
/// dropped. Results not read to the end are discarded by the next operation
/// on the owner.
pub struct RecordStream<'a> {
    conn: &'a mut PooledConnection,
    core: &'a DriverCore,
    bookmarks: Option<&'a mut Bookmarks>,
    database: Option<String>,
    keys: Arc<Vec<String>>,
    buffer: VecDeque<Record>,
    fetch_size: i64,
    phase: Phase,
    run_metadata: BoltDict,
    summary: Option<ResultSummary>,
}

impl<'a> RecordStream<'a> {
    /// Sends RUN and the first PULL in one flush and waits for RUN's reply.
    /// `bookmarks` is set for auto-commit queries, whose summary carries the
    /// bookmark the session must remember.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start(
        conn: &'a mut PooledConnection,
        core: &'a DriverCore,
        bookmarks: Option<&'a mut Bookmarks>,
        database: Option<String>,
        fetch_size: i64,
        query: String,
        parameters: BoltDict,
        extra: BoltDict,
    ) -> Result<Self, DriverError> {
        let mut stream = Self {
            conn,
            core,
            bookmarks,
            database,
            keys: Arc::new(Vec::new()),
            buffer: VecDeque::new(),
            fetch_size,
            phase: Phase::Pulling,
            run_metadata: BoltDict::new(),
            summary: None,
        };
        tracing::debug!(address = %stream.conn.address(), query = %query, "running query");

        let sent = async {
            stream.conn.run(query, parameters, extra)?;
            stream.conn.pull(fetch_size)?;
            stream.conn.send_all().await?;
            stream.conn.fetch_summary().await
        }
        .await;
        match sent {
            Ok(metadata) => {
                let keys = metadata
                    .get("fields")
                    .and_then(BoltValue::as_list)
                    .map(|fields| {
                        fields
                            .iter()
                            .filter_map(BoltValue::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                stream.keys = Arc::new(keys);
                stream.run_metadata = metadata;
                Ok(stream)
            }
            Err(e) => Err(stream.fail(e).await),
        }
    }

    /// Column names, in order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The next record, or `None` once the result is exhausted (or failed).
    pub async fn next(&mut self) -> Option<Result<Record, DriverError>> {
        match self.fill().await {
            Ok(true) => self.buffer.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Up to `n` more records.
    pub async fn fetch(&mut self, n: usize) -> Result<Vec<Record>, DriverError> {
        let mut out = Vec::new();
        while out.len() < n {
            match self.next().await {
                Some(record) => out.push(record?),
                None => break,
            }
        }
        Ok(out)
    }

    /// The next record without consuming it.
    pub async fn peek(&mut self) -> Result<Option<&Record>, DriverError> {
        self.fill().await?;
        Ok(self.buffer.front())
    }

    /// The only record of the result. Anything other than exactly one record
    /// is an error; the rest of the result is discarded either way.
    pub async fn single(&mut self) -> Result<Record, DriverError> {
        let Some(record) = self.next().await.transpose()? else {
            return Err(DriverError::client(
                "expected exactly one record, found none",
            ));
        };
        if self.next().await.transpose()?.is_some() {
            self.consume().await?;
            return Err(DriverError::client(
                "expected exactly one record, found more",
            ));
        }
        Ok(record)
    }

    /// The first record, if any. Finding none or more than one is logged
    /// rather than treated as an error; the rest of the result is discarded.
    pub async fn single_lenient(&mut self) -> Result<Option<Record>, DriverError> {
        let first = self.next().await.transpose()?;
        if first.is_none() {
            tracing::warn!("expected a single record, found none");
            return Ok(None);
        }
        if self.peek().await?.is_some() {
            tracing::warn!("expected a single record, found more; ignoring the rest");
            self.consume().await?;
        }
        Ok(first)
    }

    /// Every remaining record.
    pub async fn collect(&mut self) -> Result<Vec<Record>, DriverError> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await {
            out.push(record?);
        }
        Ok(out)
    }

    /// Column `key` of every remaining record, `Null` where it is missing.
    pub async fn value(&mut self, key: &str) -> Result<Vec<BoltValue>, DriverError> {
        let records = self.collect().await?;
        Ok(records
            .iter()
            .map(|record| record.get(key).cloned().unwrap_or(BoltValue::Null))
            .collect())
    }

    /// The given columns of every remaining record, in the order asked for.
    pub async fn values(&mut self, keys: &[&str]) -> Result<Vec<Vec<BoltValue>>, DriverError> {
        let records = self.collect().await?;
        Ok(records
            .iter()
            .map(|record| {
                keys.iter()
                    .map(|key| record.get(key).cloned().unwrap_or(BoltValue::Null))
                    .collect()
            })
            .collect())
    }

    /// Every remaining record as a column-to-value map.
    pub async fn data(&mut self) -> Result<Vec<BoltDict>, DriverError> {
        Ok(self.collect().await?.iter().map(Record::data).collect())
    }

    /// Reads the rest of the result together with its summary.
    pub async fn to_eager_result(&mut self) -> Result<EagerResult, DriverError> {
        let records = self.collect().await?;
        let summary = self.consume().await?;
        Ok(EagerResult {
            keys: self.keys.to_vec(),
            records,
            summary,
        })
    }

    /// Discards whatever has not been read and returns the summary.
    pub async fn consume(&mut self) -> Result<ResultSummary, DriverError> {
        self.buffer.clear();
        loop {
            match self.phase {
                Phase::Done => break,
                Phase::Pulling => {
                    self.read_one().await?;
                    self.buffer.clear();
                }
                Phase::Paused => {
                    let discarded = async {
                        self.conn.discard(-1)?;
                        self.conn.send_all().await?;
                        self.conn.fetch_summary().await
                    }
                    .await;
                    match discarded {
                        Ok(metadata) => self.finish(metadata),
                        Err(e) => return Err(self.fail(e).await),
                    }
                }
            }
        }
        self.summary.clone().ok_or_else(|| {
            DriverError::client("result failed before its summary was received")
        })
    }

    /// The bookmark of an auto-commit query, once its summary has arrived.
    pub fn bookmark(&self) -> Option<&str> {
        self.summary.as_ref()?.bookmark.as_deref()
    }

    /// The summary, once the result has been read to the end.
    pub fn summary(&self) -> Option<&ResultSummary> {
        self.summary.as_ref()
    }

    /// Ensures the buffer holds a record if the result has one left.
    async fn fill(&mut self) -> Result<bool, DriverError> {
        while self.buffer.is_empty() {
            match self.phase {
                Phase::Done => return Ok(false),
                Phase::Pulling => self.read_one().await?,
                Phase::Paused => {
                    let pulled = async {
                        self.conn.pull(self.fetch_size)?;
                        self.conn.send_all().await
                    }
                    .await;
                    if let Err(e) = pulled {
                        return Err(self.fail(e).await);
                    }
                    self.phase = Phase::Pulling;
                }
            }
        }
        Ok(true)
    }

    async fn read_one(&mut self) -> Result<(), DriverError> {
        match self.conn.fetch_message().await {
            Ok(ServerMessage::Record { data }) => {
                self.buffer.push_back(Record::new(self.keys.clone(), data));
                Ok(())
            }
            Ok(ServerMessage::Success { metadata }) => {
                let has_more = metadata
                    .get("has_more")
                    .and_then(BoltValue::as_bool)
                    .unwrap_or(false);
                if has_more {
                    self.phase = Phase::Paused;
                } else {
                    self.finish(metadata);
                }
                Ok(())
            }
            Ok(ServerMessage::Ignored) => Err(self
                .fail(DriverError::client("result was ignored after an earlier failure"))
                .await),
            Ok(ServerMessage::Failure { metadata }) => {
                Err(self.fail(DriverError::from_failure(&metadata)).await)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    fn finish(&mut self, metadata: BoltDict) {
        let summary = ResultSummary::new(
            self.conn.address().clone(),
            std::mem::take(&mut self.run_metadata),
            metadata,
        );
        if let (Some(bookmarks), Some(bookmark)) = (self.bookmarks.as_deref_mut(), &summary.bookmark)
        {
            bookmarks.advance(bookmark.clone());
        }
        self.summary = Some(summary);
        self.phase = Phase::Done;
    }

    async fn fail(&mut self, err: DriverError) -> DriverError {
        self.phase = Phase::Done;
        self.buffer.clear();
        let address = self.conn.address().clone();
        self.core
            .on_error(&err, &address, self.database.as_deref())
            .await;
        err
    }
}

impl std::fmt::Debug for RecordStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("keys", &self.keys)
            .field("buffered", &self.buffer.len())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Reads every outstanding response on `conn` and discards an unfinished
/// result. Returns the bookmark of an auto-commit result that ended here.
pub(crate) async fn drain(conn: &mut Connection) -> Result<Option<String>, DriverError> {
    let mut bookmark = None;
    let mut remember = |metadata: &BoltDict| {
        if let Some(b) = metadata.get("bookmark").and_then(BoltValue::as_str) {
            bookmark = Some(b.to_string());
        }
    };
    while conn.has_pending() {
        if let ServerMessage::Success { metadata } = conn.fetch_message().await? {
            remember(&metadata);
        }
    }
    if conn.state().is_streaming() {
        conn.discard(-1)?;
        conn.send_all().await?;
        remember(&conn.fetch_summary().await?);
    }
    Ok(bookmark)
}
