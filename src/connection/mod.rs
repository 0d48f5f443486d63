//! One authenticated Bolt connection: handshake, request pipelining and the
//! client-side mirror of the server state.
//!
//! Requests are queued with [`Connection::run`], [`Connection::pull`] and
//! friends, written together by [`Connection::send_all`], and their
//! responses are read back in order with [`Connection::fetch_message`].
//! Every queued request is checked against the state the connection will be
//! in once everything before it succeeds; a request the server would reject
//! is refused before it is written.

pub mod handshake;
pub mod state;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;

use crate::address::Address;
use crate::auth::AuthToken;
use crate::channel::Channel;
use crate::error::DriverError;
use crate::message::{ClientMessage, ServerMessage, decode_server_message, encode_client_message};
use crate::types::{BoltDict, BoltValue};
use crate::version::ProtocolVersion;

pub use state::{ConnectionState, RequestKind};

/// What HELLO (and LOGON) announce about this client.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub user_agent: String,
    pub auth: AuthToken,
    /// `Some` for routing drivers; the server then uses it for server-side
    /// routing policies.
    pub routing_context: Option<BoltDict>,
    /// Bound on handshake plus authentication once the socket is connected.
    pub connection_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            user_agent: crate::config::default_user_agent(),
            auth: AuthToken::none(),
            routing_context: None,
            connection_timeout: Some(Duration::from_secs(30)),
        }
    }
}

pub struct Connection {
    channel: Channel,
    version: ProtocolVersion,
    state: ConnectionState,
    /// State once every pending request has succeeded.
    queued_state: ConnectionState,
    pending: VecDeque<RequestKind>,
    server_agent: String,
    connection_id: String,
    created_at: Instant,
    last_used: Instant,
    /// Set while a flush or read is underway. Still set afterwards means the
    /// future was dropped mid-frame and the stream is out of step.
    in_flight: bool,
}

impl Connection {
    /// Runs the handshake and authenticates. The channel must be fresh.
    pub async fn open(channel: Channel, settings: &ConnectionSettings) -> Result<Self, DriverError> {
        let Some(limit) = settings.connection_timeout else {
            return Self::establish(channel, settings).await;
        };
        let address = channel.address().clone();
        match tokio::time::timeout(limit, Self::establish(channel, settings)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(address = %address, timeout = ?limit, "connection setup timed out");
                Err(DriverError::unavailable_at(
                    &address,
                    format!("no handshake and authentication within {limit:?}"),
                ))
            }
        }
    }

    async fn establish(
        mut channel: Channel,
        settings: &ConnectionSettings,
    ) -> Result<Self, DriverError> {
        let version = match handshake::handshake(&mut channel).await {
            Ok(v) => v,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        channel.mark_open();

        let now = Instant::now();
        let mut conn = Self {
            channel,
            version,
            state: ConnectionState::Authentication,
            queued_state: ConnectionState::Authentication,
            pending: VecDeque::new(),
            server_agent: String::new(),
            connection_id: String::new(),
            created_at: now,
            last_used: now,
            in_flight: false,
        };

        if let Err(e) = conn.authenticate(settings).await {
            conn.close().await;
            return Err(e);
        }
        tracing::debug!(
            address = %conn.address(),
            version = %conn.version,
            server = %conn.server_agent,
            connection_id = %conn.connection_id,
            "connection opened"
        );
        Ok(conn)
    }

    async fn authenticate(&mut self, settings: &ConnectionSettings) -> Result<(), DriverError> {
        let mut extra = BoltDict::from([(
            "user_agent".to_string(),
            BoltValue::from(settings.user_agent.as_str()),
        )]);
        if let Some(routing) = &settings.routing_context {
            extra.insert("routing".into(), BoltValue::Dict(routing.clone()));
        }
        if self.version >= ProtocolVersion::new(5, 3) {
            extra.insert("bolt_agent".into(), BoltValue::Dict(bolt_agent()));
        }

        let logon = self.version.has_logon();
        if !logon {
            extra.extend(settings.auth.to_dict());
        }
        self.queue(ClientMessage::Hello { extra })?;
        if logon {
            self.queue(ClientMessage::Logon {
                auth: settings.auth.to_dict(),
            })?;
        }
        self.send_all().await?;

        let metadata = self.fetch_summary().await?;
        if let Some(agent) = metadata.get("server").and_then(BoltValue::as_str) {
            self.server_agent = agent.to_string();
        }
        if let Some(id) = metadata.get("connection_id").and_then(BoltValue::as_str) {
            self.connection_id = id.to_string();
        }
        self.apply_hints(&metadata);

        if logon {
            self.fetch_summary().await?;
        }
        Ok(())
    }

    fn apply_hints(&mut self, metadata: &BoltDict) {
        let hint = metadata
            .get("hints")
            .and_then(BoltValue::as_dict)
            .and_then(|h| h.get("connection.recv_timeout_seconds"))
            .and_then(BoltValue::as_int);
        match hint {
            Some(secs) if secs > 0 => {
                if self.channel.read_timeout().is_none() {
                    self.channel
                        .set_read_timeout(Some(Duration::from_secs(secs as u64)));
                }
            }
            Some(secs) => {
                tracing::info!(
                    address = %self.address(),
                    value = secs,
                    "ignoring invalid connection.recv_timeout_seconds hint"
                );
            }
            None => {}
        }
    }

    pub fn address(&self) -> &Address {
        self.channel.address()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_agent(&self) -> &str {
        &self.server_agent
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() >= timeout
    }

    /// Broken, or abandoned half way through a write or read.
    pub fn is_defunct(&self) -> bool {
        self.state == ConnectionState::Defunct || self.in_flight
    }

    /// Idle and clean: nothing pending, not in a transaction, not failed.
    pub fn is_ready(&self) -> bool {
        !self.in_flight && self.state == ConnectionState::Ready && self.pending.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn mark_defunct(&mut self) {
        self.state = ConnectionState::Defunct;
        self.queued_state = ConnectionState::Defunct;
        self.pending.clear();
    }

    // -- Queued requests --

    /// Queues RUN. `extra` carries bookmarks, database, mode and tx settings
    /// for auto-commit queries and is empty inside a transaction.
    pub fn run(
        &mut self,
        query: impl Into<String>,
        parameters: BoltDict,
        extra: BoltDict,
    ) -> Result<(), DriverError> {
        self.queue(ClientMessage::Run {
            query: query.into(),
            parameters,
            extra,
        })
    }

    /// Queues PULL for `n` records (`-1` for all).
    pub fn pull(&mut self, n: i64) -> Result<(), DriverError> {
        self.queue(ClientMessage::pull_n(n))
    }

    pub fn discard(&mut self, n: i64) -> Result<(), DriverError> {
        self.queue(ClientMessage::Discard {
            extra: BoltDict::from([("n".to_string(), BoltValue::Integer(n))]),
        })
    }

    fn queue(&mut self, msg: ClientMessage) -> Result<(), DriverError> {
        if self.is_defunct() {
            return Err(DriverError::unavailable_at(
                self.address(),
                "connection is defunct",
            ));
        }
        if !self.queued_state.accepts(&msg) {
            return Err(DriverError::protocol(format!(
                "{} is not allowed while the connection is {:?}",
                msg.name(),
                self.queued_state
            )));
        }

        let mut buf = BytesMut::new();
        encode_client_message(&mut buf, &msg)?;
        tracing::trace!(address = %self.address(), message = msg.name(), "C: queued");
        if let Err(e) = self.channel.queue(&buf) {
            return Err(self.fail(e));
        }

        let kind = RequestKind::from(&msg);
        self.queued_state = self
            .queued_state
            .on_success(kind, true, self.version.has_logon());
        self.pending.push_back(kind);
        Ok(())
    }

    /// Writes every queued request in one flush.
    pub async fn send_all(&mut self) -> Result<(), DriverError> {
        self.in_flight = true;
        let flushed = self.channel.flush().await;
        self.in_flight = false;
        match flushed {
            Ok(()) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // -- Responses --

    /// Reads the next response and matches it to the oldest pending request.
    ///
    /// FAILURE comes back as the classified error; the connection is then
    /// `Failed` until RESET. RECORD and IGNORED are returned as messages.
    pub async fn fetch_message(&mut self) -> Result<ServerMessage, DriverError> {
        let Some(&head) = self.pending.front() else {
            return Err(self.fail(DriverError::protocol("no request is waiting for a response")));
        };

        self.in_flight = true;
        let read = self.channel.read_message().await;
        self.in_flight = false;
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(e)),
        };
        let msg = match decode_server_message(&bytes) {
            Ok(msg) => msg,
            Err(e) => return Err(self.fail(e)),
        };
        self.last_used = Instant::now();
        tracing::trace!(address = %self.address(), message = msg.name(), request = ?head, "S:");

        match msg {
            ServerMessage::Record { .. } => {
                if head != RequestKind::Pull {
                    return Err(self.fail(DriverError::protocol(format!(
                        "RECORD received in response to {head:?}"
                    ))));
                }
                Ok(msg)
            }
            ServerMessage::Success { ref metadata } => {
                self.pending.pop_front();
                let has_more = metadata
                    .get("has_more")
                    .and_then(BoltValue::as_bool)
                    .unwrap_or(false);
                self.state = self
                    .state
                    .on_success(head, has_more, self.version.has_logon());
                if self.pending.is_empty() {
                    self.queued_state = self.state;
                }
                Ok(msg)
            }
            ServerMessage::Failure { metadata } => {
                self.pending.pop_front();
                self.state = self.state.on_failure(head);
                if self.state == ConnectionState::Defunct
                    || !self.pending.contains(&RequestKind::Reset)
                {
                    self.queued_state = self.state;
                }
                let err = DriverError::from_failure(&metadata);
                tracing::debug!(address = %self.address(), request = ?head, error = %err, "request failed");
                if self.is_defunct() {
                    self.pending.clear();
                }
                Err(err)
            }
            ServerMessage::Ignored => {
                self.pending.pop_front();
                if self.pending.is_empty() {
                    self.queued_state = self.state;
                }
                Ok(msg)
            }
        }
    }

    /// Reads up to and including the summary of the oldest pending request,
    /// dropping any records before it.
    pub async fn fetch_summary(&mut self) -> Result<BoltDict, DriverError> {
        loop {
            match self.fetch_message().await? {
                ServerMessage::Record { .. } => continue,
                ServerMessage::Success { metadata } => return Ok(metadata),
                ServerMessage::Ignored => {
                    return Err(DriverError::client(
                        "request ignored by the server after an earlier failure",
                    ));
                }
                ServerMessage::Failure { metadata } => {
                    return Err(DriverError::from_failure(&metadata));
                }
            }
        }
    }

    /// Consumes every outstanding response and discards unread results, so
    /// the connection can take the next query.
    pub async fn discard_pending_results(&mut self) -> Result<(), DriverError> {
        while self.has_pending() {
            self.fetch_message().await?;
        }
        if self.state.is_streaming() {
            self.discard(-1)?;
            self.send_all().await?;
            self.fetch_summary().await?;
        }
        Ok(())
    }

    // -- Round trips --

    pub async fn begin(&mut self, extra: BoltDict) -> Result<(), DriverError> {
        self.queue(ClientMessage::Begin { extra })?;
        self.send_all().await?;
        self.fetch_summary().await.map(|_| ())
    }

    /// Commits and returns the bookmark of the committed transaction.
    ///
    /// Losing the connection after COMMIT was written means the outcome is
    /// unknown; that surfaces as [`DriverError::IncompleteCommit`].
    pub async fn commit(&mut self) -> Result<Option<String>, DriverError> {
        self.queue(ClientMessage::Commit)?;
        let outcome = match self.send_all().await {
            Ok(()) => self.fetch_summary().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(metadata) => Ok(metadata
                .get("bookmark")
                .and_then(BoltValue::as_str)
                .map(str::to_string)),
            Err(e @ DriverError::ServiceUnavailable { .. }) if self.is_defunct() => {
                Err(DriverError::IncompleteCommit(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        self.queue(ClientMessage::Rollback)?;
        self.send_all().await?;
        self.fetch_summary().await.map(|_| ())
    }

    /// Sends RESET and waits for its summary, discarding everything queued
    /// before it. A RESET that fails leaves the connection defunct.
    pub async fn reset(&mut self) -> Result<(), DriverError> {
        self.queue(ClientMessage::Reset)?;
        self.send_all().await?;
        loop {
            let head = self.pending.front().copied();
            let result = self.fetch_message().await;
            if head == Some(RequestKind::Reset) {
                return match result {
                    Ok(ServerMessage::Success { .. }) => Ok(()),
                    Ok(other) => {
                        self.mark_defunct();
                        Err(DriverError::protocol(format!(
                            "unexpected {} in response to RESET",
                            other.name()
                        )))
                    }
                    Err(e) => {
                        self.mark_defunct();
                        Err(e)
                    }
                };
            }
            // Failures of requests before RESET are expected; the connection
            // only gives up if the transport broke.
            if let Err(e) = result {
                if self.is_defunct() {
                    return Err(e);
                }
            }
        }
    }

    /// Asks for the routing table of `database` (`None` for the user's home
    /// database) and returns the `rt` dictionary.
    pub async fn route(
        &mut self,
        routing: BoltDict,
        bookmarks: Vec<String>,
        database: Option<&str>,
        impersonated_user: Option<&str>,
    ) -> Result<BoltDict, DriverError> {
        let mut extra = BoltDict::new();
        if let Some(db) = database {
            extra.insert("db".into(), BoltValue::from(db));
        }
        if let Some(user) = impersonated_user {
            extra.insert("imp_user".into(), BoltValue::from(user));
        }
        self.queue(ClientMessage::Route {
            routing,
            bookmarks,
            extra,
        })?;
        self.send_all().await?;
        let mut metadata = self.fetch_summary().await?;
        match metadata.remove("rt") {
            Some(BoltValue::Dict(rt)) => Ok(rt),
            _ => Err(DriverError::protocol("ROUTE summary carries no routing table")),
        }
    }

    /// Says GOODBYE if still healthy, then shuts the channel.
    pub async fn close(&mut self) {
        if !self.is_defunct()
            && self.queued_state.accepts(&ClientMessage::Goodbye)
            && self.queue(ClientMessage::Goodbye).is_ok()
        {
            let _ = self.channel.flush().await;
        }
        self.channel.close().await;
        self.mark_defunct();
        tracing::debug!(address = %self.address(), "connection closed");
    }

    /// Marks the connection defunct and attributes transport errors to the
    /// server address.
    fn fail(&mut self, err: DriverError) -> DriverError {
        self.mark_defunct();
        tracing::debug!(address = %self.address(), error = %err, "connection defunct");
        match err {
            DriverError::Io(e) => DriverError::unavailable_at(self.address(), format!("connection lost: {e}")),
            other => other,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", self.address())
            .field("version", &self.version)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

fn bolt_agent() -> BoltDict {
    BoltDict::from([
        (
            "product".to_string(),
            BoltValue::String(crate::config::default_user_agent()),
        ),
        (
            "platform".to_string(),
            BoltValue::String(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
        ),
        ("language".to_string(), BoltValue::from("Rust")),
    ])
}
