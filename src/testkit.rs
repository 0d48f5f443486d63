//! In-process scripted Bolt server for exercising the client without a
//! database.
//!
//! A [`FakeServer`] speaks the server side of the protocol over
//! `tokio::io::duplex` pipes: it negotiates a version, answers HELLO/LOGON,
//! plays back queued [`Reply`]s for each RUN, pages records on PULL, hands out
//! bookmarks on commit and serves a routing table on ROUTE. Every request it
//! receives is logged so tests can assert on what the client sent.
//! [`FakeCluster`] maps addresses to servers and plugs into the pool as an
//! [`Opener`].
//!
//! Only built for the crate's own tests and with the `testkit` feature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::address::Address;
use crate::channel::{Channel, ChannelConfig};
use crate::chunk::{ChunkReader, ChunkWriter};
use crate::connection::{Connection, ConnectionSettings};
use crate::error::DriverError;
use crate::message::{ClientMessage, ServerMessage, decode_client_message, encode_server_message};
use crate::pool::Opener;
use crate::types::{BoltDict, BoltValue};
use crate::version::{self, BOLT_MAGIC, NO_VERSION, ProtocolVersion, SUPPORTED_VERSIONS};

/// What the server does with one RUN.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Succeed with these columns and rows; `summary` is merged into the
    /// final PULL/DISCARD summary.
    Records {
        fields: Vec<String>,
        rows: Vec<Vec<BoltValue>>,
        summary: BoltDict,
    },
    /// Answer the RUN with FAILURE.
    Failure { code: String, message: String },
    /// Drop the connection without answering.
    Disconnect,
    /// Send the first bytes of a response frame, then go quiet until the
    /// client hangs up.
    Stall,
}

impl Reply {
    pub fn records(fields: &[&str], rows: Vec<Vec<BoltValue>>) -> Self {
        Self::Records {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows,
            summary: BoltDict::new(),
        }
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self::Failure {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Builds the `rt` dictionary of a ROUTE summary.
pub fn routing_table(ttl: i64, routers: &[&str], readers: &[&str], writers: &[&str]) -> BoltDict {
    let servers = [("ROUTE", routers), ("READ", readers), ("WRITE", writers)]
        .into_iter()
        .filter(|(_, addrs)| !addrs.is_empty())
        .map(|(role, addrs)| {
            BoltValue::Dict(BoltDict::from([
                ("role".to_string(), BoltValue::from(role)),
                (
                    "addresses".to_string(),
                    BoltValue::List(addrs.iter().map(|a| BoltValue::from(*a)).collect()),
                ),
            ]))
        })
        .collect();
    BoltDict::from([
        ("ttl".to_string(), BoltValue::Integer(ttl)),
        ("servers".to_string(), BoltValue::List(servers)),
    ])
}

struct Script {
    versions: Vec<ProtocolVersion>,
    replies: VecDeque<Reply>,
    routing_table: Option<BoltDict>,
    route_failure: Option<(String, String)>,
    auth_failure: Option<(String, String)>,
    fail_resets: bool,
    disconnect_on_commit: bool,
    recv_timeout_hint: Option<i64>,
    silent: bool,
    received: Vec<ClientMessage>,
    connections: usize,
    bookmarks: u64,
}

/// A scripted server. Clones share the script and the request log.
#[derive(Clone)]
pub struct FakeServer {
    script: Arc<Mutex<Script>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self::with_versions(SUPPORTED_VERSIONS.to_vec())
    }

    /// A server that only speaks `versions`.
    pub fn with_versions(versions: Vec<ProtocolVersion>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                versions,
                replies: VecDeque::new(),
                routing_table: None,
                route_failure: None,
                auth_failure: None,
                fail_resets: false,
                disconnect_on_commit: false,
                recv_timeout_hint: None,
                silent: false,
                received: Vec::new(),
                connections: 0,
                bookmarks: 0,
            })),
        }
    }

    /// Queues the outcome of the next RUN. Without one, RUN yields no rows.
    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().replies.push_back(reply);
    }

    pub fn set_routing_table(&self, rt: BoltDict) {
        let mut script = self.script.lock();
        script.routing_table = Some(rt);
        script.route_failure = None;
    }

    pub fn fail_routing(&self, code: &str, message: &str) {
        self.script.lock().route_failure = Some((code.into(), message.into()));
    }

    pub fn fail_auth(&self, code: &str, message: &str) {
        self.script.lock().auth_failure = Some((code.into(), message.into()));
    }

    pub fn fail_resets(&self, yes: bool) {
        self.script.lock().fail_resets = yes;
    }

    pub fn disconnect_on_commit(&self, yes: bool) {
        self.script.lock().disconnect_on_commit = yes;
    }

    pub fn set_recv_timeout_hint(&self, seconds: Option<i64>) {
        self.script.lock().recv_timeout_hint = seconds;
    }

    /// Accept connections but never answer, not even the handshake.
    pub fn go_silent(&self, yes: bool) {
        self.script.lock().silent = yes;
    }

    /// Every request received so far, across connections.
    pub fn received(&self) -> Vec<ClientMessage> {
        self.script.lock().received.clone()
    }

    pub fn received_names(&self) -> Vec<&'static str> {
        self.script.lock().received.iter().map(ClientMessage::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.received_names().iter().filter(|n| **n == name).count()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.script.lock().connections
    }

    /// Waits until a request called `name` has been received.
    pub async fn wait_for(&self, name: &str) {
        for _ in 0..200 {
            if self.received_names().contains(&name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{name} never reached the fake server");
    }

    /// Opens a client connection to this server over an in-memory pipe.
    pub async fn connect(
        &self,
        address: Address,
        settings: &ConnectionSettings,
    ) -> Result<Connection, DriverError> {
        let channel = Channel::from_stream(
            address,
            Box::new(self.accept()),
            &ChannelConfig::default(),
        );
        Connection::open(channel, settings).await
    }

    /// Spawns a server task and returns the client end of its pipe.
    pub fn accept(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let id = {
            let mut script = self.script.lock();
            script.connections += 1;
            script.connections
        };
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.serve(server, id).await {
                tracing::debug!(connection = id, error = %e, "fake server connection ended");
            }
        });
        client
    }

    async fn serve(&self, mut stream: DuplexStream, id: usize) -> Result<(), DriverError> {
        if self.script.lock().silent {
            let mut sink = Vec::new();
            stream.read_to_end(&mut sink).await?;
            return Ok(());
        }
        let mut hello = [0u8; 20];
        stream.read_exact(&mut hello).await?;
        if hello[..4] != BOLT_MAGIC {
            return Err(DriverError::protocol("invalid magic preamble"));
        }
        let mut proposals = [0u8; 16];
        proposals.copy_from_slice(&hello[4..]);
        let versions = self.script.lock().versions.clone();
        let Some(agreed) = version::negotiate_version(&proposals, &versions) else {
            stream.write_all(&NO_VERSION).await?;
            return Ok(());
        };
        stream.write_all(&agreed.to_reply()).await?;

        let (rh, wh) = tokio::io::split(stream);
        let mut reader = ChunkReader::new(rh);
        let mut writer = ChunkWriter::new(wh);
        let mut conn = ServerConn {
            id,
            version: agreed,
            failed: false,
            in_tx: false,
            rows: VecDeque::new(),
            summary: BoltDict::new(),
        };

        loop {
            let bytes = reader.read_message().await?;
            let msg = decode_client_message(&bytes)?;
            let action = self.respond(&msg, &mut conn);
            self.script.lock().received.push(msg);
            match action {
                Action::Reply(replies) => {
                    for reply in replies {
                        let mut buf = BytesMut::new();
                        encode_server_message(&mut buf, &reply)?;
                        writer.queue_message(&buf);
                    }
                    writer.flush().await?;
                }
                Action::Hangup => return Ok(()),
                Action::Stall => {
                    writer.get_mut().write_all(&[0x00, 0x40, 0xB1]).await?;
                    writer.get_mut().flush().await?;
                    let mut rest = reader.into_inner();
                    tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
                    return Ok(());
                }
            }
        }
    }

    fn respond(&self, msg: &ClientMessage, conn: &mut ServerConn) -> Action {
        let mut script = self.script.lock();
        if conn.failed && !matches!(msg, ClientMessage::Reset | ClientMessage::Goodbye) {
            return Action::Reply(vec![ServerMessage::Ignored]);
        }

        let reply = match msg {
            ClientMessage::Hello { .. } => {
                if !conn.version.has_logon() {
                    if let Some((code, message)) = &script.auth_failure {
                        return conn.fail(code, message);
                    }
                }
                let mut metadata = BoltDict::from([
                    ("server".to_string(), BoltValue::from("Neo4j/5.20.0")),
                    (
                        "connection_id".to_string(),
                        BoltValue::String(format!("bolt-{}", conn.id)),
                    ),
                ]);
                if let Some(secs) = script.recv_timeout_hint {
                    metadata.insert(
                        "hints".into(),
                        BoltValue::Dict(BoltDict::from([(
                            "connection.recv_timeout_seconds".to_string(),
                            BoltValue::Integer(secs),
                        )])),
                    );
                }
                success(metadata)
            }
            ClientMessage::Logon { .. } => {
                if let Some((code, message)) = &script.auth_failure {
                    return conn.fail(code, message);
                }
                success(BoltDict::new())
            }
            ClientMessage::Logoff => success(BoltDict::new()),
            ClientMessage::Goodbye => return Action::Hangup,
            ClientMessage::Reset => {
                if script.fail_resets {
                    return conn.fail("Neo.DatabaseError.General.UnknownError", "reset failed");
                }
                conn.failed = false;
                conn.in_tx = false;
                conn.rows.clear();
                success(BoltDict::new())
            }
            ClientMessage::Begin { .. } => {
                conn.in_tx = true;
                success(BoltDict::new())
            }
            ClientMessage::Run { .. } => match script.replies.pop_front() {
                Some(Reply::Failure { code, message }) => return conn.fail(&code, &message),
                Some(Reply::Disconnect) => return Action::Hangup,
                Some(Reply::Stall) => return Action::Stall,
                Some(Reply::Records {
                    fields,
                    rows,
                    summary,
                }) => {
                    conn.rows = rows.into();
                    conn.summary = summary;
                    run_success(&fields)
                }
                None => {
                    conn.rows.clear();
                    conn.summary = BoltDict::new();
                    run_success(&[])
                }
            },
            ClientMessage::Pull { extra } => {
                let n = extra.get("n").and_then(BoltValue::as_int).unwrap_or(-1);
                let take = if n < 0 {
                    conn.rows.len()
                } else {
                    (n as usize).min(conn.rows.len())
                };
                let mut out: Vec<ServerMessage> = conn
                    .rows
                    .drain(..take)
                    .map(|data| ServerMessage::Record { data })
                    .collect();
                out.push(conn.stream_summary(&mut script));
                return Action::Reply(out);
            }
            ClientMessage::Discard { .. } => {
                conn.rows.clear();
                conn.stream_summary(&mut script)
            }
            ClientMessage::Commit => {
                if script.disconnect_on_commit {
                    return Action::Hangup;
                }
                conn.in_tx = false;
                success(BoltDict::from([(
                    "bookmark".to_string(),
                    BoltValue::String(script.next_bookmark()),
                )]))
            }
            ClientMessage::Rollback => {
                conn.in_tx = false;
                success(BoltDict::new())
            }
            ClientMessage::Route { extra, .. } => {
                if let Some((code, message)) = script.route_failure.clone() {
                    return conn.fail(&code, &message);
                }
                match script.routing_table.clone() {
                    Some(mut rt) => {
                        if let Some(db) = extra.get("db") {
                            rt.entry("db".into()).or_insert_with(|| db.clone());
                        }
                        success(BoltDict::from([("rt".to_string(), BoltValue::Dict(rt))]))
                    }
                    None => {
                        return conn.fail(
                            "Neo.ClientError.Procedure.ProcedureNotFound",
                            "routing is not enabled on this server",
                        );
                    }
                }
            }
        };
        Action::Reply(vec![reply])
    }
}

impl Script {
    fn next_bookmark(&mut self) -> String {
        self.bookmarks += 1;
        format!("FB:bookmark-{}", self.bookmarks)
    }
}

enum Action {
    Reply(Vec<ServerMessage>),
    Hangup,
    Stall,
}

struct ServerConn {
    id: usize,
    version: ProtocolVersion,
    failed: bool,
    in_tx: bool,
    rows: VecDeque<Vec<BoltValue>>,
    summary: BoltDict,
}

impl ServerConn {
    fn fail(&mut self, code: &str, message: &str) -> Action {
        self.failed = true;
        Action::Reply(vec![ServerMessage::Failure {
            metadata: BoltDict::from([
                ("code".to_string(), BoltValue::from(code)),
                ("message".to_string(), BoltValue::from(message)),
            ]),
        }])
    }

    fn stream_summary(&mut self, script: &mut Script) -> ServerMessage {
        if !self.rows.is_empty() {
            return success(BoltDict::from([(
                "has_more".to_string(),
                BoltValue::Boolean(true),
            )]));
        }
        let mut metadata = std::mem::take(&mut self.summary);
        metadata
            .entry("type".into())
            .or_insert_with(|| BoltValue::from("r"));
        metadata
            .entry("db".into())
            .or_insert_with(|| BoltValue::from("neo4j"));
        metadata.insert("t_last".into(), BoltValue::Integer(1));
        if !self.in_tx {
            metadata.insert("bookmark".into(), BoltValue::String(script.next_bookmark()));
        }
        success(metadata)
    }
}

fn success(metadata: BoltDict) -> ServerMessage {
    ServerMessage::Success { metadata }
}

fn run_success(fields: &[String]) -> ServerMessage {
    success(BoltDict::from([
        (
            "fields".to_string(),
            BoltValue::List(fields.iter().map(|f| BoltValue::from(f.as_str())).collect()),
        ),
        ("t_first".to_string(), BoltValue::Integer(1)),
    ]))
}

/// Several fake servers keyed by address, usable as the pool's [`Opener`].
#[derive(Clone, Default)]
pub struct FakeCluster {
    servers: Arc<Mutex<HashMap<Address, FakeServer>>>,
    unreachable: Arc<Mutex<HashSet<Address>>>,
    settings: ConnectionSettings,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose connections are opened with `settings`.
    pub fn with_settings(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// The server at `address`, created on first use.
    pub fn server(&self, address: &str) -> FakeServer {
        let address = Address::parse(address).unwrap_or_else(|_| Address::new(address, 7687));
        self.servers.lock().entry(address).or_default().clone()
    }

    /// Makes connection attempts to `address` fail (or succeed again).
    pub fn set_unreachable(&self, address: &str, yes: bool) {
        let address = Address::parse(address).unwrap_or_else(|_| Address::new(address, 7687));
        let mut unreachable = self.unreachable.lock();
        if yes {
            unreachable.insert(address);
        } else {
            unreachable.remove(&address);
        }
    }

    /// Connections opened to `address` so far.
    pub fn opened(&self, address: &str) -> usize {
        let address = Address::parse(address).unwrap_or_else(|_| Address::new(address, 7687));
        self.servers
            .lock()
            .get(&address)
            .map(FakeServer::connections)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Opener for FakeCluster {
    async fn open(&self, address: &Address) -> Result<Connection, DriverError> {
        if self.unreachable.lock().contains(address) {
            return Err(DriverError::unavailable_at(address, "connection refused"));
        }
        let server = self.servers.lock().entry(address.clone()).or_default().clone();
        server.connect(address.clone(), &self.settings).await
    }
}
