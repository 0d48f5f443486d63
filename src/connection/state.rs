//! Client-side mirror of the server's Bolt connection state.

use crate::message::ClientMessage;

/// The state of a Bolt connection, as the client believes the server sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, handshake not yet done.
    Connecting,
    /// Handshake done; HELLO (and LOGON from 5.1) still to succeed.
    Authentication,
    /// Authenticated and idle, ready for RUN, BEGIN or ROUTE.
    Ready,
    /// Auto-commit query has results left to PULL or DISCARD.
    Streaming,
    /// Inside an explicit transaction, idle.
    TxReady,
    /// Inside an explicit transaction, a query has results left.
    TxStreaming,
    /// A request failed; only RESET or GOODBYE accepted.
    Failed,
    /// Closed or broken. Never reused.
    Defunct,
}

impl ConnectionState {
    /// Whether `msg` may be sent in this state.
    pub fn accepts(&self, msg: &ClientMessage) -> bool {
        match self {
            Self::Connecting | Self::Defunct => false,
            Self::Authentication => matches!(
                msg,
                ClientMessage::Hello { .. } | ClientMessage::Logon { .. } | ClientMessage::Goodbye
            ),
            Self::Ready => matches!(
                msg,
                ClientMessage::Run { .. }
                    | ClientMessage::Begin { .. }
                    | ClientMessage::Route { .. }
                    | ClientMessage::Reset
                    | ClientMessage::Goodbye
                    | ClientMessage::Logoff
            ),
            Self::Streaming | Self::TxStreaming => matches!(
                msg,
                ClientMessage::Pull { .. }
                    | ClientMessage::Discard { .. }
                    | ClientMessage::Reset
                    | ClientMessage::Goodbye
            ),
            Self::TxReady => matches!(
                msg,
                ClientMessage::Run { .. }
                    | ClientMessage::Commit
                    | ClientMessage::Rollback
                    | ClientMessage::Reset
                    | ClientMessage::Goodbye
            ),
            Self::Failed => matches!(msg, ClientMessage::Reset | ClientMessage::Goodbye),
        }
    }

    /// Next state once the server answered `msg` with SUCCESS.
    ///
    /// `has_more` is the `has_more` flag of a PULL/DISCARD summary and is
    /// ignored for every other message. `needs_logon` tells whether HELLO
    /// leaves authentication to a following LOGON.
    pub fn on_success(&self, msg: RequestKind, has_more: bool, needs_logon: bool) -> Self {
        match (self, msg) {
            (Self::Authentication, RequestKind::Hello) if needs_logon => Self::Authentication,
            (Self::Authentication, RequestKind::Hello | RequestKind::Logon) => Self::Ready,

            (Self::Ready, RequestKind::Run) => Self::Streaming,
            (Self::TxReady, RequestKind::Run) => Self::TxStreaming,
            (Self::Streaming | Self::TxStreaming, RequestKind::Pull | RequestKind::Discard) => {
                if has_more {
                    *self
                } else {
                    self.complete_streaming()
                }
            }

            (Self::Ready, RequestKind::Begin) => Self::TxReady,
            (Self::TxReady, RequestKind::Commit | RequestKind::Rollback) => Self::Ready,

            (_, RequestKind::Reset) => Self::Ready,
            (Self::Ready, RequestKind::Logoff) => Self::Authentication,
            (_, RequestKind::Goodbye) => Self::Defunct,

            _ => *self,
        }
    }

    /// Next state once the server answered `msg` with FAILURE.
    pub fn on_failure(&self, msg: RequestKind) -> Self {
        match msg {
            // A connection that cannot be reset is beyond repair.
            RequestKind::Reset | RequestKind::Goodbye => Self::Defunct,
            _ => Self::Failed,
        }
    }

    pub fn complete_streaming(&self) -> Self {
        match self {
            Self::Streaming => Self::Ready,
            Self::TxStreaming => Self::TxReady,
            other => *other,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming | Self::TxStreaming)
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self, Self::TxReady | Self::TxStreaming)
    }
}

/// A request awaiting its summary, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Hello,
    Logon,
    Logoff,
    Goodbye,
    Reset,
    Run,
    Pull,
    Discard,
    Begin,
    Commit,
    Rollback,
    Route,
}

impl From<&ClientMessage> for RequestKind {
    fn from(msg: &ClientMessage) -> Self {
        match msg {
            ClientMessage::Hello { .. } => Self::Hello,
            ClientMessage::Logon { .. } => Self::Logon,
            ClientMessage::Logoff => Self::Logoff,
            ClientMessage::Goodbye => Self::Goodbye,
            ClientMessage::Reset => Self::Reset,
            ClientMessage::Run { .. } => Self::Run,
            ClientMessage::Pull { .. } => Self::Pull,
            ClientMessage::Discard { .. } => Self::Discard,
            ClientMessage::Begin { .. } => Self::Begin,
            ClientMessage::Commit => Self::Commit,
            ClientMessage::Rollback => Self::Rollback,
            ClientMessage::Route { .. } => Self::Route,
        }
    }
}
