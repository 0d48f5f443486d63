//! Server-to-client Bolt messages.

use crate::types::{BoltDict, BoltValue};

/// A message sent from the server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Request completed successfully. Metadata varies by request.
    Success { metadata: BoltDict },

    /// One row of a result.
    Record { data: Vec<BoltValue> },

    /// Request failed; metadata carries `code` and `message`.
    Failure { metadata: BoltDict },

    /// Request skipped because an earlier one failed.
    Ignored,
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success { .. } => "SUCCESS",
            Self::Record { .. } => "RECORD",
            Self::Failure { .. } => "FAILURE",
            Self::Ignored => "IGNORED",
        }
    }

    /// Whether this message ends the response to one request.
    pub fn is_summary(&self) -> bool {
        !matches!(self, Self::Record { .. })
    }
}
