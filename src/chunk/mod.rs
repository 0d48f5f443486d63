//! Bolt message chunking: 2-byte length-prefixed framing.
//!
//! A message is one or more chunks of at most 65535 bytes followed by a
//! zero-length chunk. A zero-length chunk with no data before it is a NOOP
//! keep-alive and carries no message.

pub mod reader;
pub mod writer;

pub use reader::{ChunkReader, Dechunker};
pub use writer::{ChunkWriter, chunk_into};

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;
