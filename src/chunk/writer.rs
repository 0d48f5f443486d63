//! Writes chunked messages to an async byte stream.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::MAX_CHUNK_SIZE;
use crate::error::DriverError;

/// Appends `data` to `out` as one chunked message, terminator included.
///
/// `max_chunk` is clamped to `1..=MAX_CHUNK_SIZE`.
pub fn chunk_into(out: &mut BytesMut, data: &[u8], max_chunk: usize) {
    let max_chunk = max_chunk.clamp(1, MAX_CHUNK_SIZE);
    out.reserve(data.len() + 2 * (data.len() / max_chunk + 2));
    for chunk in data.chunks(max_chunk) {
        out.put_u16(chunk.len() as u16);
        out.put_slice(chunk);
    }
    out.put_u16(0);
}

/// Buffers Bolt-chunked messages and writes them out on [`flush`].
///
/// Queuing several messages before one flush is how requests get pipelined.
///
/// [`flush`]: ChunkWriter::flush
pub struct ChunkWriter<W> {
    writer: W,
    out: BytesMut,
    max_chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_max_chunk_size(writer, MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk_size(writer: W, max_chunk_size: usize) -> Self {
        Self {
            writer,
            out: BytesMut::new(),
            max_chunk_size,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Queues a complete message; nothing is written until `flush`.
    pub fn queue_message(&mut self, data: &[u8]) {
        chunk_into(&mut self.out, data, self.max_chunk_size);
    }

    /// Bytes queued but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.out.len()
    }

    /// Writes every queued message and flushes the stream.
    pub async fn flush(&mut self) -> Result<(), DriverError> {
        if !self.out.is_empty() {
            let out = self.out.split();
            self.writer.write_all(&out).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Queues one message and flushes immediately.
    pub async fn write_message(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.queue_message(data);
        self.flush().await
    }
}
