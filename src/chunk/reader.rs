//! Reassembles chunked messages, from an async stream or from raw slices.

use std::collections::VecDeque;
use std::io::ErrorKind;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::MAX_CHUNK_SIZE;
use crate::error::DriverError;

/// Reads Bolt-chunked messages from an `AsyncRead` stream.
///
/// NOOP chunks between messages are skipped. End of stream at a message
/// boundary surfaces as an I/O error; end of stream inside a message is a
/// [`DriverError::MalformedMessage`].
pub struct ChunkReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; MAX_CHUNK_SIZE],
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads a complete message (all chunks until the `0x0000` terminator).
    pub async fn read_message(&mut self) -> Result<BytesMut, DriverError> {
        let mut message = BytesMut::new();
        let mut started = false;

        loop {
            let mut header = [0u8; 2];
            if let Err(e) = self.reader.read_exact(&mut header).await {
                return Err(truncated_or_io(e, started));
            }
            let chunk_len = u16::from_be_bytes(header) as usize;

            if chunk_len == 0 {
                if started {
                    return Ok(message);
                }
                // NOOP
                continue;
            }
            started = true;

            let chunk = &mut self.buf[..chunk_len];
            if let Err(e) = self.reader.read_exact(chunk).await {
                return Err(truncated_or_io(e, true));
            }
            message.extend_from_slice(chunk);
        }
    }
}

fn truncated_or_io(e: std::io::Error, mid_message: bool) -> DriverError {
    if mid_message && e.kind() == ErrorKind::UnexpectedEof {
        DriverError::malformed("stream ended in the middle of a chunked message")
    } else {
        DriverError::Io(e)
    }
}

/// Push-based reassembly: feed bytes split anywhere, pop whole messages.
#[derive(Debug, Default)]
pub struct Dechunker {
    raw: BytesMut,
    current: BytesMut,
    in_message: bool,
    ready: VecDeque<BytesMut>,
}

impl Dechunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
        loop {
            if self.raw.len() < 2 {
                return;
            }
            let chunk_len = u16::from_be_bytes([self.raw[0], self.raw[1]]) as usize;
            if chunk_len == 0 {
                self.raw.advance(2);
                if self.in_message {
                    self.in_message = false;
                    self.ready.push_back(self.current.split());
                }
                continue;
            }
            if self.raw.len() < 2 + chunk_len {
                return;
            }
            self.raw.advance(2);
            self.current.extend_from_slice(&self.raw[..chunk_len]);
            self.raw.advance(chunk_len);
            self.in_message = true;
        }
    }

    /// Next complete message, in arrival order.
    pub fn pop_message(&mut self) -> Option<BytesMut> {
        self.ready.pop_front()
    }

    /// Fails if the fed bytes stop inside a chunk or a message.
    pub fn finish(&self) -> Result<(), DriverError> {
        if self.raw.is_empty() && !self.in_message {
            Ok(())
        } else {
            Err(DriverError::malformed(format!(
                "input ended inside a chunked message ({} unframed bytes)",
                self.raw.len() + self.current.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_into;
    use crate::packstream::{decode_exact, encode_value};
    use crate::types::{BoltDict, BoltNode, BoltValue};
    use std::io::Cursor;

    #[tokio::test]
    async fn read_multi_chunk_message() {
        let data: Vec<u8> = vec![
            0x00, 0x02, 0xAA, 0xBB, // chunk 1
            0x00, 0x01, 0xCC, // chunk 2
            0x00, 0x00, // terminator
        ];
        let mut reader = ChunkReader::new(Cursor::new(data));
        let msg = reader.read_message().await.unwrap();
        assert_eq!(&msg[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn noops_between_messages_are_skipped() {
        let data: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xC0, 0x00, 0x00];
        let mut reader = ChunkReader::new(Cursor::new(data));
        let msg = reader.read_message().await.unwrap();
        assert_eq!(&msg[..], &[0xC0]);
    }

    #[tokio::test]
    async fn eof_mid_message_is_malformed() {
        let data: Vec<u8> = vec![0x00, 0x05, 0x01, 0x02];
        let mut reader = ChunkReader::new(Cursor::new(data));
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, DriverError::MalformedMessage(_)), "{err}");

        // Chunk complete but terminator missing.
        let data: Vec<u8> = vec![0x00, 0x01, 0x01];
        let mut reader = ChunkReader::new(Cursor::new(data));
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, DriverError::MalformedMessage(_)), "{err}");
    }

    #[tokio::test]
    async fn eof_at_boundary_is_io() {
        let mut reader = ChunkReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, DriverError::Io(_)), "{err}");
    }

    #[test]
    fn every_split_decodes_identically() {
        let node = BoltValue::Node(BoltNode {
            id: 1,
            labels: vec!["City".into()],
            properties: BoltDict::from([
                ("name".to_string(), BoltValue::from("Malmö")),
                ("pop".to_string(), BoltValue::Integer(350_000)),
            ]),
            element_id: "4:x:1".into(),
        });
        let value = BoltValue::List(vec![node, BoltValue::Float(1.25), BoltValue::Null]);

        let mut payload = bytes::BytesMut::new();
        encode_value(&mut payload, &value).unwrap();
        // Small chunks so the value straddles several chunk headers.
        let mut framed = BytesMut::new();
        chunk_into(&mut framed, &payload, 7);

        for split in 0..=framed.len() {
            let mut d = Dechunker::new();
            d.feed(&framed[..split]);
            d.feed(&framed[split..]);
            d.finish().unwrap();
            let msg = d.pop_message().expect("one message");
            assert_eq!(decode_exact(&msg).unwrap(), value, "split at {split}");
            assert!(d.pop_message().is_none());
        }
    }

    #[test]
    fn dechunker_reports_truncation() {
        let mut d = Dechunker::new();
        d.feed(&[0x00, 0x03, 0x01]);
        assert!(d.pop_message().is_none());
        assert!(matches!(d.finish(), Err(DriverError::MalformedMessage(_))));

        let mut d = Dechunker::new();
        d.feed(&[0x00, 0x01, 0x01]);
        assert!(d.finish().is_err());
    }
}
