//! Bolt handshake: magic preamble and version negotiation.

use crate::channel::Channel;
use crate::error::DriverError;
use crate::version::{self, BOLT_MAGIC, ProtocolVersion, SUPPORTED_VERSIONS};

/// "HTTP" in ASCII: the reply of a web server on the other end.
const HTTP_REPLY: [u8; 4] = *b"HTTP";

/// Performs the client-side Bolt handshake on a channel that is still in raw
/// mode.
///
/// Sends magic + four version proposals, reads the server's choice. An
/// all-zero reply means the server speaks none of the proposed versions.
pub async fn handshake(channel: &mut Channel) -> Result<ProtocolVersion, DriverError> {
    let mut hello = [0u8; 20];
    hello[..4].copy_from_slice(&BOLT_MAGIC);
    hello[4..].copy_from_slice(&version::client_proposals());
    channel.write_raw(&hello).await?;

    let mut reply = [0u8; 4];
    channel.read_raw(&mut reply).await?;

    if reply == HTTP_REPLY {
        return Err(DriverError::unavailable_at(
            channel.address(),
            "server answered with HTTP; check the port (Bolt usually listens on 7687)",
        ));
    }

    let Some(agreed) = ProtocolVersion::from_reply(reply) else {
        return Err(DriverError::UnsupportedProtocol(format!(
            "{} supports none of the proposed Bolt versions",
            channel.address()
        )));
    };
    if !SUPPORTED_VERSIONS.contains(&agreed) {
        return Err(DriverError::protocol(format!(
            "server chose Bolt {agreed}, which was never proposed"
        )));
    }

    tracing::debug!(address = %channel.address(), version = %agreed, "handshake complete");
    Ok(agreed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::channel::ChannelConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn channel() -> (Channel, DuplexStream) {
        let (client, server) = tokio::io::duplex(256);
        let ch = Channel::from_stream(
            Address::new("mem", 7687),
            Box::new(client),
            &ChannelConfig::default(),
        );
        (ch, server)
    }

    async fn answer(mut server: DuplexStream, reply: [u8; 4]) -> [u8; 20] {
        let mut got = [0u8; 20];
        server.read_exact(&mut got).await.unwrap();
        server.write_all(&reply).await.unwrap();
        got
    }

    #[tokio::test]
    async fn negotiates_offered_version() {
        let (mut ch, server) = channel();
        let srv = tokio::spawn(answer(server, [0, 0, 2, 5]));
        let v = handshake(&mut ch).await.unwrap();
        assert_eq!(v, ProtocolVersion::new(5, 2));

        let sent = srv.await.unwrap();
        assert_eq!(&sent[..4], &BOLT_MAGIC);
        assert_eq!(&sent[4..8], &[0, 4, 4, 5]);
    }

    #[tokio::test]
    async fn zero_reply_is_unsupported() {
        let (mut ch, server) = channel();
        tokio::spawn(answer(server, [0, 0, 0, 0]));
        let err = handshake(&mut ch).await.unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedProtocol(_)), "{err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn http_reply_is_explained() {
        let (mut ch, server) = channel();
        tokio::spawn(answer(server, *b"HTTP"));
        let err = handshake(&mut ch).await.unwrap_err();
        assert!(err.to_string().contains("HTTP"));
    }

    #[tokio::test]
    async fn unproposed_version_is_rejected() {
        let (mut ch, server) = channel();
        tokio::spawn(answer(server, [0, 0, 0, 3]));
        let err = handshake(&mut ch).await.unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)), "{err}");
    }
}
