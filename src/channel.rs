//! Byte transport for one connection: plain TCP, TLS, or any in-memory
//! stream.
//!
//! A channel starts in [`ChannelState::Connecting`], where only raw reads and
//! writes (the handshake) are allowed. [`Channel::mark_open`] switches it to
//! chunked message framing. Any I/O failure closes it for good.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::address::Address;
use crate::chunk::{ChunkReader, ChunkWriter};
use crate::config::TlsConfig;
use crate::error::DriverError;

/// Any duplex byte stream a channel can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Socket-level settings applied when a channel is created.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls: Option<TlsConfig>,
}

enum Inner {
    Connecting(BoxedStream),
    Open {
        reader: ChunkReader<ReadHalf<BoxedStream>>,
        writer: ChunkWriter<WriteHalf<BoxedStream>>,
    },
    Closed,
}

pub struct Channel {
    address: Address,
    inner: Inner,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Channel {
    /// Opens a TCP (and optionally TLS) stream to `address`.
    pub async fn connect(address: &Address, config: &ChannelConfig) -> Result<Self, DriverError> {
        let target = address.to_socket_string();
        let connect = TcpStream::connect(target.as_str());
        let tcp = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                DriverError::unavailable_at(address, format!("connect timed out after {limit:?}"))
            })?,
            None => connect.await,
        }
        .map_err(|e| DriverError::unavailable_at(address, format!("connect failed: {e}")))?;
        tcp.set_nodelay(true)?;

        let stream: BoxedStream = match &config.tls {
            Some(tls) => tls::wrap(address, tcp, tls).await?,
            None => Box::new(tcp),
        };

        tracing::debug!(address = %address, tls = config.tls.is_some(), "channel connected");
        Ok(Self::from_stream(address.clone(), stream, config))
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(address: Address, stream: BoxedStream, config: &ChannelConfig) -> Self {
        Self {
            address,
            inner: Inner::Connecting(stream),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        match self.inner {
            Inner::Connecting(_) => ChannelState::Connecting,
            Inner::Open { .. } => ChannelState::Open,
            Inner::Closed => ChannelState::Closed,
        }
    }

    /// Overrides the read timeout, e.g. from a server connection hint.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Writes raw bytes; only valid before framing starts.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let limit = self.write_timeout;
        let result = match &mut self.inner {
            Inner::Connecting(stream) => {
                let io = async {
                    stream.write_all(data).await?;
                    stream.flush().await
                };
                with_timeout(limit, io)
                    .await
                    .and_then(|r| r)
                    .map_err(DriverError::from)
            }
            _ => Err(DriverError::protocol("raw write on a framed channel")),
        };
        self.check(result)
    }

    /// Reads exactly `buf.len()` raw bytes; only valid before framing starts.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        let limit = self.read_timeout;
        let result = match &mut self.inner {
            Inner::Connecting(stream) => with_timeout(limit, stream.read_exact(buf))
                .await
                .and_then(|r| r)
                .map(|_| ())
                .map_err(DriverError::from),
            _ => Err(DriverError::protocol("raw read on a framed channel")),
        };
        self.check(result)
    }

    /// Switches from raw handshake bytes to chunked messages.
    pub fn mark_open(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Connecting(stream) => {
                let (rh, wh) = tokio::io::split(stream);
                self.inner = Inner::Open {
                    reader: ChunkReader::new(rh),
                    writer: ChunkWriter::new(wh),
                };
            }
            other => self.inner = other,
        }
    }

    /// Queues one encoded message for the next [`flush`](Self::flush).
    pub fn queue(&mut self, message: &[u8]) -> Result<(), DriverError> {
        match &mut self.inner {
            Inner::Open { writer, .. } => {
                writer.queue_message(message);
                Ok(())
            }
            _ => Err(not_open(&self.address)),
        }
    }

    pub async fn flush(&mut self) -> Result<(), DriverError> {
        let limit = self.write_timeout;
        let result = match &mut self.inner {
            Inner::Open { writer, .. } => with_timeout(limit, writer.flush())
                .await
                .unwrap_or_else(|e| Err(DriverError::Io(e))),
            _ => Err(not_open(&self.address)),
        };
        self.check(result)
    }

    /// Reads one complete message.
    pub async fn read_message(&mut self) -> Result<BytesMut, DriverError> {
        let limit = self.read_timeout;
        let result = match &mut self.inner {
            Inner::Open { reader, .. } => with_timeout(limit, reader.read_message())
                .await
                .unwrap_or_else(|e| Err(DriverError::Io(e))),
            _ => Err(not_open(&self.address)),
        };
        self.check(result)
    }

    /// Shuts the stream down. Idempotent.
    pub async fn close(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Connecting(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Inner::Open { reader, writer } => {
                let mut stream = reader.into_inner().unsplit(writer.into_inner());
                let _ = stream.shutdown().await;
            }
            Inner::Closed => {}
        }
    }

    /// Closes the channel on any error so a broken stream is never reused.
    fn check<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if result.is_err() {
            self.inner = Inner::Closed;
        }
        result
    }
}

fn not_open(address: &Address) -> DriverError {
    DriverError::unavailable_at(address, "channel is not open")
}

/// Runs `fut` under an optional deadline; an elapsed deadline becomes
/// `ErrorKind::TimedOut`.
async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> std::io::Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no progress within {limit:?}"),
            )
        }),
        None => Ok(fut.await),
    }
}

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;

    use rustls_pki_types::pem::PemObject;
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{
        CryptoProvider, verify_tls12_signature, verify_tls13_signature,
    };
    use tokio_rustls::rustls::{
        ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
    };

    use super::BoxedStream;
    use crate::address::Address;
    use crate::config::{TlsConfig, Trust};
    use crate::error::DriverError;

    pub(super) async fn wrap(
        address: &Address,
        tcp: TcpStream,
        tls: &TlsConfig,
    ) -> Result<BoxedStream, DriverError> {
        let config = client_config(tls)?;
        let name = ServerName::try_from(address.host().to_string())
            .map_err(|e| DriverError::Configuration(format!("invalid TLS server name: {e}")))?;
        let stream = TlsConnector::from(Arc::new(config))
            .connect(name, tcp)
            .await
            .map_err(|e| DriverError::unavailable_at(address, format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(stream))
    }

    fn client_config(tls: &TlsConfig) -> Result<ClientConfig, DriverError> {
        let builder = ClientConfig::builder();
        let config = match &tls.trust {
            Trust::AllCertificates => {
                let provider = builder.crypto_provider().clone();
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(TrustAll { provider }))
                    .with_no_client_auth()
            }
            Trust::CustomCertificates(paths) => {
                let mut roots = RootCertStore::empty();
                for path in paths {
                    let certs = CertificateDer::pem_file_iter(path).map_err(|e| {
                        DriverError::Configuration(format!("cannot read {}: {e}", path.display()))
                    })?;
                    for cert in certs {
                        let cert = cert.map_err(|e| {
                            DriverError::Configuration(format!("bad PEM in {}: {e}", path.display()))
                        })?;
                        roots.add(cert).map_err(|e| {
                            DriverError::Configuration(format!(
                                "unusable certificate in {}: {e}",
                                path.display()
                            ))
                        })?;
                    }
                }
                if roots.is_empty() {
                    return Err(DriverError::Configuration(
                        "TLS trust requires at least one CA certificate".into(),
                    ));
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };
        Ok(config)
    }

    /// Accepts any server certificate but still checks handshake signatures.
    #[derive(Debug)]
    struct TrustAll {
        provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for TrustAll {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, TlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(not(feature = "tls"))]
mod tls {
    use tokio::net::TcpStream;

    use super::BoxedStream;
    use crate::address::Address;
    use crate::config::TlsConfig;
    use crate::error::DriverError;

    pub(super) async fn wrap(
        _address: &Address,
        _tcp: TcpStream,
        _tls: &TlsConfig,
    ) -> Result<BoxedStream, DriverError> {
        Err(DriverError::Configuration(
            "encrypted connections need the `tls` feature".into(),
        ))
    }
}
