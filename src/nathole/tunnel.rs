//! Handover of a punched UDP flow to a multiplexed session (spec §4.8
//! step 5). Grounded on `examples/original_source/client/visitor/xtcp.go`'s
//! `TunnelSession` interface (`KCPTunnelSession` / `QUICTunnelSession`).
//!
//! No KCP crate is available in the retrieved example pack (see
//! DESIGN.md), so the `kcp` protocol choice is served by
//! [`YamuxOverUdpTunnelSession`] — yamux multiplexing directly over the
//! connected UDP socket, without KCP's forward error correction/ordering.
//! This is a disclosed simplification, not an attempt to reproduce KCP.

use crate::{Error, Result};
use async_trait::async_trait;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use yamux::{Config as YamuxConfig, Connection, Mode};

/// One multiplexed byte-stream session layered over a hole-punched UDP
/// flow. `open_stream` is called once per user connection the XTCP
/// visitor/proxy needs to carry.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn AsyncReadWrite>>;
    /// Cheap liveness probe used by the visitor's `keepTunnelOpen` loop.
    async fn ping(&self) -> Result<()>;
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Connects `socket` (already holding the hole-punched peer as its
/// `connect`ed remote) to `remote` and negotiates a QUIC session over it.
pub struct QuicTunnelSession {
    connection: quinn::Connection,
}

impl QuicTunnelSession {
    pub async fn dial(socket: std::net::UdpSocket, remote: SocketAddr, server_name: &str) -> Result<Self> {
        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        let client_config = QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| Error::nathole(format!("building quic client config: {e}")))?,
        ));

        let mut endpoint = Endpoint::new(
            quinn::EndpointConfig::default(),
            None,
            socket,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| Error::nathole(format!("creating quic endpoint from hole-punched socket: {e}")))?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint
            .connect(remote, server_name)
            .map_err(|e| Error::nathole(format!("starting quic handshake: {e}")))?;
        let connection = connecting
            .await
            .map_err(|e| Error::nathole(format!("quic handshake failed: {e}")))?;

        Ok(QuicTunnelSession { connection })
    }
}

#[async_trait]
impl TunnelSession for QuicTunnelSession {
    async fn open_stream(&self) -> Result<Box<dyn AsyncReadWrite>> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::nathole(format!("opening quic stream: {e}")))?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn ping(&self) -> Result<()> {
        // opening and immediately dropping a uni stream is enough to
        // surface a dead connection without carrying user data
        self.connection
            .open_uni()
            .await
            .map_err(|e| Error::nathole(format!("quic tunnel ping failed: {e}")))?;
        Ok(())
    }
}

struct QuicBiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.send).poll_write(cx, buf)
    }
    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_flush(cx)
    }
    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The KCP-substitute path: a yamux connection driven directly by reads
/// and writes on the connected UDP socket. Since XTCP already put the
/// socket through `connect()` to the punched peer, this is just framing
/// yamux over an `AsyncRead + AsyncWrite` adapter around `send`/`recv`.
pub struct YamuxOverUdpTunnelSession {
    control: tokio::sync::Mutex<yamux::Control>,
}

impl YamuxOverUdpTunnelSession {
    pub fn new(socket: UdpSocket, is_server: bool) -> Self {
        let mode = if is_server { Mode::Server } else { Mode::Client };
        let io = UdpDuplex { socket: Arc::new(socket) };
        let connection = Connection::new(io, YamuxConfig::default(), mode);
        let control = connection.control();
        tokio::spawn(drive_yamux(connection));
        YamuxOverUdpTunnelSession {
            control: tokio::sync::Mutex::new(control),
        }
    }
}

async fn drive_yamux<T>(mut connection: Connection<T>)
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    use futures::future::poll_fn;
    loop {
        let next = poll_fn(|cx| connection.poll_next_inbound(cx)).await;
        match next {
            Some(Ok(_stream)) => {
                // inbound streams for this tunnel direction are handled by
                // the visitor/proxy that owns this session, not here
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "yamux-over-udp tunnel closing");
                break;
            }
            None => break,
        }
    }
}

#[async_trait]
impl TunnelSession for YamuxOverUdpTunnelSession {
    async fn open_stream(&self) -> Result<Box<dyn AsyncReadWrite>> {
        let mut control = self.control.lock().await;
        let stream = control
            .open_stream()
            .await
            .map_err(|e| Error::nathole(format!("opening yamux stream: {e}")))?;
        Ok(Box::new(YamuxStreamAdapter(stream)))
    }

    async fn ping(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        control
            .open_stream()
            .await
            .map_err(|e| Error::nathole(format!("yamux tunnel ping failed: {e}")))?;
        Ok(())
    }
}

struct YamuxStreamAdapter(yamux::Stream);

impl AsyncRead for YamuxStreamAdapter {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use futures::AsyncRead as _;
        let unfilled = buf.initialize_unfilled();
        match std::pin::Pin::new(&mut self.0).poll_read(cx, unfilled) {
            std::task::Poll::Ready(Ok(n)) => {
                buf.advance(n);
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl AsyncWrite for YamuxStreamAdapter {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use futures::AsyncWrite as _;
        std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
    }
    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use futures::AsyncWrite as _;
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }
    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use futures::AsyncWrite as _;
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Adapts a connected `UdpSocket` to `futures::io::{AsyncRead,AsyncWrite}`
/// so yamux (which speaks `futures-io`, not `tokio::io`) can frame its
/// protocol directly over datagrams.
#[derive(Clone)]
struct UdpDuplex {
    socket: Arc<UdpSocket>,
}

impl futures::AsyncRead for UdpDuplex {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let mut read_buf = tokio::io::ReadBuf::new(buf);
        match self.socket.poll_recv(cx, &mut read_buf) {
            std::task::Poll::Ready(Ok(())) => {
                std::task::Poll::Ready(Ok(read_buf.filled().len()))
            }
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl futures::AsyncWrite for UdpDuplex {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }
    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
