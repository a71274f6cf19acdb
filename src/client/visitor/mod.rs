//! Client-side visitors (spec §4.7): `STCPVisitor`/`SUDPVisitor` dial the
//! server directly and exchange a `NewVisitorConn`/`NewVisitorConnResp`
//! handshake to reach their paired proxy; `XTCPVisitor` instead punches a
//! direct UDP hole via [`crate::nathole`] and multiplexes a
//! [`crate::nathole::tunnel::TunnelSession`] over it. Modeled as one tagged
//! enum per spec §9, mirroring [`crate::client::proxy::ClientProxy`].
//! Grounded on `examples/original_source/client/visitor/sudp.go` (STCP and
//! SUDP share the same dial-and-handshake shape) and `client/visitor/xtcp.go`.

pub mod xtcp;

use crate::client::control::Connector;
use crate::config::VisitorConfig;
use crate::crypto::cipher::CryptoStream;
use crate::crypto::compress::CompressStream;
use crate::crypto::sign_key;
use crate::msg::{Message, MessageTransporter, NewVisitorConn, NewVisitorConnResp};
use crate::nathole::tunnel::AsyncReadWrite;
use crate::udp::{read_packet, write_packet};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex as PLMutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

fn base_config(cfg: &VisitorConfig) -> &crate::config::VisitorBaseConfig {
    match cfg {
        VisitorConfig::Stcp(c) => &c.base,
        VisitorConfig::Sudp(c) => &c.base,
        VisitorConfig::Xtcp(c) => &c.base,
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

struct VisitorState {
    cfg: VisitorConfig,
    connector: Arc<dyn Connector>,
    closed: AtomicBool,
    stun_server: Option<String>,
    fallback: PLMutex<Option<ClientVisitor>>,
    retry_limiter: xtcp::RetryLimiter,
}

#[derive(Clone)]
pub struct ClientVisitor {
    state: Arc<VisitorState>,
}

impl ClientVisitor {
    pub fn new(cfg: VisitorConfig, connector: Arc<dyn Connector>, stun_server: Option<String>) -> Self {
        let max_retries_an_hour = match &cfg {
            VisitorConfig::Xtcp(c) => c.max_retries_an_hour,
            _ => 0,
        };
        ClientVisitor {
            state: Arc::new(VisitorState {
                cfg,
                connector,
                closed: AtomicBool::new(false),
                stun_server,
                fallback: PLMutex::new(None),
                retry_limiter: xtcp::RetryLimiter::new(max_retries_an_hour),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &base_config(&self.state.cfg).name
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    pub fn set_fallback(&self, fallback: ClientVisitor) {
        *self.state.fallback.lock() = Some(fallback);
    }

    fn fallback(&self) -> Option<ClientVisitor> {
        self.state.fallback.lock().clone()
    }

    /// Binds the visitor's local listener and serves connections until
    /// closed. Spawned once per visitor by [`VisitorManager::run_all`].
    async fn run(self, transporter: MessageTransporter) {
        let base = base_config(&self.state.cfg);
        let bind = format!("{}:{}", base.bind_addr, base.bind_port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(visitor = %self.name(), error = %e, "failed to bind visitor listener");
                return;
            }
        };

        loop {
            if self.state.closed.load(Ordering::SeqCst) {
                return;
            }
            let (conn, _peer) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    tracing::debug!(error = %e, "visitor listener accept failed");
                    continue;
                }
            };
            crate::common::net::configure_tcp_stream(&conn);
            let this = self.clone();
            let transporter = transporter.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_user_conn(conn, transporter).await {
                    tracing::debug!(visitor = %this.name(), error = %e, "visitor connection ended");
                }
            });
        }
    }

    async fn serve_user_conn(&self, user_conn: tokio::net::TcpStream, transporter: MessageTransporter) -> Result<()> {
        match &self.state.cfg {
            VisitorConfig::Stcp(_) => self.serve_stcp(user_conn).await,
            VisitorConfig::Sudp(_) => self.serve_sudp(user_conn).await,
            VisitorConfig::Xtcp(_) => xtcp::serve(self.clone(), user_conn, transporter).await,
        }
    }

    /// Dials the server and opens a `NewVisitorConn` tunnel to the paired
    /// proxy (shared by STCP and SUDP, which differ only in what's carried
    /// over the tunnel once it's open).
    async fn open_tunnel(&self) -> Result<Box<dyn AsyncReadWrite>> {
        let base = base_config(&self.state.cfg);
        let raw = self.state.connector.connect().await?;
        let mut conn: Box<dyn AsyncReadWrite> = if base.use_encryption {
            Box::new(CryptoStream::wrap(raw, base.secret_key.as_bytes()))
        } else {
            Box::new(raw)
        };

        let ts = now();
        let msg = NewVisitorConn {
            proxy_name: base.server_name.clone(),
            sign_key: sign_key(&base.secret_key, ts),
            timestamp: ts,
            use_encryption: base.use_encryption,
            use_compression: base.use_compression,
        };
        crate::msg::write_message(&mut conn, &msg.into()).await?;
        let resp = match crate::msg::read_message(&mut conn).await? {
            Message::NewVisitorConnResp(r) => r,
            other => {
                return Err(Error::protocol(format!(
                    "expected NewVisitorConnResp, got tag {}",
                    other.msg_type() as u8
                )))
            }
        };
        check_visitor_resp(&resp)?;

        if base.use_compression {
            Ok(Box::new(CompressStream::wrap(conn)))
        } else {
            Ok(conn)
        }
    }

    async fn serve_stcp(&self, mut user_conn: tokio::net::TcpStream) -> Result<()> {
        let mut tunnel = self.open_tunnel().await?;
        crate::common::buffer::greedy_copy_bidirectional(&mut user_conn, &mut tunnel).await?;
        Ok(())
    }

    /// SUDP tunnels look like STCP ones at the transport level, but the
    /// bytes exchanged are framed `UdpPacket`s so a single tunnel can carry
    /// datagrams for the locally bound UDP listener.
    async fn serve_sudp(&self, user_conn: tokio::net::TcpStream) -> Result<()> {
        let base = base_config(&self.state.cfg);
        let local_socket = UdpSocket::bind(format!("{}:0", base.bind_addr))
            .await
            .map_err(|e| Error::connection(format!("binding sudp local relay socket: {e}")))?;
        drop(user_conn); // the accepted TCP conn is just a trigger; data flows over local_socket

        let mut tunnel = self.open_tunnel().await?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            tokio::select! {
                recv = local_socket.recv_from(&mut buf) => {
                    let (n, from) = recv.map_err(|e| Error::connection(format!("sudp recv: {e}")))?;
                    write_packet(&mut tunnel, buf[..n].to_vec(), from.to_string(), String::new()).await?;
                }
                frame = read_packet(&mut tunnel) => {
                    let packet = frame?;
                    if let Ok(addr) = packet.local_addr.parse::<SocketAddr>() {
                        let _ = local_socket.send_to(&packet.content, addr).await;
                    }
                }
            }
        }
    }
}

fn check_visitor_resp(resp: &NewVisitorConnResp) -> Result<()> {
    if resp.error.is_empty() {
        Ok(())
    } else {
        Err(Error::proxy(format!("visitor connection rejected: {}", resp.error)))
    }
}

/// Registry of every configured visitor plus the shared handle (dispatcher
/// sender + transporter) XTCP needs to negotiate nat hole punches over the
/// control connection.
pub struct VisitorManager {
    visitors: DashMap<String, ClientVisitor>,
    transporter: PLMutex<Option<MessageTransporter>>,
    handles: PLMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl VisitorManager {
    pub fn new() -> Self {
        VisitorManager {
            visitors: DashMap::new(),
            transporter: PLMutex::new(None),
            handles: PLMutex::new(Vec::new()),
        }
    }

    pub fn from_config(cfgs: Vec<VisitorConfig>, connector: Arc<dyn Connector>, stun_server: Option<String>) -> Self {
        let manager = Self::new();
        for cfg in &cfgs {
            let visitor = ClientVisitor::new(cfg.clone(), connector.clone(), stun_server.clone());
            manager.visitors.insert(visitor.name().to_string(), visitor);
        }
        for cfg in &cfgs {
            let VisitorConfig::Xtcp(xtcp_cfg) = cfg else { continue };
            let Some(fallback_name) = &xtcp_cfg.fallback_to else { continue };
            let (Some(visitor), Some(fallback)) = (
                manager.visitors.get(&xtcp_cfg.base.name).map(|v| v.clone()),
                manager.visitors.get(fallback_name.as_str()).map(|v| v.clone()),
            ) else {
                continue;
            };
            visitor.set_fallback(fallback);
        }
        manager
    }

    pub fn attach(&self, _sender: mpsc::Sender<Message>, transporter: MessageTransporter) {
        *self.transporter.lock() = Some(transporter);
    }

    pub fn run_all(&self) {
        let Some(transporter) = self.transporter.lock().clone() else {
            tracing::warn!("visitor manager started before a control connection was attached");
            return;
        };
        let mut handles = self.handles.lock();
        for entry in self.visitors.iter() {
            let visitor = entry.value().clone();
            let transporter = transporter.clone();
            handles.push(tokio::spawn(visitor.run(transporter)));
        }
    }

    pub fn close_all(&self) {
        for entry in self.visitors.iter() {
            entry.value().close();
        }
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Default for VisitorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::control::TcpConnector;
    use crate::config::{StcpVisitorConfig, VisitorBaseConfig};

    fn stcp_cfg(name: &str) -> VisitorConfig {
        VisitorConfig::Stcp(StcpVisitorConfig {
            base: VisitorBaseConfig {
                name: name.into(),
                server_name: "shared-proxy".into(),
                secret_key: "s3cr3t".into(),
                bind_addr: "127.0.0.1".into(),
                bind_port: 0,
                use_encryption: true,
                use_compression: false,
            },
        })
    }

    #[test]
    fn visitor_name_comes_from_base_config() {
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector {
            server_addr: "127.0.0.1".into(),
            server_port: 7000,
        });
        let visitor = ClientVisitor::new(stcp_cfg("office-rdp"), connector, None);
        assert_eq!(visitor.name(), "office-rdp");
    }

    #[test]
    fn check_visitor_resp_surfaces_server_error() {
        let err = check_visitor_resp(&NewVisitorConnResp {
            proxy_name: "p".into(),
            error: "no such proxy".into(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
    }
}
