//! Server-side UDP proxy: one public `UdpSocket` fans datagrams out to
//! per-remote sessions, each backed by its own work connection framing
//! traffic as [`crate::msg::UdpPacket`] (spec §4.6 UDP). Grounded on
//! `examples/original_source/client/proxy/udp.go`'s `UDPProxy` session
//! bookkeeping, mirrored server-side.

use crate::msg::{write_message, Message, StartWorkConn};
use crate::server::control::Control;
use crate::server::proxy::ServerProxy;
use crate::udp::{read_packet, write_packet};
use crate::{Error, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Bound {
    pub local_addr: String,
    socket: Arc<UdpSocket>,
}

pub async fn bind(addr: &str) -> Result<Bound> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::proxy(format!("binding udp proxy socket {addr}: {e}")))?;
    let local_addr = socket
        .local_addr()
        .map_err(|e| Error::proxy(format!("reading bound udp proxy address: {e}")))?
        .to_string();
    Ok(Bound { local_addr, socket: Arc::new(socket) })
}

impl Bound {
    pub fn spawn(self, proxy: ServerProxy, control: Arc<Control>, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let socket = self.socket;
            let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                if control.is_closing() {
                    return;
                }
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "udp proxy socket closing");
                        return;
                    }
                };
                if let Some(tx) = sessions.get(&peer) {
                    let _ = tx.send(buf[..n].to_vec()).await;
                    continue;
                }

                let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
                sessions.insert(peer, tx.clone());
                let _ = tx.send(buf[..n].to_vec()).await;

                let proxy = proxy.clone();
                let control = control.clone();
                let socket = socket.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_session(proxy, socket.clone(), peer, control, rx, timeout).await {
                        tracing::debug!(error = %e, peer = %peer, "udp proxy session ended");
                    }
                    sessions.remove(&peer);
                });
            }
        })
    }
}

async fn serve_session(
    proxy: ServerProxy,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    control: Arc<Control>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
) -> Result<()> {
    let pool = control.pool();
    let sender = control.sender();
    let mut work = pool.pop(&sender, timeout).await?;

    let start = StartWorkConn {
        proxy_name: proxy.name().to_string(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        ..Default::default()
    };
    write_message(&mut work, &Message::from(start)).await?;

    let mut work = proxy.wrap_conn(work);

    loop {
        tokio::select! {
            datagram = inbound.recv() => {
                let Some(content) = datagram else { return Ok(()) };
                write_packet(&mut work, content, socket.local_addr().map(|a| a.to_string()).unwrap_or_default(), peer.to_string()).await?;
            }
            frame = read_packet(&mut work) => {
                let packet = frame?;
                socket.send_to(&packet.content, peer).await.map_err(|e| Error::connection(e.to_string()))?;
            }
            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                return Ok(());
            }
        }
    }
}
