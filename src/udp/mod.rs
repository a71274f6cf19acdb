//! Frames UDP datagrams inside a TCP work connection (spec §4.6 UDP,
//! §9 "UDP framing"). The wire shape is just [`crate::msg::UdpPacket`]
//! sent through the ordinary message codec — this module is the
//! higher-level helper for reading/writing one packet at a time and the
//! remote-address keyed session table both proxy and visitor sides use to
//! route inbound datagrams to the right peer.

use crate::msg::{read_message, write_message, Message, UdpPacket};
use crate::{Error, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

pub async fn write_packet<W>(w: &mut W, content: Vec<u8>, local_addr: String, remote_addr: String) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(
        w,
        &UdpPacket {
            content,
            local_addr,
            remote_addr,
        }
        .into(),
    )
    .await
}

pub async fn read_packet<R>(r: &mut R) -> Result<UdpPacket>
where
    R: AsyncRead + Unpin,
{
    match read_message(r).await? {
        Message::UdpPacket(p) => Ok(p),
        Message::Ping(_) => Err(Error::protocol("expected UdpPacket, got a heartbeat Ping")),
        other => Err(Error::protocol(format!(
            "expected UdpPacket, got {:?}",
            other.msg_type() as u8
        ))),
    }
}

struct Session {
    last_seen: Instant,
}

/// Maps a visitor's `(ip, port)` to routing state, with idle expiry — the
/// server side uses this to know which UDP peer a reply belongs to, since
/// a single server UDP listener fans out to many visitors through one
/// work connection.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<SocketAddr, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, addr: SocketAddr) {
        self.sessions.insert(addr, Session {
            last_seen: Instant::now(),
        });
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.sessions.contains_key(addr)
    }

    pub fn expire_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        self.sessions
            .retain(|_, s| now.duration_since(s.last_seen) < idle_for);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Client side: dials the local UDP service and mirrors packets arriving
/// on the work connection to it, returning replies the same way.
pub async fn bind_local(local_addr: &str) -> Result<UdpSocket> {
    let sock = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::connection(format!("failed to bind local UDP socket: {e}")))?;
    sock.connect(local_addr)
        .await
        .map_err(|e| Error::connection(format!("failed to connect to local UDP service {local_addr}: {e}")))?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_then_read_packet_roundtrips() {
        let (mut a, mut b) = duplex(1024);
        write_packet(&mut a, vec![0xAA, 0xBB], "127.0.0.1:9000".into(), "1.2.3.4:5555".into())
            .await
            .unwrap();
        let pkt = read_packet(&mut b).await.unwrap();
        assert_eq!(pkt.content, vec![0xAA, 0xBB]);
        assert_eq!(pkt.remote_addr, "1.2.3.4:5555");
    }

    #[test]
    fn session_table_tracks_and_expires() {
        let table = SessionTable::new();
        let addr: SocketAddr = "1.2.3.4:9999".parse().unwrap();
        table.touch(addr);
        assert!(table.contains(&addr));
        table.expire_idle(Duration::from_secs(0));
        assert!(!table.contains(&addr));
    }
}
