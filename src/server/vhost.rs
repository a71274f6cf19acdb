//! Virtual-host routing for HTTP/HTTPS/TCPMUX proxies, which share the
//! server's `vhost-http-port`/`vhost-https-port` rather than each binding
//! their own listener (spec §4.6). Grounded on
//! `examples/original_source/pkg/util/vhost/resource.go`'s host-based
//! muxer; the 404/503 bodies are generic placeholders, not the original's
//! branded HTML (Non-goal).

use crate::msg::{write_message, Message, StartWorkConn};
use crate::server::proxy::ProxyRegistry;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Which header this listener routes on. HTTPS terminates no TLS at the
/// server (spec §4.6): it reads the ClientHello's SNI extension instead
/// of a plaintext `Host:` line, then replays the same bytes to the work
/// connection untouched.
#[derive(Clone, Copy, PartialEq, Eq)]
enum VhostMode {
    Http,
    Https,
}

pub struct VhostRouter {
    registry: ProxyRegistry,
    mode: VhostMode,
}

impl VhostRouter {
    pub fn new(registry: ProxyRegistry) -> Arc<Self> {
        Arc::new(VhostRouter { registry, mode: VhostMode::Http })
    }

    pub fn new_https(registry: ProxyRegistry) -> Arc<Self> {
        Arc::new(VhostRouter { registry, mode: VhostMode::Https })
    }

    pub fn spawn_listener(self: Arc<Self>, bind_addr: String, port: u16, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = format!("{bind_addr}:{port}");
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(%addr, error = %e, "vhost listener failed to bind");
                    return;
                }
            };
            loop {
                match listener.accept().await {
                    Ok((conn, peer)) => {
                        crate::common::net::configure_tcp_stream(&conn);
                        let this = self.clone();
                        let peer = peer.to_string();
                        tokio::spawn(async move {
                            if let Err(e) = this.serve(conn, peer, timeout).await {
                                tracing::debug!(error = %e, "vhost request ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "vhost listener closing");
                        return;
                    }
                }
            }
        })
    }

    async fn serve(&self, mut conn: TcpStream, src_addr: String, timeout: Duration) -> Result<()> {
        let mut head = vec![0u8; 8192];
        let n = conn
            .read(&mut head)
            .await
            .map_err(|e| Error::connection(format!("reading vhost request head: {e}")))?;
        head.truncate(n);

        let host = match self.mode {
            VhostMode::Http => parse_host_header(&head),
            VhostMode::Https => parse_client_hello_sni(&head),
        };
        let host = match host {
            Some(h) => h,
            None => {
                if self.mode == VhostMode::Http {
                    let _ = conn.write_all(NOT_FOUND).await;
                    return Err(Error::proxy("vhost request carried no Host header"));
                }
                return Err(Error::proxy("vhost TLS ClientHello carried no SNI extension"));
            }
        };

        let Some((proxy, control)) = self.registry.resolve_domain(&host) else {
            if self.mode == VhostMode::Http {
                let _ = conn.write_all(NOT_FOUND).await;
            }
            return Err(Error::proxy(format!("no proxy registered for host {host}")));
        };

        let pool = control.pool();
        let sender = control.sender();
        let mut work = match pool.pop(&sender, timeout).await {
            Ok(w) => w,
            Err(e) => {
                if self.mode == VhostMode::Http {
                    let _ = conn.write_all(SERVICE_UNAVAILABLE).await;
                }
                return Err(e);
            }
        };

        let start = StartWorkConn {
            proxy_name: proxy.name().to_string(),
            src_addr,
            ..Default::default()
        };
        write_message(&mut work, &Message::from(start)).await?;

        let mut work = proxy.wrap_conn(work);
        // The bytes already read while peeking the Host header belong to
        // the backend, not us - replay them before relaying the rest.
        work.write_all(&head)
            .await
            .map_err(|e| Error::connection(format!("replaying vhost request head: {e}")))?;

        crate::common::net::copy_bidirectional_owned(work, conn).await?;
        Ok(())
    }
}

fn parse_host_header(head: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Host:").or_else(|| line.strip_prefix("host:")) {
            let host = rest.trim();
            return host.split(':').next().map(|h| h.to_string());
        }
    }
    None
}

fn u16be(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

fn u24be(buf: &[u8], pos: usize) -> Option<usize> {
    Some(((*buf.get(pos)? as usize) << 16) | ((*buf.get(pos + 1)? as usize) << 8) | (*buf.get(pos + 2)? as usize))
}

/// Reads the SNI host name out of a TLS ClientHello without terminating
/// the handshake - just enough record/handshake/extension parsing to
/// find the `server_name` extension (RFC 6066 §3). Returns `None` on
/// anything that doesn't look like a well-formed ClientHello carrying
/// one, rather than erroring, since a client hello missing SNI is a
/// routing miss, not a protocol violation.
fn parse_client_hello_sni(head: &[u8]) -> Option<String> {
    if *head.first()? != 0x16 {
        return None;
    }
    let record_len = u16be(head, 3)? as usize;
    let record_end = (5usize.checked_add(record_len)?).min(head.len());

    let mut pos = 5;
    if *head.get(pos)? != 0x01 {
        return None;
    }
    pos += 1;
    let hs_len = u24be(head, pos)?;
    pos += 3;
    let hs_end = (pos.checked_add(hs_len)?).min(record_end);

    pos += 2 + 32; // client_version, random
    let session_id_len = *head.get(pos)? as usize;
    pos += 1 + session_id_len;
    let cipher_len = u16be(head, pos)? as usize;
    pos += 2 + cipher_len;
    let comp_len = *head.get(pos)? as usize;
    pos += 1 + comp_len;
    if pos + 2 > hs_end {
        return None;
    }
    let ext_total_len = u16be(head, pos)? as usize;
    pos += 2;
    let ext_end = (pos.checked_add(ext_total_len)?).min(hs_end);

    while pos + 4 <= ext_end {
        let ext_type = u16be(head, pos)?;
        let ext_len = u16be(head, pos + 2)? as usize;
        pos += 4;
        let data_end = pos.checked_add(ext_len)?;
        if data_end > ext_end {
            return None;
        }
        if ext_type == 0x0000 {
            let mut p = pos;
            if p + 2 > data_end {
                return None;
            }
            let list_len = u16be(head, p)? as usize;
            p += 2;
            let list_end = (p.checked_add(list_len)?).min(data_end);
            while p + 3 <= list_end {
                let name_type = head[p];
                let name_len = u16be(head, p + 1)? as usize;
                p += 3;
                if p + name_len > list_end {
                    break;
                }
                if name_type == 0 {
                    return std::str::from_utf8(&head[p..p + name_len]).ok().map(|s| s.to_string());
                }
                p += name_len;
            }
        }
        pos = data_end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_header_strips_port() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        assert_eq!(parse_host_header(req), Some("example.com".to_string()));
    }

    #[test]
    fn parse_host_header_missing_is_none() {
        let req = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(parse_host_header(req), None);
    }

    fn build_client_hello_with_sni(host: &str) -> Vec<u8> {
        let mut sni_entry = Vec::new();
        sni_entry.push(0u8);
        sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(host.as_bytes());

        let mut sni_ext_data = Vec::new();
        sni_ext_data.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext_data.extend_from_slice(&sni_entry);

        let mut extension = Vec::new();
        extension.extend_from_slice(&0u16.to_be_bytes());
        extension.extend_from_slice(&(sni_ext_data.len() as u16).to_be_bytes());
        extension.extend_from_slice(&sni_ext_data);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x2f]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&extension);

        let mut handshake = Vec::new();
        handshake.push(0x01);
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parse_client_hello_sni_finds_host_name() {
        let record = build_client_hello_with_sni("example.com");
        assert_eq!(parse_client_hello_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn parse_client_hello_sni_rejects_non_handshake_record() {
        let req = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(parse_client_hello_sni(req), None);
    }
}
