//! XTCP visitor: negotiates a direct hole-punched tunnel to its paired
//! proxy instead of relaying through the server (spec §4.7, §4.8).
//! Grounded on `examples/original_source/client/visitor/xtcp.go` —
//! `retryLimiter`, `keepTunnelOpen` and `FallbackTo` all mirror that
//! file's structure, translated onto [`crate::nathole`]'s executor/tunnel
//! split.

use super::ClientVisitor;
use crate::config::{VisitorBaseConfig, VisitorConfig, XtcpVisitorConfig};
use crate::msg::{Message, MessageTransporter, MessageType, NatHoleVisitor};
use crate::nathole::executor::{make_hole, prepare};
use crate::nathole::tunnel::{AsyncReadWrite, QuicTunnelSession, TunnelSession, YamuxOverUdpTunnelSession};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use uuid::Uuid;

/// Leaky-bucket cap on punch attempts, keyed to `max-retries-an-hour`
/// (0 means unlimited). One lives in each visitor's state, reset on the
/// hour since its first use.
pub(super) struct RetryLimiter {
    max_per_hour: u32,
    window_start: Mutex<Instant>,
    count: Mutex<u32>,
}

impl RetryLimiter {
    pub(super) fn new(max_per_hour: u32) -> Self {
        RetryLimiter {
            max_per_hour,
            window_start: Mutex::new(Instant::now()),
            count: Mutex::new(0),
        }
    }

    fn allow(&self) -> bool {
        if self.max_per_hour == 0 {
            return true;
        }
        let mut start = self.window_start.lock();
        let mut count = self.count.lock();
        if start.elapsed() >= Duration::from_secs(3600) {
            *start = Instant::now();
            *count = 0;
        }
        if *count >= self.max_per_hour {
            return false;
        }
        *count += 1;
        true
    }
}

fn xtcp_cfg(cfg: &VisitorConfig) -> Option<&XtcpVisitorConfig> {
    match cfg {
        VisitorConfig::Xtcp(c) => Some(c),
        _ => None,
    }
}

fn base(cfg: &XtcpVisitorConfig) -> &VisitorBaseConfig {
    &cfg.base
}

/// Serves one accepted user connection: punches (or reuses, when
/// `keep-tunnel-open` is set and a session is already live) a direct UDP
/// path to the proxy, opens a stream over it, and relays bytes. Falls
/// back to a sibling visitor if punching fails and one is configured.
pub async fn serve(
    visitor: ClientVisitor,
    mut user_conn: tokio::net::TcpStream,
    transporter: MessageTransporter,
) -> Result<()> {
    let Some(cfg) = xtcp_cfg(&visitor.state.cfg) else {
        return Err(Error::internal("xtcp::serve called with a non-xtcp visitor"));
    };

    match punch_and_open(&visitor, cfg, &transporter).await {
        Ok(mut tunnel) => {
            crate::common::buffer::greedy_copy_bidirectional(&mut user_conn, &mut tunnel).await?;
            Ok(())
        }
        Err(e) => {
            if let Some(fallback) = visitor.fallback() {
                tracing::warn!(
                    visitor = %visitor.name(),
                    fallback = %fallback.name(),
                    error = %e,
                    "xtcp hole punch failed, falling back"
                );
                fallback.serve_user_conn(user_conn, transporter).await
            } else {
                Err(e)
            }
        }
    }
}

async fn punch_and_open(
    visitor: &ClientVisitor,
    cfg: &XtcpVisitorConfig,
    transporter: &MessageTransporter,
) -> Result<Box<dyn AsyncReadWrite>> {
    let base = base(cfg);
    if !visitor.state.retry_limiter.allow() {
        return Err(Error::nathole("xtcp retry limit reached for this hour"));
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::connection(format!("binding xtcp hole punch socket: {e}")))?;
    let stun_server = visitor
        .state
        .stun_server
        .clone()
        .ok_or_else(|| Error::config("no stun-server configured for xtcp visitor"))?;
    let prepared = prepare(&socket, &stun_server).await?;

    let transaction_id = Uuid::new_v4().to_string();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let request = NatHoleVisitor {
        transaction_id: transaction_id.clone(),
        proxy_name: base.server_name.clone(),
        pre_check: false,
        protocol: String::new(),
        sign_key: crate::crypto::sign_key(&base.secret_key, ts),
        timestamp: ts,
        mapped_addrs: prepared.addrs.iter().map(|a| a.to_string()).collect(),
        assisted_addrs: prepared.assisted_addrs.iter().map(|a| a.to_string()).collect(),
    };

    let reply = transporter
        .do_request(
            Message::from(request),
            transaction_id.clone(),
            MessageType::NatHoleResp,
            Duration::from_secs(10),
        )
        .await?;
    let resp = match reply {
        Message::NatHoleResp(r) => r,
        other => {
            return Err(Error::protocol(format!(
                "expected NatHoleResp, got tag {}",
                other.msg_type() as u8
            )))
        }
    };
    if !resp.error.is_empty() {
        return Err(Error::nathole(format!("server rejected nat hole request: {}", resp.error)));
    }

    let peer = make_hole(&socket, &resp.detect_behavior, &base.secret_key, &resp.transaction_id).await?;
    let std_socket = socket
        .into_std()
        .map_err(|e| Error::nathole(format!("converting hole-punched socket: {e}")))?;
    std_socket
        .connect(peer)
        .map_err(|e| Error::nathole(format!("connecting hole-punched socket to peer: {e}")))?;

    let session: Box<dyn TunnelSession> = if resp.protocol == "kcp" {
        let tokio_socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Error::nathole(format!("rewrapping hole-punched socket: {e}")))?;
        Box::new(YamuxOverUdpTunnelSession::new(tokio_socket, false))
    } else {
        Box::new(QuicTunnelSession::dial(std_socket, peer, "xtcp").await?)
    };

    session.open_stream().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_limiter_caps_attempts_within_the_hour() {
        let limiter = RetryLimiter::new(2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn retry_limiter_of_zero_never_blocks() {
        let limiter = RetryLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }
}
