//! Server-side proxies (spec §4.6): the listening/relaying half of the
//! eight proxy types. Modeled as one tagged enum, mirroring
//! [`crate::client::proxy::ClientProxy`]'s design rather than a trait per
//! type (spec §9 design note). Grounded on
//! `examples/original_source/server/control.go`'s proxy registration and
//! `pkg/util/vhost/resource.go`'s domain routing table.

pub mod tcp;
pub mod udp;

use crate::config::ServerConfig;
use crate::crypto::cipher::CryptoStream;
use crate::crypto::compress::CompressStream;
use crate::crypto::verify_sign_key;
use crate::limit::{parse_rate, LimitedStream, SharedLimiter};
use crate::msg::{Message, NewProxy, NewVisitorConn, NewVisitorConnResp, StartWorkConn};
use crate::nathole::tunnel::AsyncReadWrite;
use crate::server::control::Control;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Parses frp's `allow-ports` syntax (`"2000-3000,3001,4000-5000"`) and
/// tracks how many of a client's ports are in use, for
/// `max-ports-per-client` (spec §4.6 edge case: N+1th proxy rejected and
/// rolled back).
pub struct PortAllocator {
    ranges: Vec<(u16, u16)>,
    used_by_run: DashMap<String, usize>,
    max_per_client: Option<usize>,
}

impl PortAllocator {
    pub fn new(spec: &str, max_per_client: Option<usize>) -> Self {
        let mut ranges = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse(), hi.trim().parse()) {
                    ranges.push((lo, hi));
                }
            } else if let Ok(p) = part.parse() {
                ranges.push((p, p));
            }
        }
        PortAllocator {
            ranges,
            used_by_run: DashMap::new(),
            max_per_client,
        }
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| port >= *lo && port <= *hi)
    }

    /// Reserves one port slot for `run_id`. Rolls back (does not count the
    /// attempt) if the client's quota is already exhausted.
    pub fn try_reserve(&self, run_id: &str) -> Result<()> {
        if let Some(max) = self.max_per_client {
            let mut count = self.used_by_run.entry(run_id.to_string()).or_insert(0);
            if *count >= max {
                return Err(Error::proxy(format!("client {run_id} has reached max-ports-per-client ({max})")));
            }
            *count += 1;
        }
        Ok(())
    }

    pub fn release(&self, run_id: &str) {
        if let Some(mut count) = self.used_by_run.get_mut(run_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProxyKind {
    Tcp,
    Udp,
    Http,
    Https,
    Tcpmux,
    Stcp,
    Sudp,
    Xtcp,
}

impl ProxyKind {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "tcp" => ProxyKind::Tcp,
            "udp" => ProxyKind::Udp,
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "tcpmux" => ProxyKind::Tcpmux,
            "stcp" => ProxyKind::Stcp,
            "sudp" => ProxyKind::Sudp,
            "xtcp" => ProxyKind::Xtcp,
            other => return Err(Error::proxy(format!("unknown proxy type: {other}"))),
        })
    }

    fn has_public_listener(self) -> bool {
        matches!(self, ProxyKind::Tcp | ProxyKind::Udp)
    }
}

enum BoundListener {
    Tcp(tcp::Bound),
    Udp(udp::Bound),
}

impl BoundListener {
    fn local_addr(&self) -> &str {
        match self {
            BoundListener::Tcp(b) => &b.local_addr,
            BoundListener::Udp(b) => &b.local_addr,
        }
    }

    fn spawn(self, proxy: ServerProxy, control: Arc<Control>, timeout: Duration) -> JoinHandle<()> {
        match self {
            BoundListener::Tcp(b) => b.spawn(proxy, control, timeout),
            BoundListener::Udp(b) => b.spawn(proxy, control, timeout),
        }
    }
}

struct ProxyState {
    name: String,
    kind: ProxyKind,
    run_id: String,
    secret_key: String,
    remote_port: u16,
    remote_addr: Mutex<String>,
    closed: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    use_encryption: bool,
    use_compression: bool,
    limiter: SharedLimiter,
    token: String,
}

/// One registered server-side proxy. Cheap to clone.
#[derive(Clone)]
pub struct ServerProxy {
    state: Arc<ProxyState>,
}

impl ServerProxy {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn kind(&self) -> ProxyKind {
        self.state.kind
    }

    pub fn remote_addr(&self) -> String {
        self.state.remote_addr.lock().clone()
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.state.listener_task.lock().take() {
            handle.abort();
        }
    }

    /// Validates a visitor's `sign_key` against this proxy's configured
    /// `secret-key` (STCP/SUDP/XTCP, spec §4.7).
    pub fn verify_visitor_sign_key(&self, timestamp: i64, provided: &str) -> bool {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        verify_sign_key(&self.state.secret_key, timestamp, now, 900, provided)
    }

    /// Wraps a freshly popped work connection in the same
    /// limiter/encryption/compression stack the client applies in
    /// `client::proxy::ClientProxy::in_work_conn`, so traffic relayed
    /// between this proxy's front/visitor connection and its work
    /// connection decodes symmetrically on both ends.
    pub fn wrap_conn(&self, conn: Box<dyn AsyncReadWrite>) -> Box<dyn AsyncReadWrite> {
        let limited = LimitedStream::new(conn, self.state.limiter.clone(), self.state.limiter.clone());
        let wrapped: Box<dyn AsyncReadWrite> = if self.state.use_encryption {
            Box::new(CryptoStream::wrap(limited, self.state.token.as_bytes()))
        } else {
            Box::new(limited)
        };
        if self.state.use_compression {
            Box::new(CompressStream::wrap(wrapped))
        } else {
            wrapped
        }
    }
}

/// `proxy_name -> ServerProxy` registry, shared by every control session.
/// Needed so STCP/SUDP visitor connections and HTTP/HTTPS/TCPMUX vhost
/// routing (all arriving on a *different* connection than the owning
/// client's control channel) can find the right proxy and its `Control`.
#[derive(Clone, Default)]
pub struct ProxyRegistry {
    proxies: Arc<DashMap<String, (ServerProxy, Arc<Control>)>>,
    /// HTTP/HTTPS/TCPMUX host -> proxy name, for vhost routing on the
    /// shared `vhost-http-port`/`vhost-https-port`.
    domains: Arc<DashMap<String, String>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<(ServerProxy, Arc<Control>)> {
        self.proxies.get(name).map(|v| v.clone())
    }

    pub fn resolve_domain(&self, host: &str) -> Option<(ServerProxy, Arc<Control>)> {
        let name = self.domains.get(host)?.clone();
        self.get(&name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.proxies.contains_key(name)
    }

    pub fn remove(&self, name: &str) {
        self.proxies.remove(name);
    }

    /// Registers `msg` as a new proxy owned by `control`, binding a public
    /// listener for TCP/UDP types. Returns the `remote_addr` to report
    /// back in `NewProxyResp`.
    pub async fn register(
        &self,
        msg: &NewProxy,
        control: Arc<Control>,
        server_cfg: &ServerConfig,
        ports: &PortAllocator,
    ) -> Result<String> {
        if self.proxies.contains_key(&msg.proxy_name) {
            return Err(Error::proxy(format!("proxy name already registered: {}", msg.proxy_name)));
        }
        let kind = ProxyKind::parse(&msg.proxy_type)?;

        let limiter = match parse_rate(&msg.bandwidth_limit) {
            Some(r) => SharedLimiter::new(r),
            None => SharedLimiter::unlimited(),
        };

        let proxy = ServerProxy {
            state: Arc::new(ProxyState {
                name: msg.proxy_name.clone(),
                kind,
                run_id: control.run_id().to_string(),
                secret_key: msg.secret_key.clone(),
                remote_port: msg.remote_port,
                remote_addr: Mutex::new(String::new()),
                closed: AtomicBool::new(false),
                listener_task: Mutex::new(None),
                use_encryption: msg.use_encryption,
                use_compression: msg.use_compression,
                limiter,
                token: server_cfg.token.clone(),
            }),
        };

        let mut remote_addr = String::new();

        if kind.has_public_listener() {
            if msg.remote_port != 0 && !ports.is_allowed(msg.remote_port) {
                return Err(Error::proxy(format!("remote_port {} is outside allow-ports", msg.remote_port)));
            }
            ports.try_reserve(control.run_id())?;

            let bind_addr = format!("{}:{}", server_cfg.bind_addr, msg.remote_port);
            let result = match kind {
                ProxyKind::Tcp => tcp::bind(&bind_addr).await.map(BoundListener::Tcp),
                ProxyKind::Udp => udp::bind(&bind_addr).await.map(BoundListener::Udp),
                _ => unreachable!(),
            };
            let bound = match result {
                Ok(b) => b,
                Err(e) => {
                    ports.release(control.run_id());
                    return Err(e);
                }
            };
            remote_addr = bound.local_addr().to_string();
            *proxy.state.remote_addr.lock() = remote_addr.clone();
            let handle = bound.spawn(proxy.clone(), control.clone(), Duration::from_secs(server_cfg.user_conn_timeout_secs));
            *proxy.state.listener_task.lock() = Some(handle);
        }

        if matches!(kind, ProxyKind::Http | ProxyKind::Https | ProxyKind::Tcpmux) {
            for host in msg.custom_domains.iter().chain(std::iter::once(&msg.subdomain)) {
                if !host.is_empty() {
                    self.domains.insert(host.clone(), msg.proxy_name.clone());
                }
            }
        }

        control.track_proxy(msg.proxy_name.clone());
        self.proxies.insert(msg.proxy_name.clone(), (proxy, control));
        Ok(remote_addr)
    }

    /// Closes and removes a proxy, releasing its port quota and any
    /// vhost domains it claimed.
    pub fn unregister(&self, name: &str, ports: &PortAllocator) {
        if let Some((_, (proxy, control))) = self.proxies.remove(name) {
            proxy.close();
            if proxy.kind().has_public_listener() {
                ports.release(control.run_id());
            }
            self.domains.retain(|_, v| v != name);
            control.untrack_proxy(name);
        }
    }

    /// Drops every proxy owned by `run_id` (control session closed).
    pub fn remove_owned_by(&self, run_id: &str, ports: &PortAllocator) {
        let names: Vec<String> = self
            .proxies
            .iter()
            .filter(|e| e.value().0.state.run_id == run_id)
            .map(|e| e.key().clone())
            .collect();
        for name in names {
            self.unregister(&name, ports);
        }
    }
}

/// Completes the point-to-point STCP/SUDP handshake for a visitor
/// connection that just arrived on the shared listening port (spec
/// §4.7): look the proxy up by name, verify its `sign_key`, reply, then
/// pop a work connection from the owning client and relay.
pub async fn serve_visitor_conn(
    registry: &ProxyRegistry,
    req: NewVisitorConn,
    mut visitor_conn: Box<dyn AsyncReadWrite>,
    peer: SocketAddr,
    timeout: Duration,
) -> Result<()> {
    let Some((proxy, control)) = registry.get(&req.proxy_name) else {
        let resp = NewVisitorConnResp {
            proxy_name: req.proxy_name.clone(),
            error: "no such proxy".into(),
        };
        let _ = crate::msg::write_message(&mut visitor_conn, &resp.into()).await;
        return Err(Error::proxy(format!("visitor referenced unknown proxy: {}", req.proxy_name)));
    };

    if !matches!(proxy.kind(), ProxyKind::Stcp | ProxyKind::Sudp) {
        return Err(Error::proxy("NewVisitorConn against a non-STCP/SUDP proxy"));
    }

    if !proxy.verify_visitor_sign_key(req.timestamp, &req.sign_key) {
        let resp = NewVisitorConnResp {
            proxy_name: req.proxy_name.clone(),
            error: "invalid sign key".into(),
        };
        let _ = crate::msg::write_message(&mut visitor_conn, &resp.into()).await;
        return Err(Error::auth("visitor sign key rejected"));
    }

    let resp = NewVisitorConnResp {
        proxy_name: req.proxy_name.clone(),
        error: String::new(),
    };
    crate::msg::write_message(&mut visitor_conn, &resp.into()).await?;

    let pool = control.pool();
    let sender = control.sender();
    let mut work = pool.pop(&sender, timeout).await?;
    let start = StartWorkConn {
        proxy_name: req.proxy_name.clone(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        ..Default::default()
    };
    crate::msg::write_message(&mut work, &Message::from(start)).await?;

    let work = proxy.wrap_conn(work);
    crate::common::net::copy_bidirectional_owned(work, visitor_conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocator_parses_ranges_and_singles() {
        let pa = PortAllocator::new("6000-6005,6010", None);
        assert!(pa.is_allowed(6000));
        assert!(pa.is_allowed(6005));
        assert!(pa.is_allowed(6010));
        assert!(!pa.is_allowed(6006));
        assert!(!pa.is_allowed(7000));
    }

    #[test]
    fn port_allocator_enforces_per_client_quota() {
        let pa = PortAllocator::new("6000-6010", Some(1));
        pa.try_reserve("run-1").unwrap();
        let err = pa.try_reserve("run-1").unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
        pa.release("run-1");
        assert!(pa.try_reserve("run-1").is_ok());
    }
}
