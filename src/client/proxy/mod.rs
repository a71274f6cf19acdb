//! Client-side proxies (spec §4.6). Modeled as one tagged enum rather than
//! a deep trait hierarchy (spec §9 design note): every proxy type's client
//! half does the same thing on a work connection — unwrap bandwidth limit,
//! then encryption, then compression, dial the local service, copy bytes —
//! with UDP the only type needing its own framing. Grounded on
//! `examples/original_source/client/proxy/udp.go`'s `UDPProxy.InWorkConn`
//! and `client/control.go`'s work-connection dispatch.

pub mod udp;

use crate::common::net::copy_bidirectional_owned;
use crate::config::ProxyConfig;
use crate::crypto::cipher::CryptoStream;
use crate::crypto::compress::CompressStream;
use crate::limit::{parse_rate, SharedLimiter};
use crate::msg::{Message, NewProxy, NewProxyResp, StartWorkConn};
use crate::nathole::tunnel::AsyncReadWrite;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex as PLMutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

struct ProxyState {
    cfg: ProxyConfig,
    token: String,
    limiter: SharedLimiter,
    closed: std::sync::atomic::AtomicBool,
    remote_addr: PLMutex<String>,
}

/// One registered client-side proxy. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct ClientProxy {
    state: Arc<ProxyState>,
}

impl ClientProxy {
    pub fn new(cfg: ProxyConfig, token: String) -> Self {
        let rate = base_config(&cfg).bandwidth_limit.as_str();
        let limiter = match parse_rate(rate) {
            Some(r) => SharedLimiter::new(r),
            None => SharedLimiter::unlimited(),
        };
        ClientProxy {
            state: Arc::new(ProxyState {
                cfg,
                token,
                limiter,
                closed: std::sync::atomic::AtomicBool::new(false),
                remote_addr: PLMutex::new(String::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.state.cfg.name()
    }

    /// The address the server assigned this proxy, once `NewProxyResp`
    /// has come back. Empty until then.
    pub fn remote_addr(&self) -> String {
        self.state.remote_addr.lock().clone()
    }

    /// Builds the wire `NewProxy` registration message for this proxy.
    pub fn new_proxy_message(&self) -> NewProxy {
        to_new_proxy(&self.state.cfg)
    }

    pub fn handle_new_proxy_resp(&self, resp: &NewProxyResp) {
        if resp.error.is_empty() {
            *self.state.remote_addr.lock() = resp.remote_addr.clone();
            tracing::info!(proxy = %resp.proxy_name, remote_addr = %resp.remote_addr, "proxy registered");
        } else {
            tracing::warn!(proxy = %resp.proxy_name, error = %resp.error, "server rejected proxy registration");
        }
    }

    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.state.limiter.set_rate(bytes_per_sec);
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.state.limiter.rate()
    }

    pub fn close(&self) {
        self.state.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Services one work connection handed off by the control session
    /// (spec §4.6: bandwidth limit, then encryption, then compression,
    /// applied in that fixed order around the connection).
    pub async fn in_work_conn(&self, conn: Box<dyn AsyncReadWrite>, start_msg: StartWorkConn) -> Result<()> {
        if self.state.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::proxy("proxy is closed"));
        }

        let base = base_config(&self.state.cfg);
        let local_addr = format!("{}:{}", base.local_ip, base.local_port);

        let limited = crate::limit::LimitedStream::new(conn, self.state.limiter.clone(), self.state.limiter.clone());
        let wrapped: Box<dyn AsyncReadWrite> = if base.use_encryption {
            Box::new(CryptoStream::wrap(limited, self.state.token.as_bytes()))
        } else {
            Box::new(limited)
        };
        let wrapped: Box<dyn AsyncReadWrite> = if base.use_compression {
            Box::new(CompressStream::wrap(wrapped))
        } else {
            wrapped
        };

        if self.state.cfg.name() == start_msg.proxy_name && is_udp(&self.state.cfg) {
            return udp::serve_work_conn(wrapped, &local_addr).await;
        }

        let local = TcpStream::connect(&local_addr)
            .await
            .map_err(|e| Error::connection(format!("dialing local service {local_addr}: {e}")))?;
        crate::common::net::configure_tcp_stream(&local);

        copy_bidirectional_owned(wrapped, local).await?;
        Ok(())
    }
}

fn is_udp(cfg: &ProxyConfig) -> bool {
    matches!(cfg, ProxyConfig::Udp(_))
}

fn base_config(cfg: &ProxyConfig) -> &crate::config::ProxyBaseConfig {
    match cfg {
        ProxyConfig::Tcp(c) => &c.base,
        ProxyConfig::Udp(c) => &c.base,
        ProxyConfig::Http(c) => &c.base,
        ProxyConfig::Https(c) => &c.base,
        ProxyConfig::Tcpmux(c) => &c.base,
        ProxyConfig::Stcp(c) => &c.base,
        ProxyConfig::Sudp(c) => &c.base,
        ProxyConfig::Xtcp(c) => &c.base,
    }
}

fn to_new_proxy(cfg: &ProxyConfig) -> NewProxy {
    let base = base_config(cfg);
    let mut msg = NewProxy {
        proxy_name: base.name.clone(),
        use_encryption: base.use_encryption,
        use_compression: base.use_compression,
        bandwidth_limit: base.bandwidth_limit.clone(),
        bandwidth_limit_mode: base.bandwidth_limit_mode.clone(),
        ..Default::default()
    };
    match cfg {
        ProxyConfig::Tcp(c) => {
            msg.proxy_type = "tcp".into();
            msg.remote_port = c.remote_port;
        }
        ProxyConfig::Udp(c) => {
            msg.proxy_type = "udp".into();
            msg.remote_port = c.remote_port;
        }
        ProxyConfig::Http(c) => {
            msg.proxy_type = "http".into();
            msg.custom_domains = c.custom_domains.clone();
            msg.subdomain = c.subdomain.clone();
            msg.locations = c.locations.clone();
            msg.http_user = c.http_user.clone();
            msg.http_password = c.http_password.clone();
            msg.host_header_rewrite = c.host_header_rewrite.clone();
            msg.headers = c.headers.clone();
        }
        ProxyConfig::Https(c) => {
            msg.proxy_type = "https".into();
            msg.custom_domains = c.custom_domains.clone();
            msg.subdomain = c.subdomain.clone();
        }
        ProxyConfig::Tcpmux(c) => {
            msg.proxy_type = "tcpmux".into();
            msg.custom_domains = c.custom_domains.clone();
            msg.multiplexer = c.multiplexer.clone();
            msg.route_by_http_user = c.route_by_http_user.clone();
        }
        ProxyConfig::Stcp(c) => {
            msg.proxy_type = "stcp".into();
            msg.secret_key = c.secret_key.clone();
            msg.allow_users = c.allow_users.clone();
        }
        ProxyConfig::Sudp(c) => {
            msg.proxy_type = "sudp".into();
            msg.secret_key = c.secret_key.clone();
            msg.allow_users = c.allow_users.clone();
        }
        ProxyConfig::Xtcp(c) => {
            msg.proxy_type = "xtcp".into();
            msg.secret_key = c.secret_key.clone();
            msg.allow_users = c.allow_users.clone();
        }
    }
    msg
}

/// Registry of every proxy this client has configured, plus the dispatcher
/// plumbing needed to register them with the server and route work
/// connections/`NewProxyResp`/bandwidth updates back to the right one.
pub struct ProxyManager {
    proxies: DashMap<String, ClientProxy>,
    sender: PLMutex<Option<mpsc::Sender<Message>>>,
    token: PLMutex<String>,
}

impl ProxyManager {
    pub fn new() -> Self {
        ProxyManager {
            proxies: DashMap::new(),
            sender: PLMutex::new(None),
            token: PLMutex::new(String::new()),
        }
    }

    pub fn from_config(proxy_cfgs: Vec<ProxyConfig>, token: String) -> Self {
        let manager = Self::new();
        *manager.token.lock() = token.clone();
        for cfg in proxy_cfgs {
            let proxy = ClientProxy::new(cfg, token.clone());
            manager.proxies.insert(proxy.name().to_string(), proxy);
        }
        manager
    }

    /// Hands the manager a way to talk back to the control connection.
    /// Called once, by [`crate::client::control::Control::connect`].
    pub fn attach(&self, sender: mpsc::Sender<Message>) {
        *self.sender.lock() = Some(sender);
    }

    /// Sends one `NewProxy` registration per configured proxy.
    pub fn run_all(&self) {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            tracing::warn!("proxy manager started before a control connection was attached");
            return;
        };
        for entry in self.proxies.iter() {
            let msg: Message = entry.value().new_proxy_message().into();
            let sender = sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(msg).await;
            });
        }
    }

    pub fn handle_new_proxy_resp(&self, resp: NewProxyResp) {
        if let Some(proxy) = self.proxies.get(&resp.proxy_name) {
            proxy.handle_new_proxy_resp(&resp);
        }
    }

    pub fn remote_addr(&self, proxy_name: &str) -> Option<String> {
        self.proxies.get(proxy_name).map(|p| p.remote_addr())
    }

    pub fn bandwidth_limit(&self, proxy_name: &str) -> Option<u64> {
        self.proxies.get(proxy_name).map(|p| p.bandwidth_limit())
    }

    pub fn set_bandwidth_limit(&self, proxy_name: &str, bytes_per_sec: u64) {
        if let Some(proxy) = self.proxies.get(proxy_name) {
            proxy.set_bandwidth_limit(bytes_per_sec);
        }
    }

    pub async fn handle_work_conn(&self, start_msg: StartWorkConn, conn: Box<dyn AsyncReadWrite>) -> Result<()> {
        let proxy = self
            .proxies
            .get(&start_msg.proxy_name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::proxy(format!("no such proxy: {}", start_msg.proxy_name)))?;
        proxy.in_work_conn(conn, start_msg).await
    }

    pub fn close_all(&self) {
        for entry in self.proxies.iter() {
            entry.value().close();
        }
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyBaseConfig, TcpProxyConfig};

    fn tcp_cfg(name: &str) -> ProxyConfig {
        ProxyConfig::Tcp(TcpProxyConfig {
            base: ProxyBaseConfig {
                name: name.into(),
                local_ip: "127.0.0.1".into(),
                local_port: 8080,
                ..Default::default()
            },
            remote_port: 6000,
        })
    }

    #[test]
    fn new_proxy_message_carries_remote_port() {
        let proxy = ClientProxy::new(tcp_cfg("web"), "token".into());
        let msg = proxy.new_proxy_message();
        assert_eq!(msg.proxy_type, "tcp");
        assert_eq!(msg.remote_port, 6000);
    }

    #[test]
    fn manager_routes_new_proxy_resp_by_name() {
        let manager = ProxyManager::from_config(vec![tcp_cfg("web")], "token".into());
        manager.handle_new_proxy_resp(NewProxyResp {
            proxy_name: "web".into(),
            remote_addr: "1.2.3.4:6000".into(),
            error: String::new(),
        });
        let proxy = manager.proxies.get("web").unwrap();
        assert_eq!(*proxy.state.remote_addr.lock(), "1.2.3.4:6000");
    }

    #[tokio::test]
    async fn handle_work_conn_rejects_unknown_proxy_name() {
        let manager = ProxyManager::from_config(vec![tcp_cfg("web")], "token".into());
        let (a, _b) = tokio::io::duplex(64);
        let boxed: Box<dyn AsyncReadWrite> = Box::new(a);
        let err = manager
            .handle_work_conn(
                StartWorkConn {
                    proxy_name: "missing".into(),
                    ..Default::default()
                },
                boxed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
    }
}
