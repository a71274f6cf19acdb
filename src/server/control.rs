//! Server-side control session (spec §4.4/§4.5): one per logged-in
//! client, owning its work-connection pool and the proxies it has
//! registered. Grounded on
//! `examples/original_source/server/control.go`'s `Control`.

use crate::auth::TokenAuthVerifier;
use crate::msg::{Dispatcher, Message, MessageType, NatHoleClient, NatHoleResp, NatHoleVisitor, Pong, ReqWorkConn};
use crate::nathole::controller::{prepare_result_from_addrs, NatHoleController};
use crate::nathole::tunnel::AsyncReadWrite;
use crate::nathole::{build_behavior, choose_mode, DetectRole, NatType, PrepareResult};
use crate::server::proxy::{ProxyKind, ProxyRegistry};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Work connections a client has dialed back in, waiting to be handed to
/// a proxy servicing a front connection. Bounded by `max_pool_count`
/// (spec §4.6 "work connection pool").
pub struct WorkConnPool {
    conns: Mutex<VecDeque<Box<dyn AsyncReadWrite>>>,
    notify: Notify,
    max: usize,
}

impl WorkConnPool {
    pub fn new(max: usize) -> Self {
        WorkConnPool {
            conns: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max: max.max(1),
        }
    }

    /// Queues a freshly dialed `NewWorkConn` connection. Silently drops it
    /// once the pool is at capacity — the client will send more as its own
    /// pool-replenishment loop notices the shortfall.
    pub fn push(&self, conn: Box<dyn AsyncReadWrite>) {
        let mut q = self.conns.lock();
        if q.len() >= self.max {
            return;
        }
        q.push_back(conn);
        drop(q);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Box<dyn AsyncReadWrite>> {
        self.conns.lock().pop_front()
    }

    /// Pops a pooled connection, waiting up to `timeout` if the pool was
    /// empty. Every successful pop, fast path or slow, is followed by a
    /// `ReqWorkConn` so the pool gets replenished regardless of which
    /// branch supplied the connection (spec §4.5; matches
    /// `original_source/server/control.go`'s `GetWorkConn`, which sends
    /// `ReqWorkConn` unconditionally before returning).
    pub async fn pop(&self, sender: &mpsc::Sender<Message>, timeout: Duration) -> Result<Box<dyn AsyncReadWrite>> {
        let conn = self.pop_inner(timeout).await?;
        let _ = sender.send(ReqWorkConn {}.into()).await;
        Ok(conn)
    }

    async fn pop_inner(&self, timeout: Duration) -> Result<Box<dyn AsyncReadWrite>> {
        if let Some(c) = self.try_pop() {
            return Ok(c);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("no work connection became available"));
            }
            let notified = self.notify.notified();
            match tokio::time::timeout(remaining, notified).await {
                Ok(()) => {
                    if let Some(c) = self.try_pop() {
                        return Ok(c);
                    }
                }
                Err(_) => return Err(Error::timeout("no work connection became available")),
            }
        }
    }
}

pub struct Control {
    run_id: String,
    user: String,
    /// The client's observed address on the accepted control TCP
    /// connection. The server has no way to ask the client to run STUN
    /// on its behalf, so XTCP nat-hole pairing approximates the client
    /// side's `PrepareResult` from this instead (see `nathole_prepare_result`).
    peer_addr: SocketAddr,
    dispatcher: Dispatcher,
    auth: TokenAuthVerifier,
    last_ping: Mutex<Instant>,
    heartbeat_timeout: Duration,
    closing: AtomicBool,
    pool: Arc<WorkConnPool>,
    proxy_names: Mutex<Vec<String>>,
}

impl Control {
    pub fn new(
        run_id: String,
        user: String,
        peer_addr: SocketAddr,
        dispatcher: Dispatcher,
        auth: TokenAuthVerifier,
        pool_count: usize,
        max_pool_count: usize,
        heartbeat_timeout: Duration,
    ) -> Arc<Self> {
        let cap = pool_count.min(max_pool_count);
        Arc::new(Control {
            run_id,
            user,
            peer_addr,
            dispatcher,
            auth,
            last_ping: Mutex::new(Instant::now()),
            heartbeat_timeout,
            closing: AtomicBool::new(false),
            pool: Arc::new(WorkConnPool::new(cap)),
            proxy_names: Mutex::new(Vec::new()),
        })
    }

    /// Builds a `Control` with no real peer, for `ControlManager` tests
    /// that only care about registry bookkeeping.
    pub fn new_for_test(run_id: String, auth: TokenAuthVerifier) -> Self {
        let (local, _remote) = tokio::io::duplex(64);
        Control {
            run_id,
            user: String::new(),
            peer_addr: "127.0.0.1:0".parse().unwrap(),
            dispatcher: Dispatcher::new(local, 16),
            auth,
            last_ping: Mutex::new(Instant::now()),
            heartbeat_timeout: Duration::ZERO,
            closing: AtomicBool::new(false),
            pool: Arc::new(WorkConnPool::new(1)),
            proxy_names: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn auth(&self) -> &TokenAuthVerifier {
        &self.auth
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.dispatcher.sender()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> Arc<WorkConnPool> {
        self.pool.clone()
    }

    pub fn push_work_conn(&self, conn: Box<dyn AsyncReadWrite>) {
        self.pool.push(conn);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.dispatcher.send(msg).await
    }

    /// Resolves once the underlying connection has gone away.
    pub async fn wait_done(&self) {
        self.dispatcher.done().await
    }

    pub fn track_proxy(&self, name: String) {
        self.proxy_names.lock().push(name);
    }

    pub fn untrack_proxy(&self, name: &str) {
        self.proxy_names.lock().retain(|n| n != name);
    }

    /// Proxy names this client currently owns, for cleanup when the
    /// control session dies.
    pub fn owned_proxies(&self) -> Vec<String> {
        self.proxy_names.lock().clone()
    }

    pub fn touch_ping(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock()
    }

    /// Closes the session if no `Ping` has arrived within
    /// `heartbeat_timeout` (spec §4.5, §8 scenario 3). A no-op when the
    /// timeout is zero. Grounded on
    /// `examples/original_source/server/control.go`'s `heartbeatWorker`.
    pub fn spawn_heartbeat_watchdog(self: &Arc<Self>) {
        if self.heartbeat_timeout.is_zero() {
            return;
        }
        let control = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if control.is_closing() {
                    return;
                }
                if control.last_ping().elapsed() > control.heartbeat_timeout {
                    tracing::warn!(run_id = %control.run_id, "heartbeat timeout, closing control session");
                    control.dispatcher.shutdown();
                    return;
                }
            }
        });
    }

    pub fn register_ping_handler(self: &Arc<Self>) {
        let control = self.clone();
        self.dispatcher.register_handler(
            MessageType::Ping,
            crate::msg::Handler::Sync(Arc::new(move |msg| {
                if let Message::Ping(ping) = &msg {
                    let reply = match control.auth.verify_ping(ping) {
                        Ok(()) => {
                            control.touch_ping();
                            Pong { error: String::new() }
                        }
                        Err(e) => Pong { error: e.to_string() },
                    };
                    let sender = control.sender();
                    tokio::spawn(async move {
                        let _ = sender.send(reply.into()).await;
                    });
                }
            })),
        );
    }

    /// Registers the proxy-lifecycle and nat-hole handlers that need the
    /// server-wide registries. Split from [`Self::register_ping_handler`]
    /// because those registries don't exist until
    /// [`crate::server::Server`] wires everything together.
    pub fn register_handlers(
        self: &Arc<Self>,
        registry: ProxyRegistry,
        ports: Arc<crate::server::proxy::PortAllocator>,
        server_cfg: Arc<crate::config::ServerConfig>,
        nathole: Arc<NatHoleController>,
    ) {
        self.register_ping_handler();

        let control = self.clone();
        let registry2 = registry.clone();
        let ports2 = ports.clone();
        self.dispatcher.register_handler(
            MessageType::NewProxy,
            crate::msg::Handler::Async(Arc::new(move |msg| {
                let control = control.clone();
                let registry = registry2.clone();
                let ports = ports2.clone();
                let server_cfg = server_cfg.clone();
                tokio::spawn(async move {
                    if let Message::NewProxy(new_proxy) = msg {
                        let name = new_proxy.proxy_name.clone();
                        let sender = control.sender();
                        let resp = match registry.register(&new_proxy, control.clone(), &server_cfg, &ports).await {
                            Ok(remote_addr) => crate::msg::NewProxyResp {
                                proxy_name: name,
                                remote_addr,
                                error: String::new(),
                            },
                            Err(e) => crate::msg::NewProxyResp {
                                proxy_name: name,
                                remote_addr: String::new(),
                                error: e.to_string(),
                            },
                        };
                        let _ = sender.send(resp.into()).await;
                    }
                });
            })),
        );

        let registry2 = registry.clone();
        let ports2 = ports.clone();
        self.dispatcher.register_handler(
            MessageType::CloseProxy,
            crate::msg::Handler::Sync(Arc::new(move |msg| {
                if let Message::CloseProxy(close) = msg {
                    registry2.unregister(&close.proxy_name, &ports2);
                }
            })),
        );

        let control = self.clone();
        let registry2 = registry.clone();
        self.dispatcher.register_handler(
            MessageType::NatHoleVisitor,
            crate::msg::Handler::Async(Arc::new(move |msg| {
                let control = control.clone();
                let registry = registry2.clone();
                let nathole = nathole.clone();
                tokio::spawn(async move {
                    if let Message::NatHoleVisitor(req) = msg {
                        handle_nat_hole_visitor(control, registry, nathole, req).await;
                    }
                });
            })),
        );

        self.dispatcher.register_handler(
            MessageType::NatHoleReport,
            crate::msg::Handler::Sync(Arc::new(move |msg| {
                if let Message::NatHoleReport(report) = msg {
                    tracing::debug!(sid = %report.sid, success = report.success, "nat hole report");
                }
            })),
        );
    }
}

/// Pairs a visitor's hole-punch request with its proxy and replies with a
/// `NatHoleResp` (spec §4.8). The server has no UDP socket of its own on
/// the proxy owner's behalf, so the owner's side of the exchange is
/// approximated from its control connection's observed peer address
/// rather than a real STUN round trip (see `Control::peer_addr`); the
/// owner is still notified via `NatHoleClient` so a future client-side
/// handler has what it needs to punch independently.
async fn handle_nat_hole_visitor(
    control: Arc<Control>,
    registry: ProxyRegistry,
    nathole: Arc<NatHoleController>,
    req: NatHoleVisitor,
) {
    let sender = control.sender();

    let Some((proxy, owner)) = registry.get(&req.proxy_name) else {
        let resp = NatHoleResp {
            transaction_id: req.transaction_id,
            error: "no such xtcp proxy registered".into(),
            ..Default::default()
        };
        let _ = sender.send(resp.into()).await;
        return;
    };
    if proxy.kind() != ProxyKind::Xtcp {
        let resp = NatHoleResp {
            transaction_id: req.transaction_id,
            error: "proxy is not xtcp".into(),
            ..Default::default()
        };
        let _ = sender.send(resp.into()).await;
        return;
    }
    if !proxy.verify_visitor_sign_key(req.timestamp, &req.sign_key) {
        let resp = NatHoleResp {
            transaction_id: req.transaction_id,
            error: "invalid sign key".into(),
            ..Default::default()
        };
        let _ = sender.send(resp.into()).await;
        return;
    }

    let visitor_result = match prepare_result_from_addrs(&req.mapped_addrs, &req.assisted_addrs) {
        Ok(r) => r,
        Err(e) => {
            let resp = NatHoleResp {
                transaction_id: req.transaction_id,
                error: e.to_string(),
                ..Default::default()
            };
            let _ = sender.send(resp.into()).await;
            return;
        }
    };

    let owner_addr = owner.peer_addr();
    let client_result = PrepareResult {
        addrs: vec![owner_addr, owner_addr],
        assisted_addrs: vec![],
        nat_type: NatType::Easy,
        port_regular: true,
        local_port: owner_addr.port(),
    };

    let mode = choose_mode(&visitor_result, &client_result);
    let sid = nathole.new_transaction_id();
    let visitor_behavior = build_behavior(mode, DetectRole::Receiver, &visitor_result, &client_result, sid.clone());

    let notify = NatHoleClient {
        transaction_id: req.transaction_id.clone(),
        proxy_name: req.proxy_name,
        sign_key: req.sign_key,
        timestamp: req.timestamp,
    };
    let _ = owner.sender().send(notify.into()).await;

    let resp = NatHoleResp {
        transaction_id: req.transaction_id,
        sid,
        protocol: "quic".into(),
        candidate_addrs: visitor_behavior.candidate_addrs.clone(),
        assisted_addrs: visitor_behavior.assisted_addrs.clone(),
        detect_behavior: visitor_behavior,
        error: String::new(),
    };
    let _ = sender.send(resp.into()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_pop_requests_replenishment_and_waits() {
        let pool = Arc::new(WorkConnPool::new(2));
        let (tx, mut rx) = mpsc::channel(4);

        let pool2 = pool.clone();
        let popper = tokio::spawn(async move { pool2.pop(&tx, Duration::from_millis(500)).await });

        let req = rx.recv().await.unwrap();
        assert!(matches!(req, Message::ReqWorkConn(_)));

        let (a, _b) = tokio::io::duplex(8);
        pool.push(Box::new(a));

        let got = popper.await.unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn pool_pop_times_out_when_nothing_arrives() {
        let pool = WorkConnPool::new(1);
        let (tx, _rx) = mpsc::channel(4);
        let err = pool.pop(&tx, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn pool_drops_pushes_past_capacity() {
        let pool = WorkConnPool::new(1);
        let (a, _) = tokio::io::duplex(8);
        let (b, _) = tokio::io::duplex(8);
        pool.push(Box::new(a));
        pool.push(Box::new(b));
        assert_eq!(pool.conns.lock().len(), 1);
    }
}
