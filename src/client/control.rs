//! Client-side control session (spec §4.4). Grounded on
//! `examples/original_source/client/control.go`'s `Control`/`SessionContext`.

use crate::auth::{AuthScope, TokenAuthSetter};
use crate::client::{ProxyManager, VisitorManager};
use crate::config::ClientConfig;
use crate::crypto::cipher::CryptoStream;
use crate::msg::{read_message, write_message, Login, Message, MessageType, NewWorkConn, Ping};
use crate::msg::{Dispatcher, Handler, MessageTransporter};
use crate::nathole::tunnel::AsyncReadWrite;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::sleep;

/// Dials a fresh connection to the server. Split out from [`Control`] so
/// work-connection replenishment and the initial control dial share one
/// code path, and so tests can substitute an in-memory connector.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TcpStream>;
}

pub struct TcpConnector {
    pub server_addr: String,
    pub server_port: u16,
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.server_addr, self.server_port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection(format!("dialing server {addr}: {e}")))?;
        crate::common::net::configure_tcp_stream(&stream);
        Ok(stream)
    }
}

/// Shared session state handlers and background tasks all reach into.
struct SessionContext {
    run_id: Mutex<String>,
    token: String,
    last_pong: Mutex<Instant>,
    heartbeat_timeout: Duration,
    closing: AtomicBool,
}

pub struct Control {
    ctx: Arc<SessionContext>,
    dispatcher: Dispatcher,
    transporter: MessageTransporter,
    connector: Arc<dyn Connector>,
    proxy_manager: Arc<ProxyManager>,
    visitor_manager: Arc<VisitorManager>,
}

impl Control {
    /// Performs the login handshake on a freshly dialed connection, then
    /// wraps it in the dispatcher and registers the standard handlers
    /// (spec §4.4 "Initialization").
    pub async fn connect(
        cfg: &ClientConfig,
        proxy_manager: Arc<ProxyManager>,
        visitor_manager: Arc<VisitorManager>,
    ) -> Result<Self> {
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector {
            server_addr: cfg.server_addr.clone(),
            server_port: cfg.server_port,
        });
        let raw = connector.connect().await?;

        let auth = TokenAuthSetter::new(cfg.token.clone(), AuthScope::default());
        let mut login = Login {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: cfg.user.clone().unwrap_or_default(),
            pool_count: cfg.pool_count,
            ..Default::default()
        };
        auth.sign_login(&mut login);

        let (login_resp, dispatcher) = if cfg.tls_enable {
            // TLS is negotiated at the transport layer; no AES-CTR wrap
            // needed on top (spec §4.4).
            Self::handshake_over(raw, login).await?
        } else {
            let wrapped = CryptoStream::wrap(raw, cfg.token.as_bytes());
            Self::handshake_over(wrapped, login).await?
        };

        if !login_resp.error.is_empty() {
            return Err(Error::auth(login_resp.error));
        }

        let ctx = Arc::new(SessionContext {
            run_id: Mutex::new(login_resp.run_id.clone()),
            token: cfg.token.clone(),
            last_pong: Mutex::new(Instant::now()),
            heartbeat_timeout: Duration::from_secs(cfg.heartbeat_timeout_secs),
            closing: AtomicBool::new(false),
        });

        let transporter = MessageTransporter::new(dispatcher.sender());
        proxy_manager.attach(dispatcher.sender());
        visitor_manager.attach(dispatcher.sender(), transporter.clone());

        let control = Control {
            ctx,
            dispatcher,
            transporter,
            connector,
            proxy_manager,
            visitor_manager,
        };
        control.register_handlers();
        Ok(control)
    }

    async fn handshake_over<S>(mut stream: S, login: Login) -> Result<(crate::msg::LoginResp, Dispatcher)>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        write_message(&mut stream, &login.into()).await?;
        let resp = match read_message(&mut stream).await? {
            Message::LoginResp(r) => r,
            other => {
                return Err(Error::protocol(format!(
                    "expected LoginResp, got tag {}",
                    other.msg_type() as u8
                )))
            }
        };
        let dispatcher = Dispatcher::new(stream, 64);
        Ok((resp, dispatcher))
    }

    fn register_handlers(&self) {
        let ctx = self.ctx.clone();
        let connector = self.connector.clone();
        let sender = self.dispatcher.sender();
        let proxy_manager = self.proxy_manager.clone();
        self.dispatcher.register_handler(
            MessageType::ReqWorkConn,
            Handler::Async(Arc::new(move |_msg: Message| {
                let ctx = ctx.clone();
                let connector = connector.clone();
                let sender = sender.clone();
                let proxy_manager = proxy_manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_req_work_conn(ctx, connector, proxy_manager).await {
                        tracing::debug!(error = %e, "failed to service ReqWorkConn");
                    }
                    let _ = sender;
                });
            })),
        );

        let proxy_manager = self.proxy_manager.clone();
        self.dispatcher.register_handler(
            MessageType::NewProxyResp,
            Handler::Sync(Arc::new(move |msg| {
                if let Message::NewProxyResp(resp) = msg {
                    proxy_manager.handle_new_proxy_resp(resp);
                }
            })),
        );

        let proxy_manager = self.proxy_manager.clone();
        self.dispatcher.register_handler(
            MessageType::GetProxyBandwidthLimitResp,
            Handler::Sync(Arc::new(move |msg| {
                if let Message::GetProxyBandwidthLimitResp(resp) = msg {
                    // spec §9 open question: pick InBound if non-zero,
                    // else OutBound, ignoring the other. Preserved as-is.
                    let bytes_per_sec = if resp.in_bound != 0 {
                        resp.in_bound
                    } else {
                        resp.out_bound
                    };
                    proxy_manager.set_bandwidth_limit(&resp.proxy_name, bytes_per_sec.max(0) as u64);
                }
            })),
        );

        let ctx = self.ctx.clone();
        self.dispatcher.register_handler(
            MessageType::Pong,
            Handler::Sync(Arc::new(move |_msg| {
                *ctx.last_pong.lock() = Instant::now();
            })),
        );

        let transporter = self.transporter.clone();
        self.dispatcher.register_handler(
            MessageType::NatHoleResp,
            Handler::Sync(Arc::new(move |msg| {
                if let Message::NatHoleResp(resp) = &msg {
                    let lane = resp.transaction_id.clone();
                    transporter.dispatch_with_type(msg, &lane);
                }
            })),
        );
    }

    pub fn transporter(&self) -> MessageTransporter {
        self.transporter.clone()
    }

    pub fn sender(&self) -> tokio::sync::mpsc::Sender<Message> {
        self.dispatcher.sender()
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.dispatcher.send(msg).await
    }

    /// Runs the proxy/visitor managers and the heartbeat tasks until the
    /// control connection closes.
    pub async fn run(&self, heartbeat_interval: Duration) {
        self.proxy_manager.run_all();
        self.visitor_manager.run_all();

        let ctx = self.ctx.clone();
        let sender = self.dispatcher.sender();
        let token = ctx.token.clone();
        let heartbeat = tokio::spawn(async move {
            heartbeat_worker(ctx, sender, token, heartbeat_interval).await;
        });

        let ctx_timeout = self.ctx.clone();
        let watchdog = if ctx_timeout.heartbeat_timeout > Duration::ZERO {
            Some(tokio::spawn(heartbeat_watchdog(ctx_timeout, self.dispatcher.clone())))
        } else {
            None
        };

        self.dispatcher.done().await;
        self.ctx.closing.store(true, Ordering::SeqCst);
        heartbeat.abort();
        if let Some(w) = watchdog {
            w.abort();
        }
    }

    /// Closes the proxy/visitor managers, waits `grace`, then drops the
    /// control connection (spec §4.4 "Close").
    pub async fn graceful_close(&self, grace: Duration) {
        self.ctx.closing.store(true, Ordering::SeqCst);
        self.proxy_manager.close_all();
        self.visitor_manager.close_all();
        sleep(grace).await;
    }

    pub fn run_id(&self) -> String {
        self.ctx.run_id.lock().clone()
    }
}

async fn handle_req_work_conn(
    ctx: Arc<SessionContext>,
    connector: Arc<dyn Connector>,
    proxy_manager: Arc<ProxyManager>,
) -> Result<()> {
    let raw = connector.connect().await?;
    let mut stream = CryptoStream::wrap(raw, ctx.token.as_bytes());

    let run_id = ctx.run_id.lock().clone();
    let mut new_work_conn = NewWorkConn {
        run_id,
        ..Default::default()
    };
    let auth = TokenAuthSetter::new(ctx.token.clone(), AuthScope::default());
    auth.sign_new_work_conn(&mut new_work_conn);
    write_message(&mut stream, &new_work_conn.into()).await?;

    let start_msg = match read_message(&mut stream).await? {
        Message::StartWorkConn(m) => m,
        other => {
            return Err(Error::protocol(format!(
                "expected StartWorkConn, got tag {}",
                other.msg_type() as u8
            )))
        }
    };

    if !start_msg.error.is_empty() {
        return Err(Error::proxy(format!(
            "server refused work connection for {}: {}",
            start_msg.proxy_name, start_msg.error
        )));
    }

    let boxed: Box<dyn AsyncReadWrite> = Box::new(stream);
    proxy_manager.handle_work_conn(start_msg, boxed).await
}

async fn heartbeat_worker(
    ctx: Arc<SessionContext>,
    sender: tokio::sync::mpsc::Sender<Message>,
    token: String,
    interval: Duration,
) {
    if interval == Duration::ZERO {
        return;
    }
    let auth = TokenAuthSetter::new(token, AuthScope::default());
    loop {
        if ctx.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut ping = Ping::default();
        auth.sign_ping(&mut ping);
        if sender.send(ping.into()).await.is_err() {
            return;
        }
        sleep(interval).await;
    }
}

async fn heartbeat_watchdog(ctx: Arc<SessionContext>, dispatcher: Dispatcher) {
    loop {
        sleep(Duration::from_secs(1)).await;
        if ctx.closing.load(Ordering::SeqCst) {
            return;
        }
        let elapsed = ctx.last_pong.lock().elapsed();
        if elapsed > ctx.heartbeat_timeout {
            tracing::warn!(?elapsed, "heartbeat timeout, closing control session");
            ctx.closing.store(true, Ordering::SeqCst);
            dispatcher.shutdown();
            return;
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingConnector;

    #[async_trait::async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self) -> Result<TcpStream> {
            Err(Error::connection("no server available in this test"))
        }
    }

    #[tokio::test]
    async fn req_work_conn_handler_surfaces_dial_failures() {
        let ctx = Arc::new(SessionContext {
            run_id: Mutex::new("run-1".into()),
            token: "tok".into(),
            last_pong: Mutex::new(Instant::now()),
            heartbeat_timeout: Duration::from_secs(90),
            closing: AtomicBool::new(false),
        });
        let connector: Arc<dyn Connector> = Arc::new(FailingConnector);
        let proxy_manager = Arc::new(ProxyManager::new());
        let err = handle_req_work_conn(ctx, connector, proxy_manager)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
