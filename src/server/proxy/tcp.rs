//! Server-side TCP proxy: binds the public port, and for each accepted
//! front connection pops a work connection from the owning client's pool
//! and writes `StartWorkConn` directly onto it before relaying bytes —
//! mirroring how the client's own `handle_req_work_conn` reads
//! `StartWorkConn` off a freshly dialed raw stream rather than through
//! the dispatcher. Grounded on
//! `examples/original_source/server/control.go`'s work-connection handoff
//! and `client/proxy/udp.go`'s symmetric framing approach applied to TCP.

use crate::msg::{write_message, Message, StartWorkConn};
use crate::server::control::Control;
use crate::server::proxy::ServerProxy;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct Bound {
    pub local_addr: String,
    listener: TcpListener,
}

pub async fn bind(addr: &str) -> Result<Bound> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::proxy(format!("binding tcp proxy listener {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::proxy(format!("reading bound tcp proxy address: {e}")))?
        .to_string();
    Ok(Bound { local_addr, listener })
}

impl Bound {
    pub fn spawn(self, proxy: ServerProxy, control: Arc<Control>, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if control.is_closing() {
                    return;
                }
                match self.listener.accept().await {
                    Ok((conn, peer)) => {
                        crate::common::net::configure_tcp_stream(&conn);
                        let proxy = proxy.clone();
                        let control = control.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_front_conn(proxy, conn, peer.to_string(), control, timeout).await {
                                tracing::debug!(error = %e, "tcp proxy front connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "tcp proxy listener closing");
                        return;
                    }
                }
            }
        })
    }
}

async fn serve_front_conn(
    proxy: ServerProxy,
    front: tokio::net::TcpStream,
    src_addr: String,
    control: Arc<Control>,
    timeout: Duration,
) -> Result<()> {
    let pool = control.pool();
    let sender = control.sender();
    let mut work = pool.pop(&sender, timeout).await?;

    let (ip, port) = split_addr(&src_addr);
    let start = StartWorkConn {
        proxy_name: proxy.name().to_string(),
        src_addr: ip,
        src_port: port,
        ..Default::default()
    };
    write_message(&mut work, &Message::from(start)).await?;

    let work = proxy.wrap_conn(work);
    crate::common::net::copy_bidirectional_owned(work, front).await?;
    Ok(())
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sa) => (sa.ip().to_string(), sa.port()),
        Err(_) => (addr.to_string(), 0),
    }
}
