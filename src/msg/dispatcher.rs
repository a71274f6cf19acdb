//! Background read/write loop over a control connection, dispatching
//! decoded messages to per-type handlers (spec §4.1).
//!
//! Mirrors frp's `msg.Dispatcher`: one task drains an outbound channel and
//! writes frames, another reads frames and calls whatever handler is
//! registered for that message's type. A handler that wants to unblock a
//! [`super::transporter::MessageTransporter`] waiter does so explicitly by
//! calling `dispatch_with_type` on it — the dispatcher itself does not know
//! about request/response correlation.

use super::{read_message, write_message, Message, MessageType};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub type HandlerFn = Arc<dyn Fn(Message) + Send + Sync>;

/// A handler invoked inline in the read loop. Must not block or do
/// meaningful I/O — use [`AsyncHandler`] for that.
pub type SyncHandler = HandlerFn;

/// A handler spawned onto its own task so a slow handler (e.g. one that
/// waits on a lock or performs I/O) never stalls the read loop.
pub type AsyncHandler = HandlerFn;

pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Owns the send side of a control connection and the handler registry for
/// its receive side. Created once per control channel; cloned cheaply to
/// hand the send half to proxies/visitors that need to emit messages.
#[derive(Clone)]
pub struct Dispatcher {
    send_tx: mpsc::Sender<Message>,
    handlers: Arc<DashMap<u8, Handler>>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Split `stream` and spawn the read and write loops. `send_buffer`
    /// bounds how many outbound messages may queue before `send`/`try_send`
    /// back-pressures the caller.
    pub fn new<S>(stream: S, send_buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_tx, send_rx) = mpsc::channel(send_buffer);
        let (done_tx, done_rx) = watch::channel(false);
        let handlers: Arc<DashMap<u8, Handler>> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let (read_half, write_half) = split(stream);

        let done_tx = Arc::new(done_tx);

        tokio::spawn(Self::write_loop(write_half, send_rx, done_tx.clone(), shutdown.clone()));
        tokio::spawn(Self::read_loop(read_half, handlers.clone(), done_tx.clone(), shutdown.clone()));

        Dispatcher {
            send_tx,
            handlers,
            done_tx,
            done_rx,
            shutdown,
        }
    }

    async fn write_loop<W>(
        mut w: W,
        mut rx: mpsc::Receiver<Message>,
        done_tx: Arc<watch::Sender<bool>>,
        shutdown: CancellationToken,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = write_message(&mut w, &msg).await {
                        tracing::debug!(error = %e, "dispatcher write loop closing");
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(true);
    }

    async fn read_loop<R>(
        mut r: R,
        handlers: Arc<DashMap<u8, Handler>>,
        done_tx: Arc<watch::Sender<bool>>,
        shutdown: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = read_message(&mut r) => match res {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(error = %e, "dispatcher read loop closing");
                        break;
                    }
                },
            };
            let tag = msg.msg_type() as u8;
            match handlers.get(&tag).map(|h| match h.value() {
                Handler::Sync(f) => (f.clone(), false),
                Handler::Async(f) => (f.clone(), true),
            }) {
                Some((f, true)) => {
                    tokio::spawn(async move { f(msg) });
                }
                Some((f, false)) => f(msg),
                None => {
                    tracing::trace!(?tag, "no handler registered for message type");
                }
            }
        }
        let _ = done_tx.send(true);
    }

    pub fn register_handler(&self, t: MessageType, h: Handler) {
        self.handlers.insert(t as u8, h);
    }

    /// Queue `msg` for the write loop. Back-pressures if the send buffer is
    /// full; fails once the connection has closed.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.send_tx
            .send(msg)
            .await
            .map_err(|_| Error::connection("control connection closed"))
    }

    pub fn try_send(&self, msg: Message) -> Result<()> {
        self.send_tx
            .try_send(msg)
            .map_err(|_| Error::connection("control connection send buffer full or closed"))
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.send_tx.clone()
    }

    /// Resolves once either loop has exited (read error, write error, or
    /// the peer closing the connection).
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Tears down both loops immediately, without waiting for the peer or
    /// an I/O error. Used by a control session's heartbeat watchdog (spec
    /// §4.5 "Cancellation & timeouts") to force a session closed when the
    /// peer has gone quiet.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Ping, Pong};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::duplex;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn dispatches_decoded_message_to_registered_handler() {
        let (a, mut b) = duplex(1024);
        let dispatcher = Dispatcher::new(a, 16);

        let got = Arc::new(AtomicBool::new(false));
        let got2 = got.clone();
        dispatcher.register_handler(
            MessageType::Pong,
            Handler::Sync(Arc::new(move |_m| {
                got2.store(true, Ordering::SeqCst);
            })),
        );

        super::write_message(&mut b, &Pong { error: String::new() }.into())
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while !got.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn send_writes_a_frame_the_peer_can_decode() {
        let (a, mut b) = duplex(1024);
        let dispatcher = Dispatcher::new(a, 16);
        dispatcher
            .send(
                Ping {
                    privilege_key: "k".into(),
                    timestamp: 5,
                }
                .into(),
            )
            .await
            .unwrap();

        let decoded = super::read_message(&mut b).await.unwrap();
        assert!(matches!(decoded, Message::Ping(_)));
    }

    #[tokio::test]
    async fn done_resolves_when_peer_closes() {
        let (a, b) = duplex(1024);
        let dispatcher = Dispatcher::new(a, 16);
        drop(b);
        timeout(Duration::from_secs(1), dispatcher.done())
            .await
            .expect("done() should resolve after the peer closes");
        assert!(dispatcher.is_done());
    }
}
