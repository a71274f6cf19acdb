//! Client-side UDP proxy: one TCP work connection carries every datagram
//! exchanged with the local service, framed as [`crate::msg::UdpPacket`]
//! (spec §4.6 UDP). Grounded on
//! `examples/original_source/client/proxy/udp.go`'s `UDPProxy.InWorkConn`.
//!
//! Simplification: the local UDP socket is `connect`ed to the local
//! service, so replies are tagged with whichever remote last sent a
//! packet rather than matched per-sender. Fine for the common
//! single-remote-at-a-time case (DNS-style request/response); a local
//! service fielding several concurrent distinct visitors needs a
//! per-remote socket pool, which this core does not implement.

use crate::nathole::tunnel::AsyncReadWrite;
use crate::udp::{read_packet, write_packet};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub async fn serve_work_conn(mut conn: Box<dyn AsyncReadWrite>, local_addr: &str) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::connection(format!("binding local udp socket: {e}")))?,
    );
    socket
        .connect(local_addr)
        .await
        .map_err(|e| Error::connection(format!("connecting to local udp service {local_addr}: {e}")))?;

    let last_remote: Arc<Mutex<(String, String)>> = Arc::new(Mutex::new(Default::default()));

    let (tx, mut rx) = mpsc::channel::<(Vec<u8>, String, String)>(64);
    let recv_socket = socket.clone();
    let recv_remote = last_remote.clone();
    let recv_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match recv_socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let (local_addr, remote_addr) = recv_remote.lock().clone();
            if tx.send((buf[..n].to_vec(), local_addr, remote_addr)).await.is_err() {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            frame = read_packet(&mut conn) => {
                let packet = match frame {
                    Ok(p) => p,
                    Err(_) => break,
                };
                *last_remote.lock() = (packet.local_addr.clone(), packet.remote_addr.clone());
                if socket.send(&packet.content).await.is_err() {
                    break;
                }
            }
            reply = rx.recv() => {
                match reply {
                    Some((content, local_addr, remote_addr)) => {
                        if write_packet(&mut conn, content, local_addr, remote_addr).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    recv_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn serve_work_conn_forwards_a_datagram_to_the_local_service() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        let echo_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let (mut client_side, server_side) = duplex(4096);
        let boxed: Box<dyn AsyncReadWrite> = Box::new(server_side);
        let serve_task = tokio::spawn(serve_work_conn(boxed, &echo_addr.to_string()));

        write_packet(&mut client_side, b"ping".to_vec(), "127.0.0.1:1".into(), "1.2.3.4:5".into())
            .await
            .unwrap();
        let echoed = read_packet(&mut client_side).await.unwrap();
        assert_eq!(echoed.content, b"ping");

        echo_task.await.unwrap();
        drop(client_side);
        let _ = serve_task.await;
    }
}
