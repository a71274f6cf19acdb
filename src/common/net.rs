//! Network utilities shared by the client and server.

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::buffer;

/// Tune a freshly accepted/dialed TCP stream the way every long-lived
/// connection in this crate (control, work, visitor) wants it tuned.
#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Bidirectional copy between a visitor connection and a work connection
/// (or a work connection and a local service). Used by every proxy type's
/// data-plane loop.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(a, b).await
}

/// Owned variant, for call sites that move both halves into one task.
pub async fn copy_bidirectional_owned<A, B>(mut a: A, mut b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(&mut a, &mut b).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn copy_bidirectional_moves_both_directions() {
        let (mut c1, mut s1) = duplex(64);
        let (mut c2, mut s2) = duplex(64);

        let driver = tokio::spawn(async move { copy_bidirectional(&mut s1, &mut s2).await });

        c1.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        c2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        c2.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        c1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(c1);
        drop(c2);
        let _ = driver.await;
    }
}
