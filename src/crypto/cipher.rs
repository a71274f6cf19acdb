//! AES-128-CTR stream wrapper (spec §4.2).
//!
//! Each direction of a connection carries its own salt: a writer generates
//! 16 random bytes on its first write and prepends them to the stream; the
//! corresponding reader consumes exactly 16 bytes on its first read before
//! treating anything after as ciphertext. The two directions are otherwise
//! independent, which is why this is a read wrapper and a write wrapper
//! rather than one combined codec — [`CryptoStream`] just bundles one of
//! each around a split duplex connection so it can still be handed to
//! [`crate::msg::Dispatcher`] as a single `AsyncRead + AsyncWrite`.

use crate::crypto::derive_key;
use crate::Result;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use pin_project_lite::pin_project;
use rand::RngCore;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

fn cipher_from_salt(token: &[u8], salt: &[u8; SALT_LEN]) -> Aes128Ctr {
    let key = derive_key(token, salt, KEY_LEN);
    Aes128Ctr::new(key.as_slice().into(), &[0u8; 16].into())
}

enum ReadState {
    AwaitingSalt { buf: [u8; SALT_LEN], have: usize },
    Streaming(Aes128Ctr),
}

enum WriteState {
    NeedsSalt,
    Streaming(Aes128Ctr),
}

pin_project! {
    pub struct CryptoReader<R> {
        #[pin]
        inner: R,
        token: Vec<u8>,
        state: ReadState,
    }
}

impl<R: AsyncRead> CryptoReader<R> {
    pub fn new(inner: R, token: impl Into<Vec<u8>>) -> Self {
        CryptoReader {
            inner,
            token: token.into(),
            state: ReadState::AwaitingSalt {
                buf: [0u8; SALT_LEN],
                have: 0,
            },
        }
    }
}

impl<R: AsyncRead> AsyncRead for CryptoReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            match &mut this.state {
                ReadState::AwaitingSalt { buf, have } => {
                    let mut salt_read = ReadBuf::new(&mut buf[*have..]);
                    match this.inner.as_mut().poll_read(cx, &mut salt_read) {
                        Poll::Ready(Ok(())) => {
                            let n = salt_read.filled().len();
                            if n == 0 {
                                // peer closed before sending a full salt
                                return Poll::Ready(Ok(()));
                            }
                            *have += n;
                            if *have == SALT_LEN {
                                let cipher = cipher_from_salt(this.token, buf);
                                *this.state = ReadState::Streaming(cipher);
                            }
                        }
                        other => return other,
                    }
                }
                ReadState::Streaming(cipher) => {
                    let before = out.filled().len();
                    match this.inner.as_mut().poll_read(cx, out) {
                        Poll::Ready(Ok(())) => {
                            cipher.apply_keystream(&mut out.filled_mut()[before..]);
                            return Poll::Ready(Ok(()));
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

pin_project! {
    pub struct CryptoWriter<W> {
        #[pin]
        inner: W,
        token: Vec<u8>,
        state: WriteState,
    }
}

impl<W: AsyncWrite> CryptoWriter<W> {
    pub fn new(inner: W, token: impl Into<Vec<u8>>) -> Self {
        CryptoWriter {
            inner,
            token: token.into(),
            state: WriteState::NeedsSalt,
        }
    }
}

impl<W: AsyncWrite> AsyncWrite for CryptoWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        if matches!(this.state, WriteState::NeedsSalt) {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            match this.inner.as_mut().poll_write(cx, &salt) {
                Poll::Ready(Ok(n)) if n == SALT_LEN => {
                    let cipher = cipher_from_salt(this.token, &salt);
                    *this.state = WriteState::Streaming(cipher);
                }
                Poll::Ready(Ok(_)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write of crypto salt",
                    )))
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        match &mut this.state {
            WriteState::Streaming(cipher) => {
                let mut ciphertext = buf.to_vec();
                cipher.apply_keystream(&mut ciphertext);
                this.inner.as_mut().poll_write(cx, &ciphertext)
            }
            WriteState::NeedsSalt => unreachable!("salt handshake completed above"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// One AES-CTR reader and one AES-CTR writer over the two halves of a
    /// split duplex stream, so the pair can be handed around as a single
    /// `AsyncRead + AsyncWrite` again.
    pub struct CryptoStream<S> {
        #[pin]
        reader: CryptoReader<ReadHalf<S>>,
        #[pin]
        writer: CryptoWriter<WriteHalf<S>>,
    }
}

impl<S: AsyncRead + AsyncWrite> CryptoStream<S> {
    pub fn wrap(stream: S, token: &[u8]) -> Self {
        let (r, w) = split(stream);
        CryptoStream {
            reader: CryptoReader::new(r, token.to_vec()),
            writer: CryptoWriter::new(w, token.to_vec()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncRead for CryptoStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncWrite for CryptoStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn salt_prepend_and_consume_roundtrips_plaintext() {
        let (client, server) = duplex(4096);
        let token = b"shared-token".to_vec();

        let mut writer = CryptoWriter::new(client, token.clone());
        let mut reader = CryptoReader::new(server, token);

        let sender = tokio::spawn(async move {
            writer.write_all(b"hello reverse tunnel").await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut buf = [0u8; "hello reverse tunnel".len()];
        reader.read_exact(&mut buf).await.unwrap();
        sender.await.unwrap();

        assert_eq!(&buf, b"hello reverse tunnel");
    }

    #[tokio::test]
    async fn wrong_token_does_not_decode_to_the_same_plaintext() {
        let (client, server) = duplex(4096);
        let mut writer = CryptoWriter::new(client, b"token-a".to_vec());
        let mut reader = CryptoReader::new(server, b"token-b".to_vec());

        tokio::spawn(async move {
            writer.write_all(b"secret payload!!").await.unwrap();
        });

        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"secret payload!!");
    }
}
