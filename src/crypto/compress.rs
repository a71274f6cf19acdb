//! zlib compression stream wrapper (spec §4.2). Transparent like
//! [`super::cipher`]: a [`CompressWriter`] deflates everything written to
//! it with a sync-flush after each call so the peer's [`CompressReader`]
//! can decode incrementally without waiting for stream end.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

const RAW_CHUNK: usize = 8192;

pin_project! {
    pub struct CompressReader<R> {
        #[pin]
        inner: R,
        decompress: Decompress,
        raw: Vec<u8>,
        raw_pos: usize,
        eof: bool,
    }
}

impl<R: AsyncRead> CompressReader<R> {
    pub fn new(inner: R) -> Self {
        CompressReader {
            inner,
            decompress: Decompress::new(true),
            raw: Vec::new(),
            raw_pos: 0,
            eof: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for CompressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if *this.raw_pos < this.raw.len() {
                let before_in = this.decompress.total_in();
                let before_out = this.decompress.total_out();
                let status = this
                    .decompress
                    .decompress(&this.raw[*this.raw_pos..], out.initialize_unfilled(), FlushDecompress::None)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let consumed = (this.decompress.total_in() - before_in) as usize;
                let produced = (this.decompress.total_out() - before_out) as usize;
                *this.raw_pos += consumed;
                if produced > 0 {
                    out.advance(produced);
                    return Poll::Ready(Ok(()));
                }
                if matches!(status, Status::StreamEnd) {
                    return Poll::Ready(Ok(()));
                }
                if consumed == 0 {
                    // no progress possible with the bytes on hand; need more input
                } else {
                    continue;
                }
            }

            if *this.raw_pos >= this.raw.len() {
                this.raw.clear();
                *this.raw_pos = 0;
            }

            if *this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut tmp = vec![0u8; RAW_CHUNK];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match this.inner.as_mut().poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let n = tmp_buf.filled().len();
                    if n == 0 {
                        *this.eof = true;
                    } else {
                        this.raw.extend_from_slice(&tmp[..n]);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pin_project! {
    pub struct CompressWriter<W> {
        #[pin]
        inner: W,
        compress: Compress,
        pending: Vec<u8>,
        pending_off: usize,
    }
}

impl<W: AsyncWrite> CompressWriter<W> {
    pub fn new(inner: W) -> Self {
        CompressWriter {
            inner,
            compress: Compress::new(Compression::default(), true),
            pending: Vec::new(),
            pending_off: 0,
        }
    }

    /// Drives as much of `pending` into `inner` as will go without
    /// blocking. Returns `Ready(Ok(()))` once fully drained.
    fn poll_drain(
        this: &mut CompressWriterProj<'_, W>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>>
    where
        W: AsyncWrite,
    {
        while *this.pending_off < this.pending.len() {
            match this
                .inner
                .as_mut()
                .poll_write(cx, &this.pending[*this.pending_off..])
            {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "compressor downstream write returned 0",
                    )))
                }
                Poll::Ready(Ok(n)) => *this.pending_off += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.pending.clear();
        *this.pending_off = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite> AsyncWrite for CompressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        match Self::poll_drain(&mut this, cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        let before_out = this.compress.total_out();
        this.compress
            .compress_vec(buf, &mut this.pending, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let _ = before_out;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match Self::poll_drain(&mut this, cx) {
            Poll::Ready(Ok(())) => this.inner.poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match Self::poll_drain(&mut this, cx) {
            Poll::Ready(Ok(())) => this.inner.poll_shutdown(cx),
            other => other,
        }
    }
}

pin_project! {
    /// Bundles a [`CompressReader`] and [`CompressWriter`] around the two
    /// halves of a split duplex connection, so a work connection can be
    /// zlib-wrapped the same way [`super::cipher::CryptoStream`] AES-wraps
    /// it (spec §4.6 "bandwidth limit, then encryption, then compression").
    pub struct CompressStream<S> {
        #[pin]
        reader: CompressReader<ReadHalf<S>>,
        #[pin]
        writer: CompressWriter<WriteHalf<S>>,
    }
}

impl<S: AsyncRead + AsyncWrite> CompressStream<S> {
    pub fn wrap(stream: S) -> Self {
        let (r, w) = split(stream);
        CompressStream {
            reader: CompressReader::new(r),
            writer: CompressWriter::new(w),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncRead for CompressStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncWrite for CompressStream<S> {
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
    async fn compress_then_decompress_roundtrips() {
        let (client, server) = duplex(8192);
        let mut writer = CompressWriter::new(client);
        let mut reader = CompressReader::new(server);

        let payload = "the quick brown fox jumps over the lazy dog, repeated, ".repeat(20);
        let payload_clone = payload.clone();

        let sender = tokio::spawn(async move {
            writer.write_all(payload_clone.as_bytes()).await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut buf = vec![0u8; payload.len()];
        reader.read_exact(&mut buf).await.unwrap();
        sender.await.unwrap();

        assert_eq!(buf, payload.as_bytes());
    }
}
