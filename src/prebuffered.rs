//! A read-ahead wrapper for client sockets.
//!
//! [`Prebuffered`] accumulates bytes from the inner stream so the request head
//! can be inspected before deciding who consumes the connection. Whatever is
//! still buffered is served first by `AsyncRead`, so a downstream consumer
//! (hyper or the tunnel) sees the byte stream exactly as the client sent it.

use bytes::{Bytes, BytesMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    pub fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drops `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Reads more data into the buffer without exceeding the limit.
    /// Returns 0 at EOF or when the buffer is already full.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        (&mut self.inner).take(max as u64).read_buf(&mut self.buf).await
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
