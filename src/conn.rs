//! Buffered connection type shared by both session ends.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A byte stream a session can own: plain TCP or a TLS-wrapped socket.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// A stream plus its read buffer.
///
/// Head parsing over-reads; whatever is left in the buffer after a parsed
/// head is the start of the message body (or of the next message).
pub(crate) struct Conn<T = BoxIo> {
    io: T,
    rd: BytesMut,
}

impl<T: Io> Conn<T> {
    pub(crate) fn new(io: T) -> Self {
        Self {
            io,
            rd: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Unwrap the underlying stream, discarding buffered bytes.
    ///
    /// Callers that care about buffered bytes must drain them first via
    /// [`Conn::take_buffer`].
    pub(crate) fn into_io(self) -> T {
        self.io
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        &self.rd
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.rd.advance(n);
    }

    pub(crate) fn take_buffer(&mut self) -> Bytes {
        self.rd.split().freeze()
    }

    /// Read more bytes into the buffer. `Ok(0)` means end-of-stream.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.io.read_buf(&mut self.rd).await
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_buffers_and_consume_advances() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut conn = Conn::new(b);

        a.write_all(b"hello world").await.unwrap();
        drop(a);

        while conn.fill().await.unwrap() > 0 {}
        assert_eq!(conn.buffer(), b"hello world");

        conn.consume(6);
        assert_eq!(conn.buffer(), b"world");
        assert_eq!(conn.take_buffer(), Bytes::from_static(b"world"));
        assert!(conn.buffer().is_empty());
    }
}
