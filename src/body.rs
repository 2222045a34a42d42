//! In-memory capture of a message body.
//!
//! An HTTP message body is normally a forward-only stream that the
//! serializer drains exactly once. To let hooks observe and replace a body,
//! the raw stream is drained into a [`CapturedBody`] on first observation
//! and re-attached to the message, so that downstream serialization emits
//! the buffered copy instead.

use std::io::Read;

use bytes::Bytes;

/// A buffered message body with a read cursor and a closed flag.
#[derive(Debug, Default)]
pub struct CapturedBody {
    buf: Bytes,
    pos: usize,
    closed: bool,
}

impl CapturedBody {
    #[must_use]
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
            closed: false,
        }
    }

    /// The full buffered content, regardless of the read cursor.
    #[must_use]
    pub fn content(&self) -> Bytes {
        self.buf.clone()
    }

    /// Replace the buffered content and rewind the read cursor.
    pub fn set_content(&mut self, buf: impl Into<Bytes>) {
        self.buf = buf.into();
        self.pos = 0;
    }

    /// Close the body. Subsequent reads report end-of-stream. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Read for CapturedBody {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        if self.closed || self.pos >= self.buf.len() {
            return Ok(0);
        }
        let n = dst.len().min(self.buf.len() - self.pos);
        dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_reads_yield_content_then_eof() {
        let mut body = CapturedBody::new(Bytes::from_static(b"hello world"));
        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = body.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(body.read(&mut chunk).unwrap(), 0);
    }

    #[test]
    fn close_before_exhaustion_reports_eof() {
        let mut body = CapturedBody::new(Bytes::from_static(b"hello"));
        let mut chunk = [0u8; 2];
        assert_eq!(body.read(&mut chunk).unwrap(), 2);
        body.close();
        assert_eq!(body.read(&mut chunk).unwrap(), 0);
        body.close();
        assert_eq!(body.read(&mut chunk).unwrap(), 0);
    }

    #[test]
    fn set_content_rewinds_cursor() {
        let mut body = CapturedBody::new(Bytes::from_static(b"aaa"));
        let mut chunk = [0u8; 8];
        assert_eq!(body.read(&mut chunk).unwrap(), 3);
        body.set_content(Bytes::from_static(b"bbbb"));
        assert_eq!(body.content(), Bytes::from_static(b"bbbb"));
        assert_eq!(body.read(&mut chunk).unwrap(), 4);
        assert_eq!(&chunk[..4], b"bbbb");
    }
}
