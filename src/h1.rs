//! HTTP/1.x message parsing, framing and serialization.
//!
//! Heads are parsed with [`httparse`] over the connection's read buffer;
//! framing (sized, chunked, EOF-delimited) and serialization live here.
//! Header order is preserved end to end so hooks observe messages the way
//! the peer sent them.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::body::CapturedBody;
use crate::conn::{Conn, Io};

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_LINE_BYTES: usize = 256;
const COPY_CHUNK: usize = 4096;

/// Order-preserving, case-insensitive header multimap.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the value of `name` in place, keeping its position.
    /// Duplicate entries beyond the first are dropped; absent names are
    /// appended at the end.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut slot = None;
        let mut index = 0;
        self.entries.retain(|(k, _)| {
            let keep = !k.eq_ignore_ascii_case(&name) || {
                if slot.is_none() {
                    slot = Some(index);
                    true
                } else {
                    false
                }
            };
            if keep {
                index += 1;
            }
            keep
        });
        match slot {
            Some(at) => self.entries[at].1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body bytes follow the head.
    None,
    /// Exactly this many bytes follow.
    Sized(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the stream (responses only).
    Eof,
}

/// Where the body bytes currently live.
#[derive(Debug)]
pub(crate) enum BodyState {
    /// Still on the wire, to be streamed through at serialization time.
    Wire,
    /// Drained into memory for hook observation / replacement.
    Captured(CapturedBody),
}

#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) proto: String,
    /// Resolved authority: the absolute-form target's authority, the Host
    /// header, or the CONNECT target.
    pub(crate) host: String,
    pub(crate) headers: Headers,
    /// Negative means unknown / chunked.
    pub(crate) content_length: i64,
    pub(crate) framing: Framing,
    pub(crate) body: BodyState,
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) proto: String,
    pub(crate) code: u16,
    pub(crate) reason: String,
    pub(crate) headers: Headers,
    pub(crate) content_length: i64,
    pub(crate) framing: Framing,
    pub(crate) body: BodyState,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn proto_str(minor: u8) -> String {
    match minor {
        0 => "HTTP/1.0".to_owned(),
        _ => "HTTP/1.1".to_owned(),
    }
}

/// Parse one request head from the connection.
pub(crate) async fn read_request<T: Io>(conn: &mut Conn<T>) -> io::Result<Request> {
    loop {
        if let Some((request, consumed)) = parse_request_head(conn.buffer())? {
            conn.consume(consumed);
            return Ok(request);
        }
        if conn.buffer().len() > MAX_HEAD_BYTES {
            return Err(invalid("request head too large"));
        }
        if conn.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a full request head",
            ));
        }
    }
}

/// Parse one response head from the connection. The originating request
/// resolves body rules (HEAD, status classes without bodies).
pub(crate) async fn read_response<T: Io>(conn: &mut Conn<T>, req: &Request) -> io::Result<Response> {
    loop {
        if let Some((response, consumed)) = parse_response_head(conn.buffer(), req)? {
            conn.consume(consumed);
            return Ok(response);
        }
        if conn.buffer().len() > MAX_HEAD_BYTES {
            return Err(invalid("response head too large"));
        }
        if conn.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a full response head",
            ));
        }
    }
}

fn parse_request_head(buf: &[u8]) -> io::Result<Option<(Request, usize)>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(invalid(format!("malformed request head: {err}"))),
    };

    let method = parsed
        .method
        .ok_or_else(|| invalid("request without method"))?
        .to_owned();
    let target = parsed
        .path
        .ok_or_else(|| invalid("request without target"))?
        .to_owned();
    let proto = proto_str(parsed.version.unwrap_or(1));
    let headers = collect_headers(parsed.headers)?;

    let host = resolve_authority(&method, &target, &headers);

    let (content_length, framing) = if method.eq_ignore_ascii_case("CONNECT") {
        (0, Framing::None)
    } else {
        request_framing(&headers)?
    };

    Ok(Some((
        Request {
            method,
            target,
            proto,
            host,
            headers,
            content_length,
            framing,
            body: BodyState::Wire,
        },
        consumed,
    )))
}

fn parse_response_head(buf: &[u8], req: &Request) -> io::Result<Option<(Response, usize)>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(invalid(format!("malformed response head: {err}"))),
    };

    let code = parsed
        .code
        .ok_or_else(|| invalid("response without status code"))?;
    let reason = parsed.reason.unwrap_or_default().to_owned();
    let proto = proto_str(parsed.version.unwrap_or(1));
    let headers = collect_headers(parsed.headers)?;

    let (content_length, framing) = response_framing(req, code, &headers)?;

    Ok(Some((
        Response {
            proto,
            code,
            reason,
            headers,
            content_length,
            framing,
            body: BodyState::Wire,
        },
        consumed,
    )))
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> io::Result<Headers> {
    let mut headers = Headers::new();
    for header in parsed {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| invalid("header value is not valid utf-8"))?
            .trim()
            .to_owned();
        headers.append(header.name, value);
    }
    Ok(headers)
}

/// The authority the request addresses: CONNECT target, absolute-form
/// authority, or the Host header.
fn resolve_authority(method: &str, target: &str, headers: &Headers) -> String {
    if method.eq_ignore_ascii_case("CONNECT") {
        return target.to_owned();
    }
    if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        if end > 0 {
            return rest[..end].to_owned();
        }
    }
    headers.get("host").unwrap_or_default().to_owned()
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn parse_content_length(headers: &Headers) -> io::Result<Option<u64>> {
    match headers.get("content-length") {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid("unparsable content-length")),
    }
}

fn request_framing(headers: &Headers) -> io::Result<(i64, Framing)> {
    if is_chunked(headers) {
        return Ok((-1, Framing::Chunked));
    }
    match parse_content_length(headers)? {
        Some(0) | None => Ok((0, Framing::None)),
        Some(n) => Ok((n as i64, Framing::Sized(n))),
    }
}

fn response_framing(req: &Request, code: u16, headers: &Headers) -> io::Result<(i64, Framing)> {
    let bodyless =
        req.method.eq_ignore_ascii_case("HEAD") || code / 100 == 1 || code == 204 || code == 304;
    if bodyless {
        let declared = parse_content_length(headers)?.map(|n| n as i64).unwrap_or(0);
        return Ok((declared, Framing::None));
    }
    if is_chunked(headers) {
        return Ok((-1, Framing::Chunked));
    }
    match parse_content_length(headers)? {
        Some(0) => Ok((0, Framing::None)),
        Some(n) => Ok((n as i64, Framing::Sized(n))),
        None => Ok((-1, Framing::Eof)),
    }
}

/// Strip an absolute-form target down to origin-form for the origin side.
fn origin_form(target: &str) -> &str {
    let rest = match target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        Some(rest) => rest,
        None => return target,
    };
    match rest.find(['/', '?']) {
        Some(at) => &rest[at..],
        None => "/",
    }
}

fn encode_request_head(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(req.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(origin_form(&req.target).as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.proto.as_bytes());
    out.extend_from_slice(b"\r\n");
    if !req.headers.contains("host") && !req.host.is_empty() {
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(req.host.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    encode_headers(&req.headers, &mut out);
    out.extend_from_slice(b"\r\n");
    out
}

fn encode_response_head(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(resp.proto.as_bytes());
    out.push(b' ');
    out.extend_from_slice(resp.code.to_string().as_bytes());
    if !resp.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(resp.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    encode_headers(&resp.headers, &mut out);
    out.extend_from_slice(b"\r\n");
    out
}

fn encode_headers(headers: &Headers, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Serialize the request to the origin connection, draining its body from
/// the capture buffer or streaming it through from the client connection.
pub(crate) async fn write_request<C: Io, S: Io>(
    req: &mut Request,
    client: &mut Conn<C>,
    origin: &mut Conn<S>,
) -> io::Result<()> {
    let head = encode_request_head(req);
    origin.write_all(&head).await?;
    write_body(&mut req.body, req.framing, client, origin).await?;
    origin.flush().await
}

/// Serialize the response to the client connection.
pub(crate) async fn write_response<S: Io, C: Io>(
    resp: &mut Response,
    origin: &mut Conn<S>,
    client: &mut Conn<C>,
) -> io::Result<()> {
    let head = encode_response_head(resp);
    client.write_all(&head).await?;
    write_body(&mut resp.body, resp.framing, origin, client).await?;
    client.flush().await
}

async fn write_body<R: Io, W: Io>(
    body: &mut BodyState,
    framing: Framing,
    src: &mut Conn<R>,
    dst: &mut Conn<W>,
) -> io::Result<()> {
    match body {
        BodyState::Captured(captured) => match framing {
            Framing::Chunked => write_captured_chunked(captured, dst).await,
            _ => write_captured_raw(captured, dst).await,
        },
        BodyState::Wire => match framing {
            Framing::None => Ok(()),
            Framing::Sized(n) => copy_sized(src, dst, n).await,
            Framing::Chunked => copy_chunked(src, dst).await,
            Framing::Eof => copy_to_eof(src, dst).await,
        },
    }
}

async fn write_captured_raw<W: Io>(
    captured: &mut CapturedBody,
    dst: &mut Conn<W>,
) -> io::Result<()> {
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        let n = captured.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&chunk[..n]).await?;
    }
}

async fn write_captured_chunked<W: Io>(
    captured: &mut CapturedBody,
    dst: &mut Conn<W>,
) -> io::Result<()> {
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        let n = captured.read(&mut chunk)?;
        if n == 0 {
            dst.write_all(b"0\r\n\r\n").await?;
            return Ok(());
        }
        dst.write_all(format!("{n:x}\r\n").as_bytes()).await?;
        dst.write_all(&chunk[..n]).await?;
        dst.write_all(b"\r\n").await?;
    }
}

async fn copy_sized<R: Io, W: Io>(
    src: &mut Conn<R>,
    dst: &mut Conn<W>,
    mut remaining: u64,
) -> io::Result<()> {
    while remaining > 0 {
        if src.buffer().is_empty() && src.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        let take = src.buffer().len().min(remaining.min(usize::MAX as u64) as usize);
        dst.write_all(&src.buffer()[..take]).await?;
        src.consume(take);
        remaining -= take as u64;
    }
    Ok(())
}

async fn copy_to_eof<R: Io, W: Io>(src: &mut Conn<R>, dst: &mut Conn<W>) -> io::Result<()> {
    loop {
        if src.buffer().is_empty() && src.fill().await? == 0 {
            return Ok(());
        }
        let take = src.buffer().len();
        dst.write_all(&src.buffer()[..take]).await?;
        src.consume(take);
    }
}

/// Pass a chunked body through, re-encoding each chunk as it is decoded.
/// Trailers are consumed and dropped.
async fn copy_chunked<R: Io, W: Io>(src: &mut Conn<R>, dst: &mut Conn<W>) -> io::Result<()> {
    loop {
        let size = read_chunk_size(src).await?;
        if size == 0 {
            consume_trailers(src).await?;
            dst.write_all(b"0\r\n\r\n").await?;
            return Ok(());
        }
        dst.write_all(format!("{size:x}\r\n").as_bytes()).await?;
        copy_sized(src, dst, size).await?;
        expect_crlf(src).await?;
        dst.write_all(b"\r\n").await?;
    }
}

/// Drain a message body into memory according to its framing.
pub(crate) async fn read_body<T: Io>(conn: &mut Conn<T>, framing: Framing) -> io::Result<Bytes> {
    match framing {
        Framing::None => Ok(Bytes::new()),
        Framing::Sized(n) => read_sized(conn, n).await,
        Framing::Chunked => read_chunked(conn).await,
        Framing::Eof => read_until_eof(conn).await,
    }
}

async fn read_sized<T: Io>(conn: &mut Conn<T>, len: u64) -> io::Result<Bytes> {
    let mut out = BytesMut::with_capacity(len.min(64 * 1024) as usize);
    let mut remaining = len;
    while remaining > 0 {
        if conn.buffer().is_empty() && conn.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        let take = conn
            .buffer()
            .len()
            .min(remaining.min(usize::MAX as u64) as usize);
        out.extend_from_slice(&conn.buffer()[..take]);
        conn.consume(take);
        remaining -= take as u64;
    }
    Ok(out.freeze())
}

async fn read_until_eof<T: Io>(conn: &mut Conn<T>) -> io::Result<Bytes> {
    let mut out = BytesMut::new();
    loop {
        if conn.buffer().is_empty() && conn.fill().await? == 0 {
            return Ok(out.freeze());
        }
        out.extend_from_slice(conn.buffer());
        let len = conn.buffer().len();
        conn.consume(len);
    }
}

async fn read_chunked<T: Io>(conn: &mut Conn<T>) -> io::Result<Bytes> {
    let mut out = BytesMut::new();
    loop {
        let size = read_chunk_size(conn).await?;
        if size == 0 {
            consume_trailers(conn).await?;
            return Ok(out.freeze());
        }
        let chunk = read_sized(conn, size).await?;
        out.extend_from_slice(&chunk);
        expect_crlf(conn).await?;
    }
}

async fn read_line<T: Io>(conn: &mut Conn<T>) -> io::Result<String> {
    loop {
        if let Some(at) = conn.buffer().iter().position(|&b| b == b'\n') {
            let line = &conn.buffer()[..at];
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            let line = std::str::from_utf8(line)
                .map_err(|_| invalid("line is not valid utf-8"))?
                .to_owned();
            conn.consume(at + 1);
            return Ok(line);
        }
        if conn.buffer().len() > MAX_LINE_BYTES {
            return Err(invalid("line too long"));
        }
        if conn.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
    }
}

async fn read_chunk_size<T: Io>(conn: &mut Conn<T>) -> io::Result<u64> {
    let line = read_line(conn).await?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid("unparsable chunk size"))
}

async fn expect_crlf<T: Io>(conn: &mut Conn<T>) -> io::Result<()> {
    let line = read_line(conn).await?;
    if line.is_empty() {
        Ok(())
    } else {
        Err(invalid("chunk data not terminated by CRLF"))
    }
}

async fn consume_trailers<T: Io>(conn: &mut Conn<T>) -> io::Result<()> {
    loop {
        if read_line(conn).await?.is_empty() {
            return Ok(());
        }
    }
}
