//! Per-connection session: the proxy's central state machine.
//!
//! A session reads one request from the accepted connection, dials the
//! origin it names, and then either relays a single plaintext exchange,
//! terminates TLS on both sides and loops over decrypted exchanges (MITM),
//! or degrades to an opaque byte tunnel when no usable root material is
//! available. Inspection hooks run around every forwarded exchange.
//!
//! Errors are terminal for the session and silent towards the client; both
//! sockets close when the session task completes, whatever path was taken.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::body::CapturedBody;
use crate::cert;
use crate::conn::Conn;
use crate::error::{BoxError, ErrorContext, OpaqueError};
use crate::h1::{self, BodyState, Headers};
use crate::proxy::ProxyContext;
use crate::tunnel;

const READ_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

/// One accepted connection and everything the proxy knows about it.
///
/// Hooks receive `&mut Session` and observe or rewrite the current exchange
/// through the accessor surface; the sockets themselves stay private.
pub struct Session {
    client: Option<Conn>,
    server: Option<Conn>,
    request: Option<h1::Request>,
    response: Option<h1::Response>,
    local: Option<Box<dyn Any + Send>>,
}

impl Session {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            client: Some(Conn::new(Box::new(stream))),
            server: None,
            request: None,
            response: None,
            local: None,
        }
    }

    /// Drive the session to completion. Never panics outwards; errors are
    /// logged and terminal for this session only.
    pub(crate) async fn run(mut self, ctx: Arc<ProxyContext>) {
        if let Err(err) = self.drive(&ctx).await {
            tracing::debug!("session closed: {err}");
        }
    }

    async fn drive(&mut self, ctx: &ProxyContext) -> Result<(), BoxError> {
        let client = self.client.as_mut().context("client connection closed")?;
        let request = timeout(READ_REQUEST_TIMEOUT, h1::read_request(client))
            .await
            .context("client request read timed out")??;

        let mut authority = request.host.clone();
        if authority.is_empty() {
            return Err(OpaqueError::msg("request without host").into());
        }
        if !authority.contains(':') {
            authority.push_str(":80");
        }
        let intercept_tls =
            request.method.eq_ignore_ascii_case("CONNECT") || authority.ends_with(":443");
        self.request = Some(request);

        let origin = timeout(DIAL_TIMEOUT, TcpStream::connect(&authority))
            .await
            .context("origin dial timed out")?
            .with_context(|| format!("origin dial failed for '{authority}'"))?;
        self.server = Some(Conn::new(Box::new(origin)));

        if intercept_tls {
            self.handle_tls(ctx, &authority).await
        } else {
            self.exchange(ctx).await
        }
    }

    /// TLS branch: acknowledge the CONNECT, then either intercept with a
    /// minted leaf or fall back to an opaque tunnel.
    async fn handle_tls(&mut self, ctx: &ProxyContext, authority: &str) -> Result<(), BoxError> {
        {
            let client = self.client.as_mut().context("client connection closed")?;
            client.write_all(CONNECT_ESTABLISHED).await?;
            client.flush().await?;
        }

        let minted = match ctx.mint.load_root() {
            Ok(_) => match ctx.mint.cert_for_host(authority) {
                Ok(minted) => Some(minted),
                Err(err) => {
                    tracing::debug!("leaf mint failed for '{authority}', tunneling: {err}");
                    None
                }
            },
            Err(err) => {
                tracing::debug!("root material unavailable, tunneling '{authority}': {err}");
                None
            }
        };

        let Some(minted) = minted else {
            let client = self.client.take().context("client connection closed")?;
            let origin = self.server.take().context("origin connection closed")?;
            return tunnel::relay(client, origin).await;
        };

        let acceptor = TlsAcceptor::from(minted.server_config()?);
        let client_io = self
            .client
            .take()
            .context("client connection closed")?
            .into_io();
        let client_tls = acceptor
            .accept(client_io)
            .await
            .context("client tls handshake")?;
        self.client = Some(Conn::new(Box::new(client_tls)));

        let server_name = ServerName::try_from(cert::canonical_host(authority))
            .context("origin server name")?;
        let connector = TlsConnector::from(insecure_client_config());
        let origin_io = self
            .server
            .take()
            .context("origin connection closed")?
            .into_io();
        let origin_tls = connector
            .connect(server_name, origin_io)
            .await
            .context("origin tls handshake")?;
        self.server = Some(Conn::new(Box::new(origin_tls)));

        // Decrypted exchanges against the same origin connection, until
        // either side errors out or closes.
        loop {
            let client = self.client.as_mut().context("client connection closed")?;
            let request = timeout(READ_REQUEST_TIMEOUT, h1::read_request(client))
                .await
                .context("client request read timed out")??;
            self.request = Some(request);
            self.response = None;
            self.exchange(ctx).await?;
        }
    }

    /// One request/response round trip with the hook sequence around it.
    async fn exchange(&mut self, ctx: &ProxyContext) -> Result<(), BoxError> {
        if let Some(hook) = ctx.hook.as_deref() {
            hook.before_request(self).await.context("before_request hook")?;
        }

        {
            let request = self.request.as_mut().context("no request to forward")?;
            let client = self.client.as_mut().context("client connection closed")?;
            let origin = self.server.as_mut().context("origin connection closed")?;
            h1::write_request(request, client, origin)
                .await
                .context("forward request to origin")?;
        }

        let response = {
            let request = self.request.as_ref().context("no request to forward")?;
            let origin = self.server.as_mut().context("origin connection closed")?;
            h1::read_response(origin, request)
                .await
                .context("read origin response")?
        };
        self.response = Some(response);

        if let Some(hook) = ctx.hook.as_deref() {
            hook.before_response(self)
                .await
                .context("before_response hook")?;
        }

        {
            let response = self.response.as_mut().context("no response to forward")?;
            let origin = self.server.as_mut().context("origin connection closed")?;
            let client = self.client.as_mut().context("client connection closed")?;
            h1::write_response(response, origin, client)
                .await
                .context("write response to client")?;
        }

        // Drop message and captured-body references before the next exchange.
        self.request = None;
        self.response = None;
        Ok(())
    }

    /// The authority of the current request, as sent by the client.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.host.as_str())
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.method.as_str())
    }

    /// Status line of the current response, e.g. `"200 OK"`.
    #[must_use]
    pub fn status(&self) -> Option<String> {
        self.response.as_ref().map(|r| {
            if r.reason.is_empty() {
                r.code.to_string()
            } else {
                format!("{} {}", r.code, r.reason)
            }
        })
    }

    #[must_use]
    pub fn request_proto(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.proto.as_str())
    }

    #[must_use]
    pub fn response_proto(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.proto.as_str())
    }

    /// The request target exactly as the client sent it.
    #[must_use]
    pub fn request_url(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.target.as_str())
    }

    #[must_use]
    pub fn request_head(&self) -> Option<&Headers> {
        self.request.as_ref().map(|r| &r.headers)
    }

    pub fn request_head_mut(&mut self) -> Option<&mut Headers> {
        self.request.as_mut().map(|r| &mut r.headers)
    }

    #[must_use]
    pub fn response_head(&self) -> Option<&Headers> {
        self.response.as_ref().map(|r| &r.headers)
    }

    pub fn response_head_mut(&mut self) -> Option<&mut Headers> {
        self.response.as_mut().map(|r| &mut r.headers)
    }

    #[must_use]
    pub fn request_encoding(&self) -> Option<&str> {
        self.request.as_ref()?.headers.get("content-encoding")
    }

    #[must_use]
    pub fn response_encoding(&self) -> Option<&str> {
        self.response.as_ref()?.headers.get("content-encoding")
    }

    #[must_use]
    pub fn response_type(&self) -> Option<&str> {
        self.response.as_ref()?.headers.get("content-type")
    }

    /// The request body, captured into memory on first call so later
    /// serialization emits the buffered bytes. Empty when the request has
    /// no body or content length zero.
    pub async fn request_body(&mut self) -> Result<Bytes, OpaqueError> {
        let Some(request) = self.request.as_mut() else {
            return Ok(Bytes::new());
        };
        if request.content_length == 0 {
            return Ok(Bytes::new());
        }
        if let BodyState::Captured(captured) = &request.body {
            return Ok(captured.content());
        }
        let client = self.client.as_mut().context("client connection closed")?;
        let raw = h1::read_body(client, request.framing)
            .await
            .context("capture request body")?;
        request.body = BodyState::Captured(CapturedBody::new(raw.clone()));
        Ok(raw)
    }

    /// Replace the request body. A no-op unless [`Session::request_body`]
    /// captured it first. Content length and the `Content-Length` header
    /// follow the new length only when the original length was known;
    /// chunked bodies keep their framing.
    pub fn set_request_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        if body.is_empty() {
            return;
        }
        let Some(request) = self.request.as_mut() else {
            return;
        };
        let BodyState::Captured(captured) = &mut request.body else {
            return;
        };
        captured.set_content(body.clone());
        if request.content_length >= 0 {
            request.content_length = body.len() as i64;
            request.headers.set("Content-Length", body.len().to_string());
        }
    }

    /// The response body, captured into memory on first call. Large
    /// responses are buffered whole; call only when needed.
    pub async fn response_body(&mut self) -> Result<Bytes, OpaqueError> {
        let Some(response) = self.response.as_mut() else {
            return Ok(Bytes::new());
        };
        if response.content_length == 0 {
            return Ok(Bytes::new());
        }
        if let BodyState::Captured(captured) = &response.body {
            return Ok(captured.content());
        }
        let origin = self.server.as_mut().context("origin connection closed")?;
        let raw = h1::read_body(origin, response.framing)
            .await
            .context("capture response body")?;
        response.body = BodyState::Captured(CapturedBody::new(raw.clone()));
        Ok(raw)
    }

    /// Replace the response body; same contract as
    /// [`Session::set_request_body`].
    pub fn set_response_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        if body.is_empty() {
            return;
        }
        let Some(response) = self.response.as_mut() else {
            return;
        };
        let BodyState::Captured(captured) = &mut response.body else {
            return;
        };
        captured.set_content(body.clone());
        if response.content_length >= 0 {
            response.content_length = body.len() as i64;
            response
                .headers
                .set("Content-Length", body.len().to_string());
        }
    }

    /// The per-session user datum, if one of type `T` was stored.
    #[must_use]
    pub fn local_data<T: Any + Send>(&self) -> Option<&T> {
        self.local.as_ref()?.downcast_ref()
    }

    pub fn local_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.local.as_mut()?.downcast_mut()
    }

    pub fn set_local_data<T: Any + Send>(&mut self, value: T) {
        self.local = Some(Box::new(value));
    }
}

/// Origin-side TLS configuration: certificate verification disabled.
///
/// MITM by construction is incompatible with origin verification inside
/// this core; verification policy belongs to a separate layer.
fn insecure_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// Accepts whatever certificate the origin presents; signatures are still
/// checked against the presented key.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureVerifier {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h1::Framing;

    fn session_with_request(content_length: i64, framing: Framing) -> Session {
        Session {
            client: None,
            server: None,
            request: Some(h1::Request {
                method: "POST".to_owned(),
                target: "/upload".to_owned(),
                proto: "HTTP/1.1".to_owned(),
                host: "origin.test".to_owned(),
                headers: {
                    let mut headers = Headers::new();
                    if content_length >= 0 {
                        headers.append("Content-Length", content_length.to_string());
                    } else {
                        headers.append("Transfer-Encoding", "chunked");
                    }
                    headers
                },
                content_length,
                framing,
                body: BodyState::Wire,
            }),
            response: None,
            local: None,
        }
    }

    #[test]
    fn set_body_without_capture_is_a_noop() {
        let mut session = session_with_request(3, Framing::Sized(3));
        session.set_request_body("BBBB");
        let request = session.request.as_ref().unwrap();
        assert!(matches!(request.body, BodyState::Wire));
        assert_eq!(request.content_length, 3);
    }

    #[test]
    fn set_body_after_capture_updates_length() {
        let mut session = session_with_request(3, Framing::Sized(3));
        session.request.as_mut().unwrap().body =
            BodyState::Captured(CapturedBody::new(Bytes::from_static(b"AAA")));
        session.set_request_body("BBBB");
        let request = session.request.as_ref().unwrap();
        assert_eq!(request.content_length, 4);
        assert_eq!(request.headers.get("content-length"), Some("4"));
    }

    #[test]
    fn chunked_body_keeps_unknown_length_on_rewrite() {
        let mut session = session_with_request(-1, Framing::Chunked);
        session.request.as_mut().unwrap().body =
            BodyState::Captured(CapturedBody::new(Bytes::from_static(b"foo")));
        session.set_request_body("bar");
        let request = session.request.as_ref().unwrap();
        assert_eq!(request.content_length, -1);
        assert!(request.headers.get("content-length").is_none());
        if let BodyState::Captured(captured) = &request.body {
            assert_eq!(captured.content(), Bytes::from_static(b"bar"));
        } else {
            panic!("body must stay captured");
        }
    }

    #[test]
    fn response_accessors_guard_on_response_presence() {
        let session = session_with_request(0, Framing::None);
        assert!(session.status().is_none());
        assert!(session.response_type().is_none());
        assert!(session.response_encoding().is_none());
        assert_eq!(session.method(), Some("POST"));
    }

    #[test]
    fn local_data_round_trips_by_type() {
        let mut session = session_with_request(0, Framing::None);
        assert!(session.local_data::<u32>().is_none());
        session.set_local_data(7u32);
        assert_eq!(session.local_data::<u32>(), Some(&7));
        assert!(session.local_data::<String>().is_none());
        *session.local_data_mut::<u32>().unwrap() = 9;
        assert_eq!(session.local_data::<u32>(), Some(&9));
    }
}
