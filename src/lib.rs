//! An intercepting HTTP(S) proxy that exposes every request/response pair
//! to user-supplied inspection hooks.
//!
//! Plaintext HTTP is parsed and re-serialized through the hook pipeline.
//! For HTTPS the proxy performs man-in-the-middle interception: it answers
//! the client's `CONNECT`, terminates TLS with a leaf certificate minted on
//! demand for the requested host and signed by the configured root CA,
//! opens its own TLS connection to the origin, and relays the decrypted
//! exchanges through the same hooks. When no usable root material is
//! available, HTTPS connections degrade to an opaque byte tunnel.
//!
//! Hooks may rewrite headers and bodies; a body becomes mutable once a
//! hook has read it through the capturing accessor, and the rewritten
//! bytes (with a corrected `Content-Length` where one was present) are
//! what the peer receives.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use periscope::{Inspect, Proxy, Session, error::BoxError};
//!
//! struct Sniffer;
//!
//! #[async_trait::async_trait]
//! impl Inspect for Sniffer {
//!     async fn before_request(&self, session: &mut Session) -> Result<(), BoxError> {
//!         tracing::info!(
//!             "{} {}",
//!             session.method().unwrap_or_default(),
//!             session.request_url().unwrap_or_default(),
//!         );
//!         Ok(())
//!     }
//!
//!     async fn before_response(&self, session: &mut Session) -> Result<(), BoxError> {
//!         tracing::info!(
//!             "{} {}",
//!             session.response_proto().unwrap_or_default(),
//!             session.status().unwrap_or_default(),
//!         );
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     let proxy = Proxy::builder(9999).inspector(Arc::new(Sniffer)).build();
//!     proxy.serve().await?;
//!     Ok(())
//! }
//! ```

mod body;
mod cert;
mod conn;
pub mod error;
mod h1;
mod inspect;
mod proxy;
mod session;
mod tunnel;

pub use body::CapturedBody;
pub use h1::Headers;
pub use inspect::Inspect;
pub use proxy::{Listener, Proxy, ProxyBuilder};
pub use session::Session;
