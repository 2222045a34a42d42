//! The proxy front: TCP listener and per-connection task spawning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::cert::CertMint;
use crate::error::{ErrorContext, OpaqueError};
use crate::inspect::Inspect;
use crate::session::Session;

/// Shared state handed down into every session.
pub(crate) struct ProxyContext {
    pub(crate) hook: Option<Arc<dyn Inspect>>,
    pub(crate) mint: CertMint,
    active: AtomicUsize,
    admission: Option<Arc<Semaphore>>,
}

/// An intercepting proxy instance. Immutable after construction.
pub struct Proxy {
    port: u16,
    ctx: Arc<ProxyContext>,
}

/// Configures and builds a [`Proxy`].
pub struct ProxyBuilder {
    port: u16,
    hook: Option<Arc<dyn Inspect>>,
    root_pem: Option<(String, String)>,
    admission_limit: Option<usize>,
}

impl ProxyBuilder {
    /// The inspection hook invoked around every forwarded exchange.
    #[must_use]
    pub fn inspector(mut self, hook: Arc<dyn Inspect>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Root CA material for TLS interception: one X.509 certificate PEM and
    /// one PKCS#1 RSA private key PEM. Without it (or when it fails to
    /// parse) every HTTPS connection degrades to an opaque tunnel.
    #[must_use]
    pub fn root_ca(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.root_pem = Some((cert_pem.into(), key_pem.into()));
        self
    }

    /// Optional admission control: at most this many concurrent sessions,
    /// excess connections wait. Off by default; backpressure is otherwise
    /// left to the OS socket layer.
    #[must_use]
    pub fn admission_limit(mut self, permits: usize) -> Self {
        self.admission_limit = Some(permits);
        self
    }

    #[must_use]
    pub fn build(self) -> Proxy {
        Proxy {
            port: self.port,
            ctx: Arc::new(ProxyContext {
                hook: self.hook,
                mint: CertMint::new(self.root_pem),
                active: AtomicUsize::new(0),
                admission: self.admission_limit.map(|n| Arc::new(Semaphore::new(n))),
            }),
        }
    }
}

impl Proxy {
    /// Start configuring a proxy that will listen on all interfaces on
    /// `port`.
    #[must_use]
    pub fn builder(port: u16) -> ProxyBuilder {
        ProxyBuilder {
            port,
            hook: None,
            root_pem: None,
            admission_limit: None,
        }
    }

    /// Number of sessions currently running.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.ctx.active.load(Ordering::Relaxed)
    }

    /// Bind the listening socket. A bind failure is fatal to the caller.
    pub async fn bind(&self) -> Result<Listener, OpaqueError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("bind tcp listener on 0.0.0.0:{}", self.port))?;
        Ok(Listener {
            listener,
            ctx: self.ctx.clone(),
        })
    }

    /// Bind and serve forever.
    pub async fn serve(&self) -> Result<(), OpaqueError> {
        self.bind().await?.serve().await
    }
}

/// A bound proxy listener.
pub struct Listener {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr, OpaqueError> {
        self.listener.local_addr().context("listener local address")
    }

    /// Number of sessions currently running.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.ctx.active.load(Ordering::Relaxed)
    }

    /// Accept connections forever, spawning one detached session task per
    /// connection. Sessions are never joined; a failing session never
    /// affects the listener or its siblings.
    pub async fn serve(self) -> Result<(), OpaqueError> {
        tracing::info!(
            "proxy listening on {}",
            self.local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned())
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                    continue;
                }
            };
            tracing::trace!("accepted connection from {peer}");

            let ctx = self.ctx.clone();
            let admission = ctx.admission.clone();
            tokio::spawn(async move {
                let _permit = match admission {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let _active = ActiveGuard::enter(&ctx);
                Session::new(stream).run(ctx.clone()).await;
            });
        }
    }
}

/// Keeps the active-session counter honest, panics included.
struct ActiveGuard {
    ctx: Arc<ProxyContext>,
}

impl ActiveGuard {
    fn enter(ctx: &Arc<ProxyContext>) -> Self {
        ctx.active.fetch_add(1, Ordering::Relaxed);
        Self { ctx: ctx.clone() }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.ctx.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_on_ephemeral_port() {
        let proxy = Proxy::builder(0).build();
        let listener = proxy.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.active_sessions(), 0);
    }

    #[test]
    fn active_guard_balances_on_drop() {
        let proxy = Proxy::builder(0).build();
        let guard = ActiveGuard::enter(&proxy.ctx);
        assert_eq!(proxy.active_sessions(), 1);
        drop(guard);
        assert_eq!(proxy.active_sessions(), 0);
    }
}
