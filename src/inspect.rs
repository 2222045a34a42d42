//! The inspection capability invoked around every forwarded exchange.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::session::Session;

/// Observes and optionally rewrites the messages of a session.
///
/// One hook instance is shared immutably across all sessions of a proxy and
/// invoked re-entrantly from many session tasks; implementations are
/// responsible for their own synchronization. For a single exchange,
/// `before_request` runs before the request is sent to the origin and
/// `before_response` runs before the response is written back to the client.
///
/// Returning an error ends the session; other sessions are unaffected.
#[async_trait]
pub trait Inspect: Send + Sync {
    async fn before_request(&self, session: &mut Session) -> Result<(), BoxError>;

    async fn before_response(&self, session: &mut Session) -> Result<(), BoxError>;
}
