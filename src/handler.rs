//! Request/response contract handed to each [`Client`](crate::client::Client) (§6).
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::observer::Observer;

/// An inbound HTTP request, opaque beyond a bytes-in/bytes-out contract.
///
/// Body streaming, content negotiation and routing are explicitly out of
/// scope for the core (§1 Non-goals); this is intentionally the thinnest
/// shape the orchestrator needs to exist in order to type the
/// `RequestHandler` seam, not a full request model.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// An outbound HTTP response, equally opaque.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }
}

/// The user-supplied capability that turns a parsed request into a
/// response. The core never inspects the body or headers; it only
/// dispatches to this trait and writes back whatever it returns. Grounded
/// on a `CommandVariant::apply(&self, db, connection, shutdown)
/// -> Result<()>` dispatch shape, generalized from a RESP command enum to
/// an opaque request/response pair.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> anyhow::Result<Response>;

    /// Auto-attach capability (§4.1.1 step 2); see [`DriverFactory::as_observer`](crate::driver::DriverFactory::as_observer).
    fn as_observer(self: Arc<Self>) -> Option<Arc<dyn Observer>> {
        None
    }
}

/// Invoked when a client's protocol driver or request handler raises an
/// error that the driver itself cannot recover from. The core does not
/// interpret the error; it only routes it here and otherwise treats
/// per-client failures as invisible to the orchestrator (§7 propagation
/// policy).
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle_error(&self, error: anyhow::Error);

    fn as_observer(self: Arc<Self>) -> Option<Arc<dyn Observer>> {
        None
    }
}
