//! The per-connection protocol engine, consumed opaquely (§6).
use std::sync::Arc;

use crate::observer::Observer;

/// Supplies the HTTP protocol engine used to drive each accepted client.
///
/// The framing/parsing work itself — HTTP/1.x and HTTP/2 — is out of scope
/// for the core (§1); this trait only exposes what the orchestrator needs
/// from it: the ALPN identifiers to offer during the TLS handshake
/// (§4.1.1 step 7). There is no ALPN concept in a plain key/value wire
/// protocol, so this trait has no direct precedent elsewhere in the
/// crate's ancestry; it is shaped after the other consumed-capability
/// traits in this crate instead.
pub trait DriverFactory: Send + Sync {
    /// ALPN protocol identifiers in preference order, e.g. `["h2", "http/1.1"]`.
    fn application_layer_protocols(&self) -> Vec<String>;

    /// Returns this factory as an [`Observer`] if the concrete type also
    /// implements that capability, so the orchestrator can auto-attach it
    /// during startup (§4.1.1 step 2). Default `None`; override when
    /// `Self` also implements `Observer`.
    fn as_observer(self: Arc<Self>) -> Option<Arc<dyn Observer>> {
        None
    }
}
