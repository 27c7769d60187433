//! The accepted-connection handle the orchestrator registers and tracks (§6).
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};

use crate::driver::DriverFactory;
use crate::handler::{ErrorHandler, RequestHandler};
use crate::logger::Logger;
use crate::network::PeerAddress;
use crate::observer::Observer;
use crate::options::Options;
use crate::timeout_wheel::TimeoutWheel;

/// A socket handed to a [`ClientFactory`] fresh off `accept()`. Generalizes
/// a bare `TcpStream` parameter (`Connection::new(socket)`) to
/// cover the Unix-socket listener kind added in §SUPPLEMENT.
pub enum AcceptedSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AcceptedSocket {
    pub fn peer_address(&self) -> std::io::Result<PeerAddress> {
        match self {
            AcceptedSocket::Tcp(stream) => stream.peer_addr().map(PeerAddress::Tcp),
            AcceptedSocket::Unix(_) => Ok(PeerAddress::Unix),
        }
    }
}

/// A handle to the orchestrator's shared [`TimeoutWheel`] (§5 "Shared
/// resources"), the only way a `Client` is allowed to touch it — never the
/// wheel directly, so all mutation still funnels through one `Mutex`
/// regardless of how many clients are live.
#[derive(Clone)]
pub struct TimeoutWheelHandle {
    wheel: Arc<Mutex<TimeoutWheel>>,
    epoch: tokio::time::Instant,
}

impl TimeoutWheelHandle {
    pub(crate) fn new(wheel: Arc<Mutex<TimeoutWheel>>, epoch: tokio::time::Instant) -> Self {
        Self { wheel, epoch }
    }

    /// Seconds elapsed since the orchestrator started, the same clock the
    /// timeout tick reads `now` from. Relative to a `tokio::time::Instant`
    /// rather than wall-clock `SystemTime` so that `tokio::time::pause`
    /// controls it in tests, the same `Instant`-keyed clock an expiration
    /// tracker would use rather than `SystemTime`.
    pub fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Sets (or replaces) this client's deadline, in seconds on the clock
    /// returned by `now_secs`.
    pub fn set_deadline(&self, id: u64, deadline_secs: u64) {
        self.wheel.lock().unwrap().insert(id, deadline_secs);
    }

    /// Clears this client's deadline, e.g. once it is fully closed.
    pub fn clear_deadline(&self, id: u64) {
        self.wheel.lock().unwrap().remove(id);
    }
}

/// Invoked exactly once when a client transitions to closed, regardless of
/// whether it was ever admitted into the registry (§9 open question: a
/// client rejected on per-IP grounds still needs its close callback to
/// fire so the global counter unwinds correctly).
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// An accepted, registered connection and its protocol driver. Owned
/// externally to the core (§1 scope) — the core only holds a shared
/// reference for the lifetime described in §3. Shaped like a
/// `Handler<S>` that owns the connection, a shutdown receiver, and a
/// completion sender, generalized into a trait object so the
/// concrete framing, TLS handshake, and request loop all live outside the
/// core.
#[async_trait]
pub trait Client: Send + Sync {
    /// Unique, monotonically increasing identifier (§3).
    fn id(&self) -> u64;

    fn remote_address(&self) -> PeerAddress;

    fn local_address(&self) -> PeerAddress;

    /// Hands the client to its protocol driver. Any work that must suspend
    /// (TLS handshake, protocol negotiation) happens here, never inside
    /// `on_acceptable`'s critical section (§5).
    async fn start(&self, driver_factory: Arc<dyn DriverFactory>);

    /// Requests the client drain within `timeout`, forcibly closing if it
    /// does not. Never fails the caller on a per-client timeout (§5
    /// Cancellation semantics).
    async fn stop(&self, timeout: Duration);

    /// Closes the client immediately, firing its close callback.
    async fn close(&self);

    /// `true` while the client is waiting on its own (possibly slow)
    /// response to complete — used by the timeout tick to defer rather
    /// than close (§4.3).
    fn is_waiting_on_response(&self) -> bool;

    /// Registers the callback that fires exactly once when this client
    /// closes, by whatever path (graceful stop, forced close, or
    /// rejection before ever starting).
    fn on_close(&self, callback: CloseCallback);
}

/// Builds a [`Client`] around a freshly accepted socket (§6).
#[async_trait]
pub trait ClientFactory: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        socket: AcceptedSocket,
        handler: Arc<dyn RequestHandler>,
        error_handler: Arc<dyn ErrorHandler>,
        logger: Arc<dyn Logger>,
        options: Options,
        timeout_wheel: TimeoutWheelHandle,
    ) -> anyhow::Result<Arc<dyn Client>>;

    /// Auto-attach capability (§4.1.1 step 2); see [`DriverFactory::as_observer`].
    fn as_observer(self: Arc<Self>) -> Option<Arc<dyn Observer>> {
        None
    }
}
