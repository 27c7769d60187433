//! Bound listening endpoints (§3).
use tokio::net::{TcpListener, UnixListener};

/// Which scheme a bound endpoint serves. Drives whether ALPN is attempted
/// during startup (§4.1.1 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// The already-bound socket backing an endpoint. The orchestrator never
/// binds a socket itself (§6) — it only accepts on and eventually releases
/// sockets supplied at construction. A Unix-domain variant is carried
/// alongside TCP per the source's acceptance of arbitrary listener kinds,
/// generalizing a single `TcpListener` field into an enum over transports.
pub enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenSocket {
    pub fn local_addr_display(&self) -> String {
        match self {
            ListenSocket::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<tcp>".to_string()),
            ListenSocket::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unix>".to_string()),
        }
    }
}

/// A listening endpoint supplied at construction time, bound but not yet
/// accepting. Created before `Starting`; its socket is released (dropped)
/// on the transition into `Stopping` so the port is freed promptly (§3).
pub struct BoundEndpoint {
    pub display_address: String,
    pub socket: ListenSocket,
    pub scheme: Scheme,
    /// ALPN protocol list, populated during startup (§4.1.1 step 7) for
    /// TLS endpoints on platforms that support ALPN; empty otherwise.
    pub alpn_protocols: Vec<String>,
}

impl BoundEndpoint {
    pub fn new(display_address: impl Into<String>, socket: ListenSocket, scheme: Scheme) -> Self {
        Self {
            display_address: display_address.into(),
            socket,
            scheme,
            alpn_protocols: Vec::new(),
        }
    }
}
