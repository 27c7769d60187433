//! Non-blocking HTTP/1.x and HTTP/2 server core.
//!
//! This crate is the orchestrator and connection lifecycle manager
//! described in the design docs: it accepts TCP/Unix connections on one or
//! more bound [`endpoint::BoundEndpoint`]s, admits or denies them under
//! [`options::Options`] limits, drives each connection through an
//! externally supplied [`client::Client`] and [`driver::DriverFactory`],
//! dispatches parsed requests to a [`handler::RequestHandler`], and
//! coordinates startup/shutdown across pluggable [`observer::Observer`]s.
//!
//! The HTTP/1 and HTTP/2 framing parsers, TLS, compression, and the
//! request/response object model live outside this crate; they are the
//! abstract collaborators named in the trait definitions here.

pub mod client;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod logger;
pub mod network;
pub mod observer;
pub mod options;
pub mod orchestrator;
pub mod timeout_wheel;

pub use client::{AcceptedSocket, Client, ClientFactory, CloseCallback, TimeoutWheelHandle};
pub use driver::DriverFactory;
pub use endpoint::{BoundEndpoint, ListenSocket, Scheme};
pub use error::{OrchestratorError, Result};
pub use handler::{ErrorHandler, Request, RequestHandler, Response};
pub use logger::{LogLevel, Logger, TracingLogger};
pub use network::{is_loopback, network_key, NetworkKey, PeerAddress};
pub use observer::{Observer, ObserverSet};
pub use options::Options;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use timeout_wheel::TimeoutWheel;
