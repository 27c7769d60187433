//! A minimal embedding of `orchestra_core`: a line-echo "HTTP" server used
//! to exercise admission, idle timeouts, and graceful shutdown end to end.
//!
//! Styled after `src/bin/cli.rs` (`clap::Parser`,
//! `tracing_subscriber::fmt::init`, `#[tokio::main]`) and `src/bin/server.rs`
//! (`TcpListener::bind` then hand off each accepted socket to a per-connection
//! task) — generalized so the accept loop and lifecycle live in the library's
//! `Orchestrator` instead of a hand-rolled loop in `main`.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use orchestra_core::{
    AcceptedSocket, BoundEndpoint, Client, ClientFactory, CloseCallback, DriverFactory,
    ErrorHandler, ListenSocket, Logger, Options, Orchestrator, PeerAddress, Request,
    RequestHandler, Response, Scheme, TimeoutWheelHandle, TracingLogger,
};

#[derive(Debug, Parser)]
#[command(name = "basic-server", version, author)]
/// A line-echo demo server built on top of orchestra-core.
struct Cli {
    /// Address to bind and listen on.
    #[arg(long, default_value = "127.0.0.1:7878")]
    bind: std::net::SocketAddr,
    /// Maximum number of simultaneously registered clients. 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    connection_limit: u32,
    /// Maximum number of simultaneously registered clients sharing a network
    /// key. 0 means unlimited; loopback remotes are always exempt.
    #[arg(long, default_value_t = 0)]
    connections_per_ip_limit: u32,
    /// Seconds of inactivity before an idle connection is closed.
    #[arg(long, default_value_t = 30)]
    idle_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let listener = TcpListener::bind(cli.bind)
        .await
        .context("failed to bind tcp listener")?;
    let display = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| cli.bind.to_string());

    let orchestrator = Orchestrator::new();
    orchestrator.configure(
        vec![BoundEndpoint::new(
            display.clone(),
            ListenSocket::Tcp(listener),
            Scheme::Http,
        )],
        Arc::new(EchoHandler),
        Arc::new(TracingLogger),
        Options {
            connection_limit: cli.connection_limit,
            connections_per_ip_limit: cli.connections_per_ip_limit,
            ..Options::default()
        },
    )?;
    orchestrator.set_driver_factory(Arc::new(EchoDriverFactory))?;
    orchestrator.set_client_factory(Arc::new(EchoClientFactory::new(cli.idle_timeout_secs)))?;
    orchestrator.set_error_handler(Arc::new(LoggingErrorHandler))?;

    let shutdown_timeout = Options::default().shutdown_timeout;
    orchestrator.start().await.context("failed to start orchestrator")?;
    tracing::info!(address = %display, "listening");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    orchestrator
        .stop(shutdown_timeout)
        .await
        .context("graceful shutdown failed")?;

    Ok(())
}

/// Answers every request with a fixed greeting; real embedders plug in
/// actual routing here. Out of scope for the core itself (§1 Non-goals).
struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Request) -> anyhow::Result<Response> {
        let body = format!("hello, {}\n", request.path);
        Ok(Response {
            status: 200,
            headers: Default::default(),
            body: body.into_bytes().into(),
        })
    }
}

struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle_error(&self, error: anyhow::Error) {
        tracing::warn!(%error, "client error");
    }
}

/// No ALPN protocols on offer; this demo never terminates TLS.
struct EchoDriverFactory;

impl DriverFactory for EchoDriverFactory {
    fn application_layer_protocols(&self) -> Vec<String> {
        Vec::new()
    }
}

struct EchoClientFactory {
    next_id: AtomicU64,
    idle_timeout_secs: u64,
}

impl EchoClientFactory {
    fn new(idle_timeout_secs: u64) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            idle_timeout_secs,
        }
    }
}

#[async_trait]
impl ClientFactory for EchoClientFactory {
    async fn create(
        &self,
        socket: AcceptedSocket,
        handler: Arc<dyn RequestHandler>,
        error_handler: Arc<dyn ErrorHandler>,
        logger: Arc<dyn Logger>,
        _options: Options,
        timeout_wheel: TimeoutWheelHandle,
    ) -> anyhow::Result<Arc<dyn Client>> {
        let peer = socket.peer_address().unwrap_or(PeerAddress::Unix);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(EchoClient {
            id,
            peer,
            socket: Mutex::new(Some(socket)),
            handler,
            error_handler,
            logger,
            timeout_wheel,
            idle_timeout_secs: self.idle_timeout_secs,
            waiting: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            close_callback: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }))
    }
}

/// A toy per-connection handle: reads newline-delimited "paths" and writes
/// back whatever [`RequestHandler::handle`] returns. Real embedders replace
/// this with an actual HTTP/1.x or HTTP/2 framing engine (§1 scope).
struct EchoClient {
    id: u64,
    peer: PeerAddress,
    socket: Mutex<Option<AcceptedSocket>>,
    handler: Arc<dyn RequestHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    logger: Arc<dyn Logger>,
    timeout_wheel: TimeoutWheelHandle,
    idle_timeout_secs: u64,
    waiting: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_callback: Arc<Mutex<Option<CloseCallback>>>,
    cancel: CancellationToken,
}

impl EchoClient {
    fn fire_close_once(closed: &AtomicBool, close_callback: &Mutex<Option<CloseCallback>>) {
        if !closed.swap(true, Ordering::SeqCst) {
            if let Some(callback) = close_callback.lock().unwrap().take() {
                callback();
            }
        }
    }
}

#[async_trait]
impl Client for EchoClient {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_address(&self) -> PeerAddress {
        self.peer
    }

    fn local_address(&self) -> PeerAddress {
        self.peer
    }

    async fn start(&self, _driver_factory: Arc<dyn DriverFactory>) {
        let Some(socket) = self.socket.lock().unwrap().take() else {
            return;
        };
        let AcceptedSocket::Tcp(stream) = socket else {
            return;
        };

        let id = self.id;
        let handler = self.handler.clone();
        let error_handler = self.error_handler.clone();
        let logger = self.logger.clone();
        let wheel = self.timeout_wheel.clone();
        let idle = self.idle_timeout_secs;
        let waiting = self.waiting.clone();
        let closed = self.closed.clone();
        let close_callback = self.close_callback.clone();
        let cancel = self.cancel.clone();

        wheel.set_deadline(id, wheel.now_secs() + idle);

        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => None,
                    line = lines.next_line() => line.unwrap_or(None),
                };
                let Some(line) = line else {
                    break;
                };

                wheel.set_deadline(id, wheel.now_secs() + idle);
                waiting.store(true, Ordering::SeqCst);
                let request = Request {
                    method: "GET".to_string(),
                    path: line,
                    headers: Default::default(),
                    body: Default::default(),
                };
                let outcome = handler.handle(request).await;
                waiting.store(false, Ordering::SeqCst);

                match outcome {
                    Ok(response) => {
                        if write_half.write_all(&response.body).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error_handler.handle_error(err).await;
                        break;
                    }
                }
            }

            wheel.clear_deadline(id);
            logger.debug(&format!("client {id} disconnected"));
            EchoClient::fire_close_once(&closed, &close_callback);
        });
    }

    async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(timeout, async {
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        self.close().await;
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.socket.lock().unwrap().take();
        self.timeout_wheel.clear_deadline(self.id);
        Self::fire_close_once(&self.closed, &self.close_callback);
    }

    fn is_waiting_on_response(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    fn on_close(&self, callback: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(callback);
    }
}
