//! The server orchestrator and connection lifecycle manager (§4.1).
//!
//! This is the core of the crate: the state machine that ties together
//! listeners, admission, the timeout wheel, and observer lifecycle, and
//! upholds the invariants in §8 under arbitrary interleavings of accepts,
//! timeouts, client closes, and shutdown. Shaped after a
//! `server::run`/`Listener::run`/`Listener::accept` control flow (a
//! semaphore-gated accept loop plus a `broadcast::Sender<()>` +
//! `shutdown_complete` `mpsc` rendezvous), generalized to multiple
//! listeners, pluggable observers, capacity + per-network admission, and a
//! real timeout wheel. Per-listener cancellation uses
//! `tokio_util::sync::CancellationToken`, the idiom a `poem`-style
//! server uses for graceful shutdown, extended here to one token per
//! listener plus one for the timeout tick rather than a single broadcast.
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{AcceptedSocket, Client, ClientFactory, TimeoutWheelHandle};
use crate::driver::DriverFactory;
use crate::endpoint::{BoundEndpoint, ListenSocket, Scheme};
use crate::error::{OrchestratorError, Result};
use crate::handler::{ErrorHandler, RequestHandler};
use crate::logger::Logger;
use crate::network::{AdmissionController, NetworkKey};
use crate::observer::{Observer, ObserverSet};
use crate::options::Options;
use crate::timeout_wheel::TimeoutWheel;

/// The orchestrator's lifecycle state (§3). Monotonic within a single
/// start→stop cycle; a new cycle may only re-enter `Starting` from
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Inputs captured by `configure()`. Consumed (moved out) by `start()` —
/// the bound sockets inside `bind` are single-use, so a second start→stop
/// cycle requires calling `configure()` again with fresh listeners, the
/// same way a caller of a `server::run`-style entry point supplies a fresh
/// `TcpListener` each time it's invoked.
struct Config {
    bind: Vec<BoundEndpoint>,
    handler: Arc<dyn RequestHandler>,
    logger: Arc<dyn Logger>,
    options: Options,
}

/// Everything `on_acceptable` and the timeout tick need while `Started`.
/// Bundled behind one `Arc` so a single lock swap installs or tears down
/// the whole set atomically relative to `on_acceptable` reading it.
struct RuntimeConfig {
    handler: Arc<dyn RequestHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    logger: Arc<dyn Logger>,
    options: Options,
    driver_factory: Arc<dyn DriverFactory>,
    client_factory: Arc<dyn ClientFactory>,
    admission: AdmissionController,
}

struct RegisteredClient {
    client: Arc<dyn Client>,
    network_key: NetworkKey,
}

/// Bookkeeping for §3's invariants.
#[derive(Default)]
struct Registry {
    clients: HashMap<u64, RegisteredClient>,
    clients_per_net: HashMap<NetworkKey, u32>,
    client_count: u32,
    /// Ids for which `client_count` has been incremented but that may not
    /// (yet, or ever) appear in `clients` — specifically a client rejected
    /// on per-network grounds after the global counter was already bumped
    /// (§9 open question). Tracked separately so the close callback can
    /// always undo exactly the increments that were actually made.
    counted_ids: HashSet<u64>,
}

struct EndpointRuntime {
    display: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TickHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Admission {
    Admitted,
    RejectedGlobal,
    RejectedPerNet,
}

struct Inner {
    state: Mutex<OrchestratorState>,
    config: Mutex<Option<Config>>,
    observers: Mutex<ObserverSet>,
    driver_factory: Mutex<Option<Arc<dyn DriverFactory>>>,
    client_factory: Mutex<Option<Arc<dyn ClientFactory>>>,
    error_handler: Mutex<Option<Arc<dyn ErrorHandler>>>,
    registry: Mutex<Registry>,
    wheel: Arc<Mutex<TimeoutWheel>>,
    endpoints: Mutex<Vec<EndpointRuntime>>,
    tick: Mutex<Option<TickHandle>>,
    runtime: Mutex<Option<Arc<RuntimeConfig>>>,
    epoch: tokio::time::Instant,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: Mutex::new(OrchestratorState::Stopped),
            config: Mutex::new(None),
            observers: Mutex::new(ObserverSet::new()),
            driver_factory: Mutex::new(None),
            client_factory: Mutex::new(None),
            error_handler: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            wheel: Arc::new(Mutex::new(TimeoutWheel::new())),
            endpoints: Mutex::new(Vec::new()),
            tick: Mutex::new(None),
            runtime: Mutex::new(None),
            epoch: tokio::time::Instant::now(),
        }
    }

    fn handle_client_closed(&self, id: u64, network_key: NetworkKey) {
        let mut registry = self.registry.lock().unwrap();
        let was_fully_admitted = registry.clients.remove(&id).is_some();
        let was_counted = registry.counted_ids.remove(&id);
        if was_counted {
            registry.client_count = registry.client_count.saturating_sub(1);
        }
        if was_fully_admitted {
            if let Some(count) = registry.clients_per_net.get_mut(&network_key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    registry.clients_per_net.remove(&network_key);
                }
            }
        }
        drop(registry);
        self.wheel.lock().unwrap().remove(id);
    }

    /// §4.1.3: accepts have already happened by the time this runs; this
    /// is everything from client construction through hand-off to the
    /// driver.
    async fn on_acceptable(self: Arc<Self>, accepted: AcceptedSocket) {
        let runtime = self.runtime.lock().unwrap().clone();
        let Some(runtime) = runtime else {
            return;
        };

        let peer = match accepted.peer_address() {
            Ok(peer) => peer,
            Err(err) => {
                runtime.logger.debug(&format!("failed to read peer address: {err}"));
                return;
            }
        };

        let wheel_handle = TimeoutWheelHandle::new(self.wheel.clone(), self.epoch);

        let client = match runtime
            .client_factory
            .create(
                accepted,
                runtime.handler.clone(),
                runtime.error_handler.clone(),
                runtime.logger.clone(),
                runtime.options.clone(),
                wheel_handle,
            )
            .await
        {
            Ok(client) => client,
            Err(err) => {
                runtime.logger.debug(&format!("client factory declined connection: {err}"));
                return;
            }
        };

        let id = client.id();
        let network_key = crate::network::network_key(&peer);

        // Registered before the admission checks so that a client rejected
        // on per-network grounds still drives the same decrement path as
        // a normally-closed one (§9 open question).
        let callback_inner = self.clone();
        client.on_close(Box::new(move || {
            callback_inner.handle_client_closed(id, network_key);
        }));

        // Critical section: no `.await` between reading the pre-increment
        // counters and committing the registry/counter update (§5).
        let outcome = {
            let mut registry = self.registry.lock().unwrap();
            if runtime.admission.check_global(registry.client_count).is_err() {
                Admission::RejectedGlobal
            } else {
                registry.client_count += 1;
                registry.counted_ids.insert(id);
                let per_net_before = *registry.clients_per_net.get(&network_key).unwrap_or(&0);
                if runtime.admission.check_per_net(&peer, per_net_before).is_err() {
                    Admission::RejectedPerNet
                } else {
                    *registry.clients_per_net.entry(network_key).or_insert(0) += 1;
                    registry.clients.insert(
                        id,
                        RegisteredClient {
                            client: client.clone(),
                            network_key,
                        },
                    );
                    Admission::Admitted
                }
            }
        };

        match outcome {
            Admission::RejectedGlobal => {
                runtime.logger.debug(&format!(
                    "client {id} rejected: global connection limit reached"
                ));
                client.close().await;
            }
            Admission::RejectedPerNet => {
                runtime.logger.debug(&format!(
                    "client {id} rejected: per-network connection limit reached"
                ));
                client.close().await;
            }
            Admission::Admitted => {
                let driver_factory = runtime.driver_factory.clone();
                tokio::spawn(async move {
                    client.start(driver_factory).await;
                });
            }
        }
    }

    /// §4.3: one timeout-wheel sweep.
    async fn run_timeout_tick(&self) {
        let now = self.epoch.elapsed().as_secs();
        let expired = self.wheel.lock().unwrap().extract(now);
        for id in expired {
            let client = {
                let registry = self.registry.lock().unwrap();
                registry.clients.get(&id).map(|entry| entry.client.clone())
            };
            let Some(client) = client else {
                debug_assert!(
                    false,
                    "timeout wheel yielded id {id} absent from the client registry"
                );
                continue;
            };
            if client.is_waiting_on_response() {
                self.wheel.lock().unwrap().insert(id, now + 1);
                continue;
            }
            client.close().await;
        }
    }
}

async fn accept_once(socket: &ListenSocket) -> std::io::Result<AcceptedSocket> {
    match socket {
        ListenSocket::Tcp(listener) => listener
            .accept()
            .await
            .map(|(stream, _)| AcceptedSocket::Tcp(stream)),
        ListenSocket::Unix(listener) => listener
            .accept()
            .await
            .map(|(stream, _)| AcceptedSocket::Unix(stream)),
    }
}

async fn accept_loop(inner: Arc<Inner>, socket: ListenSocket, display: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = accept_once(&socket) => {
                match accepted {
                    Ok(accepted_socket) => {
                        let inner = inner.clone();
                        tokio::spawn(Inner::on_acceptable(inner, accepted_socket));
                    }
                    Err(err) => {
                        tracing::debug!(endpoint = %display, %err, "accept error, listener remains registered");
                    }
                }
            }
        }
    }
}

struct NoAlpnDriverFactory;

impl DriverFactory for NoAlpnDriverFactory {
    fn application_layer_protocols(&self) -> Vec<String> {
        Vec::new()
    }
}

struct UnconfiguredClientFactory;

#[async_trait]
impl ClientFactory for UnconfiguredClientFactory {
    async fn create(
        &self,
        _socket: AcceptedSocket,
        _handler: Arc<dyn RequestHandler>,
        _error_handler: Arc<dyn ErrorHandler>,
        _logger: Arc<dyn Logger>,
        _options: Options,
        _timeout_wheel: TimeoutWheelHandle,
    ) -> anyhow::Result<Arc<dyn Client>> {
        Err(anyhow::anyhow!(
            "no client factory configured; call set_client_factory before start()"
        ))
    }
}

struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle_error(&self, error: anyhow::Error) {
        tracing::error!(%error, "unhandled client error");
    }
}

/// The server orchestrator (§4.1). Cheap to clone — every clone shares the
/// same underlying state, the way a `Db` handle is a cheap
/// `Arc` wrapper shared across connection handlers.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    fn ensure_stopped(&self, what: &'static str) -> Result<()> {
        if *self.inner.state.lock().unwrap() != OrchestratorState::Stopped {
            return Err(OrchestratorError::PreconditionFailed(what));
        }
        Ok(())
    }

    /// §4.1 `configure`. Fails if `bind` is empty or the orchestrator is
    /// not `Stopped`.
    pub fn configure(
        &self,
        bind: Vec<BoundEndpoint>,
        handler: Arc<dyn RequestHandler>,
        logger: Arc<dyn Logger>,
        options: Options,
    ) -> Result<()> {
        if bind.is_empty() {
            return Err(OrchestratorError::EmptyBindList);
        }
        self.ensure_stopped("configure")?;
        *self.inner.config.lock().unwrap() = Some(Config {
            bind,
            handler,
            logger,
            options,
        });
        Ok(())
    }

    pub fn set_driver_factory(&self, factory: Arc<dyn DriverFactory>) -> Result<()> {
        self.ensure_stopped("set_driver_factory")?;
        *self.inner.driver_factory.lock().unwrap() = Some(factory);
        Ok(())
    }

    pub fn set_client_factory(&self, factory: Arc<dyn ClientFactory>) -> Result<()> {
        self.ensure_stopped("set_client_factory")?;
        *self.inner.client_factory.lock().unwrap() = Some(factory);
        Ok(())
    }

    pub fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>) -> Result<()> {
        self.ensure_stopped("set_error_handler")?;
        *self.inner.error_handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    /// Appends `observer` to the ordered set unless an `Arc::ptr_eq` match
    /// is already present, in which case it returns `Ok(false)` rather
    /// than erroring (§8 property 7 — documented implementation choice).
    pub fn attach_observer(&self, observer: Arc<dyn Observer>) -> Result<bool> {
        self.ensure_stopped("attach_observer")?;
        Ok(self.inner.observers.lock().unwrap().attach(observer))
    }

    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.lock().unwrap()
    }

    /// Number of clients currently registered. Exposed for embedders and
    /// tests asserting §8's invariants.
    pub fn client_count(&self) -> u32 {
        self.inner.registry.lock().unwrap().client_count
    }

    /// §4.1.1 startup.
    pub async fn start(&self) -> Result<()> {
        self.ensure_stopped("start")?;

        let config = self.inner.config.lock().unwrap().take();
        let Some(config) = config else {
            return Err(OrchestratorError::PreconditionFailed(
                "start: configure() must be called first",
            ));
        };

        let driver_factory = self
            .inner
            .driver_factory
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(NoAlpnDriverFactory) as Arc<dyn DriverFactory>);
        let client_factory = self
            .inner
            .client_factory
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(UnconfiguredClientFactory) as Arc<dyn ClientFactory>);
        let error_handler = self
            .inner
            .error_handler
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(LoggingErrorHandler) as Arc<dyn ErrorHandler>);

        // Step 2: auto-attach the four well-known collaborators as
        // observers if they implement that capability, preserving the
        // order user-attached observers were inserted in.
        {
            let mut observers = self.inner.observers.lock().unwrap();
            if let Some(obs) = driver_factory.clone().as_observer() {
                observers.attach(obs);
            }
            if let Some(obs) = client_factory.clone().as_observer() {
                observers.attach(obs);
            }
            if let Some(obs) = config.handler.clone().as_observer() {
                observers.attach(obs);
            }
            if let Some(obs) = error_handler.clone().as_observer() {
                observers.attach(obs);
            }
        }

        *self.inner.state.lock().unwrap() = OrchestratorState::Starting;

        let observer_snapshot = self.inner.observers.lock().unwrap().snapshot();
        let start_result = crate::observer::fan_out_start(
            &observer_snapshot,
            self,
            config.logger.as_ref(),
            error_handler.as_ref(),
        )
        .await;

        if let Err(err) = start_result {
            self.shutdown_after_failed_start().await;
            return Err(err);
        }

        *self.inner.state.lock().unwrap() = OrchestratorState::Started;

        let alpn_protocols = driver_factory.application_layer_protocols();
        let mut bind = config.bind;
        for endpoint in bind.iter_mut() {
            match endpoint.scheme {
                Scheme::Https => endpoint.alpn_protocols = alpn_protocols.clone(),
                Scheme::Http => {
                    if !alpn_protocols.is_empty() {
                        config.logger.warning(&format!(
                            "ALPN protocols requested but endpoint {} is plain HTTP; \
                             continuing without ALPN",
                            endpoint.display_address
                        ));
                    }
                }
            }
        }

        *self.inner.runtime.lock().unwrap() = Some(Arc::new(RuntimeConfig {
            handler: config.handler,
            error_handler,
            logger: config.logger.clone(),
            options: config.options.clone(),
            admission: AdmissionController::new(
                config.options.connection_limit,
                config.options.connections_per_ip_limit,
            ),
            driver_factory,
            client_factory,
        }));

        let mut endpoint_runtimes = Vec::with_capacity(bind.len());
        for endpoint in bind {
            let display = endpoint.display_address.clone();
            let cancel = CancellationToken::new();
            let inner = self.inner.clone();
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(accept_loop(inner, endpoint.socket, display.clone(), task_cancel));
            endpoint_runtimes.push(EndpointRuntime { display, cancel, handle });
        }
        *self.inner.endpoints.lock().unwrap() = endpoint_runtimes;

        self.enable_tick(config.options.timeout_tick);

        Ok(())
    }

    /// Best-effort shutdown after a failed `on_start` fan-out (§4.1.1 step
    /// 5). No listeners or clients exist yet at this point — only the
    /// observer `on_stop` fan-out is meaningful.
    async fn shutdown_after_failed_start(&self) {
        *self.inner.state.lock().unwrap() = OrchestratorState::Stopping;
        let observer_snapshot = self.inner.observers.lock().unwrap().snapshot();
        // The startup failure is already the error surfaced to the
        // caller; a stop failure here would only obscure it.
        let _ = crate::observer::fan_out_stop(&observer_snapshot, self).await;
        *self.inner.runtime.lock().unwrap() = None;
        *self.inner.state.lock().unwrap() = OrchestratorState::Stopped;
    }

    fn enable_tick(&self, interval: Duration) {
        let inner = self.inner.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.run_timeout_tick().await;
                    }
                }
            }
        });
        *self.inner.tick.lock().unwrap() = Some(TickHandle { cancel, handle });
    }

    async fn disable_tick(&self) {
        let tick = self.inner.tick.lock().unwrap().take();
        if let Some(tick) = tick {
            tick.cancel.cancel();
            let _ = tick.handle.await;
        }
    }

    /// §4.1.2 shutdown. Idempotent from `Stopped`; fails from `Starting`
    /// or `Stopping`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::Started => *state = OrchestratorState::Stopping,
                OrchestratorState::Starting | OrchestratorState::Stopping => {
                    return Err(OrchestratorError::PreconditionFailed("stop"));
                }
            }
        }

        // 1. Cancel listener registrations, release the bound sockets.
        let endpoints = std::mem::take(&mut *self.inner.endpoints.lock().unwrap());
        for endpoint in &endpoints {
            endpoint.cancel.cancel();
        }
        for endpoint in endpoints {
            let _ = endpoint.handle.await;
        }

        // 2. Concurrently stop every live client, waiting for all to
        // settle regardless of individual outcome.
        let clients: Vec<Arc<dyn Client>> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.clients.values().map(|entry| entry.client.clone()).collect()
        };
        join_all(clients.iter().map(|client| client.stop(timeout))).await;

        // 3. Concurrently notify every observer, collecting failures.
        let observer_snapshot = self.inner.observers.lock().unwrap().snapshot();
        let stop_result = crate::observer::fan_out_stop(&observer_snapshot, self).await;

        // 4. Disable the tick, then transition to Stopped regardless of
        // observer outcome.
        self.disable_tick().await;
        *self.inner.runtime.lock().unwrap() = None;
        *self.inner.state.lock().unwrap() = OrchestratorState::Stopped;

        stop_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl RequestHandler for NoopHandler {
        async fn handle(&self, _request: crate::handler::Request) -> anyhow::Result<crate::handler::Response> {
            Ok(crate::handler::Response::default())
        }
    }

    #[test]
    fn new_orchestrator_starts_stopped() {
        let orchestrator = Orchestrator::new();
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert_eq!(orchestrator.client_count(), 0);
    }

    #[test]
    fn configure_rejects_empty_bind_list() {
        let orchestrator = Orchestrator::new();
        let handler: Arc<dyn RequestHandler> = Arc::new(NoopHandler);
        let logger: Arc<dyn Logger> = Arc::new(crate::logger::TracingLogger);
        let err = orchestrator
            .configure(Vec::new(), handler, logger, Options::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyBindList));
    }

    #[tokio::test]
    async fn stop_from_stopped_is_a_noop() {
        let orchestrator = Orchestrator::new();
        orchestrator.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    }

    #[test]
    fn mutators_fail_outside_stopped() {
        let orchestrator = Orchestrator::new();
        *orchestrator.inner.state.lock().unwrap() = OrchestratorState::Started;
        let err = orchestrator
            .set_error_handler(Arc::new(LoggingErrorHandler))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PreconditionFailed(_)));
    }
}
