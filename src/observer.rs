//! Lifecycle observers fanned out on start/stop (§4.4).
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::handler::ErrorHandler;
use crate::logger::Logger;
use crate::orchestrator::Orchestrator;

/// A lifecycle participant notified when the orchestrator starts and stops.
///
/// Both methods may suspend and may fail; failures are aggregated rather
/// than short-circuiting the fan-out (§4.4, §9). Modeled the way the
/// retrieval pack's plugin traits (`agentgateway`/`apollo-router`) shape
/// their start/stop hooks: a small `#[async_trait]` object instead of a
/// closure pair, since observers commonly need to hold onto state between
/// the two calls.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_start(
        &self,
        orchestrator: &Orchestrator,
        logger: &dyn Logger,
        error_handler: &dyn ErrorHandler,
    ) -> anyhow::Result<()>;

    async fn on_stop(&self, orchestrator: &Orchestrator) -> anyhow::Result<()>;
}

/// Ordered, duplicate-rejecting collection of observers.
///
/// Insertion order determines fan-out order for logging and for any
/// observer that cares about relative sequencing of its own invocation
/// (the fan-out itself runs concurrently, per §4.4 — order only affects
/// which observer's failure is reported first). Kept behind a plain
/// `std::sync::Mutex` in the orchestrator: `attach` only ever mutates a
/// `Vec`, and the fan-out helpers below take an owned snapshot rather than
/// holding any lock across an `.await`.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `observer` unless an `Arc::ptr_eq` match is already present.
    ///
    /// Returns `true` if the observer was newly added. Duplicate-attach
    /// behavior is left to the implementer (§8 property 7); a
    /// silent no-op is friendlier to embedder code that re-attaches a
    /// shared singleton observer than a hard error would be.
    pub fn attach(&mut self, observer: Arc<dyn Observer>) -> bool {
        if self.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }
        self.observers.push(observer);
        true
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// A cheap, owned copy of the current observer list, safe to hold
    /// across an `.await` without keeping the set's mutex locked.
    pub fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.clone()
    }
}

/// Invokes every observer's `on_start` concurrently, joins on all of them,
/// and collects every failure without short-circuiting (§4.1.1 step 4,
/// §9's "wait all, collect errors" design note).
pub async fn fan_out_start(
    observers: &[Arc<dyn Observer>],
    orchestrator: &Orchestrator,
    logger: &dyn Logger,
    error_handler: &dyn ErrorHandler,
) -> Result<(), OrchestratorError> {
    let futures = observers
        .iter()
        .map(|observer| observer.on_start(orchestrator, logger, error_handler));
    let causes: Vec<anyhow::Error> = join_all(futures).await.into_iter().filter_map(Result::err).collect();

    if causes.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::AggregateStartupFailure { causes })
    }
}

/// Invokes every observer's `on_stop` concurrently, joins on all, and
/// collects every failure the same way `fan_out_start` does.
pub async fn fan_out_stop(
    observers: &[Arc<dyn Observer>],
    orchestrator: &Orchestrator,
) -> Result<(), OrchestratorError> {
    let futures = observers.iter().map(|observer| observer.on_stop(orchestrator));
    let causes: Vec<anyhow::Error> = join_all(futures).await.into_iter().filter_map(Result::err).collect();

    if causes.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::AggregateShutdownFailure { causes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TracingLogger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Observer for CountingObserver {
        async fn on_start(&self, _: &Orchestrator, _: &dyn Logger, _: &dyn ErrorHandler) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&self, _: &Orchestrator) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl Observer for FailingObserver {
        async fn on_start(&self, _: &Orchestrator, _: &dyn Logger, _: &dyn ErrorHandler) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }

        async fn on_stop(&self, _: &Orchestrator) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    #[test]
    fn duplicate_attach_is_rejected() {
        let mut set = ObserverSet::new();
        let started = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Observer> = Arc::new(CountingObserver { started });
        assert!(set.attach(observer.clone()));
        assert!(!set.attach(observer));
        assert_eq!(set.len(), 1);
    }

    struct NoopErrorHandler;

    #[async_trait]
    impl ErrorHandler for NoopErrorHandler {
        async fn handle_error(&self, _error: anyhow::Error) {}
    }

    #[tokio::test]
    async fn start_all_aggregates_failures_without_short_circuiting() {
        let mut set = ObserverSet::new();
        let started = Arc::new(AtomicUsize::new(0));
        set.attach(Arc::new(CountingObserver {
            started: started.clone(),
        }));
        set.attach(Arc::new(FailingObserver));
        set.attach(Arc::new(CountingObserver { started: started.clone() }));

        let orchestrator = Orchestrator::new();
        let logger = TracingLogger;
        let error_handler = NoopErrorHandler;
        let err = fan_out_start(&set.snapshot(), &orchestrator, &logger, &error_handler)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AggregateStartupFailure { .. }));
        // Both non-failing observers ran despite the third one failing.
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
