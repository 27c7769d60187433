use thiserror::Error;

/// Errors the orchestrator surfaces to its caller.
///
/// Per-client and accept-time failures never reach this type — they are
/// logged through the configured [`Logger`](crate::logger::Logger) and
/// observed only indirectly, through `client_count` dropping back to zero.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A configuration mutator was called outside `Stopped`, or `start`/`stop`
    /// was called in a state that does not allow it.
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),

    /// `configure` was called with an empty bind list.
    #[error("at least one bound endpoint is required")]
    EmptyBindList,

    /// One or more observers failed `on_start`. The orchestrator has already
    /// attempted a best-effort shutdown; state is `Stopped`.
    #[error("{} observer(s) failed on start: {}", causes.len(), describe(causes))]
    AggregateStartupFailure { causes: Vec<anyhow::Error> },

    /// One or more observers failed `on_stop`. State is `Stopped` regardless.
    #[error("{} observer(s) failed on stop: {}", causes.len(), describe(causes))]
    AggregateShutdownFailure { causes: Vec<anyhow::Error> },
}

fn describe(causes: &[anyhow::Error]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
