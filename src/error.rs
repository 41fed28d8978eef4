use crate::providers::Provider;

/// Crate-level error type.
///
/// The variants map onto the failure taxonomy of the study page: a missing
/// credential is fatal at startup, remote-call failures abort a single turn,
/// and event-log write failures are swallowed at the call site after a
/// warning (telemetry is best-effort, never a correctness dependency of the
/// chat itself).
#[derive(Debug, thiserror::Error)]
pub enum StudyError {
    #[error("{provider} API key not set. Export it or pass via environment.")]
    MissingCredential { provider: Provider },

    #[error("{provider} API error: {detail}")]
    Api { provider: Provider, detail: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event log write failed: {0}")]
    EventLog(#[from] std::io::Error),

    #[error("session store unavailable: {0}")]
    Store(String),

    #[error("unknown session '{0}'")]
    SessionNotFound(String),

    #[error("a turn is already in progress for session '{0}'")]
    TurnInProgress(String),
}
