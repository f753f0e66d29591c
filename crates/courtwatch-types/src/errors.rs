use thiserror::Error;

pub type Result<T, E = CourtwatchError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum CourtwatchError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("site error: {0}")]
    Site(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("probe error: {0}")]
    Probe(String),
    #[error("notification error: {0}")]
    Notify(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
