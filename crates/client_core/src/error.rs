use thiserror::Error;

/// Failures of the live connection. Cloneable so one in-flight connect can
/// hand the same result to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("failed to open websocket: {0}")]
    Connect(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("connect superseded by disconnect")]
    Disconnected,
}
