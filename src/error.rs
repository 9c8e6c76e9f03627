use thiserror::Error;

/// Failure taxonomy for the realtime session.
///
/// `CredentialsMissing` is the only non-retryable case: no amount of key
/// rotation can fix an empty pool, so the lifecycle parks in the error
/// state instead of returning to idle.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("no usable API key configured")]
    CredentialsMissing,
    #[error("connect failed: {0}")]
    ConnectFailure(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("connection closed by server")]
    TransportClosed,
}

impl SessionError {
    /// Whether the failure should be shown to the user. A graceful remote
    /// close tears the session down like any other exit but is not an error
    /// from the user's point of view.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, SessionError::TransportClosed)
    }
}
