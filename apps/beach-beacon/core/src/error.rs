use thiserror::Error;

/// Why a frame could not be written into a push sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("sink closed")]
    Closed,
    #[error("sink buffer full")]
    Saturated,
}

impl WriteFailure {
    pub fn metric_label(&self) -> &'static str {
        match self {
            WriteFailure::Closed => "closed",
            WriteFailure::Saturated => "saturated",
        }
    }
}

/// Errors raised while encoding a frame payload.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by [`crate::BroadcastHub`] operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("client {client_id} did not accept the connected frame: {reason}")]
    Handshake {
        client_id: String,
        reason: WriteFailure,
    },
}
