use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("data channel closed")]
    ChannelClosed,
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("relay connection closed")]
    RelayClosed,
    #[error("relay connection error: {0}")]
    Relay(String),
    #[error("controller lock rejected ({status}): {reason}")]
    LockRejected { status: u16, reason: String },
    #[error("no longer the active controller (handed off to {0})")]
    Deposed(String),
    #[error("invalid liveness config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, PeerError>;
