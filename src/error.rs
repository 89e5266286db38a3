use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame source error: {0}")]
    Source(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Video error: {0}")]
    Video(String),

    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, GatewayError>;
