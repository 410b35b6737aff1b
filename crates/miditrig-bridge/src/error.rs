//! Bridge error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("{0} not connected")]
    NotConnected(&'static str),

    #[error("send error: {0}")]
    Send(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid http method: {0}")]
    InvalidMethod(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error(transparent)]
    Core(#[from] miditrig_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge error: {0}")]
    Other(String),
}
