//! Exchange-specific error types
//!
//! Local validation errors (`Unauthorized`, `EmptyBatch`, `BatchSizeExceeded`)
//! are returned synchronously before any frame is written. Server-side
//! rejections arrive through an operation's outcome. Transport faults and
//! version mismatches are logged by the connection controller and end the
//! connection attempt.

use crate::bitfinex::frames::NotificationBody;
use thiserror::Error;

/// Result type for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Exchange operation errors
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported protocol version {version:?} (allowed: {allowed:?})")]
    ProtocolVersion { version: Option<u32>, allowed: Vec<u32> },

    #[error("Authentication failed (code {code:?}): {message}")]
    AuthenticationFailed { code: Option<i64>, message: String },

    #[error("Subscription to {channel} rejected (code {code:?}): {message}")]
    SubscriptionRejected {
        channel: String,
        code: Option<i64>,
        message: String,
    },

    #[error("Unsubscribe from channel {chan_id} rejected (code {code:?}): {message}")]
    UnsubscribeRejected {
        chan_id: u64,
        code: Option<i64>,
        message: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Order batch is empty")]
    EmptyBatch,

    #[error("Order batch of {size} exceeds the limit of {max}")]
    BatchSizeExceeded { size: usize, max: usize },

    #[error("Order rejected: {} ({})", .0.status, .0.text)]
    OrderRejected(Box<NotificationBody>),

    #[error("Order batch rejected: {} of {} orders failed", failed_count(.0), .0.len())]
    BatchRejected(Vec<NotificationBody>),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

fn failed_count(responses: &[NotificationBody]) -> usize {
    responses.iter().filter(|body| !body.is_success()).count()
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for ExchangeError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

/// Error codes carried by server `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    UnknownEvent,
    UnknownPair,
    SubscriptionFailed,
    AlreadySubscribed,
    UnknownChannel,
    ChannelLimit,
    UnsubscribeFailed,
    NotSubscribed,
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            10000 => ErrorCode::UnknownEvent,
            10001 => ErrorCode::UnknownPair,
            10300 => ErrorCode::SubscriptionFailed,
            10301 => ErrorCode::AlreadySubscribed,
            10302 => ErrorCode::UnknownChannel,
            10305 => ErrorCode::ChannelLimit,
            10400 => ErrorCode::UnsubscribeFailed,
            10401 => ErrorCode::NotSubscribed,
            _ => ErrorCode::Unknown,
        }
    }
}
