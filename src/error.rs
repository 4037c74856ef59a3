//! Broker error types and the Pusher close codes they map to.

use thiserror::Error;

/// Errors raised while admitting, serving, or dispatching for a connection.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Could not find app key `{0}`.")]
    UnknownAppKey(String),

    #[error("Origin not allowed")]
    OriginNotAllowed,

    #[error("Over capacity")]
    OverCapacity,

    #[error("Invalid auth signature")]
    InvalidSignature,

    #[error("Presence channel_data is required")]
    PresenceDataMissing,

    #[error("Event could not be associated")]
    EventNotFound,

    #[error("Event could not be handled")]
    MethodNotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    HandlerFailed(String),

    #[error("{0} timeout")]
    HandlerTimeout(String),

    #[error("Subscription not established")]
    NotSubscribed,

    #[error("Payload exceeds maximum size")]
    PayloadTooLarge,

    #[error("Malformed message: {0}")]
    MalformedFrame(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// The Pusher protocol error code carried in `pusher:error` / close frames.
    pub fn close_code(&self) -> u16 {
        match self {
            BrokerError::UnknownAppKey(_) => 4001,
            BrokerError::OriginNotAllowed => 4009,
            BrokerError::OverCapacity => 4100,
            BrokerError::InvalidSignature => 4009,
            _ => 4000,
        }
    }

    /// Whether admission must terminate the connection after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownAppKey(_)
                | BrokerError::OriginNotAllowed
                | BrokerError::OverCapacity
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
