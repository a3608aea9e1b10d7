#![allow(unused)]

use std::fmt;

use crate::msg::ResponseError;

/// A protocol error happened during communication through LSP or DAP.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError(String, bool);

impl ProtocolError {
    /// Creates a protocol error with a message.
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        ProtocolError(msg.into(), false)
    }

    /// Creates a protocol error caused by disconnection.
    pub(crate) fn disconnected() -> ProtocolError {
        ProtocolError("disconnected channel".into(), true)
    }

    /// Whether this error occurred due to a disconnected channel.
    pub fn channel_is_disconnected(&self) -> bool {
        self.1
    }
}

impl std::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The outcome of an outgoing request observed through its response future.
///
/// Cancellation and disconnection are distinguishable from an error response
/// produced by the peer.
#[derive(Debug)]
pub enum RequestError {
    /// The peer answered with an error response.
    Response(ResponseError),
    /// The request was cancelled on this side before a response arrived.
    Cancelled,
    /// The connection closed before a response arrived.
    Closed,
}

impl RequestError {
    /// Whether the request was cancelled locally.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}

impl std::error::Error for RequestError {}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Response(err) => {
                write!(f, "error response {}: {}", err.code, err.message)
            }
            RequestError::Cancelled => write!(f, "request cancelled"),
            RequestError::Closed => write!(f, "connection closed"),
        }
    }
}

/// A handler registration was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Another handler is already registered for the method.
    Duplicate(String),
}

impl std::error::Error for RegisterError {}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Duplicate(method) => {
                write!(f, "a handler for '{method}' is already registered")
            }
        }
    }
}

/// Failure of decoding happened during communication through LSP or DAP.
#[derive(Debug)]
pub enum ExtractError<T> {
    /// The extracted message was of a different method than expected.
    MethodMismatch(T),
    /// Failed to deserialize the message.
    JsonError {
        /// The method being decoded.
        method: String,
        /// The underlying error.
        error: serde_json::Error,
    },
}

impl<T: fmt::Debug> std::error::Error for ExtractError<T> {}

impl<T> fmt::Display for ExtractError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MethodMismatch(_) => write!(f, "method mismatch"),
            ExtractError::JsonError { method, error } => {
                write!(f, "invalid payload for {method}: {error}")
            }
        }
    }
}
