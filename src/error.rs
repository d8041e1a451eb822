//! Error types for routeip.

use std::fmt;
use std::io;

/// Result type for routeip operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Send queue byte budget exceeded, message dropped
    QueueFull,
    /// Message exceeds the maximum message size and cannot be segmented
    TooLarge,
    /// Inbound data violated a protocol rule
    Malformed(MalformedKind),
    /// No local provider and no route for the message
    Unavailable,
    /// The security predicate rejected the operation
    Denied,
    /// Socket-level failure
    TransportFailed(io::Error),
    /// A watchdog expired (connect, registration or keepalive)
    Timeout,
    /// Sending is blocked because the endpoint is stopping
    Suspended,
    /// The operation was cancelled by a stop
    Canceled,
    /// The routing host answered client assignment with the unset id
    AssignmentRefused,
    /// The routing client has shut down
    Shutdown,
}

/// What exactly was wrong with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Protocol version byte did not match the fixed constant
    ProtocolVersion,
    /// Unknown message type
    MessageType,
    /// Return code outside the valid range
    ReturnCode,
    /// TP-flagged message received on the service-discovery port
    TpOnSdPort,
    /// Declared length inconsistent with the received data
    Length,
    /// Routing-protocol command could not be decoded
    Command,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueFull => write!(f, "send queue limit reached"),
            Error::TooLarge => write!(f, "message too large and not segmentable"),
            Error::Malformed(kind) => write!(f, "malformed message: {:?}", kind),
            Error::Unavailable => write!(f, "no provider available"),
            Error::Denied => write!(f, "denied by security policy"),
            Error::TransportFailed(e) => write!(f, "transport failed: {}", e),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Suspended => write!(f, "sending is blocked"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::AssignmentRefused => write!(f, "routing host refused client assignment"),
            Error::Shutdown => write!(f, "routing client has shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::TransportFailed(e)
    }
}
