use std::io;
use std::time::Duration;
use hickory_proto::error::ProtoError;
use shared::types::ParseServiceTypeError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors surfaced to callers of the session and engine APIs.
///
/// Cloneable so one outcome can be handed to every coalesced resolve caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Could not join the multicast group
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("session is already listening")]
    AlreadyListening,

    #[error("session is not listening")]
    NotListening,

    #[error("service instance not found: {0}")]
    InstanceNotFound(String),

    #[error("no response resolving '{instance}' within {waited:?}")]
    ResolutionTimeout { instance: String, waited: Duration },

    /// The session stopped while the operation was in flight
    #[error("operation cancelled by session shutdown")]
    Cancelled,

    #[error("invalid service type: {0}")]
    InvalidServiceType(#[from] ParseServiceTypeError),

    #[error("failed to send query: {0}")]
    SendFailed(String),
}

/// Failures of the transport capability
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot join multicast group: {0}")]
    Unavailable(#[source] io::Error),

    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The group membership or socket is gone
    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for DiscoveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(e) => DiscoveryError::NetworkUnavailable(e.to_string()),
            other => DiscoveryError::SendFailed(other.to_string()),
        }
    }
}

/// Why a datagram could not be decoded. `Malformed` covers every framing
/// failure; `NotResponse` marks a query (usually our own, looped back).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("message is a query, not a response")]
    NotResponse,
}

impl DecodeError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, DecodeError::Malformed(_))
    }
}

impl From<ProtoError> for DecodeError {
    fn from(err: ProtoError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// A query that could not be serialized, e.g. a name over 255 bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot encode query: {0}")]
pub struct EncodeError(String);

impl From<ProtoError> for EncodeError {
    fn from(err: ProtoError) -> Self {
        EncodeError(err.to_string())
    }
}
