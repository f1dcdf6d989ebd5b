//! The crate-wide [`Error`] type.

use crate::address::IndividualAddress;
use crate::transport::DisconnectedBy;

/// Errors raised by the transport layer, the management client, and the
/// management procedures.
///
/// The variants form a closed taxonomy: callers can match on the kind to
/// decide between retrying ([`Error::Timeout`], [`Error::Disconnect`]),
/// fixing their arguments ([`Error::IllegalArgument`]), or giving up on the
/// stack instance ([`Error::LinkClosed`], [`Error::IllegalState`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The network link is closed and cannot carry frames.
    #[error("network link is closed")]
    LinkClosed,

    /// No matching response arrived within the configured window.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// A connection-oriented exchange was terminated.
    #[error("connection to {address} closed by {initiator:?} endpoint")]
    Disconnect {
        address: IndividualAddress,
        initiator: DisconnectedBy,
    },

    /// A response violated the protocol: wrong length, element count, or
    /// echoed fields that do not match the request.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The remote device returned a negative status.
    #[error("remote error: {0}")]
    Remote(String),

    /// A caller-supplied parameter is out of range. No I/O was performed.
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),

    /// The operation was invoked after detach or on a destroyed
    /// destination.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A blocking wait was torn down by detach or destroy.
    #[error("operation interrupted")]
    Interrupted,
}

impl Error {
    pub(crate) fn disconnect(address: IndividualAddress, initiator: DisconnectedBy) -> Self {
        Error::Disconnect { address, initiator }
    }

    pub(crate) fn invalid<T: Into<String>>(what: T) -> Self {
        Error::InvalidResponse(what.into())
    }

    pub(crate) fn remote<T: Into<String>>(what: T) -> Self {
        Error::Remote(what.into())
    }
}
