//! Error taxonomy for transport and session failures.
//!
//! Nothing here is fatal to the process. Each error drops one unit of work
//! (a datagram, a message, a transfer) and the session keeps serving the
//! remaining connections.

use std::io;

use navi_transfer::TransferError;
use navi_wire::DecodeError;

use crate::connection::Role;
use crate::transport::{ChannelId, ConnectionId};

/// Socket or channel-level failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket: {0}")]
    Io(#[from] io::Error),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is not established yet")]
    NotConnected(ConnectionId),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("payload of {len} bytes exceeds channel limit of {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("channel {channel} of connection {connection} has too many unacknowledged packets")]
    Backpressure {
        connection: ConnectionId,
        channel: ChannelId,
    },

    #[error("connection capacity of {0} reached")]
    CapacityReached(usize),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

impl TransportError {
    /// Whether retrying the same operation on a later tick can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backpressure { .. } | Self::NotConnected(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Failure while handling one unit of session work.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Message arrived in a state that does not accept it.
    #[error("protocol violation on connection {connection}: {reason}")]
    ProtocolViolation {
        connection: ConnectionId,
        reason: String,
    },

    #[error("no connection holds role {0}")]
    NoConnectionForRole(Role),

    #[error("no host connected")]
    NoHost,
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            TransportError::Backpressure {
                connection: 1,
                channel: 0
            }
            .is_transient()
        );
        assert!(TransportError::Io(io::ErrorKind::WouldBlock.into()).is_transient());
        assert!(!TransportError::Io(io::ErrorKind::AddrInUse.into()).is_transient());
        assert!(!TransportError::UnknownConnection(3).is_transient());
        assert!(!TransportError::PayloadTooLarge { len: 10, limit: 5 }.is_transient());
    }

    #[test]
    fn test_session_error_wraps_transient() {
        let err = SessionError::from(TransportError::NotConnected(2));
        assert!(err.is_transient());
        let err = SessionError::NoConnectionForRole(3);
        assert!(!err.is_transient());
    }
}
