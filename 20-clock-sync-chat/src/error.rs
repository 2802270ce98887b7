//! Error taxonomy shared by the server and client halves.
//!
//! Per-connection failures (`PeerDisconnected`, `MalformedUnit`,
//! `WriteFailure`) are isolated to the connection that produced them. Startup
//! failures (`Bind`, `ConnectionRefused`, `EmptyAlias`) are surfaced to the
//! caller immediately.

use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("could not connect to server at {addr}")]
    ConnectionRefused {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("malformed unit: {0}")]
    MalformedUnit(#[from] WireError),

    #[error("write to peer failed")]
    WriteFailure {
        #[source]
        source: io::Error,
    },

    #[error("alias cannot be empty")]
    EmptyAlias,
}

impl ChatError {
    /// Wraps a failed write. Timeouts arrive here as `io::ErrorKind::TimedOut`.
    pub fn write_failure(source: io::Error) -> Self {
        ChatError::WriteFailure { source }
    }

    /// True for the variants that mean the peer is gone and the connection
    /// should be released.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ChatError::PeerDisconnected | ChatError::WriteFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failures_count_as_disconnects() {
        let err = ChatError::write_failure(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_disconnect());
        assert!(ChatError::PeerDisconnected.is_disconnect());
        assert!(!ChatError::EmptyAlias.is_disconnect());
    }

    #[test]
    fn malformed_units_convert_from_wire_errors() {
        let err: ChatError = WireError::UnknownTag(0x7f).into();
        assert!(matches!(err, ChatError::MalformedUnit(WireError::UnknownTag(0x7f))));
        assert!(!err.is_disconnect());
    }
}
