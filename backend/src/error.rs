//! Registry error conditions.
//!
//! None of these are fatal: the engine absorbs every variant into a log line
//! and emits nothing back to the transport.

use thiserror::Error;

use crate::protocol::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown connection {0}")]
    NotFound(ConnectionId),

    #[error("connection {0} is already registered")]
    AlreadyPresent(ConnectionId),

    #[error("connection {0} already has a peer")]
    AlreadyPaired(ConnectionId),

    #[error("connection {0} cannot pair with itself")]
    SelfPairing(ConnectionId),
}
