/**
 * error.rs
 *
 * Error types for the matchmaking search and the datagram transport
 */

use std::net::SocketAddr;
use thiserror::Error;

/// Terminal failures of a matchmaking search. Exactly one of these (or a
/// success) is delivered per `start()` call.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Must be logged in to queue. Go back to menu")]
    NotLoggedIn,

    #[error("Failed to create mm client")]
    ClientBindFailed,

    #[error("Failed to connect to mm server")]
    DirectoryUnreachable,

    #[error("Invalid response from mm server: {0}")]
    DirectoryProtocolError(String),

    /// Server-supplied rejection text, surfaced verbatim.
    #[error("{0}")]
    DirectoryRejected(String),

    #[error("Lost connection to the mm server")]
    LostDirectoryConnection,

    #[error("Search Canceled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by a transport host. Per-packet send/receive failures are
/// swallowed by the protocol layer (timeouts drive correctness); these are the
/// connection-level ones.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no route to peer {0}")]
    Unroutable(SocketAddr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
