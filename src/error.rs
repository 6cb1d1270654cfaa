//! Error types for the server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Only configuration and socket
//! failures are fatal; everything on the request path is logged and the
//! offending datagram or console line is dropped.

use std::net::Ipv4Addr;

use crate::lease::ClientId;

/// Errors that can occur while running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP/BOOTP datagram.
    ///
    /// The header is shorter than the BOOTP minimum, a relay or hardware
    /// field is out of range, or an option's declared length overruns the
    /// buffer. The datagram is dropped and the listener carries on.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Every address in the pool is offered, bound, excluded or cooling down
    /// after a decline. No reply is sent.
    #[error("No available IP addresses in pool")]
    Exhausted,

    /// A REQUEST or DECLINE did not match the lease held for the client.
    ///
    /// A REQUEST is answered with a NAK. A DECLINE is ignored.
    #[error("{client} does not match its reservation: {reason}")]
    Mismatch { client: ClientId, reason: String },

    /// Address lies outside the configured pool range.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// Invalid server configuration. Fatal at start-up only.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed admin console command. The session stays open.
    #[error("{0}")]
    AdminProtocol(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;
