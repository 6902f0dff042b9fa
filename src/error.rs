//! Error types for the DHCP client.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::{Ipv4Addr, SocketAddrV4};

/// Errors that can occur during DHCP client operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file or output).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// invalid option lengths, or replies missing fields the client needs.
    /// The packet is dropped and the receive loop keeps running.
    #[error("Malformed DHCP packet: {0}")]
    MalformedPacket(String),

    /// The transport reported that zero bytes were sent.
    ///
    /// Never retried implicitly; retry policy belongs to the caller.
    #[error("Failed to send DHCP packet to {destination}")]
    SendFailure { destination: SocketAddrV4 },

    /// The server refused our REQUEST with a NAK.
    ///
    /// The lease has already been cleared when this is returned.
    #[error("DHCP server {server} refused the request (NAK)")]
    Nack { server: Ipv4Addr },

    /// Renewal attempted without a valid lease.
    ///
    /// This is a sequencing fault, typically a renew timer racing a release.
    #[error("Cannot renew: no valid lease is held")]
    RenewOnInvalidLease,

    /// Reply carried a transaction ID other than the current one.
    #[error("Stale transaction: expected xid {expected:#010x}, received {received:#010x}")]
    StaleTransaction { expected: u32, received: u32 },

    /// Invalid client configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 68 without administrator privileges,
    /// or when the specified network interface doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Applying or resetting the interface configuration failed.
    #[error("Interface configuration error: {0}")]
    Interface(String),

    /// A control command could not be parsed.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// A specialized Result type for DHCP client operations.
pub type Result<T> = std::result::Result<T, Error>;
