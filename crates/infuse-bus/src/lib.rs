//! # infuse-bus
//!
//! Local coordination surface between a gateway process and its clients:
//! a UDP multicast group carries JSON notifications from the gateway out to
//! any number of subscribers, and a loopback unicast socket (multicast port
//! plus one) carries client requests back in.
//!
//! Delivery is best-effort (datagrams, no ACKs). The bus coordinates local
//! processes; it is not a transport.

pub mod client;
pub mod messages;
pub mod server;

pub use client::{Connection, LocalClient};
pub use messages::{DataTypes, Notification, Request};
pub use server::LocalServer;

use infuse_common::InfuseId;

/// Default multicast group and port for the notification fan-out.
pub const DEFAULT_GROUP: &str = "224.1.1.1";
pub const DEFAULT_PORT: u16 = 8751;

/// Largest datagram either endpoint will accept; oversized messages are
/// dropped.
pub const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The gateway reported that the requested connection could not be
    /// established.
    #[error("connection to {0} refused")]
    ConnectionRefused(InfuseId),

    /// The gateway reported the connection dropped while it was in use.
    #[error("connection to {0} aborted")]
    ConnectionAborted(InfuseId),

    /// No CREATED/FAILED verdict arrived within the deadline.
    #[error("timed out waiting for connection to {0}")]
    ConnectionTimeout(InfuseId),
}
