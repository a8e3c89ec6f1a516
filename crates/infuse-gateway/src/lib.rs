//! # infuse-gateway
//!
//! The long-running gateway service: owns a framed transport to the local
//! gateway device (serial or Segger RTT), reconstructs and decodes inbound
//! traffic, multiplexes it onto the local bus, and services outbound
//! requests, synthesizing its own RPCs (security handshakes, Bluetooth
//! connections) to obtain key material and downstream links on demand.

pub mod connection;
pub mod service;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use service::{Gateway, GatewayConfig, GatewayHandle};
pub use transport::{MockTransport, RttPort, Transport};

#[cfg(unix)]
pub use transport::SerialPort;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bus(#[from] infuse_bus::BusError),

    #[error(transparent)]
    Encode(#[from] infuse_epacket::packet::EncodeError),

    #[error("local gateway identity not yet known")]
    GatewayUnknown,

    #[error("no Bluetooth address known for {0}")]
    NoBluetoothAddress(infuse_common::InfuseId),
}
