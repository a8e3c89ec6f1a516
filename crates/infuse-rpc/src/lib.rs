//! # infuse-rpc
//!
//! Remote procedure calls against Infuse-IoT devices, carried as `RPC_CMD` /
//! `RPC_RSP` / `RPC_DATA` / `RPC_DATA_ACK` packets over the local bus and
//! from there over whatever transport reaches the device.
//!
//! Three command shapes:
//! - **standard**: one request, one response;
//! - **data send**: the request announces a payload size, the device paces
//!   the upload with periodic ACKs;
//! - **data receive**: the device streams fragments which are reassembled
//!   by offset until the response closes the transfer.

pub mod client;
pub mod commands;
pub mod errno;
pub mod wire;

pub use client::{RpcClient, RpcResult};
pub use commands::{
    BtConnectInfuse, BtConnectResponse, BtDisconnect, FileAction, FileWriteBasic, RpcCommand,
    SecurityState, SecurityStateResponse,
};

use infuse_common::InfuseId;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Bus(#[from] infuse_bus::BusError),

    /// No response (or expected ACK) within the deadline.
    #[error("RPC timed out")]
    Timeout,

    /// The connection carrying the RPC dropped mid-flight.
    #[error("connection to {0} dropped mid-RPC")]
    ConnectionAborted(InfuseId),

    /// The response arrived but could not be parsed.
    #[error("malformed RPC response")]
    MalformedResponse,
}
