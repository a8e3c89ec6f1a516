//! # infuse-common
//!
//! Shared types, configuration, and credential handling used across all
//! Infuse-IoT host crates. This is the foundation layer: protocol constants
//! and contracts, no packet or transport logic.

pub mod config;
pub mod credentials;
pub mod time;
pub mod types;

pub use types::{
    Auth, BtAddr, BtAddrKind, InfuseId, InfuseType, Interface, InterfaceAddress,
};
