//! Outgoing Bluetooth connection lifecycle.
//!
//! One state machine per downstream device:
//!
//! ```text
//! Idle → Resolving   REQUEST without a known BT address
//! Idle → Connecting  REQUEST with the address in hand
//! Resolving → Connecting   address observed (advertisement)
//! Connecting → Connected   bt_connect return_code ≥ 0
//! Connecting → Idle        bt_connect return_code < 0 (FAILED broadcast)
//! Connected → Releasing    RELEASE request or an RX-reported drop
//! Releasing → Idle         disconnect completed
//! ```

use std::collections::HashMap;

use infuse_bus::DataTypes;
use infuse_common::InfuseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// Waiting to learn the device's Bluetooth address.
    Resolving,
    /// `bt_connect_infuse` in flight.
    Connecting,
    Connected,
    /// `bt_disconnect` in flight.
    Releasing,
}

/// Tracks the connection state machine for every requested device.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    states: HashMap<InfuseId, (ConnectionState, DataTypes)>,
}

impl ConnectionManager {
    pub fn state(&self, id: InfuseId) -> ConnectionState {
        self.states
            .get(&id)
            .map(|(state, _)| *state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn data_types(&self, id: InfuseId) -> DataTypes {
        self.states
            .get(&id)
            .map(|(_, types)| *types)
            .unwrap_or(DataTypes::COMMAND)
    }

    /// A client requested a connection. Returns the state to act on:
    /// `Connecting` means "emit the connect RPC now", `Resolving` means
    /// "wait for an advertisement". Requests for busy devices are no-ops.
    pub fn request(
        &mut self,
        id: InfuseId,
        data_types: DataTypes,
        address_known: bool,
    ) -> ConnectionState {
        let next = match self.state(id) {
            ConnectionState::Idle | ConnectionState::Resolving => {
                if address_known {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Resolving
                }
            }
            busy => busy,
        };
        self.states.insert(id, (next, data_types));
        next
    }

    /// The device's address became known while resolving. Returns true if a
    /// connect RPC should be emitted.
    pub fn address_resolved(&mut self, id: InfuseId) -> bool {
        if self.state(id) == ConnectionState::Resolving {
            let types = self.data_types(id);
            self.states.insert(id, (ConnectionState::Connecting, types));
            true
        } else {
            false
        }
    }

    /// The connect RPC completed. Returns the resulting state.
    pub fn connect_result(&mut self, id: InfuseId, return_code: i16) -> ConnectionState {
        let next = if return_code >= 0 {
            ConnectionState::Connected
        } else {
            ConnectionState::Idle
        };
        let types = self.data_types(id);
        self.states.insert(id, (next, types));
        next
    }

    /// A client released the connection (idempotent). Returns true if a
    /// disconnect RPC should be emitted.
    pub fn release(&mut self, id: InfuseId) -> bool {
        match self.state(id) {
            ConnectionState::Connected => {
                let types = self.data_types(id);
                self.states.insert(id, (ConnectionState::Releasing, types));
                true
            }
            ConnectionState::Resolving | ConnectionState::Connecting => {
                // Nothing established yet; abandon the attempt.
                self.states.remove(&id);
                false
            }
            _ => false,
        }
    }

    /// The RX path reported the link dropped out from under us.
    pub fn remote_drop(&mut self, id: InfuseId) -> bool {
        if self.state(id) == ConnectionState::Connected {
            let types = self.data_types(id);
            self.states.insert(id, (ConnectionState::Releasing, types));
            true
        } else {
            false
        }
    }

    /// The disconnect RPC completed.
    pub fn released(&mut self, id: InfuseId) {
        self.states.remove(&id);
    }

    /// Devices currently waiting on an address.
    pub fn resolving(&self) -> Vec<InfuseId> {
        self.states
            .iter()
            .filter(|(_, (state, _))| *state == ConnectionState::Resolving)
            .map(|(id, _)| *id)
            .collect()
    }
}
