//! Command catalog.
//!
//! Each command pairs a packed request layout with its command id, auth
//! level and response parser. Only the commands the gateway core itself
//! needs live here; application tooling defines its own on top of
//! [`RpcCommand`].

use infuse_bus::DataTypes;
use infuse_common::{Auth, BtAddr};

/// A remotely callable device procedure.
pub trait RpcCommand {
    const COMMAND_ID: u16;
    type Response;

    /// Authentication level the command runs at.
    fn auth(&self) -> Auth {
        Auth::Device
    }

    /// Packed request structure following the RPC header.
    fn request_bytes(&self) -> Vec<u8>;

    fn parse_response(payload: &[u8]) -> Option<Self::Response>;
}

// ============================================================
// security_state (30000)
// ============================================================

/// Query a device's security state: public keys, network membership and a
/// challenge-response proof of identity.
pub struct SecurityState {
    pub challenge: [u8; 16],
}

impl SecurityState {
    pub fn new() -> Self {
        Self {
            challenge: rand::random(),
        }
    }
}

impl Default for SecurityState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityStateResponse {
    pub cloud_public_key: [u8; 32],
    pub device_public_key: [u8; 32],
    pub network_id: u32,
    pub challenge_response_type: u8,
    /// Encrypted challenge-response blob (nonce, challenge, identity,
    /// device id, tag). Validated by tooling that holds the cloud key.
    pub challenge_response: Vec<u8>,
}

impl SecurityStateResponse {
    /// Fixed-size portion preceding the challenge-response blob.
    pub const HEADER_LEN: usize = 69;
}

impl RpcCommand for SecurityState {
    const COMMAND_ID: u16 = 30_000;
    type Response = SecurityStateResponse;

    /// The identity exchange itself runs under the network key; it is how
    /// a device key is bootstrapped in the first place.
    fn auth(&self) -> Auth {
        Auth::Network
    }

    fn request_bytes(&self) -> Vec<u8> {
        self.challenge.to_vec()
    }

    fn parse_response(payload: &[u8]) -> Option<Self::Response> {
        if payload.len() < Self::Response::HEADER_LEN {
            return None;
        }
        Some(SecurityStateResponse {
            cloud_public_key: payload[0..32].try_into().ok()?,
            device_public_key: payload[32..64].try_into().ok()?,
            network_id: u32::from_le_bytes(payload[64..68].try_into().ok()?),
            challenge_response_type: payload[68],
            challenge_response: payload[69..].to_vec(),
        })
    }
}

// ============================================================
// bt_connect_infuse (50)
// ============================================================

/// Ask the gateway device to connect to an Infuse-IoT Bluetooth peer.
pub struct BtConnectInfuse {
    pub peer: BtAddr,
    pub conn_timeout_ms: u16,
    pub subscribe: DataTypes,
    pub inactivity_timeout_ms: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtConnectResponse {
    pub cloud_public_key: [u8; 32],
    pub device_public_key: [u8; 32],
    pub network_id: u32,
}

impl RpcCommand for BtConnectInfuse {
    const COMMAND_ID: u16 = 50;
    type Response = BtConnectResponse;

    fn request_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BtAddr::WIRE_LEN + 5);
        out.extend_from_slice(&self.peer.to_wire());
        out.extend_from_slice(&self.conn_timeout_ms.to_le_bytes());
        out.push(self.subscribe.bits());
        out.extend_from_slice(&self.inactivity_timeout_ms.to_le_bytes());
        out
    }

    fn parse_response(payload: &[u8]) -> Option<Self::Response> {
        if payload.len() < 68 {
            return None;
        }
        Some(BtConnectResponse {
            cloud_public_key: payload[0..32].try_into().ok()?,
            device_public_key: payload[32..64].try_into().ok()?,
            network_id: u32::from_le_bytes(payload[64..68].try_into().ok()?),
        })
    }
}

// ============================================================
// bt_disconnect (51)
// ============================================================

/// Ask the gateway device to disconnect from a Bluetooth peer.
pub struct BtDisconnect {
    pub peer: BtAddr,
}

impl RpcCommand for BtDisconnect {
    const COMMAND_ID: u16 = 51;
    type Response = ();

    fn request_bytes(&self) -> Vec<u8> {
        self.peer.to_wire().to_vec()
    }

    fn parse_response(_payload: &[u8]) -> Option<Self::Response> {
        Some(())
    }
}

// ============================================================
// file_write_basic (20)
// ============================================================

/// Actions a written file can trigger on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileAction {
    Discard = 0,
    AppImage = 1,
    /// Binary patch against the running application image.
    AppCpatch = 2,
}

/// Stream a file to the device (data-send mode), e.g. a firmware patch.
pub struct FileWriteBasic {
    pub action: FileAction,
    /// CRC-32 of the complete payload, checked by the device on completion.
    pub crc: u32,
}

impl RpcCommand for FileWriteBasic {
    const COMMAND_ID: u16 = 20;
    type Response = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(self.action as u8);
        out.extend_from_slice(&self.crc.to_le_bytes());
        out
    }

    fn parse_response(_payload: &[u8]) -> Option<Self::Response> {
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infuse_common::BtAddrKind;

    #[test]
    fn security_state_response_parses() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xAA; 32]);
        payload.extend_from_slice(&[0xBB; 32]);
        payload.extend_from_slice(&0x123456u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&[0xCC; 68]);

        let rsp = SecurityState::parse_response(&payload).unwrap();
        assert_eq!(rsp.cloud_public_key, [0xAA; 32]);
        assert_eq!(rsp.device_public_key, [0xBB; 32]);
        assert_eq!(rsp.network_id, 0x123456);
        assert_eq!(rsp.challenge_response.len(), 68);

        assert!(SecurityState::parse_response(&payload[..60]).is_none());
    }

    #[test]
    fn bt_connect_request_layout() {
        let cmd = BtConnectInfuse {
            peer: BtAddr::new(BtAddrKind::Random, 0x112233445566),
            conn_timeout_ms: 5000,
            subscribe: DataTypes::COMMAND | DataTypes::DATA,
            inactivity_timeout_ms: 0,
        };
        let bytes = cmd.request_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 1); // random address kind
        assert_eq!(&bytes[1..7], &[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(u16::from_le_bytes([bytes[7], bytes[8]]), 5000);
        assert_eq!(bytes[9], 3);
    }

    #[test]
    fn challenge_is_randomized() {
        assert_ne!(SecurityState::new().challenge, SecurityState::new().challenge);
    }
}
