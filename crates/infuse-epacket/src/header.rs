//! Version-0 ePacket header.
//!
//! 23 bytes, little-endian, packed. The first 11 bytes double as the AEAD
//! associated data, the remaining 12 as the nonce; `gps_time`, `sequence`
//! and `entropy` give the nonce its uniqueness.

use bitflags::bitflags;
use infuse_common::{Auth, InfuseId, InfuseType};

use crate::crypto::{AAD_LEN, NONCE_LEN};

bitflags! {
    /// ePacket header flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        /// Set: encrypted with the device key. Clear: network key.
        const ENCR_DEVICE = 0x8000;
    }
}

impl Flags {
    pub fn auth(self) -> Auth {
        if self.contains(Flags::ENCR_DEVICE) {
            Auth::Device
        } else {
            Auth::Network
        }
    }

    pub fn for_auth(auth: Auth) -> Self {
        match auth {
            Auth::Device => Flags::ENCR_DEVICE,
            Auth::Network => Flags::empty(),
        }
    }
}

/// Decoded version-0 header.
///
/// On the wire the 64-bit device id is split into `(upper u32, lower u32)`
/// halves, upper half first, a historical field order shared with device
/// firmware. The full 64-bit value is always emitted; no half is masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub ptype: InfuseType,
    pub flags: Flags,
    /// 24-bit key metadata: network id for NETWORK auth, device key id for
    /// DEVICE auth.
    pub key_metadata: u32,
    pub device_id: InfuseId,
    pub gps_time: u32,
    pub sequence: u16,
    pub entropy: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("frame of {0} bytes is too short for a v0 header")]
    Truncated(usize),

    #[error("unsupported header version {0}")]
    UnknownVersion(u8),

    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

impl PacketHeader {
    pub const WIRE_LEN: usize = AAD_LEN + NONCE_LEN;

    pub fn new(
        ptype: InfuseType,
        auth: Auth,
        key_metadata: u32,
        device_id: InfuseId,
        gps_time: u32,
        sequence: u16,
        entropy: u16,
    ) -> Self {
        Self {
            version: 0,
            ptype,
            flags: Flags::for_auth(auth),
            key_metadata: key_metadata & 0x00FF_FFFF,
            device_id,
            gps_time,
            sequence,
            entropy,
        }
    }

    pub fn auth(&self) -> Auth {
        self.flags.auth()
    }

    /// Parse the leading 23 bytes of a frame.
    pub fn parse(frame: &[u8]) -> Result<Self, HeaderError> {
        if frame.len() < Self::WIRE_LEN {
            return Err(HeaderError::Truncated(frame.len()));
        }
        let version = frame[0];
        if version != 0 {
            return Err(HeaderError::UnknownVersion(version));
        }
        let ptype = InfuseType::from_u8(frame[1]).ok_or(HeaderError::UnknownType(frame[1]))?;
        let flags = Flags::from_bits_retain(u16::from_le_bytes([frame[2], frame[3]]));
        let key_metadata = u32::from_le_bytes([frame[4], frame[5], frame[6], 0]);
        let upper = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]);
        let lower = u32::from_le_bytes([frame[11], frame[12], frame[13], frame[14]]);
        let device_id = InfuseId((u64::from(upper) << 32) | u64::from(lower));
        let gps_time = u32::from_le_bytes([frame[15], frame[16], frame[17], frame[18]]);
        let sequence = u16::from_le_bytes([frame[19], frame[20]]);
        let entropy = u16::from_le_bytes([frame[21], frame[22]]);

        Ok(Self {
            version,
            ptype,
            flags,
            key_metadata,
            device_id,
            gps_time,
            sequence,
            entropy,
        })
    }

    /// Serialize to the packed 23-byte wire form.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = self.version;
        out[1] = self.ptype as u8;
        out[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[4..7].copy_from_slice(&self.key_metadata.to_le_bytes()[..3]);
        let upper = (self.device_id.0 >> 32) as u32;
        let lower = self.device_id.0 as u32;
        out[7..11].copy_from_slice(&upper.to_le_bytes());
        out[11..15].copy_from_slice(&lower.to_le_bytes());
        out[15..19].copy_from_slice(&self.gps_time.to_le_bytes());
        out[19..21].copy_from_slice(&self.sequence.to_le_bytes());
        out[21..23].copy_from_slice(&self.entropy.to_le_bytes());
        out
    }

    /// AEAD associated-data view of the wire form.
    pub fn aad(wire: &[u8; Self::WIRE_LEN]) -> &[u8; AAD_LEN] {
        wire[..AAD_LEN].try_into().expect("fixed split")
    }

    /// AEAD nonce view of the wire form.
    pub fn nonce(wire: &[u8; Self::WIRE_LEN]) -> &[u8; NONCE_LEN] {
        wire[AAD_LEN..].try_into().expect("fixed split")
    }
}
