//! Core protocol identifiers shared by every layer of the SDK.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Infuse-IoT data types carried in the ePacket header `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InfuseType {
    EchoReq = 0,
    EchoRsp = 1,
    Tdf = 2,
    RpcCmd = 3,
    RpcData = 4,
    RpcDataAck = 5,
    RpcRsp = 6,
    ReceivedEpacket = 7,
    Ack = 8,
    EpacketForward = 9,
    SerialLog = 10,
    MemfaultChunk = 30,
    KeyIds = 127,
}

impl InfuseType {
    /// Decode the header byte, `None` for values this SDK does not know.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::EchoReq,
            1 => Self::EchoRsp,
            2 => Self::Tdf,
            3 => Self::RpcCmd,
            4 => Self::RpcData,
            5 => Self::RpcDataAck,
            6 => Self::RpcRsp,
            7 => Self::ReceivedEpacket,
            8 => Self::Ack,
            9 => Self::EpacketForward,
            10 => Self::SerialLog,
            30 => Self::MemfaultChunk,
            127 => Self::KeyIds,
            _ => return None,
        })
    }
}

impl fmt::Display for InfuseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EchoReq => "ECHO_REQ",
            Self::EchoRsp => "ECHO_RSP",
            Self::Tdf => "TDF",
            Self::RpcCmd => "RPC_CMD",
            Self::RpcData => "RPC_DATA",
            Self::RpcDataAck => "RPC_DATA_ACK",
            Self::RpcRsp => "RPC_RSP",
            Self::ReceivedEpacket => "RECEIVED_EPACKET",
            Self::Ack => "ACK",
            Self::EpacketForward => "EPACKET_FORWARD",
            Self::SerialLog => "SERIAL_LOG",
            Self::MemfaultChunk => "MEMFAULT_CHUNK",
            Self::KeyIds => "KEY_IDS",
        };
        f.write_str(name)
    }
}

/// Stable 64-bit identifier of an Infuse-IoT device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfuseId(pub u64);

impl InfuseId {
    /// Sentinel addressing the locally attached gateway device.
    pub const GATEWAY: InfuseId = InfuseId(u64::MAX);

    pub fn is_gateway(self) -> bool {
        self == Self::GATEWAY
    }
}

impl fmt::Display for InfuseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Physical interfaces a packet can arrive on or depart over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Interface {
    Serial = 0,
    Udp = 1,
    BtAdv = 2,
    BtPeripheral = 3,
    BtCentral = 4,
}

impl Interface {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Serial,
            1 => Self::Udp,
            2 => Self::BtAdv,
            3 => Self::BtPeripheral,
            4 => Self::BtCentral,
            _ => return None,
        })
    }

    /// HKDF `info` label for per-interface key derivation.
    ///
    /// Both GATT roles share key material, so they share a label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Udp => "udp",
            Self::BtAdv => "bt_adv",
            Self::BtPeripheral | Self::BtCentral => "bt_gatt",
        }
    }

    pub fn is_bluetooth(self) -> bool {
        matches!(self, Self::BtAdv | Self::BtPeripheral | Self::BtCentral)
    }
}

/// Authentication level of an ePacket hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Auth {
    Device = 0,
    Network = 1,
}

impl Auth {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Device),
            1 => Some(Self::Network),
            _ => None,
        }
    }
}

/// Bluetooth LE address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BtAddrKind {
    Public = 0,
    Random = 1,
}

impl BtAddrKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Public),
            1 => Some(Self::Random),
            _ => None,
        }
    }
}

/// A Bluetooth LE address: type plus 48-bit value.
///
/// The value is held as an integer (little-endian byte significance on the
/// wire); `Display` renders the conventional big-endian colon form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtAddr {
    pub kind: BtAddrKind,
    pub value: u64,
}

impl BtAddr {
    pub const WIRE_LEN: usize = 7;

    pub fn new(kind: BtAddrKind, value: u64) -> Self {
        Self {
            kind,
            value: value & 0x0000_FFFF_FFFF_FFFF,
        }
    }

    /// Parse the 7-byte wire form (kind, then 6 value bytes little-endian).
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let kind = BtAddrKind::from_u8(bytes[0])?;
        let mut value = [0u8; 8];
        value[..6].copy_from_slice(&bytes[1..7]);
        Some(Self {
            kind,
            value: u64::from_le_bytes(value),
        })
    }

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = self.kind as u8;
        out[1..7].copy_from_slice(&self.value.to_le_bytes()[..6]);
        out
    }
}

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let be = self.value.to_be_bytes();
        let kind = match self.kind {
            BtAddrKind::Public => "public",
            BtAddrKind::Random => "random",
        };
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x} ({kind})",
            be[2], be[3], be[4], be[5], be[6], be[7]
        )
    }
}

impl FromStr for BtAddr {
    type Err = String;

    /// Parse `aa:bb:cc:dd:ee:ff` (big-endian display order).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut value: u64 = 0;
        let mut octets = 0;
        for part in s.split(':') {
            let byte =
                u8::from_str_radix(part, 16).map_err(|_| format!("bad address octet {part:?}"))?;
            value = (value << 8) | u64::from(byte);
            octets += 1;
        }
        if octets != 6 {
            return Err(format!("expected 6 octets, got {octets}"));
        }
        Ok(Self::new(BtAddrKind::Public, value))
    }
}

/// Address of the interface a packet hop was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAddress {
    /// Serial links carry no address.
    Serial,
    BluetoothLe(BtAddr),
}

/// Bus JSON form: `{"i": "SERIAL"}` or `{"i": "BT", "t": kind, "v": value}`.
#[derive(Serialize, Deserialize)]
struct InterfaceAddressWire {
    i: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<u64>,
}

impl Serialize for InterfaceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Serial => InterfaceAddressWire {
                i: "SERIAL".into(),
                t: None,
                v: None,
            },
            Self::BluetoothLe(addr) => InterfaceAddressWire {
                i: "BT".into(),
                t: Some(addr.kind as u8),
                v: Some(addr.value),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InterfaceAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let wire = InterfaceAddressWire::deserialize(deserializer)?;
        match wire.i.as_str() {
            "SERIAL" => Ok(Self::Serial),
            "BT" => {
                let kind = wire
                    .t
                    .and_then(BtAddrKind::from_u8)
                    .ok_or_else(|| D::Error::custom("missing or invalid address type"))?;
                let value = wire
                    .v
                    .ok_or_else(|| D::Error::custom("missing address value"))?;
                Ok(Self::BluetoothLe(BtAddr::new(kind, value)))
            }
            other => Err(D::Error::custom(format!("unknown address family {other:?}"))),
        }
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => Ok(()),
            Self::BluetoothLe(addr) => addr.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_labels_share_gatt() {
        assert_eq!(Interface::BtPeripheral.label(), "bt_gatt");
        assert_eq!(Interface::BtCentral.label(), "bt_gatt");
        assert_eq!(Interface::Serial.label(), "serial");
    }

    #[test]
    fn bt_addr_wire_round_trip() {
        let addr = BtAddr::new(BtAddrKind::Random, 0xC0FFEE123456);
        let decoded = BtAddr::from_wire(&addr.to_wire()).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn bt_addr_display_is_big_endian() {
        let addr = BtAddr::new(BtAddrKind::Public, 0xC0FFEE123456);
        assert_eq!(addr.to_string(), "c0:ff:ee:12:34:56 (public)");
    }

    #[test]
    fn bt_addr_parses_colon_form() {
        let addr: BtAddr = "c0:ff:ee:12:34:56".parse().unwrap();
        assert_eq!(addr.value, 0xC0FFEE123456);
        assert!("c0:ff:ee".parse::<BtAddr>().is_err());
    }

    #[test]
    fn interface_address_json_forms() {
        let serial = serde_json::to_value(InterfaceAddress::Serial).unwrap();
        assert_eq!(serial, serde_json::json!({"i": "SERIAL"}));

        let bt = InterfaceAddress::BluetoothLe(BtAddr::new(BtAddrKind::Random, 0x1122_3344_5566));
        let json = serde_json::to_value(bt).unwrap();
        assert_eq!(json, serde_json::json!({"i": "BT", "t": 1, "v": 0x112233445566u64}));
        let back: InterfaceAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, bt);
    }

    #[test]
    fn gateway_sentinel_is_all_ones() {
        assert_eq!(InfuseId::GATEWAY.0, u64::MAX);
        assert!(InfuseId::GATEWAY.is_gateway());
    }
}
