//! Packet decode/encode on top of the envelope primitives.
//!
//! Receive side: a transport frame becomes one or more [`PacketReceived`]
//! values: one for ordinary traffic, several when the gateway forwarded a
//! `RECEIVED_EPACKET` container of packets it overheard on Bluetooth.
//! Transmit side: a [`PacketOutput`] with a single outgoing hop becomes an
//! encrypted frame.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use infuse_common::time::gps_seconds_now;
use infuse_common::{Auth, BtAddr, InfuseId, InfuseType, Interface, InterfaceAddress};
use infuse_db::{DeviceDatabase, KeyError};

use crate::crypto::{self, AuthFailure, TAG_LEN};
use crate::header::{Flags, HeaderError, PacketHeader};

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// Key material missing or inconsistent. The gateway reacts (ping,
    /// handshake synthesis) and may retry the frame.
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error("malformed received-packet container: {0}")]
    Malformed(&'static str),

    #[error("unknown interface {0} in received-packet container")]
    UnknownInterface(u8),

    /// Containers legitimately nest exactly one level deep.
    #[error("received-packet container nested beyond depth 2")]
    NestingTooDeep,
}

/// Why a packet could not be encoded for transmission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Outgoing packets carry exactly one hop; the gateway expands
    /// multi-hop routes itself.
    #[error("outgoing route must contain exactly one hop")]
    MultiHopRoute,
}

/// One hop of a received packet's route, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HopReceivedWire", into = "HopReceivedWire")]
pub struct HopReceived {
    pub infuse_id: InfuseId,
    pub interface: Interface,
    pub interface_address: InterfaceAddress,
    pub auth: Auth,
    /// 24-bit key metadata observed on this hop.
    pub key_id: u32,
    pub gps_time: u32,
    pub sequence: u16,
    /// dBm; 0 where the link has no signal-strength notion.
    pub rssi: i16,
}

#[derive(Serialize, Deserialize)]
struct HopReceivedWire {
    id: u64,
    interface: u8,
    interface_addr: InterfaceAddress,
    auth: u8,
    key_id: u32,
    time: u32,
    seq: u16,
    rssi: i16,
}

impl From<HopReceived> for HopReceivedWire {
    fn from(hop: HopReceived) -> Self {
        Self {
            id: hop.infuse_id.0,
            interface: hop.interface as u8,
            interface_addr: hop.interface_address,
            auth: hop.auth as u8,
            key_id: hop.key_id,
            time: hop.gps_time,
            seq: hop.sequence,
            rssi: hop.rssi,
        }
    }
}

impl TryFrom<HopReceivedWire> for HopReceived {
    type Error = String;

    fn try_from(wire: HopReceivedWire) -> Result<Self, Self::Error> {
        Ok(Self {
            infuse_id: InfuseId(wire.id),
            interface: Interface::from_u8(wire.interface)
                .ok_or_else(|| format!("unknown interface {}", wire.interface))?,
            interface_address: wire.interface_addr,
            auth: Auth::from_u8(wire.auth).ok_or_else(|| format!("unknown auth {}", wire.auth))?,
            key_id: wire.key_id,
            gps_time: wire.time,
            sequence: wire.seq,
            rssi: wire.rssi,
        })
    }
}

/// One hop of an outgoing packet's route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HopOutputWire", into = "HopOutputWire")]
pub struct HopOutput {
    pub infuse_id: InfuseId,
    pub interface: Interface,
    pub auth: Auth,
}

impl HopOutput {
    /// Hop to the locally attached gateway; the gateway substitutes its
    /// learned identity for the sentinel.
    pub fn serial(auth: Auth) -> Self {
        Self {
            infuse_id: InfuseId::GATEWAY,
            interface: Interface::Serial,
            auth,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HopOutputWire {
    id: u64,
    interface: u8,
    auth: u8,
}

impl From<HopOutput> for HopOutputWire {
    fn from(hop: HopOutput) -> Self {
        Self {
            id: hop.infuse_id.0,
            interface: hop.interface as u8,
            auth: hop.auth as u8,
        }
    }
}

impl TryFrom<HopOutputWire> for HopOutput {
    type Error = String;

    fn try_from(wire: HopOutputWire) -> Result<Self, Self::Error> {
        Ok(Self {
            infuse_id: InfuseId(wire.id),
            interface: Interface::from_u8(wire.interface)
                .ok_or_else(|| format!("unknown interface {}", wire.interface))?,
            auth: Auth::from_u8(wire.auth).ok_or_else(|| format!("unknown auth {}", wire.auth))?,
        })
    }
}

/// ePacket received by a gateway, as delivered to bus clients.
///
/// `route` is ordered origin-first: `[original transmission, .., carrier]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PacketReceivedWire", into = "PacketReceivedWire")]
pub struct PacketReceived {
    pub route: Vec<HopReceived>,
    pub ptype: InfuseType,
    pub payload: Vec<u8>,
}

impl PacketReceived {
    /// The hop the packet originated on.
    pub fn source(&self) -> &HopReceived {
        &self.route[0]
    }
}

#[derive(Serialize, Deserialize)]
struct PacketReceivedWire {
    route: Vec<HopReceived>,
    #[serde(rename = "type")]
    ptype: u8,
    payload: String,
}

impl From<PacketReceived> for PacketReceivedWire {
    fn from(pkt: PacketReceived) -> Self {
        Self {
            route: pkt.route,
            ptype: pkt.ptype as u8,
            payload: B64.encode(&pkt.payload),
        }
    }
}

impl TryFrom<PacketReceivedWire> for PacketReceived {
    type Error = String;

    fn try_from(wire: PacketReceivedWire) -> Result<Self, Self::Error> {
        Ok(Self {
            route: wire.route,
            ptype: InfuseType::from_u8(wire.ptype)
                .ok_or_else(|| format!("unknown packet type {}", wire.ptype))?,
            payload: B64
                .decode(&wire.payload)
                .map_err(|e| format!("payload not base64: {e}"))?,
        })
    }
}

/// ePacket queued for transmission by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PacketOutputWire", into = "PacketOutputWire")]
pub struct PacketOutput {
    pub route: Vec<HopOutput>,
    pub ptype: InfuseType,
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct PacketOutputWire {
    route: Vec<HopOutput>,
    #[serde(rename = "type")]
    ptype: u8,
    payload: String,
}

impl From<PacketOutput> for PacketOutputWire {
    fn from(pkt: PacketOutput) -> Self {
        Self {
            route: pkt.route,
            ptype: pkt.ptype as u8,
            payload: B64.encode(&pkt.payload),
        }
    }
}

impl TryFrom<PacketOutputWire> for PacketOutput {
    type Error = String;

    fn try_from(wire: PacketOutputWire) -> Result<Self, Self::Error> {
        Ok(Self {
            route: wire.route,
            ptype: InfuseType::from_u8(wire.ptype)
                .ok_or_else(|| format!("unknown packet type {}", wire.ptype))?,
            payload: B64
                .decode(&wire.payload)
                .map_err(|e| format!("payload not base64: {e}"))?,
        })
    }
}

fn hop_from_header(
    header: &PacketHeader,
    interface: Interface,
    interface_address: InterfaceAddress,
    rssi: i16,
) -> HopReceived {
    HopReceived {
        infuse_id: header.device_id,
        interface,
        interface_address,
        auth: header.auth(),
        key_id: header.key_metadata,
        gps_time: header.gps_time,
        sequence: header.sequence,
        rssi,
    }
}

/// Record the header's key metadata against its device and fetch the
/// decryption key for `interface`.
fn observe_and_key(
    db: &mut DeviceDatabase,
    header: &PacketHeader,
    interface: Interface,
) -> Result<[u8; 32], KeyError> {
    match header.auth() {
        Auth::Device => {
            db.observe(header.device_id, None, Some(header.key_metadata), None)?;
            db.device_key(header.device_id, interface, header.gps_time)
        }
        Auth::Network => {
            db.observe(header.device_id, Some(header.key_metadata), None, None)?;
            db.network_key(header.device_id, interface, header.gps_time)
        }
    }
}

fn open_frame(
    db: &mut DeviceDatabase,
    frame: &[u8],
    interface: Interface,
) -> Result<(PacketHeader, Vec<u8>), DecodeError> {
    let header = PacketHeader::parse(frame)?;
    let key = observe_and_key(db, &header, interface)?;
    let wire: [u8; PacketHeader::WIRE_LEN] = frame[..PacketHeader::WIRE_LEN]
        .try_into()
        .expect("length checked by header parse");
    let plaintext = crypto::open(
        &key,
        PacketHeader::aad(&wire),
        PacketHeader::nonce(&wire),
        &frame[PacketHeader::WIRE_LEN..],
    )?;
    Ok((header, plaintext))
}

/// Nested container common header: u15 block length + encrypted bit, |rssi|,
/// interface.
const COMMON_LEN: usize = 4;
/// Decrypted inner header carried when the gateway already removed the
/// envelope: device id, gps time, type, flags, sequence, 24-bit key id.
const DECRYPTED_HEADER_LEN: usize = 20;

/// Decode a reconstructed transport frame into received packets.
///
/// `carrier` names the interface the frame itself arrived on (serial or
/// UDP). Packets inside a `RECEIVED_EPACKET` container are yielded in
/// container order, each with the origin hop prepended to the carrier hop.
pub fn decode(
    db: &mut DeviceDatabase,
    frame: &[u8],
    carrier: Interface,
) -> Result<Vec<PacketReceived>, DecodeError> {
    let (header, plaintext) = open_frame(db, frame, carrier)?;
    let carrier_hop = hop_from_header(&header, carrier, InterfaceAddress::Serial, 0);

    if header.ptype != InfuseType::ReceivedEpacket {
        return Ok(vec![PacketReceived {
            route: vec![carrier_hop],
            ptype: header.ptype,
            payload: plaintext,
        }]);
    }

    // Iteratively unpack the container; real traffic never nests beyond the
    // container itself, so an inner container is rejected outright.
    let mut packets = Vec::new();
    let mut buffer = plaintext.as_slice();
    while !buffer.is_empty() {
        if buffer.len() < COMMON_LEN {
            return Err(DecodeError::Malformed("short common header"));
        }
        let len_encr = u16::from_le_bytes([buffer[0], buffer[1]]);
        let block_len = usize::from(len_encr & 0x7FFF);
        let encrypted = len_encr & 0x8000 != 0;
        let rssi = -(i16::from(buffer[2]));
        let interface =
            Interface::from_u8(buffer[3]).ok_or(DecodeError::UnknownInterface(buffer[3]))?;

        if block_len < COMMON_LEN || block_len > buffer.len() {
            return Err(DecodeError::Malformed("block length out of range"));
        }
        let mut body = &buffer[COMMON_LEN..block_len];
        buffer = &buffer[block_len..];

        let interface_address = if interface.is_bluetooth() {
            let addr = BtAddr::from_wire(body)
                .ok_or(DecodeError::Malformed("short bluetooth address"))?;
            body = &body[BtAddr::WIRE_LEN..];
            InterfaceAddress::BluetoothLe(addr)
        } else {
            InterfaceAddress::Serial
        };

        let record_bt_addr = |db: &mut DeviceDatabase, device: InfuseId| {
            if let InterfaceAddress::BluetoothLe(addr) = interface_address {
                // Registering an address alone cannot fail.
                let _ = db.observe(device, None, None, Some(addr));
            }
        };

        if encrypted {
            let inner_header = match PacketHeader::parse(body) {
                Ok(h) => h,
                Err(err) => return Err(DecodeError::Header(err)),
            };
            if inner_header.ptype == InfuseType::ReceivedEpacket {
                return Err(DecodeError::NestingTooDeep);
            }
            let (inner_header, inner_plain) = match open_frame(db, body, interface) {
                Ok(ok) => ok,
                Err(DecodeError::Key(err)) => {
                    // No key material for an overheard packet: skip it, the
                    // rest of the container is still good.
                    tracing::debug!(device = %inner_header.device_id, error = %err,
                        "Skipping contained packet");
                    continue;
                }
                Err(other) => return Err(other),
            };
            record_bt_addr(db, inner_header.device_id);
            packets.push(PacketReceived {
                route: vec![
                    hop_from_header(&inner_header, interface, interface_address, rssi),
                    carrier_hop.clone(),
                ],
                ptype: inner_header.ptype,
                payload: inner_plain,
            });
        } else {
            if body.len() < DECRYPTED_HEADER_LEN {
                return Err(DecodeError::Malformed("short decrypted header"));
            }
            let device_id = InfuseId(u64::from_le_bytes(body[0..8].try_into().expect("8 bytes")));
            let gps_time = u32::from_le_bytes(body[8..12].try_into().expect("4 bytes"));
            let ptype = InfuseType::from_u8(body[12])
                .ok_or(DecodeError::Header(HeaderError::UnknownType(body[12])))?;
            if ptype == InfuseType::ReceivedEpacket {
                return Err(DecodeError::NestingTooDeep);
            }
            let flags = Flags::from_bits_retain(u16::from_le_bytes([body[13], body[14]]));
            let sequence = u16::from_le_bytes([body[15], body[16]]);
            let key_id = u32::from_le_bytes([body[17], body[18], body[19], 0]);

            // Track the origin: its address for later connections, and its
            // network membership when the hop was network-keyed. The device
            // key id is NOT recorded from here; this header arrived
            // plaintext and must not be able to poison a record.
            let network_id = (flags.auth() == Auth::Network).then_some(key_id);
            let bt_addr = match interface_address {
                InterfaceAddress::BluetoothLe(addr) => Some(addr),
                InterfaceAddress::Serial => None,
            };
            let _ = db.observe(device_id, network_id, None, bt_addr);
            packets.push(PacketReceived {
                route: vec![
                    HopReceived {
                        infuse_id: device_id,
                        interface,
                        interface_address,
                        auth: flags.auth(),
                        key_id,
                        gps_time,
                        sequence,
                        rssi,
                    },
                    carrier_hop.clone(),
                ],
                ptype,
                payload: body[DECRYPTED_HEADER_LEN..].to_vec(),
            });
        }
    }

    Ok(packets)
}

/// Encode and encrypt a packet for a single outgoing hop.
///
/// `source` is the identity placed in the header (the host transmits with
/// the gateway's identity). Key selection follows the hop's auth level and
/// interface; GATT hops consume the registry's transmit sequence counter.
pub fn encode(
    db: &mut DeviceDatabase,
    hop: &HopOutput,
    source: InfuseId,
    ptype: InfuseType,
    payload: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    let gps_time = gps_seconds_now();

    let (key, key_metadata) = match hop.auth {
        Auth::Network => {
            let key = db.network_key(hop.infuse_id, hop.interface, gps_time)?;
            let network_id = db
                .network_id_of(hop.infuse_id)
                .ok_or(KeyError::UnknownDevice(hop.infuse_id))?;
            (key, network_id)
        }
        Auth::Device => {
            let key = db.device_key(hop.infuse_id, hop.interface, gps_time)?;
            let key_id = db
                .device_key_id_of(hop.infuse_id)
                .ok_or(KeyError::UnknownDeviceKey(hop.infuse_id))?;
            (key, key_id)
        }
    };

    let sequence = match hop.interface {
        Interface::BtPeripheral | Interface::BtCentral => db.next_gatt_seq(hop.infuse_id),
        _ => 0,
    };

    let header = PacketHeader::new(
        ptype,
        hop.auth,
        key_metadata,
        source,
        gps_time,
        sequence,
        rand::random::<u16>(),
    );
    let wire = header.to_wire();
    let sealed = crypto::seal(
        &key,
        PacketHeader::aad(&wire),
        PacketHeader::nonce(&wire),
        payload,
    );

    let mut frame = Vec::with_capacity(wire.len() + sealed.len());
    frame.extend_from_slice(&wire);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Encode an outgoing packet whose route was computed by the gateway.
pub fn encode_output(
    db: &mut DeviceDatabase,
    packet: &PacketOutput,
    source: InfuseId,
) -> Result<Vec<u8>, EncodeError> {
    let [hop] = packet.route.as_slice() else {
        return Err(EncodeError::MultiHopRoute);
    };
    encode(db, hop, source, packet.ptype, &packet.payload)
}

/// Payload of an `EPACKET_FORWARD` envelope: the interface to forward over,
/// the peer address on that interface, and the fully-encrypted inner frame.
pub fn forward_payload(
    interface: Interface,
    address: &InterfaceAddress,
    inner_frame: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + BtAddr::WIRE_LEN + inner_frame.len());
    out.push(interface as u8);
    if let InterfaceAddress::BluetoothLe(addr) = address {
        out.extend_from_slice(&addr.to_wire());
    }
    out.extend_from_slice(inner_frame);
    out
}

/// Expected ciphertext overhead of an envelope: header plus tag.
pub const ENVELOPE_OVERHEAD: usize = PacketHeader::WIRE_LEN + TAG_LEN;

#[cfg(test)]
mod tests {
    use super::*;
    use infuse_common::BtAddrKind;
    use infuse_db::test_fixtures::{network_zero_store, FixedResolver};

    const GATEWAY_ID: InfuseId = InfuseId(0x0011_2233_4455_6677);
    const SENSOR_ID: InfuseId = InfuseId(0x8899_AABB_CCDD_EEFF);

    fn db() -> DeviceDatabase {
        let mut db = DeviceDatabase::new(network_zero_store(), Box::new(FixedResolver([5u8; 32])));
        db.observe(GATEWAY_ID, Some(0), None, None).unwrap();
        db.observe(SENSOR_ID, Some(0), None, None).unwrap();
        db
    }

    fn network_hop(id: InfuseId) -> HopOutput {
        HopOutput {
            infuse_id: id,
            interface: Interface::Serial,
            auth: Auth::Network,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut db = db();
        let payload = b"sensor reading 42".to_vec();
        let frame = encode(
            &mut db,
            &network_hop(GATEWAY_ID),
            GATEWAY_ID,
            InfuseType::Tdf,
            &payload,
        )
        .unwrap();

        let packets = decode(&mut db, &frame, Interface::Serial).unwrap();
        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(pkt.ptype, InfuseType::Tdf);
        assert_eq!(pkt.payload, payload);
        assert_eq!(pkt.route.len(), 1);
        assert_eq!(pkt.route[0].infuse_id, GATEWAY_ID);
        assert_eq!(pkt.route[0].interface, Interface::Serial);
        assert_eq!(pkt.route[0].auth, Auth::Network);
        assert_eq!(pkt.route[0].key_id, 0);
    }

    #[test]
    fn device_auth_round_trip() {
        let mut db = db();
        db.record_handshake(GATEWAY_ID, &[1u8; 32], &[2u8; 32], 0)
            .unwrap();
        let hop = HopOutput {
            infuse_id: GATEWAY_ID,
            interface: Interface::Serial,
            auth: Auth::Device,
        };
        let frame = encode(&mut db, &hop, GATEWAY_ID, InfuseType::RpcCmd, b"cmd").unwrap();
        let packets = decode(&mut db, &frame, Interface::Serial).unwrap();
        assert_eq!(packets[0].route[0].auth, Auth::Device);
        assert_eq!(packets[0].payload, b"cmd");
    }

    #[test]
    fn any_bit_flip_fails_authentication() {
        let mut db = db();
        let frame = encode(
            &mut db,
            &network_hop(GATEWAY_ID),
            GATEWAY_ID,
            InfuseType::EchoReq,
            b"ping!",
        )
        .unwrap();

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                let result = decode(&mut db, &tampered, Interface::Serial);
                assert!(
                    !matches!(result, Ok(_)),
                    "flip of byte {byte} bit {bit} was accepted"
                );
            }
        }
        // The untampered frame still decodes; failures never poison state.
        assert!(decode(&mut db, &frame, Interface::Serial).is_ok());
    }

    #[test]
    fn truncated_ciphertext_is_auth_failure() {
        let mut db = db();
        let frame = encode(
            &mut db,
            &network_hop(GATEWAY_ID),
            GATEWAY_ID,
            InfuseType::Tdf,
            b"data",
        )
        .unwrap();
        let result = decode(&mut db, &frame[..frame.len() - 1], Interface::Serial);
        assert_eq!(result, Err(DecodeError::Auth(AuthFailure)));
    }

    #[test]
    fn unknown_device_key_bubbles_for_retry() {
        let mut db = db();
        // Forge a DEVICE-auth header: the registry has no shared secret, so
        // decode must surface the key error before touching the ciphertext.
        let header = PacketHeader::new(
            InfuseType::Tdf,
            Auth::Device,
            0x000042,
            SENSOR_ID,
            1000,
            0,
            0,
        );
        let mut frame = header.to_wire().to_vec();
        frame.extend_from_slice(&[0u8; 20]);
        assert_eq!(
            decode(&mut db, &frame, Interface::Serial),
            Err(DecodeError::Key(KeyError::UnknownDeviceKey(SENSOR_ID)))
        );
    }

    /// Build a container block holding a fully-encrypted inner frame.
    fn encrypted_block(addr: BtAddr, rssi_abs: u8, inner_frame: &[u8]) -> Vec<u8> {
        let len = COMMON_LEN + BtAddr::WIRE_LEN + inner_frame.len();
        let mut block = Vec::with_capacity(len);
        block.extend_from_slice(&((len as u16) | 0x8000).to_le_bytes());
        block.push(rssi_abs);
        block.push(Interface::BtAdv as u8);
        block.extend_from_slice(&addr.to_wire());
        block.extend_from_slice(inner_frame);
        block
    }

    /// Build a container block holding an already-decrypted inner packet.
    fn plaintext_block(
        addr: BtAddr,
        rssi_abs: u8,
        device: InfuseId,
        ptype: InfuseType,
        payload: &[u8],
    ) -> Vec<u8> {
        let len = COMMON_LEN + BtAddr::WIRE_LEN + DECRYPTED_HEADER_LEN + payload.len();
        let mut block = Vec::with_capacity(len);
        block.extend_from_slice(&(len as u16).to_le_bytes());
        block.push(rssi_abs);
        block.push(Interface::BtAdv as u8);
        block.extend_from_slice(&addr.to_wire());
        block.extend_from_slice(&device.0.to_le_bytes());
        block.extend_from_slice(&4321u32.to_le_bytes()); // gps_time
        block.push(ptype as u8);
        block.extend_from_slice(&0u16.to_le_bytes()); // flags: network
        block.extend_from_slice(&7u16.to_le_bytes()); // sequence
        block.extend_from_slice(&[0, 0, 0]); // key id
        block.extend_from_slice(payload);
        block
    }

    #[test]
    fn nested_container_yields_inner_packets_in_order() {
        let mut db = db();
        let bt_addr = BtAddr::new(BtAddrKind::Random, 0x112233445566);

        // Inner packet 1: network-encrypted BT advertisement from the sensor.
        let inner_hop = HopOutput {
            infuse_id: SENSOR_ID,
            interface: Interface::BtAdv,
            auth: Auth::Network,
        };
        let inner_frame = encode(&mut db, &inner_hop, SENSOR_ID, InfuseType::Tdf, b"inner-1")
            .unwrap();

        // Inner packet 2: plaintext record the gateway decrypted for us.
        let mut container = encrypted_block(bt_addr, 70, &inner_frame);
        container.extend_from_slice(&plaintext_block(
            bt_addr,
            54,
            SENSOR_ID,
            InfuseType::Ack,
            b"inner-2",
        ));

        // Outer envelope from the gateway over serial.
        let outer_key = db
            .network_key(GATEWAY_ID, Interface::Serial, 5000)
            .unwrap();
        let outer_header = PacketHeader::new(
            InfuseType::ReceivedEpacket,
            Auth::Network,
            0,
            GATEWAY_ID,
            5000,
            3,
            99,
        );
        let wire = outer_header.to_wire();
        let mut frame = wire.to_vec();
        frame.extend_from_slice(&crypto::seal(
            &outer_key,
            PacketHeader::aad(&wire),
            PacketHeader::nonce(&wire),
            &container,
        ));

        let packets = decode(&mut db, &frame, Interface::Serial).unwrap();
        assert_eq!(packets.len(), 2);

        // Container-encoded order is preserved.
        assert_eq!(packets[0].payload, b"inner-1");
        assert_eq!(packets[1].payload, b"inner-2");

        for pkt in &packets {
            assert_eq!(pkt.route.len(), 2);
            // Outer hop is the serial carrier.
            assert_eq!(pkt.route[1].infuse_id, GATEWAY_ID);
            assert_eq!(pkt.route[1].interface, Interface::Serial);
            // Inner hop keeps the Bluetooth address.
            assert_eq!(
                pkt.route[0].interface_address,
                InterfaceAddress::BluetoothLe(bt_addr)
            );
            assert_eq!(pkt.route[0].interface, Interface::BtAdv);
        }

        // RSSI is the negated common-header byte.
        assert_eq!(packets[0].route[0].rssi, -70);
        assert_eq!(packets[1].route[0].rssi, -54);
        assert_eq!(packets[1].route[0].sequence, 7);
    }

    #[test]
    fn contained_packet_without_keys_is_skipped() {
        let mut db = db();
        let bt_addr = BtAddr::new(BtAddrKind::Public, 0xAABBCCDDEEFF);

        // Inner frame from a network the registry has no key for.
        let stranger = InfuseId(0x1234);
        let header = PacketHeader::new(
            InfuseType::Tdf,
            Auth::Network,
            0x00BEEF,
            stranger,
            1000,
            0,
            0,
        );
        let mut inner_frame = header.to_wire().to_vec();
        inner_frame.extend_from_slice(&[0u8; 24]);

        let mut container = encrypted_block(bt_addr, 61, &inner_frame);
        container.extend_from_slice(&plaintext_block(
            bt_addr,
            48,
            SENSOR_ID,
            InfuseType::Tdf,
            b"kept",
        ));

        let outer_key = db.network_key(GATEWAY_ID, Interface::Serial, 900).unwrap();
        let outer_header = PacketHeader::new(
            InfuseType::ReceivedEpacket,
            Auth::Network,
            0,
            GATEWAY_ID,
            900,
            0,
            0,
        );
        let wire = outer_header.to_wire();
        let mut frame = wire.to_vec();
        frame.extend_from_slice(&crypto::seal(
            &outer_key,
            PacketHeader::aad(&wire),
            PacketHeader::nonce(&wire),
            &container,
        ));

        let packets = decode(&mut db, &frame, Interface::Serial).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"kept");
    }

    #[test]
    fn json_matches_bus_schema() {
        let pkt = PacketReceived {
            route: vec![HopReceived {
                infuse_id: InfuseId(7),
                interface: Interface::Serial,
                interface_address: InterfaceAddress::Serial,
                auth: Auth::Network,
                key_id: 0,
                gps_time: 1000,
                sequence: 2,
                rssi: 0,
            }],
            ptype: InfuseType::Tdf,
            payload: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&pkt).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "route": [{
                    "id": 7,
                    "interface": 0,
                    "interface_addr": {"i": "SERIAL"},
                    "auth": 1,
                    "key_id": 0,
                    "time": 1000,
                    "seq": 2,
                    "rssi": 0,
                }],
                "type": 2,
                "payload": "AQID",
            })
        );
        let back: PacketReceived = serde_json::from_value(json).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn multi_hop_output_is_rejected() {
        let mut db = db();
        let pkt = PacketOutput {
            route: vec![network_hop(GATEWAY_ID), network_hop(SENSOR_ID)],
            ptype: InfuseType::Tdf,
            payload: vec![],
        };
        assert_eq!(
            encode_output(&mut db, &pkt, GATEWAY_ID),
            Err(EncodeError::MultiHopRoute)
        );
    }
}
