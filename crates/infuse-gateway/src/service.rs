//! The gateway service: RX/TX workers around a shared device registry.
//!
//! The RX worker drains transport bytes through the frame reconstructor,
//! decodes frames against the registry, reacts to missing key material
//! (ping, handshake synthesis) and broadcasts decoded packets on the bus.
//! The TX worker drains bus requests, resolves routes (including the
//! serial→bt_central forward for downstream peers) and drives the
//! Bluetooth connection lifecycle with self-originated RPCs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};

use infuse_bus::{DataTypes, LocalServer, Notification, Request};
use infuse_common::{Auth, InfuseId, InfuseType, Interface, InterfaceAddress};
use infuse_db::{DeviceDatabase, KeyError};
use infuse_epacket::packet::{self, HopOutput, PacketReceived};
use infuse_epacket::{FrameReconstructor, PacketHeader};
use infuse_rpc::wire::{RequestHeader, ResponseHeader};
use infuse_rpc::{BtConnectInfuse, BtDisconnect, RpcCommand, SecurityState};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::transport::Transport;
use crate::GatewayError;

/// How long a caller is parked while a synthesized handshake resolves.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(1);
/// Minimum spacing between identity pings.
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Parked frames kept per device awaiting a handshake.
const MAX_PARKED_FRAMES: usize = 16;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Payload budget reported to clients for one packet over a GATT link.
    pub gatt_mtu: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 1, 1, 1),
            port: infuse_bus::DEFAULT_PORT,
            gatt_mtu: 244,
        }
    }
}

/// Self-originated RPCs awaiting their response.
enum SelfRpc {
    Handshake {
        device: InfuseId,
        /// Parked caller to wake when the handshake resolves.
        waiter: Option<Sender<bool>>,
    },
    Connect {
        device: InfuseId,
    },
    Disconnect {
        device: InfuseId,
    },
}

struct Shared {
    db: Mutex<DeviceDatabase>,
    transport: Mutex<Box<dyn Transport>>,
    server: LocalServer,
    /// Identity of the locally attached gateway device, learned from the
    /// first parsed serial header.
    gateway_id: Mutex<Option<InfuseId>>,
    /// Frames parked until a handshake provides their device key.
    parked: Mutex<HashMap<InfuseId, Vec<Vec<u8>>>>,
    outstanding: Mutex<HashMap<u32, SelfRpc>>,
    connections: Mutex<ConnectionManager>,
    last_ping: Mutex<Option<Instant>>,
    stop: AtomicBool,
    gatt_mtu: usize,
}

pub struct Gateway {
    shared: Arc<Shared>,
}

/// Join handles for the running workers.
pub struct GatewayHandle {
    rx: JoinHandle<()>,
    tx: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn join(self) {
        let _ = self.rx.join();
        let _ = self.tx.join();
    }
}

impl Gateway {
    pub fn new(
        transport: Box<dyn Transport>,
        db: DeviceDatabase,
        config: GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let server = LocalServer::bind(config.group, config.port)?;
        Ok(Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                transport: Mutex::new(transport),
                server,
                gateway_id: Mutex::new(None),
                parked: Mutex::new(HashMap::new()),
                outstanding: Mutex::new(HashMap::new()),
                connections: Mutex::new(ConnectionManager::default()),
                last_ping: Mutex::new(None),
                stop: AtomicBool::new(false),
                gatt_mtu: config.gatt_mtu,
            }),
        })
    }

    /// Identity of the attached gateway device, once learned.
    pub fn gateway_id(&self) -> Option<InfuseId> {
        *self.shared.gateway_id.lock().expect("lock poisoned")
    }

    /// Spawn the RX and TX workers. Pings the transport first so the
    /// gateway device announces its identity.
    pub fn start(&self) -> std::io::Result<GatewayHandle> {
        if let Err(err) = self
            .shared
            .transport
            .lock()
            .expect("lock poisoned")
            .ping()
        {
            tracing::warn!(error = %err, "Initial ping failed");
        }

        let rx_shared = self.shared.clone();
        let rx = std::thread::Builder::new()
            .name("gateway-rx".into())
            .spawn(move || rx_worker(&rx_shared))?;

        let tx_shared = self.shared.clone();
        let tx = std::thread::Builder::new()
            .name("gateway-tx".into())
            .spawn(move || tx_worker(&tx_shared))?;

        Ok(GatewayHandle { rx, tx })
    }

    /// Signal both workers to stop after their current iteration.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }
}

// ============================================================
// RX worker
// ============================================================

fn rx_worker(shared: &Shared) {
    let mut reconstructor = FrameReconstructor::new();
    let mut console_line = String::new();

    while !shared.stop.load(Ordering::Relaxed) {
        let bytes = match shared
            .transport
            .lock()
            .expect("lock poisoned")
            .read_bytes(1024)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "Transport read failed");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        for byte in bytes {
            let (in_frame, frame) = reconstructor.push(byte);
            if let Some(frame) = frame {
                handle_frame(shared, &frame);
                continue;
            }
            if !in_frame {
                // Console output from the device firmware.
                if byte == b'\n' {
                    tracing::info!(target: "device", "{}", console_line);
                    console_line.clear();
                } else if byte != b'\r' {
                    console_line.push(char::from(byte));
                }
            }
        }
    }
}

fn handle_frame(shared: &Shared, frame: &[u8]) {
    // The serial peer's identity is in the clear in every header; learn it
    // before attempting decryption.
    if let Ok(header) = PacketHeader::parse(frame) {
        let mut gateway_id = shared.gateway_id.lock().expect("lock poisoned");
        if gateway_id.is_none() {
            tracing::info!(gateway = %header.device_id, "Local gateway identified");
            *gateway_id = Some(header.device_id);
        }
    }

    let decoded = {
        let mut db = shared.db.lock().expect("lock poisoned");
        packet::decode(&mut db, frame, Interface::Serial)
    };

    match decoded {
        Ok(packets) => {
            for packet in packets {
                deliver(shared, packet);
            }
        }
        Err(packet::DecodeError::Key(KeyError::UnknownDeviceKey(device))) => {
            park_and_handshake(shared, device, frame);
        }
        Err(packet::DecodeError::Key(KeyError::DeviceKeyChanged(device))) => {
            tracing::error!(device = %device, "Device key changed, dropping frame");
        }
        Err(packet::DecodeError::Key(err)) => {
            // No network key material yet: provoke the gateway into
            // identifying itself (and carrying its network id).
            tracing::debug!(error = %err, "Missing network key, pinging");
            ping_throttled(shared);
        }
        Err(packet::DecodeError::Auth(_)) => {
            tracing::warn!(bytes = frame.len(), "Failed to authenticate frame");
        }
        Err(err) => {
            tracing::warn!(error = %err, bytes = frame.len(), "Frame decode failed");
        }
    }
}

/// Broadcast a decoded packet, first offering RPC responses to the
/// self-RPC dispatcher.
fn deliver(shared: &Shared, packet: PacketReceived) {
    tracing::debug!(
        ptype = %packet.ptype,
        source = %packet.source().infuse_id,
        bytes = packet.payload.len(),
        "RX"
    );

    if packet.ptype == InfuseType::RpcRsp {
        dispatch_self_rpc(shared, &packet);
    }

    if let Err(err) = shared
        .server
        .broadcast(&Notification::EpacketReceived(packet))
    {
        tracing::warn!(error = %err, "Bus broadcast failed");
    }
}

fn dispatch_self_rpc(shared: &Shared, packet: &PacketReceived) {
    let Some(header) = ResponseHeader::parse(&packet.payload) else {
        return;
    };
    let entry = shared
        .outstanding
        .lock()
        .expect("lock poisoned")
        .remove(&header.request_id);
    let Some(entry) = entry else {
        return;
    };
    let response = &packet.payload[ResponseHeader::WIRE_LEN..];

    match entry {
        SelfRpc::Handshake { device, waiter } => {
            let success = header.return_code == 0
                && record_handshake_response(shared, device, response);
            if success {
                retry_parked(shared, device);
            } else {
                tracing::warn!(device = %device, code = header.return_code,
                    "Handshake failed");
                shared.parked.lock().expect("lock poisoned").remove(&device);
            }
            if let Some(waiter) = waiter {
                let _ = waiter.send(success);
            }
        }
        SelfRpc::Connect { device } => {
            let state = shared
                .connections
                .lock()
                .expect("lock poisoned")
                .connect_result(device, header.return_code);
            if state == ConnectionState::Connected {
                // The connect response carries the peer's security state.
                if let Some(rsp) = BtConnectInfuse::parse_response(response) {
                    let mut db = shared.db.lock().expect("lock poisoned");
                    if let Err(err) = db.record_handshake(
                        device,
                        &rsp.cloud_public_key,
                        &rsp.device_public_key,
                        rsp.network_id,
                    ) {
                        tracing::warn!(device = %device, error = %err,
                            "Connect handshake not recorded");
                    }
                }
                tracing::info!(device = %device, "Connection created");
                let _ = shared.server.broadcast(&Notification::ConnectionCreated {
                    id: device,
                    mtu: shared.gatt_mtu,
                });
            } else {
                tracing::info!(device = %device, code = header.return_code,
                    "Connection failed");
                let _ = shared
                    .server
                    .broadcast(&Notification::ConnectionFailed { id: device });
            }
        }
        SelfRpc::Disconnect { device } => {
            shared
                .connections
                .lock()
                .expect("lock poisoned")
                .released(device);
            tracing::info!(device = %device, "Connection released");
        }
    }
}

fn record_handshake_response(shared: &Shared, device: InfuseId, response: &[u8]) -> bool {
    let Some(rsp) = SecurityState::parse_response(response) else {
        tracing::warn!(device = %device, "Malformed security_state response");
        return false;
    };
    let mut db = shared.db.lock().expect("lock poisoned");
    match db.record_handshake(
        device,
        &rsp.cloud_public_key,
        &rsp.device_public_key,
        rsp.network_id,
    ) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(device = %device, error = %err, "Handshake not recorded");
            false
        }
    }
}

fn park_and_handshake(shared: &Shared, device: InfuseId, frame: &[u8]) {
    {
        let mut parked = shared.parked.lock().expect("lock poisoned");
        let queue = parked.entry(device).or_default();
        if queue.len() < MAX_PARKED_FRAMES {
            queue.push(frame.to_vec());
        }
    }

    // One handshake in flight per device is enough; every parked frame is
    // retried when it resolves.
    let already_synthesizing = shared
        .outstanding
        .lock()
        .expect("lock poisoned")
        .values()
        .any(|rpc| matches!(rpc, SelfRpc::Handshake { device: d, .. } if *d == device));
    if already_synthesizing {
        return;
    }

    tracing::info!(device = %device, "Synthesizing security handshake");
    if let Err(err) = synthesize_handshake(shared, device, None) {
        tracing::warn!(device = %device, error = %err, "Handshake synthesis failed");
    }
}

fn retry_parked(shared: &Shared, device: InfuseId) {
    let frames = shared
        .parked
        .lock()
        .expect("lock poisoned")
        .remove(&device)
        .unwrap_or_default();
    for frame in frames {
        let decoded = {
            let mut db = shared.db.lock().expect("lock poisoned");
            packet::decode(&mut db, &frame, Interface::Serial)
        };
        match decoded {
            Ok(packets) => {
                for packet in packets {
                    deliver(shared, packet);
                }
            }
            Err(err) => {
                tracing::warn!(device = %device, error = %err, "Parked frame retry failed");
            }
        }
    }
}

fn ping_throttled(shared: &Shared) {
    let mut last = shared.last_ping.lock().expect("lock poisoned");
    if last.map_or(false, |at| at.elapsed() < PING_INTERVAL) {
        return;
    }
    *last = Some(Instant::now());
    if let Err(err) = shared.transport.lock().expect("lock poisoned").ping() {
        tracing::warn!(error = %err, "Ping failed");
    }
}

// ============================================================
// TX worker
// ============================================================

fn tx_worker(shared: &Shared) {
    while !shared.stop.load(Ordering::Relaxed) {
        match shared.server.receive() {
            Ok(Some(request)) => handle_request(shared, request),
            Ok(None) => connect_resolved_devices(shared),
            Err(err) => {
                tracing::warn!(error = %err, "Bus receive failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_request(shared: &Shared, request: Request) {
    match request {
        Request::EpacketSend(packet) => {
            let [hop] = packet.route.as_slice() else {
                tracing::warn!(hops = packet.route.len(), "Dropping multi-hop send request");
                return;
            };
            let target = hop.infuse_id;

            // DEVICE-auth hops need a completed handshake first.
            if hop.auth == Auth::Device && !ensure_device_key(shared, target) {
                tracing::warn!(device = %target, "No device key, dropping packet");
                return;
            }

            match resolve_and_encode(shared, target, hop.auth, packet.ptype, &packet.payload) {
                Ok(frame) => {
                    tracing::debug!(ptype = %packet.ptype, bytes = packet.payload.len(), "TX");
                    write_frame(shared, &frame);
                }
                Err(err) => {
                    tracing::warn!(device = %target, error = %err, "Send failed");
                }
            }
        }
        Request::ConnectionRequest { id, data_types } => {
            let address_known = shared
                .db
                .lock()
                .expect("lock poisoned")
                .bt_addr_of(id)
                .is_some();
            let state = shared
                .connections
                .lock()
                .expect("lock poisoned")
                .request(id, data_types, address_known);
            match state {
                ConnectionState::Connecting => emit_connect(shared, id, data_types),
                ConnectionState::Resolving => {
                    tracing::info!(device = %id, "Waiting for device advertisement");
                }
                ConnectionState::Connected => {
                    // Already up: repeat the verdict for the new requester.
                    let _ = shared.server.broadcast(&Notification::ConnectionCreated {
                        id,
                        mtu: shared.gatt_mtu,
                    });
                }
                _ => {}
            }
        }
        Request::ConnectionRelease { id } => {
            let emit = shared
                .connections
                .lock()
                .expect("lock poisoned")
                .release(id);
            if emit {
                emit_disconnect(shared, id);
            }
        }
    }
}

/// Kick off connects for devices whose addresses have since been observed.
fn connect_resolved_devices(shared: &Shared) {
    let resolving = shared
        .connections
        .lock()
        .expect("lock poisoned")
        .resolving();
    for id in resolving {
        let known = shared
            .db
            .lock()
            .expect("lock poisoned")
            .bt_addr_of(id)
            .is_some();
        if known {
            let (proceed, types) = {
                let mut connections = shared.connections.lock().expect("lock poisoned");
                (connections.address_resolved(id), connections.data_types(id))
            };
            if proceed {
                emit_connect(shared, id, types);
            }
        }
    }
}

fn emit_connect(shared: &Shared, id: InfuseId, data_types: DataTypes) {
    let addr = shared.db.lock().expect("lock poisoned").bt_addr_of(id);
    let Some(addr) = addr else {
        tracing::warn!(device = %id, "Bluetooth address vanished");
        let _ = shared
            .server
            .broadcast(&Notification::ConnectionFailed { id });
        return;
    };

    let command = BtConnectInfuse {
        peer: addr,
        conn_timeout_ms: 5_000,
        subscribe: data_types,
        inactivity_timeout_ms: 0,
    };
    tracing::info!(device = %id, peer = %addr, "Connecting");
    if let Err(err) = emit_self_rpc(shared, &command, SelfRpc::Connect { device: id }) {
        tracing::warn!(device = %id, error = %err, "Connect RPC failed");
        shared
            .connections
            .lock()
            .expect("lock poisoned")
            .connect_result(id, -1);
        let _ = shared
            .server
            .broadcast(&Notification::ConnectionFailed { id });
    }
}

fn emit_disconnect(shared: &Shared, id: InfuseId) {
    let addr = shared.db.lock().expect("lock poisoned").bt_addr_of(id);
    let Some(addr) = addr else {
        shared
            .connections
            .lock()
            .expect("lock poisoned")
            .released(id);
        return;
    };
    tracing::info!(device = %id, "Disconnecting");
    let command = BtDisconnect { peer: addr };
    if let Err(err) = emit_self_rpc(shared, &command, SelfRpc::Disconnect { device: id }) {
        tracing::warn!(device = %id, error = %err, "Disconnect RPC failed");
        shared
            .connections
            .lock()
            .expect("lock poisoned")
            .released(id);
    }
}

// ============================================================
// Self-originated RPCs
// ============================================================

/// Send a standard-mode RPC to the gateway device on the service's own
/// behalf, registering the response dispatch entry.
fn emit_self_rpc<C: RpcCommand>(
    shared: &Shared,
    command: &C,
    entry: SelfRpc,
) -> Result<(), GatewayError> {
    // The gateway's own RPCs run at device auth; make sure the key exists.
    if command.auth() == Auth::Device && !ensure_device_key(shared, InfuseId::GATEWAY) {
        return Err(GatewayError::GatewayUnknown);
    }

    let request_id = rand::random::<u32>();
    let header = RequestHeader {
        request_id,
        command_id: C::COMMAND_ID,
    };
    let mut payload = header.to_wire().to_vec();
    payload.extend_from_slice(&command.request_bytes());

    let frame = resolve_and_encode(
        shared,
        InfuseId::GATEWAY,
        command.auth(),
        InfuseType::RpcCmd,
        &payload,
    )?;

    shared
        .outstanding
        .lock()
        .expect("lock poisoned")
        .insert(request_id, entry);
    write_frame(shared, &frame);
    Ok(())
}

/// Originate a `security_state` exchange for `device`. The response path
/// records the keys and wakes `waiter`.
fn synthesize_handshake(
    shared: &Shared,
    device: InfuseId,
    waiter: Option<Sender<bool>>,
) -> Result<(), GatewayError> {
    let command = SecurityState::new();
    let request_id = rand::random::<u32>();
    let header = RequestHeader {
        request_id,
        command_id: SecurityState::COMMAND_ID,
    };
    let mut payload = header.to_wire().to_vec();
    payload.extend_from_slice(&command.request_bytes());

    let frame = resolve_and_encode(
        shared,
        device,
        command.auth(),
        InfuseType::RpcCmd,
        &payload,
    )?;

    shared
        .outstanding
        .lock()
        .expect("lock poisoned")
        .insert(request_id, SelfRpc::Handshake { device, waiter });
    write_frame(shared, &frame);
    Ok(())
}

/// Block the caller until `device` has a usable device key, synthesizing a
/// handshake if needed. Bounded by [`HANDSHAKE_WAIT`].
fn ensure_device_key(shared: &Shared, device: InfuseId) -> bool {
    let target = effective_target(shared, device);
    if shared
        .db
        .lock()
        .expect("lock poisoned")
        .has_public_key(target)
    {
        return true;
    }

    let (sender, receiver) = bounded(1);
    if let Err(err) = synthesize_handshake(shared, target, Some(sender)) {
        tracing::warn!(device = %target, error = %err, "Handshake synthesis failed");
        return false;
    }
    matches!(receiver.recv_timeout(HANDSHAKE_WAIT), Ok(true))
}

/// Resolve the gateway sentinel to the learned identity where possible.
fn effective_target(shared: &Shared, target: InfuseId) -> InfuseId {
    if target.is_gateway() {
        shared
            .gateway_id
            .lock()
            .expect("lock poisoned")
            .unwrap_or(target)
    } else {
        target
    }
}

/// Compute the route for `target` and produce the encrypted serial frame:
/// a single serial hop for the gateway itself, or a serial `EPACKET_FORWARD`
/// wrapping a bt_central envelope for a downstream peer.
fn resolve_and_encode(
    shared: &Shared,
    target: InfuseId,
    auth: Auth,
    ptype: InfuseType,
    payload: &[u8],
) -> Result<Vec<u8>, GatewayError> {
    let gateway_id = shared
        .gateway_id
        .lock()
        .expect("lock poisoned")
        .ok_or(GatewayError::GatewayUnknown)?;

    let mut db = shared.db.lock().expect("lock poisoned");

    if target.is_gateway() || target == gateway_id {
        let hop = HopOutput {
            infuse_id: gateway_id,
            interface: Interface::Serial,
            auth,
        };
        return Ok(packet::encode(&mut db, &hop, gateway_id, ptype, payload)?);
    }

    let addr = db
        .bt_addr_of(target)
        .ok_or(GatewayError::NoBluetoothAddress(target))?;
    let inner_hop = HopOutput {
        infuse_id: target,
        interface: Interface::BtCentral,
        auth,
    };
    let inner = packet::encode(&mut db, &inner_hop, gateway_id, ptype, payload)?;
    let forward = packet::forward_payload(
        Interface::BtCentral,
        &InterfaceAddress::BluetoothLe(addr),
        &inner,
    );
    let outer_hop = HopOutput {
        infuse_id: gateway_id,
        interface: Interface::Serial,
        auth: Auth::Network,
    };
    Ok(packet::encode(
        &mut db,
        &outer_hop,
        gateway_id,
        InfuseType::EpacketForward,
        &forward,
    )?)
}

fn write_frame(shared: &Shared, frame: &[u8]) {
    if let Err(err) = shared
        .transport
        .lock()
        .expect("lock poisoned")
        .write_frame(frame)
    {
        tracing::warn!(error = %err, "Transport write failed");
    }
}
