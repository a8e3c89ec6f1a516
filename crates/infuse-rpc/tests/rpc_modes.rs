//! The three RPC modes exercised against a scripted gateway stub on the bus.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use infuse_bus::{LocalClient, LocalServer, Notification, Request};
use infuse_common::{Auth, InfuseId, InfuseType, Interface, InterfaceAddress};
use infuse_epacket::{HopReceived, PacketReceived};
use infuse_rpc::wire::{DataAck, DataHeader, DataParams, RequestHeader, ResponseHeader};
use infuse_rpc::{FileAction, FileWriteBasic, RpcClient, SecurityState};

const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
const GATEWAY: InfuseId = InfuseId(0x0102_0304_0506_0708);

/// Wrap an RPC payload as a decoded packet from the gateway.
fn from_gateway(ptype: InfuseType, payload: Vec<u8>) -> Notification {
    Notification::EpacketReceived(PacketReceived {
        route: vec![HopReceived {
            infuse_id: GATEWAY,
            interface: Interface::Serial,
            interface_address: InterfaceAddress::Serial,
            auth: Auth::Network,
            key_id: 0,
            gps_time: 0,
            sequence: 0,
            rssi: 0,
        }],
        ptype,
        payload,
    })
}

fn recv_cmd(server: &LocalServer) -> (InfuseType, Vec<u8>) {
    for _ in 0..50 {
        if let Some(Request::EpacketSend(pkt)) = server.receive().unwrap() {
            return (pkt.ptype, pkt.payload);
        }
    }
    panic!("no packet from client");
}

#[test]
fn standard_mode_matches_request_id() {
    let port = 28801;
    let server = LocalServer::bind(GROUP, port).unwrap();
    let client = LocalClient::connect(GROUP, port, Duration::from_millis(200)).unwrap();

    let stub = thread::spawn(move || {
        let (ptype, payload) = recv_cmd(&server);
        assert_eq!(ptype, InfuseType::RpcCmd);
        let header = RequestHeader::parse(&payload).unwrap();
        assert_eq!(header.command_id, 30_000);
        // Challenge follows the header.
        assert_eq!(payload.len(), RequestHeader::WIRE_LEN + 16);

        // A response for a different request id must be ignored.
        let mut wrong = ResponseHeader {
            request_id: header.request_id.wrapping_add(1),
            command_id: 30_000,
            return_code: -5,
        }
        .to_wire()
        .to_vec();
        wrong.extend_from_slice(&[0u8; 137]);
        server.broadcast(&from_gateway(InfuseType::RpcRsp, wrong)).unwrap();

        let mut rsp = ResponseHeader {
            request_id: header.request_id,
            command_id: 30_000,
            return_code: 0,
        }
        .to_wire()
        .to_vec();
        rsp.extend_from_slice(&[0x11u8; 32]); // cloud key
        rsp.extend_from_slice(&[0x22u8; 32]); // device key
        rsp.extend_from_slice(&0x00AB_CDEFu32.to_le_bytes());
        rsp.push(0);
        rsp.extend_from_slice(&[0x33u8; 68]);
        server.broadcast(&from_gateway(InfuseType::RpcRsp, rsp)).unwrap();
    });

    let mut rpc = RpcClient::new(&client, GATEWAY, 244).with_timeout(Duration::from_secs(5));
    let (return_code, response) = rpc.run(&SecurityState::new()).unwrap();

    assert_eq!(return_code, 0);
    assert_eq!(response.cloud_public_key, [0x11; 32]);
    assert_eq!(response.device_public_key, [0x22; 32]);
    assert_eq!(response.network_id, 0x00AB_CDEF);
    stub.join().unwrap();
}

#[test]
fn data_send_paces_on_acks() {
    let port = 28811;
    let server = LocalServer::bind(GROUP, port).unwrap();
    let client = LocalClient::connect(GROUP, port, Duration::from_millis(200)).unwrap();
    let (fragments_tx, fragments_rx) = mpsc::channel::<(u32, Vec<u8>)>();

    let payload: Vec<u8> = (0u8..100).collect();
    let expected = payload.clone();

    let stub = thread::spawn(move || {
        let (ptype, cmd) = recv_cmd(&server);
        assert_eq!(ptype, InfuseType::RpcCmd);
        let header = RequestHeader::parse(&cmd).unwrap();
        assert_eq!(header.command_id, 20);
        let params = DataParams::parse(&cmd[RequestHeader::WIRE_LEN..]).unwrap();
        assert_eq!(params.size, 100);
        let ack_period = u32::from(params.rx_ack_period);

        // Ready to receive.
        let ack = DataAck { request_id: header.request_id, offset: 0 };
        server
            .broadcast(&from_gateway(InfuseType::RpcDataAck, ack.to_wire().to_vec()))
            .unwrap();

        let mut received = 0u32;
        let mut total = 0usize;
        while total < 100 {
            let (ptype, frag) = recv_cmd(&server);
            assert_eq!(ptype, InfuseType::RpcData);
            let data_header = DataHeader::parse(&frag).unwrap();
            assert_eq!(data_header.request_id, header.request_id);
            let chunk = frag[DataHeader::WIRE_LEN..].to_vec();
            assert_eq!(data_header.offset as usize, total);
            total += chunk.len();
            fragments_tx.send((data_header.offset, chunk)).unwrap();

            received += 1;
            if received % ack_period == 0 && total < 100 {
                let ack = DataAck {
                    request_id: header.request_id,
                    offset: total as u32,
                };
                server
                    .broadcast(&from_gateway(InfuseType::RpcDataAck, ack.to_wire().to_vec()))
                    .unwrap();
            }
        }

        let rsp = ResponseHeader {
            request_id: header.request_id,
            command_id: 20,
            return_code: 0,
        };
        server
            .broadcast(&from_gateway(InfuseType::RpcRsp, rsp.to_wire().to_vec()))
            .unwrap();
    });

    let mut last_progress = 0usize;
    {
        let mut rpc = RpcClient::new(&client, GATEWAY, 10)
            .with_timeout(Duration::from_secs(5))
            .with_progress(|offset| last_progress = offset);
        let command = FileWriteBasic {
            action: FileAction::AppCpatch,
            crc: crc_of(&payload),
        };
        let (return_code, ()) = rpc.run_data_send(&command, &payload).unwrap();
        assert_eq!(return_code, 0);
    }
    assert_eq!(last_progress, 100);

    // Reassemble what the stub saw and compare to the original payload.
    stub.join().unwrap();
    let mut seen = vec![0u8; 100];
    let mut count = 0;
    while let Ok((offset, chunk)) = fragments_rx.try_recv() {
        seen[offset as usize..offset as usize + chunk.len()].copy_from_slice(&chunk);
        count += 1;
    }
    assert_eq!(count, 10, "100 bytes at mtu 10");
    assert_eq!(seen, expected);
}

fn crc_of(data: &[u8]) -> u32 {
    // Stand-in checksum; the stub does not validate it.
    data.iter().map(|&b| u32::from(b)).sum()
}

#[test]
fn data_recv_reassembles_by_offset() {
    let port = 28821;
    let server = LocalServer::bind(GROUP, port).unwrap();
    let client = LocalClient::connect(GROUP, port, Duration::from_millis(200)).unwrap();

    let stub = thread::spawn(move || {
        let (_, cmd) = recv_cmd(&server);
        let header = RequestHeader::parse(&cmd).unwrap();
        let params = DataParams::parse(&cmd[RequestHeader::WIRE_LEN..]).unwrap();
        assert_eq!(params.size, DataParams::SIZE_UNKNOWN);

        // Three fragments, sent in order.
        for (offset, chunk) in [(0u32, b"hello ".as_slice()), (6, b"infuse "), (13, b"world")] {
            let mut frag = DataHeader {
                request_id: header.request_id,
                offset,
            }
            .to_wire()
            .to_vec();
            frag.extend_from_slice(chunk);
            server
                .broadcast(&from_gateway(InfuseType::RpcData, frag))
                .unwrap();
        }

        let rsp = ResponseHeader {
            request_id: header.request_id,
            command_id: 51,
            return_code: 0,
        };
        server
            .broadcast(&from_gateway(InfuseType::RpcRsp, rsp.to_wire().to_vec()))
            .unwrap();
    });

    use infuse_common::{BtAddr, BtAddrKind};
    let mut rpc = RpcClient::new(&client, GATEWAY, 244).with_timeout(Duration::from_secs(5));
    let command = infuse_rpc::BtDisconnect {
        peer: BtAddr::new(BtAddrKind::Public, 1),
    };
    let (return_code, (), stream) = rpc.run_data_recv(&command).unwrap();

    assert_eq!(return_code, 0);
    assert_eq!(stream, b"hello infuse world");
    stub.join().unwrap();
}

#[test]
fn dropped_connection_aborts_rpc() {
    let port = 28831;
    let server = LocalServer::bind(GROUP, port).unwrap();
    let client = LocalClient::connect(GROUP, port, Duration::from_millis(200)).unwrap();

    let stub = thread::spawn(move || {
        let (_, _) = recv_cmd(&server);
        server
            .broadcast(&Notification::ConnectionDropped { id: GATEWAY })
            .unwrap();
    });

    let mut rpc = RpcClient::new(&client, GATEWAY, 244).with_timeout(Duration::from_secs(5));
    let result = rpc.run(&SecurityState::new());
    assert!(matches!(
        result,
        Err(infuse_rpc::RpcError::ConnectionAborted(id)) if id == GATEWAY
    ));
    stub.join().unwrap();
}
