//! Bus message envelopes.
//!
//! Both unions are JSON objects tagged by an integer `type` field, with the
//! variant payload in optional sibling fields. Binary data inside packets is
//! base64 (handled by the packet serializers).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use infuse_common::InfuseId;
use infuse_epacket::{PacketOutput, PacketReceived};

bitflags! {
    /// GATT characteristics a client wants subscribed on a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataTypes: u8 {
        const COMMAND = 1 << 0;
        const DATA    = 1 << 1;
        const LOGGING = 1 << 2;
    }
}

/// Server → client broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NotificationWire", into = "NotificationWire")]
pub enum Notification {
    /// An ePacket was received and decoded by the gateway.
    EpacketReceived(PacketReceived),
    /// A requested connection could not be established.
    ConnectionFailed { id: InfuseId },
    /// A requested connection is up; `mtu` is the largest payload one
    /// bus-submitted packet may carry over it.
    ConnectionCreated { id: InfuseId, mtu: usize },
    /// An established connection went away.
    ConnectionDropped { id: InfuseId },
}

const NOTIFY_EPACKET_RECV: u8 = 0;
const NOTIFY_CONNECTION_FAILED: u8 = 1;
const NOTIFY_CONNECTION_CREATED: u8 = 2;
const NOTIFY_CONNECTION_DROPPED: u8 = 3;

#[derive(Serialize, Deserialize)]
struct NotificationWire {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    epacket: Option<PacketReceived>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<usize>,
}

impl From<Notification> for NotificationWire {
    fn from(notification: Notification) -> Self {
        let mut wire = NotificationWire {
            kind: 0,
            epacket: None,
            id: None,
            mtu: None,
        };
        match notification {
            Notification::EpacketReceived(pkt) => {
                wire.kind = NOTIFY_EPACKET_RECV;
                wire.epacket = Some(pkt);
            }
            Notification::ConnectionFailed { id } => {
                wire.kind = NOTIFY_CONNECTION_FAILED;
                wire.id = Some(id.0);
            }
            Notification::ConnectionCreated { id, mtu } => {
                wire.kind = NOTIFY_CONNECTION_CREATED;
                wire.id = Some(id.0);
                wire.mtu = Some(mtu);
            }
            Notification::ConnectionDropped { id } => {
                wire.kind = NOTIFY_CONNECTION_DROPPED;
                wire.id = Some(id.0);
            }
        }
        wire
    }
}

impl TryFrom<NotificationWire> for Notification {
    type Error = String;

    fn try_from(wire: NotificationWire) -> Result<Self, Self::Error> {
        let id = || {
            wire.id
                .map(InfuseId)
                .ok_or_else(|| "missing connection id".to_string())
        };
        match wire.kind {
            NOTIFY_EPACKET_RECV => wire
                .epacket
                .map(Notification::EpacketReceived)
                .ok_or_else(|| "missing epacket".into()),
            NOTIFY_CONNECTION_FAILED => Ok(Notification::ConnectionFailed { id: id()? }),
            NOTIFY_CONNECTION_CREATED => Ok(Notification::ConnectionCreated {
                id: id()?,
                mtu: wire.mtu.ok_or_else(|| "missing mtu".to_string())?,
            }),
            NOTIFY_CONNECTION_DROPPED => Ok(Notification::ConnectionDropped { id: id()? }),
            other => Err(format!("unknown notification type {other}")),
        }
    }
}

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RequestWire", into = "RequestWire")]
pub enum Request {
    /// Encode and transmit a packet.
    EpacketSend(PacketOutput),
    /// Establish a downstream connection to `id`.
    ConnectionRequest { id: InfuseId, data_types: DataTypes },
    /// Release a previously requested connection. Idempotent.
    ConnectionRelease { id: InfuseId },
}

const REQUEST_EPACKET_SEND: u8 = 0;
const REQUEST_CONNECTION_REQUEST: u8 = 1;
const REQUEST_CONNECTION_RELEASE: u8 = 2;

#[derive(Serialize, Deserialize)]
struct RequestWire {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    epacket: Option<PacketOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_types: Option<u8>,
}

impl From<Request> for RequestWire {
    fn from(request: Request) -> Self {
        let mut wire = RequestWire {
            kind: 0,
            epacket: None,
            id: None,
            data_types: None,
        };
        match request {
            Request::EpacketSend(pkt) => {
                wire.kind = REQUEST_EPACKET_SEND;
                wire.epacket = Some(pkt);
            }
            Request::ConnectionRequest { id, data_types } => {
                wire.kind = REQUEST_CONNECTION_REQUEST;
                wire.id = Some(id.0);
                wire.data_types = Some(data_types.bits());
            }
            Request::ConnectionRelease { id } => {
                wire.kind = REQUEST_CONNECTION_RELEASE;
                wire.id = Some(id.0);
            }
        }
        wire
    }
}

impl TryFrom<RequestWire> for Request {
    type Error = String;

    fn try_from(wire: RequestWire) -> Result<Self, Self::Error> {
        let id = || {
            wire.id
                .map(InfuseId)
                .ok_or_else(|| "missing connection id".to_string())
        };
        match wire.kind {
            REQUEST_EPACKET_SEND => wire
                .epacket
                .map(Request::EpacketSend)
                .ok_or_else(|| "missing epacket".into()),
            REQUEST_CONNECTION_REQUEST => Ok(Request::ConnectionRequest {
                id: id()?,
                data_types: DataTypes::from_bits_retain(
                    wire.data_types.ok_or_else(|| "missing data_types".to_string())?,
                ),
            }),
            REQUEST_CONNECTION_RELEASE => Ok(Request::ConnectionRelease { id: id()? }),
            other => Err(format!("unknown request type {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infuse_common::{Auth, InfuseType, Interface};
    use infuse_epacket::HopOutput;

    #[test]
    fn notification_json_round_trips() {
        let cases = [
            Notification::ConnectionFailed { id: InfuseId(5) },
            Notification::ConnectionCreated { id: InfuseId(5), mtu: 244 },
            Notification::ConnectionDropped { id: InfuseId(5) },
        ];
        for case in cases {
            let json = serde_json::to_string(&case).unwrap();
            let back: Notification = serde_json::from_str(&json).unwrap();
            assert_eq!(back, case);
        }
    }

    #[test]
    fn notification_type_tags_are_stable() {
        let json =
            serde_json::to_value(Notification::ConnectionDropped { id: InfuseId(1) }).unwrap();
        assert_eq!(json["type"], 3);
        assert_eq!(json["id"], 1);

        let json = serde_json::to_value(Notification::ConnectionCreated {
            id: InfuseId(2),
            mtu: 200,
        })
        .unwrap();
        assert_eq!(json["type"], 2);
        assert_eq!(json["mtu"], 200);
    }

    #[test]
    fn request_json_round_trips() {
        let send = Request::EpacketSend(PacketOutput {
            route: vec![HopOutput {
                infuse_id: InfuseId::GATEWAY,
                interface: Interface::Serial,
                auth: Auth::Network,
            }],
            ptype: InfuseType::EchoReq,
            payload: b"hello".to_vec(),
        });
        let json = serde_json::to_string(&send).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, send);

        let connect = Request::ConnectionRequest {
            id: InfuseId(9),
            data_types: DataTypes::COMMAND | DataTypes::DATA,
        };
        let json = serde_json::to_value(&connect).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["data_types"], 3);
        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, connect);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(serde_json::from_str::<Notification>(r#"{"type": 99}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"type": 7}"#).is_err());
    }
}
