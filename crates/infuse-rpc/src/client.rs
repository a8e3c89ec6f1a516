//! The RPC client: one outstanding request at a time, single-threaded
//! blocking around the bus socket timeout.

use std::time::{Duration, Instant};

use infuse_bus::{LocalClient, Notification, Request};
use infuse_common::{InfuseId, InfuseType, Interface};
use infuse_epacket::{HopOutput, PacketOutput, PacketReceived};

use crate::commands::RpcCommand;
use crate::wire::{DataAck, DataHeader, DataParams, RequestHeader, ResponseHeader};
use crate::RpcError;

/// Default fragments between upload ACKs.
const DEFAULT_ACK_PERIOD: u8 = 8;
/// Default deadline for responses and ACKs.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a completed RPC: the device's return code plus the parsed
/// response. Negative return codes are reported verbatim; rendering them
/// is the caller's choice (see [`crate::errno`]).
pub type RpcResult<R> = Result<(i16, R), RpcError>;

pub struct RpcClient<'a> {
    client: &'a LocalClient,
    target: InfuseId,
    /// Largest RPC_DATA payload per fragment (link MTU minus headers).
    mtu: usize,
    timeout: Duration,
    progress: Option<Box<dyn FnMut(usize) + 'a>>,
}

impl<'a> RpcClient<'a> {
    pub fn new(client: &'a LocalClient, target: InfuseId, mtu: usize) -> Self {
        Self {
            client,
            target,
            mtu,
            timeout: DEFAULT_TIMEOUT,
            progress: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Install a progress callback for bulk uploads, called with the byte
    /// offset after each fragment.
    pub fn with_progress(mut self, progress: impl FnMut(usize) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Run a standard command: send `CMD`, await the matching `RSP`.
    pub fn run<C: RpcCommand>(&mut self, command: &C) -> RpcResult<C::Response> {
        let request_id = rand::random::<u32>();
        let header = RequestHeader {
            request_id,
            command_id: C::COMMAND_ID,
        };

        let mut payload = header.to_wire().to_vec();
        payload.extend_from_slice(&command.request_bytes());
        tracing::debug!(command = C::COMMAND_ID, request = request_id, "RPC");
        self.send_packet(command, InfuseType::RpcCmd, payload)?;

        let response = self.await_event(request_id, false)?;
        finish::<C>(response)
    }

    /// Run a data-send command: announce the payload, stream it in
    /// MTU-sized fragments pausing for `DATA_ACK` every `ack_period`
    /// fragments, then await the response.
    pub fn run_data_send<C: RpcCommand>(
        &mut self,
        command: &C,
        data: &[u8],
    ) -> RpcResult<C::Response> {
        let request_id = rand::random::<u32>();
        let header = RequestHeader {
            request_id,
            command_id: C::COMMAND_ID,
        };
        let params = DataParams {
            size: data.len() as u32,
            rx_ack_period: DEFAULT_ACK_PERIOD,
        };

        let mut payload = header.to_wire().to_vec();
        payload.extend_from_slice(&params.to_wire());
        payload.extend_from_slice(&command.request_bytes());
        tracing::debug!(
            command = C::COMMAND_ID,
            request = request_id,
            bytes = data.len(),
            "RPC data upload"
        );
        self.send_packet(command, InfuseType::RpcCmd, payload)?;

        // The device signals readiness with an initial ACK.
        if let Some(response) = self.await_event(request_id, true)? {
            // Early response: the device rejected the transfer up front.
            return finish::<C>(Some(response));
        }

        let mut since_ack = 0u32;
        let mut offset = 0usize;
        for chunk in data.chunks(self.mtu.max(1)) {
            let mut fragment = DataHeader {
                request_id,
                offset: offset as u32,
            }
            .to_wire()
            .to_vec();
            fragment.extend_from_slice(chunk);
            self.send_packet(command, InfuseType::RpcData, fragment)?;

            offset += chunk.len();
            if let Some(progress) = self.progress.as_mut() {
                progress(offset);
            }

            since_ack += 1;
            if u32::from(DEFAULT_ACK_PERIOD) == since_ack && offset < data.len() {
                // Block for the pacing ACK; the counter resets after each.
                if let Some(response) = self.await_event(request_id, true)? {
                    return finish::<C>(Some(response));
                }
                since_ack = 0;
            }
        }

        let response = self.await_event(request_id, false)?;
        finish::<C>(response)
    }

    /// Run a data-receive command: declare an unknown expected size, then
    /// reassemble `DATA` fragments by offset until the response closes the
    /// stream.
    pub fn run_data_recv<C: RpcCommand>(
        &mut self,
        command: &C,
    ) -> Result<(i16, C::Response, Vec<u8>), RpcError> {
        let request_id = rand::random::<u32>();
        let header = RequestHeader {
            request_id,
            command_id: C::COMMAND_ID,
        };
        let params = DataParams {
            size: DataParams::SIZE_UNKNOWN,
            rx_ack_period: DEFAULT_ACK_PERIOD,
        };

        let mut payload = header.to_wire().to_vec();
        payload.extend_from_slice(&params.to_wire());
        payload.extend_from_slice(&command.request_bytes());
        self.send_packet(command, InfuseType::RpcCmd, payload)?;

        let mut stream = Vec::new();
        let mut fragments = 0u32;
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_packet(deadline)? {
                RpcEvent::Data { offset, data } => {
                    let end = offset as usize + data.len();
                    if stream.len() < end {
                        stream.resize(end, 0);
                    }
                    stream[offset as usize..end].copy_from_slice(&data);

                    fragments += 1;
                    if fragments % u32::from(DEFAULT_ACK_PERIOD) == 0 {
                        let ack = DataAck {
                            request_id,
                            offset: stream.len() as u32,
                        };
                        self.send_packet(
                            command,
                            InfuseType::RpcDataAck,
                            ack.to_wire().to_vec(),
                        )?;
                    }
                }
                RpcEvent::Response { header, payload } if header.request_id == request_id => {
                    let response =
                        C::parse_response(&payload).ok_or(RpcError::MalformedResponse)?;
                    return Ok((header.return_code, response, stream));
                }
                _ => {}
            }
        }
    }

    fn send_packet<C: RpcCommand>(
        &self,
        command: &C,
        ptype: InfuseType,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        let packet = PacketOutput {
            route: vec![HopOutput {
                infuse_id: self.target,
                interface: Interface::Serial,
                auth: command.auth(),
            }],
            ptype,
            payload,
        };
        self.client.send(&Request::EpacketSend(packet))?;
        Ok(())
    }

    /// Wait for either the final response or (when `accept_ack`) a pacing
    /// ACK for `request_id`. `Some` carries the response; `None` means the
    /// awaited ACK arrived first.
    #[allow(clippy::type_complexity)]
    fn await_event(
        &mut self,
        request_id: u32,
        accept_ack: bool,
    ) -> Result<Option<(ResponseHeader, Vec<u8>)>, RpcError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_packet(deadline)? {
                RpcEvent::Response { header, payload } if header.request_id == request_id => {
                    return Ok(Some((header, payload)));
                }
                RpcEvent::Ack { ack } if accept_ack && ack.request_id == request_id => {
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    /// Pull the next RPC-relevant packet off the bus, enforcing `deadline`
    /// and surfacing a dropped connection as an abort.
    fn next_packet(&self, deadline: Instant) -> Result<RpcEvent, RpcError> {
        loop {
            if Instant::now() >= deadline {
                return Err(RpcError::Timeout);
            }
            let Some(notification) = self.client.receive()? else {
                continue;
            };
            match notification {
                Notification::ConnectionDropped { id } if id == self.target => {
                    return Err(RpcError::ConnectionAborted(id));
                }
                Notification::EpacketReceived(packet) => {
                    if let Some(event) = classify(&packet) {
                        return Ok(event);
                    }
                }
                _ => {}
            }
        }
    }
}

enum RpcEvent {
    Response {
        header: ResponseHeader,
        payload: Vec<u8>,
    },
    Ack {
        ack: DataAck,
    },
    Data {
        offset: u32,
        data: Vec<u8>,
    },
}

fn classify(packet: &PacketReceived) -> Option<RpcEvent> {
    match packet.ptype {
        InfuseType::RpcRsp => {
            let header = ResponseHeader::parse(&packet.payload)?;
            Some(RpcEvent::Response {
                header,
                payload: packet.payload[ResponseHeader::WIRE_LEN..].to_vec(),
            })
        }
        InfuseType::RpcDataAck => {
            let ack = DataAck::parse(&packet.payload)?;
            Some(RpcEvent::Ack { ack })
        }
        InfuseType::RpcData => {
            let header = DataHeader::parse(&packet.payload)?;
            Some(RpcEvent::Data {
                offset: header.offset,
                data: packet.payload[DataHeader::WIRE_LEN..].to_vec(),
            })
        }
        _ => None,
    }
}

fn finish<C: RpcCommand>(
    response: Option<(ResponseHeader, Vec<u8>)>,
) -> RpcResult<C::Response> {
    let (header, payload) = response.ok_or(RpcError::MalformedResponse)?;
    let parsed = C::parse_response(&payload).ok_or(RpcError::MalformedResponse)?;
    Ok((header.return_code, parsed))
}
