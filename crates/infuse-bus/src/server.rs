//! Gateway-side bus endpoint.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::messages::{Notification, Request};
use crate::{BusError, MAX_DATAGRAM};

/// How long a `receive` call blocks before reporting "no message".
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);

/// The gateway's end of the bus: broadcasts notifications to the multicast
/// group and drains client requests from the loopback unicast socket.
pub struct LocalServer {
    output: UdpSocket,
    output_addr: SocketAddr,
    input: UdpSocket,
}

impl LocalServer {
    /// Bind the request socket on `port + 1` and prepare the multicast
    /// sender for `group:port`.
    pub fn bind(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let output = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        output.set_multicast_ttl_v4(2)?;
        // Subscribers on this host must see our datagrams.
        output.set_multicast_loop_v4(true)?;
        let output_addr = SocketAddr::V4(SocketAddrV4::new(group, port));

        let input = UdpSocket::bind((Ipv4Addr::LOCALHOST, port + 1))?;
        input.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        tracing::debug!(%output_addr, request_port = port + 1, "Bus server bound");
        Ok(Self {
            output,
            output_addr,
            input,
        })
    }

    /// Broadcast a notification to every subscribed client. Best effort.
    pub fn broadcast(&self, notification: &Notification) -> Result<(), BusError> {
        let encoded = serde_json::to_vec(notification).expect("notifications serialize");
        if encoded.len() > MAX_DATAGRAM {
            tracing::warn!(bytes = encoded.len(), "Dropping oversized notification");
            return Ok(());
        }
        self.output.send_to(&encoded, self.output_addr)?;
        Ok(())
    }

    /// Receive one client request. `Ok(None)` on timeout or on a malformed
    /// datagram (logged and dropped).
    pub fn receive(&self) -> Result<Option<Request>, BusError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, peer) = match self.input.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Request>(&buf[..len]) {
            Ok(request) => Ok(Some(request)),
            Err(err) => {
                tracing::warn!(%peer, error = %err, "Dropping malformed bus request");
                Ok(None)
            }
        }
    }
}
