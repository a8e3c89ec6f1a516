//! Client-side bus endpoint and the scoped connection helper.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use infuse_common::InfuseId;

use crate::messages::{DataTypes, Notification, Request};
use crate::{BusError, MAX_DATAGRAM};

/// How long `connection` waits for the gateway's CREATED/FAILED verdict.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A bus subscriber: joins the multicast group for notifications and sends
/// requests to the gateway's loopback socket.
pub struct LocalClient {
    input: UdpSocket,
    output: UdpSocket,
    output_addr: SocketAddr,
}

impl LocalClient {
    pub fn connect(group: Ipv4Addr, port: u16, rx_timeout: Duration) -> io::Result<Self> {
        // Several clients share the multicast port on one host, so the
        // listening socket needs address reuse before bind. std sockets
        // cannot express that, socket2 can.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        let input: UdpSocket = socket.into();
        input.set_read_timeout(Some(rx_timeout))?;

        let output = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let output_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port + 1));

        Ok(Self {
            input,
            output,
            output_addr,
        })
    }

    pub fn set_rx_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.input.set_read_timeout(Some(timeout))
    }

    /// Send a request to the gateway.
    pub fn send(&self, request: &Request) -> Result<(), BusError> {
        let encoded = serde_json::to_vec(request).expect("requests serialize");
        self.output.send_to(&encoded, self.output_addr)?;
        Ok(())
    }

    /// Receive one notification. `Ok(None)` on timeout or on a malformed
    /// datagram.
    pub fn receive(&self) -> Result<Option<Notification>, BusError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = match self.input.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Notification>(&buf[..len]) {
            Ok(notification) => Ok(Some(notification)),
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed bus notification");
                Ok(None)
            }
        }
    }

    /// Acquire a connection to `id` for the duration of the returned scope.
    ///
    /// Sends the CONNECTION_REQUEST and waits for exactly one CREATED or
    /// FAILED verdict; FAILED surfaces as [`BusError::ConnectionRefused`].
    /// The returned handle releases the connection when dropped, on every
    /// exit path.
    pub fn connection(
        &self,
        id: InfuseId,
        data_types: DataTypes,
    ) -> Result<Connection<'_>, BusError> {
        self.send(&Request::ConnectionRequest { id, data_types })?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while Instant::now() < deadline {
            match self.receive()? {
                Some(Notification::ConnectionCreated { id: created, mtu }) if created == id => {
                    tracing::debug!(device = %id, mtu, "Connection created");
                    return Ok(Connection {
                        client: self,
                        id,
                        mtu,
                        released: false,
                    });
                }
                Some(Notification::ConnectionFailed { id: failed }) if failed == id => {
                    return Err(BusError::ConnectionRefused(id));
                }
                // Unrelated traffic while waiting.
                Some(_) | None => {}
            }
        }
        // The request may still be in flight; release defensively so the
        // gateway does not hold the slot.
        let _ = self.send(&Request::ConnectionRelease { id });
        Err(BusError::ConnectionTimeout(id))
    }
}

/// Scoped handle to a gateway-managed connection.
///
/// Exactly one CONNECTION_RELEASE is sent when the scope ends, whether by
/// [`release`](Self::release) or by drop.
pub struct Connection<'a> {
    client: &'a LocalClient,
    id: InfuseId,
    mtu: usize,
    released: bool,
}

impl Connection<'_> {
    pub fn id(&self) -> InfuseId {
        self.id
    }

    /// Largest payload one packet may carry over this connection.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn client(&self) -> &LocalClient {
        self.client
    }

    /// Explicitly release the connection.
    pub fn release(mut self) -> Result<(), BusError> {
        self.send_release()
    }

    fn send_release(&mut self) -> Result<(), BusError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.client.send(&Request::ConnectionRelease { id: self.id })
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.send_release() {
            tracing::warn!(device = %self.id, error = %err, "Connection release failed");
        }
    }
}
