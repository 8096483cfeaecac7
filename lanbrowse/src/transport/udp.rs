use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use shared::protocol::MAX_DATAGRAM_SIZE;
use crate::config::TransportConfig;
use crate::error::TransportError;
use super::{Datagram, Groups, Inbound, Membership, Transport};

struct UdpGroup {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Multicast UDP transport on one IPv4 interface
pub struct UdpTransport {
    config: TransportConfig,
    groups: Groups<UdpGroup>,
}

impl UdpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            groups: Groups::new(),
        }
    }

    fn open(&self, group: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // other responders on the host hold 5353 too
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        if let Some(size) = self.config.recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                tracing::warn!("Failed to set receive buffer to {} bytes: {}", size, e);
            }
        }

        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
        socket.bind(&bind.into())?;
        socket.join_multicast_v4(group.ip(), &self.config.interface)?;
        socket.set_multicast_if_v4(&self.config.interface)?;
        socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
        socket.set_multicast_loop_v4(self.config.multicast_loop)?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into())
    }
}

/// Reads the shared socket until it fails, publishing to every member
async fn read_loop(socket: Arc<UdpSocket>, group: SocketAddrV4, inbound: broadcast::Sender<Inbound>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, source)) => {
                tracing::trace!(%group, %source, len, "Datagram received");
                let datagram = Datagram {
                    bytes: Arc::from(&buffer[..len]),
                    source,
                };
                // no members left is fine; the group is being torn down
                let _ = inbound.send(Inbound::Datagram(datagram));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // ICMP port unreachable from an earlier send on some platforms
                tracing::debug!(%group, "Ignoring connection reset on multicast socket");
            }
            Err(e) => {
                tracing::error!(%group, "Multicast socket receive failed: {}", e);
                let _ = inbound.send(Inbound::Failed(e.to_string()));
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn join(&self, group: SocketAddrV4) -> Result<Membership, TransportError> {
        let membership = self.groups.attach(group, |inbound| {
            let socket = Arc::new(self.open(group).map_err(TransportError::Unavailable)?);
            let reader = tokio::spawn(read_loop(socket.clone(), group, inbound));
            tracing::info!(%group, interface = %self.config.interface, "Joined multicast group");
            Ok(UdpGroup { socket, reader })
        })?;

        tracing::debug!(%group, member = membership.id(), "Membership attached");
        Ok(membership)
    }

    async fn send(&self, membership: &Membership, bytes: &[u8]) -> Result<(), TransportError> {
        let group = membership.group();
        let socket = self
            .groups
            .with(group, |g| g.socket.clone())
            .ok_or(TransportError::Closed)?;

        socket
            .send_to(bytes, SocketAddr::V4(group))
            .await
            .map_err(TransportError::SendFailed)?;
        Ok(())
    }

    async fn leave(&self, membership: Membership) {
        let group = membership.group();
        let Some(udp) = self.groups.detach(membership) else {
            return;
        };

        udp.reader.abort();
        if let Err(e) = udp.socket.leave_multicast_v4(*group.ip(), self.config.interface) {
            tracing::warn!(%group, "Failed to leave multicast group: {}", e);
        }
        tracing::info!(%group, "Left multicast group");
    }
}
