use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

/// Abstraction over the multicast group socket, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait McastSocket: Send + Sync + 'static {
    /// multicast one datagram to the group
    async fn send_datagram(&self, packet_buf: &[u8]);

    /// receive the next datagram from the group
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// The UDP multicast group socket. Multicast loopback is disabled: a writer's
///  own datagrams are delivered locally by the connection itself, not by the
///  network stack.
pub struct UdpMcastSocket {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpMcastSocket {
    pub async fn join(group: SocketAddrV4, interface: Ipv4Addr) -> anyhow::Result<UdpMcastSocket> {
        if !group.ip().is_multicast() {
            anyhow::bail!("{} is not a multicast address", group.ip());
        }

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())?;
        raw.join_multicast_v4(group.ip(), &interface)?;
        raw.set_multicast_loop_v4(false)?;

        let socket = UdpSocket::from_std(raw.into())?;
        info!("joined multicast group {}", group);

        Ok(UdpMcastSocket {
            socket,
            group: SocketAddr::V4(group),
        })
    }
}

#[async_trait]
impl McastSocket for UdpMcastSocket {
    async fn send_datagram(&self, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {}", packet_buf.len(), self.group);

        if let Err(e) = self.socket.send_to(packet_buf, self.group).await {
            error!("error sending UDP datagram to {}: {}", self.group, e);
        }
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (num_read, _from) = self.socket.recv_from(buf).await?;
        Ok(num_read)
    }
}
