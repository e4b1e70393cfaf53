use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

/// A datagram channel owned by one discovery run.
///
/// `send` and `recv` may be called concurrently from the listen and
/// retransmit activities. `close` is idempotent; once closed, both return
/// errors.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<()>;

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// UDP socket joined to a multicast group, sending to that group.
pub struct MulticastChannel {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    destination: SocketAddr,
    group: Option<Ipv4Addr>,
    closed: AtomicBool,
}

impl MulticastChannel {
    /// Binds `0.0.0.0:<port>` with address reuse (other responders usually
    /// hold the port already) and joins `group` on the default interface.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(group: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create datagram socket")?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("bind multicast port {}", port))?;
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("join multicast group {}", group))?;

        let socket = UdpSocket::from_std(socket.into()).context("register socket with runtime")?;
        debug!("Joined {} on port {}", group, port);
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            destination: SocketAddrV4::new(group, port).into(),
            group: Some(group),
            closed: AtomicBool::new(false),
        })
    }

    /// Wraps an already bound socket that sends to a fixed destination.
    pub fn connected_to(socket: UdpSocket, destination: SocketAddr) -> Self {
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            destination,
            group: None,
            closed: AtomicBool::new(false),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("channel is closed"))
    }
}

#[async_trait]
impl DatagramChannel for MulticastChannel {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let socket = self.socket()?;
        socket
            .send_to(payload, self.destination)
            .await
            .with_context(|| format!("send to {}", self.destination))?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let socket = self.socket()?;
        Ok(socket.recv_from(buf).await?)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(socket), Some(group)) = (socket, self.group) {
            if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                debug!("Leaving {} failed: {}", group, e);
            }
        }
        debug!("Channel to {} closed", self.destination);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (MulticastChannel, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel = MulticastChannel::connected_to(local, peer.local_addr().unwrap());
        (channel, peer)
    }

    #[tokio::test]
    async fn sends_and_receives() {
        let (channel, peer) = loopback_pair().await;
        channel.send(b"query").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"query");

        peer.send_to(b"answer", from).await.unwrap();
        let (len, source) = channel.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"answer");
        assert_eq!(source, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn closing_twice_is_a_no_op() {
        let (channel, _peer) = loopback_pair().await;
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(channel.send(b"late").await.is_err());
        let mut buf = [0u8; 4];
        assert!(channel.recv(&mut buf).await.is_err());
    }
}
