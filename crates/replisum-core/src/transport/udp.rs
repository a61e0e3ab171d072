use super::Transport;
use crate::protocol::{MAX_DATAGRAM_SIZE, Message};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// UDP transport, one datagram per message
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_timeout: Duration,
    closed: AtomicBool,
    /// Receive buffer reused across polls
    buf: Mutex<Vec<u8>>,
}

impl UdpTransport {
    /// Bind a socket on `addr`
    pub async fn bind(addr: SocketAddr, recv_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        tracing::debug!("Replication socket bound on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            recv_timeout,
            closed: AtomicBool::new(false),
            buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let bytes = msg.encode()?;
        let sent = self.socket.send_to(&bytes, addr).await?;
        if sent != bytes.len() {
            return Err(Error::transport(format!(
                "Short send to {}: {} of {} bytes",
                addr,
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(Message, SocketAddr)>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let mut buf = self.buf.lock().await;
        match tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf[..])).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((n, from))) => {
                let msg = Message::decode(&buf[..n])?;
                Ok(Some((msg, from)))
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
