//! Datagram transports
//!
//! The replication protocol only needs unreliable, unordered, best-effort
//! delivery of single datagrams. [`UdpTransport`] provides that over the
//! network; [`MemoryNetwork`] provides it in-process with fault injection.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

use crate::Result;
use crate::protocol::Message;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Best-effort datagram transport for replication messages
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address peers should send to
    fn local_addr(&self) -> SocketAddr;

    /// Send one message to `addr`. Delivery is not guaranteed.
    async fn send_to(&self, msg: &Message, addr: SocketAddr) -> Result<()>;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the bounded receive timeout elapses, a codec
    /// error for a corrupt datagram, and [`crate::Error::Shutdown`] once the
    /// transport is closed.
    async fn recv(&self) -> Result<Option<(Message, SocketAddr)>>;

    /// Close the transport; pending and future receives fail
    fn close(&self);
}
