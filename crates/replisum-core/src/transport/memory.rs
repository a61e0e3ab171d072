//! In-process datagram network for tests and demos.
//!
//! Endpoints exchange encoded frames through unbounded channels, so every
//! message goes through the real codec. Links can be cut per pair of
//! addresses, whole endpoints can be isolated, and a drop probability
//! simulates lossy links.

use super::Transport;
use crate::protocol::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

type Frame = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Frame>>>,
    /// Directed links (from, to) that drop everything
    cut_links: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
    isolated: Mutex<HashSet<SocketAddr>>,
    drop_probability: Mutex<f64>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl NetworkInner {
    fn deliver(&self, from: SocketAddr, to: SocketAddr, frame: Vec<u8>) {
        let blocked = {
            let isolated = self.isolated.lock();
            isolated.contains(&from) || isolated.contains(&to)
        } || self.cut_links.lock().contains(&(from, to));

        let p = *self.drop_probability.lock();
        let lost = p > 0.0 && rand::random::<f64>() < p;

        if blocked || lost {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sender = self.endpoints.lock().get(&to).cloned();
        match sender {
            Some(tx) if tx.send((frame, from)).is_ok() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            // nobody listening, like an unreachable UDP port
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`
    pub fn bind(&self, addr: SocketAddr, recv_timeout: Duration) -> Result<MemoryTransport> {
        let mut endpoints = self.inner.endpoints.lock();
        if endpoints.contains_key(&addr) {
            return Err(Error::transport(format!("Address {} already in use", addr)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(addr, tx);

        Ok(MemoryTransport {
            addr,
            recv_timeout,
            network: self.inner.clone(),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Cut the link between `a` and `b` in both directions
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut cut = self.inner.cut_links.lock();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Restore the link between `a` and `b`
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut cut = self.inner.cut_links.lock();
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    /// Drop all traffic from and to `addr`
    pub fn isolate(&self, addr: SocketAddr) {
        self.inner.isolated.lock().insert(addr);
    }

    /// Undo [`MemoryNetwork::isolate`]
    pub fn reconnect(&self, addr: SocketAddr) {
        self.inner.isolated.lock().remove(&addr);
    }

    /// Restore every link and endpoint
    pub fn heal_all(&self) {
        self.inner.cut_links.lock().clear();
        self.inner.isolated.lock().clear();
    }

    /// Probability in `[0, 1]` that any datagram is lost
    pub fn set_drop_probability(&self, p: f64) {
        *self.inner.drop_probability.lock() = p.clamp(0.0, 1.0);
    }

    /// Datagrams delivered so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Datagrams dropped so far (faults, loss, or no receiver)
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// One endpoint of a [`MemoryNetwork`]
pub struct MemoryTransport {
    addr: SocketAddr,
    recv_timeout: Duration,
    network: Arc<NetworkInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_to(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let frame = msg.encode()?;
        self.network.deliver(self.addr, addr, frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(Message, SocketAddr)>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(self.recv_timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::Shutdown),
            Ok(Some((frame, from))) => {
                let msg = Message::decode(&frame)?;
                Ok(Some((msg, from)))
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the sender wakes a pending recv
        self.network.endpoints.lock().remove(&self.addr);
    }
}
