//! Replisum Server - one accumulator node with a client endpoint
//!
//! Loads layered configuration, starts a [`replisum_core::Node`] on its
//! replication endpoint and answers client datagrams through
//! [`replisum_core::RequestService`].

pub mod config;

use replisum_core::{Node, RequestService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running node together with its client endpoint
pub struct ReplisumServer {
    node: Arc<Node>,
    client_addr: SocketAddr,
    cancel: CancellationToken,
    service: JoinHandle<replisum_core::Result<()>>,
}

impl ReplisumServer {
    /// Bind both endpoints and start serving
    pub async fn start(config: &config::ServerConfig) -> anyhow::Result<Self> {
        let replication = config.replication()?;
        let (client_addr, _) = config.endpoints()?;

        let node = Node::bind_udp(replication).await?;
        let socket = UdpSocket::bind(client_addr).await?;
        let client_addr = socket.local_addr()?;
        node.start()?;

        let cancel = CancellationToken::new();
        let service = tokio::spawn(RequestService::new(node.clone()).serve(socket, cancel.clone()));

        tracing::info!(
            node = %node.node_id(),
            "Serving clients on {}, replication on {}",
            client_addr,
            node.local_addr()
        );
        Ok(Self {
            node,
            client_addr,
            cancel,
            service,
        })
    }

    /// The replication node
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Bound client endpoint
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Stop the client endpoint, then the node
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let served = self.service.await;
        self.node.shutdown().await;
        served??;
        Ok(())
    }
}
