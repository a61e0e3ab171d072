//! Client request service
//!
//! Clients send `ClientRequest { request_id, value }` datagrams; the node
//! answers with the resulting sum and a status code. Only the primary
//! applies requests; backups reject them and point at the primary.

use crate::node::Node;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Largest request datagram accepted
const MAX_REQUEST_SIZE: usize = 1024;

/// Status code returned to clients
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Applied and acknowledged by every live backup
    Ok = 0,
    /// This node is not the primary
    NotPrimary = 1,
    /// Applied on the primary but not acknowledged by every live backup
    ReplicationIncomplete = 2,
}

impl RequestStatus {
    /// Numeric status code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Status reported for a failed write
    pub fn from_error(error: &Error) -> Self {
        match error.status_code() {
            1 => Self::NotPrimary,
            _ => Self::ReplicationIncomplete,
        }
    }
}

/// Add request sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Client-chosen identifier echoed in the response
    pub request_id: u64,
    /// Value to add to the sum
    pub value: i64,
}

/// Answer to a [`ClientRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Identifier of the request being answered
    pub request_id: u64,
    /// Sum after the request (or the current sum if rejected)
    pub sum: i64,
    /// Sequence number of the update (or the last applied one if rejected)
    pub seqn: u64,
    /// Outcome
    pub status: RequestStatus,
    /// Replication address of the primary when this node is not it
    pub primary_hint: Option<SocketAddr>,
}

/// Serves client requests on top of a [`Node`]
#[derive(Debug, Clone)]
pub struct RequestService {
    node: Arc<Node>,
}

impl RequestService {
    /// Create a service for `node`
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Apply one request
    pub async fn handle(&self, request: ClientRequest) -> ClientResponse {
        let (sum, seqn, status) = match self.node.add(request.value).await {
            Ok((sum, seqn)) => (sum, seqn, RequestStatus::Ok),
            Err(Error::ReplicationIncomplete { seqn, .. }) => (
                self.node.current_sum(),
                seqn,
                RequestStatus::ReplicationIncomplete,
            ),
            Err(e) => {
                let status = RequestStatus::from_error(&e);
                tracing::debug!(
                    node = %self.node.node_id(),
                    "Request {} rejected: {}",
                    request.request_id,
                    e
                );
                (self.node.current_sum(), self.node.last_seqn(), status)
            }
        };

        let primary_hint = match status {
            RequestStatus::NotPrimary => self.node.primary_addr(),
            _ => None,
        };

        ClientResponse {
            request_id: request.request_id,
            sum,
            seqn,
            status,
            primary_hint,
        }
    }

    /// Answer requests arriving on `socket` until `cancel` fires.
    ///
    /// Each request is handled on its own task so a slow replication round
    /// does not hold up the next client.
    pub async fn serve(self, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let socket = Arc::new(socket);
        tracing::info!(
            node = %self.node.node_id(),
            "Request service listening on {}",
            socket.local_addr()?
        );

        let mut buf = vec![0u8; MAX_REQUEST_SIZE];
        loop {
            let (n, client) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!("Request socket error: {}", e);
                        continue;
                    }
                },
            };

            let request: ClientRequest = match bincode::deserialize(&buf[..n]) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("Malformed request from {}: {}", client, e);
                    continue;
                }
            };

            let service = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let response = service.handle(request).await;
                tracing::debug!(
                    "Request {} from {}: {:?} sum {}",
                    request.request_id,
                    client,
                    response.status,
                    response.sum
                );
                match bincode::serialize(&response) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, client).await {
                            tracing::warn!("Cannot answer {}: {}", client, e);
                        }
                    }
                    Err(e) => tracing::error!("Cannot encode response: {}", e),
                }
            });
        }

        tracing::info!(node = %self.node.node_id(), "Request service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::directory::NodeId;
    use crate::transport::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn node(net: &MemoryNetwork, config: ReplicationConfig) -> Arc<Node> {
        let transport = net.bind(config.bind_addr, config.recv_timeout).unwrap();
        Node::new(config, Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RequestStatus::Ok.code(), 0);
        assert_eq!(RequestStatus::NotPrimary.code(), 1);
        assert_eq!(RequestStatus::ReplicationIncomplete.code(), 2);
        assert_eq!(
            RequestStatus::from_error(&Error::NotPrimary { primary: None }),
            RequestStatus::NotPrimary
        );
        assert_eq!(
            RequestStatus::from_error(&Error::Shutdown),
            RequestStatus::ReplicationIncomplete
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_applies_request() {
        let net = MemoryNetwork::new();
        let service = RequestService::new(node(
            &net,
            ReplicationConfig::primary(NodeId(2000), addr(2002)).fast(),
        ));

        let first = service.handle(ClientRequest { request_id: 1, value: 7 }).await;
        let second = service.handle(ClientRequest { request_id: 2, value: 5 }).await;

        assert_eq!(first.status, RequestStatus::Ok);
        assert_eq!((second.request_id, second.sum, second.seqn), (2, 12, 2));
        assert_eq!(second.primary_hint, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_redirects_to_primary() {
        let net = MemoryNetwork::new();
        let service = RequestService::new(node(
            &net,
            ReplicationConfig::backup(NodeId(2004), addr(2006), NodeId(2000), addr(2002)).fast(),
        ));

        let response = service.handle(ClientRequest { request_id: 9, value: 3 }).await;
        assert_eq!(response.status, RequestStatus::NotPrimary);
        assert_eq!(response.primary_hint, Some(addr(2002)));
        assert_eq!(response.sum, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_replication_reported() {
        let net = MemoryNetwork::new();
        let config = ReplicationConfig::primary(NodeId(2000), addr(2002))
            .with_peer(NodeId(2004), addr(2006))
            .fast();
        let service = RequestService::new(node(&net, config));

        let response = service.handle(ClientRequest { request_id: 1, value: 4 }).await;
        assert_eq!(response.status, RequestStatus::ReplicationIncomplete);
        assert_eq!((response.sum, response.seqn), (4, 1));
    }

    #[tokio::test]
    async fn test_serve_over_udp() {
        let net = MemoryNetwork::new();
        let service = RequestService::new(node(
            &net,
            ReplicationConfig::primary(NodeId(2000), addr(2002)).fast(),
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(service.serve(socket, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = bincode::serialize(&ClientRequest { request_id: 42, value: 10 }).unwrap();
        client.send_to(&request, server_addr).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response: ClientResponse = bincode::deserialize(&buf[..n]).unwrap();
        assert_eq!(response.request_id, 42);
        assert_eq!(response.sum, 10);
        assert_eq!(response.status, RequestStatus::Ok);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
