//! Transport seam for cluster messages
//!
//! The membership engine only needs fire-and-forget delivery of
//! [`Envelope`]s to an [`Address`] and a stream of inbound
//! [`TransportEvent`]s. Delivery is best effort: lost messages are repaired
//! by the next gossip round.
//!
//! [`InMemoryNetwork`] connects nodes inside one process and can block links
//! in either direction to simulate partitions.

use crate::error::{ClusterError, Result};
use crate::node::{Address, UniqueAddress};
use crate::protocol::{decode_envelope, encode_envelope, Envelope};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Capacity of inbound transport queues
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Inbound notification from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived; `received_at` is taken when it entered the queue
    Message {
        envelope: Envelope,
        received_at: Instant,
    },
    /// The association with this incarnation is permanently gone
    Quarantined(UniqueAddress),
}

/// Outbound side of a transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one envelope, best effort
    async fn send(&self, to: &Address, envelope: Envelope) -> Result<()>;

    /// Address this transport is bound to
    fn local_address(&self) -> &Address;
}

#[derive(Debug, Default)]
struct NetworkInner {
    endpoints: DashMap<Address, mpsc::Sender<TransportEvent>>,
    /// Directed links that drop everything: (from, to)
    blocked: DashSet<(Address, Address)>,
}

/// In-process network shared by several transports
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint and return its transport and inbound queue
    pub fn bind(&self, address: Address) -> (InMemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        self.inner.endpoints.insert(address.clone(), tx);
        (
            InMemoryTransport {
                address,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Detach an endpoint, as if its process died
    pub fn unbind(&self, address: &Address) {
        self.inner.endpoints.remove(address);
    }

    /// Drop all messages from `from` to `to`
    pub fn block(&self, from: &Address, to: &Address) {
        self.inner.blocked.insert((from.clone(), to.clone()));
    }

    pub fn unblock(&self, from: &Address, to: &Address) {
        self.inner.blocked.remove(&(from.clone(), to.clone()));
    }

    /// Block both directions between the two sides
    pub fn partition(&self, side_a: &[Address], side_b: &[Address]) {
        for a in side_a {
            for b in side_b {
                self.block(a, b);
                self.block(b, a);
            }
        }
    }

    pub fn heal(&self) {
        self.inner.blocked.clear();
    }

    /// Tell the endpoint at `at` that `node` is quarantined
    pub async fn quarantine(&self, at: &Address, node: UniqueAddress) -> Result<()> {
        let tx = self
            .inner
            .endpoints
            .get(at)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::UnknownPeer(at.clone()))?;
        tx.send(TransportEvent::Quarantined(node)).await?;
        Ok(())
    }

    fn is_blocked(&self, from: &Address, to: &Address) -> bool {
        self.inner.blocked.contains(&(from.clone(), to.clone()))
    }
}

/// Endpoint of an [`InMemoryNetwork`]
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    address: Address,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: &Address, envelope: Envelope) -> Result<()> {
        if self.network.is_blocked(&self.address, to) {
            trace!(from = %self.address, to = %to, "link blocked, dropping message");
            return Ok(());
        }

        // Go through the codec so in-process tests exercise the wire format
        let bytes = encode_envelope(&envelope)?;
        let envelope = decode_envelope(&bytes)?;

        let tx = self
            .network
            .inner
            .endpoints
            .get(to)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::UnknownPeer(to.clone()))?;
        tx.send(TransportEvent::Message {
            envelope,
            received_at: Instant::now(),
        })
        .await?;
        Ok(())
    }

    fn local_address(&self) -> &Address {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClusterMessage;

    fn addr(port: u16) -> Address {
        Address::new("sys", "127.0.0.1", port)
    }

    fn heartbeat(from: &Address) -> Envelope {
        Envelope::new(
            UniqueAddress::new(from.clone(), 1),
            None,
            ClusterMessage::Heartbeat { seq: 1 },
        )
    }

    #[tokio::test]
    async fn test_delivery() {
        let network = InMemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));

        a.send(&addr(2), heartbeat(&addr(1))).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::Message { envelope, .. } => {
                assert_eq!(envelope.message, ClusterMessage::Heartbeat { seq: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_envelope_is_refused() {
        use crate::gossip::Gossip;
        use crate::member::Member;

        let network = InMemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));

        let from = UniqueAddress::new(addr(1), 1);
        let roles = std::collections::BTreeSet::from(["r".repeat(70 * 1024)]);
        let gossip = Gossip::from_members([Member::new(from.clone(), roles)]);
        let envelope = Envelope::new(from, None, ClusterMessage::GossipEnvelope { gossip });

        assert!(matches!(
            a.send(&addr(2), envelope).await,
            Err(ClusterError::MessageTooLarge { .. })
        ));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocked_link_is_one_way() {
        let network = InMemoryNetwork::new();
        let (a, mut a_rx) = network.bind(addr(1));
        let (b, mut b_rx) = network.bind(addr(2));
        network.block(&addr(2), &addr(1));

        b.send(&addr(1), heartbeat(&addr(2))).await.unwrap();
        assert!(a_rx.try_recv().is_err());

        a.send(&addr(2), heartbeat(&addr(1))).await.unwrap();
        assert!(b_rx.try_recv().is_ok());

        network.heal();
        b.send(&addr(1), heartbeat(&addr(2))).await.unwrap();
        assert!(a_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let network = InMemoryNetwork::new();
        let (a, _rx) = network.bind(addr(1));
        let err = a.send(&addr(9), heartbeat(&addr(1))).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_quarantine_event() {
        let network = InMemoryNetwork::new();
        let (_a, mut a_rx) = network.bind(addr(1));
        let node = UniqueAddress::new(addr(2), 7);
        network.quarantine(&addr(1), node.clone()).await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::Quarantined(n)) if n == node));
    }
}
