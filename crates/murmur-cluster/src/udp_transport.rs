//! UDP datagram transport
//!
//! One postcard-encoded [`Envelope`] per datagram. When an auth token is
//! configured every datagram carries an HMAC-SHA256 tag and unauthenticated
//! input is dropped before decoding. Inbound processing is rate limited so a
//! flood cannot starve the coordinator.

use crate::error::{ClusterError, Result};
use crate::node::Address;
use crate::protocol::{decode_envelope, encode_envelope, Envelope};
use crate::transport::{Transport, TransportEvent, INBOUND_QUEUE_CAPACITY};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// HMAC tag length in bytes (SHA-256 → 32 bytes)
const HMAC_TAG_LEN: usize = 32;

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Local socket address to bind
    pub bind_addr: SocketAddr,
    /// Shared secret for HMAC authentication (None = no auth)
    pub auth_token: Option<String>,
    /// Upper bound of datagrams processed per second
    pub max_messages_per_sec: u32,
}

impl UdpTransportConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            auth_token: None,
            max_messages_per_sec: 10_000,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Signs and verifies datagrams
#[derive(Clone)]
struct Authenticator {
    key: Option<Vec<u8>>,
}

impl Authenticator {
    fn new(token: Option<&str>) -> Self {
        Self {
            key: token.map(|t| t.as_bytes().to_vec()),
        }
    }

    fn mac(key: &[u8]) -> Result<Hmac<Sha256>> {
        Hmac::<Sha256>::new_from_slice(key).map_err(|_| ClusterError::Authentication("invalid HMAC key"))
    }

    /// Append an HMAC-SHA256 tag when authentication is enabled
    fn sign(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(data);
        };
        let mut mac = Self::mac(key)?;
        mac.update(&data);
        let tag = mac.finalize().into_bytes();
        let mut signed = Vec::with_capacity(data.len() + HMAC_TAG_LEN);
        signed.extend_from_slice(&data);
        signed.extend_from_slice(&tag);
        Ok(signed)
    }

    /// Verify and strip the tag, returning the payload
    fn verify<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let Some(key) = &self.key else {
            return Ok(data);
        };
        if data.len() < HMAC_TAG_LEN {
            return Err(ClusterError::Authentication("message too short for HMAC tag"));
        }
        let (payload, tag) = data.split_at(data.len() - HMAC_TAG_LEN);
        let mut mac = Self::mac(key)?;
        mac.update(payload);
        mac.verify_slice(tag)
            .map_err(|_| ClusterError::Authentication("HMAC verification failed"))?;
        Ok(payload)
    }
}

/// Transport sending envelopes as UDP datagrams
pub struct UdpTransport {
    address: Address,
    socket: Arc<UdpSocket>,
    auth: Authenticator,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the socket and start the receive loop.
    ///
    /// `address` is the cluster address advertised to peers; its host and
    /// port must resolve to the bound socket from the peers' side.
    pub async fn bind(
        address: Address,
        config: UdpTransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        let socket = Arc::new(socket);
        let auth = Authenticator::new(config.auth_token.as_deref());
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        info!(
            address = %address,
            bind = %config.bind_addr,
            authenticated = config.auth_token.is_some(),
            "UDP transport bound"
        );

        let receiver = tokio::spawn(run_receiver(
            socket.clone(),
            auth.clone(),
            tx,
            config.max_messages_per_sec.max(1),
        ));

        Ok((
            Self {
                address,
                socket,
                auth,
                receiver,
            },
            rx,
        ))
    }

    /// Socket address actually bound, useful with port 0
    pub fn local_socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn resolve(address: &Address) -> Result<SocketAddr> {
    tokio::net::lookup_host(address.host_port())
        .await
        .map_err(|_| ClusterError::UnresolvableAddress(address.clone()))?
        .next()
        .ok_or_else(|| ClusterError::UnresolvableAddress(address.clone()))
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: &Address, envelope: Envelope) -> Result<()> {
        let data = encode_envelope(&envelope)?;
        let packet = self.auth.sign(data)?;
        let target = resolve(to).await?;
        self.socket.send_to(&packet, target).await?;
        trace!(to = %to, bytes = packet.len(), kind = envelope.message.kind(), "sent datagram");
        Ok(())
    }

    fn local_address(&self) -> &Address {
        &self.address
    }
}

/// Receive, authenticate and decode datagrams into transport events
async fn run_receiver(
    socket: Arc<UdpSocket>,
    auth: Authenticator,
    tx: mpsc::Sender<TransportEvent>,
    max_messages_per_sec: u32,
) {
    let mut buf = vec![0u8; 65536];
    let mut msg_count: u32 = 0;
    let mut window_start = Instant::now();

    loop {
        if window_start.elapsed() >= Duration::from_secs(1) {
            msg_count = 0;
            window_start = Instant::now();
        }

        if msg_count >= max_messages_per_sec {
            tokio::time::sleep_until(window_start + Duration::from_secs(1)).await;
            continue;
        }

        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("Socket recv error: {}", e);
                continue;
            }
        };
        msg_count += 1;

        let payload = match auth.verify(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping unauthenticated datagram from {}: {}", from, e);
                continue;
            }
        };

        let envelope = match decode_envelope(payload) {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to decode datagram from {}: {}", from, e);
                continue;
            }
        };

        let event = TransportEvent::Message {
            envelope,
            received_at: Instant::now(),
        };
        if tx.send(event).await.is_err() {
            debug!("Inbound queue closed, stopping UDP receiver");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::UniqueAddress;
    use crate::protocol::ClusterMessage;

    #[test]
    fn test_sign_and_verify() {
        let auth = Authenticator::new(Some("secret"));
        let signed = auth.sign(b"payload".to_vec()).unwrap();
        assert_eq!(signed.len(), 7 + HMAC_TAG_LEN);
        assert_eq!(auth.verify(&signed).unwrap(), b"payload");

        let other = Authenticator::new(Some("other"));
        assert!(other.verify(&signed).is_err());
        assert!(auth.verify(b"short").is_err());
    }

    #[test]
    fn test_no_auth_passthrough() {
        let auth = Authenticator::new(None);
        assert_eq!(auth.sign(b"abc".to_vec()).unwrap(), b"abc");
        assert_eq!(auth.verify(b"abc").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let config = UdpTransportConfig::new("127.0.0.1:0".parse().unwrap()).with_auth_token("k");
        let (a, _a_rx) = UdpTransport::bind(Address::new("sys", "127.0.0.1", 0), config.clone())
            .await
            .unwrap();
        let (b, mut b_rx) = UdpTransport::bind(Address::new("sys", "127.0.0.1", 0), config)
            .await
            .unwrap();

        let b_port = b.local_socket_addr().unwrap().port();
        let to = Address::new("sys", "127.0.0.1", b_port);
        let from = UniqueAddress::new(Address::new("sys", "127.0.0.1", 1), 1);
        let envelope = Envelope::new(from, None, ClusterMessage::Heartbeat { seq: 9 });
        a.send(&to, envelope.clone()).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(5), b_rx.recv()).await {
            Ok(Some(TransportEvent::Message { envelope: received, .. })) => {
                assert_eq!(received, envelope);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_datagram_dropped() {
        let signed = UdpTransportConfig::new("127.0.0.1:0".parse().unwrap()).with_auth_token("k");
        let plain = UdpTransportConfig::new("127.0.0.1:0".parse().unwrap());
        let (a, _a_rx) = UdpTransport::bind(Address::new("sys", "127.0.0.1", 0), plain)
            .await
            .unwrap();
        let (b, mut b_rx) = UdpTransport::bind(Address::new("sys", "127.0.0.1", 0), signed)
            .await
            .unwrap();

        let to = Address::new("sys", "127.0.0.1", b.local_socket_addr().unwrap().port());
        let from = UniqueAddress::new(Address::new("sys", "127.0.0.1", 1), 1);
        a.send(&to, Envelope::new(from, None, ClusterMessage::Heartbeat { seq: 1 }))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(300), b_rx.recv()).await;
        assert!(received.is_err());
    }
}
