//! Wire protocol for cluster communication

use crate::error::{ClusterError, Result};
use crate::gossip::Gossip;
use crate::node::UniqueAddress;
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum encoded envelope size, small enough for one UDP datagram plus tag.
///
/// Envelopes carry the whole gossip, which bounds a cluster to roughly a
/// few hundred members depending on roles and reachability records. Larger
/// envelopes fail to send and are reported once with a warning.
pub const MAX_MESSAGE_SIZE: usize = 60 * 1024;

/// Cluster protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Request to join, sent to a seed node
    Join {
        node: UniqueAddress,
        roles: BTreeSet<String>,
    },
    /// Join accepted, carries the gossip containing the joiner
    Welcome { gossip: Gossip },
    /// Version digest sent first in every gossip round
    GossipStatus {
        version: VectorClock,
        seen_digest: [u8; 32],
    },
    /// Full gossip state
    GossipEnvelope { gossip: Gossip },
    /// Liveness probe
    Heartbeat { seq: u64 },
    /// Response to a liveness probe
    HeartbeatRsp { seq: u64 },
}

impl ClusterMessage {
    /// Short name for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Join { .. } => "join",
            ClusterMessage::Welcome { .. } => "welcome",
            ClusterMessage::GossipStatus { .. } => "gossip_status",
            ClusterMessage::GossipEnvelope { .. } => "gossip_envelope",
            ClusterMessage::Heartbeat { .. } => "heartbeat",
            ClusterMessage::HeartbeatRsp { .. } => "heartbeat_rsp",
        }
    }
}

/// Message plus routing header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u16,
    pub from: UniqueAddress,
    /// Intended incarnation, `None` when the receiver's uid is not known yet
    pub to: Option<UniqueAddress>,
    pub message: ClusterMessage,
}

impl Envelope {
    pub fn new(from: UniqueAddress, to: Option<UniqueAddress>, message: ClusterMessage) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            from,
            to,
            message,
        }
    }

    /// Check that the sender speaks a version we understand
    pub fn validate_version(&self) -> Result<()> {
        if self.protocol_version < MIN_PROTOCOL_VERSION || self.protocol_version > PROTOCOL_VERSION
        {
            return Err(ClusterError::UnsupportedVersion {
                version: self.protocol_version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            });
        }
        Ok(())
    }

    /// Whether this envelope targets the given incarnation
    pub fn is_addressed_to(&self, node: &UniqueAddress) -> bool {
        match &self.to {
            Some(to) => to == node,
            None => true,
        }
    }
}

/// Encode an envelope to bytes
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(envelope)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode and version-check an envelope
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let envelope: Envelope = postcard::from_bytes(bytes)?;
    envelope.validate_version()?;
    Ok(envelope)
}
