//! Cluster error types

use crate::member::MemberStatus;
use crate::node::{Address, UniqueAddress};
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Membership Errors ====================
    #[error("member not found: {0}")]
    MemberNotFound(Address),

    #[error("invalid status transition for {node}: {from:?} -> {to:?}")]
    InvalidTransition {
        node: UniqueAddress,
        from: MemberStatus,
        to: MemberStatus,
    },

    #[error("attempt to mutate removed member {0}")]
    RemovedMember(UniqueAddress),

    #[error("gossip version did not advance after local mutation")]
    VersionNotAdvanced,

    #[error("no seed nodes available")]
    NoSeedNodes,

    #[error("cluster join failed: {0}")]
    JoinFailed(String),

    #[error("node {0} is not a cluster member")]
    NotMember(UniqueAddress),

    #[error("incarnation {0} is quarantined")]
    Quarantined(UniqueAddress),

    // ==================== Protocol Errors ====================
    #[error("unsupported protocol version {version}: supported range [{min}, {max}]")]
    UnsupportedVersion { version: u16, min: u16, max: u16 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message authentication failed: {0}")]
    Authentication(&'static str),

    // ==================== Network Errors ====================
    #[error("unresolvable address: {0}")]
    UnresolvableAddress(Address),

    #[error("unknown peer: {0}")]
    UnknownPeer(Address),

    #[error("request timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if this error is retriable on a later tick
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout
                | ClusterError::Network(_)
                | ClusterError::UnknownPeer(_)
                | ClusterError::UnresolvableAddress(_)
                | ClusterError::Io(_)
        )
    }

    /// Check if this error indicates an implementation bug that must stop
    /// gossip processing
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::RemovedMember(_) | ClusterError::VersionNotAdvanced
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
