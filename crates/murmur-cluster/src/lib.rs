//! # Murmur Cluster
//!
//! Gossip-based cluster membership with:
//! - **Vector-clocked gossip**: convergent membership state merged by CRDT rules
//! - **Phi accrual failure detection**: heartbeats over a consistent ring
//! - **Leader actions**: deterministic leader moves members through their lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ClusterCoordinator                      │
//! ├──────────────┬──────────────┬───────────────┬───────────────┤
//! │    Gossip    │  Heartbeat   │    Leader     │    Downing    │
//! │ Disseminator │ Sender/Recv  │    Logic      │   Strategy    │
//! ├──────────────┼──────────────┼───────────────┼───────────────┤
//! │ • Target sel │ • Node ring  │ • Convergence │ • Auto-down   │
//! │ • Status/env │ • Phi detect │ • Joining→Up  │   after delay │
//! │ • Merge      │ • Reach recs │ • Exit/remove │               │
//! └──────────────┴──────────────┴───────────────┴───────────────┘
//!            │                 Transport                │
//!            └───────── in-memory │ UDP datagrams ──────┘
//! ```
//!
//! ## Member lifecycle
//!
//! `Joining → Up → Leaving → Exiting → Removed`, with `Down` reachable from
//! every non-terminal status. Only the leader performs `Joining → Up`,
//! `Leaving → Exiting` and removal, and only on a converged gossip.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use murmur_cluster::{ClusterConfig, ClusterCoordinator, UdpTransport, UdpTransportConfig};
//!
//! let config = ClusterConfig::builder()
//!     .host("10.0.0.1")
//!     .port(2552)
//!     .seed_nodes(vec![Address::new("murmur", "10.0.0.1", 2552)])
//!     .build();
//! let (transport, inbound) =
//!     UdpTransport::bind(config.self_address(), UdpTransportConfig::new("0.0.0.0:2552".parse()?)).await?;
//! let (handle, task) = ClusterCoordinator::spawn(config, transport, inbound)?;
//!
//! let mut events = handle.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod dissemination;
pub mod downing;
pub mod error;
pub mod events;
pub mod failure_detector;
pub mod gossip;
pub mod heartbeat;
pub mod leader;
pub mod member;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod reachability;
pub mod transport;
pub mod udp_transport;
pub mod vector_clock;

// Re-export main types
pub use config::{ClusterConfig, FailureDetectorConfig, GossipConfig, LeaderConfig};
pub use coordinator::{ClusterCoordinator, ClusterHandle};
pub use dissemination::{GossipDisseminator, GossipReceive, StatusReply};
pub use downing::{AutoDownUnreachableAfter, DowningStrategy, NoDowning};
pub use error::{ClusterError, Result};
pub use events::{ClusterEvent, CurrentClusterState};
pub use failure_detector::{FailureDetectorRegistry, PhiAccrualFailureDetector};
pub use gossip::{Gossip, GossipOverview};
pub use heartbeat::{HeartbeatNodeRing, HeartbeatReceiver, HeartbeatSender};
pub use leader::{LeaderActions, LeaderLogic};
pub use member::{Member, MemberStatus};
pub use node::{Address, UniqueAddress};
pub use observability::init_metrics;
pub use protocol::{ClusterMessage, Envelope};
pub use reachability::{Reachability, ReachabilityStatus};
pub use transport::{InMemoryNetwork, InMemoryTransport, Transport, TransportEvent};
pub use udp_transport::{UdpTransport, UdpTransportConfig};
pub use vector_clock::{VectorClock, VersionOrdering};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::coordinator::{ClusterCoordinator, ClusterHandle};
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::member::{Member, MemberStatus};
    pub use crate::node::*;
}
