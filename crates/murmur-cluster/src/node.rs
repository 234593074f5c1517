//! Node identity types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default protocol name used in addresses
pub const DEFAULT_PROTOCOL: &str = "murmur";

/// Network location of a cluster node
///
/// Field order defines the ordering: protocol, system, host, port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub protocol: String,
    pub system: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Create a new address with the default protocol
    pub fn new(system: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            system: system.into(),
            host: host.into(),
            port,
        }
    }

    /// Override the protocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// `host:port` form used for socket resolution
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}",
            self.protocol, self.system, self.host, self.port
        )
    }
}

/// Address plus the uid picked by the process at startup.
///
/// A restarted process at the same address gets a new uid and is therefore
/// a different identity than its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueAddress {
    pub address: Address,
    pub uid: u64,
}

impl UniqueAddress {
    pub fn new(address: Address, uid: u64) -> Self {
        Self { address, uid }
    }

    /// New incarnation at `address` with a random uid
    pub fn random(address: Address) -> Self {
        let uid = loop {
            let uid: u64 = rand::random();
            if uid != 0 {
                break uid;
            }
        };
        Self { address, uid }
    }

    /// Whether both identities live at the same network address
    pub fn same_address(&self, other: &UniqueAddress) -> bool {
        self.address == other.address
    }
}

impl fmt::Display for UniqueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_uid() {
        let addr = Address::new("sys", "10.0.0.1", 2552);
        let old = UniqueAddress::new(addr.clone(), 5);
        let new = UniqueAddress::new(addr, 9);

        assert_ne!(old, new);
        assert!(old.same_address(&new));
        assert!(old < new);
    }

    #[test]
    fn test_ordering_by_address_first() {
        let a = UniqueAddress::new(Address::new("sys", "10.0.0.1", 2552), 99);
        let b = UniqueAddress::new(Address::new("sys", "10.0.0.1", 2553), 1);
        assert!(a < b);
    }

    #[test]
    fn test_display() {
        let addr = Address::new("sys", "node-1", 2552);
        assert_eq!(addr.to_string(), "murmur://sys@node-1:2552");
        assert_eq!(addr.host_port(), "node-1:2552");

        let unique = UniqueAddress::new(addr, 7);
        assert_eq!(unique.to_string(), "murmur://sys@node-1:2552#7");
    }

    #[test]
    fn test_random_uid_nonzero() {
        let unique = UniqueAddress::random(Address::new("sys", "localhost", 1));
        assert_ne!(unique.uid, 0);
    }
}
