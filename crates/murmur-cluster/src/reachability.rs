//! Per-observer reachability records
//!
//! Every node writes records only as observer; other nodes' records arrive
//! through gossip. A subject is unreachable cluster-wide while any observer
//! holds an `Unreachable` or `Terminated` record for it.

use crate::node::UniqueAddress;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Status an observer reports for a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReachabilityStatus {
    Reachable,
    Unreachable,
    /// Association confirmed dead, never flips back
    Terminated,
}

impl ReachabilityStatus {
    /// Suspicion wins ties during merge
    fn priority(self) -> u8 {
        match self {
            ReachabilityStatus::Reachable => 0,
            ReachabilityStatus::Unreachable => 1,
            ReachabilityStatus::Terminated => 2,
        }
    }
}

/// One observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub observer: UniqueAddress,
    pub subject: UniqueAddress,
    pub status: ReachabilityStatus,
    pub version: u64,
}

impl Record {
    fn wins_over(&self, other: &Record) -> bool {
        (self.version, self.status.priority()) > (other.version, other.status.priority())
    }
}

/// Set of observation records plus each observer's version counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    records: BTreeMap<(UniqueAddress, UniqueAddress), Record>,
    versions: BTreeMap<UniqueAddress, u64>,
}

impl Reachability {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn unreachable(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> Reachability {
        self.change(observer, subject, ReachabilityStatus::Unreachable)
    }

    pub fn reachable(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> Reachability {
        self.change(observer, subject, ReachabilityStatus::Reachable)
    }

    pub fn terminated(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> Reachability {
        self.change(observer, subject, ReachabilityStatus::Terminated)
    }

    fn change(
        &self,
        observer: &UniqueAddress,
        subject: &UniqueAddress,
        status: ReachabilityStatus,
    ) -> Reachability {
        let key = (observer.clone(), subject.clone());
        let current = self.records.get(&key).map(|r| r.status);

        match current {
            Some(s) if s == status => return self.clone(),
            Some(ReachabilityStatus::Terminated) => return self.clone(),
            None if status == ReachabilityStatus::Reachable => return self.clone(),
            _ => {}
        }

        let version = self.observer_version(observer) + 1;
        let mut next = self.clone();
        next.versions.insert(observer.clone(), version);
        next.records.insert(
            key,
            Record {
                observer: observer.clone(),
                subject: subject.clone(),
                status,
                version,
            },
        );
        next
    }

    /// Per-pair merge: higher version wins, equal versions favour suspicion
    pub fn merge(&self, other: &Reachability) -> Reachability {
        let mut records = self.records.clone();
        for (key, theirs) in &other.records {
            match records.get(key) {
                Some(ours) if !theirs.wins_over(ours) => {}
                _ => {
                    records.insert(key.clone(), theirs.clone());
                }
            }
        }

        let mut versions = self.versions.clone();
        for (observer, &version) in &other.versions {
            let entry = versions.entry(observer.clone()).or_insert(0);
            if version > *entry {
                *entry = version;
            }
        }

        Reachability { records, versions }
    }

    /// Drop everything observed by or about `nodes`
    pub fn remove<'a>(&self, nodes: impl IntoIterator<Item = &'a UniqueAddress>) -> Reachability {
        let nodes: BTreeSet<&UniqueAddress> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return self.clone();
        }
        Reachability {
            records: self
                .records
                .iter()
                .filter(|((o, s), _)| !nodes.contains(o) && !nodes.contains(s))
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
            versions: self
                .versions
                .iter()
                .filter(|(o, _)| !nodes.contains(o))
                .map(|(o, v)| (o.clone(), *v))
                .collect(),
        }
    }

    /// Drop records made by `observers`, keeping records about them
    pub fn remove_observers<'a>(
        &self,
        observers: impl IntoIterator<Item = &'a UniqueAddress>,
    ) -> Reachability {
        let observers: BTreeSet<&UniqueAddress> = observers.into_iter().collect();
        if observers.is_empty() {
            return self.clone();
        }
        Reachability {
            records: self
                .records
                .iter()
                .filter(|((o, _), _)| !observers.contains(o))
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
            versions: self
                .versions
                .iter()
                .filter(|(o, _)| !observers.contains(o))
                .map(|(o, v)| (o.clone(), *v))
                .collect(),
        }
    }

    pub fn observer_version(&self, observer: &UniqueAddress) -> u64 {
        self.versions.get(observer).copied().unwrap_or(0)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Aggregated status: Terminated over Unreachable over Reachable
    pub fn status(&self, subject: &UniqueAddress) -> ReachabilityStatus {
        self.records
            .values()
            .filter(|r| &r.subject == subject)
            .map(|r| r.status)
            .max_by_key(|s| s.priority())
            .unwrap_or(ReachabilityStatus::Reachable)
    }

    pub fn status_from(
        &self,
        observer: &UniqueAddress,
        subject: &UniqueAddress,
    ) -> ReachabilityStatus {
        self.records
            .get(&(observer.clone(), subject.clone()))
            .map(|r| r.status)
            .unwrap_or(ReachabilityStatus::Reachable)
    }

    pub fn is_reachable(&self, subject: &UniqueAddress) -> bool {
        self.status(subject) == ReachabilityStatus::Reachable
    }

    pub fn is_reachable_from(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> bool {
        self.status_from(observer, subject) == ReachabilityStatus::Reachable
    }

    pub fn is_all_reachable(&self) -> bool {
        self.records
            .values()
            .all(|r| r.status == ReachabilityStatus::Reachable)
    }

    /// Subjects some observer currently reports `Unreachable`
    pub fn all_unreachable(&self) -> BTreeSet<UniqueAddress> {
        self.records
            .values()
            .filter(|r| r.status == ReachabilityStatus::Unreachable)
            .map(|r| r.subject.clone())
            .collect()
    }

    pub fn all_unreachable_or_terminated(&self) -> BTreeSet<UniqueAddress> {
        self.records
            .values()
            .filter(|r| r.status != ReachabilityStatus::Reachable)
            .map(|r| r.subject.clone())
            .collect()
    }

    pub fn all_unreachable_from(&self, observer: &UniqueAddress) -> BTreeSet<UniqueAddress> {
        self.records
            .values()
            .filter(|r| &r.observer == observer && r.status != ReachabilityStatus::Reachable)
            .map(|r| r.subject.clone())
            .collect()
    }

    /// Subject to the observers that consider it unreachable
    pub fn observers_grouped_by_unreachable(
        &self,
    ) -> BTreeMap<UniqueAddress, BTreeSet<UniqueAddress>> {
        let mut grouped: BTreeMap<UniqueAddress, BTreeSet<UniqueAddress>> = BTreeMap::new();
        for r in self.records.values() {
            if r.status != ReachabilityStatus::Reachable {
                grouped
                    .entry(r.subject.clone())
                    .or_default()
                    .insert(r.observer.clone());
            }
        }
        grouped
    }
}
