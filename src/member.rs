//! Membership records and the rumors that carry them between peers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::ident::ServiceGroup;
use crate::registry::spec::{Topology, UpdateStrategy};
use crate::types::{MemberId, SysInfo};

/// SWIM health of a member as seen by this node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Health {
    Alive,
    Suspect,
    Confirmed,
    Departed,
}

impl Health {
    /// Tie-breaker between two rumors at the same incarnation: the higher
    /// value wins.
    pub fn precedence(self) -> u8 {
        match self {
            Health::Alive => 0,
            Health::Suspect => 1,
            Health::Confirmed => 2,
            Health::Departed => 3,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Health::Alive => "Alive",
            Health::Suspect => "Suspect",
            Health::Confirmed => "Confirmed",
            Health::Departed => "Departed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    /// Gossip address, `host:port`.
    pub address: String,
    pub incarnation: u64,
    pub health: Health,
    /// Store-local sequence number of the last change to this record. Values
    /// received over the wire are ignored.
    #[serde(default)]
    pub rumor_seq: u64,
    #[serde(default)]
    pub persistent: bool,
}

impl Member {
    pub fn new(id: impl Into<MemberId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            incarnation: 0,
            health: Health::Alive,
            rumor_seq: 0,
            persistent: false,
        }
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    pub fn with_incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = incarnation;
        self
    }

    /// True when `self` should replace `stored`: newer incarnation, or the
    /// same incarnation with a stronger health claim.
    pub fn supersedes(&self, stored: &Member) -> bool {
        self.incarnation > stored.incarnation
            || (self.incarnation == stored.incarnation
                && self.health.precedence() > stored.health.precedence())
    }
}

/// Announces that `member_id` runs (or stopped running) a service group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceRumor {
    pub member_id: MemberId,
    pub service_group: ServiceGroup,
    pub incarnation: u64,
    /// Package identifier, e.g. `klm/effortless`.
    pub pkg: String,
    pub topology: Topology,
    pub update_strategy: UpdateStrategy,
    pub sys: SysInfo,
    /// Resolved runtime configuration of the service on that member.
    #[serde(default)]
    pub cfg: serde_json::Value,
    pub running: bool,
    #[serde(default)]
    pub rumor_seq: u64,
}

impl ServiceRumor {
    pub fn supersedes(&self, stored: &ServiceRumor) -> bool {
        self.incarnation > stored.incarnation
    }
}

/// Unit of dissemination.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rumor {
    Member(Member),
    Service(ServiceRumor),
}

impl Rumor {
    pub fn rumor_seq(&self) -> u64 {
        match self {
            Rumor::Member(m) => m.rumor_seq,
            Rumor::Service(s) => s.rumor_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_incarnation_always_wins() {
        let stored = Member::new("a", "10.0.0.1:9638")
            .with_incarnation(2)
            .with_health(Health::Confirmed);
        let offered = Member::new("a", "10.0.0.1:9638").with_incarnation(3);
        assert!(offered.supersedes(&stored));
        assert!(!stored.supersedes(&offered));
    }

    #[test]
    fn equal_incarnation_uses_health_precedence() {
        let alive = Member::new("a", "x:1").with_incarnation(4);
        let suspect = alive.clone().with_health(Health::Suspect);
        let confirmed = alive.clone().with_health(Health::Confirmed);

        assert!(suspect.supersedes(&alive));
        assert!(confirmed.supersedes(&suspect));
        assert!(!alive.supersedes(&suspect));
        assert!(!suspect.supersedes(&suspect));
    }

    #[test]
    fn health_serializes_as_variant_name() {
        let json = serde_json::to_string(&Health::Alive).unwrap();
        assert_eq!(json, "\"Alive\"");
    }
}
