//! Who runs which service group, and how healthy the ring thinks they are.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::Serializer;
use serde::Serialize;

use crate::member::{Health, Member, ServiceRumor};
use crate::membership_store::{MembershipStore, StoreSnapshot};
use crate::registry::ident::ServiceGroup;
use crate::registry::spec::{ServiceSpec, Topology, UpdateStrategy};
use crate::registry::ServiceRegistry;
use crate::types::{MemberId, SysInfo};

/// Alive members a leader group needs before anyone is elected.
pub const LEADER_QUORUM: usize = 3;

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CensusEntry {
    pub member_id: MemberId,
    pub pkg: String,
    pub sys: SysInfo,
    pub cfg: serde_json::Value,
    pub alive: bool,
    pub suspect: bool,
    pub confirmed: bool,
    pub departed: bool,
    pub persistent: bool,
    pub leader: bool,
}

impl CensusEntry {
    fn new(member: &Member, rumor: &ServiceRumor) -> Self {
        Self {
            member_id: member.id.clone(),
            pkg: rumor.pkg.clone(),
            sys: rumor.sys.clone(),
            cfg: rumor.cfg.clone(),
            alive: member.health == Health::Alive,
            suspect: member.health == Health::Suspect,
            confirmed: member.health == Health::Confirmed,
            departed: member.health == Health::Departed,
            persistent: member.persistent,
            leader: false,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CensusGroup {
    pub service_group: ServiceGroup,
    pub topology: Topology,
    pub update_strategy: UpdateStrategy,
    pub leader_id: Option<MemberId>,
    /// In join order; serialized as an object keyed by member id.
    #[serde(serialize_with = "population_by_member")]
    pub population: Vec<CensusEntry>,
}

fn population_by_member<S: Serializer>(entries: &[CensusEntry], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(entries.iter().map(|e| (&e.member_id, e)))
}

impl CensusGroup {
    pub fn alive_count(&self) -> usize {
        self.population.iter().filter(|e| e.alive).count()
    }

    #[cfg(test)]
    pub fn entry(&self, member_id: &str) -> Option<&CensusEntry> {
        self.population.iter().find(|e| e.member_id == member_id)
    }

    fn elect(&mut self) {
        if self.topology != Topology::Leader || self.alive_count() < LEADER_QUORUM {
            self.leader_id = None;
            return;
        }
        self.leader_id = self
            .population
            .iter()
            .filter(|e| e.alive)
            .map(|e| e.member_id.clone())
            .min();
        for entry in &mut self.population {
            entry.leader = Some(&entry.member_id) == self.leader_id.as_ref();
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CensusView {
    pub census_groups: BTreeMap<String, CensusGroup>,
    pub local_member_id: MemberId,
    pub last_membership_counter: u64,
}

/// Specs loaded locally decide the topology of their own groups; other
/// groups take it from the earliest joined member's rumor.
pub fn compute(
    snapshot: &StoreSnapshot,
    local_specs: &BTreeMap<ServiceGroup, Arc<ServiceSpec>>,
) -> BTreeMap<String, CensusGroup> {
    let mut by_group: BTreeMap<String, CensusGroup> = BTreeMap::new();

    // Walk members in join order so every population comes out ordered.
    for member in &snapshot.members {
        let running = snapshot
            .services
            .iter()
            .filter(|s| s.member_id == member.id && s.running);
        for rumor in running {
            let group = by_group
                .entry(rumor.service_group.to_string())
                .or_insert_with(|| {
                    let (topology, update_strategy) = match local_specs.get(&rumor.service_group) {
                        Some(spec) => (spec.topology, spec.update_strategy),
                        None => (rumor.topology, rumor.update_strategy),
                    };
                    CensusGroup {
                        service_group: rumor.service_group.clone(),
                        topology,
                        update_strategy,
                        leader_id: None,
                        population: Vec::new(),
                    }
                });
            group.population.push(CensusEntry::new(member, rumor));
        }
    }

    for group in by_group.values_mut() {
        group.elect();
    }
    by_group
}

#[derive(Clone)]
pub struct CensusAggregator {
    store: MembershipStore,
    registry: Arc<ServiceRegistry>,
    local_member_id: MemberId,
}

impl CensusAggregator {
    pub fn new(store: MembershipStore, registry: Arc<ServiceRegistry>, local_member_id: MemberId) -> Self {
        Self {
            store,
            registry,
            local_member_id,
        }
    }

    pub fn groups(&self) -> BTreeMap<String, CensusGroup> {
        compute(&self.store.snapshot(), &self.registry.loaded_specs())
    }

    /// `last_membership_counter` is read first, so the groups reflect at
    /// least every change up to it.
    pub fn view(&self) -> CensusView {
        let last_membership_counter = self.store.update_counter();
        CensusView {
            census_groups: self.groups(),
            local_member_id: self.local_member_id.clone(),
            last_membership_counter,
        }
    }
}
