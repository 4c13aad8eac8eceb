//! Member and service rumors, kept incarnation-monotonic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SupError;
use crate::member::{Member, Rumor, ServiceRumor};
use crate::registry::ident::ServiceGroup;
use crate::types::MemberId;

#[derive(Clone, Debug)]
struct MemberEntry {
    member: Member,
    joined_seq: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    members: HashMap<MemberId, MemberEntry>,
    services: BTreeMap<(ServiceGroup, MemberId), ServiceRumor>,
    update_counter: u64,
}

impl StoreInner {
    fn bump(&mut self) -> u64 {
        self.update_counter += 1;
        self.update_counter
    }

    fn members_in_join_order(&self) -> Vec<Member> {
        let mut entries: Vec<&MemberEntry> = self.members.values().collect();
        entries.sort_by(|a, b| {
            a.joined_seq
                .cmp(&b.joined_seq)
                .then_with(|| a.member.id.cmp(&b.member.id))
        });
        entries.into_iter().map(|e| e.member.clone()).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Ordered by the time each member was first seen.
    pub members: Vec<Member>,
    /// Ordered by service group, then member id.
    pub services: Vec<ServiceRumor>,
    pub update_counter: u64,
}

#[cfg(test)]
impl StoreSnapshot {
    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }
}

/// Cheap to clone; all clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MembershipStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Member> {
        self.inner.read().members.get(id).map(|e| e.member.clone())
    }

    /// Store `member` if it is unknown or supersedes the stored record.
    /// Returns the stored copy with its new `rumor_seq`.
    pub fn upsert(&self, mut member: Member) -> Result<Member, SupError> {
        let mut inner = self.inner.write();
        let joined_seq = match inner.members.get(&member.id) {
            Some(existing) if !member.supersedes(&existing.member) => {
                return Err(SupError::IncarnationConflict {
                    id: member.id,
                    stored: existing.member.incarnation,
                    offered: member.incarnation,
                });
            }
            Some(existing) => existing.joined_seq,
            None => inner.update_counter + 1,
        };
        member.rumor_seq = inner.bump();
        inner.members.insert(
            member.id.clone(),
            MemberEntry {
                member: member.clone(),
                joined_seq,
            },
        );
        Ok(member)
    }

    pub fn list(&self) -> Vec<Member> {
        self.inner.read().members_in_join_order()
    }

    #[cfg(test)]
    pub fn health_of(&self, id: &str) -> Option<crate::member::Health> {
        self.inner.read().members.get(id).map(|e| e.member.health)
    }

    pub fn remove(&self, id: &str) -> Option<Member> {
        let mut inner = self.inner.write();
        let removed = inner.members.remove(id)?;
        inner.services.retain(|(_, member_id), _| member_id != id);
        inner.bump();
        Some(removed.member)
    }

    pub fn upsert_service(&self, mut rumor: ServiceRumor) -> Result<ServiceRumor, SupError> {
        let mut inner = self.inner.write();
        let key = (rumor.service_group.clone(), rumor.member_id.clone());
        if let Some(existing) = inner.services.get(&key) {
            if !rumor.supersedes(existing) {
                return Err(SupError::IncarnationConflict {
                    id: format!("{}@{}", rumor.service_group, rumor.member_id),
                    stored: existing.incarnation,
                    offered: rumor.incarnation,
                });
            }
        }
        rumor.rumor_seq = inner.bump();
        inner.services.insert(key, rumor.clone());
        Ok(rumor)
    }

    #[cfg(test)]
    pub fn services(&self) -> Vec<ServiceRumor> {
        self.inner.read().services.values().cloned().collect()
    }

    pub fn update_counter(&self) -> u64 {
        self.inner.read().update_counter
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot {
            members: inner.members_in_join_order(),
            services: inner.services.values().cloned().collect(),
            update_counter: inner.update_counter,
        }
    }

    /// Every rumor changed after `seq`, oldest first.
    pub fn rumors_since(&self, seq: u64) -> Vec<Rumor> {
        let inner = self.inner.read();
        let mut rumors: Vec<Rumor> = inner
            .members
            .values()
            .filter(|e| e.member.rumor_seq > seq)
            .map(|e| Rumor::Member(e.member.clone()))
            .chain(
                inner
                    .services
                    .values()
                    .filter(|s| s.rumor_seq > seq)
                    .cloned()
                    .map(Rumor::Service),
            )
            .collect();
        rumors.sort_by_key(Rumor::rumor_seq);
        rumors
    }

    /// The `limit` most recently changed rumors, newest first.
    pub fn recent_rumors(&self, limit: usize) -> Vec<Rumor> {
        let mut rumors = self.rumors_since(0);
        rumors.reverse();
        rumors.truncate(limit);
        rumors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Health;
    use crate::registry::spec::{Topology, UpdateStrategy};
    use crate::types::SysInfo;
    use proptest::prelude::*;

    fn member(id: &str, incarnation: u64, health: Health) -> Member {
        Member::new(id, format!("{id}:9638"))
            .with_incarnation(incarnation)
            .with_health(health)
    }

    fn service(member_id: &str, incarnation: u64) -> ServiceRumor {
        ServiceRumor {
            member_id: member_id.to_string(),
            service_group: "effortless.default".parse().unwrap(),
            incarnation,
            pkg: "klm/effortless".to_string(),
            topology: Topology::Standalone,
            update_strategy: UpdateStrategy::AtOnce,
            sys: SysInfo::default(),
            cfg: serde_json::Value::Null,
            running: true,
            rumor_seq: 0,
        }
    }

    #[test]
    fn stale_rumor_never_changes_health() {
        let store = MembershipStore::new();
        store.upsert(member("a", 5, Health::Alive)).unwrap();

        for (incarnation, health) in [
            (4, Health::Confirmed),
            (4, Health::Departed),
            (0, Health::Suspect),
            (5, Health::Alive),
        ] {
            let err = store.upsert(member("a", incarnation, health)).unwrap_err();
            assert!(matches!(err, SupError::IncarnationConflict { .. }));
            assert_eq!(store.health_of("a"), Some(Health::Alive));
        }
    }

    #[test]
    fn applying_older_after_newer_is_a_no_op_in_any_order() {
        let healths = [Health::Alive, Health::Suspect, Health::Confirmed, Health::Departed];
        for &older in &healths {
            for &newer in &healths {
                let store = MembershipStore::new();
                store.upsert(member("a", 7, newer)).unwrap();
                let before = store.update_counter();
                assert!(store.upsert(member("a", 6, older)).is_err());
                assert_eq!(store.health_of("a"), Some(newer));
                assert_eq!(store.update_counter(), before);
            }
        }
    }

    #[test]
    fn every_change_advances_rumor_seq() {
        let store = MembershipStore::new();
        let first = store.upsert(member("a", 1, Health::Alive)).unwrap();
        let second = store.upsert(member("a", 1, Health::Suspect)).unwrap();
        assert!(second.rumor_seq > first.rumor_seq);
        assert_eq!(store.update_counter(), second.rumor_seq);
    }

    #[test]
    fn list_is_in_join_order() {
        let store = MembershipStore::new();
        store.upsert(member("c", 1, Health::Alive)).unwrap();
        store.upsert(member("a", 1, Health::Alive)).unwrap();
        store.upsert(member("b", 1, Health::Alive)).unwrap();
        // an update does not move a member in the ordering
        store.upsert(member("c", 2, Health::Alive)).unwrap();

        let ids: Vec<_> = store.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn service_rumors_are_incarnation_monotonic() {
        let store = MembershipStore::new();
        store.upsert_service(service("a", 2)).unwrap();
        assert!(store.upsert_service(service("a", 2)).is_err());
        assert!(store.upsert_service(service("a", 1)).is_err());
        let mut stopped = service("a", 3);
        stopped.running = false;
        store.upsert_service(stopped).unwrap();
        assert!(!store.services()[0].running);
    }

    #[test]
    fn remove_drops_member_services() {
        let store = MembershipStore::new();
        store.upsert(member("a", 1, Health::Departed)).unwrap();
        store.upsert_service(service("a", 1)).unwrap();
        assert!(store.remove("a").is_some());
        assert!(store.get("a").is_none());
        assert!(store.services().is_empty());
    }

    #[test]
    fn rumors_since_returns_only_newer_changes() {
        let store = MembershipStore::new();
        store.upsert(member("a", 1, Health::Alive)).unwrap();
        let mark = store.update_counter();
        store.upsert(member("b", 1, Health::Alive)).unwrap();
        store.upsert_service(service("b", 1)).unwrap();

        let rumors = store.rumors_since(mark);
        assert_eq!(rumors.len(), 2);
        assert!(matches!(&rumors[0], Rumor::Member(m) if m.id == "b"));
        assert!(matches!(&rumors[1], Rumor::Service(_)));
        assert_eq!(store.recent_rumors(1).len(), 1);
        assert!(matches!(&store.recent_rumors(1)[0], Rumor::Service(_)));
    }

    #[test]
    fn readers_see_whole_updates_while_writers_run() {
        let store = MembershipStore::new();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..=500u64 {
                    store.upsert(member("a", i, Health::Alive)).unwrap();
                    store.upsert_service(service("a", i)).unwrap();
                }
            })
        };
        for _ in 0..500 {
            let snap = store.snapshot();
            if let Some(m) = snap.member("a") {
                assert!(m.rumor_seq <= snap.update_counter);
            }
            for s in &snap.services {
                assert!(s.rumor_seq <= snap.update_counter);
            }
        }
        writer.join().unwrap();
        assert_eq!(store.get("a").unwrap().incarnation, 500);
    }

    const HEALTHS: [Health; 4] = [Health::Alive, Health::Suspect, Health::Confirmed, Health::Departed];

    fn arb_claim() -> impl Strategy<Value = (u64, Health)> {
        (0u64..6, 0usize..4).prop_map(|(incarnation, health)| (incarnation, HEALTHS[health]))
    }

    fn rank((incarnation, health): (u64, Health)) -> (u64, u8) {
        (incarnation, health.precedence())
    }

    proptest! {
        #[test]
        fn older_claim_after_newer_leaves_health_alone(a in arb_claim(), b in arb_claim()) {
            let (newer, older) = if rank(a) >= rank(b) { (a, b) } else { (b, a) };
            let store = MembershipStore::new();
            store.upsert(member("a", newer.0, newer.1)).unwrap();
            let before = store.update_counter();

            prop_assert!(store.upsert(member("a", older.0, older.1)).is_err());
            prop_assert_eq!(store.health_of("a"), Some(newer.1));
            prop_assert_eq!(store.update_counter(), before);
        }

        #[test]
        fn stored_claim_is_the_strongest_seen(claims in proptest::collection::vec(arb_claim(), 1..16)) {
            let store = MembershipStore::new();
            let mut strongest = claims[0];
            for &claim in &claims {
                let _ = store.upsert(member("a", claim.0, claim.1));
                if rank(claim) > rank(strongest) {
                    strongest = claim;
                }
                let stored = store.get("a").unwrap();
                prop_assert_eq!((stored.incarnation, stored.health), strongest);
            }
        }
    }
}
