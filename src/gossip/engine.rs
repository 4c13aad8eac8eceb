//! SWIM failure detection and rumor dissemination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::SwimTiming;
use crate::error::SupError;
use crate::gossip::transport::Transport;
use crate::gossip::wire::GossipMessage;
use crate::member::{Health, Member, Rumor, ServiceRumor};
use crate::membership_store::MembershipStore;
use crate::types::MemberId;

#[derive(Clone, Copy, Debug)]
struct Suspicion {
    incarnation: u64,
    deadline: Instant,
}

#[derive(Default)]
struct EngineState {
    suspicions: HashMap<MemberId, Suspicion>,
    departures: HashMap<MemberId, Instant>,
    ticks: u64,
}

/// What one tick did, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub probed: Vec<MemberId>,
    pub suspected: Vec<MemberId>,
    pub confirmed: Vec<MemberId>,
    pub expired: Vec<MemberId>,
    pub synced: bool,
}

pub struct GossipEngine {
    local_id: MemberId,
    store: MembershipStore,
    transport: Arc<dyn Transport>,
    timing: SwimTiming,
    seeds: Vec<String>,
    state: Mutex<EngineState>,
}

impl GossipEngine {
    /// `local` is this member's own record; it is written into `store`.
    pub fn new(
        local: Member,
        store: MembershipStore,
        transport: Arc<dyn Transport>,
        timing: SwimTiming,
        seeds: Vec<String>,
    ) -> Self {
        let local_id = local.id.clone();
        if let Err(e) = store.upsert(local.clone().with_health(Health::Alive)) {
            debug!("Local member already known: {}", e);
        }
        Self {
            local_id,
            store,
            transport,
            timing,
            seeds,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn local_id(&self) -> &MemberId {
        &self.local_id
    }

    pub fn store(&self) -> &MembershipStore {
        &self.store
    }

    pub fn timing(&self) -> &SwimTiming {
        &self.timing
    }

    fn me(&self) -> Option<Member> {
        self.store.get(&self.local_id)
    }

    /// Fold one rumor into local state. Returns true if anything changed.
    /// Stale rumors are dropped without complaint.
    pub fn apply_rumor(&self, rumor: Rumor) -> bool {
        match rumor {
            Rumor::Member(member) => self.apply_member(member),
            Rumor::Service(service) => self.publish_service(service),
        }
    }

    pub fn publish_service(&self, rumor: ServiceRumor) -> bool {
        match self.store.upsert_service(rumor) {
            Ok(stored) => {
                trace!(
                    "Service rumor {} from {} (incarnation {})",
                    stored.service_group,
                    stored.member_id,
                    stored.incarnation
                );
                true
            }
            Err(SupError::IncarnationConflict { .. }) => false,
            Err(e) => {
                debug!("Dropping service rumor: {}", e);
                false
            }
        }
    }

    fn apply_member(&self, member: Member) -> bool {
        if member.id == self.local_id {
            return self.apply_about_me(member);
        }
        match self.store.upsert(member) {
            Ok(stored) => {
                self.track(&stored);
                true
            }
            Err(SupError::IncarnationConflict { .. }) => false,
            Err(e) => {
                debug!("Dropping member rumor: {}", e);
                false
            }
        }
    }

    /// Rumors about ourselves: refute suspicion by outbidding its incarnation.
    fn apply_about_me(&self, rumor: Member) -> bool {
        let Some(me) = self.me() else {
            return false;
        };
        if me.health == Health::Departed || rumor.incarnation < me.incarnation {
            return false;
        }
        match rumor.health {
            Health::Departed => {
                warn!("This member has been departed from the ring");
                self.store.upsert(rumor).is_ok()
            }
            Health::Alive if rumor.incarnation > me.incarnation => {
                // Someone remembers a later life of ours; catch up to it.
                self.store
                    .upsert(me.with_incarnation(rumor.incarnation))
                    .is_ok()
            }
            Health::Alive => false,
            Health::Suspect | Health::Confirmed => {
                let incarnation = rumor.incarnation + 1;
                info!(
                    "Refuting {} rumor about ourselves with incarnation {}",
                    rumor.health, incarnation
                );
                self.store
                    .upsert(
                        me.with_incarnation(incarnation)
                            .with_health(Health::Alive),
                    )
                    .is_ok()
            }
        }
    }

    fn track(&self, stored: &Member) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match stored.health {
            Health::Alive => {
                state.suspicions.remove(&stored.id);
                state.departures.remove(&stored.id);
            }
            Health::Suspect => {
                let restart = state
                    .suspicions
                    .get(&stored.id)
                    .is_none_or(|s| s.incarnation != stored.incarnation);
                if restart {
                    info!("Member {} is now Suspect", stored.id);
                    state.suspicions.insert(
                        stored.id.clone(),
                        Suspicion {
                            incarnation: stored.incarnation,
                            deadline: now + self.timing.suspicion_timeout,
                        },
                    );
                }
            }
            Health::Confirmed => {
                state.suspicions.remove(&stored.id);
            }
            Health::Departed => {
                state.suspicions.remove(&stored.id);
                state.departures.entry(stored.id.clone()).or_insert(now);
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport {
            confirmed: self.expire_suspicions(now),
            expired: self.collect_departed(now),
            ..Default::default()
        };

        let targets = self.select_targets();
        let outcomes = join_all(targets.iter().map(|target| self.probe(target))).await;
        for (target, acked) in targets.iter().zip(outcomes) {
            report.probed.push(target.id.clone());
            if !acked && self.suspect(&target.id) {
                report.suspected.push(target.id.clone());
            }
        }

        let tick = {
            let mut state = self.state.lock();
            state.ticks += 1;
            state.ticks
        };
        if tick % self.timing.sync_every == 0 {
            report.synced = self.anti_entropy().await;
        }
        report
    }

    fn expire_suspicions(&self, now: Instant) -> Vec<MemberId> {
        let due: Vec<(MemberId, u64)> = {
            let mut state = self.state.lock();
            let due: Vec<(MemberId, u64)> = state
                .suspicions
                .iter()
                .filter(|(_, s)| s.deadline <= now)
                .map(|(id, s)| (id.clone(), s.incarnation))
                .collect();
            for (id, _) in &due {
                state.suspicions.remove(id);
            }
            due
        };

        let mut confirmed = Vec::new();
        for (id, incarnation) in due {
            let Some(member) = self.store.get(&id) else {
                continue;
            };
            if member.health != Health::Suspect || member.incarnation != incarnation {
                continue;
            }
            if self
                .store
                .upsert(member.with_health(Health::Confirmed))
                .is_ok()
            {
                info!("Member {} is now Confirmed", id);
                confirmed.push(id);
            }
        }
        confirmed
    }

    fn collect_departed(&self, now: Instant) -> Vec<MemberId> {
        let retention = self.timing.departed_retention;
        let expired: Vec<MemberId> = {
            let mut state = self.state.lock();
            let expired: Vec<MemberId> = state
                .departures
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= retention)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.departures.remove(id);
            }
            expired
        };
        for id in &expired {
            if self.store.remove(id).is_some() {
                info!("Forgot departed member {}", id);
            }
        }
        expired
    }

    /// Peers worth probing: everyone alive or suspect, plus confirmed
    /// members that are permanent peers.
    fn probe_candidates(&self) -> Vec<Member> {
        self.store
            .list()
            .into_iter()
            .filter(|m| m.id != self.local_id)
            .filter(|m| match m.health {
                Health::Alive | Health::Suspect => true,
                Health::Confirmed => m.persistent,
                Health::Departed => false,
            })
            .collect()
    }

    fn select_targets(&self) -> Vec<Member> {
        let mut candidates = self.probe_candidates();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(self.timing.fanout);
        candidates
    }

    fn select_relays(&self, target: &str) -> Vec<Member> {
        let mut relays: Vec<Member> = self
            .store
            .list()
            .into_iter()
            .filter(|m| m.id != self.local_id && m.id != target && m.health == Health::Alive)
            .collect();
        relays.shuffle(&mut rand::rng());
        relays.truncate(self.timing.indirect_probes);
        relays
    }

    /// Recent rumors, always including the latest word on `about` so a
    /// suspected peer learns of it in the same exchange.
    fn piggyback(&self, about: Option<&str>) -> Vec<Rumor> {
        let mut rumors = self.store.recent_rumors(self.timing.piggyback_limit);
        if let Some(id) = about {
            let included = rumors
                .iter()
                .any(|r| matches!(r, Rumor::Member(m) if m.id == id));
            if !included {
                if let Some(member) = self.store.get(id) {
                    rumors.push(Rumor::Member(member));
                }
            }
        }
        rumors
    }

    /// Send with a hard deadline. A reply that arrives later is dropped.
    async fn exchange(
        &self,
        addr: &str,
        message: GossipMessage,
        deadline: Duration,
    ) -> Result<GossipMessage, SupError> {
        match time::timeout(deadline, self.transport.request(addr, message)).await {
            Ok(result) => result,
            Err(_) => Err(SupError::NetworkTimeout {
                addr: addr.to_string(),
                timeout: deadline,
            }),
        }
    }

    fn absorb(&self, rumors: Vec<Rumor>) {
        for rumor in rumors {
            self.apply_rumor(rumor);
        }
    }

    /// Direct ping, then indirect probes. True if anyone got an ack.
    async fn probe(&self, target: &Member) -> bool {
        let Some(me) = self.me() else {
            return false;
        };
        let ping = GossipMessage::Ping {
            from: me.clone(),
            rumors: self.piggyback(Some(&target.id)),
        };
        match self
            .exchange(&target.address, ping, self.timing.ping_timeout)
            .await
        {
            Ok(GossipMessage::Ack { from, rumors }) => {
                self.apply_member(from);
                self.absorb(rumors);
                return true;
            }
            Ok(other) => debug!("Unexpected {} from {}", other.kind(), target.id),
            Err(e) => debug!("Ping to {} failed: {}", target.id, e),
        }

        let relays = self.select_relays(&target.id);
        if relays.is_empty() {
            return false;
        }
        trace!("Probing {} through {} relays", target.id, relays.len());
        let requests = relays.iter().map(|relay| {
            let req = GossipMessage::PingReq {
                from: me.clone(),
                target: target.clone(),
            };
            self.exchange(&relay.address, req, self.timing.pingreq_timeout)
        });
        let mut acked = false;
        for reply in join_all(requests).await {
            match reply {
                Ok(GossipMessage::Ack { from, rumors }) => {
                    self.apply_member(from);
                    self.absorb(rumors);
                    acked = true;
                }
                Ok(_) => {}
                Err(e) => trace!("Ping-req for {} failed: {}", target.id, e),
            }
        }
        acked
    }

    /// Mark `id` suspect at its current incarnation. False if it was not
    /// alive.
    fn suspect(&self, id: &str) -> bool {
        let Some(member) = self.store.get(id) else {
            return false;
        };
        if member.health != Health::Alive {
            return false;
        }
        match self.store.upsert(member.with_health(Health::Suspect)) {
            Ok(stored) => {
                self.track(&stored);
                true
            }
            Err(_) => false,
        }
    }

    /// Push-pull full state with one random live peer, falling back to the
    /// seed list while we know nobody.
    pub async fn anti_entropy(&self) -> bool {
        let peer = {
            let mut alive: Vec<Member> = self
                .store
                .list()
                .into_iter()
                .filter(|m| m.id != self.local_id && m.health == Health::Alive)
                .collect();
            alive.shuffle(&mut rand::rng());
            alive.into_iter().next()
        };
        match peer {
            Some(peer) => self.sync_with(&peer.address).await.is_ok(),
            None => self.join().await > 0,
        }
    }

    /// Sync with all seeds concurrently. Returns how many answered.
    pub async fn join(&self) -> usize {
        let attempts = join_all(self.seeds.iter().map(|seed| self.sync_with(seed))).await;
        let mut joined = 0;
        for (seed, result) in self.seeds.iter().zip(attempts) {
            match result {
                Ok(()) => {
                    info!("Joined ring through {}", seed);
                    joined += 1;
                }
                Err(e) => debug!("Seed {} unavailable: {}", seed, e),
            }
        }
        joined
    }

    async fn sync_with(&self, addr: &str) -> Result<(), SupError> {
        let Some(me) = self.me() else {
            return Err(SupError::Config("local member missing from store".into()));
        };
        let sync = GossipMessage::Sync {
            from: me,
            rumors: self.store.rumors_since(0),
        };
        match self
            .exchange(addr, sync, self.timing.pingreq_timeout)
            .await?
        {
            GossipMessage::SyncReply { rumors } => {
                self.absorb(rumors);
                Ok(())
            }
            other => Err(SupError::Codec(format!(
                "expected sync_reply, got {}",
                other.kind()
            ))),
        }
    }

    /// Mark `member_id` departed locally; the rumor spreads from here.
    pub fn depart(&self, member_id: &str) -> bool {
        let Some(member) = self.store.get(member_id) else {
            return false;
        };
        self.apply_member(member.with_health(Health::Departed))
    }

    /// Serve one inbound message. `None` means no reply is owed.
    pub async fn handle(&self, message: GossipMessage) -> Option<GossipMessage> {
        let me = self.me()?;
        match message {
            GossipMessage::Ping { from, rumors } => {
                let sender = from.id.clone();
                self.apply_member(from);
                self.absorb(rumors);
                Some(GossipMessage::Ack {
                    from: self.me().unwrap_or(me),
                    rumors: self.piggyback(Some(&sender)),
                })
            }
            GossipMessage::PingReq { from, target } => {
                self.apply_member(from);
                let ping = GossipMessage::Ping {
                    from: me.clone(),
                    rumors: self.piggyback(Some(&target.id)),
                };
                match self
                    .exchange(&target.address, ping, self.timing.ping_timeout)
                    .await
                {
                    Ok(GossipMessage::Ack { from, rumors }) => {
                        self.apply_member(from.clone());
                        self.absorb(rumors);
                        Some(GossipMessage::Ack {
                            from,
                            rumors: Vec::new(),
                        })
                    }
                    _ => Some(GossipMessage::Nack { from: me }),
                }
            }
            GossipMessage::Sync { from, rumors } => {
                self.apply_member(from);
                self.absorb(rumors);
                Some(GossipMessage::SyncReply {
                    rumors: self.store.rumors_since(0),
                })
            }
            GossipMessage::Depart { member_id } => {
                if self.depart(&member_id) {
                    info!("Member {} departed by request", member_id);
                }
                Some(GossipMessage::Ack {
                    from: me,
                    rumors: Vec::new(),
                })
            }
            GossipMessage::Ack { .. } | GossipMessage::Nack { .. } | GossipMessage::SyncReply { .. } => {
                debug!("Ignoring unsolicited {}", message.kind());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::testing::MemNet;

    fn timing() -> SwimTiming {
        SwimTiming {
            suspicion_timeout: Duration::from_secs(5),
            departed_retention: Duration::from_secs(30),
            sync_every: 1,
            ..SwimTiming::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_member_rumor_creates_member() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        assert!(a.apply_rumor(Rumor::Member(Member::new("b", "b"))));
        assert_eq!(a.store().health_of("b"), Some(Health::Alive));
        // the same rumor again changes nothing
        assert!(!a.apply_rumor(Rumor::Member(Member::new("b", "b"))));
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_rumors_resolve_by_incarnation_then_precedence() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let b = |inc, health| Rumor::Member(Member::new("b", "b").with_incarnation(inc).with_health(health));

        assert!(a.apply_rumor(b(2, Health::Alive)));
        assert!(a.apply_rumor(b(2, Health::Suspect)));
        assert!(!a.apply_rumor(b(2, Health::Alive)));
        assert!(a.apply_rumor(b(2, Health::Confirmed)));
        assert!(!a.apply_rumor(b(1, Health::Alive)));
        assert_eq!(a.store().health_of("b"), Some(Health::Confirmed));
        assert!(a.apply_rumor(b(3, Health::Alive)));
        assert_eq!(a.store().health_of("b"), Some(Health::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn suspicion_about_self_is_refuted() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let rumor = Member::new("a", "a").with_incarnation(0).with_health(Health::Suspect);
        assert!(a.apply_rumor(Rumor::Member(rumor)));
        let me = a.store().get("a").unwrap();
        assert_eq!(me.health, Health::Alive);
        assert_eq!(me.incarnation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn five_members_converge_through_one_seed() {
        let net = MemNet::new();
        let engines = net.spawn_ring(5, timing());
        for engine in &engines {
            engine.join().await;
        }
        for _ in 0..3 {
            for engine in &engines {
                engine.tick().await;
            }
        }
        for engine in &engines {
            let members = engine.store().list();
            assert_eq!(members.len(), 5, "{} sees {:?}", engine.local_id(), members);
            assert!(members.iter().all(|m| m.health == Health::Alive));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_member_is_confirmed_exactly_once() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let _b = net.spawn("b", timing(), vec![]);
        a.apply_rumor(Rumor::Member(Member::new("b", "b")));
        net.take_down("b");

        let first = a.tick().await;
        assert_eq!(first.suspected, vec!["b".to_string()]);
        assert_eq!(a.store().health_of("b"), Some(Health::Suspect));

        let mut confirmations = 0;
        for _ in 0..20 {
            time::advance(Duration::from_secs(1)).await;
            let report = a.tick().await;
            assert!(report.suspected.is_empty());
            confirmations += report.confirmed.len();
        }
        assert_eq!(confirmations, 1);
        assert_eq!(a.store().health_of("b"), Some(Health::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn suspect_that_comes_back_refutes_and_is_not_confirmed() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let _b = net.spawn("b", timing(), vec![]);
        a.apply_rumor(Rumor::Member(Member::new("b", "b")));
        net.take_down("b");
        a.tick().await;
        assert_eq!(a.store().health_of("b"), Some(Health::Suspect));

        net.bring_up("b");
        a.tick().await;
        let b = a.store().get("b").unwrap();
        assert_eq!(b.health, Health::Alive);
        assert_eq!(b.incarnation, 1);

        time::advance(Duration::from_secs(10)).await;
        let report = a.tick().await;
        assert!(report.confirmed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn indirect_probe_keeps_member_alive() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let _b = net.spawn("b", timing(), vec![]);
        let _c = net.spawn("c", timing(), vec![]);
        a.apply_rumor(Rumor::Member(Member::new("b", "b")));
        a.apply_rumor(Rumor::Member(Member::new("c", "c")));
        net.block("a", "b");

        let report = a.tick().await;
        assert!(report.suspected.is_empty(), "{report:?}");
        assert_eq!(a.store().health_of("b"), Some(Health::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn departed_members_are_forgotten_after_retention() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        a.apply_rumor(Rumor::Member(Member::new("b", "b")));
        let reply = a
            .handle(GossipMessage::Depart {
                member_id: "b".into(),
            })
            .await;
        assert!(matches!(reply, Some(GossipMessage::Ack { .. })));
        assert_eq!(a.store().health_of("b"), Some(Health::Departed));

        // departed members are not probed
        assert!(a.tick().await.probed.is_empty());

        time::advance(Duration::from_secs(31)).await;
        let report = a.tick().await;
        assert_eq!(report.expired, vec!["b".to_string()]);
        assert!(a.store().get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn departed_local_member_does_not_refute() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        assert!(a.depart("a"));
        let suspect = Member::new("a", "a").with_incarnation(5).with_health(Health::Suspect);
        assert!(!a.apply_rumor(Rumor::Member(suspect)));
        assert_eq!(a.store().health_of("a"), Some(Health::Departed));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_seeds_cost_one_sync_deadline_per_tick() {
        let net = MemNet::new();
        let seeds: Vec<String> = (0..5).map(|i| format!("s{i}")).collect();
        for seed in &seeds {
            net.spawn(seed, timing(), vec![]);
            net.take_down(seed);
        }
        let a = net.spawn("a", timing(), seeds);

        let start = Instant::now();
        let report = a.tick().await;
        assert!(!report.synced);
        assert!(start.elapsed() <= timing().pingreq_timeout, "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn seed_that_comes_back_is_joined_on_a_later_tick() {
        let net = MemNet::new();
        let seed = net.spawn("s", timing(), vec![]);
        let a = net.spawn("a", timing(), vec!["s".to_string()]);
        net.take_down("s");

        assert!(!a.tick().await.synced);
        assert!(a.store().get("s").is_none());

        net.bring_up("s");
        assert!(a.tick().await.synced);
        assert_eq!(a.store().get("s").map(|m| m.health), Some(Health::Alive));
        assert_eq!(seed.store().get("a").map(|m| m.health), Some(Health::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn only_permanent_peers_are_pinged_once_confirmed() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let _b = net.spawn("b", timing(), vec![]);
        let _c = net.spawn("c", timing(), vec![]);
        let mut permanent = Member::new("b", "b");
        permanent.persistent = true;
        a.apply_rumor(Rumor::Member(permanent));
        a.apply_rumor(Rumor::Member(Member::new("c", "c")));
        net.take_down("b");
        net.take_down("c");

        assert_eq!(a.tick().await.suspected.len(), 2);
        time::advance(Duration::from_secs(6)).await;
        let report = a.tick().await;
        assert_eq!(report.confirmed.len(), 2);
        assert_eq!(report.probed, vec!["b".to_string()]);

        net.bring_up("b");
        net.bring_up("c");
        let report = a.tick().await;
        assert_eq!(report.probed, vec!["b".to_string()]);
        let b = a.store().get("b").unwrap();
        assert_eq!(b.health, Health::Alive);
        assert_eq!(b.incarnation, 1);
        assert_eq!(a.store().get("c").map(|m| m.health), Some(Health::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_replies_get_no_answer() {
        let net = MemNet::new();
        let a = net.spawn("a", timing(), vec![]);
        let reply = a
            .handle(GossipMessage::SyncReply { rumors: vec![] })
            .await;
        assert!(reply.is_none());
    }
}
