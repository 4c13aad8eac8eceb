//! In-process ring for tests: engines talk to each other through a shared
//! map instead of sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::SwimTiming;
use crate::error::SupError;
use crate::gossip::engine::GossipEngine;
use crate::gossip::transport::Transport;
use crate::gossip::wire::GossipMessage;
use crate::member::Member;
use crate::membership_store::MembershipStore;

#[derive(Default)]
pub(crate) struct MemNet {
    nodes: Mutex<HashMap<String, Arc<GossipEngine>>>,
    down: Mutex<HashSet<String>>,
    blocked: Mutex<HashSet<(String, String)>>,
}

impl MemNet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start an engine whose id and address are both `id`.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        id: &str,
        timing: SwimTiming,
        seeds: Vec<String>,
    ) -> Arc<GossipEngine> {
        let transport = MemTransport {
            net: Arc::downgrade(self),
            from: id.to_string(),
        };
        let engine = Arc::new(GossipEngine::new(
            Member::new(id, id),
            MembershipStore::new(),
            Arc::new(transport),
            timing,
            seeds,
        ));
        self.nodes.lock().insert(id.to_string(), engine.clone());
        engine
    }

    /// `n0..n{count}`, everyone seeded with `n0`.
    pub(crate) fn spawn_ring(self: &Arc<Self>, count: usize, timing: SwimTiming) -> Vec<Arc<GossipEngine>> {
        (0..count)
            .map(|i| {
                let seeds = if i == 0 { vec![] } else { vec!["n0".to_string()] };
                self.spawn(&format!("n{i}"), timing.clone(), seeds)
            })
            .collect()
    }

    /// Requests to `id` hang until the caller's deadline.
    pub(crate) fn take_down(&self, id: &str) {
        self.down.lock().insert(id.to_string());
    }

    pub(crate) fn bring_up(&self, id: &str) {
        self.down.lock().remove(id);
    }

    /// Cut the one-way link `from -> to`.
    pub(crate) fn block(&self, from: &str, to: &str) {
        self.blocked.lock().insert((from.to_string(), to.to_string()));
    }
}

struct MemTransport {
    net: Weak<MemNet>,
    from: String,
}

#[async_trait]
impl Transport for MemTransport {
    async fn request(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage, SupError> {
        let unreachable = || SupError::Network {
            addr: addr.to_string(),
            reason: "unreachable".into(),
        };
        let net = self.net.upgrade().ok_or_else(unreachable)?;
        if net.down.lock().contains(addr) {
            std::future::pending::<()>().await;
        }
        if net
            .blocked
            .lock()
            .contains(&(self.from.clone(), addr.to_string()))
        {
            return Err(unreachable());
        }
        let engine = net.nodes.lock().get(addr).cloned().ok_or_else(unreachable)?;
        engine
            .handle(message)
            .await
            .ok_or_else(|| SupError::Codec("no reply".into()))
    }
}
