//! Defaults, then an optional TOML file, then flags and environment.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SupError;

pub const DEFAULT_ROOT: &str = "/hab";
pub const DEFAULT_GOSSIP_PORT: u16 = 9638;
pub const DEFAULT_HTTP_PORT: u16 = 9631;

/// SWIM knobs.
#[derive(Clone, Debug, PartialEq)]
pub struct SwimTiming {
    pub probe_interval: Duration,
    pub ping_timeout: Duration,
    pub pingreq_timeout: Duration,
    pub suspicion_timeout: Duration,
    pub departed_retention: Duration,
    /// Peers probed directly each tick (k).
    pub fanout: usize,
    /// Relays asked to probe indirectly after a failed ping (m).
    pub indirect_probes: usize,
    pub piggyback_limit: usize,
    /// Full state exchange with one peer every this many ticks.
    pub sync_every: u64,
}

impl Default for SwimTiming {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(1),
            pingreq_timeout: Duration::from_secs(2),
            suspicion_timeout: Duration::from_secs(10),
            departed_retention: Duration::from_secs(3600),
            fanout: 3,
            indirect_probes: 3,
            piggyback_limit: 16,
            sync_every: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupConfig {
    pub root: PathBuf,
    pub member_id: Option<String>,
    pub listen_gossip: SocketAddr,
    pub listen_http: SocketAddr,
    pub http_disable: bool,
    pub peers: Vec<String>,
    pub permanent_peer: bool,
    pub gateway_auth_token: Option<String>,
    pub ring_key: Option<String>,
    pub org: Option<String>,
    pub spec_scan_interval: Duration,
    pub swim: SwimTiming,
}

impl Default for SupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            member_id: None,
            listen_gossip: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT)),
            listen_http: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            http_disable: false,
            peers: Vec::new(),
            permanent_peer: false,
            gateway_auth_token: None,
            ring_key: None,
            org: None,
            spec_scan_interval: Duration::from_secs(5),
            swim: SwimTiming::default(),
        }
    }
}

/// One override layer. Unset fields leave the lower layer alone.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub root: Option<PathBuf>,
    pub member_id: Option<String>,
    pub listen_gossip: Option<SocketAddr>,
    pub listen_http: Option<SocketAddr>,
    pub http_disable: Option<bool>,
    #[serde(default)]
    pub peers: Vec<String>,
    pub permanent_peer: Option<bool>,
    pub gateway_auth_token: Option<String>,
    pub ring_key: Option<String>,
    pub org: Option<String>,
    pub spec_scan_interval_ms: Option<u64>,
    pub probe_interval_ms: Option<u64>,
    pub ping_timeout_ms: Option<u64>,
    pub pingreq_timeout_ms: Option<u64>,
    pub suspicion_timeout_ms: Option<u64>,
    pub departed_retention_secs: Option<u64>,
    pub fanout: Option<usize>,
    pub indirect_probes: Option<usize>,
    pub piggyback_limit: Option<usize>,
    pub sync_every: Option<u64>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Option<Self>, SupError> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map(Some)
                .map_err(|e| SupError::parse(path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SupError::Io(e)),
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}

impl SupConfig {
    pub fn apply(&mut self, layer: ConfigLayer) {
        set(&mut self.root, layer.root);
        if layer.member_id.is_some() {
            self.member_id = layer.member_id;
        }
        set(&mut self.listen_gossip, layer.listen_gossip);
        set(&mut self.listen_http, layer.listen_http);
        set(&mut self.http_disable, layer.http_disable);
        if !layer.peers.is_empty() {
            self.peers = layer.peers;
        }
        set(&mut self.permanent_peer, layer.permanent_peer);
        if layer.gateway_auth_token.is_some() {
            self.gateway_auth_token = layer.gateway_auth_token;
        }
        if layer.ring_key.is_some() {
            self.ring_key = layer.ring_key;
        }
        if layer.org.is_some() {
            self.org = layer.org;
        }
        set(&mut self.spec_scan_interval, millis(layer.spec_scan_interval_ms));

        let swim = &mut self.swim;
        set(&mut swim.probe_interval, millis(layer.probe_interval_ms));
        set(&mut swim.ping_timeout, millis(layer.ping_timeout_ms));
        set(&mut swim.pingreq_timeout, millis(layer.pingreq_timeout_ms));
        set(&mut swim.suspicion_timeout, millis(layer.suspicion_timeout_ms));
        set(
            &mut swim.departed_retention,
            layer.departed_retention_secs.map(Duration::from_secs),
        );
        set(&mut swim.fanout, layer.fanout);
        set(&mut swim.indirect_probes, layer.indirect_probes);
        set(&mut swim.piggyback_limit, layer.piggyback_limit);
        set(&mut swim.sync_every, layer.sync_every);
    }

    /// Defaults, then `file`, then `cli`.
    pub fn resolve(file: Option<ConfigLayer>, cli: ConfigLayer) -> Result<Self, SupError> {
        let mut config = SupConfig::default();
        if let Some(file) = file {
            config.apply(file);
        }
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SupError> {
        if self.swim.fanout == 0 {
            return Err(SupError::Config("fanout must be at least 1".into()));
        }
        if self.swim.sync_every == 0 {
            return Err(SupError::Config("sync_every must be at least 1".into()));
        }
        if self.swim.probe_interval.is_zero() || self.swim.ping_timeout.is_zero() {
            return Err(SupError::Config(
                "probe interval and ping timeout must be non-zero".into(),
            ));
        }
        if matches!(&self.gateway_auth_token, Some(t) if t.is_empty()) {
            return Err(SupError::Config("gateway auth token must not be empty".into()));
        }
        if self.listen_gossip == self.listen_http {
            return Err(SupError::Config(format!(
                "gossip and http listeners both use {}",
                self.listen_gossip
            )));
        }
        Ok(())
    }

    pub fn default_file_path(root: &Path) -> PathBuf {
        root.join("sup").join("default").join("config").join("sup.toml")
    }
}
