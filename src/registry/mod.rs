//! The specs this member has loaded.

pub mod ident;
pub mod spec;
pub mod user_config;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::SupError;
use crate::member::ServiceRumor;
use crate::spec_dir::SpecDir;
use crate::types::{MemberId, SysInfo};
use ident::{Bind, PackageIdent, ServiceGroup};
use spec::{DesiredState, ServiceSpec, Topology, UpdateCondition, UpdateStrategy};
use user_config::ResolvedConfig;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Clone, Debug)]
struct ServiceEntry {
    spec: Arc<ServiceSpec>,
    config: Arc<ResolvedConfig>,
    spec_path: PathBuf,
    modified: Option<SystemTime>,
    loaded_at: DateTime<Utc>,
    /// Bumped on every load and unload so peers can order our service rumors.
    incarnation: u64,
    loaded: bool,
}

impl ServiceEntry {
    fn status(&self) -> ServiceStatus {
        match (self.loaded, self.spec.desired_state) {
            (false, _) => ServiceStatus::Unknown,
            (true, DesiredState::Up) => ServiceStatus::Up,
            (true, DesiredState::Down) => ServiceStatus::Down,
        }
    }
}

/// What the gateway reports for a loaded service.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ServiceSummary {
    pub ident: String,
    pub service_group: ServiceGroup,
    pub status: ServiceStatus,
    pub desired_state: DesiredState,
    pub topology: Topology,
    pub update_strategy: UpdateStrategy,
    pub update_condition: UpdateCondition,
    pub channel: String,
    pub bldr_url: String,
    pub binds: Vec<Bind>,
    pub spec_file: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub failed: Vec<(PathBuf, SupError)>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.loaded.is_empty() || !self.unloaded.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    services: BTreeMap<String, ServiceEntry>,
    /// Files that failed to load, by modification time, so an unchanged bad
    /// file is not retried on every scan.
    failed: HashMap<PathBuf, SystemTime>,
}

pub struct ServiceRegistry {
    root: PathBuf,
    specs: SpecDir,
    inner: RwLock<Inner>,
}

impl ServiceRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let specs = SpecDir::under_sup_root(&root);
        Self {
            root,
            specs,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn spec_dir(&self) -> &SpecDir {
        &self.specs
    }

    /// Parse, validate and activate the spec at `path`, replacing any spec
    /// previously loaded for the same service. On error nothing changes.
    pub fn load_spec(&self, path: &Path) -> Result<Arc<ServiceSpec>, SupError> {
        let contents = fs::read_to_string(path)?;
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        let spec = ServiceSpec::from_toml(path, &contents)?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != spec.service_name() {
            return Err(SupError::validation(
                path,
                format!(
                    "file name '{}' does not match service '{}'",
                    stem,
                    spec.service_name()
                ),
            ));
        }

        let config = user_config::load_layers(&self.root, spec.service_name())?.resolve();
        let spec = Arc::new(spec);

        let mut inner = self.inner.write();
        // Start from the wall clock so a restarted supervisor outbids the
        // rumors its previous run left in the ring.
        let incarnation = inner
            .services
            .get(spec.service_name())
            .map(|e| e.incarnation + 1)
            .unwrap_or_else(|| Utc::now().timestamp_millis().max(1) as u64);
        inner.failed.remove(path);
        inner.services.insert(
            spec.service_name().to_string(),
            ServiceEntry {
                spec: spec.clone(),
                config: Arc::new(config),
                spec_path: path.to_path_buf(),
                modified,
                loaded_at: Utc::now(),
                incarnation,
                loaded: true,
            },
        );
        info!(
            "Loaded {} into {} ({:?})",
            spec.ident,
            spec.service_group(),
            spec.desired_state
        );
        Ok(spec)
    }

    pub fn unload(&self, service_name: &str) -> Option<Arc<ServiceSpec>> {
        let mut inner = self.inner.write();
        let entry = inner.services.get_mut(service_name)?;
        if !entry.loaded {
            return None;
        }
        entry.loaded = false;
        entry.incarnation += 1;
        info!("Unloaded {}", entry.spec.ident);
        Some(entry.spec.clone())
    }

    /// Accepts either a package ident (`origin/name`, with or without
    /// version) or a bare service name.
    pub fn status(&self, ident: &str) -> ServiceStatus {
        let inner = self.inner.read();
        inner
            .services
            .values()
            .find(|e| matches_ident(&e.spec, ident))
            .map(ServiceEntry::status)
            .unwrap_or(ServiceStatus::Unknown)
    }

    #[cfg(test)]
    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceSpec>> {
        let inner = self.inner.read();
        inner
            .services
            .get(service_name)
            .filter(|e| e.loaded)
            .map(|e| e.spec.clone())
    }

    pub fn loaded_specs(&self) -> BTreeMap<ServiceGroup, Arc<ServiceSpec>> {
        let inner = self.inner.read();
        inner
            .services
            .values()
            .filter(|e| e.loaded)
            .map(|e| (e.spec.service_group().clone(), e.spec.clone()))
            .collect()
    }

    pub fn summaries(&self) -> Vec<ServiceSummary> {
        let inner = self.inner.read();
        inner
            .services
            .values()
            .filter(|e| e.loaded)
            .map(|e| ServiceSummary {
                ident: e.spec.ident.to_string(),
                service_group: e.spec.service_group().clone(),
                status: e.status(),
                desired_state: e.spec.desired_state,
                topology: e.spec.topology,
                update_strategy: e.spec.update_strategy,
                update_condition: e.spec.update_condition,
                channel: e.spec.channel.clone(),
                bldr_url: e.spec.bldr_url.clone(),
                binds: e.spec.binds.clone(),
                spec_file: e.spec_path.clone(),
                loaded_at: e.loaded_at,
            })
            .collect()
    }

    /// Rumors describing every service this member has loaded or unloaded.
    pub fn service_rumors(&self, member_id: &MemberId, sys: &SysInfo) -> Vec<ServiceRumor> {
        let inner = self.inner.read();
        inner
            .services
            .values()
            .map(|e| ServiceRumor {
                member_id: member_id.clone(),
                service_group: e.spec.service_group().clone(),
                incarnation: e.incarnation,
                pkg: e.spec.ident.to_string(),
                topology: e.spec.topology,
                update_strategy: e.spec.update_strategy,
                sys: sys.clone(),
                cfg: e.config.to_json(),
                running: e.loaded && e.spec.desired_state == DesiredState::Up,
                rumor_seq: 0,
            })
            .collect()
    }

    /// Bring the registry in line with the spec directory: load new or
    /// modified files and unload services whose file disappeared.
    pub fn reconcile_dir(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let listing = match self.specs.list() {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Failed to read spec dir {}: {}", self.specs.path().display(), e);
                return report;
            }
        };

        for file in &listing {
            let (unchanged, failed_before) = {
                let inner = self.inner.read();
                let unchanged = inner.services.values().any(|e| {
                    e.loaded && e.spec_path == file.path && e.modified == Some(file.modified)
                });
                let failed_before = inner.failed.get(&file.path) == Some(&file.modified);
                (unchanged, failed_before)
            };
            if unchanged || failed_before {
                continue;
            }
            match self.load_spec(&file.path) {
                Ok(spec) => report.loaded.push(spec.service_name().to_string()),
                Err(e) => {
                    warn!(
                        "Keeping previous state, {} failed to load ({}): {}",
                        file.path.display(),
                        e.as_label(),
                        e
                    );
                    self.inner
                        .write()
                        .failed
                        .insert(file.path.clone(), file.modified);
                    report.failed.push((file.path.clone(), e));
                }
            }
        }

        let gone: Vec<String> = {
            let inner = self.inner.read();
            inner
                .services
                .iter()
                .filter(|(_, e)| e.loaded && !listing.iter().any(|f| f.path == e.spec_path))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in gone {
            if self.unload(&name).is_some() {
                report.unloaded.push(name);
            }
        }

        report
    }
}

fn matches_ident(spec: &ServiceSpec, ident: &str) -> bool {
    if ident == spec.service_name() {
        return true;
    }
    match ident.parse::<PackageIdent>() {
        Ok(wanted) => {
            wanted.origin == spec.ident.origin
                && wanted.name == spec.ident.name
                && (wanted.version.is_none() || wanted.version == spec.ident.version)
                && (wanted.release.is_none() || wanted.release == spec.ident.release)
        }
        Err(_) => false,
    }
}
