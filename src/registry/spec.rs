//! The persisted service spec file.
//!
//! ```toml
//! ident = "klm/effortless"
//! group = "default"
//! bldr_url = "https://bldr.habitat.sh/"
//! channel = "unstable"
//! topology = "standalone"
//! update_strategy = "at-once"
//! update_condition = "latest"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SupError;
use crate::registry::ident::{Bind, PackageIdent, ServiceGroup};

pub const DEFAULT_BLDR_URL: &str = "https://bldr.habitat.sh/";
pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_GROUP: &str = "default";
pub const SPEC_FILE_EXT: &str = "spec";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    Standalone,
    Leader,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    #[default]
    None,
    Rolling,
    AtOnce,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateCondition {
    #[default]
    Latest,
    TrackChannel,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DesiredState {
    #[default]
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    pub ident: PackageIdent,
    service_group: ServiceGroup,
    pub bldr_url: String,
    pub channel: String,
    pub topology: Topology,
    pub update_strategy: UpdateStrategy,
    pub update_condition: UpdateCondition,
    pub binds: Vec<Bind>,
    pub desired_state: DesiredState,
}

/// On-disk shape. Every field is optional so a missing one can be reported
/// as a validation failure instead of a parse failure.
#[derive(Serialize, Deserialize, Default)]
struct SpecFile {
    ident: Option<String>,
    group: Option<String>,
    bldr_url: Option<String>,
    channel: Option<String>,
    topology: Option<Topology>,
    update_strategy: Option<UpdateStrategy>,
    update_condition: Option<UpdateCondition>,
    #[serde(default)]
    binds: Vec<String>,
    desired_state: Option<DesiredState>,
}

impl ServiceSpec {
    /// Spec with the defaults `svc load` would use.
    #[cfg(test)]
    pub fn new(ident: PackageIdent, group: &str, topology: Topology) -> Result<Self, String> {
        let service_group = ServiceGroup::new(&ident.name, group)?;
        Ok(Self {
            ident,
            service_group,
            bldr_url: DEFAULT_BLDR_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            topology,
            update_strategy: UpdateStrategy::default(),
            update_condition: UpdateCondition::default(),
            binds: Vec::new(),
            desired_state: DesiredState::default(),
        })
    }

    /// Parse and validate spec file contents. `path` is only used in errors.
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self, SupError> {
        let raw: SpecFile = toml::from_str(contents).map_err(|e| SupError::parse(path, e))?;

        let ident = raw
            .ident
            .ok_or_else(|| SupError::validation(path, "missing required field 'ident'"))?
            .parse::<PackageIdent>()
            .map_err(|e| SupError::validation(path, e))?;
        let group = raw
            .group
            .ok_or_else(|| SupError::validation(path, "missing required field 'group'"))?;
        let topology = raw
            .topology
            .ok_or_else(|| SupError::validation(path, "missing required field 'topology'"))?;

        let service_group =
            ServiceGroup::new(&ident.name, &group).map_err(|e| SupError::validation(path, e))?;

        let bldr_url = raw.bldr_url.unwrap_or_else(|| DEFAULT_BLDR_URL.to_string());
        if !bldr_url.contains("://") {
            return Err(SupError::validation(
                path,
                format!("bldr_url '{}' has no scheme", bldr_url),
            ));
        }

        let binds = raw
            .binds
            .iter()
            .map(|b| b.parse::<Bind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SupError::validation(path, e))?;

        Ok(Self {
            ident,
            service_group,
            bldr_url,
            channel: raw.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            topology,
            update_strategy: raw.update_strategy.unwrap_or_default(),
            update_condition: raw.update_condition.unwrap_or_default(),
            binds,
            desired_state: raw.desired_state.unwrap_or_default(),
        })
    }

    pub fn to_toml(&self) -> Result<String, SupError> {
        let raw = SpecFile {
            ident: Some(self.ident.to_string()),
            group: Some(self.group().to_string()),
            bldr_url: Some(self.bldr_url.clone()),
            channel: Some(self.channel.clone()),
            topology: Some(self.topology),
            update_strategy: Some(self.update_strategy),
            update_condition: Some(self.update_condition),
            binds: self.binds.iter().map(|b| b.to_string()).collect(),
            desired_state: Some(self.desired_state),
        };
        toml::to_string(&raw).map_err(|e| SupError::Codec(e.to_string()))
    }

    /// Name of the service, which is also the spec file stem.
    pub fn service_name(&self) -> &str {
        &self.ident.name
    }

    pub fn group(&self) -> &str {
        self.service_group.group()
    }

    pub fn service_group(&self) -> &ServiceGroup {
        &self.service_group
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.service_name(), SPEC_FILE_EXT)
    }
}
