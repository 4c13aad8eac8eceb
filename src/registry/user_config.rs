//! Per-service runtime configuration.
//!
//! Layers, lowest first:
//!
//! 1. `<root>/svc/<name>/default.toml`
//! 2. `RINGSUP_SVC_<NAME>` environment variable holding a TOML document
//! 3. `<root>/user/<name>/config/user.toml`
//!
//! Tables merge key by key; any other value in a higher layer replaces the
//! lower one outright, arrays included. The result is frozen at load time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::debug;

use crate::error::SupError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigLayers {
    pub defaults: Option<Table>,
    pub environment: Option<Table>,
    pub user: Option<Table>,
}

/// Immutable merged configuration of one service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedConfig(Table);

impl ResolvedConfig {
    /// Dotted lookup, e.g. `get("attributes.klm.machine")`.
    #[cfg(test)]
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut parts = dotted.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

impl ConfigLayers {
    pub fn resolve(self) -> ResolvedConfig {
        let mut merged = Table::new();
        for layer in [self.defaults, self.environment, self.user].into_iter().flatten() {
            merge_into(&mut merged, layer);
        }
        ResolvedConfig(merged)
    }
}

fn merge_into(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        if let Value::Table(incoming) = value {
            if let Some(Value::Table(existing)) = base.get_mut(&key) {
                merge_into(existing, incoming);
                continue;
            }
            base.insert(key, Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

pub fn user_toml_path(root: &Path, service: &str) -> PathBuf {
    root.join("user").join(service).join("config").join("user.toml")
}

pub fn default_toml_path(root: &Path, service: &str) -> PathBuf {
    root.join("svc").join(service).join("default.toml")
}

pub fn env_var_name(service: &str) -> String {
    format!("RINGSUP_SVC_{}", service.to_uppercase().replace('-', "_"))
}

/// Read every layer for `service`. Absent layers are skipped; malformed
/// ones fail the load with [`SupError::Parse`].
pub fn load_layers(root: &Path, service: &str) -> Result<ConfigLayers, SupError> {
    let defaults = read_optional_table(&default_toml_path(root, service))?;
    let user = read_optional_table(&user_toml_path(root, service))?;

    let var = env_var_name(service);
    let environment = match std::env::var(&var) {
        Ok(text) => Some(
            text.parse::<Table>()
                .map_err(|e| SupError::parse(format!("${}", var), e))?,
        ),
        Err(_) => None,
    };

    Ok(ConfigLayers {
        defaults,
        environment,
        user,
    })
}

fn read_optional_table(path: &Path) -> Result<Option<Table>, SupError> {
    match fs::read_to_string(path) {
        Ok(text) => {
            debug!("Reading config layer {}", path.display());
            text.parse::<Table>()
                .map(Some)
                .map_err(|e| SupError::parse(path, e))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SupError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(text: &str) -> Table {
        text.parse().unwrap()
    }

    #[test]
    fn user_layer_overrides_defaults_and_merges_tables() {
        let layers = ConfigLayers {
            defaults: Some(table(
                "interval = 60\n[attributes.klm]\nrole = \"base\"\nkeep = true\n",
            )),
            environment: None,
            user: Some(table("interval = 300\n[attributes.klm]\nrole = \"web\"\n")),
        };
        let cfg = layers.resolve();
        assert_eq!(cfg.get("interval").and_then(Value::as_integer), Some(300));
        assert_eq!(cfg.get("attributes.klm.role").and_then(Value::as_str), Some("web"));
        assert_eq!(cfg.get("attributes.klm.keep").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn arrays_are_replaced_not_concatenated() {
        let layers = ConfigLayers {
            defaults: Some(table("peers = [\"a\", \"b\"]")),
            environment: Some(table("peers = [\"c\"]")),
            user: None,
        };
        let cfg = layers.resolve();
        let peers = cfg.get("peers").and_then(Value::as_array).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn loads_user_toml_from_disk() {
        let dir = tempdir().unwrap();
        let path = user_toml_path(dir.path(), "effortless");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "interval = 300\n[attributes.klm.debian]\n[[attributes.klm.machine.network.interfaces]]\nname = \"eth0\"\n",
        )
        .unwrap();

        let cfg = load_layers(dir.path(), "effortless").unwrap().resolve();
        assert_eq!(cfg.get("interval").and_then(Value::as_integer), Some(300));
        assert!(cfg.get("attributes.klm.debian").is_some());
        let json = cfg.to_json();
        assert_eq!(json["attributes"]["klm"]["machine"]["network"]["interfaces"][0]["name"], "eth0");
    }

    #[test]
    fn malformed_user_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = user_toml_path(dir.path(), "broken");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "interval = ").unwrap();
        let err = load_layers(dir.path(), "broken").unwrap_err();
        assert!(matches!(err, SupError::Parse { .. }));
    }

    #[test]
    fn env_var_name_is_upper_snake() {
        assert_eq!(env_var_name("my-app"), "RINGSUP_SVC_MY_APP");
    }
}
