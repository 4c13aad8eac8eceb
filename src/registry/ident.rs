//! Package identities, service group names and binds.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static name regex"));

static BIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+):([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)$").expect("static bind regex")
});

/// `origin/name[/version[/release]]`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIdent {
    pub origin: String,
    pub name: String,
    pub version: Option<String>,
    pub release: Option<String>,
}

impl FromStr for PackageIdent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(format!("'{}' is not origin/name[/version[/release]]", s));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("'{}' has an empty component", s));
        }
        for part in &parts[..2] {
            if !NAME_RE.is_match(part) {
                return Err(format!("'{}' contains invalid characters", s));
            }
        }
        Ok(Self {
            origin: parts[0].to_string(),
            name: parts[1].to_string(),
            version: parts.get(2).map(|v| v.to_string()),
            release: parts.get(3).map(|r| r.to_string()),
        })
    }
}

impl fmt::Display for PackageIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "/{}", version)?;
        }
        if let Some(release) = &self.release {
            write!(f, "/{}", release)?;
        }
        Ok(())
    }
}

/// `service.group`, the key the census groups members by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceGroup {
    service: String,
    group: String,
}

impl ServiceGroup {
    pub fn new(service: &str, group: &str) -> Result<Self, String> {
        if !NAME_RE.is_match(service) {
            return Err(format!("invalid service name '{}'", service));
        }
        if !NAME_RE.is_match(group) {
            return Err(format!("invalid group name '{}'", group));
        }
        Ok(Self {
            service: service.to_string(),
            group: group.to_string(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl FromStr for ServiceGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((service, group)) => ServiceGroup::new(service, group),
            None => Err(format!("'{}' is not service.group", s)),
        }
    }
}

impl TryFrom<String> for ServiceGroup {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceGroup> for String {
    fn from(sg: ServiceGroup) -> Self {
        sg.to_string()
    }
}

impl fmt::Display for ServiceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.group)
    }
}

/// `alias:service.group`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bind {
    pub alias: String,
    pub service_group: ServiceGroup,
}

impl FromStr for Bind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = BIND_RE
            .captures(s)
            .ok_or_else(|| format!("invalid bind specification: {}", s))?;
        Ok(Self {
            alias: caps[1].to_string(),
            service_group: ServiceGroup::new(&caps[2], &caps[3])?,
        })
    }
}

impl TryFrom<String> for Bind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Bind> for String {
    fn from(bind: Bind) -> Self {
        bind.to_string()
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alias, self.service_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_fully_qualified_idents() {
        let short: PackageIdent = "klm/effortless".parse().unwrap();
        assert_eq!(short.origin, "klm");
        assert_eq!(short.name, "effortless");
        assert_eq!(short.version, None);

        let full: PackageIdent = "core/redis/4.0.14/20190319155852".parse().unwrap();
        assert_eq!(full.version.as_deref(), Some("4.0.14"));
        assert_eq!(full.to_string(), "core/redis/4.0.14/20190319155852");
    }

    #[test]
    fn rejects_malformed_idents() {
        assert!("effortless".parse::<PackageIdent>().is_err());
        assert!("klm//1.0".parse::<PackageIdent>().is_err());
        assert!("a/b/c/d/e".parse::<PackageIdent>().is_err());
        assert!("k m/effortless".parse::<PackageIdent>().is_err());
    }

    #[test]
    fn service_group_uses_dotted_form() {
        let sg: ServiceGroup = "effortless.default".parse().unwrap();
        assert_eq!(sg.service(), "effortless");
        assert_eq!(sg.group(), "default");
        assert_eq!(serde_json::to_string(&sg).unwrap(), "\"effortless.default\"");
        assert!("effortless".parse::<ServiceGroup>().is_err());
    }

    #[test]
    fn parses_binds() {
        let bind: Bind = "backend:redis.prod".parse().unwrap();
        assert_eq!(bind.alias, "backend");
        assert_eq!(bind.service_group.to_string(), "redis.prod");
        assert!("backend-redis.prod".parse::<Bind>().is_err());
        assert!("backend:redis".parse::<Bind>().is_err());
    }
}
