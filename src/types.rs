use serde::{Deserialize, Serialize};

use futures_util::Stream;
use std::pin::Pin;

/// Opaque member identifier, unique within a ring.
pub type MemberId = String;

/// Where a member can be reached and what it calls itself. Carried in service
/// rumors so the census can report it without another lookup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SysInfo {
    pub hostname: String,
    pub ip: String,
    pub gossip_ip: String,
    pub gossip_port: u16,
    pub http_gateway_ip: String,
    pub http_gateway_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

impl Default for SysInfo {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            ip: "127.0.0.1".to_string(),
            gossip_ip: "127.0.0.1".to_string(),
            gossip_port: 9638,
            http_gateway_ip: "127.0.0.1".to_string(),
            http_gateway_port: 9631,
            org: None,
        }
    }
}

pub type GenericBoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;
