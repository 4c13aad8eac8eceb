//! What the local member tells the ring about itself.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use crate::types::SysInfo;

pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            debug!("Could not determine local IP, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// The address peers should use for a listener bound to `bind`. Wildcard
/// binds advertise `ip` instead.
pub fn advertised(bind: SocketAddr, ip: IpAddr) -> SocketAddr {
    if bind.ip().is_unspecified() {
        SocketAddr::new(ip, bind.port())
    } else {
        bind
    }
}

pub fn discover(listen_gossip: SocketAddr, listen_http: SocketAddr, org: Option<String>) -> SysInfo {
    let ip = local_ip();
    let gossip = advertised(listen_gossip, ip);
    let http = advertised(listen_http, ip);
    SysInfo {
        hostname: hostname(),
        ip: ip.to_string(),
        gossip_ip: gossip.ip().to_string(),
        gossip_port: gossip.port(),
        http_gateway_ip: http.ip().to_string(),
        http_gateway_port: http.port(),
        org,
    }
}

fn member_id_path(root: &Path) -> PathBuf {
    root.join("sup").join("default").join("MEMBER_ID")
}

/// The member id persisted under `root`, created on first use so a member
/// keeps its identity across restarts.
pub fn load_or_create_member_id(root: &Path) -> io::Result<String> {
    let path = member_id_path(root);
    match fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let id = Uuid::new_v4().simple().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, &id)?;
    info!("Created member id {} at {}", id, path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn wildcard_binds_advertise_local_ip() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let wildcard = SocketAddr::from(([0, 0, 0, 0], 9638));
        assert_eq!(advertised(wildcard, ip), "10.1.2.3:9638".parse().unwrap());
        let fixed: SocketAddr = "192.168.0.5:9631".parse().unwrap();
        assert_eq!(advertised(fixed, ip), fixed);
    }

    #[test]
    fn member_id_survives_restarts() {
        let dir = tempdir().unwrap();
        let first = load_or_create_member_id(dir.path()).unwrap();
        let second = load_or_create_member_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn org_is_advertised_only_when_set() {
        let gossip = SocketAddr::from(([10, 0, 0, 1], 9638));
        let http = SocketAddr::from(([10, 0, 0, 1], 9631));
        let sys = discover(gossip, http, Some("acme".into()));
        assert_eq!(sys.gossip_ip, "10.0.0.1");
        let json = serde_json::to_value(&sys).unwrap();
        assert_eq!(json["org"], "acme");

        let json = serde_json::to_value(discover(gossip, http, None)).unwrap();
        assert!(json.get("org").is_none());
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!hostname().is_empty());
    }
}
