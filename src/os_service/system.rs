use std::process::Command;

use tracing::info;

use crate::error::SupError;

pub const SERVICE_NAME: &str = "ringsup.service";

/// What goes into the generated unit file.
#[derive(Debug, Default, Clone)]
pub struct UnitOptions {
    pub binary: String,
    /// Extra arguments after `run`, e.g. `--peer 10.0.0.1:9638`.
    pub run_args: Vec<String>,
    pub gateway_auth_token: Option<String>,
    pub ring_key: Option<String>,
}

/// systemd unit that runs the supervisor in the foreground. Secrets go into
/// `Environment=` lines rather than the command line.
pub fn render_unit(options: &UnitOptions) -> String {
    let mut exec = format!("{} run", options.binary);
    for arg in &options.run_args {
        exec.push(' ');
        exec.push_str(arg);
    }
    let mut env = String::new();
    if let Some(token) = &options.gateway_auth_token {
        env.push_str(&format!("Environment=\"RINGSUP_GATEWAY_AUTH_TOKEN={}\"\n", token));
    }
    if let Some(key) = &options.ring_key {
        env.push_str(&format!("Environment=\"RINGSUP_RING_KEY={}\"\n", key));
    }
    format!(
        r#"[Unit]
Description=Ringsup Supervisor
After=network.target

[Service]
ExecStart={exec}
Restart=on-failure
LimitNOFILE=4096
{env}
[Install]
WantedBy=default.target
"#
    )
}

fn require_root(action: &str) -> Result<(), SupError> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(SupError::Command {
            command: format!("{action} {SERVICE_NAME}"),
            reason: "must be run as root (e.g., with sudo)".into(),
        });
    }
    Ok(())
}

fn systemctl(args: &[&str]) -> Result<std::process::Output, SupError> {
    Command::new("systemctl")
        .args(args)
        .output()
        .map_err(|e| SupError::Command {
            command: format!("systemctl {}", args.join(" ")),
            reason: e.to_string(),
        })
}

fn systemctl_ok(args: &[&str]) -> Result<(), SupError> {
    let output = systemctl(args)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SupError::Command {
            command: format!("systemctl {}", args.join(" ")),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub fn start() -> Result<(), SupError> {
    require_root("start")?;
    systemctl_ok(&["start", SERVICE_NAME])?;
    info!("Started {}", SERVICE_NAME);
    Ok(())
}

pub fn stop() -> Result<(), SupError> {
    require_root("stop")?;
    systemctl_ok(&["stop", SERVICE_NAME])?;
    info!("Stopped {}", SERVICE_NAME);
    Ok(())
}

/// The unit's active state as systemd reports it (`active`, `inactive`,
/// `failed`, ...). A non-zero exit here is normal for stopped units.
pub fn status() -> Result<String, SupError> {
    let output = systemctl(&["is-active", SERVICE_NAME])?;
    let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if state.is_empty() {
        return Err(SupError::Command {
            command: format!("systemctl is-active {SERVICE_NAME}"),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(state)
}
