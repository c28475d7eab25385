//! VIP interface management.
//!
//! When the daemon is configured with a link name, every created virtual
//! service gets its resolved address added to that link as a /32 (IPv4) or
//! /128 (IPv6) alias, so the host accepts packets for the VIP. Address
//! manipulation goes through the iproute2 `ip` tool; failures are tolerated
//! by the caller, which only removes aliases it managed to add.

use std::net::IpAddr;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Prefix length for a host route of this address family.
fn host_prefix(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

async fn run_ip(args: &[&str]) -> anyhow::Result<Vec<u8>> {
    debug!(?args, "invoking ip");

    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .context("failed to execute ip")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "ip {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        ));
    }

    Ok(output.stdout)
}

/// Manages VIP aliases on one named link.
pub struct VipManager {
    link: String,
}

impl VipManager {
    /// Bind to a link, verifying it exists.
    pub async fn new(link: &str) -> anyhow::Result<Self> {
        run_ip(&["link", "show", "dev", link])
            .await
            .with_context(|| format!("unable to find the interface '{link}' for VIPs"))?;
        Ok(Self { link: link.into() })
    }

    /// The managed link's name.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Add a VIP alias to the link.
    pub async fn add(&self, ip: IpAddr) -> anyhow::Result<()> {
        let addr = format!("{ip}/{}", host_prefix(ip));
        run_ip(&["addr", "add", &addr, "dev", &self.link])
            .await
            .map(drop)
    }

    /// Remove a VIP alias from the link.
    pub async fn remove(&self, ip: IpAddr) -> anyhow::Result<()> {
        let addr = format!("{ip}/{}", host_prefix(ip));
        run_ip(&["addr", "del", &addr, "dev", &self.link])
            .await
            .map(drop)
    }
}

#[derive(Deserialize)]
struct LinkAddrs {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Deserialize)]
struct AddrInfo {
    #[serde(default)]
    local: Option<String>,
}

/// Addresses configured on a device, used as the daemon's default endpoints.
pub async fn interface_ips(device: &str) -> anyhow::Result<Vec<IpAddr>> {
    let stdout = run_ip(&["-json", "addr", "show", "dev", device])
        .await
        .with_context(|| format!("error while obtaining addresses of '{device}'"))?;

    let links: Vec<LinkAddrs> =
        serde_json::from_slice(&stdout).context("unparsable ip addr output")?;

    let mut ips = Vec::new();
    for link in links {
        for info in link.addr_info {
            if let Some(ip) = info.local.and_then(|s| s.parse().ok()) {
                ips.push(ip);
            }
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prefix() {
        assert_eq!(host_prefix("10.0.0.1".parse().unwrap()), 32);
        assert_eq!(host_prefix("2001:db8::1".parse().unwrap()), 128);
    }

    #[test]
    fn test_addr_output_parsing() {
        let raw = r#"[{"ifname":"lo","addr_info":[
            {"family":"inet","local":"127.0.0.1","prefixlen":8},
            {"family":"inet6","local":"::1","prefixlen":128},
            {"family":"inet6","prefixlen":64}
        ]}]"#;
        let links: Vec<LinkAddrs> = serde_json::from_str(raw).unwrap();
        let ips: Vec<IpAddr> = links
            .into_iter()
            .flat_map(|l| l.addr_info)
            .filter_map(|i| i.local.and_then(|s| s.parse().ok()))
            .collect();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
