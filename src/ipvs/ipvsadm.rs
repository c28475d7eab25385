//! IPVS driver backed by the `ipvsadm` administration tool.
//!
//! Every operation shells out to `ipvsadm`; `pools()` parses the numeric
//! table listing (`ipvsadm -L -n`). The tool speaks netlink to the kernel on
//! our behalf, which keeps this crate free of a raw binding while remaining
//! fully functional on any host with ipvsadm installed.

use tokio::process::Command;
use tracing::debug;

use super::{
    DestEntry, IpvsDriver, Pool, SchedFlags, ServiceEntry, FWD_DIRECT_ROUTE, FWD_MASQUERADE,
    FWD_TUNNEL, IPPROTO_TCP, IPPROTO_UDP, SCHED_FLAG_1, SCHED_FLAG_2, SCHED_FLAG_3,
};
use crate::error::{Error, Result};

use async_trait::async_trait;

/// Driver executing the `ipvsadm` tool.
pub struct IpvsadmDriver {
    program: String,
}

impl IpvsadmDriver {
    /// Create a driver using `ipvsadm` from `PATH`.
    pub fn new() -> Self {
        Self::with_program("ipvsadm")
    }

    /// Create a driver using an explicit binary path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(program = %self.program, ?args, "invoking ipvsadm");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ipvs(format!("failed to execute {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ipvs(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for IpvsadmDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a protocol number to the ipvsadm service selector.
fn proto_flag(protocol: u16) -> Result<&'static str> {
    match protocol {
        IPPROTO_TCP => Ok("-t"),
        IPPROTO_UDP => Ok("-u"),
        other => Err(Error::ipvs(format!("unsupported protocol number {other}"))),
    }
}

/// Map a forwarding-method id to the ipvsadm destination flag.
fn fwd_flag(fwd: u32) -> Result<&'static str> {
    match fwd {
        FWD_MASQUERADE => Ok("-m"),
        FWD_TUNNEL => Ok("-i"),
        FWD_DIRECT_ROUTE => Ok("-g"),
        other => Err(Error::ipvs(format!("unsupported forwarding method {other}"))),
    }
}

/// Format an address for the command line, bracketing IPv6.
fn format_addr(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

/// Split an `addr:port` token from the table listing, unbracketing IPv6.
fn split_addr(token: &str) -> Option<(String, u16)> {
    let (host, port) = token.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host.to_string(), port))
}

/// Render flag bits as the comma-separated list `ipvsadm -b` accepts. The
/// generic names map to the same bits as their sh-specific aliases.
fn flag_names(flags: SchedFlags) -> String {
    let mut names = Vec::new();
    if flags.0 & SCHED_FLAG_1 != 0 {
        names.push("flag-1");
    }
    if flags.0 & SCHED_FLAG_2 != 0 {
        names.push("flag-2");
    }
    if flags.0 & SCHED_FLAG_3 != 0 {
        names.push("flag-3");
    }
    names.join(",")
}

/// Parse the output of `ipvsadm -L -n` into pools.
fn parse_table(output: &str) -> Vec<Pool> {
    let mut pools: Vec<Pool> = Vec::new();

    for line in output.lines() {
        let line = line.trim_end();
        let trimmed = line.trim_start();

        if let Some(rest) = trimmed.strip_prefix("->") {
            // Destination line; the header also starts with "->" but its
            // first token is not an address.
            let mut fields = rest.split_whitespace();
            let (Some(addr), Some(_fwd), Some(weight)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Some((ip, port)) = split_addr(addr) else {
                continue;
            };
            let Ok(weight) = weight.parse() else {
                continue;
            };
            if let Some(pool) = pools.last_mut() {
                pool.dests.push(DestEntry { ip, port, weight });
            }
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let protocol = match fields.next() {
            Some("TCP") => IPPROTO_TCP,
            Some("UDP") => IPPROTO_UDP,
            _ => continue,
        };
        let (Some(addr), Some(sched)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((vip, port)) = split_addr(addr) else {
            continue;
        };

        // Optional trailing annotation like "(flag-1,flag-2)".
        let mut flags = SchedFlags::default();
        if let Some(extra) = fields.next() {
            let tokens = extra.trim_start_matches('(').trim_end_matches(')');
            for token in tokens.split(',') {
                if let Some(bits) = super::sched_flag_bits(token) {
                    flags.0 |= bits;
                }
            }
        }

        pools.push(Pool {
            service: ServiceEntry {
                vip,
                port,
                protocol,
                sched: sched.to_string(),
                flags,
            },
            dests: Vec::new(),
        });
    }

    pools
}

#[async_trait]
impl IpvsDriver for IpvsadmDriver {
    async fn init(&self) -> Result<()> {
        // Listing the table verifies the binary, the ip_vs module and our
        // privileges in one go.
        self.run(&["-L", "-n"]).await.map(drop)
    }

    async fn exit(&self) {}

    async fn flush(&self) -> Result<()> {
        self.run(&["-C"]).await.map(drop)
    }

    async fn add_service(&self, vip: &str, port: u16, protocol: u16, sched: &str) -> Result<()> {
        let addr = format_addr(vip, port);
        self.run(&["-A", proto_flag(protocol)?, &addr, "-s", sched])
            .await
            .map(drop)
    }

    async fn add_service_with_flags(
        &self,
        vip: &str,
        port: u16,
        protocol: u16,
        sched: &str,
        flags: &[u8],
    ) -> Result<()> {
        let decoded = SchedFlags::from_wire(flags)
            .ok_or_else(|| Error::ipvs("malformed scheduler flag bytes"))?;
        let addr = format_addr(vip, port);
        let names = flag_names(decoded);
        self.run(&["-A", proto_flag(protocol)?, &addr, "-s", sched, "-b", &names])
            .await
            .map(drop)
    }

    async fn del_service(&self, vip: &str, port: u16, protocol: u16) -> Result<()> {
        let addr = format_addr(vip, port);
        self.run(&["-D", proto_flag(protocol)?, &addr]).await.map(drop)
    }

    async fn add_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    ) -> Result<()> {
        let vaddr = format_addr(vip, vport);
        let raddr = format_addr(rip, rport);
        let weight = weight.to_string();
        self.run(&[
            "-a",
            proto_flag(protocol)?,
            &vaddr,
            "-r",
            &raddr,
            fwd_flag(fwd)?,
            "-w",
            &weight,
        ])
        .await
        .map(drop)
    }

    async fn update_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    ) -> Result<()> {
        let vaddr = format_addr(vip, vport);
        let raddr = format_addr(rip, rport);
        let weight = weight.to_string();
        self.run(&[
            "-e",
            proto_flag(protocol)?,
            &vaddr,
            "-r",
            &raddr,
            fwd_flag(fwd)?,
            "-w",
            &weight,
        ])
        .await
        .map(drop)
    }

    async fn del_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
    ) -> Result<()> {
        let vaddr = format_addr(vip, vport);
        let raddr = format_addr(rip, rport);
        self.run(&["-d", proto_flag(protocol)?, &vaddr, "-r", &raddr])
            .await
            .map(drop)
    }

    async fn pools(&self) -> Result<Vec<Pool>> {
        let output = self.run(&["-L", "-n"]).await?;
        Ok(parse_table(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
IP Virtual Server version 1.2.1 (size=4096)
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
TCP  10.0.0.1:80 wrr
  -> 192.168.1.10:8080            Masq    100    3          10
  -> 192.168.1.11:8080            Route   50     0          0
UDP  [2001:db8::1]:53 sh (flag-1,flag-2)
  -> [2001:db8::2]:53             Tunnel  1      0          0
";

    #[test]
    fn test_parse_table() {
        let pools = parse_table(SAMPLE);
        assert_eq!(pools.len(), 2);

        let tcp = &pools[0];
        assert_eq!(tcp.service.vip, "10.0.0.1");
        assert_eq!(tcp.service.port, 80);
        assert_eq!(tcp.service.protocol, IPPROTO_TCP);
        assert_eq!(tcp.service.sched, "wrr");
        assert!(tcp.service.flags.is_empty());
        assert_eq!(tcp.dests.len(), 2);
        assert_eq!(tcp.dests[0].ip, "192.168.1.10");
        assert_eq!(tcp.dests[0].port, 8080);
        assert_eq!(tcp.dests[0].weight, 100);

        let udp = &pools[1];
        assert_eq!(udp.service.vip, "2001:db8::1");
        assert_eq!(udp.service.protocol, IPPROTO_UDP);
        assert_eq!(udp.service.flags, SchedFlags(SCHED_FLAG_1 | SCHED_FLAG_2));
        assert_eq!(udp.dests[0].ip, "2001:db8::2");
    }

    #[test]
    fn test_parse_empty_table() {
        let output = "IP Virtual Server version 1.2.1 (size=4096)\n\
                      Prot LocalAddress:Port Scheduler Flags\n\
                      -> RemoteAddress:Port           Forward Weight ActiveConn InActConn\n";
        assert!(parse_table(output).is_empty());
    }

    #[test]
    fn test_format_and_split_addr() {
        assert_eq!(format_addr("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(format_addr("2001:db8::1", 53), "[2001:db8::1]:53");
        assert_eq!(
            split_addr("[2001:db8::1]:53"),
            Some(("2001:db8::1".to_string(), 53))
        );
        assert_eq!(split_addr("10.0.0.1:80"), Some(("10.0.0.1".to_string(), 80)));
        assert_eq!(split_addr("garbage"), None);
    }

    #[test]
    fn test_flag_names() {
        assert_eq!(
            flag_names(SchedFlags(SCHED_FLAG_1 | SCHED_FLAG_3)),
            "flag-1,flag-3"
        );
        assert_eq!(flag_names(SchedFlags::default()), "");
    }
}
