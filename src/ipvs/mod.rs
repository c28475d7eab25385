//! Typed interface to the kernel IPVS virtual-server table.
//!
//! The daemon core talks to IPVS through the [`IpvsDriver`] trait so the
//! actual kernel binding stays pluggable. The bundled [`IpvsadmDriver`]
//! drives the `ipvsadm` administration tool; a netlink binding can be slotted
//! in behind the same trait without touching the core.
//!
//! Constants follow the kernel's `include/uapi/linux/ip_vs.h`.

mod ipvsadm;

pub use ipvsadm::IpvsadmDriver;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::error::Result;

/// IP protocol numbers accepted by the virtual-server table.
pub const IPPROTO_TCP: u16 = 6;
/// See [`IPPROTO_TCP`].
pub const IPPROTO_UDP: u16 = 17;

/// Packet forwarding methods, by their connection-flag values.
pub const FWD_MASQUERADE: u32 = 0;
/// IP-in-IP tunneling.
pub const FWD_TUNNEL: u32 = 2;
/// Direct routing.
pub const FWD_DIRECT_ROUTE: u32 = 3;

/// Scheduler flag bits (`IP_VS_SVC_F_SCHED*`).
///
/// `sh-fallback` and `sh-port` alias the generic scheduler flags 1 and 2;
/// their meaning is specific to the source-hashing scheduler.
pub const SCHED_FLAG_1: u32 = 0x0008;
/// Generic scheduler flag 2 / `sh-port`.
pub const SCHED_FLAG_2: u32 = 0x0010;
/// Generic scheduler flag 3.
pub const SCHED_FLAG_3: u32 = 0x0020;
/// Source-hash fallback (alias of flag 1).
pub const SCHED_SH_FALLBACK: u32 = SCHED_FLAG_1;
/// Source-hash port inclusion (alias of flag 2).
pub const SCHED_SH_PORT: u32 = SCHED_FLAG_2;

/// Look up the flag bits for one scheduler flag token.
///
/// The token table is fixed; unknown tokens are a validation error upstream.
pub fn sched_flag_bits(token: &str) -> Option<u32> {
    match token {
        "sh-fallback" => Some(SCHED_SH_FALLBACK),
        "sh-port" => Some(SCHED_SH_PORT),
        "flag-1" => Some(SCHED_FLAG_1),
        "flag-2" => Some(SCHED_FLAG_2),
        "flag-3" => Some(SCHED_FLAG_3),
        _ => None,
    }
}

/// A folded set of scheduler flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedFlags(pub u32);

impl SchedFlags {
    /// Whether any flag bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Encode as the 8-byte wire form the kernel expects: flag bits as a
    /// little-endian u32 followed by a full mask.
    pub fn to_wire(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.0.to_le_bytes());
        out[4..].copy_from_slice(&u32::MAX.to_le_bytes());
        out
    }

    /// Decode the wire form back into flag bits. Returns `None` for buffers
    /// of the wrong length.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        Some(Self(u32::from_le_bytes(raw)))
    }
}

/// Identity of one virtual service in the kernel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Virtual IP, textual form.
    pub vip: String,
    /// Virtual port.
    pub port: u16,
    /// IP protocol number.
    pub protocol: u16,
    /// Scheduler name, passed through verbatim.
    pub sched: String,
    /// Scheduler flag bits.
    pub flags: SchedFlags,
}

impl ServiceEntry {
    /// Whether this entry names the same (VIP, port, protocol) tuple.
    ///
    /// Scheduler and flags are deliberately excluded: the kernel keys the
    /// table on the address tuple alone.
    pub fn same_tuple(&self, other: &ServiceEntry) -> bool {
        self.vip == other.vip && self.port == other.port && self.protocol == other.protocol
    }
}

/// One destination behind a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestEntry {
    /// Real-server IP, textual form.
    pub ip: String,
    /// Real-server port.
    pub port: u16,
    /// Current kernel weight.
    pub weight: i32,
}

/// A virtual service together with its destinations, as read back from the
/// kernel.
#[derive(Debug, Clone)]
pub struct Pool {
    pub service: ServiceEntry,
    pub dests: Vec<DestEntry>,
}

/// Operations over the kernel virtual-server table.
///
/// Implementations must be safe to share; the Context serializes calls
/// through its own lock, so drivers need no internal ordering guarantees.
#[async_trait]
pub trait IpvsDriver: Send + Sync + 'static {
    /// Verify the IPVS layer is reachable.
    async fn init(&self) -> Result<()>;

    /// Release driver resources. Infallible by design; called once during
    /// shutdown after the table has been emptied.
    async fn exit(&self);

    /// Remove every virtual service from the table.
    async fn flush(&self) -> Result<()>;

    /// Add a virtual service with default flags.
    async fn add_service(&self, vip: &str, port: u16, protocol: u16, sched: &str) -> Result<()>;

    /// Add a virtual service with explicit scheduler flag bytes (see
    /// [`SchedFlags::to_wire`]).
    async fn add_service_with_flags(
        &self,
        vip: &str,
        port: u16,
        protocol: u16,
        sched: &str,
        flags: &[u8],
    ) -> Result<()>;

    /// Delete a virtual service and all of its destinations.
    async fn del_service(&self, vip: &str, port: u16, protocol: u16) -> Result<()>;

    /// Add a destination to a virtual service.
    #[allow(clippy::too_many_arguments)]
    async fn add_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    ) -> Result<()>;

    /// Update the weight (and forwarding method) of an existing destination.
    #[allow(clippy::too_many_arguments)]
    async fn update_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    ) -> Result<()>;

    /// Remove a destination from a virtual service.
    async fn del_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
    ) -> Result<()>;

    /// Read back the whole virtual-server table.
    async fn pools(&self) -> Result<Vec<Pool>>;
}
