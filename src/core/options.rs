//! Virtual service and backend options: parsing, validation, normalization.
//!
//! Validation fills defaults, resolves hostnames once and derives the
//! numeric protocol and forwarding-method ids used for kernel programming.
//! Equality against desired state deliberately covers only the configured
//! fields, never the derived ones (see [`ServiceOptions::desired_eq`]).

use std::net::{IpAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ipvs::{self, SchedFlags};
use crate::pulse;

/// Behavior when a backend goes down while the whole service is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Failed backends get weight zero.
    Default = 0,
    /// When every backend is down, failed backends get weight one so the
    /// service keeps at least one path open.
    ZeroToOne = 1,
}

/// Look up the fallback strategy for one token.
pub fn fallback_strategy(token: &str) -> Option<Fallback> {
    match token {
        "fb-default" => Some(Fallback::Default),
        "fb-zero-to-one" => Some(Fallback::ZeroToOne),
        _ => None,
    }
}

/// Resolve a host string to one address, DNS included.
///
/// IPv4 answers are preferred so mixed resolver configurations behave the
/// same everywhere.
fn resolve_host(host: &str) -> Result<IpAddr, ValidationError> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    let addrs: Vec<_> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| ValidationError::HostResolution(host.to_string()))?
        .map(|sa| sa.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ValidationError::HostResolution(host.to_string()))
}

/// Configuration of one virtual service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Host to resolve into the VIP. Empty means the daemon default
    /// endpoint.
    pub host: String,
    pub port: u16,
    /// `tcp` or `udp`; empty means `tcp`.
    pub protocol: String,
    /// IPVS scheduler name, passed through verbatim; empty means `wrr`.
    pub lb_method: String,
    /// Pipe-separated scheduler flag tokens.
    pub sh_flags: String,
    pub persistent: bool,
    /// `fb-default` or `fb-zero-to-one`.
    pub fallback: String,
    /// `nat`, `dr`, `tunnel` or `ipip`; empty means `nat`.
    pub fwd_method: String,
    /// Health probe configuration applied to every backend.
    pub pulse: Option<pulse::Options>,
    /// Weight assigned to healthy backends; non-positive means 100.
    pub max_weight: i32,

    /// Resolved VIP, filled by validation.
    #[serde(skip)]
    pub(crate) resolved: Option<IpAddr>,
    /// Whether we added the VIP alias and therefore own its removal.
    #[serde(skip)]
    pub(crate) del_if_addr: bool,
    /// Numeric protocol, filled by validation.
    #[serde(skip)]
    pub(crate) protocol_num: u16,
    /// Numeric forwarding method, filled by validation.
    #[serde(skip)]
    pub(crate) method_id: u32,
}

impl ServiceOptions {
    /// Fill missing fields and validate, resolving the host.
    ///
    /// An empty host falls back to `default_host`; with neither present the
    /// endpoint is considered missing.
    pub fn validate(&mut self, default_host: Option<IpAddr>) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::MissingEndpoint);
        }

        if !self.host.is_empty() {
            self.resolved = Some(resolve_host(&self.host)?);
        } else if let Some(ip) = default_host {
            self.resolved = Some(ip);
        } else {
            return Err(ValidationError::MissingEndpoint);
        }

        if self.protocol.is_empty() {
            self.protocol = "tcp".into();
        }
        self.protocol = self.protocol.to_lowercase();
        self.protocol_num = match self.protocol.as_str() {
            "tcp" => ipvs::IPPROTO_TCP,
            "udp" => ipvs::IPPROTO_UDP,
            other => return Err(ValidationError::UnknownProtocol(other.into())),
        };

        if !self.sh_flags.is_empty() {
            for token in self.sh_flags.split('|') {
                if ipvs::sched_flag_bits(token).is_none() {
                    return Err(ValidationError::UnknownSchedulerFlag(token.into()));
                }
            }
        }

        if self.fallback.is_empty() {
            self.fallback = "fb-default".into();
        } else {
            for token in self.fallback.split('|') {
                if fallback_strategy(token).is_none() {
                    return Err(ValidationError::UnknownFallbackFlag(token.into()));
                }
            }
        }

        if self.lb_method.is_empty() {
            // WRR, since the pulse loop dynamically reweights backends.
            self.lb_method = "wrr".into();
        }

        if self.max_weight <= 0 {
            self.max_weight = 100;
        }

        if self.fwd_method.is_empty() {
            self.fwd_method = "nat".into();
        }
        self.fwd_method = self.fwd_method.to_lowercase();
        self.method_id = match self.fwd_method.as_str() {
            "nat" => ipvs::FWD_MASQUERADE,
            "dr" => ipvs::FWD_DIRECT_ROUTE,
            "tunnel" | "ipip" => ipvs::FWD_TUNNEL,
            other => return Err(ValidationError::UnknownForwardingMethod(other.into())),
        };

        if self.pulse.is_none() {
            // A backend without a pulse makes little sense.
            self.pulse = Some(pulse::Options::default());
        }

        Ok(())
    }

    /// Fold the scheduler flag tokens into their bit mask.
    pub fn sched_flags(&self) -> SchedFlags {
        let mut flags = SchedFlags::default();
        if !self.sh_flags.is_empty() {
            for token in self.sh_flags.split('|') {
                if let Some(bits) = ipvs::sched_flag_bits(token) {
                    flags.0 |= bits;
                }
            }
        }
        flags
    }

    /// The fallback strategy this service uses.
    pub fn fallback_strategy(&self) -> Fallback {
        fallback_strategy(&self.fallback).unwrap_or(Fallback::Default)
    }

    /// Whether this configuration matches the desired state in the store.
    ///
    /// Compares configured fields only; derived fields and the pulse options
    /// are runtime concerns.
    pub fn desired_eq(&self, other: &ServiceOptions) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.protocol == other.protocol
            && self.sh_flags == other.sh_flags
            && self.lb_method == other.lb_method
            && self.persistent == other.persistent
            && self.fallback == other.fallback
            && self.fwd_method == other.fwd_method
            && self.max_weight == other.max_weight
    }
}

/// Configuration of one backend behind a virtual service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub host: String,
    pub port: u16,

    /// Owning service id.
    #[serde(skip)]
    pub(crate) vs_id: String,
    /// Resolved address, filled by validation.
    #[serde(skip)]
    pub(crate) resolved: Option<IpAddr>,
    /// Current weight, [0, MaxWeight]. A runtime artifact, never part of
    /// desired state.
    #[serde(skip)]
    pub(crate) weight: i32,
}

impl BackendOptions {
    /// Fill missing fields and validate, resolving the host.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        if self.host.is_empty() || self.port == 0 {
            return Err(ValidationError::MissingEndpoint);
        }
        self.resolved = Some(resolve_host(&self.host)?);
        Ok(())
    }

    /// Whether this configuration matches the desired state in the store.
    pub fn desired_eq(&self, other: &BackendOptions) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// Whether two addresses belong to the same family.
pub(crate) fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> ServiceOptions {
        ServiceOptions {
            host: "127.0.0.1".into(),
            port: 80,
            ..ServiceOptions::default()
        }
    }

    #[test]
    fn test_validate_fills_defaults() {
        let mut options = base_options();
        options.validate(None).unwrap();

        assert_eq!(options.protocol, "tcp");
        assert_eq!(options.protocol_num, ipvs::IPPROTO_TCP);
        assert_eq!(options.lb_method, "wrr");
        assert_eq!(options.fallback, "fb-default");
        assert_eq!(options.fwd_method, "nat");
        assert_eq!(options.method_id, ipvs::FWD_MASQUERADE);
        assert_eq!(options.max_weight, 100);
        assert!(options.pulse.is_some());
        assert_eq!(options.resolved, Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_validate_requires_port() {
        let mut options = ServiceOptions {
            host: "127.0.0.1".into(),
            ..ServiceOptions::default()
        };
        assert_eq!(
            options.validate(None),
            Err(ValidationError::MissingEndpoint)
        );
    }

    #[test]
    fn test_validate_uses_default_endpoint() {
        let mut options = ServiceOptions {
            port: 80,
            ..ServiceOptions::default()
        };
        assert_eq!(
            options.validate(None),
            Err(ValidationError::MissingEndpoint)
        );

        options.validate(Some("10.0.0.7".parse().unwrap())).unwrap();
        assert_eq!(options.resolved, Some("10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_validate_resolves_localhost() {
        let mut options = base_options();
        options.host = "localhost".into();
        options.validate(None).unwrap();
        assert_eq!(options.resolved, Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_validate_normalizes_protocol_case() {
        let mut options = base_options();
        options.protocol = "UDP".into();
        options.validate(None).unwrap();
        assert_eq!(options.protocol, "udp");
        assert_eq!(options.protocol_num, ipvs::IPPROTO_UDP);
    }

    #[test]
    fn test_validate_rejects_unknown_protocol() {
        let mut options = base_options();
        options.protocol = "sctp".into();
        assert_eq!(
            options.validate(None),
            Err(ValidationError::UnknownProtocol("sctp".into()))
        );
    }

    #[test]
    fn test_validate_accepts_allowed_flags() {
        for flags in ["sh-fallback", "sh-port", "sh-fallback|sh-port", "flag-1|flag-2|flag-3"] {
            let mut options = base_options();
            options.sh_flags = flags.into();
            options.validate(None).unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_invalid_flags() {
        for flags in ["sh-unknown", "sh-fallback|bogus", "|"] {
            let mut options = base_options();
            options.sh_flags = flags.into();
            assert!(
                matches!(
                    options.validate(None),
                    Err(ValidationError::UnknownSchedulerFlag(_))
                ),
                "{flags} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_unknown_fallback() {
        let mut options = base_options();
        options.fallback = "fb-sideways".into();
        assert_eq!(
            options.validate(None),
            Err(ValidationError::UnknownFallbackFlag("fb-sideways".into()))
        );
    }

    #[test]
    fn test_validate_fwd_methods() {
        for (method, id) in [
            ("nat", ipvs::FWD_MASQUERADE),
            ("dr", ipvs::FWD_DIRECT_ROUTE),
            ("tunnel", ipvs::FWD_TUNNEL),
            ("ipip", ipvs::FWD_TUNNEL),
        ] {
            let mut options = base_options();
            options.fwd_method = method.into();
            options.validate(None).unwrap();
            assert_eq!(options.method_id, id, "{method}");
        }

        let mut options = base_options();
        options.fwd_method = "carrier-pigeon".into();
        assert!(matches!(
            options.validate(None),
            Err(ValidationError::UnknownForwardingMethod(_))
        ));
    }

    #[test]
    fn test_sched_flags_fold() {
        let mut options = base_options();
        options.sh_flags = "sh-fallback|sh-port".into();
        assert_eq!(
            options.sched_flags(),
            SchedFlags(ipvs::SCHED_SH_FALLBACK | ipvs::SCHED_SH_PORT)
        );

        options.sh_flags.clear();
        assert!(options.sched_flags().is_empty());
    }

    #[test]
    fn test_desired_eq_ignores_derived_fields() {
        let mut running = base_options();
        running.validate(None).unwrap();
        // Desired state is normalized by the same validation before any
        // comparison, so filled defaults never register as drift.
        let mut desired = base_options();
        desired.validate(None).unwrap();
        assert!(running.desired_eq(&desired));
        assert!(running.resolved.is_some());

        let mut changed = desired.clone();
        changed.max_weight = 50;
        assert!(!running.desired_eq(&changed));
    }

    #[test]
    fn test_backend_options_validate() {
        let mut options = BackendOptions {
            host: "127.0.0.1".into(),
            port: 8080,
            ..BackendOptions::default()
        };
        options.validate().unwrap();
        assert_eq!(options.resolved, Some("127.0.0.1".parse().unwrap()));

        let mut missing = BackendOptions::default();
        assert_eq!(missing.validate(), Err(ValidationError::MissingEndpoint));
    }

    #[test]
    fn test_options_json_shape() {
        let raw = r#"{
            "host": "10.10.0.1",
            "port": 443,
            "protocol": "tcp",
            "lb_method": "sh",
            "sh_flags": "sh-fallback|sh-port",
            "persistent": true,
            "fallback": "fb-zero-to-one",
            "fwd_method": "dr",
            "max_weight": 50,
            "pulse": {"type": "tcp", "interval": "5s"}
        }"#;
        let options: ServiceOptions = serde_json::from_str(raw).unwrap();
        assert_eq!(options.port, 443);
        assert_eq!(options.sh_flags, "sh-fallback|sh-port");
        assert_eq!(options.fallback, "fb-zero-to-one");
        assert!(options.persistent);
        assert_eq!(options.pulse.as_ref().unwrap().kind, "tcp");
    }
}
