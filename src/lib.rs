//! larb - a control-plane daemon for the in-kernel IPVS layer-4 load
//! balancer.
//!
//! larb accepts declarative definitions of virtual services and their real
//! server backends, programs the kernel virtual-server table accordingly,
//! health-checks every backend and dynamically reweights or removes failing
//! ones. An optional external key-value store holds desired state that the
//! daemon continuously reconciles against.
//!
//! The crate is organized around pluggable driver traits: the kernel
//! binding ([`ipvs::IpvsDriver`]), the discovery announcer
//! ([`disco::Driver`]), the desired-state store ([`kv::KvBackend`]) and the
//! health probers ([`pulse::Prober`]). The [`core::Context`] ties them
//! together.

pub mod core;
pub mod disco;
pub mod error;
pub mod ipvs;
pub mod kv;
pub mod pulse;
pub mod shutdown;
pub mod vip;
