//! Recording fake driver for unit tests.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{IpvsDriver, Pool};
use crate::error::{Error, Result};

/// One recorded kernel call.
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub(crate) enum Call {
    Flush,
    AddService {
        vip: String,
        port: u16,
        protocol: u16,
        sched: String,
    },
    AddServiceWithFlags {
        vip: String,
        port: u16,
        protocol: u16,
        sched: String,
        flags: Vec<u8>,
    },
    DelService {
        vip: String,
        port: u16,
        protocol: u16,
    },
    AddDest {
        vip: String,
        vport: u16,
        rip: String,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    },
    UpdateDest {
        vip: String,
        vport: u16,
        rip: String,
        rport: u16,
        protocol: u16,
        weight: i32,
        fwd: u32,
    },
    DelDest {
        vip: String,
        vport: u16,
        rip: String,
        rport: u16,
        protocol: u16,
    },
}

/// Driver that records every call and answers `pools()` from a canned list.
#[derive(Default)]
pub(crate) struct RecordingIpvs {
    calls: Mutex<Vec<Call>>,
    pools: Mutex<Vec<Pool>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingIpvs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm a failure for the named operation.
    pub(crate) fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    /// Seed the canned `pools()` response.
    pub(crate) fn set_pools(&self, pools: Vec<Pool>) {
        *self.pools.lock() = pools;
    }

    /// Snapshot of all recorded calls.
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.lock().contains(op) {
            Err(Error::ipvs(format!("injected failure for {op}")))
        } else {
            Ok(())
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl IpvsDriver for RecordingIpvs {
    async fn init(&self) -> Result<()> {
        self.check("init")
    }

    async fn exit(&self) {}

    async fn flush(&self) -> Result<()> {
        self.check("flush")?;
        self.record(Call::Flush);
        Ok(())
    }

    async fn add_service(&self, vip: &str, port: u16, protocol: u16, sched: &str) -> Result<()> {
        self.check("add_service")?;
        self.record(Call::AddService {
            vip: vip.into(),
            port,
            protocol,
            sched: sched.into(),
        });
        Ok(())
    }

    async fn add_service_with_flags(
        &self,
        vip: &str,
        port: u16,
        protocol: u16,
        sched: &str,
        flags: &[u8],
    ) -> Result<()> {
        self.check("add_service_with_flags")?;
        self.record(Call::AddServiceWithFlags {
            vip: vip.into(),
            port,
            protocol,
            sched: sched.into(),
            flags: flags.to_vec(),
        });
        Ok(())
    }

    async fn del_service(&self, vip: &str, port: u16, protocol: u16) -> Result<()> {
        self.check("del_service")?;
        self.record(Call::DelService {
            vip: vip.into(),
            port,
            protocol,
        });
        Ok(())
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
        self.check("add_dest")?;
        self.record(Call::AddDest {
            vip: vip.into(),
            vport,
            rip: rip.into(),
            rport,
            protocol,
            weight,
            fwd,
        });
        Ok(())
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
        self.check("update_dest")?;
        self.record(Call::UpdateDest {
            vip: vip.into(),
            vport,
            rip: rip.into(),
            rport,
            protocol,
            weight,
            fwd,
        });
        Ok(())
    }

    async fn del_dest(
        &self,
        vip: &str,
        vport: u16,
        rip: &str,
        rport: u16,
        protocol: u16,
    ) -> Result<()> {
        self.check("del_dest")?;
        self.record(Call::DelDest {
            vip: vip.into(),
            vport,
            rip: rip.into(),
            rport,
            protocol,
        });
        Ok(())
    }

    async fn pools(&self) -> Result<Vec<Pool>> {
        self.check("pools")?;
        Ok(self.pools.lock().clone())
    }
}
