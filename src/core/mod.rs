//! Daemon core: option validation, the state-managing context, the pulse
//! notification loop and store reconciliation.
//!
//! # Architecture
//!
//! ```text
//! [REST / reconciler] --> Context mutators --> IPVS driver --> kernel
//!                              |
//!                              +--> Disco announcements (best effort)
//!                              +--> VIP aliases (best effort)
//!                              +--> one Pulse task per backend
//!                                        |
//!                                        v  updates
//!                              notification loop --> weight stash
//! ```

mod context;
mod entities;
mod notify;
mod options;
mod sync;

pub mod exporter;

pub use context::{Context, ContextOptions};
pub use entities::{BackendInfo, ServiceInfo};
pub use options::{fallback_strategy, BackendOptions, Fallback, ServiceOptions};
pub use sync::{ServiceConfig, Store, SyncStatus, SYNC_STATUS_NEEDED, SYNC_STATUS_OK};
