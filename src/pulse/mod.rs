//! Periodic health probes for backends.
//!
//! Each backend gets one [`Pulse`] task probing it at a fixed interval and
//! pushing [`Update`]s into the context's notification channel. The probe
//! kind and its parameters come from the owning service's pulse options:
//!
//! - `http` / `https` (default) - GET a path and compare the status code
//! - `tcp` - connect to the port
//! - `none` - always report up
//!
//! Health is an opaque scalar in [0, 1] smoothing recent outcomes: the
//! success ratio over a sliding window of the last ten probes, seeded
//! healthy. It rises monotonically while probes succeed and collapses toward
//! zero under failures, which the notification loop uses to ramp weights
//! back up gradually after recovery.

mod http;
mod tcp;

pub use http::HttpProber;
pub use tcp::TcpProber;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ValidationError;
use crate::shutdown::Signal;

/// Number of probe outcomes contributing to the health score.
const HEALTH_WINDOW: usize = 10;

/// Default probe interval when the options specify none.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Probe outcome for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The most recent probe succeeded.
    Up,
    /// The most recent probe failed.
    Down,
    /// Final message after the probe has been stopped.
    Removed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Up => write!(f, "up"),
            Status::Down => write!(f, "down"),
            Status::Removed => write!(f, "removed"),
        }
    }
}

/// Latest observed state of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub status: Status,
    /// Smoothed health in [0, 1].
    pub health: f64,
    /// Continuous successful probe duration.
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            status: Status::Down,
            health: 0.0,
            uptime: Duration::ZERO,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Identifies the backend a pulse update belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PulseId {
    pub vs_id: String,
    pub rs_id: String,
}

impl PulseId {
    pub fn new(vs_id: impl Into<String>, rs_id: impl Into<String>) -> Self {
        Self {
            vs_id: vs_id.into(),
            rs_id: rs_id.into(),
        }
    }
}

impl fmt::Display for PulseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.vs_id, self.rs_id)
    }
}

/// One message from a probe task to the notification loop.
#[derive(Debug, Clone)]
pub struct Update {
    pub source: PulseId,
    pub metrics: Metrics,
}

/// Probe configuration, as written in service options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Probe kind: `none`, `tcp`, `http` or `https`. Empty means `http`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Probe period as a duration string (`500ms`, `2s`, `1m`). Empty means
    /// one minute.
    pub interval: String,
    /// Probe-specific arguments.
    pub args: Args,
}

/// HTTP- and TCP-specific probe arguments. Unset fields fall back to the
/// backend's own endpoint and conventional defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    /// HTTP method, default GET.
    pub method: Option<String>,
    /// Request path, default `/`.
    pub path: Option<String>,
    /// Expected status code, default 200.
    pub expect: Option<u16>,
    /// Per-probe timeout in seconds, default 2.
    pub timeout: Option<u64>,
    /// Override the URL scheme.
    pub scheme: Option<String>,
    /// Override the probed port.
    pub port: Option<u16>,
    /// Override the probed host.
    pub host: Option<String>,
}

/// Parse a duration string with `ms`, `s`, `m` or `h` suffix.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60_000)
    } else if let Some(d) = s.strip_suffix('h') {
        (d, 3_600_000)
    } else {
        return None;
    };
    let value: u64 = digits.parse().ok()?;
    Some(Duration::from_millis(value.checked_mul(unit)?))
}

/// One periodic check of a backend endpoint.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Run a single probe. Never returns [`Status::Removed`].
    async fn check(&self) -> Status;
}

/// Prober that always reports up, for backends monitored externally.
pub struct NopProber;

#[async_trait]
impl Prober for NopProber {
    async fn check(&self) -> Status {
        Status::Up
    }
}

/// Sliding window of probe outcomes backing the health score.
///
/// The window starts seeded healthy: a backend is assumed good until probes
/// say otherwise, matching the full weight it is created with.
struct HealthHistory {
    window: VecDeque<bool>,
}

impl HealthHistory {
    fn new() -> Self {
        Self {
            window: VecDeque::from(vec![true; HEALTH_WINDOW]),
        }
    }

    fn record(&mut self, success: bool) {
        self.window.pop_front();
        self.window.push_back(success);
    }

    fn health(&self) -> f64 {
        let up = self.window.iter().filter(|ok| **ok).count();
        up as f64 / self.window.len() as f64
    }
}

/// A configured, not yet running probe.
pub struct Pulse {
    prober: Box<dyn Prober>,
    interval: Duration,
}

impl Pulse {
    /// Build a probe for the given backend endpoint from service pulse
    /// options.
    pub fn new(host: &str, port: u16, opts: &Options) -> Result<Self, ValidationError> {
        let interval = if opts.interval.is_empty() {
            DEFAULT_INTERVAL
        } else {
            parse_duration(&opts.interval).ok_or_else(|| {
                ValidationError::InvalidPulse(format!("bad interval: {}", opts.interval))
            })?
        };

        let prober: Box<dyn Prober> = match opts.kind.as_str() {
            "none" => Box::new(NopProber),
            "tcp" => Box::new(TcpProber::new(host, port, &opts.args)),
            "" | "http" => Box::new(HttpProber::new(host, port, "http", &opts.args)?),
            "https" => Box::new(HttpProber::new(host, port, "https", &opts.args)?),
            other => {
                return Err(ValidationError::InvalidPulse(format!(
                    "unknown pulse type: {other}"
                )))
            }
        };

        Ok(Self { prober, interval })
    }

    /// Build a probe directly from a prober, for tests and embedding.
    pub fn from_prober(prober: Box<dyn Prober>, interval: Duration) -> Self {
        Self { prober, interval }
    }

    /// Start the probe loop.
    ///
    /// The loop emits one update per interval tick. Stopping through the
    /// returned handle emits a final [`Status::Removed`] update; a triggered
    /// shutdown signal ends the loop silently.
    pub fn spawn(
        self,
        id: PulseId,
        updates: mpsc::UnboundedSender<Update>,
        mut shutdown: Signal,
    ) -> PulseHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut history = HealthHistory::new();
            let mut uptime = Duration::ZERO;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first probe runs one full interval after the backend is
            // registered, not at registration time.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = self.prober.check().await;
                        match status {
                            Status::Up => {
                                history.record(true);
                                uptime += self.interval;
                            }
                            Status::Down | Status::Removed => {
                                history.record(false);
                                uptime = Duration::ZERO;
                            }
                        }
                        let update = Update {
                            source: id.clone(),
                            metrics: Metrics {
                                status,
                                health: history.health(),
                                uptime,
                            },
                        };
                        if updates.send(update).is_err() {
                            break;
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!(source = %id, "pulse stopped");
                            let _ = updates.send(Update {
                                source: id.clone(),
                                metrics: Metrics {
                                    status: Status::Removed,
                                    health: 0.0,
                                    uptime,
                                },
                            });
                            break;
                        }
                    }
                    _ = shutdown.triggered() => break,
                }
            }
        });

        PulseHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Handle to a running probe task.
pub struct PulseHandle {
    stop: watch::Sender<bool>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

impl PulseHandle {
    /// Ask the probe loop to emit its final removed update and exit.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}
