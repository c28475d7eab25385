//! Pulse notification loop.
//!
//! A single task owned by the context drains the probe update channel and
//! adjusts kernel weights. The `stash` maps a degraded backend to its
//! pre-failure weight:
//!
//! - on the first down transition the previous weight is stashed and the
//!   backend is reweighted to zero (or one, when the whole service is down
//!   and uses the zero-to-one fallback);
//! - on up transitions the backend ramps back as `stash * health`, so a
//!   recovering backend takes traffic proportionally to its health instead
//!   of getting hit with full load on a cold cache;
//! - once the applied weight equals the stashed weight the backend is fully
//!   recovered and the entry is dropped.
//!
//! A stashed weight is never overwritten by later failures; the oldest
//! (highest) weight wins until full recovery.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::options::{fallback_strategy, Fallback};
use crate::pulse::{PulseId, Status, Update};
use crate::shutdown::Signal;

/// Drain the notification channel until shutdown.
pub(crate) async fn run(
    ctx: Arc<Context>,
    mut updates: UnboundedReceiver<Update>,
    mut shutdown: Signal,
) {
    let mut stash: HashMap<PulseId, i32> = HashMap::new();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => process_pulse_update(&ctx, &mut stash, update).await,
                None => break,
            },
            _ = shutdown.triggered() => {
                debug!("notification loop has been stopped");
                break;
            }
        }
    }
}

/// Apply one probe update to the cached metrics and the kernel weights.
pub(crate) async fn process_pulse_update(
    ctx: &Context,
    stash: &mut HashMap<PulseId, i32>,
    update: Update,
) {
    let source = update.source.clone();

    // Phase one: refresh the cached metrics under the exclusive lock, then
    // release it before any kernel reweighting below re-acquires it.
    {
        let mut services = ctx.services.write().await;

        let Some(vs) = services.get_mut(&source.vs_id) else {
            if stash.remove(&source).is_some() {
                debug!(source = %source, "service has been deleted, dropping its stash entry");
            }
            return;
        };

        let removed = update.metrics.status == Status::Removed;
        match vs.backends.get_mut(&source.rs_id) {
            Some(rs) if !removed => {
                if rs.metrics.status != update.metrics.status {
                    warn!(source = %source, status = %update.metrics.status, "backend status");
                }
                rs.metrics = update.metrics.clone();
            }
            _ => {
                if stash.remove(&source).is_some() {
                    debug!(source = %source, "backend has been deleted, dropping its stash entry");
                }
                return;
            }
        }
    }

    match update.metrics.status {
        Status::Up => {
            // Weight stays stashed until the backend has recovered.
            let Some(&stashed) = stash.get(&source) else {
                return;
            };

            // Relative weight considering the backend's health.
            let weight = (f64::from(stashed) * update.metrics.health) as i32;

            match ctx
                .update_backend(&source.vs_id, &source.rs_id, weight)
                .await
            {
                Err(e) => error!(source = %source, error = %e, "error while unstashing a backend"),
                Ok(_) if weight == stashed => {
                    info!(source = %source, "backend has completely recovered");
                    stash.remove(&source);
                }
                Ok(_) => {}
            }
        }
        Status::Down => {
            // A failed backend gets weight zero, unless the whole service
            // has collapsed and asks to keep one path open.
            let mut backend_weight = 0;

            match ctx.get_service(&source.vs_id).await {
                Err(e) => {
                    error!(service = %source.vs_id, error = %e, "error while getting service info");
                }
                Ok(info) if info.health == 0.0 => {
                    match fallback_strategy(&info.fallback) {
                        Some(Fallback::ZeroToOne) => {
                            backend_weight = 1;
                            info!(
                                service = %source.vs_id,
                                strategy = %info.fallback,
                                "service has zero health, keeping one path open"
                            );
                        }
                        _ => debug!("using default fallback strategy"),
                    }
                }
                Ok(_) => {}
            }

            match ctx
                .update_backend(&source.vs_id, &source.rs_id, backend_weight)
                .await
            {
                Err(e) => error!(source = %source, error = %e, "error while stashing a backend"),
                Ok(previous) => {
                    // Never overwrite: the oldest stashed weight is the one
                    // to restore.
                    stash.entry(source).or_insert(previous);
                }
            }
        }
        // Removed updates never reach this point.
        Status::Removed => {}
    }
}
