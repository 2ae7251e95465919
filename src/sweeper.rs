use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::tracker::VoiceTracker;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("platform state unavailable: {0}")]
    Unavailable(String),
}

/// Ground-truth lookup of voice connectivity. `Ok(None)` means *confirmed*
/// disconnected; `Err` means the answer could not be determined this cycle,
/// which must never be treated as a disconnect.
#[async_trait]
pub trait VoicePresence: Send + Sync {
    async fn connected_channel(&self, user_id: u64) -> Result<Option<String>, PresenceError>;
}

/// One reconciliation pass over every tracked user. The event stream is not
/// guaranteed delivery, so this is the correctness backstop: it prunes
/// sessions whose leave event was missed and checkpoints sessions still
/// running, bounding un-persisted time to one sweep period.
///
/// Pruning does not flush: the real leave instant of a missed-leave session
/// is unknown, and attributing the full interval would fabricate time.
pub async fn sweep_once(
    tracker: &VoiceTracker,
    presence: &dyn VoicePresence,
    now: DateTime<Utc>,
) {
    for user_id in tracker.tracked_users().await {
        match presence.connected_channel(user_id).await {
            Err(e) => {
                // Could not determine; keep the session and retry next sweep.
                warn!(user_id, error = %e, "presence lookup failed, skipping this sweep");
            }
            Ok(None) => {
                tracker.prune(user_id).await;
            }
            Ok(Some(_channel)) => {
                if let Err(e) = tracker.checkpoint(user_id, now).await {
                    // `since` was not advanced, so the interval is retried
                    // next cycle rather than lost.
                    warn!(user_id, error = %e, "checkpoint flush failed");
                }
            }
        }
    }
}

/// Periodic sweep loop. Stops when the shutdown channel flips; a checkpoint
/// in flight completes before the loop re-polls, so shutdown never leaves a
/// half-applied checkpoint.
pub async fn run(
    tracker: Arc<VoiceTracker>,
    presence: Arc<dyn VoicePresence>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_secs = period.as_secs(), "reconciliation sweeper started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately; the first sweep should wait one period.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&tracker, presence.as_ref(), Utc::now()).await;
            }
            changed = shutdown.changed() => {
                // A dropped sender also means the process is going away.
                if changed.is_err() || *shutdown.borrow() {
                    info!("reconciliation sweeper stopped");
                    return;
                }
            }
        }
    }
}
