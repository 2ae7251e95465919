use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{interval_secs, SessionRecord, Store, StoreError, UserUsageRecord};

/// One currently-connected user. `since` marks the start of the current
/// *unflushed* interval; a reconciliation checkpoint moves it forward so the
/// eventual leave-flush never re-counts checkpointed time.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub username: String,
    pub channel: String,
    pub since: DateTime<Utc>,
}

/// In-memory map of live voice sessions plus the durable store they flush
/// into. All mutation (gateway events, reconciliation sweep) serializes on
/// the internal mutex, which is held across the store write so saves for
/// different users cannot clobber each other.
pub struct VoiceTracker {
    sessions: Mutex<HashMap<u64, LiveSession>>,
    store: Store,
}

impl VoiceTracker {
    pub fn new(store: Store) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Disconnected -> Connected.
    pub async fn handle_join(
        &self,
        user_id: u64,
        username: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&user_id) {
            Some(live) => {
                // Duplicate join (reconnect blip or replayed event): keep the
                // original start, just refresh the display strings.
                warn!(user_id, username, channel, "join for already-tracked user");
                live.username = username.to_string();
                live.channel = channel.to_string();
            }
            None => {
                info!(user_id, username, channel, "voice join");
                sessions.insert(
                    user_id,
                    LiveSession {
                        username: username.to_string(),
                        channel: channel.to_string(),
                        since: now,
                    },
                );
            }
        }
    }

    /// Channel switch while staying connected. The session keeps running;
    /// only the cached channel name changes. An untracked user moving
    /// between channels means we missed their join, so start tracking now.
    pub async fn handle_move(
        &self,
        user_id: u64,
        username: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&user_id) {
            Some(live) => {
                debug!(user_id, username, channel, "voice channel switch");
                live.username = username.to_string();
                live.channel = channel.to_string();
            }
            None => {
                warn!(user_id, username, channel, "channel switch for untracked user, starting session");
                sessions.insert(
                    user_id,
                    LiveSession {
                        username: username.to_string(),
                        channel: channel.to_string(),
                        since: now,
                    },
                );
            }
        }
    }

    /// Connected -> Disconnected. Flushes the open interval into the store
    /// and returns the flushed seconds. A leave with no live session is a
    /// no-op: the time is unrecoverable and must not be fabricated.
    pub async fn handle_leave(
        &self,
        user_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let Some(live) = sessions.remove(&user_id) else {
            warn!(user_id, "leave for untracked user, elapsed time unrecoverable");
            return Ok(None);
        };
        let session = match SessionRecord::new(live.channel.clone(), live.since, now) {
            Ok(session) => session,
            Err(e) => {
                // Clock went backwards relative to the join; reject rather
                // than store a negative interval.
                warn!(user_id, error = %e, "dropping invalid session interval");
                return Ok(None);
            }
        };
        let elapsed = session.duration;
        info!(
            user_id,
            username = %live.username,
            channel = %session.channel,
            elapsed,
            "voice leave, flushing session"
        );
        let username = live.username;
        self.store
            .update(move |data| {
                let rec = data
                    .entry(user_id.to_string())
                    .or_insert_with(|| UserUsageRecord::new(username.clone()));
                rec.username = username;
                rec.record_session(session);
            })
            .await?;
        Ok(Some(elapsed))
    }

    /// Registers members already connected at startup.
    pub async fn seed_snapshot(
        &self,
        entries: Vec<(u64, String, String)>,
        now: DateTime<Utc>,
    ) {
        let mut sessions = self.sessions.lock().await;
        for (user_id, username, channel) in entries {
            sessions.entry(user_id).or_insert_with(|| {
                debug!(user_id, %username, %channel, "already in voice at startup");
                LiveSession {
                    username,
                    channel,
                    since: now,
                }
            });
        }
        info!(tracked = sessions.len(), "startup voice snapshot seeded");
    }

    /// Folds elapsed time since `since` into the user's durable total and
    /// resets `since` to `now`. `since` only moves forward once the store
    /// write succeeded, so a failed write leaves the interval intact for the
    /// next sweep instead of losing it.
    pub async fn checkpoint(
        &self,
        user_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let Some(live) = sessions.get_mut(&user_id) else {
            return Ok(None);
        };
        let elapsed = interval_secs(live.since, now);
        if elapsed <= 0.0 {
            return Ok(Some(0.0));
        }
        let username = live.username.clone();
        self.store
            .update(move |data| {
                let rec = data
                    .entry(user_id.to_string())
                    .or_insert_with(|| UserUsageRecord::new(username.clone()));
                rec.username = username;
                rec.record_checkpoint(elapsed);
            })
            .await?;
        live.since = now;
        debug!(user_id, elapsed, "checkpointed live session");
        Ok(Some(elapsed))
    }

    /// Drops a live session without flushing. Used when reconciliation
    /// confirms the user is no longer connected: the real leave instant is
    /// unknown, so no time is attributed.
    pub async fn prune(&self, user_id: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(&user_id).is_some();
        if removed {
            warn!(user_id, "pruned stale session (missed leave event), interval dropped");
        }
        removed
    }

    pub async fn tracked_users(&self) -> Vec<u64> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Seconds of the current unflushed interval, if the user is live.
    pub async fn live_elapsed(&self, user_id: u64, now: DateTime<Utc>) -> Option<f64> {
        self.sessions
            .lock()
            .await
            .get(&user_id)
            .map(|live| interval_secs(live.since, now).max(0.0))
    }

    /// Consistent point-in-time copy of the live map, for queries.
    pub async fn snapshot(&self) -> HashMap<u64, LiveSession> {
        self.sessions.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker(dir: &tempfile::TempDir) -> VoiceTracker {
        VoiceTracker::new(Store::new(dir.path().join("voice_data.json")))
    }

    #[tokio::test]
    async fn join_then_leave_records_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        let flushed = tracker.handle_leave(1, ts(125)).await.unwrap();
        assert_eq!(flushed, Some(125.0));

        let data = tracker.store().load().await;
        let rec = &data["1"];
        assert!((rec.total_time - 125.0).abs() < 1e-9);
        assert_eq!(rec.sessions.len(), 1);
        assert_eq!(rec.sessions[0].channel, "General");
        assert_eq!(rec.sessions[0].duration, 125.0);
        assert!(tracker.tracked_users().await.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_then_leave_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;

        let folded = tracker.checkpoint(1, ts(60)).await.unwrap();
        assert_eq!(folded, Some(60.0));
        let data = tracker.store().load().await;
        assert!((data["1"].total_time - 60.0).abs() < 1e-9);
        assert!(data["1"].sessions.is_empty());

        let flushed = tracker.handle_leave(1, ts(90)).await.unwrap();
        assert_eq!(flushed, Some(30.0));
        let data = tracker.store().load().await;
        let rec = &data["1"];
        // T2 - T0 attributed exactly once across checkpoint + leave.
        assert!((rec.total_time - 90.0).abs() < 1e-9);
        assert_eq!(rec.sessions.len(), 1);
        assert_eq!(rec.sessions[0].duration, 30.0);
    }

    #[tokio::test]
    async fn leave_without_join_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        let flushed = tracker.handle_leave(2, ts(10)).await.unwrap();
        assert_eq!(flushed, None);
        assert!(tracker.store().load().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_join_keeps_original_start() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        tracker.handle_join(1, "alice", "Gaming", ts(40)).await;
        let flushed = tracker.handle_leave(1, ts(100)).await.unwrap();
        assert_eq!(flushed, Some(100.0));
        let data = tracker.store().load().await;
        assert_eq!(data["1"].sessions[0].channel, "Gaming");
    }

    #[tokio::test]
    async fn move_keeps_session_running() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        tracker.handle_move(1, "alice", "Gaming", ts(50)).await;
        let flushed = tracker.handle_leave(1, ts(80)).await.unwrap();
        assert_eq!(flushed, Some(80.0));
        let data = tracker.store().load().await;
        assert_eq!(data["1"].sessions[0].channel, "Gaming");
    }

    #[tokio::test]
    async fn backwards_clock_drops_interval_instead_of_storing_negative() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(100)).await;
        let flushed = tracker.handle_leave(1, ts(50)).await.unwrap();
        assert_eq!(flushed, None);
        assert!(tracker.store().load().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_seeds_only_untracked_users() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        tracker
            .seed_snapshot(
                vec![
                    (1, "alice".to_string(), "General".to_string()),
                    (2, "bob".to_string(), "Gaming".to_string()),
                ],
                ts(30),
            )
            .await;
        assert_eq!(tracker.live_elapsed(1, ts(60)).await, Some(60.0));
        assert_eq!(tracker.live_elapsed(2, ts(60)).await, Some(30.0));
    }

    #[tokio::test]
    async fn total_time_is_monotonic_across_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        let mut last = 0.0;
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        for t in [30, 60, 90] {
            tracker.checkpoint(1, ts(t)).await.unwrap();
            let total = tracker.store().load().await["1"].total_time;
            assert!(total >= last);
            last = total;
        }
        tracker.handle_leave(1, ts(120)).await.unwrap();
        let total = tracker.store().load().await["1"].total_time;
        assert!(total >= last);
        assert!((total - 120.0).abs() < 1e-9);
    }
}
