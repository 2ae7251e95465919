use chrono::{DateTime, Utc};

use crate::store::interval_secs;
use crate::tracker::VoiceTracker;

/// A user's accumulated voice time. `live_secs` is the elapsed portion of
/// an in-progress session, kept separate so callers can render it as
/// "current session".
#[derive(Debug, Clone, PartialEq)]
pub struct UserTotal {
    pub stored_secs: f64,
    pub live_secs: Option<f64>,
}

impl UserTotal {
    pub fn effective_secs(&self) -> f64 {
        self.stored_secs + self.live_secs.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub username: String,
    pub total_secs: f64,
    pub in_voice: bool,
}

/// Total voice time for one user. `None` only when the user has neither
/// stored history nor a live session, so "no data" is distinguishable from
/// "has data but zero time".
pub async fn user_total(
    tracker: &VoiceTracker,
    user_id: u64,
    now: DateTime<Utc>,
) -> Option<UserTotal> {
    let data = tracker.store().load().await;
    let stored = data.get(&user_id.to_string()).map(|rec| rec.total_time);
    let live = tracker.live_elapsed(user_id, now).await;
    if stored.is_none() && live.is_none() {
        return None;
    }
    Some(UserTotal {
        stored_secs: stored.unwrap_or(0.0),
        live_secs: live,
    })
}

/// Top `limit` users by effective total (stored plus live elapsed),
/// descending, ties kept in store order. Read-only: never writes the store.
pub async fn leaderboard(
    tracker: &VoiceTracker,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<LeaderboardEntry> {
    let data = tracker.store().load().await;
    let live = tracker.snapshot().await;

    let mut entries: Vec<LeaderboardEntry> = data
        .iter()
        .map(|(key, rec)| {
            let session = key.parse::<u64>().ok().and_then(|id| live.get(&id));
            let live_secs = session
                .map(|s| interval_secs(s.since, now).max(0.0))
                .unwrap_or(0.0);
            LeaderboardEntry {
                username: session
                    .map(|s| s.username.clone())
                    .unwrap_or_else(|| rec.username.clone()),
                total_secs: rec.total_time + live_secs,
                in_voice: session.is_some(),
            }
        })
        .collect();
    entries.sort_by(|a, b| b.total_secs.partial_cmp(&a.total_secs).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(limit);
    entries
}

/// "2h 5m 3s" style rendering for chat responses.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker(dir: &tempfile::TempDir) -> VoiceTracker {
        VoiceTracker::new(Store::new(dir.path().join("voice_data.json")))
    }

    #[tokio::test]
    async fn unknown_user_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        assert_eq!(user_total(&tracker, 42, ts(0)).await, None);
    }

    #[tokio::test]
    async fn total_includes_live_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        tracker.handle_leave(1, ts(100)).await.unwrap();
        tracker.handle_join(1, "alice", "General", ts(200)).await;

        let total = user_total(&tracker, 1, ts(250)).await.unwrap();
        assert!((total.stored_secs - 100.0).abs() < 1e-9);
        assert_eq!(total.live_secs, Some(50.0));
        assert!((total.effective_secs() - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn live_only_user_has_data() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        let total = user_total(&tracker, 1, ts(30)).await.unwrap();
        assert_eq!(total.stored_secs, 0.0);
        assert_eq!(total.live_secs, Some(30.0));
    }

    #[tokio::test]
    async fn leaderboard_limits_sorts_and_marks_live_users() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        // 15 users with increasing totals.
        for i in 1..=15u64 {
            tracker
                .handle_join(i, &format!("user{i}"), "General", ts(0))
                .await;
            tracker.handle_leave(i, ts(i as i64 * 10)).await.unwrap();
        }
        // user3 rejoins; their live elapsed should lift them to the top.
        tracker.handle_join(3, "user3", "General", ts(1000)).await;

        let board = leaderboard(&tracker, 10, ts(1500)).await;
        assert_eq!(board.len(), 10);
        assert_eq!(board[0].username, "user3");
        assert!(board[0].in_voice);
        assert!((board[0].total_secs - 530.0).abs() < 1e-9);
        assert!(board.windows(2).all(|w| w[0].total_secs >= w[1].total_secs));
        assert!(!board[1].in_voice);
    }

    #[tokio::test]
    async fn leaderboard_does_not_touch_the_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker.handle_join(1, "alice", "General", ts(0)).await;
        tracker.handle_leave(1, ts(50)).await.unwrap();

        let before = std::fs::read(tracker.store().path()).unwrap();
        leaderboard(&tracker, 10, ts(100)).await;
        let after = std::fs::read(tracker.store().path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.4), "59s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(7503.0), "2h 5m 3s");
        assert_eq!(format_duration(-10.0), "0s");
    }
}
