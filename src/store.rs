use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Persisted per-user usage, keyed by stringified user id.
pub type UsageMap = BTreeMap<String, UserUsageRecord>;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize voice data: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
#[error("session ends before it starts ({start} > {end})")]
pub struct InvalidInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One closed interval of voice presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub channel: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: f64,
}

impl SessionRecord {
    /// Builds a record with `duration` derived from the interval.
    /// Rejects intervals that end before they start.
    pub fn new(
        channel: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, InvalidInterval> {
        if end < start {
            return Err(InvalidInterval { start, end });
        }
        Ok(Self {
            channel: channel.into(),
            start,
            end,
            duration: interval_secs(start, end),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUsageRecord {
    pub username: String,
    pub total_time: f64,
    pub sessions: Vec<SessionRecord>,
}

impl UserUsageRecord {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            total_time: 0.0,
            sessions: Vec::new(),
        }
    }

    /// Appends a completed session and folds its duration into the total.
    pub fn record_session(&mut self, session: SessionRecord) {
        self.total_time += session.duration;
        self.sessions.push(session);
    }

    /// Folds checkpointed time into the total without closing a session.
    pub fn record_checkpoint(&mut self, secs: f64) {
        self.total_time += secs.max(0.0);
    }
}

/// Elapsed seconds between two instants, millisecond precision.
pub fn interval_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// File-backed store of all user usage records. The whole document is
/// rewritten on every save; writes go through a temp file and rename so a
/// concurrent reader never sees a truncated document.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted map. A missing, empty, or unparsable file yields
    /// an empty map; startup must never fail on a bad store.
    pub async fn load(&self) -> UsageMap {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "voice data file not found, starting empty");
                return UsageMap::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read voice data, starting empty");
                return UsageMap::new();
            }
        };
        if bytes.is_empty() {
            return UsageMap::new();
        }
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "voice data is corrupt, starting empty");
                UsageMap::new()
            }
        }
    }

    /// Writes the full map, retrying transient failures with backoff.
    pub async fn save(&self, data: &UsageMap) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(data)?;
        let mut delay = WRITE_RETRY_BASE;
        let mut attempt = 1;
        loop {
            match self.write_atomic(&json).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(path = %self.path.display(), error = %e, attempt, "store write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "store write failed, giving up");
                    return Err(StoreError::Write {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Read-modify-write against the current file content. The file is
    /// shared with external readers/writers, so a stale in-memory snapshot
    /// must never be merged back.
    pub async fn update<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut UsageMap),
    {
        let mut data = self.load().await;
        mutate(&mut data);
        self.save(&data).await
    }

    async fn write_atomic(&self, json: &[u8]) -> Result<(), std::io::Error> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}
