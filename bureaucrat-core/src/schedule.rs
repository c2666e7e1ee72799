use crate::channel::Channel;
use crate::message::Message;
use crate::storage::{Storage, BUCKET_SCHEDULE};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScheduleEntry {
    code: String,
    target: String,
}

/// Timer service: persisted fire-at-instant control messages.
///
/// Registrations accumulate per epoch-second key in the `schedule` bucket;
/// the periodic alarm publishes every entry whose key has come due and
/// deletes the key. No timeout is ever delivered before its instant.
pub struct Schedule {
    channel: Arc<Channel>,
    storage: Arc<dyn Storage>,
}

impl Schedule {
    pub fn new(channel: Arc<Channel>, storage: Arc<dyn Storage>) -> Self {
        Self { channel, storage }
    }

    /// Append a `{code, target}` registration under the instant key.
    pub async fn register(&self, code: &str, instant: u64, target: &str) -> Result<()> {
        tracing::debug!(code, target, instant, "register schedule");
        let key = instant.to_string();
        let _guard = self.storage.lock().await?;
        let mut entries: Vec<ScheduleEntry> =
            if self.storage.exists(BUCKET_SCHEDULE, &key).await? {
                serde_json::from_slice(&self.storage.load(BUCKET_SCHEDULE, &key).await?)?
            } else {
                Vec::new()
            };
        entries.push(ScheduleEntry {
            code: code.to_string(),
            target: target.to_string(),
        });
        self.storage
            .save(BUCKET_SCHEDULE, &key, &serde_json::to_vec(&entries)?)
            .await
    }

    /// Periodic alarm: fire everything that has come due.
    pub async fn handle_alarm(&self) -> Result<()> {
        self.fire_due(now_secs()).await
    }

    /// Publish and delete every schedule key with `instant <= now`.
    pub async fn fire_due(&self, now: u64) -> Result<()> {
        let _guard = self.storage.lock().await?;
        for key in self.storage.keys(BUCKET_SCHEDULE).await? {
            let Ok(instant) = key.parse::<u64>() else {
                tracing::warn!(key = %key, "ignoring malformed schedule key");
                continue;
            };
            if instant > now {
                continue;
            }
            let entries: Vec<ScheduleEntry> =
                serde_json::from_slice(&self.storage.load(BUCKET_SCHEDULE, &key).await?)?;
            for entry in entries {
                self.channel
                    .send(&Message::new(&entry.code, &entry.target, ""))
                    .await?;
                tracing::debug!(code = %entry.code, target = %entry.target, "fired schedule");
            }
            self.storage.delete(BUCKET_SCHEDULE, &key).await?;
        }
        Ok(())
    }
}
