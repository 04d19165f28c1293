//! Typing indicator bookkeeping: a channel→user→expiry map with a
//! once-per-second GC task. Entries live for a fixed window and are cleared
//! early when the typist actually sends the message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_protocol::{ChannelId, UserId};
use tokio::sync::Mutex;

/// How long a TYPING_START is considered live without a refresh.
const TYPING_TTL: Duration = Duration::from_secs(8);
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct TypingManager {
    entries: Arc<Mutex<HashMap<ChannelId, HashMap<UserId, Instant>>>>,
}

impl TypingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a typing entry.
    pub async fn note(&self, channel_id: ChannelId, user_id: UserId) {
        self.entries
            .lock()
            .await
            .entry(channel_id)
            .or_default()
            .insert(user_id, Instant::now() + TYPING_TTL);
    }

    /// Clear a user's entry, typically because the message arrived.
    pub async fn clear(&self, channel_id: ChannelId, user_id: UserId) {
        let mut entries = self.entries.lock().await;
        if let Some(channel) = entries.get_mut(&channel_id) {
            channel.remove(&user_id);
            if channel.is_empty() {
                entries.remove(&channel_id);
            }
        }
    }

    /// Users currently typing in a channel.
    pub async fn typing_in(&self, channel_id: ChannelId) -> Vec<UserId> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(&channel_id)
            .map(|channel| {
                channel
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(user, _)| *user)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn prune(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, channel| {
            channel.retain(|_, expiry| *expiry > now);
            !channel.is_empty()
        });
    }

    /// Spawn the GC task. Runs until the manager is dropped everywhere else.
    pub fn spawn_gc(&self) {
        let weak = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                let Some(entries) = weak.upgrade() else {
                    break;
                };
                let manager = TypingManager { entries };
                manager.prune().await;
            }
        });
    }
}
