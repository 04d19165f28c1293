//! Unread and mention bookkeeping, per (endpoint, channel).
//!
//! A message on a channel the user is not currently viewing bumps its unread
//! counter unless the channel is muted; a case-insensitive `@alias` token in
//! the content bumps the mention counter too. Selecting a channel zeroes
//! both.

use std::collections::{HashMap, HashSet};

use concord_protocol::ChannelId;

use crate::events::EndpointId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub unread: u32,
    pub mentions: u32,
}

#[derive(Debug, Default)]
pub struct UnreadTracker {
    counts: HashMap<(EndpointId, ChannelId), Counts>,
    muted: HashSet<ChannelId>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mute set from persisted config.
    pub fn with_muted(muted: impl IntoIterator<Item = ChannelId>) -> Self {
        Self { counts: HashMap::new(), muted: muted.into_iter().collect() }
    }

    pub fn set_muted(&mut self, channel_id: ChannelId, muted: bool) {
        if muted {
            self.muted.insert(channel_id);
        } else {
            self.muted.remove(&channel_id);
        }
    }

    pub fn is_muted(&self, channel_id: ChannelId) -> bool {
        self.muted.contains(&channel_id)
    }

    /// The flat list persisted into `config.json`.
    pub fn muted_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.muted.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Account for an incoming message. `viewing` is the channel currently
    /// on screen for that endpoint, if any.
    pub fn on_message(
        &mut self,
        endpoint_id: EndpointId,
        channel_id: ChannelId,
        content: &str,
        alias: &str,
        viewing: Option<ChannelId>,
    ) {
        if viewing == Some(channel_id) || self.muted.contains(&channel_id) {
            return;
        }
        let counts = self.counts.entry((endpoint_id, channel_id)).or_default();
        counts.unread += 1;
        if contains_mention(content, alias) {
            counts.mentions += 1;
        }
    }

    /// Selecting a channel zeroes its counters.
    pub fn select(&mut self, endpoint_id: EndpointId, channel_id: ChannelId) {
        self.counts.remove(&(endpoint_id, channel_id));
    }

    pub fn counts(&self, endpoint_id: EndpointId, channel_id: ChannelId) -> Counts {
        self.counts
            .get(&(endpoint_id, channel_id))
            .copied()
            .unwrap_or_default()
    }

    /// Total mentions across an endpoint, for badge rendering.
    pub fn endpoint_mentions(&self, endpoint_id: EndpointId) -> u32 {
        self.counts
            .iter()
            .filter(|((ep, _), _)| *ep == endpoint_id)
            .map(|(_, c)| c.mentions)
            .sum()
    }
}

/// True when `content` contains `@alias` as a standalone token,
/// case-insensitively. `@alice!` counts; `@alicette` does not.
fn contains_mention(content: &str, alias: &str) -> bool {
    if alias.is_empty() {
        return false;
    }
    let content = content.to_lowercase();
    let needle = format!("@{}", alias.to_lowercase());
    let mut start = 0;
    while let Some(found) = content[start..].find(&needle) {
        let at = start + found;
        let end = at + needle.len();
        let boundary_before = content[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        let boundary_after = content[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        if boundary_before && boundary_after {
            return true;
        }
        start = at + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unviewed_messages_increment_unread_and_mentions() {
        let mut tracker = UnreadTracker::new();
        let endpoint = Uuid::new_v4();
        let channel = Uuid::new_v4();

        tracker.on_message(endpoint, channel, "hello there", "alice", None);
        tracker.on_message(endpoint, channel, "hey @Alice!", "alice", None);
        let counts = tracker.counts(endpoint, channel);
        assert_eq!(counts.unread, 2);
        assert_eq!(counts.mentions, 1);
    }

    #[test]
    fn viewing_or_muted_channels_do_not_count() {
        let mut tracker = UnreadTracker::new();
        let endpoint = Uuid::new_v4();
        let viewed = Uuid::new_v4();
        let muted = Uuid::new_v4();
        tracker.set_muted(muted, true);

        tracker.on_message(endpoint, viewed, "hi", "alice", Some(viewed));
        tracker.on_message(endpoint, muted, "hi @alice", "alice", None);
        assert_eq!(tracker.counts(endpoint, viewed), Counts::default());
        assert_eq!(tracker.counts(endpoint, muted), Counts::default());
    }

    #[test]
    fn selecting_a_channel_zeroes_both_counters() {
        let mut tracker = UnreadTracker::new();
        let endpoint = Uuid::new_v4();
        let channel = Uuid::new_v4();
        tracker.on_message(endpoint, channel, "ping @alice", "alice", None);
        assert_ne!(tracker.counts(endpoint, channel), Counts::default());

        tracker.select(endpoint, channel);
        assert_eq!(tracker.counts(endpoint, channel), Counts::default());
    }

    #[test]
    fn mention_matching_is_token_based_and_case_insensitive() {
        assert!(contains_mention("hey @alice", "alice"));
        assert!(contains_mention("hey @ALICE, hi", "alice"));
        assert!(contains_mention("@alice: morning", "Alice"));
        assert!(!contains_mention("hey @alicette", "alice"));
        assert!(!contains_mention("mail alice@example.com", "example"));
        assert!(!contains_mention("no mention here", "alice"));
        assert!(!contains_mention("@alice_b", "alice"));
    }

    #[test]
    fn muted_set_round_trips_as_a_sorted_list() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tracker = UnreadTracker::with_muted([a, b]);
        let list = tracker.muted_channels();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&a) && list.contains(&b));
        let rebuilt = UnreadTracker::with_muted(list);
        assert!(rebuilt.is_muted(a) && rebuilt.is_muted(b));
    }
}
