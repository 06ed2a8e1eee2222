use std::collections::HashMap;

use shared::protocol::ServerEvent;

/// Online counts per channel, driven only by subscription notifications.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    counts: HashMap<String, usize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.counts.get(channel).copied().unwrap_or(0)
    }

    /// A fresh subscription resets the count to the hub's snapshot.
    pub fn subscription_succeeded(&mut self, channel: &str, count: usize) -> usize {
        self.counts.insert(channel.to_string(), count);
        count
    }

    pub fn member_added(&mut self, channel: &str) -> usize {
        let count = self.counts.entry(channel.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn member_removed(&mut self, channel: &str) -> usize {
        let count = self.counts.entry(channel.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
        *count
    }

    pub fn forget(&mut self, channel: &str) {
        self.counts.remove(channel);
    }

    /// Returns the new count when `event` is a presence notification.
    pub fn apply(&mut self, channel: &str, event: &ServerEvent) -> Option<usize> {
        match event {
            ServerEvent::SubscriptionSucceeded { count, .. } => {
                Some(self.subscription_succeeded(channel, *count))
            }
            ServerEvent::MemberAdded { .. } => Some(self.member_added(channel)),
            ServerEvent::MemberRemoved { .. } => Some(self.member_removed(channel)),
            _ => None,
        }
    }
}
