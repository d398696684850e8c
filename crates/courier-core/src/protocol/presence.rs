//! Peer Presence Tracking
//!
//! Remembers which users the server last reported as online. Presence is only
//! meaningful while connected; the tracker is cleared when the connection
//! drops.

use hashbrown::HashSet;

use crate::types::{Timestamp, UserId};

/// Presence change that actually altered tracked state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
    pub at: Timestamp,
}

/// Set of users currently reported online
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence notification; repeats return `None`
    pub fn update(&mut self, user_id: UserId, online: bool, at: Timestamp) -> Option<PresenceChange> {
        let changed = if online {
            self.online.insert(user_id.clone())
        } else {
            self.online.remove(&user_id)
        };
        changed.then_some(PresenceChange {
            user_id,
            online,
            at,
        })
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forget all presence, returning who was online
    pub fn clear(&mut self) -> Vec<UserId> {
        self.online.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_presence_is_absorbed() {
        let mut tracker = PresenceTracker::new();
        let peer = UserId::new("peer");

        assert!(tracker.update(peer.clone(), true, Timestamp::new(1)).is_some());
        assert!(tracker.update(peer.clone(), true, Timestamp::new(2)).is_none());
        assert!(tracker.is_online(&peer));

        let change = tracker.update(peer.clone(), false, Timestamp::new(3)).unwrap();
        assert!(!change.online);
        assert!(tracker.update(peer, false, Timestamp::new(4)).is_none());
    }

    #[test]
    fn test_clear_returns_previously_online() {
        let mut tracker = PresenceTracker::new();
        tracker.update(UserId::new("a"), true, Timestamp::new(1));
        tracker.update(UserId::new("b"), true, Timestamp::new(1));

        let mut cleared = tracker.clear();
        cleared.sort();
        assert_eq!(cleared, vec![UserId::new("a"), UserId::new("b")]);
        assert_eq!(tracker.online_count(), 0);
    }
}
