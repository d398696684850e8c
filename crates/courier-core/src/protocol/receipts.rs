//! Read Receipt Bookkeeping
//!
//! Tracks which messages we already reported as read so that reopening a
//! conversation or replaying a mark-all-read does not emit `mark-read` twice.

use std::collections::VecDeque;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::types::MessageId;

/// Deduplicates outgoing read receipts
#[derive(Debug, Clone)]
pub struct ReceiptTracker {
    /// Message ids for which `mark-read` has been emitted
    sent_read_receipts: HashSet<MessageId>,
    /// Insertion order of `sent_read_receipts`, oldest first
    sent_order: VecDeque<MessageId>,
    /// Message ids whose `mark-read` was rejected by the server
    rejected: HashSet<MessageId>,
    rejected_order: VecDeque<MessageId>,
    /// Privacy setting: whether to report reads to the server at all
    send_read_receipts_enabled: bool,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self {
            sent_read_receipts: HashSet::new(),
            sent_order: VecDeque::new(),
            rejected: HashSet::new(),
            rejected_order: VecDeque::new(),
            send_read_receipts_enabled: true,
        }
    }

    /// Check if a read receipt should be emitted for this message
    pub fn should_send_read_receipt(&self, message_id: &MessageId) -> bool {
        self.send_read_receipts_enabled && !self.sent_read_receipts.contains(message_id)
    }

    pub fn mark_read_receipt_sent(&mut self, message_id: MessageId) {
        if self.sent_read_receipts.insert(message_id.clone()) {
            self.sent_order.push_back(message_id);
        }
    }

    /// Record a negative acknowledgment; local read state stays as it is
    pub fn mark_rejected(&mut self, message_id: MessageId) {
        if self.rejected.insert(message_id.clone()) {
            self.rejected_order.push_back(message_id);
        }
    }

    pub fn set_read_receipts_enabled(&mut self, enabled: bool) {
        self.send_read_receipts_enabled = enabled;
    }

    pub fn read_receipts_enabled(&self) -> bool {
        self.send_read_receipts_enabled
    }

    /// Keep tracking data bounded in long-running sessions
    ///
    /// Forgets the oldest entries first. A forgotten message could be
    /// reported again if it is marked read once more.
    pub fn cleanup_old_receipts(&mut self, max_entries: usize) {
        evict_oldest(&mut self.sent_read_receipts, &mut self.sent_order, max_entries);
        evict_oldest(&mut self.rejected, &mut self.rejected_order, max_entries);
    }

    pub fn get_stats(&self) -> ReceiptStats {
        ReceiptStats {
            read_receipts_sent_count: self.sent_read_receipts.len(),
            read_receipts_rejected_count: self.rejected.len(),
            read_receipts_enabled: self.send_read_receipts_enabled,
        }
    }
}

fn evict_oldest(set: &mut HashSet<MessageId>, order: &mut VecDeque<MessageId>, max_entries: usize) {
    while set.len() > max_entries {
        match order.pop_front() {
            Some(oldest) => {
                set.remove(&oldest);
            }
            None => break,
        }
    }
}

impl Default for ReceiptTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about receipt tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptStats {
    pub read_receipts_sent_count: usize,
    pub read_receipts_rejected_count: usize,
    pub read_receipts_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_sent_once() {
        let mut tracker = ReceiptTracker::new();
        let id = MessageId::new("m1");

        assert!(tracker.should_send_read_receipt(&id));
        tracker.mark_read_receipt_sent(id.clone());
        assert!(!tracker.should_send_read_receipt(&id));

        // A rejection does not make the receipt eligible again
        tracker.mark_rejected(id.clone());
        assert!(!tracker.should_send_read_receipt(&id));
        assert_eq!(tracker.get_stats().read_receipts_rejected_count, 1);
    }

    #[test]
    fn test_disabled_receipts() {
        let mut tracker = ReceiptTracker::new();
        tracker.set_read_receipts_enabled(false);
        assert!(!tracker.should_send_read_receipt(&MessageId::new("m1")));
    }

    #[test]
    fn test_cleanup_bounds_memory() {
        let mut tracker = ReceiptTracker::new();
        for i in 0..10 {
            tracker.mark_read_receipt_sent(MessageId::new(format!("m{}", i)));
        }
        tracker.cleanup_old_receipts(4);
        assert_eq!(tracker.get_stats().read_receipts_sent_count, 4);
    }

    #[test]
    fn test_cleanup_forgets_oldest_first() {
        let mut tracker = ReceiptTracker::new();
        for i in 0..6 {
            tracker.mark_read_receipt_sent(MessageId::new(format!("m{}", i)));
            tracker.mark_rejected(MessageId::new(format!("r{}", i)));
        }
        tracker.cleanup_old_receipts(3);

        for i in 0..3 {
            assert!(tracker.should_send_read_receipt(&MessageId::new(format!("m{}", i))));
        }
        for i in 3..6 {
            assert!(!tracker.should_send_read_receipt(&MessageId::new(format!("m{}", i))));
        }
        assert_eq!(tracker.get_stats().read_receipts_rejected_count, 3);
    }
}
