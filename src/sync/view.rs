use std::collections::HashMap;

use super::models::Message;

/// Ordered, deduplicated list of chat messages.
///
/// Entries are sorted by timestamp; equal timestamps keep arrival order.
/// `id` is the identity, so no two entries share one.
#[derive(Debug, Default, Clone)]
pub struct MessageView {
    messages: Vec<Message>,
    ids: HashMap<i64, usize>,
}

impl MessageView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial history load. Live messages applied while the load was in
    /// flight stay in the view.
    pub fn seed(&mut self, history: Vec<Message>) {
        self.reconcile(history);
    }

    /// Merge a history reload. The server copy of a known message replaces
    /// the local one; live messages the reload has not caught up with stay.
    pub fn reconcile(&mut self, history: Vec<Message>) {
        for message in history {
            self.upsert(message);
        }
    }

    /// Add a message from the push channel. Returns false for a duplicate.
    pub fn apply_live(&mut self, message: Message) -> bool {
        if self.ids.contains_key(&message.id) {
            return false;
        }
        self.insert(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains_key(&id)
    }

    fn upsert(&mut self, message: Message) {
        match self.ids.get(&message.id).copied() {
            Some(index) if self.messages[index].timestamp == message.timestamp => {
                self.messages[index] = message;
            }
            Some(index) => {
                self.messages.remove(index);
                self.reindex(index);
                self.insert(message);
            }
            None => self.insert(message),
        }
    }

    fn insert(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|existing| existing.timestamp <= message.timestamp);
        self.messages.insert(index, message);
        self.reindex(index);
    }

    fn reindex(&mut self, from: usize) {
        for (index, message) in self.messages.iter().enumerate().skip(from) {
            self.ids.insert(message.id, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: i64, second: u32, content: &str) -> Message {
        Message {
            id,
            content: content.to_string(),
            sender: "bob".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, second).unwrap(),
            room_id: None,
        }
    }

    fn ids(view: &MessageView) -> Vec<i64> {
        view.messages().iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_seed_sorts_by_timestamp() {
        let mut view = MessageView::new();
        view.seed(vec![message(3, 30, "c"), message(1, 10, "a"), message(2, 20, "b")]);
        assert_eq!(ids(&view), vec![1, 2, 3]);
    }

    #[test]
    fn test_seed_keeps_earlier_live_messages() {
        let mut view = MessageView::new();
        view.apply_live(message(9, 40, "arrived during load"));

        view.seed(vec![message(1, 10, "a")]);
        assert_eq!(ids(&view), vec![1, 9]);
    }

    #[test]
    fn test_live_duplicate_is_noop() {
        let mut view = MessageView::new();
        view.seed(vec![message(1, 10, "a"), message(2, 20, "b")]);

        assert!(!view.apply_live(message(2, 20, "b again")));
        assert_eq!(view.len(), 2);
        assert_eq!(view.messages()[1].content, "b");
    }

    #[test]
    fn test_live_message_interleaves_by_timestamp() {
        let mut view = MessageView::new();
        view.seed(vec![message(1, 10, "a"), message(3, 30, "c")]);

        assert!(view.apply_live(message(2, 20, "b")));
        assert!(view.apply_live(message(4, 40, "d")));
        assert_eq!(ids(&view), vec![1, 2, 3, 4]);
        assert!(view.contains(4));
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut view = MessageView::new();
        view.apply_live(message(9, 10, "first"));
        view.apply_live(message(5, 10, "second"));
        view.apply_live(message(7, 10, "third"));
        assert_eq!(ids(&view), vec![9, 5, 7]);
    }

    #[test]
    fn test_reconcile_keeps_live_and_prefers_server_copy() {
        let mut view = MessageView::new();
        view.seed(vec![message(1, 10, "a")]);
        view.apply_live(message(2, 20, "live"));
        view.apply_live(message(3, 30, "not yet in history"));

        view.reconcile(vec![message(1, 10, "a"), message(2, 20, "edited"), message(4, 25, "missed")]);

        assert_eq!(ids(&view), vec![1, 2, 4, 3]);
        assert_eq!(view.messages()[1].content, "edited");
    }

    #[test]
    fn test_reconcile_moves_message_when_timestamp_changes() {
        let mut view = MessageView::new();
        view.seed(vec![message(1, 10, "a"), message(2, 20, "b"), message(3, 30, "c")]);

        view.reconcile(vec![message(1, 35, "a")]);

        assert_eq!(ids(&view), vec![2, 3, 1]);
        assert_eq!(view.len(), 3);
        assert!(view.contains(1));
    }
}
