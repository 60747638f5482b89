use std::collections::{HashSet, VecDeque};

use crate::protocol::{MessageKind, SemanticMessage};

pub const DEFAULT_CAPACITY: usize = 50;

/// Leading characters of content that participate in the key.
const KEY_PREFIX_CHARS: usize = 100;

type DedupKey = (MessageKind, String);

/// Suppresses messages already seen among the last `capacity` distinct
/// ones. Text scraping and hook events often report the same reply twice.
#[derive(Debug)]
pub struct MessageDedup {
    capacity: usize,
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn key(message: &SemanticMessage) -> DedupKey {
        (
            message.kind.clone(),
            message.content.chars().take(KEY_PREFIX_CHARS).collect(),
        )
    }

    /// Returns `false` for a repeat; otherwise records the message.
    pub fn should_emit(&mut self, message: &SemanticMessage) -> bool {
        let key = Self::key(message);
        if self.seen.contains(&key) {
            return false;
        }
        self.insert(key);
        true
    }

    /// Record a message that is emitted regardless, so later repeats of it
    /// are suppressed. Refreshes its position when already present.
    pub fn remember(&mut self, message: &SemanticMessage) {
        let key = Self::key(message);
        if self.seen.remove(&key) {
            self.order.retain(|existing| existing != &key);
        }
        self.insert(key);
    }

    fn insert(&mut self, key: DedupKey) {
        self.seen.insert(key.clone());
        self.order.push_back(key);

        while self.seen.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        debug_assert_eq!(
            self.seen.len(),
            self.order.len(),
            "MessageDedup: set and order out of sync"
        );
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::MessageDedup;
    use crate::protocol::{MessageKind, SemanticMessage};

    fn reply(content: &str) -> SemanticMessage {
        SemanticMessage::new(MessageKind::AgentReply, content)
    }

    #[test]
    fn drops_duplicates() {
        let mut dedup = MessageDedup::default();
        let emitted = (0..5).filter(|_| dedup.should_emit(&reply("same"))).count();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn kind_is_part_of_the_key() {
        let mut dedup = MessageDedup::default();
        assert!(dedup.should_emit(&reply("ls")));
        assert!(dedup.should_emit(&SemanticMessage::new(MessageKind::UserInput, "ls")));
    }

    #[test]
    fn only_the_leading_hundred_chars_count() {
        let mut dedup = MessageDedup::default();
        let prefix = "x".repeat(100);
        assert!(dedup.should_emit(&reply(&format!("{prefix} first tail"))));
        assert!(!dedup.should_emit(&reply(&format!("{prefix} second tail"))));
    }

    #[test]
    fn remains_bounded_and_oldest_becomes_eligible() {
        let mut dedup = MessageDedup::new(3);
        for content in ["a", "b", "c", "d"] {
            assert!(dedup.should_emit(&reply(content)));
        }
        assert_eq!(dedup.len(), 3);
        assert!(dedup.should_emit(&reply("a")));
        assert!(!dedup.should_emit(&reply("d")));
    }

    #[test]
    fn remembered_messages_suppress_later_repeats() {
        let mut dedup = MessageDedup::new(2);
        dedup.remember(&reply("from hook"));
        dedup.remember(&reply("from hook"));
        assert_eq!(dedup.len(), 1);
        assert!(!dedup.should_emit(&reply("from hook")));

        assert!(dedup.should_emit(&reply("b")));
        dedup.remember(&reply("from hook"));
        assert!(dedup.should_emit(&reply("c")));
        // "b" was oldest once "from hook" was refreshed.
        assert!(dedup.should_emit(&reply("b")));
    }
}
