use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::intent::Intent;

/// One finished turn as remembered by the session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    /// Monotonic turn number within the session
    pub index: u64,
    pub question: String,
    pub intent: Intent,
    pub query: Option<String>,
    pub result_summary: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded, append-only turn history of one session.
///
/// Oldest turns are evicted once capacity is reached. Turns refer to each
/// other only by `index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
    next_index: u64,
}

impl ConversationContext {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    /// Index the next appended turn will receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn push(
        &mut self,
        question: impl Into<String>,
        intent: Intent,
        query: Option<String>,
        result_summary: Option<String>,
    ) -> u64 {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        let index = self.next_index;
        self.turns.push_back(ConversationTurn {
            index,
            question: question.into(),
            intent,
            query,
            result_summary,
            recorded_at: Utc::now(),
        });
        self.next_index += 1;
        index
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn get(&self, index: u64) -> Option<&ConversationTurn> {
        self.turns.iter().find(|turn| turn.index == index)
    }

    /// The last `window` turns, oldest first
    pub fn recent(&self, window: usize) -> impl Iterator<Item = &ConversationTurn> {
        let skip = self.turns.len().saturating_sub(window);
        self.turns.iter().skip(skip)
    }

    /// Render recent turns for a prompt
    pub fn render_history(&self, window: usize) -> String {
        let mut history = String::new();
        for turn in self.recent(window) {
            history.push_str(&format!("user: {}\n", turn.question));
            history.push_str(&format!("intent: {}\n", turn.intent.as_str()));
            if let Some(query) = &turn.query {
                history.push_str(&format!("sql: {}\n", query));
            }
            if let Some(summary) = &turn.result_summary {
                history.push_str(&format!("result: {}\n", summary));
            }
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_turn_is_evicted() {
        let mut context = ConversationContext::new(2);
        context.push("first", Intent::Chat, None, None);
        context.push("second", Intent::Chat, None, None);
        context.push("third", Intent::RunQuery, Some("SELECT 1".into()), None);

        assert_eq!(context.len(), 2);
        let questions: Vec<&str> = context.turns().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["second", "third"]);
        assert!(context.get(0).is_none());
        assert_eq!(context.get(2).unwrap().question, "third");
    }

    #[test]
    fn test_indices_keep_increasing_after_eviction() {
        let mut context = ConversationContext::new(1);
        assert_eq!(context.push("a", Intent::Chat, None, None), 0);
        assert_eq!(context.push("b", Intent::Chat, None, None), 1);
        assert_eq!(context.next_index(), 2);
    }

    #[test]
    fn test_recent_window() {
        let mut context = ConversationContext::new(10);
        for i in 0..5 {
            context.push(format!("q{}", i), Intent::Chat, None, None);
        }
        let recent: Vec<&str> = context.recent(3).map(|t| t.question.as_str()).collect();
        assert_eq!(recent, vec!["q2", "q3", "q4"]);
        assert_eq!(context.recent(50).count(), 5);
    }

    #[test]
    fn test_render_history() {
        let mut context = ConversationContext::new(4);
        context.push(
            "Show bookings",
            Intent::RunQuery,
            Some("SELECT * FROM bookings LIMIT 10".into()),
            Some("10 rows (book_ref)".into()),
        );
        let history = context.render_history(3);
        assert!(history.contains("user: Show bookings"));
        assert!(history.contains("sql: SELECT * FROM bookings LIMIT 10"));
        assert!(history.contains("result: 10 rows (book_ref)"));
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let context = ConversationContext::new(0);
        assert_eq!(context.capacity(), 1);
    }
}
