//! Sliding window: the most recent turns of each conversation.
//!
//! A turn starts at a user message and collects everything up to the next
//! one. Windows are FIFO and capacity-bounded; the store hands out one
//! async mutex per conversation key so updates to the same conversation
//! serialize while different conversations proceed in parallel.

use ctxgate_core::{Message, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// A user message and the replies that followed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub messages: Vec<Message>,
}

impl Turn {
    pub fn new(first: Message) -> Self {
        Self {
            messages: vec![first],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Group a message sequence into turns. Messages before the first user
/// message form a turn of their own.
pub fn group_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for message in messages {
        match turns.last_mut() {
            Some(turn) if message.role != Role::User => turn.push(message.clone()),
            _ => turns.push(Turn::new(message.clone())),
        }
    }
    turns
}

/// Window changes produced by assembly, applied once the upstream has
/// accepted the exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTurn {
    /// History turns that seed a window with nothing in it yet
    pub seed: Vec<Turn>,
    /// The exchange's own user turn
    pub turn: Option<Turn>,
}

impl PendingTurn {
    pub fn is_empty(&self) -> bool {
        self.seed.is_empty() && self.turn.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    turns: VecDeque<Turn>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn, returning the evicted oldest turn if over capacity.
    pub fn push(&mut self, turn: Turn) -> Option<Turn> {
        self.turns.push_back(turn);
        if self.turns.len() > self.capacity {
            self.turns.pop_front()
        } else {
            None
        }
    }

    /// Apply an exchange. The seed is only used by an empty window.
    pub fn commit(&mut self, pending: PendingTurn) {
        if self.is_empty() {
            for turn in pending.seed {
                self.push(turn);
            }
        }
        if let Some(turn) = pending.turn {
            self.push(turn);
        }
    }

    /// Add a reply to the newest turn; starts a turn if there is none.
    pub fn record_reply(&mut self, message: Message) {
        match self.turns.back_mut() {
            Some(turn) => turn.push(message),
            None => {
                self.push(Turn::new(message));
            }
        }
    }

    /// Turns in arrival order, oldest first.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// All messages in the window, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .flat_map(|t| t.messages.iter().cloned())
            .collect()
    }
}

/// Conversation key → window.
#[derive(Debug)]
pub struct WindowStore {
    capacity: usize,
    windows: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SlidingWindow>>>>,
}

impl WindowStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The window for `key`, created empty on first use.
    pub fn window(&self, key: &str) -> Arc<tokio::sync::Mutex<SlidingWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(windows.entry(key.to_string()).or_insert_with(|| {
            trace!(key, "Sliding window created");
            Arc::new(tokio::sync::Mutex::new(SlidingWindow::new(self.capacity)))
        }))
    }

    /// Number of conversations tracked.
    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of a window's messages, if the conversation is known.
    pub async fn snapshot(&self, key: &str) -> Option<Vec<Message>> {
        let window = {
            let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            windows.get(key).cloned()
        }?;
        let guard = window.lock().await;
        Some(guard.messages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_five_keeps_five_newest() {
        let mut window = SlidingWindow::new(5);
        let mut evicted = Vec::new();
        for i in 0..8 {
            if let Some(old) = window.push(Turn::new(Message::user(format!("turn {i}")))) {
                evicted.push(old.messages[0].content.clone());
            }
        }
        assert_eq!(window.len(), 5);
        let kept: Vec<String> = window.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(kept, vec!["turn 3", "turn 4", "turn 5", "turn 6", "turn 7"]);
        assert_eq!(evicted, vec!["turn 0", "turn 1", "turn 2"]);
    }

    #[test]
    fn grouping_starts_turns_at_user_messages() {
        let messages = vec![
            Message::assistant("greeting"),
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a2a"),
            Message::assistant("a2b"),
        ];
        let turns = group_turns(&messages);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].messages.len(), 1);
        assert_eq!(turns[2].messages.len(), 3);
    }

    #[test]
    fn reply_joins_latest_turn() {
        let mut window = SlidingWindow::new(3);
        window.record_reply(Message::assistant("orphan"));
        window.push(Turn::new(Message::user("q")));
        window.record_reply(Message::assistant("a"));
        assert_eq!(window.len(), 2);
        assert_eq!(window.turns().last().unwrap().messages.len(), 2);
    }

    #[test]
    fn commit_seeds_only_an_empty_window() {
        let pending = PendingTurn {
            seed: group_turns(&[Message::user("q0"), Message::assistant("a0")]),
            turn: Some(Turn::new(Message::user("q1"))),
        };
        let mut window = SlidingWindow::new(5);
        window.commit(pending.clone());
        let contents: Vec<String> = window.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["q0", "a0", "q1"]);

        window.commit(pending);
        assert_eq!(window.len(), 3);
        assert!(PendingTurn::default().is_empty());
    }

    #[tokio::test]
    async fn store_shares_window_per_key() {
        let store = WindowStore::new(4);
        store
            .window("a")
            .lock()
            .await
            .push(Turn::new(Message::user("hello")));
        assert_eq!(store.window("a").lock().await.len(), 1);
        assert!(store.window("b").lock().await.is_empty());
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot("a").await.unwrap().len(), 1);
        assert!(store.snapshot("zzz").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_to_one_key_are_not_lost() {
        let store = Arc::new(WindowStore::new(1000));
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let window = store.window("shared");
                    let mut guard = window.lock().await;
                    let before = guard.len();
                    tokio::task::yield_now().await;
                    guard.push(Turn::new(Message::user(format!("{i}"))));
                    assert_eq!(guard.len(), before + 1);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.window("shared").lock().await.len(), 50);
    }
}
