// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-session fan-out buses with bounded history replay.
//!
//! Both brokers share one mechanism: publishing records the event into a
//! bounded per-session history and forwards it to every subscriber queue.
//! `subscribe_with_history` captures the history snapshot and registers the
//! subscriber under a single lock acquisition, so no event published after
//! the snapshot can be missed by the queue.

use crate::queue::EventQueue;
use chrono::Utc;
use dbp_core::{DebugEvent, LogChannel, LogEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// History floor; configurations below this are raised to it.
pub const MIN_HISTORY_LIMIT: usize = 256;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SessionEntry<T> {
    history: VecDeque<T>,
    subscribers: HashMap<u64, Arc<EventQueue<T>>>,
}

impl<T> SessionEntry<T> {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: HashMap::new(),
        }
    }
}

struct BusInner<T> {
    sessions: HashMap<String, SessionEntry<T>>,
    next_token: u64,
}

struct Bus<T> {
    inner: Mutex<BusInner<T>>,
    history_limit: usize,
    queue_capacity: usize,
}

impl<T: Clone> Bus<T> {
    fn new(history_limit: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                sessions: HashMap::new(),
                next_token: 0,
            }),
            history_limit: history_limit.max(MIN_HISTORY_LIMIT),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn publish(&self, session_id: &str, event: T) {
        // Snapshot the subscriber queues under the lock, enqueue outside it.
        let queues = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let entry = inner
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            if entry.history.len() >= self.history_limit {
                entry.history.pop_front();
            }
            entry.history.push_back(event.clone());
            entry.subscribers.values().cloned().collect::<Vec<_>>()
        };
        for queue in queues {
            queue.push(event.clone());
        }
    }

    fn history(&self, session_id: &str) -> Vec<T> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        inner
            .sessions
            .get(session_id)
            .map(|entry| entry.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribe_with_history(
        bus: &Arc<Self>,
        session_id: &str,
    ) -> (Vec<T>, BrokerSubscription<T>) {
        let queue = Arc::new(EventQueue::new(bus.queue_capacity));
        let (history, token) = {
            let mut inner = bus.inner.lock().expect("broker lock poisoned");
            let token = inner.next_token;
            inner.next_token += 1;
            let entry = inner
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            let history: Vec<T> = entry.history.iter().cloned().collect();
            entry.subscribers.insert(token, Arc::clone(&queue));
            (history, token)
        };
        let subscription = BrokerSubscription {
            queue,
            bus: Arc::downgrade(bus),
            session_id: session_id.to_string(),
            token,
        };
        (history, subscription)
    }
}

impl<T> Bus<T> {
    fn unsubscribe(&self, session_id: &str, token: u64) {
        let queue = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            inner
                .sessions
                .get_mut(session_id)
                .and_then(|entry| entry.subscribers.remove(&token))
        };
        if let Some(queue) = queue {
            queue.close();
        }
    }
}

/// A live broker subscription. Dropping it unsubscribes.
pub struct BrokerSubscription<T> {
    queue: Arc<EventQueue<T>>,
    bus: std::sync::Weak<Bus<T>>,
    session_id: String,
    token: u64,
}

impl<T: Clone> BrokerSubscription<T> {
    /// Await the next live event; `None` after unsubscribe.
    pub async fn next(&self) -> Option<T> {
        self.queue.recv().await
    }

    /// Non-blocking poll: `Ok(None)` when empty but live, `Err(())` once
    /// unsubscribed and drained.
    pub fn try_next(&self) -> Result<Option<T>, ()> {
        self.queue.try_recv()
    }

    /// Events this subscriber lost to queue overflow.
    pub fn lag(&self) -> u64 {
        self.queue.lag()
    }
}

impl<T> Drop for BrokerSubscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.session_id, self.token);
        }
    }
}

// ---------------------------------------------------------------------------
// LogBroker
// ---------------------------------------------------------------------------

/// Per-session fan-out of log lines to WebSocket subscribers.
#[derive(Clone)]
pub struct LogBroker {
    bus: Arc<Bus<LogEvent>>,
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new(MIN_HISTORY_LIMIT, DEFAULT_QUEUE_CAPACITY)
    }
}

impl LogBroker {
    /// Create a broker with the given history and subscriber-queue bounds.
    /// The history bound is floored at [`MIN_HISTORY_LIMIT`].
    pub fn new(history_limit: usize, queue_capacity: usize) -> Self {
        Self {
            bus: Arc::new(Bus::new(history_limit, queue_capacity)),
        }
    }

    /// Record and fan out one log line.
    pub fn append(&self, session_id: &str, text: &str, stream: LogChannel) -> LogEvent {
        let event = LogEvent {
            stream,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.bus.publish(session_id, event.clone());
        event
    }

    /// Snapshot of the retained history for a session.
    pub fn history(&self, session_id: &str) -> Vec<LogEvent> {
        self.bus.history(session_id)
    }

    /// Atomically snapshot history and subscribe to everything after it.
    pub fn subscribe_with_history(
        &self,
        session_id: &str,
    ) -> (Vec<LogEvent>, BrokerSubscription<LogEvent>) {
        Bus::subscribe_with_history(&self.bus, session_id)
    }
}

// ---------------------------------------------------------------------------
// DebugBroker
// ---------------------------------------------------------------------------

/// Per-session fan-out of debugger control events.
#[derive(Clone)]
pub struct DebugBroker {
    bus: Arc<Bus<DebugEvent>>,
}

impl Default for DebugBroker {
    fn default() -> Self {
        Self::new(MIN_HISTORY_LIMIT, DEFAULT_QUEUE_CAPACITY)
    }
}

impl DebugBroker {
    /// Create a broker with the given history and subscriber-queue bounds.
    /// The history bound is floored at [`MIN_HISTORY_LIMIT`].
    pub fn new(history_limit: usize, queue_capacity: usize) -> Self {
        Self {
            bus: Arc::new(Bus::new(history_limit, queue_capacity)),
        }
    }

    /// Record and fan out one debugger event.
    pub fn publish(&self, session_id: &str, kind: &str, payload: serde_json::Value) -> DebugEvent {
        let event = DebugEvent {
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.bus.publish(session_id, event.clone());
        event
    }

    /// Snapshot of the retained history for a session.
    pub fn history(&self, session_id: &str) -> Vec<DebugEvent> {
        self.bus.history(session_id)
    }

    /// Atomically snapshot history and subscribe to everything after it.
    pub fn subscribe_with_history(
        &self,
        session_id: &str,
    ) -> (Vec<DebugEvent>, BrokerSubscription<DebugEvent>) {
        Bus::subscribe_with_history(&self.bus, session_id)
    }
}
