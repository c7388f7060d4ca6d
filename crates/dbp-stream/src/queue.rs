// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded single-consumer event queue bridging sync producers and async
//! consumers.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO whose producer side is plain sync (callable from any
/// thread) and whose consumer side is awaited on the event loop.
///
/// When the queue is full the oldest element is dropped and a lag counter
/// is bumped; slow consumers lose their own backlog, never the producer.
#[derive(Debug)]
pub struct EventQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    lag: u64,
}

impl<T> EventQueue<T> {
    /// Create a queue holding at most `capacity` pending events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                lag: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event, evicting the oldest pending one when full.
    /// Pushes after close are discarded.
    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closed {
                return;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.lag += 1;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Close the queue; pending events remain receivable, then `recv`
    /// yields `None`.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    /// Await the next event; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv): `Ok(None)` when empty
    /// but open, `Err(())` when closed and drained.
    pub fn try_recv(&self) -> Result<Option<T>, ()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(item) = inner.items.pop_front() {
            return Ok(Some(item));
        }
        if inner.closed { Err(()) } else { Ok(None) }
    }

    /// How many events this consumer lost to overflow.
    pub fn lag(&self) -> u64 {
        self.inner.lock().expect("queue lock poisoned").lag
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn push_then_recv_preserves_order() {
        let queue = EventQueue::new(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = EventQueue::new(8);
        queue.push("last");
        queue.close();
        assert_eq!(queue.recv().await, Some("last"));
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_lag() {
        let queue = EventQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.lag(), 1);
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
    }

    #[tokio::test]
    async fn recv_wakes_on_cross_thread_push() {
        let queue = Arc::new(EventQueue::new(8));
        let producer = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { queue.recv().await });
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            producer.push(42);
        });
        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn push_after_close_is_discarded() {
        let queue = EventQueue::new(8);
        queue.close();
        queue.push(1);
        assert_eq!(queue.recv().await, None);
    }
}
