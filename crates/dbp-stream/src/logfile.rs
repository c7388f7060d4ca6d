// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-command log capture: every chunk is appended to a disk file and
//! fanned out to live followers.

use crate::queue::EventQueue;
use chrono::Utc;
use dbp_core::{LogChannel, LogEvent};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type Listener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

struct Inner {
    file: Option<File>,
    listeners: HashMap<u64, Listener>,
    queues: HashMap<u64, Arc<EventQueue<LogEvent>>>,
    next_token: u64,
}

/// Append-only log for one command.
///
/// Writes go to the file (flushed per chunk) and to every follower that was
/// registered *before* the write; followers never observe chunks emitted
/// before they subscribed — history replay is the broker's job, not this
/// type's.
pub struct LogStream {
    path: PathBuf,
    queue_capacity: usize,
    inner: Mutex<Inner>,
}

impl LogStream {
    const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    /// Open (append mode) the log file at `path`, creating parent
    /// directories as needed.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            inner: Mutex::new(Inner {
                file: Some(file),
                listeners: HashMap::new(),
                queues: HashMap::new(),
                next_token: 0,
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one chunk: to disk (flushed) and to every live follower.
    pub fn write(&self, text: &str, stream: LogChannel) -> std::io::Result<LogEvent> {
        let event = LogEvent {
            stream,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        let (listeners, queues) = {
            let mut inner = self.inner.lock().expect("log stream lock poisoned");
            let Some(file) = inner.file.as_mut() else {
                return Err(std::io::Error::other("log stream is closed"));
            };
            file.write_all(text.as_bytes())?;
            file.flush()?;
            (
                inner.listeners.values().cloned().collect::<Vec<_>>(),
                inner.queues.values().cloned().collect::<Vec<_>>(),
            )
        };
        // Fan out without holding the lock.
        for listener in listeners {
            listener(&event);
        }
        for queue in queues {
            queue.push(event.clone());
        }
        Ok(event)
    }

    /// Register a callback invoked for every future chunk. The returned
    /// token removes it again via [`remove_listener`](Self::remove_listener).
    pub fn add_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("log stream lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;
        inner.listeners.insert(token, Arc::new(callback));
        ListenerToken(token)
    }

    /// Deregister a listener. Unknown tokens are ignored.
    pub fn remove_listener(&self, token: ListenerToken) {
        let mut inner = self.inner.lock().expect("log stream lock poisoned");
        inner.listeners.remove(&token.0);
    }

    /// Subscribe to future chunks. The subscription ends when the stream
    /// closes or [`LogSubscription::cancel`] is called.
    pub fn follow(&self) -> LogSubscription {
        let queue = Arc::new(EventQueue::new(self.queue_capacity));
        let mut inner = self.inner.lock().expect("log stream lock poisoned");
        if inner.file.is_none() {
            // Already closed: hand back a finished subscription.
            queue.close();
            return LogSubscription { queue, token: None };
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.queues.insert(token, Arc::clone(&queue));
        LogSubscription {
            queue,
            token: Some(token),
        }
    }

    fn drop_queue(&self, token: u64) {
        let mut inner = self.inner.lock().expect("log stream lock poisoned");
        if let Some(queue) = inner.queues.remove(&token) {
            queue.close();
        }
    }

    /// Read the persisted file back, one chunk per line, labelled
    /// [`LogChannel::File`].
    pub fn replay(&self) -> std::io::Result<Vec<LogEvent>> {
        replay_file(&self.path)
    }

    /// Flush and release the file handle, ending every live subscription.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("log stream lock poisoned");
        if let Some(mut file) = inner.file.take() {
            let _ = file.flush();
        }
        for queue in inner.queues.values() {
            queue.close();
        }
        inner.queues.clear();
        inner.listeners.clear();
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read a persisted log file back as [`LogChannel::File`] chunks without an
/// open [`LogStream`].
pub fn replay_file(path: &Path) -> std::io::Result<Vec<LogEvent>> {
    let file = File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        events.push(LogEvent {
            stream: LogChannel::File,
            text: format!("{line}\n"),
            timestamp: Utc::now(),
        });
    }
    Ok(events)
}

/// Handle for deregistering a [`LogStream`] listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

/// A queue-backed follower of a [`LogStream`].
pub struct LogSubscription {
    queue: Arc<EventQueue<LogEvent>>,
    token: Option<u64>,
}

impl LogSubscription {
    /// Await the next chunk; `None` once the stream is closed and the
    /// backlog is drained.
    pub async fn next(&self) -> Option<LogEvent> {
        self.queue.recv().await
    }

    /// Non-blocking poll used by sync consumers.
    pub fn try_next(&self) -> Result<Option<LogEvent>, ()> {
        self.queue.try_recv()
    }

    /// How many chunks this follower lost to overflow.
    pub fn lag(&self) -> u64 {
        self.queue.lag()
    }

    /// Stop receiving; the stream itself is unaffected.
    pub fn cancel(self, stream: &LogStream) {
        if let Some(token) = self.token {
            stream.drop_queue(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn writes_land_on_disk_and_in_followers() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();

        let follower = stream.follow();
        stream.write("hi\n", LogChannel::Stdout).unwrap();
        stream.write("err\n", LogChannel::Stderr).unwrap();

        let first = follower.next().await.unwrap();
        assert_eq!(first.text, "hi\n");
        assert_eq!(first.stream, LogChannel::Stdout);
        let second = follower.next().await.unwrap();
        assert_eq!(second.stream, LogChannel::Stderr);

        let disk = std::fs::read_to_string(stream.path()).unwrap();
        assert_eq!(disk, "hi\nerr\n");
    }

    #[tokio::test]
    async fn late_followers_miss_earlier_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();

        stream.write("early\n", LogChannel::Stdout).unwrap();
        let follower = stream.follow();
        stream.write("late\n", LogChannel::Stdout).unwrap();

        assert_eq!(follower.next().await.unwrap().text, "late\n");
        stream.close();
        assert_eq!(follower.next().await, None);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();
        let follower = stream.follow();
        stream.close();
        assert_eq!(follower.next().await, None);
        // Following a closed stream yields an already-finished subscription.
        assert_eq!(stream.follow().next().await, None);
        assert!(stream.write("nope\n", LogChannel::Stdout).is_err());
    }

    #[test]
    fn listeners_observe_chunks_until_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let token = stream.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stream.write("one\n", LogChannel::Stdout).unwrap();
        stream.remove_listener(token);
        stream.write("two\n", LogChannel::Stdout).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replay_reads_persisted_lines_as_file_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();
        stream.write("alpha\n", LogChannel::Stdout).unwrap();
        stream.write("beta\n", LogChannel::Stderr).unwrap();

        let replayed = stream.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.stream == LogChannel::File));
        assert_eq!(replayed[0].text, "alpha\n");
        assert_eq!(replayed[1].text, "beta\n");
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = LogStream::create(tmp.path().join("cmd.log")).unwrap();
        let follower = stream.follow();
        stream.write("before\n", LogChannel::Stdout).unwrap();
        assert_eq!(follower.next().await.unwrap().text, "before\n");
        follower.cancel(&stream);
        // The stream happily keeps writing to disk afterwards.
        stream.write("after\n", LogChannel::Stdout).unwrap();
        let disk = std::fs::read_to_string(stream.path()).unwrap();
        assert_eq!(disk, "before\nafter\n");
    }
}
