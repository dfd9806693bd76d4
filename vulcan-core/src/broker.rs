//! In-process publish/subscribe for per-workload log lines.
//!
//! One topic per workload id. Subscribing after a topic has closed returns
//! an already-closed channel instead of hanging. The closed marker is kept
//! around specifically to win that race. Publish never blocks: a full
//! subscriber buffer means that subscriber drops the line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Bounded capacity of each subscriber's channel.
const SUBSCRIBER_BUFFER: usize = 64;

struct Topic {
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    closed: bool,
}

impl Topic {
    fn open() -> Self {
        Self {
            subscribers: HashMap::new(),
            closed: false,
        }
    }

    fn closed_marker() -> Self {
        Self {
            subscribers: HashMap::new(),
            closed: true,
        }
    }
}

/// Process-wide map from workload id to its log topic.
pub struct LogBroker {
    topics: Mutex<HashMap<String, Topic>>,
    next_sub_id: AtomicU64,
}

impl LogBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to `workload_id`'s log stream. If the topic is already
    /// closed (workload finished, or never started), the returned receiver
    /// is immediately closed; the caller's first `recv()` returns `None`.
    pub fn subscribe(&self, workload_id: &str) -> mpsc::Receiver<String> {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let topic = topics
            .entry(workload_id.to_string())
            .or_insert_with(Topic::open);

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if topic.closed {
            // Returning rx with tx dropped immediately closes it.
            return rx;
        }
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        topic.subscribers.insert(sub_id, tx);
        rx
    }

    /// Publish `line` to all current subscribers of `workload_id`. A no-op
    /// if the topic is missing or closed. No topic is created as a side
    /// effect of publishing. Sends are non-blocking: a full subscriber
    /// buffer drops the line for that subscriber rather than stalling the
    /// producer.
    pub fn publish(&self, workload_id: &str, line: &str) {
        let topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(topic) = topics.get(workload_id) else {
            return;
        };
        if topic.closed {
            return;
        }
        for tx in topic.subscribers.values() {
            let _ = tx.try_send(line.to_string());
        }
    }

    /// Close `workload_id`'s topic: mark it closed (creating the closed
    /// marker if no topic existed yet, so a subscriber that arrives after
    /// this call still observes closure) and drop all subscriber senders,
    /// closing their channels.
    pub fn close(&self, workload_id: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match topics.get_mut(workload_id) {
            Some(topic) => {
                topic.closed = true;
                topic.subscribers.clear();
            }
            None => {
                topics.insert(workload_id.to_string(), Topic::closed_marker());
            }
        }
    }
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new()
    }
}
