//! # In-Process Message Queue
//!
//! Per-topic bounded FIFO feeding subscriber callbacks. The network
//! layer pushes; a single dispatch consumer drains via [`MessageQueue::
//! drain_one`], so user callbacks never run on an I/O task and per-topic
//! ordering is the publisher's send order (modulo drop-oldest under
//! overflow).
//!
//! Callbacks are keyed by [`SubscriberId`] so dropping one subscriber
//! removes only its own entry; the topic is unregistered when the last
//! callback goes away.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::factory::DynamicMessage;

/// Default per-topic capacity when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Identifies one registered callback within a topic.
pub type SubscriberId = u64;

/// A message as delivered to subscriber callbacks: the raw payload bytes
/// plus the factory's decoded, field-preserving view.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    pub msg_type: String,
    pub payload: Vec<u8>,
    pub decoded: DynamicMessage,
}

pub type Callback = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

#[derive(Default)]
struct TopicState {
    queue: VecDeque<Arc<ReceivedMessage>>,
    capacity: Option<usize>,
    callbacks: Vec<(SubscriberId, Callback)>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicState>,
}

/// The node-wide queue. One mutex guards registration state, capacities,
/// queues, and the callback registry together.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    default_capacity: usize,
    next_id: AtomicU64,
}

impl MessageQueue {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Idempotent. A topic must be registered before pushes land.
    pub fn register_topic(&self, topic: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.topics.contains_key(topic) {
            inner.topics.insert(topic.to_owned(), TopicState::default());
            debug!(topic, "topic registered");
        }
    }

    pub fn set_capacity(&self, topic: &str, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.topics.get_mut(topic) {
            state.capacity = Some(capacity);
        }
    }

    /// Register a callback for `topic`, creating the topic if needed.
    pub fn add_callback(&self, topic: &str, callback: Callback) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner
            .topics
            .entry(topic.to_owned())
            .or_default()
            .callbacks
            .push((id, callback));
        id
    }

    /// Remove one subscriber's callback. The topic (queue, capacity,
    /// registration) is dropped with the last callback.
    pub fn remove_callback(&self, topic: &str, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap();
        let now_empty = match inner.topics.get_mut(topic) {
            Some(state) => {
                state.callbacks.retain(|(cb_id, _)| *cb_id != id);
                state.callbacks.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.topics.remove(topic);
            debug!(topic, "last subscriber removed, topic unregistered");
        }
    }

    /// Drop the topic with its queue, callbacks, and capacity.
    pub fn unregister_topic(&self, topic: &str) {
        self.inner.lock().unwrap().topics.remove(topic);
    }

    /// Enqueue under drop-oldest. Pushes to unregistered topics are
    /// dropped with a warning.
    pub fn push(&self, msg: ReceivedMessage) {
        let mut inner = self.inner.lock().unwrap();
        let default_capacity = self.default_capacity;
        match inner.topics.get_mut(&msg.topic) {
            Some(state) => {
                let capacity = state.capacity.unwrap_or(default_capacity);
                while state.queue.len() >= capacity.max(1) {
                    state.queue.pop_front();
                }
                state.queue.push_back(Arc::new(msg));
            }
            None => {
                warn!(topic = %msg.topic, "message for unregistered topic dropped");
            }
        }
    }

    /// Pop the oldest message of some non-empty topic and invoke that
    /// topic's callbacks synchronously, in registration order. Returns
    /// false when every queue was empty.
    ///
    /// Callbacks run outside the queue lock; the single dispatch
    /// consumer is what keeps per-topic delivery ordered.
    pub fn drain_one(&self) -> bool {
        let (msg, callbacks) = {
            let mut inner = self.inner.lock().unwrap();
            let Some((_, state)) = inner
                .topics
                .iter_mut()
                .find(|(_, state)| !state.queue.is_empty())
            else {
                return false;
            };
            let msg = state.queue.pop_front().expect("non-empty queue");
            let callbacks: Vec<Callback> =
                state.callbacks.iter().map(|(_, cb)| cb.clone()).collect();
            (msg, callbacks)
        };
        for cb in callbacks {
            cb(&msg);
        }
        true
    }

    /// Messages currently buffered for `topic`.
    pub fn depth(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn msg(topic: &str, seq: u64) -> ReceivedMessage {
        let value = serde_json::json!({ "seq": seq });
        ReceivedMessage {
            topic: topic.to_owned(),
            msg_type: "test.Seq".to_owned(),
            payload: serde_json::to_vec(&value).unwrap(),
            decoded: DynamicMessage::new("test.Seq", value),
        }
    }

    fn seq_of(m: &ReceivedMessage) -> u64 {
        m.decoded.value()["seq"].as_u64().unwrap()
    }

    #[test]
    fn push_to_unregistered_topic_is_dropped() {
        let q = MessageQueue::default();
        q.push(msg("/nope", 1));
        assert!(!q.drain_one());
    }

    #[test]
    fn delivers_in_order_to_all_callbacks() {
        let q = MessageQueue::default();
        let seen_a = Arc::new(StdMutex::new(Vec::new()));
        let seen_b = Arc::new(StdMutex::new(Vec::new()));

        let a = seen_a.clone();
        q.add_callback("/t", Arc::new(move |m| a.lock().unwrap().push(seq_of(m))));
        let b = seen_b.clone();
        q.add_callback("/t", Arc::new(move |m| b.lock().unwrap().push(seq_of(m))));

        for seq in 1..=3 {
            q.push(msg("/t", seq));
        }
        while q.drain_one() {}

        assert_eq!(*seen_a.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*seen_b.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn drop_oldest_keeps_last_k() {
        let q = MessageQueue::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        q.add_callback("/t", Arc::new(move |m| s.lock().unwrap().push(seq_of(m))));
        q.set_capacity("/t", 2);

        for seq in 1..=5 {
            q.push(msg("/t", seq));
        }
        assert_eq!(q.depth("/t"), 2);
        while q.drain_one() {}

        assert_eq!(*seen.lock().unwrap(), vec![4, 5]);
    }

    #[test]
    fn removing_one_subscriber_keeps_the_other() {
        let q = MessageQueue::default();
        let seen_a = Arc::new(StdMutex::new(Vec::new()));
        let seen_b = Arc::new(StdMutex::new(Vec::new()));

        let a = seen_a.clone();
        let id_a = q.add_callback("/t", Arc::new(move |m| a.lock().unwrap().push(seq_of(m))));
        let b = seen_b.clone();
        q.add_callback("/t", Arc::new(move |m| b.lock().unwrap().push(seq_of(m))));

        q.remove_callback("/t", id_a);
        q.push(msg("/t", 9));
        while q.drain_one() {}

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec![9]);
    }

    #[test]
    fn last_subscriber_removal_unregisters_topic() {
        let q = MessageQueue::default();
        let id = q.add_callback("/t", Arc::new(|_| {}));
        q.remove_callback("/t", id);

        // Topic is gone; a new push is dropped.
        q.push(msg("/t", 1));
        assert!(!q.drain_one());
    }

    #[test]
    fn unregister_topic_drops_everything() {
        let q = MessageQueue::default();
        q.add_callback("/t", Arc::new(|_| {}));
        q.set_capacity("/t", 5);
        q.push(msg("/t", 1));
        assert_eq!(q.depth("/t"), 1);

        q.unregister_topic("/t");
        assert_eq!(q.depth("/t"), 0);
        q.push(msg("/t", 2));
        assert!(!q.drain_one());
    }

    #[test]
    fn drain_one_processes_a_single_message() {
        let q = MessageQueue::default();
        let count = Arc::new(StdMutex::new(0u32));
        let c = count.clone();
        q.add_callback("/t", Arc::new(move |_| *c.lock().unwrap() += 1));

        q.push(msg("/t", 1));
        q.push(msg("/t", 2));
        assert!(q.drain_one());
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(q.drain_one());
        assert!(!q.drain_one());
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
