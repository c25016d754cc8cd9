//! # Subscription Handle
//!
//! RAII handle for one subscription. Dropping it removes only this
//! subscriber's callback from the queue — other subscribers on the same
//! topic in the same process keep theirs — and issues a best-effort
//! `Unsubscribe` to the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::identity::NodeIdentity;
use crate::queue::{MessageQueue, SubscriberId};
use crate::rpc::MasterClient;

pub struct Subscriber {
    topic: String,
    msg_type: String,
    id: SubscriberId,
    queue: Arc<MessageQueue>,
    node: NodeIdentity,
    master: MasterClient,
    unsubscribed: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        id: SubscriberId,
        queue: Arc<MessageQueue>,
        node: NodeIdentity,
        master: MasterClient,
    ) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
            id,
            queue,
            node,
            master,
            unsubscribed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Remove this subscription now, notifying the coordinator. Also
    /// runs (best-effort, spawned) on drop.
    pub async fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.remove_callback(&self.topic, self.id);
        if let Err(e) = self
            .master
            .unsubscribe(&self.topic, &self.msg_type, &self.node)
            .await
        {
            warn!(topic = %self.topic, error = %e, "Unsubscribe failed");
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.unsubscribed.load(Ordering::SeqCst) {
            return;
        }
        self.queue.remove_callback(&self.topic, self.id);
        let master = self.master.clone();
        let topic = self.topic.clone();
        let msg_type = self.msg_type.clone();
        let node = self.node.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = master.unsubscribe(&topic, &msg_type, &node).await {
                        warn!(topic = %topic, error = %e, "Unsubscribe failed");
                    }
                });
            }
            Err(_) => {
                warn!(topic = %topic, "no runtime at subscriber drop, skipping unsubscription");
            }
        }
    }
}
