//! # Publisher and Client Pool
//!
//! A [`Publisher`] fans each message out over per-subscriber TCP
//! connections. The pool is reconciled against the node's targets table
//! at publish time:
//!
//! - targets without a client yet get an asynchronous connect; the
//!   completion handler installs the connection, so a publish issued
//!   while the connect is in flight simply misses that peer
//! - peers that left the targets table are pruned, which ends their
//!   writer tasks; a later re-add reconnects
//! - live connections receive the frame through a bounded channel
//!   feeding one writer task per peer
//!
//! Delivery is best-effort end to end: connect failures and full
//! writer channels drop the frame for that peer, with no retry.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::factory::{encode_message, Message};
use crate::identity::{NodeIdentity, PeerAddr};
use crate::rpc::MasterClient;
use crate::transport::TargetsTable;
use crate::wire::Frame;

/// Frames buffered per connection before publishes start dropping for
/// that peer.
const CONNECTION_SEND_BUFFER: usize = 64;

#[derive(Default)]
struct ClientPool {
    /// Peers a connect was initiated for (pending, live, or failed —
    /// failures are not retried).
    clients: HashSet<PeerAddr>,
    /// Live connections, each a handle to that peer's writer task.
    connections: HashMap<PeerAddr, mpsc::Sender<Vec<u8>>>,
}

pub(crate) struct PublisherCore {
    topic: String,
    msg_type: String,
    node: NodeIdentity,
    targets: Arc<TargetsTable>,
    master: MasterClient,
    pool: Mutex<ClientPool>,
    unregistered: AtomicBool,
}

impl PublisherCore {
    /// Reconcile the pool against the targets table, then write the
    /// already-encoded frame to every live connection.
    fn send_frame(self: &Arc<Self>, frame_bytes: Vec<u8>) {
        let targets = self.targets.targets(&self.topic);

        let live: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut pool = self.pool.lock().unwrap();
            // Peers removed from the targets table stop receiving and
            // their writer tasks wind down with the dropped sender.
            pool.connections.retain(|addr, _| targets.contains(addr));
            pool.clients.retain(|addr| targets.contains(addr));

            for addr in &targets {
                if pool.clients.insert(addr.clone()) {
                    let core = self.clone();
                    let addr = addr.clone();
                    tokio::spawn(async move { core.connect_target(addr).await });
                }
            }
            pool.connections.values().cloned().collect()
        };

        for tx in live {
            if tx.try_send(frame_bytes.clone()).is_err() {
                debug!(topic = %self.topic, "connection buffer full, frame dropped for peer");
            }
        }
    }

    async fn connect_target(self: Arc<Self>, addr: PeerAddr) {
        let socket = match addr.socket_addr() {
            Ok(s) => s,
            Err(e) => {
                warn!(topic = %self.topic, %addr, error = %e, "bad target address");
                return;
            }
        };
        match TcpStream::connect(socket).await {
            Ok(stream) => {
                if self.unregistered.load(Ordering::SeqCst) {
                    return;
                }
                debug!(topic = %self.topic, %addr, "connected to subscriber");
                let (tx, rx) = mpsc::channel(CONNECTION_SEND_BUFFER);
                self.pool
                    .lock()
                    .unwrap()
                    .connections
                    .insert(addr.clone(), tx);
                tokio::spawn(self.clone().write_loop(addr, stream, rx));
            }
            Err(e) => {
                // No retry; the client entry stays so we do not hammer a
                // dead peer. The next targets delta resets the slate.
                warn!(topic = %self.topic, %addr, error = %e, "connect to subscriber failed");
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        addr: PeerAddr,
        mut stream: TcpStream,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = stream.write_all(&bytes).await {
                warn!(topic = %self.topic, %addr, error = %e, "write to subscriber failed");
                break;
            }
        }
        self.pool.lock().unwrap().connections.remove(&addr);
        debug!(topic = %self.topic, %addr, "subscriber connection closed");
    }

    async fn unregister(&self) {
        if self.unregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .master
            .unregister_publisher(&self.topic, &self.msg_type, &self.node)
            .await
        {
            warn!(topic = %self.topic, error = %e, "UnregisterPublisher failed");
        }
        let mut pool = self.pool.lock().unwrap();
        pool.clients.clear();
        pool.connections.clear();
    }
}

impl Drop for PublisherCore {
    fn drop(&mut self) {
        if self.unregistered.load(Ordering::SeqCst) {
            return;
        }
        let master = self.master.clone();
        let topic = self.topic.clone();
        let msg_type = self.msg_type.clone();
        let node = self.node.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = master.unregister_publisher(&topic, &msg_type, &node).await {
                        warn!(topic = %topic, error = %e, "UnregisterPublisher failed");
                    }
                });
            }
            Err(_) => {
                warn!(topic = %topic, "no runtime at publisher drop, skipping unregistration");
            }
        }
    }
}

/// Handle for publishing typed messages on one topic. Dropping the last
/// clone unregisters the publication (best-effort) and closes the pool.
pub struct Publisher<T: Message> {
    core: Arc<PublisherCore>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Message> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Message> Publisher<T> {
    pub(crate) fn new(
        topic: impl Into<String>,
        node: NodeIdentity,
        targets: Arc<TargetsTable>,
        master: MasterClient,
    ) -> Self {
        Self {
            core: Arc::new(PublisherCore {
                topic: topic.into(),
                msg_type: T::type_name().to_owned(),
                node,
                targets,
                master,
                pool: Mutex::new(ClientPool::default()),
                unregistered: AtomicBool::new(false),
            }),
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn msg_type(&self) -> &str {
        &self.core.msg_type
    }

    /// Number of currently-live subscriber connections.
    pub fn connection_count(&self) -> usize {
        self.core.pool.lock().unwrap().connections.len()
    }

    /// Serialize and fan out one message to the currently-connected
    /// subscribers.
    pub fn publish(&self, msg: &T) -> Result<()> {
        let payload = encode_message(msg)
            .with_context(|| format!("serializing {} message", self.core.msg_type))?;
        let frame = Frame::new(&self.core.topic, &self.core.msg_type, payload);
        self.core.send_frame(frame.encode());
        Ok(())
    }

    /// Explicitly unregister with the coordinator and drop the pool.
    /// Also runs (best-effort, spawned) when the last handle is dropped.
    pub async fn unregister(&self) {
        self.core.unregister().await;
    }
}
