//! # Node Facade
//!
//! The main entry point for participating in the bus. [`Node::init`]
//! builds the process-scoped context — identity, message factory,
//! in-process queue, targets table, coordinator client — binds the
//! listener port, and starts the two loops:
//!
//! - the listener task accepting frames on the node's port
//! - the dispatch loop draining the in-process queue (a detached thread
//!   by default, or user-driven via [`Node::spin`]/[`Node::spin_once`])
//!
//! ## Quick start
//!
//! ```ignore
//! let node = Node::init(NodeConfig::new("talker")).await?;
//! let publisher = node.advertise::<ChatLine>("/chat").await?;
//! publisher.publish(&ChatLine { text: "hello".into() })?;
//!
//! let listener = Node::init(NodeConfig::new("listener")).await?;
//! let _sub = listener
//!     .subscribe::<ChatLine, _>("/chat", 10, |line| println!("{}", line.text))
//!     .await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::factory::{Message, MsgFactory};
use crate::identity::NodeIdentity;
use crate::publisher::Publisher;
use crate::queue::{Callback, MessageQueue, ReceivedMessage};
use crate::rpc::{MasterClient, DEFAULT_MASTER_ADDR};
use crate::subscriber::Subscriber;
use crate::timer::{Timer, TimerCallback, TimerEvent};
use crate::transport::{run_listener, InboundRouter, TargetsTable};

/// Sleep between empty dispatch sweeps.
const DISPATCH_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Node construction parameters. The defaults match a single-host
/// deployment with the coordinator on its standard port.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Process-unique node name.
    pub name: String,
    /// Coordinator RPC address.
    pub master_addr: String,
    /// IP the listener binds and advertises.
    pub bind_ip: String,
    /// Inclusive port range scanned for the listener.
    pub port_range: (u16, u16),
    /// Queue capacity for topics without an explicit override.
    pub default_queue_capacity: usize,
    /// Run the dispatch loop on a detached thread. Disable to drive
    /// dispatch manually with `spin`/`spin_once`.
    pub auto_dispatch: bool,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_owned(),
            master_addr: DEFAULT_MASTER_ADDR.to_owned(),
            bind_ip: "127.0.0.1".to_owned(),
            port_range: (60000, 61000),
            default_queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            auto_dispatch: true,
        }
    }
}

/// A running bus participant.
pub struct Node {
    identity: NodeIdentity,
    master: MasterClient,
    factory: Arc<MsgFactory>,
    queue: Arc<MessageQueue>,
    targets: Arc<TargetsTable>,
    listener_task: tokio::task::JoinHandle<()>,
    dispatch_stop: Arc<AtomicBool>,
    dispatch_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Node {
    /// Bind a listener port, start the I/O and dispatch loops, and
    /// return the ready node. Registration with the coordinator happens
    /// per publication/subscription, not here.
    pub async fn init(config: NodeConfig) -> Result<Self> {
        let (listener, port) =
            bind_in_range(&config.bind_ip, config.port_range).await?;
        let identity = NodeIdentity::new(&config.name, &config.bind_ip, port);
        info!(node = %identity, "node initialized");

        let factory = Arc::new(MsgFactory::new());
        let queue = Arc::new(MessageQueue::new(config.default_queue_capacity));
        let targets = Arc::new(TargetsTable::new());

        let router = InboundRouter {
            targets: targets.clone(),
            factory: factory.clone(),
            queue: queue.clone(),
        };
        let listener_task = tokio::spawn(run_listener(listener, router));

        let dispatch_stop = Arc::new(AtomicBool::new(false));
        let dispatch_thread = if config.auto_dispatch {
            let queue = queue.clone();
            let stop = dispatch_stop.clone();
            Some(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if !queue.drain_one() {
                        std::thread::sleep(DISPATCH_IDLE_SLEEP);
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            identity,
            master: MasterClient::new(&config.master_addr),
            factory,
            queue,
            targets,
            listener_task,
            dispatch_stop,
            dispatch_thread: Mutex::new(dispatch_thread),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn master(&self) -> &MasterClient {
        &self.master
    }

    /// Pre-register a message type so inbound payloads validate against
    /// its schema even before any typed subscription exists.
    pub fn register_message<T: Message>(&self) {
        self.factory.register::<T>();
    }

    /// Declare a publication. The coordinator learns of it immediately
    /// and pushes the topic's current subscribers back to this node;
    /// failure here means the publication was never registered.
    pub async fn advertise<T: Message>(&self, topic: &str) -> Result<Publisher<T>> {
        info!(topic, msg_type = T::type_name(), "advertise");
        self.master
            .register_publisher(topic, T::type_name(), &self.identity)
            .await
            .with_context(|| format!("registering publisher on {topic}"))?;
        Ok(Publisher::new(
            topic,
            self.identity.clone(),
            self.targets.clone(),
            self.master.clone(),
        ))
    }

    /// Subscribe with a typed callback. Payloads that fail to decode as
    /// `T` are logged and skipped — the callback only ever sees valid
    /// messages.
    pub async fn subscribe<T, F>(
        &self,
        topic: &str,
        queue_size: usize,
        callback: F,
    ) -> Result<Subscriber>
    where
        T: Message,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.factory.register::<T>();
        let wrapped: Callback = Arc::new(move |msg: &ReceivedMessage| {
            match serde_json::from_slice::<T>(&msg.payload) {
                Ok(typed) => callback(typed),
                Err(e) => {
                    warn!(topic = %msg.topic, msg_type = %msg.msg_type,
                        expected = T::type_name(), error = %e,
                        "dropping message that does not decode as subscribed type");
                }
            }
        });
        self.subscribe_raw(topic, queue_size, T::type_name(), wrapped)
            .await
    }

    /// Subscribe with a runtime type name and a dynamic callback — the
    /// path used by bridges and diagnostic tools.
    pub async fn subscribe_with_type<F>(
        &self,
        topic: &str,
        queue_size: usize,
        msg_type: &str,
        callback: F,
    ) -> Result<Subscriber>
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.subscribe_raw(topic, queue_size, msg_type, Arc::new(callback))
            .await
    }

    async fn subscribe_raw(
        &self,
        topic: &str,
        queue_size: usize,
        msg_type: &str,
        callback: Callback,
    ) -> Result<Subscriber> {
        info!(topic, msg_type, "subscribe");
        self.queue.register_topic(topic);
        self.queue.set_capacity(topic, queue_size);
        let id = self.queue.add_callback(topic, callback);

        match self.master.subscribe(topic, msg_type, &self.identity).await {
            Ok(publishers) => {
                debug!(topic, current_publishers = publishers.len(), "subscribed");
            }
            Err(e) => {
                self.queue.remove_callback(topic, id);
                return Err(e).with_context(|| format!("subscribing to {topic}"));
            }
        }

        Ok(Subscriber::new(
            topic,
            msg_type,
            id,
            self.queue.clone(),
            self.identity.clone(),
            self.master.clone(),
        ))
    }

    /// Host a timer on the node's runtime. `period` is in seconds.
    pub fn create_timer<F>(&self, period: f64, callback: F, oneshot: bool) -> Timer
    where
        F: Fn(&TimerEvent) + Send + Sync + 'static,
    {
        let callback: TimerCallback = Arc::new(callback);
        Timer::start(period, callback, oneshot)
    }

    /// Drain one queued message, invoking its topic's callbacks on the
    /// calling thread. Returns false when every queue was empty.
    pub fn spin_once(&self) -> bool {
        self.queue.drain_one()
    }

    /// Messages currently buffered for `topic`, waiting for dispatch.
    pub fn queue_depth(&self, topic: &str) -> usize {
        self.queue.depth(topic)
    }

    /// Drive dispatch on the calling thread until `shutdown`. Only
    /// meaningful with `auto_dispatch` disabled.
    pub fn spin(&self) {
        while !self.dispatch_stop.load(Ordering::Relaxed) {
            if !self.queue.drain_one() {
                std::thread::sleep(DISPATCH_IDLE_SLEEP);
            }
        }
    }

    /// Stop the I/O loop and the dispatch loop and release the queue.
    /// Publishers and subscribers dropped afterwards skip their RPC
    /// unregistration if the coordinator is gone; that is logged, not
    /// fatal.
    pub fn shutdown(&self) {
        self.listener_task.abort();
        self.dispatch_stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.dispatch_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        debug!(node = %self.identity.name, "node shut down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scan the inclusive port range for a bindable port, starting from a
/// random offset so concurrent node startups on one host spread out
/// instead of racing for the lowest port. Exhaustion is fatal.
async fn bind_in_range(ip: &str, (start, end): (u16, u16)) -> Result<(TcpListener, u16)> {
    if start > end {
        bail!("invalid port range {start}-{end}");
    }
    let span = (end - start) as u32 + 1;
    let offset: u32 = rand::thread_rng().gen_range(0..span);
    let mut last_err = None;
    for i in 0..span {
        let port = start + ((offset + i) % span) as u16;
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => {
                debug!(ip, port, "listener bound");
                return Ok((listener, port));
            }
            Err(e) => {
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("empty port range")))
    .with_context(|| format!("no available port in range {start}-{end} on {ip}"))
}
