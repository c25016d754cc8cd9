//! # Node Transport Listener
//!
//! The per-node TCP server. Every inbound connection — publisher data
//! streams and coordinator pushes alike — carries the same frame shape;
//! the listener decodes frames and routes them:
//!
//! - control frames (`TopicTargetsUpdate`) merge into the node's
//!   [`TargetsTable`], keyed by `(ip, port)`
//! - data frames decode through the [`MsgFactory`] and land in the
//!   in-process [`MessageQueue`]
//!
//! The listener never initiates connections: it accepts, reads until EOF
//! or error, and releases the connection's resources. A wire decode
//! error or payload parse failure closes the offending connection;
//! unknown topics drop only the frame.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::factory::MsgFactory;
use crate::identity::PeerAddr;
use crate::messages::TopicTargetsUpdate;
use crate::queue::{MessageQueue, ReceivedMessage};
use crate::wire::{Frame, FrameDecoder};

/// Per-node routing state: for each topic this node publishes, the
/// subscriber addresses its publishers should send to. Mutated only by
/// coordinator pushes arriving on the listener; read at publish time.
#[derive(Default)]
pub struct TargetsTable {
    inner: RwLock<HashMap<String, HashSet<PeerAddr>>>,
}

impl TargetsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta. Applying the same delta twice is a no-op.
    pub fn apply(&self, update: &TopicTargetsUpdate) {
        let mut inner = self.inner.write().unwrap();
        let targets = inner.entry(update.topic.clone()).or_default();
        for n in &update.add_targets {
            targets.insert(n.peer_addr());
        }
        for n in &update.remove_targets {
            targets.remove(&n.peer_addr());
        }
        debug!(topic = %update.topic, adds = update.add_targets.len(),
            removes = update.remove_targets.len(), total = targets.len(),
            "targets table updated");
    }

    /// Current targets for `topic`.
    pub fn targets(&self, topic: &str) -> HashSet<PeerAddr> {
        self.inner
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

/// Everything an inbound frame can touch.
#[derive(Clone)]
pub struct InboundRouter {
    pub targets: Arc<TargetsTable>,
    pub factory: Arc<MsgFactory>,
    pub queue: Arc<MessageQueue>,
}

impl InboundRouter {
    /// Route one decoded frame. An error means the connection carrying
    /// the frame should be closed.
    pub fn route(&self, frame: Frame) -> Result<()> {
        if frame.is_targets_update() {
            let update: TopicTargetsUpdate = serde_json::from_slice(&frame.payload)
                .with_context(|| format!("parsing targets update for topic {}", frame.topic))?;
            self.targets.apply(&update);
            return Ok(());
        }

        let decoded = self
            .factory
            .decode(&frame.msg_type, &frame.payload)
            .with_context(|| format!("parsing {} payload on topic {}", frame.msg_type, frame.topic))?;
        // Unknown topics are dropped (with a warning) inside the queue;
        // the connection stays up.
        self.queue.push(ReceivedMessage {
            topic: frame.topic,
            msg_type: frame.msg_type,
            payload: frame.payload,
            decoded,
        });
        Ok(())
    }
}

/// Accept loop on the node's listener port. Runs until the owning task
/// is aborted at shutdown.
pub async fn run_listener(listener: TcpListener, router: InboundRouter) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "inbound connection");
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, router).await {
                        warn!(%peer, error = %e, "closing inbound connection");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, router: InboundRouter) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.context("reading from peer")?;
        if n == 0 {
            return Ok(());
        }
        decoder.push_bytes(&buf[..n]);
        while let Some(frame) = decoder.next_frame().context("decoding frame")? {
            router.route(frame)?;
        }
    }
}
