//! # Coordinator (Master)
//!
//! The central registry process: a TCP accept loop serving the RPC
//! request/response protocol, a [`MessageGraph`] guarded by one mutex,
//! and the push channel that delivers [`TopicTargetsUpdate`] deltas to
//! publisher nodes whenever the graph changes.
//!
//! Each handler locks the graph, mutates it, computes the set of nodes
//! to notify, and initiates those pushes before replying — a publisher
//! that receives an Add for subscriber `s` can rely on `s` already being
//! registered.
//!
//! Pushes are one-shot: a short-lived client connects to the target
//! node's listener, writes a single framed update, and half-closes. An
//! unreachable target is logged and dropped; the next state change
//! carries the full delta again, so convergence is eventual.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::graph::MessageGraph;
use crate::identity::{NodeIdentity, TopicInfo, TopicKey};
use crate::messages::{
    deserialize_bounded, serialize_rpc, RpcBody, RpcReply, RpcRequest, TopicTargetsUpdate,
    MAX_RPC_MESSAGE_SIZE,
};
use crate::wire::{Frame, TARGETS_UPDATE_TYPE};

/// Default bind address for the coordinator RPC service.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:50051";

/// Frame topic used when an update has no topic of its own.
const CONTROL_TOPIC: &str = "__targets_update";

/// The coordinator process. Owns the graph and the RPC listener.
pub struct Master {
    graph: Arc<Mutex<MessageGraph>>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Master {
    /// Bind the RPC listener. Port 0 picks an ephemeral port (tests).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding coordinator RPC listener on {addr}"))?;
        let local_addr = listener.local_addr().context("reading local address")?;
        info!(%local_addr, "coordinator listening");
        Ok(Self {
            graph: Arc::new(Mutex::new(MessageGraph::new())),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the registry graph (diagnostics surface).
    pub fn graph(&self) -> Arc<Mutex<MessageGraph>> {
        self.graph.clone()
    }

    /// Accept loop. Runs until the task is dropped or the listener fails.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("accepting RPC connection")?;
            let graph = self.graph.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(graph, stream).await {
                    debug!(%peer, error = %e, "RPC connection ended");
                }
            });
        }
    }
}

/// Serve sequential requests on one connection until EOF.
async fn serve_connection(graph: Arc<Mutex<MessageGraph>>, mut stream: TcpStream) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // Clean EOF between requests.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("reading request length"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len as u64 > MAX_RPC_MESSAGE_SIZE {
            bail!("request of {len} bytes exceeds cap");
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .context("reading request body")?;
        let request: RpcRequest = deserialize_bounded(&body).context("decoding request")?;

        let (reply, pushes) = handle_request(&graph, &request);
        for (target, update) in pushes {
            tokio::spawn(async move {
                if let Err(e) = push_update(&target, &update).await {
                    warn!(node = %target.name, topic = %update.topic, error = %e,
                        "dropping targets push");
                }
            });
        }

        let reply_bytes = serialize_rpc(&reply).context("serializing reply")?;
        stream
            .write_all(&(reply_bytes.len() as u32).to_be_bytes())
            .await
            .context("writing reply length")?;
        stream
            .write_all(&reply_bytes)
            .await
            .context("writing reply body")?;
    }
}

type Pushes = Vec<(NodeIdentity, TopicTargetsUpdate)>;

/// Mutate the graph and compute the pushes for one request. Holds the
/// graph mutex for the duration; the RPC service is serialized on it.
fn handle_request(graph: &Mutex<MessageGraph>, request: &RpcRequest) -> (RpcReply, Pushes) {
    let mut g = graph.lock().unwrap();
    match request {
        RpcRequest::Subscribe {
            topic_name,
            msg_type,
            node,
        } => {
            info!(topic = %topic_name, msg_type = %msg_type, node = %node.name, "Subscribe");
            g.add_subscriber(node, &TopicKey::new(topic_name, msg_type));

            let publishers = g.publishers_by_topic(topic_name);
            let update = TopicTargetsUpdate::new(topic_name).add(node.clone());
            let pushes: Pushes = publishers
                .iter()
                .map(|p| (p.clone(), update.clone()))
                .collect();
            debug!(count = pushes.len(), "notifying publishers of new subscriber");

            (
                RpcReply::ok("Subscribe success", RpcBody::Publishers(publishers)),
                pushes,
            )
        }
        RpcRequest::Unsubscribe {
            topic_name,
            msg_type,
            node,
        } => {
            info!(topic = %topic_name, node = %node.name, "Unsubscribe");
            g.remove_subscriber(node, &TopicKey::new(topic_name, msg_type));

            let update = TopicTargetsUpdate::new(topic_name).remove(node.clone());
            let pushes: Pushes = g
                .publishers_by_topic(topic_name)
                .into_iter()
                .map(|p| (p, update.clone()))
                .collect();

            (RpcReply::ok("Unsubscribe success", RpcBody::Empty), pushes)
        }
        RpcRequest::RegisterPublisher {
            topic_name,
            msg_type,
            node,
        } => {
            info!(topic = %topic_name, msg_type = %msg_type, node = %node.name, "RegisterPublisher");
            g.add_publisher(node, &TopicKey::new(topic_name, msg_type));

            // The new publisher alone receives the full current subscriber set.
            let mut update = TopicTargetsUpdate::new(topic_name);
            update.add_targets = g.subscribers_by_topic(topic_name);
            let pushes = vec![(node.clone(), update)];

            (
                RpcReply::ok("Register publisher success", RpcBody::Empty),
                pushes,
            )
        }
        RpcRequest::UnregisterPublisher {
            topic_name,
            msg_type,
            node,
        } => {
            info!(topic = %topic_name, node = %node.name, "UnregisterPublisher");
            g.remove_publisher(node, &TopicKey::new(topic_name, msg_type));
            // Subscribers are passive; stale connections drain when the
            // publisher closes them. No push.
            (
                RpcReply::ok("Unregister publisher success", RpcBody::Empty),
                Vec::new(),
            )
        }
        RpcRequest::GetNodes { filter } => {
            let nodes: Vec<NodeIdentity> = g
                .all_nodes()
                .into_iter()
                .filter(|n| filter.is_empty() || n.name.contains(filter.as_str()))
                .collect();
            debug!(count = nodes.len(), "GetNodes");
            (
                RpcReply::ok("Get nodes list success", RpcBody::Nodes(nodes)),
                Vec::new(),
            )
        }
        RpcRequest::GetNodeInfo { node_name } => {
            let Some(node) = g.node_by_name(node_name) else {
                warn!(node = %node_name, "GetNodeInfo: node not found");
                return (
                    RpcReply::error(format!("Node not found: {node_name}")),
                    Vec::new(),
                );
            };
            let publishes: Vec<TopicInfo> = g
                .node_publish_keys(node_name)
                .into_iter()
                .map(TopicInfo::from)
                .collect();
            let subscribes: Vec<TopicInfo> = g
                .node_subscribe_keys(node_name)
                .into_iter()
                .map(TopicInfo::from)
                .collect();
            (
                RpcReply::ok(
                    "Get node info success",
                    RpcBody::NodeInfo {
                        node,
                        publishes,
                        subscribes,
                    },
                ),
                Vec::new(),
            )
        }
        RpcRequest::GetTopics { filter } => {
            let mut topics: Vec<TopicInfo> = g
                .all_topics()
                .into_iter()
                .filter(|(name, _)| filter.is_empty() || name.contains(filter.as_str()))
                .map(|(topic_name, msg_type)| TopicInfo {
                    topic_name,
                    msg_type,
                })
                .collect();
            topics.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
            (
                RpcReply::ok("Get topics success", RpcBody::Topics(topics)),
                Vec::new(),
            )
        }
        RpcRequest::GetTopicInfo { topic_name } => {
            let Some(msg_type) = g.all_topics().remove(topic_name) else {
                return (RpcReply::error("Topic not found"), Vec::new());
            };
            (
                RpcReply::ok(
                    "Get topic info success",
                    RpcBody::TopicInfo {
                        topic_name: topic_name.clone(),
                        msg_type,
                        publishers: g.publishers_by_topic(topic_name),
                        subscribers: g.subscribers_by_topic(topic_name),
                    },
                ),
                Vec::new(),
            )
        }
    }
}

/// Deliver one update to one node: connect, write a single control
/// frame, half-close. No retry.
async fn push_update(target: &NodeIdentity, update: &TopicTargetsUpdate) -> Result<()> {
    let addr = target.socket_addr()?;
    let payload = serde_json::to_vec(update).context("serializing targets update")?;
    let topic = if update.topic.is_empty() {
        CONTROL_TOPIC
    } else {
        update.topic.as_str()
    };
    let frame = Frame::new(topic, TARGETS_UPDATE_TYPE, payload);

    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to node listener {addr}"))?;
    stream
        .write_all(&frame.encode())
        .await
        .context("writing targets update frame")?;
    stream.shutdown().await.context("half-closing push stream")?;
    debug!(node = %target.name, topic = %update.topic,
        adds = update.add_targets.len(), removes = update.remove_targets.len(),
        "targets update pushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, port: u16) -> NodeIdentity {
        NodeIdentity::new(name, "127.0.0.1", port)
    }

    fn graph() -> Mutex<MessageGraph> {
        Mutex::new(MessageGraph::new())
    }

    #[test]
    fn subscribe_pushes_delta_to_every_publisher() {
        let g = graph();
        let (_, pushes) = handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0].1.add_targets.is_empty());

        let (reply, pushes) = handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("sub1", 60002),
            },
        );
        assert!(reply.success);
        assert_eq!(reply.body, RpcBody::Publishers(vec![node("pub1", 60001)]));
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.name, "pub1");
        assert_eq!(pushes[0].1.add_targets, vec![node("sub1", 60002)]);
        assert!(pushes[0].1.remove_targets.is_empty());
    }

    #[test]
    fn register_publisher_receives_current_subscribers() {
        let g = graph();
        handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("sub1", 60002),
            },
        );
        let (_, pushes) = handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.name, "pub1");
        assert_eq!(pushes[0].1.add_targets, vec![node("sub1", 60002)]);
    }

    #[test]
    fn unsubscribe_pushes_removal() {
        let g = graph();
        handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("sub1", 60002),
            },
        );
        let (_, pushes) = handle_request(
            &g,
            &RpcRequest::Unsubscribe {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("sub1", 60002),
            },
        );
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1.remove_targets, vec![node("sub1", 60002)]);
    }

    #[test]
    fn unregister_publisher_pushes_nothing() {
        let g = graph();
        handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("sub1", 60002),
            },
        );
        let (reply, pushes) = handle_request(
            &g,
            &RpcRequest::UnregisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        assert!(reply.success);
        assert!(pushes.is_empty());
    }

    #[test]
    fn type_mismatched_subscriber_is_still_pushed() {
        let g = graph();
        handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/t".into(),
                msg_type: "demo.X".into(),
                node: node("pub1", 60001),
            },
        );
        // Same topic name, different type: matched for fan-out anyway.
        let (_, pushes) = handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/t".into(),
                msg_type: "demo.Y".into(),
                node: node("sub1", 60002),
            },
        );
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.name, "pub1");
    }

    #[test]
    fn queries_filter_and_report() {
        let g = graph();
        handle_request(
            &g,
            &RpcRequest::RegisterPublisher {
                topic_name: "/odom".into(),
                msg_type: "demo.Odometry".into(),
                node: node("robot_driver", 60001),
            },
        );
        handle_request(
            &g,
            &RpcRequest::Subscribe {
                topic_name: "/odom".into(),
                msg_type: "demo.Odometry".into(),
                node: node("viz", 60002),
            },
        );

        let (reply, _) = handle_request(&g, &RpcRequest::GetNodes { filter: "driver".into() });
        assert_eq!(reply.body, RpcBody::Nodes(vec![node("robot_driver", 60001)]));

        let (reply, _) = handle_request(&g, &RpcRequest::GetTopics { filter: String::new() });
        match reply.body {
            RpcBody::Topics(topics) => {
                assert_eq!(topics.len(), 1);
                assert_eq!(topics[0].topic_name, "/odom");
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let (reply, _) = handle_request(
            &g,
            &RpcRequest::GetTopicInfo {
                topic_name: "/odom".into(),
            },
        );
        match reply.body {
            RpcBody::TopicInfo {
                msg_type,
                publishers,
                subscribers,
                ..
            } => {
                assert_eq!(msg_type, "demo.Odometry");
                assert_eq!(publishers.len(), 1);
                assert_eq!(subscribers.len(), 1);
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let (reply, _) = handle_request(
            &g,
            &RpcRequest::GetNodeInfo {
                node_name: "missing".into(),
            },
        );
        assert!(!reply.success);
    }
}
