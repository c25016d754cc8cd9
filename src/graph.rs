//! # Message Graph
//!
//! The coordinator's in-memory registry: a directed bipartite graph of
//! nodes, `(topic, msg_type)` keys, and derived edges. The two
//! per-topic indexes are the source of truth for routing; the edge set
//! is a derived view kept for diagnostics.
//!
//! All mutation happens under one mutex held by the RPC service; the
//! graph itself is a plain single-threaded structure.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::identity::{NodeIdentity, TopicKey};

/// A publisher→subscriber pairing on one topic key. Exists iff both
/// sides are registered on the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    pub src_node: String,
    pub dst_node: String,
    pub key: TopicKey,
}

#[derive(Clone, Debug)]
struct Vertex {
    info: NodeIdentity,
    publishes: HashSet<TopicKey>,
    subscribes: HashSet<TopicKey>,
}

/// The registry graph. Nodes are created on first mention and removed
/// once they have no publications, no subscriptions, and no incident
/// edges.
#[derive(Default)]
pub struct MessageGraph {
    nodes: HashMap<String, Vertex>,
    publishers_by_topic: HashMap<TopicKey, HashSet<String>>,
    subscribers_by_topic: HashMap<TopicKey, HashSet<String>>,
    edges: HashSet<Edge>,
}

impl MessageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the node or refresh its address.
    pub fn upsert_node(&mut self, info: &NodeIdentity) {
        let v = self.nodes.entry(info.name.clone()).or_insert_with(|| Vertex {
            info: info.clone(),
            publishes: HashSet::new(),
            subscribes: HashSet::new(),
        });
        v.info = info.clone();
    }

    pub fn add_publisher(&mut self, node: &NodeIdentity, key: &TopicKey) {
        self.upsert_node(node);
        self.nodes
            .get_mut(&node.name)
            .expect("upserted above")
            .publishes
            .insert(key.clone());
        self.publishers_by_topic
            .entry(key.clone())
            .or_default()
            .insert(node.name.clone());
        self.connect_publisher_to_subscribers(&node.name, key);
    }

    pub fn add_subscriber(&mut self, node: &NodeIdentity, key: &TopicKey) {
        self.upsert_node(node);
        self.nodes
            .get_mut(&node.name)
            .expect("upserted above")
            .subscribes
            .insert(key.clone());
        self.subscribers_by_topic
            .entry(key.clone())
            .or_default()
            .insert(node.name.clone());
        self.connect_publishers_to_subscriber(&node.name, key);
    }

    pub fn remove_publisher(&mut self, node: &NodeIdentity, key: &TopicKey) {
        if let Some(v) = self.nodes.get_mut(&node.name) {
            v.publishes.remove(key);
        }
        if let Some(set) = self.publishers_by_topic.get_mut(key) {
            set.remove(&node.name);
            if set.is_empty() {
                self.publishers_by_topic.remove(key);
            }
        }
        self.remove_edges_by(&node.name, key, true);
        self.cleanup_isolated_node_if_any(&node.name);
    }

    pub fn remove_subscriber(&mut self, node: &NodeIdentity, key: &TopicKey) {
        if let Some(v) = self.nodes.get_mut(&node.name) {
            v.subscribes.remove(key);
        }
        if let Some(set) = self.subscribers_by_topic.get_mut(key) {
            set.remove(&node.name);
            if set.is_empty() {
                self.subscribers_by_topic.remove(key);
            }
        }
        self.remove_edges_by(&node.name, key, false);
        self.cleanup_isolated_node_if_any(&node.name);
    }

    fn connect_publisher_to_subscribers(&mut self, pub_node: &str, key: &TopicKey) {
        let Some(subs) = self.subscribers_by_topic.get(key) else {
            return;
        };
        for sub in subs {
            self.edges.insert(Edge {
                src_node: pub_node.to_owned(),
                dst_node: sub.clone(),
                key: key.clone(),
            });
        }
    }

    fn connect_publishers_to_subscriber(&mut self, sub_node: &str, key: &TopicKey) {
        let Some(pubs) = self.publishers_by_topic.get(key) else {
            return;
        };
        for publisher in pubs {
            self.edges.insert(Edge {
                src_node: publisher.clone(),
                dst_node: sub_node.to_owned(),
                key: key.clone(),
            });
        }
    }

    // Linear scan over the edge set; edges only churn on (un)registration.
    fn remove_edges_by(&mut self, node: &str, key: &TopicKey, node_is_publisher: bool) {
        self.edges.retain(|e| {
            if e.key != *key {
                return true;
            }
            if node_is_publisher {
                e.src_node != node
            } else {
                e.dst_node != node
            }
        });
    }

    fn cleanup_isolated_node_if_any(&mut self, node_name: &str) {
        let Some(v) = self.nodes.get(node_name) else {
            return;
        };
        if !v.publishes.is_empty() || !v.subscribes.is_empty() {
            return;
        }
        let has_edge = self
            .edges
            .iter()
            .any(|e| e.src_node == node_name || e.dst_node == node_name);
        if !has_edge {
            self.nodes.remove(node_name);
        }
    }

    /// Subscribers on `topic`, matched by topic name alone regardless of
    /// message type.
    pub fn subscribers_by_topic(&self, topic: &str) -> Vec<NodeIdentity> {
        self.collect_by_topic(&self.subscribers_by_topic, topic)
    }

    /// Publishers on `topic`, matched by topic name alone.
    pub fn publishers_by_topic(&self, topic: &str) -> Vec<NodeIdentity> {
        self.collect_by_topic(&self.publishers_by_topic, topic)
    }

    fn collect_by_topic(
        &self,
        index: &HashMap<TopicKey, HashSet<String>>,
        topic: &str,
    ) -> Vec<NodeIdentity> {
        let mut result = Vec::new();
        for (key, names) in index {
            if key.topic != topic {
                continue;
            }
            for name in names {
                if let Some(v) = self.nodes.get(name) {
                    result.push(v.info.clone());
                }
            }
        }
        result
    }

    pub fn node_by_name(&self, node_name: &str) -> Option<NodeIdentity> {
        self.nodes.get(node_name).map(|v| v.info.clone())
    }

    pub fn has_node(&self, node_name: &str) -> bool {
        self.nodes.contains_key(node_name)
    }

    pub fn all_nodes(&self) -> Vec<NodeIdentity> {
        self.nodes.values().map(|v| v.info.clone()).collect()
    }

    pub fn node_publish_keys(&self, node_name: &str) -> Vec<TopicKey> {
        self.nodes
            .get(node_name)
            .map(|v| v.publishes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_subscribe_keys(&self, node_name: &str) -> Vec<TopicKey> {
        self.nodes
            .get(node_name)
            .map(|v| v.subscribes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every topic key mentioned by any node, publisher or subscriber
    /// side. Later mentions of the same topic name overwrite the type,
    /// mirroring how the topic list is reported.
    pub fn all_topics(&self) -> HashMap<String, String> {
        let mut topics = HashMap::new();
        for v in self.nodes.values() {
            for key in v.publishes.iter().chain(v.subscribes.iter()) {
                topics.insert(key.topic.clone(), key.msg_type.clone());
            }
        }
        topics
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Human-readable dump for the diagnostic surface.
    pub fn to_readable_string(&self) -> String {
        let mut out = String::new();
        out.push_str("==== Message Graph ====\n");
        let _ = writeln!(out, "Nodes: {}, Edges: {}\n", self.nodes.len(), self.edges.len());
        out.push_str("[Nodes]\n");
        for (name, v) in &self.nodes {
            let _ = writeln!(out, " - {} (ip={}, port={})", name, v.info.ip, v.info.port);
            if !v.publishes.is_empty() {
                out.push_str("    publishes:\n");
                for k in &v.publishes {
                    let _ = writeln!(out, "      - {}", k);
                }
            }
            if !v.subscribes.is_empty() {
                out.push_str("    subscribes:\n");
                for k in &v.subscribes {
                    let _ = writeln!(out, "      - {}", k);
                }
            }
        }
        out.push_str("\n[Edges]\n");
        for e in &self.edges {
            let _ = writeln!(out, " - {} -> {}  [{}]", e.src_node, e.dst_node, e.key);
        }
        out
    }

    /// Graphviz projection.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph MessageGraph {\n");
        out.push_str("  rankdir=LR;\n  node [shape=box, style=rounded];\n");
        for name in self.nodes.keys() {
            let _ = writeln!(out, "  \"{}\";", name);
        }
        for e in &self.edges {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\\n{}\"];",
                e.src_node, e.dst_node, e.key.topic, e.key.msg_type
            );
        }
        out.push_str("}\n");
        out
    }

    /// JSON projection for external tooling.
    pub fn to_json(&self) -> serde_json::Value {
        let nodes: Vec<serde_json::Value> = self
            .nodes
            .iter()
            .map(|(name, v)| {
                serde_json::json!({
                    "name": name,
                    "ip": v.info.ip,
                    "port": v.info.port,
                    "publishes": v.publishes.iter()
                        .map(|k| serde_json::json!({"topic": k.topic, "msg": k.msg_type}))
                        .collect::<Vec<_>>(),
                    "subscribes": v.subscribes.iter()
                        .map(|k| serde_json::json!({"topic": k.topic, "msg": k.msg_type}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let edges: Vec<serde_json::Value> = self
            .edges
            .iter()
            .map(|e| {
                serde_json::json!({
                    "src": e.src_node,
                    "dst": e.dst_node,
                    "topic": e.key.topic,
                    "msg": e.key.msg_type,
                })
            })
            .collect();
        serde_json::json!({ "nodes": nodes, "edges": edges })
    }
}
