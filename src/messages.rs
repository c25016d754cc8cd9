//! # Wire Protocol Messages
//!
//! Serializable message types for the two out-of-band channels:
//!
//! | Channel | Types | Encoding |
//! |---------|-------|----------|
//! | Coordinator push → node listener | [`TopicTargetsUpdate`] | JSON (the same structured format data payloads use) |
//! | Coordinator RPC | [`RpcRequest`] / [`RpcReply`] | length-prefixed bincode |
//!
//! RPC deserialization always goes through [`deserialize_bounded`] so a
//! hostile or corrupt length prefix cannot drive an unbounded allocation.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{NodeIdentity, TopicInfo};

/// Maximum serialized size of a single RPC message.
pub const MAX_RPC_MESSAGE_SIZE: u64 = 1024 * 1024;

/// Returns bincode options with the size limit enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_RPC_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Serialize an RPC message.
pub fn serialize_rpc<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Targets delta pushed by the coordinator to a publisher's node.
///
/// Receivers merge `add_targets` and remove `remove_targets`, keyed by
/// `(ip, port)`. Every push carries the full delta the publisher needs,
/// and applying the same delta twice is a no-op.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicTargetsUpdate {
    pub topic: String,
    #[serde(default)]
    pub add_targets: Vec<NodeIdentity>,
    #[serde(default)]
    pub remove_targets: Vec<NodeIdentity>,
}

impl TopicTargetsUpdate {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn add(mut self, target: NodeIdentity) -> Self {
        self.add_targets.push(target);
        self
    }

    pub fn remove(mut self, target: NodeIdentity) -> Self {
        self.remove_targets.push(target);
        self
    }
}

/// Requests accepted by the coordinator RPC service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Subscribe {
        topic_name: String,
        msg_type: String,
        node: NodeIdentity,
    },
    Unsubscribe {
        topic_name: String,
        msg_type: String,
        node: NodeIdentity,
    },
    RegisterPublisher {
        topic_name: String,
        msg_type: String,
        node: NodeIdentity,
    },
    UnregisterPublisher {
        topic_name: String,
        msg_type: String,
        node: NodeIdentity,
    },
    /// Substring filter over node names; empty matches all.
    GetNodes { filter: String },
    GetNodeInfo { node_name: String },
    /// Substring filter over topic names; empty matches all.
    GetTopics { filter: String },
    GetTopicInfo { topic_name: String },
}

impl RpcRequest {
    /// Short method name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Subscribe { .. } => "Subscribe",
            RpcRequest::Unsubscribe { .. } => "Unsubscribe",
            RpcRequest::RegisterPublisher { .. } => "RegisterPublisher",
            RpcRequest::UnregisterPublisher { .. } => "UnregisterPublisher",
            RpcRequest::GetNodes { .. } => "GetNodes",
            RpcRequest::GetNodeInfo { .. } => "GetNodeInfo",
            RpcRequest::GetTopics { .. } => "GetTopics",
            RpcRequest::GetTopicInfo { .. } => "GetTopicInfo",
        }
    }
}

/// Per-endpoint response payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcBody {
    Empty,
    /// Current publishers on the topic, returned from `Subscribe`.
    Publishers(Vec<NodeIdentity>),
    Nodes(Vec<NodeIdentity>),
    NodeInfo {
        node: NodeIdentity,
        publishes: Vec<TopicInfo>,
        subscribes: Vec<TopicInfo>,
    },
    Topics(Vec<TopicInfo>),
    TopicInfo {
        topic_name: String,
        msg_type: String,
        publishers: Vec<NodeIdentity>,
        subscribers: Vec<NodeIdentity>,
    },
}

/// Envelope for every RPC response: `{ success, message, body }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub success: bool,
    pub message: String,
    pub body: RpcBody,
}

impl RpcReply {
    pub fn ok(message: impl Into<String>, body: RpcBody) -> Self {
        Self {
            success: true,
            message: message.into(),
            body,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            body: RpcBody::Empty,
        }
    }
}
