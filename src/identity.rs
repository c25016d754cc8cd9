//! # Registry Identity Types
//!
//! Core value types shared by the coordinator and the node side:
//!
//! - [`NodeIdentity`]: `(name, ip, port)` — who a node is and where it
//!   listens for target updates and data frames
//! - [`PeerAddr`]: the `(ip, port)` projection used to key targets tables
//!   and publisher connection pools
//! - [`TopicKey`]: `(topic, msg_type)` — two publications with the same
//!   topic name but different message types are distinct topics
//! - [`TopicInfo`]: the `(topic, msg_type)` pair as returned by the
//!   coordinator's query RPCs

use std::fmt;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A node's registry identity. The name is process-unique; `(ip, port)`
/// is where the node's listener accepts target updates and data frames.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// The `(ip, port)` projection used as targets-table key.
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr {
            ip: self.ip.clone(),
            port: self.port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .with_context(|| format!("invalid node address {}:{}", self.ip, self.port))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.ip, self.port)
    }
}

/// A peer listener address. Targets tables and publisher pools key on
/// this, not on the full identity: two records that agree on `(ip, port)`
/// are the same target regardless of node name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .with_context(|| format!("invalid peer address {}:{}", self.ip, self.port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A topic paired with its fully-qualified message type name.
/// Hashed on both fields; the coordinator treats `("/odom", "A")` and
/// `("/odom", "B")` as distinct keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    pub topic: String,
    pub msg_type: String,
}

impl TopicKey {
    pub fn new(topic: impl Into<String>, msg_type: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.topic, self.msg_type)
    }
}

/// Topic descriptor returned by the coordinator's query RPCs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic_name: String,
    pub msg_type: String,
}

impl From<TopicKey> for TopicInfo {
    fn from(k: TopicKey) -> Self {
        Self {
            topic_name: k.topic,
            msg_type: k.msg_type,
        }
    }
}
