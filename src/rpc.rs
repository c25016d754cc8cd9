//! # Coordinator RPC Client
//!
//! Synchronous request/response against the coordinator: each call
//! opens a TCP connection, writes `u32 BE length | bincode(RpcRequest)`,
//! and reads the bounded reply. One method per endpoint, mirroring the
//! service surface in [`crate::master`].
//!
//! Registration calls surface coordinator-side failures (`success ==
//! false`) as errors so a node startup that never registered is visible
//! to the caller; shutdown-path callers log and continue instead.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::identity::{NodeIdentity, TopicInfo};
use crate::messages::{
    deserialize_bounded, serialize_rpc, RpcBody, RpcReply, RpcRequest, MAX_RPC_MESSAGE_SIZE,
};

/// Default coordinator RPC endpoint.
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:50051";

/// Client handle for the coordinator RPC service. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MasterClient {
    addr: String,
}

impl MasterClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: &RpcRequest) -> Result<RpcReply> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to coordinator at {}", self.addr))?;

        let bytes = serialize_rpc(request).context("serializing RPC request")?;
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .context("writing request length")?;
        stream
            .write_all(&bytes)
            .await
            .context("writing request body")?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .context("reading reply length")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len as u64 > MAX_RPC_MESSAGE_SIZE {
            bail!("coordinator reply of {len} bytes exceeds cap");
        }
        let mut reply_bytes = vec![0u8; len];
        stream
            .read_exact(&mut reply_bytes)
            .await
            .context("reading reply body")?;

        deserialize_bounded(&reply_bytes).context("decoding coordinator reply")
    }

    /// Issue a request and require coordinator-side success.
    async fn call_ok(&self, request: &RpcRequest) -> Result<RpcReply> {
        let method = request.method();
        let reply = self.call(request).await?;
        if !reply.success {
            bail!("{method} rejected by coordinator: {}", reply.message);
        }
        Ok(reply)
    }

    /// Register a subscription; returns the current publishers on the topic.
    pub async fn subscribe(
        &self,
        topic_name: &str,
        msg_type: &str,
        node: &NodeIdentity,
    ) -> Result<Vec<NodeIdentity>> {
        let reply = self
            .call_ok(&RpcRequest::Subscribe {
                topic_name: topic_name.to_owned(),
                msg_type: msg_type.to_owned(),
                node: node.clone(),
            })
            .await?;
        match reply.body {
            RpcBody::Publishers(publishers) => Ok(publishers),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn unsubscribe(
        &self,
        topic_name: &str,
        msg_type: &str,
        node: &NodeIdentity,
    ) -> Result<()> {
        self.call_ok(&RpcRequest::Unsubscribe {
            topic_name: topic_name.to_owned(),
            msg_type: msg_type.to_owned(),
            node: node.clone(),
        })
        .await?;
        Ok(())
    }

    pub async fn register_publisher(
        &self,
        topic_name: &str,
        msg_type: &str,
        node: &NodeIdentity,
    ) -> Result<()> {
        self.call_ok(&RpcRequest::RegisterPublisher {
            topic_name: topic_name.to_owned(),
            msg_type: msg_type.to_owned(),
            node: node.clone(),
        })
        .await?;
        Ok(())
    }

    pub async fn unregister_publisher(
        &self,
        topic_name: &str,
        msg_type: &str,
        node: &NodeIdentity,
    ) -> Result<()> {
        self.call_ok(&RpcRequest::UnregisterPublisher {
            topic_name: topic_name.to_owned(),
            msg_type: msg_type.to_owned(),
            node: node.clone(),
        })
        .await?;
        Ok(())
    }

    /// Nodes whose name contains `filter`; empty filter lists all.
    pub async fn get_nodes(&self, filter: &str) -> Result<Vec<NodeIdentity>> {
        let reply = self
            .call_ok(&RpcRequest::GetNodes {
                filter: filter.to_owned(),
            })
            .await?;
        match reply.body {
            RpcBody::Nodes(nodes) => Ok(nodes),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_node_info(
        &self,
        node_name: &str,
    ) -> Result<(NodeIdentity, Vec<TopicInfo>, Vec<TopicInfo>)> {
        let reply = self
            .call_ok(&RpcRequest::GetNodeInfo {
                node_name: node_name.to_owned(),
            })
            .await?;
        match reply.body {
            RpcBody::NodeInfo {
                node,
                publishes,
                subscribes,
            } => Ok((node, publishes, subscribes)),
            _ => bail!("GetNodeInfo returned an unexpected body"),
        }
    }

    /// Topics whose name contains `filter`; empty filter lists all.
    pub async fn get_topics(&self, filter: &str) -> Result<Vec<TopicInfo>> {
        let reply = self
            .call_ok(&RpcRequest::GetTopics {
                filter: filter.to_owned(),
            })
            .await?;
        match reply.body {
            RpcBody::Topics(topics) => Ok(topics),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_topic_info(
        &self,
        topic_name: &str,
    ) -> Result<(String, Vec<NodeIdentity>, Vec<NodeIdentity>)> {
        let reply = self
            .call_ok(&RpcRequest::GetTopicInfo {
                topic_name: topic_name.to_owned(),
            })
            .await?;
        match reply.body {
            RpcBody::TopicInfo {
                msg_type,
                publishers,
                subscribers,
                ..
            } => Ok((msg_type, publishers, subscribers)),
            _ => bail!("GetTopicInfo returned an unexpected body"),
        }
    }
}
