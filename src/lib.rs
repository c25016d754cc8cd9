//! # rosbus — Lightweight Publish/Subscribe Middleware
//!
//! A ROS-1-style messaging bus: nodes register publications and
//! subscriptions with a central coordinator (the master); messages then
//! flow peer-to-peer over TCP between publishers and their matched
//! subscribers, bypassing the coordinator on the data path.
//!
//! ## Architecture
//!
//! - The **coordinator** owns a bipartite registry graph of nodes,
//!   `(topic, msg_type)` keys, and edges. Every graph mutation pushes a
//!   `TopicTargetsUpdate` delta to the affected publishers' nodes.
//! - Each **node** runs one TCP listener for both control and data
//!   frames, an in-process bounded queue with drop-oldest semantics,
//!   and a single dispatch consumer that invokes subscriber callbacks.
//! - **Publishers** keep a lazy pool of TCP clients to their current
//!   targets and fan each message out best-effort.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level facade: init, advertise, subscribe, timers, spin |
//! | `master` | Coordinator: RPC service, registry graph ownership, push channel |
//! | `graph` | The bipartite registry graph with routing indexes |
//! | `rpc` | Client for the coordinator RPC service |
//! | `transport` | Node-side TCP listener and targets table |
//! | `publisher` | Typed publisher and per-peer client pool |
//! | `subscriber` | RAII subscription handle |
//! | `queue` | Per-topic bounded FIFO and callback dispatch |
//! | `factory` | Message trait, codec registry, dynamic fallback |
//! | `wire` | Length-prefixed frame codec shared by every TCP link |
//! | `messages` | Control and RPC message types |
//! | `identity` | Node identities, peer addresses, topic keys |
//! | `timer` | One-shot and periodic timers |

mod factory;
mod graph;
mod identity;
mod master;
mod messages;
mod node;
mod publisher;
mod queue;
mod rpc;
mod subscriber;
mod timer;
mod transport;
mod wire;

pub use factory::{encode_message, DecodeError, DynamicMessage, Message, MessageCodec, MsgFactory};
pub use graph::{Edge, MessageGraph};
pub use identity::{NodeIdentity, PeerAddr, TopicInfo, TopicKey};
pub use master::{Master, DEFAULT_BIND_ADDR};
pub use messages::{RpcBody, RpcReply, RpcRequest, TopicTargetsUpdate};
pub use node::{Node, NodeConfig};
pub use publisher::Publisher;
pub use queue::{MessageQueue, ReceivedMessage, SubscriberId, DEFAULT_QUEUE_CAPACITY};
pub use rpc::{MasterClient, DEFAULT_MASTER_ADDR};
pub use subscriber::Subscriber;
pub use timer::{Timer, TimerEvent};
pub use transport::TargetsTable;
pub use wire::{Frame, FrameDecoder, WireError, TARGETS_UPDATE_TYPE};
