//! Wire messages and the RPC transport collaborator.
//!
//! Marshalling, the physical send, and the server-side apply are all
//! external to this crate; `Transport` is the seam the streamer dispatches
//! through and `StreamRequest`/`StreamResponse` are the messages it carries.

use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::topology::{NodeId, TopologyVersion};

/// Classloader/peer-deploy negotiation metadata, carried opaquely when the
/// receiver ships user code. Implementations without code shipping leave
/// this `None` and must reject responses that reference an unknown class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub mode: String,
    pub class_name: String,
    pub user_version: String,
    pub participants: Vec<NodeId>,
    pub classloader_id: String,
}

/// One batch of entries addressed to a single destination node.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub request_id: u64,
    pub response_topic: Bytes,
    pub cache_name: String,
    pub receiver: Bytes,
    pub entries: Vec<Entry>,
    pub ignore_deployment_topology: bool,
    pub skip_store: bool,
    pub deployment: Option<DeploymentMeta>,
    pub topology_version: TopologyVersion,
}

/// The matching acknowledgment. `error.is_none()` means success; the bytes
/// are opaque at this layer and are unmarshalled by the caller with the
/// originating deployment's classloader context, if any.
#[derive(Clone, Debug)]
pub struct StreamResponse {
    pub request_id: u64,
    pub error: Option<Bytes>,
}

/// Low-level send failure, distinct from a decoded server-apply error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("destination node {0} is unreachable")]
    Unreachable(NodeId),
    #[error("transport send failed: {0}")]
    Send(String),
}

/// The RPC transport. Send is asynchronous; failure is observed either via
/// the returned `Result` or, for sends that were merely slow to ack, via a
/// later `StreamResponse` delivered to the registered listener.
pub trait Transport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        node: &'a NodeId,
        request: StreamRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Whether `node` is still known alive by the transport's own view of
    /// the cluster. Used to classify a send failure as `Transport` (still
    /// alive) vs. `TopologyStale` (destination already known departed).
    fn is_alive(&self, node: &NodeId) -> bool;
}

/// In-process apply path for the node the client itself is colocated with.
/// Bypasses marshalling and the transport entirely; external to this crate
/// the same way `Transport` is.
pub trait LocalApplier: Send + Sync + 'static {
    fn apply<'a>(
        &'a self,
        cache_name: &'a str,
        entries: Vec<Entry>,
        skip_store: bool,
        allow_overwrite: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), crate::error::BufferError>> + Send + 'a>>;
}
