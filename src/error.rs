//! Error taxonomy.
//!
//! Two enums, mirroring a `StreamError` / `ProducerError` split:
//! `BufferError` is the narrow set a single buffer submission can fail
//! with; `StreamerError` is what ultimately reaches an operation future.
//! The remap loop in [`crate::streamer`] decides, per `BufferError`,
//! whether to retry locally or convert and propagate.

use bytes::Bytes;
use thiserror::Error;

use crate::transport::TransportError;

/// Failure of a single buffer submission (one batch, one destination node).
#[derive(Debug, Clone, Error)]
pub enum BufferError {
    /// The destination has departed, or the server asked for a remap.
    #[error("topology is stale for this destination")]
    TopologyStale,

    /// Low-level send failure while the destination was still known alive.
    #[error("transport error: {0}")]
    Transport(String),

    /// Keys, values, or the receiver could not be serialised.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// Decoded from the response's `error` bytes; opaque at this layer.
    #[error("server apply error")]
    ServerApply(Bytes),

    /// The streamer was cancelled while this batch was outstanding.
    #[error("cancelled")]
    Cancelled,
}

impl BufferError {
    /// Whether the remap loop should fold this into a retry rather than
    /// propagate it to the caller.
    pub fn is_remappable(&self) -> bool {
        matches!(self, BufferError::TopologyStale)
    }
}

impl From<TransportError> for BufferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(_) => BufferError::TopologyStale,
            TransportError::Send(msg) => BufferError::Transport(msg),
        }
    }
}

/// Failure surfaced to a caller-visible operation future.
#[derive(Debug, Clone, Error)]
pub enum StreamerError {
    #[error("streamer is closed")]
    Closed,

    #[error("client has been detached from the cluster")]
    Disconnected,

    #[error("no node maps this key at the current topology")]
    TopologyEmpty,

    #[error("remap budget exhausted after {attempts} attempts")]
    RemapExhausted { attempts: u32 },

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("server apply error")]
    ServerApply(Bytes),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("allow_overwrite toggle requires at least one server node hosting the cache")]
    NoHostingNode,

    #[error("add/remove requires at least one entry")]
    EmptyAppend,
}

impl StreamerError {
    /// Fold a terminal (non-remappable, or remap-exhausted) buffer failure
    /// into the error surfaced to the operation future.
    pub fn from_buffer_error(err: BufferError, attempts: u32) -> Self {
        match err {
            BufferError::TopologyStale => StreamerError::RemapExhausted { attempts },
            BufferError::Transport(msg) => StreamerError::Transport(msg),
            BufferError::Marshal(msg) => StreamerError::Marshal(msg),
            BufferError::ServerApply(bytes) => StreamerError::ServerApply(bytes),
            BufferError::Cancelled => StreamerError::Cancelled,
        }
    }
}

impl From<BufferError> for StreamerError {
    fn from(err: BufferError) -> Self {
        StreamerError::from_buffer_error(err, 0)
    }
}

/// Missing required configuration at `StreamerBuilder::build` time. Distinct
/// from `StreamerError` since it can only happen once, before any operation
/// future exists to surface it through.
#[derive(Debug, Error)]
pub enum StreamerBuildError {
    #[error("streamer requires a Transport")]
    MissingTransport,
    #[error("streamer requires a Receiver")]
    MissingReceiver,
    #[error("streamer requires an AffinityOracle")]
    MissingAffinity,
    #[error("a colocated local node requires a LocalApplier")]
    MissingLocalApplier,
}
