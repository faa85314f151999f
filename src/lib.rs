//! Client-side bulk ingestion engine for a partitioned key-value cluster.
//!
//! Accepts a continuous stream of key/value upserts and deletions, maps
//! each key to its owning nodes via an injected [`AffinityOracle`], batches
//! entries per destination node behind a [`Streamer`], and remaps around
//! topology changes mid-flight. The cluster membership service, the
//! affinity function, the RPC transport, and the server-side apply logic
//! are all external collaborators injected at construction time — this
//! crate owns only the streamer state machine.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use partition_streamer::{Entry, Streamer};
//! # use partition_streamer::{AffinityOracle, LocalApplier, Receiver, ReceiverMode, Transport, TransportError, StreamRequest, NodeId, TopologyVersion};
//! # use std::pin::Pin;
//! # use std::sync::Arc;
//! # struct DummyAffinity;
//! # impl AffinityOracle for DummyAffinity {
//! #     fn map_primary_and_backups(&self, _cache: &str, _key: &[u8], _v: TopologyVersion) -> Vec<NodeId> { vec!["n1".into()] }
//! #     fn ready_version(&self) -> TopologyVersion { TopologyVersion::ZERO }
//! #     fn wait_ready<'a>(&'a self, _v: TopologyVersion) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> { Box::pin(async {}) }
//! # }
//! # struct DummyTransport;
//! # impl Transport for DummyTransport {
//! #     fn send<'a>(&'a self, _n: &'a NodeId, _r: StreamRequest) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>> { Box::pin(async { Ok(()) }) }
//! #     fn is_alive(&self, _n: &NodeId) -> bool { true }
//! # }
//! # struct DummyReceiver;
//! # impl Receiver for DummyReceiver {
//! #     fn marshal(&self, _m: ReceiverMode) -> Result<bytes::Bytes, String> { Ok(bytes::Bytes::new()) }
//! # }
//! # struct DummyLocalApplier;
//! # impl LocalApplier for DummyLocalApplier {
//! #     fn apply<'a>(&'a self, _cache_name: &'a str, _entries: Vec<Entry>, _skip_store: bool, _allow_overwrite: bool) -> Pin<Box<dyn std::future::Future<Output = Result<(), partition_streamer::BufferError>> + Send + 'a>> { Box::pin(async { Ok(()) }) }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let streamer = Streamer::builder("my-cache", "n1")
//!         .transport(Arc::new(DummyTransport))
//!         .receiver(Arc::new(DummyReceiver))
//!         .affinity(Arc::new(DummyAffinity))
//!         .local_applier(Arc::new(DummyLocalApplier))
//!         .build()
//!         .expect("required collaborators were provided");
//!
//!     let op = streamer.add(vec![Entry::upsert("key", "value")]).await;
//!     op.await.expect("batch acknowledged");
//!     streamer.close(false).await.expect("graceful drain");
//! }
//! ```

mod autoflush;
mod buffer;
mod entry;
mod error;
mod operation;
mod receiver;
mod streamer;
mod topology;
mod transport;

pub use autoflush::{AutoFlushHandle, AutoFlushScheduler};
pub use entry::Entry;
pub use error::{BufferError, StreamerBuildError, StreamerError};
pub use operation::OperationFuture;
pub use receiver::{Receiver, ReceiverMode};
pub use streamer::{Streamer, StreamerBuilder};
pub use topology::{AffinityOracle, NodeId, TopologyEvent, TopologyEventStream, TopologyEvents, TopologyVersion};
pub use transport::{DeploymentMeta, LocalApplier, StreamRequest, StreamResponse, Transport, TransportError};
