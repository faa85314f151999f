//! The user-facing controller: routes entries to per-node buffers, drives
//! the remap loop, and owns the busy-lock/quiescence model around
//! `flush`/`close`.
//!
//! Follows a `ProducerBuilder`/`Producer` split (direct setters returning
//! `Self`, a `build()` that spawns background tasks) and `Producer::flush`'s
//! "loop until nothing outstanding" shape, adapted from one destination to
//! an arbitrary node map.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::autoflush::{AutoFlushHandle, AutoFlushScheduler, TryFlush};
use crate::buffer::Buffer;
use crate::entry::Entry;
use crate::error::{BufferError, StreamerBuildError, StreamerError};
use crate::operation::{Operation, OperationFuture};
use crate::receiver::Receiver;
use crate::topology::{AffinityOracle, NodeId, TopologyEvent, TopologyEventStream, TopologyEvents};
use crate::transport::{LocalApplier, StreamResponse, Transport};

/// Fluent configuration for a [`Streamer`]. Mirrors `ProducerBuilder`'s
/// direct-setter style; required collaborators (`transport`, `receiver`,
/// `affinity`) have no sensible default and must be supplied before
/// `build()`.
#[must_use = "builders do nothing unless you call .build()"]
pub struct StreamerBuilder {
    cache_name: String,
    local_node_id: NodeId,
    buf_size: usize,
    parallel_ops: usize,
    skip_store: bool,
    allow_overwrite: bool,
    max_remap: u32,
    auto_flush_interval: Duration,
    auto_flush_scheduler: Option<AutoFlushScheduler>,
    response_topic: Bytes,
    transport: Option<Arc<dyn Transport>>,
    local_applier: Option<Arc<dyn LocalApplier>>,
    receiver: Option<Arc<dyn Receiver>>,
    affinity: Option<Arc<dyn AffinityOracle>>,
    topology_events: Option<Arc<dyn TopologyEvents>>,
}

impl StreamerBuilder {
    pub fn new(cache_name: impl Into<String>, local_node_id: impl Into<NodeId>) -> Self {
        Self {
            cache_name: cache_name.into(),
            local_node_id: local_node_id.into(),
            buf_size: 1000,
            parallel_ops: 4,
            skip_store: false,
            allow_overwrite: false,
            max_remap: 32,
            auto_flush_interval: Duration::ZERO,
            auto_flush_scheduler: None,
            response_topic: Bytes::new(),
            transport: None,
            local_applier: None,
            receiver: None,
            affinity: None,
            topology_events: None,
        }
    }

    pub fn buf_size(mut self, buf_size: usize) -> Self {
        assert!(buf_size > 0, "buf_size must be > 0");
        self.buf_size = buf_size;
        self
    }

    pub fn parallel_ops(mut self, parallel_ops: usize) -> Self {
        assert!(parallel_ops > 0, "parallel_ops must be > 0");
        self.parallel_ops = parallel_ops;
        self
    }

    pub fn skip_store(mut self, skip_store: bool) -> Self {
        self.skip_store = skip_store;
        self
    }

    /// The initial receiver mode. Can be changed later via
    /// [`Streamer::allow_overwrite`].
    pub fn allow_overwrite(mut self, allow_overwrite: bool) -> Self {
        self.allow_overwrite = allow_overwrite;
        self
    }

    pub fn max_remap(mut self, max_remap: u32) -> Self {
        self.max_remap = max_remap;
        self
    }

    pub fn auto_flush_interval(mut self, interval: Duration) -> Self {
        self.auto_flush_interval = interval;
        self
    }

    /// Share a scheduler across multiple streamers instead of each one
    /// spinning up its own timer wheel.
    pub fn auto_flush_scheduler(mut self, scheduler: AutoFlushScheduler) -> Self {
        self.auto_flush_scheduler = Some(scheduler);
        self
    }

    pub fn response_topic(mut self, topic: impl Into<Bytes>) -> Self {
        self.response_topic = topic.into();
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn local_applier(mut self, applier: Arc<dyn LocalApplier>) -> Self {
        self.local_applier = Some(applier);
        self
    }

    pub fn receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn affinity(mut self, affinity: Arc<dyn AffinityOracle>) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Subscribing is optional: without it, a departed node's buffer is
    /// only cleaned up the next time routing notices the node is dead (the
    /// post-check in the remap loop), not proactively.
    pub fn topology_events(mut self, events: Arc<dyn TopologyEvents>) -> Self {
        self.topology_events = Some(events);
        self
    }

    pub fn build(self) -> Result<Streamer, StreamerBuildError> {
        let transport = self.transport.ok_or(StreamerBuildError::MissingTransport)?;
        let receiver = self.receiver.ok_or(StreamerBuildError::MissingReceiver)?;
        let affinity = self.affinity.ok_or(StreamerBuildError::MissingAffinity)?;

        if self.local_applier.is_none() {
            return Err(StreamerBuildError::MissingLocalApplier);
        }

        let config = StreamerConfig {
            cache_name: self.cache_name,
            local_node_id: self.local_node_id,
            buf_size: self.buf_size,
            parallel_ops: self.parallel_ops,
            skip_store: self.skip_store,
            max_remap: self.max_remap,
            response_topic: self.response_topic,
            transport,
            local_applier: self.local_applier,
            receiver,
            affinity,
        };

        let inner = Arc::new(StreamerInner {
            config,
            buffers: DashMap::new(),
            state: Mutex::new(StreamerState {
                closed: false,
                disconnect_error: None,
            }),
            busy: RwLock::new(()),
            allow_overwrite: Arc::new(AtomicBool::new(self.allow_overwrite)),
            last_flush: Mutex::new(Instant::now()),
            auto_flush_handle: Mutex::new(None),
            auto_flush_scheduler: self.auto_flush_scheduler.unwrap_or_default(),
            in_flight_remaps: Arc::new(AtomicU64::new(0)),
        });

        let streamer = Streamer { inner };

        if !self.auto_flush_interval.is_zero() {
            streamer.auto_flush_interval(self.auto_flush_interval);
        }

        if let Some(events) = self.topology_events {
            let streamer_clone = streamer.clone();
            tokio::spawn(run_topology_listener(streamer_clone, events.subscribe()));
        }

        Ok(streamer)
    }
}

struct StreamerConfig {
    cache_name: String,
    local_node_id: NodeId,
    buf_size: usize,
    parallel_ops: usize,
    skip_store: bool,
    max_remap: u32,
    response_topic: Bytes,
    transport: Arc<dyn Transport>,
    local_applier: Option<Arc<dyn LocalApplier>>,
    receiver: Arc<dyn Receiver>,
    affinity: Arc<dyn AffinityOracle>,
}

struct StreamerState {
    closed: bool,
    disconnect_error: Option<StreamerError>,
}

struct StreamerInner {
    config: StreamerConfig,
    buffers: DashMap<NodeId, Buffer>,
    state: Mutex<StreamerState>,
    busy: RwLock<()>,
    allow_overwrite: Arc<AtomicBool>,
    last_flush: Mutex<Instant>,
    auto_flush_handle: Mutex<Option<AutoFlushHandle>>,
    auto_flush_scheduler: AutoFlushScheduler,
    /// Remap retries currently being routed via a spawned task. `drain`
    /// must not treat an empty sweep as quiescent while this is nonzero —
    /// the retry hasn't yet registered its own outstanding batches.
    in_flight_remaps: Arc<AtomicU64>,
}

impl TryFlush for StreamerInner {
    fn try_flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let version = self.config.affinity.ready_version();
            let buffers: Vec<Buffer> = self.buffers.iter().map(|e| e.value().clone()).collect();
            for buf in &buffers {
                let _ = buf.flush(version).await;
            }
            *self.last_flush.lock() = Instant::now();
        })
    }
}

/// The ingestion engine's user-facing handle. Cheap to clone; every clone
/// shares the same node map, buffers, and configuration.
#[derive(Clone)]
pub struct Streamer {
    inner: Arc<StreamerInner>,
}

impl Streamer {
    pub fn builder(cache_name: impl Into<String>, local_node_id: impl Into<NodeId>) -> StreamerBuilder {
        StreamerBuilder::new(cache_name, local_node_id)
    }

    /// Route `entries`, returning a future that resolves once every
    /// destination batch they were split across has acknowledged (or the
    /// operation has terminally failed).
    pub async fn add(&self, entries: Vec<Entry>) -> OperationFuture {
        let (operation, future) = Operation::new();

        if entries.is_empty() {
            operation.fail(StreamerError::EmptyAppend);
            return future;
        }

        match self.enter_busy().await {
            Ok(_guard) => self.route(operation, entries, 0).await,
            Err(err) => operation.fail(err),
        }

        future
    }

    pub async fn remove(&self, key: impl Into<Bytes>) -> OperationFuture {
        self.add(vec![Entry::delete(key)]).await
    }

    /// Blocks until every pending batch has been submitted and every
    /// in-flight request across every buffer has resolved.
    pub async fn flush(&self) -> Result<(), StreamerError> {
        let _guard = self.enter_busy().await?;
        self.drain().await
    }

    /// Best-effort sweep: swaps out and submits whatever is currently
    /// accumulating in every buffer, but never waits for acknowledgment.
    /// Never propagates an error — this is what the auto-flush scheduler
    /// calls.
    pub async fn try_flush(&self) {
        TryFlush::try_flush(self.inner.as_ref()).await;
    }

    /// Idempotent. `cancel = false` performs a final drain; `cancel = true`
    /// aborts every in-flight batch immediately.
    pub async fn close(&self, cancel: bool) -> Result<(), StreamerError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        let _exclusive = self.inner.busy.write().await;

        if cancel {
            for entry in self.inner.buffers.iter() {
                entry.value().cancel_all(Some(BufferError::Cancelled));
            }
            Ok(())
        } else {
            self.drain().await
        }
    }

    /// Switches the receiver between isolated (`false`) and individual
    /// (`true`) mode. Fails if no server node currently hosts the cache.
    pub async fn allow_overwrite(&self, enabled: bool) -> Result<(), StreamerError> {
        let _guard = self.enter_busy().await?;
        let version = self.inner.config.affinity.ready_version();
        let hosts = self
            .inner
            .config
            .affinity
            .map_primary_and_backups(&self.inner.config.cache_name, b"", version);
        if hosts.is_empty() {
            return Err(StreamerError::NoHostingNode);
        }
        self.inner.allow_overwrite.store(enabled, Ordering::Release);
        Ok(())
    }

    /// (De)registers with the auto-flush scheduler. `Duration::ZERO`
    /// deregisters.
    pub fn auto_flush_interval(&self, interval: Duration) {
        let weak: Weak<StreamerInner> = Arc::downgrade(&self.inner);
        let handle = self.inner.auto_flush_scheduler.register(weak, interval);
        *self.inner.auto_flush_handle.lock() = handle;
    }

    /// Delivers a transport-level acknowledgment to the buffer for
    /// `response`'s originating node. The caller is responsible for
    /// demultiplexing by node id from whatever topic framing the transport
    /// uses; this crate only needs the node id and the response itself.
    pub fn on_response(&self, node_id: &NodeId, response: StreamResponse) {
        if let Some(buf) = self.inner.buffers.get(node_id) {
            buf.on_response(response);
        }
    }

    async fn enter_busy(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>, StreamerError> {
        let guard = self.inner.busy.read().await;
        let state = self.inner.state.lock();
        if let Some(err) = &state.disconnect_error {
            return Err(err.clone());
        }
        if state.closed {
            return Err(StreamerError::Closed);
        }
        drop(state);
        Ok(guard)
    }

    /// Repeatedly swaps out and submits every buffer's accumulator and
    /// waits for the resulting compound futures, until nothing was
    /// outstanding in the last sweep. A concurrent `add` racing the drain
    /// simply gets picked up by the next iteration.
    async fn drain(&self) -> Result<(), StreamerError> {
        loop {
            let version = self.inner.config.affinity.ready_version();
            let buffers: Vec<Buffer> = self.inner.buffers.iter().map(|e| e.value().clone()).collect();

            let mut compound = Vec::new();
            for buf in &buffers {
                if let Some(fut) = buf.flush(version).await {
                    compound.push(fut);
                }
            }

            if compound.is_empty() {
                if self.inner.in_flight_remaps.load(Ordering::Acquire) == 0 {
                    break;
                }
                // A remap retry is being routed in a spawned task and
                // hasn't registered its own batches yet; give it a chance
                // to run before the next sweep.
                tokio::task::yield_now().await;
                continue;
            }

            let mut first_err = None;
            for fut in compound {
                if let Err(err) = fut.wait().await {
                    if err.is_remappable() {
                        // A concurrent remap is already re-routing this
                        // batch; let the loop re-sweep instead of
                        // surfacing a failure for a retry still in flight.
                        continue;
                    }
                    first_err.get_or_insert(err);
                }
            }
            if let Some(err) = first_err {
                return Err(StreamerError::from(err));
            }
        }

        *self.inner.last_flush.lock() = Instant::now();
        Ok(())
    }

    fn get_or_create_buffer(&self, node: &NodeId) -> Buffer {
        if let Some(buf) = self.inner.buffers.get(node) {
            return buf.clone();
        }

        let is_local = *node == self.inner.config.local_node_id;
        let new_buf = Buffer::new(
            node.clone(),
            self.inner.config.cache_name.clone(),
            self.inner.config.buf_size,
            self.inner.config.parallel_ops,
            is_local,
            self.inner.config.transport.clone(),
            self.inner.config.local_applier.clone(),
            self.inner.config.receiver.clone(),
            self.inner.config.response_topic.clone(),
            self.inner.config.skip_store,
            self.inner.allow_overwrite.clone(),
        );

        match self.inner.buffers.entry(node.clone()) {
            DashEntry::Occupied(occupied) => occupied.get().clone(),
            DashEntry::Vacant(vacant) => {
                vacant.insert(new_buf.clone());
                new_buf
            }
        }
    }

    /// The routing and remap loop described in the module-level docs:
    /// snapshot the topology, group by destination, submit each group to
    /// its buffer, and re-enter this function on a remappable failure.
    fn route<'a>(
        &'a self,
        operation: Operation,
        entries: Vec<Entry>,
        remap: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let version = self.inner.config.affinity.ready_version();
            let allow_overwrite = self.inner.allow_overwrite.load(Ordering::Acquire);

            let mut groups: HashMap<NodeId, Vec<Entry>> = HashMap::new();
            for entry in entries {
                let nodes = if allow_overwrite {
                    self.inner
                        .config
                        .affinity
                        .map_primary(&self.inner.config.cache_name, &entry.key, version)
                        .into_iter()
                        .collect::<Vec<_>>()
                } else {
                    self.inner
                        .config
                        .affinity
                        .map_primary_and_backups(&self.inner.config.cache_name, &entry.key, version)
                };

                if nodes.is_empty() {
                    operation.fail(StreamerError::TopologyEmpty);
                    operation.routing_complete();
                    return;
                }

                for node in nodes {
                    groups.entry(node).or_default().push(entry.clone());
                }
            }

            for (node, group) in groups {
                let retry_entries = group.clone();
                let buf = self.get_or_create_buffer(&node);

                let this = self.clone();
                let op = operation.clone();
                let node_for_post_check = node.clone();

                // One outstanding ack reserved for this group's own
                // submission, independent of however many other nodes the
                // same keys were also routed to under replication.
                operation.register(1);

                let listener: Box<dyn FnOnce(Result<(), BufferError>) + Send> =
                    Box::new(move |result| match result {
                        Ok(()) => op.ack(1),
                        Err(err) if err.is_remappable() => {
                            let (closed, disconnect_error) = {
                                let state = this.inner.state.lock();
                                (state.closed, state.disconnect_error.clone())
                            };
                            if let Some(reason) = disconnect_error {
                                op.fail(reason);
                                op.ack(1);
                            } else if closed {
                                op.fail(StreamerError::Closed);
                                op.ack(1);
                            } else if remap + 1 > this.inner.config.max_remap {
                                #[cfg(feature = "tracing")]
                                tracing::warn!(attempts = remap + 1, "remap budget exhausted");
                                op.fail(StreamerError::RemapExhausted { attempts: remap + 1 });
                                op.ack(1);
                            } else {
                                #[cfg(feature = "tracing")]
                                tracing::debug!(attempt = remap + 1, "retrying entries after remappable failure");
                                // Reserve the retry's placeholder before
                                // releasing this group's slot so the
                                // pending count never transiently hits
                                // zero across the handoff.
                                op.register(1);
                                op.ack(1);
                                this.inner.in_flight_remaps.fetch_add(1, Ordering::AcqRel);
                                let in_flight_remaps = this.inner.in_flight_remaps.clone();
                                tokio::spawn(async move {
                                    this.route(op, retry_entries, remap + 1).await;
                                    in_flight_remaps.fetch_sub(1, Ordering::AcqRel);
                                });
                            }
                        }
                        Err(err) => {
                            let disconnect_error = this.inner.state.lock().disconnect_error.clone();
                            op.fail(disconnect_error.unwrap_or_else(|| StreamerError::from(err)));
                            op.ack(1);
                        }
                    });

                buf.update(group, version, listener).await;

                // Post-check: the node may have departed between the
                // affinity snapshot and this point. Detect and detach
                // rather than serialize liveness with routing.
                if !self.inner.config.transport.is_alive(&node_for_post_check) {
                    if let Some((_, removed)) = self.inner.buffers.remove(&node_for_post_check) {
                        removed.on_node_left();
                    }
                }
            }

            operation.routing_complete();
        })
    }
}

async fn run_topology_listener(streamer: Streamer, mut events: TopologyEventStream) {
    while let Some(event) = events.next().await {
        match event {
            TopologyEvent::NodeFailed { node_id, version } | TopologyEvent::NodeLeft { node_id, version } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(node = %node_id, %version, "topology event: node departed");
                if let Some((_, buf)) = streamer.inner.buffers.remove(&node_id) {
                    let affinity = streamer.inner.config.affinity.clone();
                    tokio::spawn(async move {
                        affinity.wait_ready(version).await;
                        buf.on_node_left();
                    });
                }
            }
            TopologyEvent::Disconnected => {
                #[cfg(feature = "tracing")]
                tracing::warn!("topology event: disconnected from cluster");
                {
                    let mut state = streamer.inner.state.lock();
                    state.disconnect_error = Some(StreamerError::Disconnected);
                }
                let _ = streamer.close(true).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverMode;
    use crate::transport::{StreamRequest, TransportError};
    use std::sync::atomic::AtomicUsize;

    struct FakeAffinity {
        nodes: Vec<NodeId>,
        ready: TopologyVersion,
    }

    impl AffinityOracle for FakeAffinity {
        fn map_primary_and_backups(&self, _cache: &str, _key: &[u8], _version: TopologyVersion) -> Vec<NodeId> {
            self.nodes.clone()
        }

        fn ready_version(&self) -> TopologyVersion {
            self.ready
        }

        fn wait_ready<'a>(&'a self, _version: TopologyVersion) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
    }

    struct RecordingTransport {
        sent: DashMap<NodeId, Vec<u64>>,
        alive: DashMap<NodeId, bool>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: DashMap::new(),
                alive: DashMap::new(),
            }
        }

        fn requests_for(&self, node: &NodeId) -> Vec<u64> {
            self.sent.get(node).map(|v| v.clone()).unwrap_or_default()
        }
    }

    impl Transport for RecordingTransport {
        fn send<'a>(
            &'a self,
            node: &'a NodeId,
            request: StreamRequest,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
            self.sent.entry(node.clone()).or_default().push(request.request_id);
            Box::pin(async move { Ok(()) })
        }

        fn is_alive(&self, node: &NodeId) -> bool {
            self.alive.get(node).map(|b| *b).unwrap_or(true)
        }
    }

    /// Every send fails and the node is reported dead, the way a node that
    /// departed mid-batch would look from the transport's point of view.
    struct FailingTransport;

    impl Transport for FailingTransport {
        fn send<'a>(
            &'a self,
            node: &'a NodeId,
            _request: StreamRequest,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
            let node = node.clone();
            Box::pin(async move { Err(TransportError::Unreachable(node)) })
        }

        fn is_alive(&self, _node: &NodeId) -> bool {
            false
        }
    }

    struct NoopLocalApplier;

    impl LocalApplier for NoopLocalApplier {
        fn apply<'a>(
            &'a self,
            _cache_name: &'a str,
            _entries: Vec<Entry>,
            _skip_store: bool,
            _allow_overwrite: bool,
        ) -> Pin<Box<dyn Future<Output = Result<(), BufferError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct StaticReceiverImpl;

    impl Receiver for StaticReceiverImpl {
        fn marshal(&self, mode: ReceiverMode) -> Result<Bytes, String> {
            Ok(match mode {
                ReceiverMode::Isolated => Bytes::from_static(b"isolated"),
                ReceiverMode::Individual => Bytes::from_static(b"individual"),
            })
        }
    }

    fn build_streamer(
        nodes: Vec<NodeId>,
        buf_size: usize,
        parallel_ops: usize,
        transport: Arc<RecordingTransport>,
    ) -> Streamer {
        Streamer::builder("cache", "local")
            .buf_size(buf_size)
            .parallel_ops(parallel_ops)
            .transport(transport)
            .local_applier(Arc::new(NoopLocalApplier))
            .receiver(Arc::new(StaticReceiverImpl))
            .affinity(Arc::new(FakeAffinity {
                nodes,
                ready: TopologyVersion::ZERO,
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn overflow_submits_once_buf_size_is_reached() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec!["remote".to_string()], 2, 4, transport.clone());

        let op1 = streamer.add(vec![Entry::upsert("a", "1")]).await;
        assert!(
            transport.requests_for(&"remote".to_string()).is_empty(),
            "first entry under buf_size should only accumulate"
        );

        let op2 = streamer.add(vec![Entry::upsert("b", "2")]).await;
        let reqs = transport.requests_for(&"remote".to_string());
        assert_eq!(reqs.len(), 1, "second entry should overflow and submit both as one batch");

        streamer.on_response(&"remote".to_string(), StreamResponse {
            request_id: reqs[0],
            error: None,
        });
        assert!(op1.await.is_ok());
        assert!(op2.await.is_ok());
    }

    #[tokio::test]
    async fn remap_exhausted_when_max_remap_is_zero() {
        let streamer = Streamer::builder("cache", "local")
            .buf_size(1)
            .max_remap(0)
            .transport(Arc::new(FailingTransport))
            .local_applier(Arc::new(NoopLocalApplier))
            .receiver(Arc::new(StaticReceiverImpl))
            .affinity(Arc::new(FakeAffinity {
                nodes: vec!["remote".to_string()],
                ready: TopologyVersion::ZERO,
            }))
            .build()
            .unwrap();

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        assert!(matches!(
            op.await,
            Err(StreamerError::RemapExhausted { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn parallel_ops_gates_concurrent_submits_for_same_node() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec!["remote".to_string()], 1, 1, transport.clone());

        let op1 = streamer.add(vec![Entry::upsert("a", "1")]).await;
        let reqs = transport.requests_for(&"remote".to_string());
        assert_eq!(reqs.len(), 1);

        let streamer2 = streamer.clone();
        let op2_task = tokio::spawn(async move { streamer2.add(vec![Entry::upsert("b", "2")]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            transport.requests_for(&"remote".to_string()).len(),
            1,
            "second batch should block on the single permit until the first is acked"
        );

        streamer.on_response(&"remote".to_string(), StreamResponse {
            request_id: reqs[0],
            error: None,
        });
        assert!(op1.await.is_ok());

        let op2 = op2_task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reqs = transport.requests_for(&"remote".to_string());
        assert_eq!(reqs.len(), 2, "permit release should have let the second batch submit");

        streamer.on_response(&"remote".to_string(), StreamResponse {
            request_id: reqs[1],
            error: None,
        });
        assert!(op2.await.is_ok());
    }

    #[tokio::test]
    async fn replication_factor_three_requires_every_ack() {
        let transport = Arc::new(RecordingTransport::new());
        let nodes = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let streamer = build_streamer(nodes.clone(), 1, 4, transport.clone());

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        for node in &nodes {
            assert_eq!(transport.requests_for(node).len(), 1, "every replica should receive the batch");
        }

        let op_task = tokio::spawn(op);
        streamer.on_response(&nodes[0], StreamResponse {
            request_id: transport.requests_for(&nodes[0])[0],
            error: None,
        });
        streamer.on_response(&nodes[1], StreamResponse {
            request_id: transport.requests_for(&nodes[1])[0],
            error: None,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!op_task.is_finished(), "operation must wait for every replica, not just a quorum");

        streamer.on_response(&nodes[2], StreamResponse {
            request_id: transport.requests_for(&nodes[2])[0],
            error: None,
        });
        assert!(op_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn auto_flush_sweeps_pending_entries() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = Streamer::builder("cache", "local")
            .buf_size(10)
            .auto_flush_interval(Duration::from_millis(30))
            .transport(transport.clone())
            .local_applier(Arc::new(NoopLocalApplier))
            .receiver(Arc::new(StaticReceiverImpl))
            .affinity(Arc::new(FakeAffinity {
                nodes: vec!["remote".to_string()],
                ready: TopologyVersion::ZERO,
            }))
            .build()
            .unwrap();

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        assert!(
            transport.requests_for(&"remote".to_string()).is_empty(),
            "single entry under buf_size should not submit without the sweep"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reqs = transport.requests_for(&"remote".to_string());
        assert_eq!(reqs.len(), 1, "auto-flush sweep should have submitted the pending entry");

        streamer.on_response(&"remote".to_string(), StreamResponse {
            request_id: reqs[0],
            error: None,
        });
        assert!(op.await.is_ok());
    }

    #[tokio::test]
    async fn close_with_cancel_fails_in_flight_batches() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec!["remote".to_string()], 1, 4, transport);

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        streamer.close(true).await.unwrap();

        assert!(matches!(op.await, Err(StreamerError::Cancelled)));
    }

    #[tokio::test]
    async fn close_without_cancel_drains_pending_entries() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec!["remote".to_string()], 10, 4, transport.clone());

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        assert!(transport.requests_for(&"remote".to_string()).is_empty());

        let close_task = tokio::spawn({
            let streamer = streamer.clone();
            async move { streamer.close(false).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reqs = transport.requests_for(&"remote".to_string());
        assert_eq!(reqs.len(), 1, "close(false) must flush whatever was still accumulating");

        streamer.on_response(&"remote".to_string(), StreamResponse {
            request_id: reqs[0],
            error: None,
        });
        assert!(close_task.await.unwrap().is_ok());
        assert!(op.await.is_ok());
    }

    #[tokio::test]
    async fn unknown_affinity_fails_fast_with_topology_empty() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec![], 10, 4, transport);

        let op = streamer.add(vec![Entry::upsert("a", "1")]).await;
        assert!(matches!(op.await, Err(StreamerError::TopologyEmpty)));
    }

    #[tokio::test]
    async fn empty_add_fails_fast_instead_of_hanging() {
        let transport = Arc::new(RecordingTransport::new());
        let streamer = build_streamer(vec!["remote".to_string()], 10, 4, transport);

        let op = streamer.add(vec![]).await;
        assert!(matches!(op.await, Err(StreamerError::EmptyAppend)));
    }

    #[test]
    fn build_rejects_missing_local_applier() {
        let err = Streamer::builder("cache", "local")
            .transport(Arc::new(RecordingTransport::new()))
            .receiver(Arc::new(StaticReceiverImpl))
            .affinity(Arc::new(FakeAffinity {
                nodes: vec!["remote".to_string()],
                ready: TopologyVersion::ZERO,
            }))
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamerBuildError::MissingLocalApplier));
    }
}
