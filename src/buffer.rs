//! Per-node buffer: accumulation, overflow submission, parallel-ops gating,
//! and in-flight request tracking.
//!
//! Mirrors a producer's batching shape (`pending_batch`, `send_batch_locked`,
//! an `in_flight` counter) but generalizes "one producer, one destination"
//! to "one buffer per destination node", replaces the atomic in-flight
//! counter with a real semaphore (submission must block, not silently
//! skip, when every permit is held), and correlates acknowledgments by
//! `request_id` instead of by sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use crate::entry::Entry;
use crate::error::BufferError;
use crate::receiver::{Receiver, ReceiverMode};
use crate::topology::{NodeId, TopologyVersion};
use crate::transport::{LocalApplier, StreamRequest, StreamResponse, Transport};

type Listener = Box<dyn FnOnce(Result<(), BufferError>) + Send>;

struct BatchState {
    result: Option<Result<(), BufferError>>,
    waiters: Vec<Listener>,
}

/// The future a batch (still accumulating, or already submitted) resolves
/// through. Cloning shares the same underlying state — this is *replaced*,
/// never mutated, at every overflow or flush (see `SPEC_FULL.md` §4.2), so
/// listeners attached before a swap keep observing the pre-swap batch.
#[derive(Clone)]
pub struct BatchFuture {
    state: Arc<Mutex<BatchState>>,
}

impl BatchFuture {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState {
                result: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Registers `listener`, invoking it inline if this batch has already
    /// resolved.
    pub fn add_listener(&self, listener: Listener) {
        let mut state = self.state.lock();
        if let Some(result) = state.result.clone() {
            drop(state);
            listener(result);
        } else {
            state.waiters.push(listener);
        }
    }

    /// Resolves the batch. A no-op if it has already resolved — the first
    /// resolution wins, matching `Operation::fail`.
    fn resolve(&self, result: Result<(), BufferError>) {
        let waiters = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(result.clone());
        }
    }

    /// Await this batch's outcome directly; used by `flush`/`close`'s
    /// compound future.
    pub async fn wait(&self) -> Result<(), BufferError> {
        let (tx, rx) = oneshot::channel();
        self.add_listener(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.await.unwrap_or(Err(BufferError::Cancelled))
    }
}

struct InFlightRequest {
    target: BatchFuture,
    // Held until the matching response arrives (or the request is torn
    // down some other way); dropping it releases the parallel-ops permit.
    _permit: OwnedSemaphorePermit,
}

struct BufferState {
    pending_entries: Vec<Entry>,
    current_batch: BatchFuture,
}

struct BufferConfig {
    cache_name: String,
    buf_size: usize,
    is_local_node: bool,
    transport: Arc<dyn Transport>,
    local_applier: Option<Arc<dyn LocalApplier>>,
    receiver: Arc<dyn Receiver>,
    response_topic: Bytes,
    skip_store: bool,
    allow_overwrite: Arc<AtomicBool>,
}

/// Accumulates entries destined for one node, bounded by `buf_size`; gates
/// in-flight batches by a semaphore of capacity `parallel_ops`; tracks
/// outstanding requests by id.
#[derive(Clone)]
pub struct Buffer {
    node_id: NodeId,
    state: Arc<Mutex<BufferState>>,
    in_flight: Arc<DashMap<u64, InFlightRequest>>,
    next_request_id: Arc<AtomicU64>,
    permits: Arc<Semaphore>,
    config: Arc<BufferConfig>,
    marshalled: Arc<Mutex<HashMap<ReceiverMode, Bytes>>>,
    cancelled: Arc<AtomicBool>,
}

impl Buffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        cache_name: String,
        buf_size: usize,
        parallel_ops: usize,
        is_local_node: bool,
        transport: Arc<dyn Transport>,
        local_applier: Option<Arc<dyn LocalApplier>>,
        receiver: Arc<dyn Receiver>,
        response_topic: Bytes,
        skip_store: bool,
        allow_overwrite: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node_id,
            state: Arc::new(Mutex::new(BufferState {
                pending_entries: Vec::with_capacity(buf_size),
                current_batch: BatchFuture::new(),
            })),
            in_flight: Arc::new(DashMap::new()),
            next_request_id: Arc::new(AtomicU64::new(0)),
            permits: Arc::new(Semaphore::new(parallel_ops)),
            config: Arc::new(BufferConfig {
                cache_name,
                buf_size,
                is_local_node,
                transport,
                local_applier,
                receiver,
                response_topic,
                skip_store,
                allow_overwrite,
            }),
            marshalled: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_entries.len()
    }

    /// Accumulate `new_entries`, registering `listener` on whichever batch
    /// future is current *before* this call's own append. Returns the
    /// just-submitted batch's future if this call overflowed the buffer.
    pub async fn update(
        &self,
        new_entries: Vec<Entry>,
        version: TopologyVersion,
        listener: Listener,
    ) -> Option<BatchFuture> {
        let overflow = {
            let mut state = self.state.lock();
            state.current_batch.add_listener(listener);
            state.pending_entries.extend(new_entries);

            if state.pending_entries.len() >= self.config.buf_size {
                let taken = std::mem::take(&mut state.pending_entries);
                let old_future = state.current_batch.clone();
                state.current_batch = BatchFuture::new();
                Some((taken, old_future))
            } else {
                None
            }
        };

        if let Some((taken, old_future)) = overflow {
            #[cfg(feature = "tracing")]
            tracing::debug!(node = %self.node_id, batch_len = taken.len(), "buffer overflow, submitting batch");
            self.submit(taken, version, old_future.clone()).await;
            if self.cancelled.load(Ordering::Acquire) {
                old_future.resolve(Err(BufferError::Cancelled));
            }
            Some(old_future)
        } else {
            None
        }
    }

    /// Swap out the current accumulator (if non-empty) and submit it, then
    /// return a future completing when every outstanding batch for this
    /// node — the one just swapped plus anything already in flight — has
    /// resolved. `None` if there was nothing outstanding at all.
    pub async fn flush(&self, version: TopologyVersion) -> Option<BatchFuture> {
        let swapped = {
            let mut state = self.state.lock();
            if state.pending_entries.is_empty() {
                None
            } else {
                let taken = std::mem::take(&mut state.pending_entries);
                let old_future = state.current_batch.clone();
                state.current_batch = BatchFuture::new();
                Some((taken, old_future))
            }
        };

        if let Some((taken, old_future)) = swapped {
            self.submit(taken, version, old_future.clone()).await;
        }

        let outstanding: Vec<BatchFuture> = self
            .in_flight
            .iter()
            .map(|entry| entry.value().target.clone())
            .collect();

        if outstanding.is_empty() {
            return swapped.map(|(_, f)| f);
        }

        let compound = BatchFuture::new();
        let compound_clone = compound.clone();
        let remaining = Arc::new(AtomicU64::new(outstanding.len() as u64));
        for fut in outstanding {
            let compound = compound_clone.clone();
            let remaining = remaining.clone();
            fut.add_listener(Box::new(move |result| {
                if result.is_err() {
                    compound.resolve(result);
                    return;
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    compound.resolve(Ok(()));
                }
            }));
        }
        Some(compound)
    }

    async fn submit(&self, entries: Vec<Entry>, version: TopologyVersion, target: BatchFuture) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                target.resolve(Err(BufferError::Cancelled));
                return;
            }
        };

        if self.cancelled.load(Ordering::Acquire) {
            target.resolve(Err(BufferError::Cancelled));
            return;
        }

        if self.config.is_local_node {
            self.submit_local(entries, permit, target).await;
        } else {
            self.submit_remote(entries, version, permit, target).await;
        }
    }

    async fn submit_local(&self, entries: Vec<Entry>, permit: OwnedSemaphorePermit, target: BatchFuture) {
        let applier = match self.config.local_applier.clone() {
            Some(applier) => applier,
            // `StreamerBuilder::build` rejects a configuration that could
            // reach this without a LocalApplier; guarded here too since a
            // Buffer can in principle be constructed directly.
            None => {
                target.resolve(Err(BufferError::TopologyStale));
                return;
            }
        };
        let cache_name = self.config.cache_name.clone();
        let skip_store = self.config.skip_store;
        let allow_overwrite = self.config.allow_overwrite.load(Ordering::Acquire);

        // Tracked in `in_flight` the same as a remote request (under a
        // reserved id-space) purely so `flush` sees it as outstanding; there
        // is no wire response to correlate, so the spawned task resolves
        // and removes the entry itself instead of going through
        // `on_response`.
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            request_id,
            InFlightRequest {
                target: target.clone(),
                _permit: permit,
            },
        );
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let result = applier.apply(&cache_name, entries, skip_store, allow_overwrite).await;
            if in_flight.remove(&request_id).is_some() {
                target.resolve(result);
            }
        });
    }

    async fn submit_remote(
        &self,
        entries: Vec<Entry>,
        version: TopologyVersion,
        permit: OwnedSemaphorePermit,
        target: BatchFuture,
    ) {
        let mode = if self.config.allow_overwrite.load(Ordering::Acquire) {
            ReceiverMode::Individual
        } else {
            ReceiverMode::Isolated
        };

        let receiver_bytes = match self.marshalled_receiver(mode) {
            Ok(bytes) => bytes,
            Err(msg) => {
                target.resolve(Err(BufferError::Marshal(msg)));
                return;
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = StreamRequest {
            request_id,
            response_topic: self.config.response_topic.clone(),
            cache_name: self.config.cache_name.clone(),
            receiver: receiver_bytes,
            entries,
            ignore_deployment_topology: false,
            skip_store: self.config.skip_store,
            deployment: None,
            topology_version: version,
        };

        self.in_flight.insert(
            request_id,
            InFlightRequest {
                target: target.clone(),
                _permit: permit,
            },
        );

        let transport = self.config.transport.clone();
        let node_id = self.node_id.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            if let Err(err) = transport.send(&node_id, request).await {
                if let Some((_, req)) = in_flight.remove(&request_id) {
                    let still_alive = transport.is_alive(&node_id);
                    let buf_err = if still_alive {
                        BufferError::Transport(err.to_string())
                    } else {
                        BufferError::TopologyStale
                    };
                    #[cfg(feature = "tracing")]
                    tracing::warn!(node = %node_id, error = %buf_err, "batch submission failed");
                    req.target.resolve(Err(buf_err));
                    // req._permit drops here, releasing the permit.
                }
            }
            // On success, the entry (and its permit) is released when the
            // matching response arrives via `on_response`.
        });
    }

    fn marshalled_receiver(&self, mode: ReceiverMode) -> Result<Bytes, String> {
        let mut cache = self.marshalled.lock();
        if let Some(bytes) = cache.get(&mode) {
            return Ok(bytes.clone());
        }
        let bytes = self.config.receiver.marshal(mode)?;
        cache.insert(mode, bytes.clone());
        Ok(bytes)
    }

    /// Correlates an asynchronous acknowledgment back to the request that
    /// produced it. A response with no matching entry is a late response
    /// after a remap and is ignored.
    pub fn on_response(&self, response: StreamResponse) {
        if let Some((_, req)) = self.in_flight.remove(&response.request_id) {
            let result = match response.error {
                None => Ok(()),
                Some(bytes) => Err(BufferError::ServerApply(bytes)),
            };
            req.target.resolve(result);
        }
    }

    /// Called by the streamer after this buffer has been detached from the
    /// node map. Fails everything outstanding with a topology error; a
    /// fresh buffer will be created for subsequent entries at the next
    /// topology version.
    pub fn on_node_left(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(node = %self.node_id, "buffer detached: node left");
        let in_flight: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| entry.key().to_owned())
            .collect();
        for request_id in in_flight {
            if let Some((_, req)) = self.in_flight.remove(&request_id) {
                req.target.resolve(Err(BufferError::TopologyStale));
            }
        }
        let current = self.state.lock().current_batch.clone();
        current.resolve(Err(BufferError::TopologyStale));
    }

    /// Best-effort cancellation: fails every in-flight request and the
    /// current accumulating batch, then closes the semaphore so anything
    /// blocked in `submit` wakes immediately with `Cancelled`.
    pub fn cancel_all(&self, err: Option<BufferError>) {
        self.cancelled.store(true, Ordering::Release);
        let err = err.unwrap_or(BufferError::Cancelled);

        let in_flight: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| entry.key().to_owned())
            .collect();
        for request_id in in_flight {
            if let Some((_, req)) = self.in_flight.remove(&request_id) {
                req.target.resolve(Err(err.clone()));
            }
        }

        let current = self.state.lock().current_batch.clone();
        current.resolve(Err(err));

        self.permits.close();
    }
}
