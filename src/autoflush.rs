//! Auto-flush scheduler: one shared timer wheel driving periodic
//! `try_flush` sweeps across every registered streamer.
//!
//! Generalizes a per-producer linger task (one `sleep` loop per producer)
//! to many streamers sharing a single `DelayQueue`, the way a real
//! deployment would rather not spawn one timer task per client.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

/// Anything the scheduler can periodically sweep. Implemented by the
/// streamer core; kept as a trait so this module has no dependency on it.
pub trait TryFlush: Send + Sync + 'static {
    fn try_flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

enum Command {
    Register {
        id: u64,
        target: Weak<dyn TryFlush>,
        interval: Duration,
    },
    Deregister {
        id: u64,
    },
}

/// A shared scheduler; construct one and pass it to however many streamers
/// should sweep on the same timer wheel. Registrations are weak, so a
/// streamer that is dropped without deregistering is simply skipped and
/// dropped from the queue on its next tick.
#[derive(Clone)]
pub struct AutoFlushScheduler {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl AutoFlushScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register `target` for a sweep every `interval`. Dropping the
    /// returned handle deregisters it; passing `Duration::ZERO` registers
    /// nothing and returns `None`, matching "interval 0 deregisters".
    pub fn register(&self, target: Weak<dyn TryFlush>, interval: Duration) -> Option<AutoFlushHandle> {
        if interval.is_zero() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(Command::Register { id, target, interval });
        Some(AutoFlushHandle {
            id,
            commands: self.commands.clone(),
        })
    }
}

impl Default for AutoFlushScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one registration. Deregisters on drop.
pub struct AutoFlushHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for AutoFlushHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Deregister { id: self.id });
    }
}

struct Registration {
    id: u64,
    target: Weak<dyn TryFlush>,
    interval: Duration,
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut queue: DelayQueue<Registration> = DelayQueue::new();
    let mut keys: HashMap<u64, Key> = HashMap::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Register { id, target, interval }) => {
                        let key = queue.insert(Registration { id, target, interval }, interval);
                        keys.insert(id, key);
                    }
                    Some(Command::Deregister { id }) => {
                        if let Some(key) = keys.remove(&id) {
                            queue.remove(&key);
                        }
                    }
                    None => {
                        // Every handle (and the scheduler itself) was dropped.
                        if queue.is_empty() {
                            return;
                        }
                    }
                }
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let registration = expired.into_inner();
                if let Some(target) = registration.target.upgrade() {
                    target.try_flush().await;
                    let key = queue.insert(
                        Registration {
                            id: registration.id,
                            target: Weak::clone(&registration.target),
                            interval: registration.interval,
                        },
                        registration.interval,
                    );
                    keys.insert(registration.id, key);
                } else {
                    keys.remove(&registration.id);
                }
            }
        }
    }
}
