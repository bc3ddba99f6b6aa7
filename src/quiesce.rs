//! The graceful quiesce state machine: stop accepting new connections and
//! close the rest at a paced rate, so an operator can drain a node before
//! shutdown without a thundering herd of reconnects hitting the bus.
//!
//! `quiesced` is monotonic — once set it is never cleared for the life of
//! the process (spec.md §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::sync::oneshot;

/// Grace window between `quiesced` being set and the first paced close,
/// giving external service discovery time to pull the node from rotation.
pub const DEFAULT_SHED_DELAY: Duration = Duration::from_secs(30);

pub struct QuiesceState {
    quiesced: AtomicBool,
    connections: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    shed_rate: u32,
    shed_delay: Duration,
}

impl QuiesceState {
    pub fn new(shed_rate: u32) -> Arc<Self> {
        Self::with_delay(shed_rate, DEFAULT_SHED_DELAY)
    }

    pub fn with_delay(shed_rate: u32, shed_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            quiesced: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shed_rate: shed_rate.max(1),
            shed_delay,
        })
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("quiesce mutex poisoned").len()
    }

    /// Registers a newly admitted connection. The returned receiver resolves
    /// when the shedder decides to close this connection; the connection's
    /// task should select on it alongside its normal read/write loop.
    pub fn register(&self) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().expect("quiesce mutex poisoned").insert(id, tx);
        (id, rx)
    }

    /// Removes a connection that is tearing down on its own (peer
    /// disconnect, I/O error) so the shedder does not try to close it.
    pub fn deregister(&self, id: u64) {
        self.connections.lock().expect("quiesce mutex poisoned").remove(&id);
    }

    /// Idempotent: returns `true` only the first time quiesce is triggered
    /// for this process. Callers always report success to the caller either
    /// way (spec.md: a second `/quiesce` call is a no-op but still 200).
    pub fn quiesce(self: &Arc<Self>) -> bool {
        if self.quiesced.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("quiescing: no new connections accepted, shedding begins in {:?}", self.shed_delay);

        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(state.shed_delay).await;

            let snapshot: Vec<u64> = {
                let connections = state.connections.lock().expect("quiesce mutex poisoned");
                connections.keys().copied().collect()
            };

            for chunk in snapshot.chunks(state.shed_rate as usize) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let mut connections = state.connections.lock().expect("quiesce mutex poisoned");
                for id in chunk {
                    if let Some(close) = connections.remove(id) {
                        let _ = close.send(());
                    }
                }
            }
        });
        true
    }
}
