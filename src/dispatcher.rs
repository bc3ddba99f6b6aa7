//! The hierarchical namespace dispatcher: the fanout router with
//! per-subscriber bounded queues.
//!
//! A queue is inserted into the map under every ancestor of the namespace it
//! subscribed to, so `route` only ever needs to look up the single bucket
//! matching the inbound message's namespace exactly — fan-out to ancestors
//! was already paid for at subscribe time. See spec.md §4.2.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use crate::codec::{FrameCodec, Opcode};
use crate::metrics::{Counters, DispatchTimer};
use crate::namespace::{ancestors, normalize};
use crate::{Error, Result};

/// Payloads at or above this size are also shipped as a precomputed
/// permessage-deflate frame. Chosen so payloads that already fit in one
/// TCP/IP packet (1500 MTU minus 60 bytes of IP/TCP headers minus another
/// 60 bytes of margin) skip compression entirely.
pub const MIN_COMPRESS_SIZE: usize = 1380;

/// Bound on a single subscriber's pending-message queue. Unbounded queues
/// let one slow subscriber hold memory proportional to bus volume forever;
/// this crate prefers to drop messages for that subscriber instead (see
/// `route`'s enqueue-failure handling, spec.md §7).
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// An immutable value produced once per inbound bus message and fanned out
/// to every matching subscriber queue.
#[derive(Debug)]
pub struct Message {
    pub namespace: String,
    pub raw: Vec<u8>,
    pub compressed_frame: Option<Vec<u8>>,
}

impl Message {
    fn new(namespace: String, raw: Vec<u8>, codec: &FrameCodec) -> Result<Self> {
        let compressed_frame = if raw.len() >= MIN_COMPRESS_SIZE {
            Some(codec.compressed_frame(Opcode::Text, &raw)?)
        } else {
            None
        };
        Ok(Self {
            namespace,
            raw,
            compressed_frame,
        })
    }
}

/// Identifies one subscriber's queue so it can be located and removed from
/// every ancestor bucket it was inserted into.
#[derive(Clone)]
pub struct SubscriberQueue {
    id: u64,
    tx: mpsc::Sender<Arc<Message>>,
}

impl SubscriberQueue {
    fn send(&self, message: Arc<Message>) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

struct DispatcherState {
    consumers: HashMap<String, Vec<SubscriberQueue>>,
}

/// Maintains `{namespace -> subscriber queues}` and routes inbound messages
/// to every subscriber whose namespace is an ancestor of (or equal to) the
/// message's namespace.
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    codec: Arc<FrameCodec>,
    counters: Arc<Counters>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(codec: Arc<FrameCodec>, counters: Arc<Counters>) -> Self {
        Self {
            state: Mutex::new(DispatcherState {
                consumers: HashMap::new(),
            }),
            codec,
            counters,
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribes a new connection to `namespace`, inserting its queue into
    /// every ancestor bucket. Returns the queue handle (for `unsubscribe`)
    /// and the receiving half the connection's pump reads from.
    pub fn subscribe(&self, namespace: &str) -> Result<(SubscriberQueue, mpsc::Receiver<Arc<Message>>)> {
        let namespace = normalize(namespace)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let queue = SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        };

        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        for ancestor in ancestors(&namespace) {
            state.consumers.entry(ancestor).or_default().push(queue.clone());
        }
        Ok((queue, rx))
    }

    /// Removes `queue` from every ancestor bucket of `namespace`. Idempotent:
    /// a queue already removed (or never present) is simply not found.
    pub fn unsubscribe(&self, namespace: &str, queue: &SubscriberQueue) {
        let namespace = match normalize(namespace) {
            Ok(ns) => ns,
            Err(_) => return,
        };

        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        for ancestor in ancestors(&namespace) {
            let Some(list) = state.consumers.get_mut(&ancestor) else {
                continue;
            };
            list.retain(|q| q.id != queue.id);
            if list.is_empty() {
                state.consumers.remove(&ancestor);
            }
        }
    }

    /// Builds a `Message` from `payload` and enqueues it into every
    /// subscriber queue registered under `namespace` exactly. A full
    /// subscriber queue is logged and skipped; other subscribers still
    /// receive the message.
    pub fn route(&self, namespace: &str, payload: Vec<u8>) -> Result<usize> {
        if !namespace.starts_with('/') {
            return Err(Error::BadNamespace("routing key must start with /"));
        }
        let timer = DispatchTimer::start();
        let message = Arc::new(Message::new(namespace.to_string(), payload, &self.codec)?);

        let state = self.state.lock().expect("dispatcher mutex poisoned");
        let Some(subscribers) = state.consumers.get(namespace) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            if subscriber.send(Arc::clone(&message)) {
                delivered += 1;
            } else {
                debug!("subscriber queue full, dropping message for namespace {namespace}");
            }
        }
        drop(state);
        self.counters.record_dispatch(timer.finish());
        Ok(delivered)
    }

    /// Sum of subscriber-list lengths across every key in the map. Because
    /// a subscriber's queue is inserted under each of its own ancestors,
    /// this counts one physical connection once per ancestor namespace it
    /// is reachable from, matching the upstream service's `/health` count.
    pub fn connection_count(&self) -> usize {
        let state = self.state.lock().expect("dispatcher mutex poisoned");
        state.consumers.values().map(Vec::len).sum()
    }
}
