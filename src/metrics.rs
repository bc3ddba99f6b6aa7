//! In-process counters for the connection and dispatch events the upstream
//! service reports to its stats client. No external metrics sink is wired
//! up here (ambient observability is logging, see `bin/nsbroker.rs`); these
//! are plain atomics a caller can snapshot for a status line or a `/health`
//! body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct Counters {
    pub connected: AtomicU64,
    pub lost: AtomicU64,
    pub rejected_not_websocket: AtomicU64,
    pub rejected_bad_namespace: AtomicU64,
    pub compression_permessage_deflate: AtomicU64,
    pub compression_none: AtomicU64,
    pub dispatch_count: AtomicU64,
    pub dispatch_nanos_total: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_not_websocket(&self) {
        self.rejected_not_websocket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_bad_namespace(&self) {
        self.rejected_bad_namespace.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self, used: bool) {
        if used {
            self.compression_permessage_deflate.fetch_add(1, Ordering::Relaxed);
        } else {
            self.compression_none.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one `Dispatcher::route` call's elapsed time, matching the
    /// upstream service's `dispatch` timer (spec.md §6).
    pub fn record_dispatch(&self, elapsed: Duration) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        self.dispatch_nanos_total
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            rejected_not_websocket: self.rejected_not_websocket.load(Ordering::Relaxed),
            rejected_bad_namespace: self.rejected_bad_namespace.load(Ordering::Relaxed),
            compression_permessage_deflate: self.compression_permessage_deflate.load(Ordering::Relaxed),
            compression_none: self.compression_none.load(Ordering::Relaxed),
            dispatch_count: self.dispatch_count.load(Ordering::Relaxed),
            dispatch_nanos_total: self.dispatch_nanos_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CountersSnapshot {
    pub connected: u64,
    pub lost: u64,
    pub rejected_not_websocket: u64,
    pub rejected_bad_namespace: u64,
    pub compression_permessage_deflate: u64,
    pub compression_none: u64,
    pub dispatch_count: u64,
    pub dispatch_nanos_total: u64,
}

/// Measures one `Dispatcher::route` call. Dropping it without calling
/// `finish` still records the elapsed time, so an early return can't
/// silently skip the timer.
pub struct DispatchTimer {
    started: Instant,
}

impl DispatchTimer {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    pub fn finish(self) -> Duration {
        self.started.elapsed()
    }
}
