//! Idle monitor for long-lived streaming responses.
//!
//! Every streaming writer registers itself and touches its timestamp on
//! each chunk; a single background tick cancels writers that have not
//! written within the idle timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::MetricsCollector;

/// Monitor tick cadence.
const TICK: Duration = Duration::from_secs(1);

struct IdleEntry {
    last_write_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Registry of active streaming writers.
pub struct IdleMonitor {
    entries: DashMap<u64, IdleEntry>,
    next_id: AtomicU64,
    epoch: Instant,
    timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl IdleMonitor {
    /// A zero timeout disables the monitor; writers still register but are
    /// never cancelled.
    pub fn new(timeout: Duration, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            timeout,
            metrics,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a writer; the guard deregisters on drop.
    pub fn register(self: &Arc<Self>) -> IdleGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let last_write_ms = Arc::new(AtomicU64::new(self.now_ms()));
        let cancel = CancellationToken::new();

        self.entries.insert(
            id,
            IdleEntry {
                last_write_ms: last_write_ms.clone(),
                cancel: cancel.clone(),
            },
        );

        IdleGuard {
            id,
            monitor: self.clone(),
            last_write_ms,
            cancel,
        }
    }

    /// Start the background tick.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled() {
            return;
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(TICK) => {}
                }
                monitor.sweep();
            }
        });
    }

    fn sweep(&self) {
        let now = self.now_ms();
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut stale = Vec::new();

        for entry in self.entries.iter() {
            let last = entry.value().last_write_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > timeout_ms {
                stale.push(*entry.key());
            }
        }

        for id in stale {
            if let Some((_, entry)) = self.entries.remove(&id) {
                debug!(writer = id, "idle writer cancelled");
                entry.cancel.cancel();
                self.metrics.idle_disconnect();
            }
        }
    }

    pub fn active(&self) -> usize {
        self.entries.len()
    }
}

/// Handle held by a streaming response.
pub struct IdleGuard {
    id: u64,
    monitor: Arc<IdleMonitor>,
    last_write_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl IdleGuard {
    /// Record a write.
    pub fn touch(&self) {
        self.last_write_ms
            .store(self.monitor.now_ms(), Ordering::Relaxed);
    }

    /// Cancelled when the monitor declares this writer idle.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.monitor.entries.remove(&self.id);
    }
}
