//! Capability scan: walk the lineup, probe every stream, fill the store.
//!
//! One scan per process; starting a second is a no-op. Probes go through
//! the web-zap resolution first and fall back to the declared URL, then a
//! port-8001 rebuild.

mod probe;

pub use probe::{FfprobeProber, ProbeOutcome, StreamProber, ffprobe_path, parse_ffprobe_output};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityStore};
use crate::channels::ChannelMap;
use crate::config::CapabilityConfig;
use crate::receiver::{ReceiverClient, parse_mini_playlist};
use crate::utils::time::sleep_cancellable;
use crate::utils::url::{extract_service_ref, rebuild_port_8001};
use crate::{Error, Result};

/// Scan lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Running,
    Complete,
    Cancelled,
    Failed,
}

/// Progress and outcome of the current (or last) scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub scanned: usize,
    pub updated: usize,
    pub last_error: Option<String>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            started_at: None,
            finished_at: None,
            total: 0,
            scanned: 0,
            updated: 0,
            last_error: None,
        }
    }
}

/// Budget for the web-zap resolution during a scan; deliberately short,
/// the declared URL is a good enough fallback.
const SCAN_RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Identity of a playlist file's contents, for scan deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: Option<std::time::SystemTime>,
}

/// Fingerprint a file; `None` when it cannot be read.
pub fn fingerprint(path: &std::path::Path) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        size: meta.len(),
        mtime: meta.modified().ok(),
    })
}

/// Drives the capability store.
pub struct ScanManager {
    store: Arc<dyn CapabilityStore>,
    channels: Arc<ChannelMap>,
    client: ReceiverClient,
    prober: Arc<dyn StreamProber>,
    config: CapabilityConfig,
    is_scanning: AtomicBool,
    status: Mutex<ScanStatus>,
    cancel: Mutex<Option<CancellationToken>>,
    /// Playlist fingerprint of the last completed scan.
    last_fingerprint: Mutex<Option<Fingerprint>>,
}

impl ScanManager {
    pub fn new(
        store: Arc<dyn CapabilityStore>,
        channels: Arc<ChannelMap>,
        client: ReceiverClient,
        prober: Arc<dyn StreamProber>,
        config: CapabilityConfig,
    ) -> Self {
        Self {
            store,
            channels,
            client,
            prober,
            config,
            is_scanning: AtomicBool::new(false),
            status: Mutex::new(ScanStatus::default()),
            cancel: Mutex::new(None),
            last_fingerprint: Mutex::new(None),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ScanStatus {
        self.status.lock().clone()
    }

    /// Run a scan on this task. A scan already in progress makes this a
    /// no-op returning the current status.
    pub async fn run(&self) -> Result<ScanStatus> {
        if self
            .is_scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scan already running, sync start is a no-op");
            return Ok(self.status());
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let result = self.scan_all(&cancel).await;

        *self.cancel.lock() = None;
        self.is_scanning.store(false, Ordering::SeqCst);
        result
    }

    /// Start a background scan. Returns false when one is already running.
    pub fn start_background(self: &Arc<Self>) -> bool {
        if self.is_scanning.load(Ordering::SeqCst) {
            return false;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                warn!(error = %e, "background scan failed");
            }
        });
        true
    }

    /// Cancel the scan in progress, if any.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    async fn scan_all(&self, cancel: &CancellationToken) -> Result<ScanStatus> {
        // An unchanged playlist after a completed scan has nothing new to
        // probe; skip the sweep entirely.
        let current_fp = fingerprint(self.channels.playlist_path());
        {
            let last = self.last_fingerprint.lock().clone();
            if current_fp.is_some()
                && current_fp == last
                && self.status.lock().state == ScanState::Complete
            {
                debug!("playlist unchanged since last scan, skipping");
                return Ok(self.status());
            }
        }

        let entries = self.channels.entries();

        {
            let mut status = self.status.lock();
            *status = ScanStatus {
                state: ScanState::Running,
                started_at: Some(Utc::now()),
                total: entries.len(),
                ..Default::default()
            };
        }
        info!(total = entries.len(), "capability scan started");

        let mut final_state = ScanState::Complete;

        for entry in &entries {
            if cancel.is_cancelled() {
                final_state = ScanState::Cancelled;
                break;
            }

            match self.scan_one(&entry.url, cancel).await {
                Ok(updated) => {
                    let mut status = self.status.lock();
                    status.scanned += 1;
                    if updated {
                        status.updated += 1;
                    }
                }
                Err(Error::Cancelled) => {
                    final_state = ScanState::Cancelled;
                    break;
                }
                Err(e) => {
                    // Unprobeable channels are normal (dead transponders);
                    // record and continue.
                    debug!(url = %entry.url, error = %e, "channel probe failed");
                    let mut status = self.status.lock();
                    status.scanned += 1;
                    status.last_error = Some(e.to_string());
                }
            }

            match sleep_cancellable(self.config.probe_delay, cancel).await {
                Ok(()) => {}
                Err(_) => {
                    final_state = ScanState::Cancelled;
                    break;
                }
            }
        }

        let status = {
            let mut status = self.status.lock();
            status.state = final_state;
            status.finished_at = Some(Utc::now());
            status.clone()
        };

        if status.state == ScanState::Complete {
            *self.last_fingerprint.lock() = current_fp;
        }

        info!(
            state = ?status.state,
            scanned = status.scanned,
            updated = status.updated,
            "capability scan finished"
        );
        Ok(status)
    }

    /// Scan a single channel; returns true when the store was updated.
    async fn scan_one(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        let Some(service_ref) = extract_service_ref(url) else {
            return Ok(false);
        };

        // Existing non-empty records are kept; a rescan is an explicit
        // store wipe, not an implicit overwrite.
        if let Some(existing) = self.store.get(&service_ref).await?
            && !existing.is_empty()
        {
            return Ok(false);
        }

        for candidate in self.candidates(&service_ref, url).await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self
                .prober
                .probe(&candidate, self.config.probe_timeout)
                .await
            {
                Ok(outcome) => {
                    self.store
                        .update(Capability {
                            service_ref: service_ref.clone(),
                            interlaced: outcome.interlaced,
                            resolution: outcome.resolution,
                            codec: outcome.codec,
                            last_scan: Utc::now(),
                        })
                        .await?;
                    return Ok(true);
                }
                Err(e) => {
                    debug!(url = %candidate, error = %e, "probe attempt failed");
                }
            }
        }

        Err(Error::Scan(format!("no candidate for {service_ref} probed")))
    }

    /// Probe candidates in order: web-zap resolution, port-8001 rebuild,
    /// the declared URL.
    async fn candidates(&self, service_ref: &str, declared: &str) -> Vec<String> {
        let mut candidates = Vec::with_capacity(3);

        match self.client.web_zap(service_ref, SCAN_RESOLVE_TIMEOUT).await {
            Ok(body) => {
                if let (Some(url), _) = parse_mini_playlist(&body) {
                    candidates.push(url);
                }
            }
            Err(e) => debug!(service_ref, error = %e, "scan web-zap resolution failed"),
        }

        if let Some(first) = candidates.first().cloned()
            && let Some(rebuilt) = rebuild_port_8001(&first)
            && rebuilt != first
        {
            candidates.push(rebuilt);
        }

        if !candidates.iter().any(|c| c == declared) {
            candidates.push(declared.to_string());
        }

        candidates
    }
}
