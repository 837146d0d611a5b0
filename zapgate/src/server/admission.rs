//! Stream-slot admission control.
//!
//! Session-start requests take a token from a weighted semaphore; segment
//! fetches and control-plane endpoints never count against the limit.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::metrics::MetricsCollector;

/// Path prefixes excluded from admission and routing gates.
pub const CONTROL_PLANE_PREFIXES: [&str; 8] = [
    "/api/", "/healthz", "/readyz", "/metrics", "/discover", "/lineup", "/device", "/files/",
];

/// True when the path belongs to the control plane.
pub fn is_control_plane(path: &str) -> bool {
    CONTROL_PLANE_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Session-start detection: playlist fetches and direct stream paths count,
/// segment fetches and the control plane do not.
pub fn is_session_start(path: &str) -> bool {
    if is_control_plane(path) {
        return false;
    }
    if path.ends_with(".ts") || path.ends_with(".m4s") || path.ends_with(".mp4") {
        return false;
    }
    if path.ends_with(".m3u8") {
        return true;
    }

    // Direct ref or slug: a single non-empty path segment.
    let segment = path.trim_start_matches('/');
    !segment.is_empty() && !segment.contains('/')
}

/// A held stream slot; dropping it frees the slot.
#[derive(Debug)]
pub struct StreamSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Weighted-semaphore admission; a zero limit disables it entirely.
pub struct Admission {
    slots: Option<Arc<Semaphore>>,
    metrics: Arc<MetricsCollector>,
}

impl Admission {
    pub fn new(max_concurrent_streams: usize, metrics: Arc<MetricsCollector>) -> Self {
        let slots = if max_concurrent_streams > 0 {
            Some(Arc::new(Semaphore::new(max_concurrent_streams)))
        } else {
            None
        };
        Self { slots, metrics }
    }

    /// Try to take a slot for a session-start request. `None` means the
    /// gateway is at capacity (429 for the caller).
    pub fn try_acquire(&self) -> Option<StreamSlot> {
        match &self.slots {
            None => Some(StreamSlot { _permit: None }),
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(StreamSlot {
                    _permit: Some(permit),
                }),
                Err(_) => {
                    self.metrics.admission_rejected();
                    None
                }
            },
        }
    }

    /// Slots currently available, for diagnostics.
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_is_never_a_session_start() {
        assert!(!is_session_start("/api/scan"));
        assert!(!is_session_start("/healthz"));
        assert!(!is_session_start("/metrics"));
        assert!(!is_session_start("/lineup.json"));
        assert!(!is_session_start("/device.xml"));
    }

    #[test]
    fn segments_are_not_session_starts() {
        assert!(!is_session_start("/hls/1:0:1/seg_ab_00001.ts"));
        assert!(!is_session_start("/hls/1:0:1/seg_ab_00001.m4s"));
        assert!(!is_session_start("/hls/1:0:1/init.mp4"));
    }

    #[test]
    fn playlists_and_direct_paths_are_session_starts() {
        assert!(is_session_start("/hls/1:0:1/playlist.m3u8"));
        assert!(is_session_start("/1:0:19:132F:3EF:1:C00000:0:0:0:"));
        assert!(is_session_start("/das-erste-hd"));
    }

    #[test]
    fn zero_limit_always_admits() {
        let admission = Admission::new(0, Arc::new(MetricsCollector::new()));
        for _ in 0..100 {
            assert!(admission.try_acquire().is_some());
        }
    }

    #[test]
    fn slots_are_limited_and_released() {
        let metrics = Arc::new(MetricsCollector::new());
        let admission = Admission::new(2, metrics);

        let slot_a = admission.try_acquire().expect("first slot");
        let _slot_b = admission.try_acquire().expect("second slot");
        assert!(admission.try_acquire().is_none(), "limit reached");

        drop(slot_a);
        assert!(admission.try_acquire().is_some(), "slot freed on drop");
    }
}
