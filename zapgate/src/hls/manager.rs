//! Session table: create, reuse, evict.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{HlsSession, SessionDeps, SessionKey, SessionState, normalize_ref};
use crate::channels::ChannelMap;
use crate::profile;
use crate::utils::url::extract_service_ref;
use crate::{Error, Result};

/// Eviction sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Bound on the shutdown stop fan-out.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns every HLS session and serializes creation per key.
pub struct HlsManager {
    deps: SessionDeps,
    channels: Arc<ChannelMap>,
    sessions: DashMap<SessionKey, Arc<HlsSession>>,
    create_locks: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    cancel: CancellationToken,
}

impl HlsManager {
    pub fn new(deps: SessionDeps, channels: Arc<ChannelMap>) -> Self {
        Self {
            deps,
            channels,
            sessions: DashMap::new(),
            create_locks: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Resolve what the viewer asked for into `(service key, zap target)`.
    ///
    /// A colon-marked path is a technical reference used as-is; anything
    /// else must be a known slug whose declared URL becomes the zap target.
    fn resolve_channel(&self, ref_or_slug: &str) -> Result<(String, String)> {
        let trimmed = normalize_ref(ref_or_slug);

        if trimmed.contains(':') {
            return Ok((trimmed.clone(), trimmed));
        }

        let entry = self
            .channels
            .lookup(&trimmed)
            .ok_or_else(|| Error::ChannelNotFound(trimmed.clone()))?;

        let service_ref = extract_service_ref(&entry.url).unwrap_or(trimmed);
        Ok((service_ref, entry.url))
    }

    /// Get or create the session for a viewer request and drive it to
    /// started. A failed start removes the session so the next viewer gets
    /// a fresh one.
    pub async fn start_session(
        &self,
        ref_or_slug: &str,
        requested_profile: &str,
        user_agent: &str,
    ) -> Result<Arc<HlsSession>> {
        let (service_ref, channel) = self.resolve_channel(ref_or_slug)?;

        // Resolve the profile for keying; the session re-resolves with the
        // capability record at start, which never changes name/container.
        let spec = profile::resolve(
            requested_profile,
            user_agent,
            self.deps.hls.dvr_window_size * self.deps.hls.segment_duration,
            None,
            self.deps.hls.has_gpu,
            &self.deps.hls.hwaccel_mode,
        );
        let key = SessionKey::new(&service_ref, &spec.name, spec.container);

        let lock = self
            .create_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Clone out of the map before inserting; holding a map reference
        // across the insert would deadlock on the shard.
        let existing = self.sessions.get(&key).map(|entry| entry.value().clone());
        let session = match existing {
            Some(existing)
                if !matches!(
                    existing.state(),
                    SessionState::Stopping | SessionState::Stopped
                ) =>
            {
                existing
            }
            _ => {
                let session = Arc::new(HlsSession::new(
                    key.clone(),
                    channel,
                    user_agent.to_string(),
                    self.deps.clone(),
                ));
                self.sessions.insert(key.clone(), session.clone());
                debug!(session = %key, "hls session created");
                session
            }
        };

        // The first caller drives the whole start; later callers no-op
        // through start() and wait on the shared readiness signal.
        let started = match session.start().await {
            Ok(()) => {
                session
                    .wait_ready(self.deps.runner.config().start_timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            self.sessions
                .remove_if(&key, |_, s| Arc::ptr_eq(s, &session));
            session.stop().await;
            return Err(e);
        }

        Ok(session)
    }

    /// Find the live session serving `service_ref` for a segment request.
    ///
    /// Segment URLs carry no profile, but the filenames carry the session
    /// nonce; prefer the nonce owner, fall back to any live session of the
    /// reference.
    pub fn find_session(&self, service_ref: &str, segment: &str) -> Option<Arc<HlsSession>> {
        let service_ref = normalize_ref(service_ref);
        let mut fallback = None;

        for entry in self.sessions.iter() {
            if entry.key().service_ref != service_ref {
                continue;
            }
            let session = entry.value().clone();
            if matches!(
                session.state(),
                SessionState::Stopping | SessionState::Stopped
            ) {
                continue;
            }
            if segment.starts_with(&format!("seg_{}_", session.nonce())) {
                return Some(session);
            }
            fallback.get_or_insert(session);
        }

        fallback
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic eviction: stop idle sessions, drop stopped ones, and clear
    /// zombie workdirs left by crashed processes.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                manager.sweep().await;
            }
        });
    }

    async fn sweep(&self) {
        let max_idle = self.deps.hls.max_idle;
        let mut to_stop = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value().clone();
            match session.state() {
                SessionState::Stopped => {
                    to_stop.push((entry.key().clone(), session, false));
                }
                SessionState::Idle => {
                    if session.is_idle(max_idle) {
                        to_stop.push((entry.key().clone(), session, true));
                    }
                }
                _ => {}
            }
        }

        for (key, session, stop) in to_stop {
            if stop {
                info!(session = %key, "evicting idle session");
                session.stop().await;
            }
            self.sessions.remove_if(&key, |_, s| Arc::ptr_eq(s, &session));
        }

        self.remove_zombie_workdirs().await;
    }

    /// Remove directories under the work root that no live session owns.
    async fn remove_zombie_workdirs(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.deps.hls.work_root).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let owned = self
                .sessions
                .iter()
                .any(|s| s.value().workdir() == path.as_path());
            if !owned {
                debug!(path = %path.display(), "removing zombie workdir");
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!(path = %path.display(), error = %e, "zombie workdir removal failed");
                }
            }
        }
    }

    /// Stop everything, bounded.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        let stop_all = futures::future::join_all(sessions.iter().map(|s| s.stop()));
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, stop_all).await.is_err() {
            warn!("session shutdown exceeded its bound");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::hls::session::tests::{
        FAKE_FFMPEG_OK, TECH_REF, session_deps, spawn_fake_receiver, write_script,
    };
    use tokio_util::sync::CancellationToken;

    async fn manager() -> (Arc<HlsManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let channels = Arc::new(ChannelMap::new(dir.path().join("channels.m3u")));
        (Arc::new(HlsManager::new(deps, channels)), dir)
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_session() {
        let (manager, _dir) = manager().await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.start_session(TECH_REF, "high", "vlc").await
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().expect("start succeeds"));
        }

        assert_eq!(manager.session_count(), 1, "one session per key");
        for pair in sessions.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_start_clears_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), crate::hls::session::tests::FAKE_FFMPEG_DIES);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;
        let channels = Arc::new(ChannelMap::new(dir.path().join("channels.m3u")));
        let manager = Arc::new(HlsManager::new(deps, channels));

        assert!(manager.start_session(TECH_REF, "high", "vlc").await.is_err());
        assert_eq!(manager.session_count(), 0, "failed session evicted");
    }

    #[tokio::test]
    async fn segment_lookup_prefers_the_nonce_owner() {
        let (manager, _dir) = manager().await;
        let session = manager.start_session(TECH_REF, "high", "vlc").await.unwrap();

        let caller = CancellationToken::new();
        let playlist = String::from_utf8(session.serve_playlist(&caller).await.unwrap()).unwrap();
        let segment = playlist
            .lines()
            .find(|l| l.starts_with("seg_"))
            .unwrap()
            .to_string();

        let found = manager.find_session(TECH_REF, &segment).expect("found");
        assert!(Arc::ptr_eq(&found, &session));
        assert!(manager.find_session("1:0:19:FFFF", &segment).is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_slug_is_refused() {
        let (manager, _dir) = manager().await;
        let result = manager.start_session("no-such-channel", "high", "vlc").await;
        assert!(matches!(result, Err(Error::ChannelNotFound(_))));
    }
}
