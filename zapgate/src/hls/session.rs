//! One HLS session: a transcoder child, its workdir, and its lifecycle.
//!
//! A session is created per `(service, profile, container)` and shared by
//! every viewer of that combination. Start zaps the receiver, proves
//! readiness, spawns ffmpeg, and only reports success once the playlist
//! and the initial segments exist on disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::CapabilityStore;
use crate::config::HlsConfig;
use crate::metrics::MetricsCollector;
use crate::profile::args::{ArgsRequest, INIT_SEGMENT_NAME, PLAYLIST_NAME, build_args};
use crate::profile::{self, Container, ProfileSpec};
use crate::receiver::{ReadinessChecker, ReceiverClient, ZapResolver};
use crate::runner::{Handle, Runner, RunnerSpec, classify_ffmpeg_tail};
use crate::utils::fs::{reset_dir, secure_join, wait_for_file};
use crate::utils::url::extract_service_ref;
use crate::{Error, Result};

/// Segment-watcher poll cadence.
const SEGMENT_WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// How long a missing segment request waits before 404.
const SEGMENT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const SEGMENT_WAIT_POLL: Duration = Duration::from_millis(100);

/// Playlist stability window and read budget.
const PLAYLIST_STABILITY_WINDOW: Duration = Duration::from_millis(150);
const PLAYLIST_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Playlist-mtime watchdog: cadence and tolerated consecutive stalls.
const PLAYLIST_WATCH_INTERVAL: Duration = Duration::from_secs(2);
const PLAYLIST_WATCH_MAX_STALLS: u32 = 5;

/// Identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub service_ref: String,
    pub profile: String,
    pub container: Container,
}

impl SessionKey {
    pub fn new(service_ref: &str, profile: &str, container: Container) -> Self {
        Self {
            service_ref: normalize_ref(service_ref),
            profile: profile.to_string(),
            container,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.service_ref,
            self.profile,
            self.container.as_str()
        )
    }
}

/// Normalize a service reference for keying.
pub fn normalize_ref(service_ref: &str) -> String {
    service_ref.trim().trim_matches('/').to_string()
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
}

/// Readiness signal value; one channel per start cycle.
#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Everything a session borrows from the application.
#[derive(Clone)]
pub struct SessionDeps {
    pub runner: Runner,
    pub resolver: Arc<ZapResolver>,
    pub readiness: Arc<ReadinessChecker<ReceiverClient>>,
    pub store: Arc<dyn CapabilityStore>,
    pub metrics: Arc<MetricsCollector>,
    pub hls: HlsConfig,
}

/// A live (or starting, or stopped) HLS session.
pub struct HlsSession {
    key: SessionKey,
    /// Channel URL or raw reference handed to the zap pipeline.
    channel: String,
    user_agent: String,
    workdir: PathBuf,
    deps: SessionDeps,

    cancel: CancellationToken,
    started: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,

    ready_tx: Mutex<watch::Sender<ReadyState>>,
    ready_rx: Mutex<watch::Receiver<ReadyState>>,

    handle: Mutex<Option<Arc<Handle>>>,
    nonce: Mutex<String>,
    last_access: Mutex<Instant>,
    started_at: Mutex<Instant>,
    exit_label: Mutex<Option<String>>,
    profile_spec: Mutex<Option<ProfileSpec>>,
}

impl HlsSession {
    pub fn new(key: SessionKey, channel: String, user_agent: String, deps: SessionDeps) -> Self {
        let workdir = deps.hls.work_root.join(workdir_name(&key));
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);

        Self {
            key,
            channel,
            user_agent,
            workdir,
            deps,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            ready_tx: Mutex::new(ready_tx),
            ready_rx: Mutex::new(ready_rx),
            handle: Mutex::new(None),
            nonce: Mutex::new(String::new()),
            last_access: Mutex::new(Instant::now()),
            started_at: Mutex::new(Instant::now()),
            exit_label: Mutex::new(None),
            profile_spec: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn workdir(&self) -> &std::path::Path {
        &self.workdir
    }

    /// Current lifecycle state; `Idle` overlays `Running` once the session
    /// has had no viewer access for the configured window.
    pub fn state(&self) -> SessionState {
        if self.stopped.load(Ordering::SeqCst) {
            return SessionState::Stopped;
        }
        if self.stopping.load(Ordering::SeqCst) {
            return SessionState::Stopping;
        }
        match &*self.ready_rx.lock().borrow() {
            ReadyState::Ready => {
                if self.is_idle(self.deps.hls.max_idle) {
                    SessionState::Idle
                } else {
                    SessionState::Running
                }
            }
            _ => SessionState::Starting,
        }
    }

    /// Record a viewer access.
    pub fn update_access(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// No viewer access within `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_access.lock().elapsed() > timeout
    }

    /// Run the start protocol. No-op when already started; an error when
    /// the session is stopping. The first caller drives the whole pipeline
    /// and returns only once the playlist is ready (or the start failed).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return Err(Error::session("profile is stopping"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.start_inner().await {
            Ok(()) => self.wait_ready(self.deps.runner.config().start_timeout).await,
            Err(e) => {
                self.fail_ready(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        // Fresh one-shot readiness signal and nonce for this start cycle.
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        *self.ready_tx.lock() = ready_tx;
        *self.ready_rx.lock() = ready_rx;
        *self.started_at.lock() = Instant::now();
        let nonce = short_nonce();
        *self.nonce.lock() = nonce.clone();

        reset_dir(&self.workdir).await?;

        // Zap and prove the stream delivers bytes.
        let resolved = self
            .deps
            .resolver
            .zap_and_resolve(&self.channel, &self.cancel)
            .await?;

        // The invariant check keys on the technical reference embedded in
        // the resolved URL, independent of any slug the viewer used.
        let tech_ref =
            extract_service_ref(&resolved.url).unwrap_or_else(|| self.key.service_ref.clone());

        let outcome = self.deps.readiness.wait_ready(&tech_ref, &self.cancel).await;
        self.deps.metrics.readiness_outcome(outcome.label());
        if !outcome.is_ready() {
            return Err(Error::Readiness(format!(
                "receiver not ready for {tech_ref}: {}",
                outcome.label()
            )));
        }

        if let Err(e) = self.deps.readiness.check_invariant(&tech_ref).await {
            self.deps.metrics.readiness_outcome("ref_mismatch");
            return Err(e);
        }

        // Freeze the codec decision now that the capability is known.
        let capability = self.deps.store.get(&tech_ref).await.ok().flatten();
        let spec = profile::resolve(
            &self.key.profile,
            &self.user_agent,
            self.deps.hls.dvr_window_size * self.deps.hls.segment_duration,
            capability.as_ref(),
            self.deps.hls.has_gpu,
            &self.deps.hls.hwaccel_mode,
        );

        let args = build_args(&ArgsRequest {
            input: &resolved.url,
            profile: &spec,
            segment_duration: self.deps.hls.segment_duration,
            dvr_window_size: self.deps.hls.dvr_window_size,
            nonce: &nonce,
            program_id: resolved.program_id,
            vaapi_device: &self.deps.hls.vaapi_device,
            force_aac: self.deps.hls.force_aac,
            aac_bitrate_k: self.deps.hls.aac_bitrate_k,
        });

        let runner_spec = RunnerSpec {
            input: resolved.url.clone(),
            work_dir: self.workdir.clone(),
            output_name: PLAYLIST_NAME.to_string(),
            args,
            profile: spec.clone(),
        };

        let handle = Arc::new(self.deps.runner.start(&runner_spec).await?);
        *self.profile_spec.lock() = Some(spec);
        *self.handle.lock() = Some(handle.clone());
        self.deps.metrics.session_started();

        info!(
            session = %self.key,
            input = %resolved.url,
            nonce = %nonce,
            "hls session started"
        );

        self.spawn_waiter(handle.clone());
        self.spawn_segment_watcher(handle);

        Ok(())
    }

    /// Waiter: single receive of the process exit, metrics + diagnostics.
    fn spawn_waiter(self: &Arc<Self>, handle: Arc<Handle>) {
        let session = self.clone();
        tokio::spawn(async move {
            let info = handle.wait().await;

            let watchdog = handle.watchdog_state();
            let tail = handle.diagnostics();
            let label = if watchdog.is_fatal() {
                watchdog.as_str().to_string()
            } else if info.code == Some(0) {
                "clean".to_string()
            } else {
                classify_ffmpeg_tail(tail.iter().map(String::as_str))
                    .as_str()
                    .to_string()
            };

            info!(
                session = %session.key,
                exit_code = ?info.code,
                label = %label,
                stderr_tail = %tail.join(" | "),
                "transcoder exited"
            );

            *session.exit_label.lock() = Some(label.clone());
            session.deps.metrics.session_exited(&label);
            session.fail_ready("ffmpeg exited before playlist ready".to_string());
        });
    }

    /// Segment watcher: close the readiness signal once the playlist and
    /// the initial segments exist with non-zero size.
    fn spawn_segment_watcher(self: &Arc<Self>, handle: Arc<Handle>) {
        let session = self.clone();
        tokio::spawn(async move {
            let done = handle.done();
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = done.cancelled() => return,
                    _ = tokio::time::sleep(SEGMENT_WATCH_INTERVAL) => {}
                }

                if session.output_ready().await {
                    let startup = session.started_at.lock().elapsed();
                    session
                        .deps
                        .metrics
                        .session_ready(startup.as_millis() as u64);
                    session.update_access();
                    session.ready_tx.lock().send_if_modified(|state| {
                        if matches!(state, ReadyState::Pending) {
                            *state = ReadyState::Ready;
                            true
                        } else {
                            false
                        }
                    });
                    info!(
                        session = %session.key,
                        startup_ms = startup.as_millis() as u64,
                        "hls session ready"
                    );
                    session.spawn_playlist_watchdog();
                    return;
                }
            }
        });
    }

    /// Ready condition: non-empty playlist, init segment for fmp4, and the
    /// configured number of non-empty media segments for this nonce.
    async fn output_ready(&self) -> bool {
        let playlist = self.workdir.join(PLAYLIST_NAME);
        if !file_non_empty(&playlist).await {
            return false;
        }

        if self.key.container != Container::Ts
            && !file_non_empty(&self.workdir.join(INIT_SEGMENT_NAME)).await
        {
            return false;
        }

        let prefix = format!("seg_{}_", self.nonce.lock().clone());
        let mut count = 0u32;
        let Ok(mut entries) = tokio::fs::read_dir(&self.workdir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix)
                && let Ok(meta) = entry.metadata().await
                && meta.len() > 0
            {
                count += 1;
            }
        }

        count >= self.deps.hls.startup_segments.max(1)
    }

    /// Playlist-mtime watchdog: a stalled playlist means ffmpeg is wedged
    /// even though the process lives; stop the session, do not raw-kill.
    fn spawn_playlist_watchdog(self: &Arc<Self>) {
        let session = self.clone();
        let done = self
            .handle
            .lock()
            .as_ref()
            .map(|h| h.done())
            .unwrap_or_else(CancellationToken::new);

        tokio::spawn(async move {
            let playlist = session.workdir.join(PLAYLIST_NAME);
            let mut last_mtime = None;
            let mut stalls = 0u32;

            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = done.cancelled() => return,
                    _ = tokio::time::sleep(PLAYLIST_WATCH_INTERVAL) => {}
                }

                let mtime = tokio::fs::metadata(&playlist)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());

                if mtime.is_some() && mtime != last_mtime {
                    last_mtime = mtime;
                    stalls = 0;
                    continue;
                }

                stalls += 1;
                if stalls > PLAYLIST_WATCH_MAX_STALLS {
                    warn!(session = %session.key, "playlist stopped updating, stopping session");
                    session.stop().await;
                    return;
                }
            }
        });
    }

    fn fail_ready(&self, message: String) {
        self.ready_tx.lock().send_if_modified(|state| {
            if matches!(state, ReadyState::Pending) {
                *state = ReadyState::Failed(message.clone());
                true
            } else {
                false
            }
        });
    }

    /// Wait for the readiness signal of the current start cycle.
    ///
    /// A stop or a child exit before readiness surfaces as an error here.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready_rx.lock().clone();

        let result = tokio::time::timeout(timeout, async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ReadyState::Ready => return Ok(()),
                    ReadyState::Failed(message) => return Err(Error::Session(message)),
                    ReadyState::Pending => {}
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::session("stopped before ready"));
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(Error::session("stopped before ready"));
                        }
                    }
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(format!(
                "session {} not ready within {timeout:?}",
                self.key
            ))),
        }
    }

    /// Stop the session: idempotent, re-entrant, process-group reap, then
    /// workdir removal.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            // Another task is stopping; wait for the reap, bounded.
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                let config = self.deps.runner.config();
                let _ = tokio::time::timeout(
                    config.stop_grace + config.stop_kill,
                    handle.done().cancelled(),
                )
                .await;
            }
            return;
        }

        debug!(session = %self.key, "stopping hls session");
        self.cancel.cancel();
        self.fail_ready("stopped before ready".to_string());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let config = self.deps.runner.config();
            handle.stop(config.stop_grace, config.stop_kill).await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.workdir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(session = %self.key, error = %e, "failed to remove workdir");
        }

        self.stopped.store(true, Ordering::SeqCst);
        info!(session = %self.key, "hls session stopped");
    }

    /// Serve the playlist: stable read plus the Safari DVR rewrite for the
    /// fmp4 family.
    pub async fn serve_playlist(&self, caller: &CancellationToken) -> Result<Vec<u8>> {
        self.update_access();

        let cancel = linked_token(caller, &self.cancel);
        let bytes = super::playlist::read_stable_file(
            &self.workdir.join(PLAYLIST_NAME),
            PLAYLIST_STABILITY_WINDOW,
            PLAYLIST_READ_TIMEOUT,
            &cancel,
        )
        .await?;

        if self.key.container == Container::Ts {
            return Ok(bytes);
        }

        let text = String::from_utf8_lossy(&bytes);
        let offset = self.deps.hls.startup_segments.max(2) * self.deps.hls.segment_duration;
        Ok(super::playlist::rewrite_for_dvr(&text, offset).into_bytes())
    }

    /// Serve one segment; waits briefly for segments ffmpeg has announced
    /// in the playlist but not yet flushed.
    pub async fn serve_segment(&self, name: &str, caller: &CancellationToken) -> Result<Vec<u8>> {
        self.update_access();

        let path = secure_join(&self.workdir, name)?;
        let cancel = linked_token(caller, &self.cancel);
        wait_for_file(&path, SEGMENT_WAIT_TIMEOUT, SEGMENT_WAIT_POLL, &cancel).await?;

        Ok(tokio::fs::read(&path).await?)
    }

    /// Segment duration, for cache headers.
    pub fn segment_duration(&self) -> u32 {
        self.deps.hls.segment_duration
    }

    /// Nonce of the current start cycle; embedded in segment filenames.
    pub fn nonce(&self) -> String {
        self.nonce.lock().clone()
    }

    /// Exit label of the last transcoder run, if it has exited.
    pub fn exit_label(&self) -> Option<String> {
        self.exit_label.lock().clone()
    }

    /// The frozen codec decision of the current start cycle.
    pub fn profile(&self) -> Option<ProfileSpec> {
        self.profile_spec.lock().clone()
    }
}

async fn file_non_empty(path: &std::path::Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0)
}

/// Token that fires when either input fires.
fn linked_token(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let combined = CancellationToken::new();
    let out = combined.clone();
    let a = a.clone();
    let b = b.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = a.cancelled() => {}
            _ = b.cancelled() => {}
        }
        combined.cancel();
    });
    out
}

/// Short random nonce for segment filenames.
fn short_nonce() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Filesystem-safe workdir name for a key.
fn workdir_name(key: &SessionKey) -> String {
    let mut name = String::with_capacity(key.service_ref.len() + key.profile.len() + 8);
    for c in key.service_ref.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else {
            name.push('_');
        }
    }
    name.push('-');
    name.push_str(&key.profile);
    name.push('-');
    name.push_str(key.container.as_str());
    name
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::capability::MemoryCapabilityStore;
    use crate::config::{ReadinessConfig, RunnerConfig, ZapConfig};
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::TcpListener;

    pub(crate) const TECH_REF: &str = "1:0:19:132F:3EF:1:C00000:0:0:0:";

    #[derive(Clone)]
    struct FakeReceiverState {
        stream_port: u16,
    }

    async fn zap_handler(State(state): State<FakeReceiverState>) -> String {
        format!(
            "#EXTM3U\n#EXTVLCOPT:program=108\nhttp://127.0.0.1:{}/stream?ref={}\n",
            state.stream_port,
            urlencoding::encode(TECH_REF)
        )
    }

    async fn status_handler() -> (StatusCode, String) {
        (
            StatusCode::OK,
            format!(
                r#"{{"currservice_serviceref":"{TECH_REF}","snr":68,"inStandby":"false","vpid":1101,"pmtpid":110}}"#
            ),
        )
    }

    async fn stream_handler() -> (StatusCode, Vec<u8>) {
        (StatusCode::OK, vec![0x47, 0x40, 0x00])
    }

    /// In-process receiver: zap + status + stream port in one app.
    pub(crate) async fn spawn_fake_receiver() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = FakeReceiverState {
            stream_port: addr.port(),
        };

        let app = Router::new()
            .route("/web/stream.m3u", get(zap_handler))
            .route("/api/statusinfo", get(status_handler))
            .route("/stream", get(stream_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://127.0.0.1:{}", addr.port())
    }

    /// A fake transcoder: parses -hls_segment_filename from its argv,
    /// writes a playlist + init + segments, then idles emitting progress.
    pub(crate) const FAKE_FFMPEG_OK: &str = r#"#!/bin/sh
pat="seg_x_%05d.m4s"
prev=""
for a in "$@"; do
  [ "$prev" = "-hls_segment_filename" ] && pat="$a"
  prev="$a"
done
printf '#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n' > playlist.m3u8
printf 'init' > init.mp4
i=0
while [ $i -lt 3 ]; do
  printf 'segmentdata' > "$(printf "$pat" $i)"
  printf '#EXTINF:4.000000,\n%s\n' "$(printf "$pat" $i)" >> playlist.m3u8
  i=$((i+1))
done
n=0
while [ $n -lt 100 ]; do
  echo "out_time_ms=$(( (n+1) * 400000 ))" >&2
  touch playlist.m3u8
  sleep 1
  n=$((n+1))
done
"#;

    pub(crate) const FAKE_FFMPEG_DIES: &str = "#!/bin/sh\nsleep 0.2\nexit 1\n";

    pub(crate) fn write_script(dir: &std::path::Path, content: &str) -> PathBuf {
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, content).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn fast_runner_config() -> RunnerConfig {
        RunnerConfig {
            start_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            stop_kill: Duration::from_millis(500),
            ..Default::default()
        }
    }

    pub(crate) fn fast_zap_config() -> ZapConfig {
        ZapConfig {
            zap_delay: Duration::from_millis(10),
            stream_probe_timeout: Duration::from_secs(2),
            stream_probe_attempt: Duration::from_millis(300),
            stream_probe_retry_delay: Duration::from_millis(30),
            web_zap_timeout: Duration::from_secs(2),
        }
    }

    pub(crate) fn fast_readiness_config() -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            poll_jitter: Duration::from_millis(1),
            max_polls: 20,
            debounce_polls: 2,
        }
    }

    pub(crate) async fn session_deps(
        api_base: &str,
        ffmpeg: PathBuf,
        work_root: PathBuf,
    ) -> SessionDeps {
        let client = ReceiverClient::new(api_base).unwrap();

        SessionDeps {
            runner: Runner::new(ffmpeg, fast_runner_config()),
            resolver: Arc::new(ZapResolver::new(client.clone(), fast_zap_config()).unwrap()),
            readiness: Arc::new(ReadinessChecker::new(
                Arc::new(client),
                fast_readiness_config(),
            )),
            store: Arc::new(MemoryCapabilityStore::new()),
            metrics: Arc::new(MetricsCollector::new()),
            hls: HlsConfig {
                work_root,
                startup_segments: 3,
                max_idle: Duration::from_secs(60),
                ..Default::default()
            },
        }
    }

    fn test_key() -> SessionKey {
        SessionKey::new(TECH_REF, "safari", Container::Fmp4)
    }

    #[tokio::test]
    async fn start_serves_playlist_and_segments() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            "Safari".to_string(),
            deps,
        ));

        session.start().await.expect("session becomes ready");
        assert_eq!(session.state(), SessionState::Running);

        let caller = CancellationToken::new();
        let playlist = session.serve_playlist(&caller).await.unwrap();
        let text = String::from_utf8(playlist).unwrap();
        assert!(text.contains("#EXT-X-START:TIME-OFFSET=-"));
        assert!(text.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));

        // The playlist names real segments we can fetch.
        let segment_name = text
            .lines()
            .find(|l| l.starts_with("seg_"))
            .expect("segment listed")
            .to_string();
        let segment = session.serve_segment(&segment_name, &caller).await.unwrap();
        assert!(!segment.is_empty());

        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.workdir().exists(), "workdir removed on stop");
    }

    #[tokio::test]
    async fn start_fails_fast_when_child_dies() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_DIES);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            "Safari".to_string(),
            deps,
        ));

        let started = Instant::now();
        let err = session.start().await.expect_err("start must fail");
        assert!(
            err.to_string().contains("exited before playlist ready"),
            "unexpected error: {err}"
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            String::new(),
            deps,
        ));

        session.start().await.unwrap();
        session.start().await.expect("second start no-ops");
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_from_concurrent_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            String::new(),
            deps,
        ));
        session.start().await.unwrap();

        let s1 = session.clone();
        let first = tokio::spawn(async move { s1.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let s2 = session.clone();
        let second = tokio::spawn(async move { s2.stop().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("both stops return");

        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_ready_fails_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            String::new(),
            deps,
        ));

        // Waiter blocks on a session that never starts; stop releases it.
        let waiter = session.clone();
        let wait = tokio::spawn(async move { waiter.wait_ready(Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap()
            .unwrap();
        let err = result.expect_err("stopped before ready");
        assert!(err.to_string().contains("stopped before ready"));
    }

    #[tokio::test]
    async fn start_on_stopping_session_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            String::new(),
            deps,
        ));
        session.stop().await;

        let err = session.start().await.expect_err("stopping refuses start");
        assert!(err.to_string().contains("stopping"));
    }

    #[tokio::test]
    async fn segment_requests_reject_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), FAKE_FFMPEG_OK);
        let api_base = spawn_fake_receiver().await;
        let deps = session_deps(&api_base, script, dir.path().join("work")).await;

        let session = Arc::new(HlsSession::new(
            test_key(),
            TECH_REF.to_string(),
            String::new(),
            deps,
        ));

        let caller = CancellationToken::new();
        assert!(session.serve_segment("../etc/passwd", &caller).await.is_err());
        assert!(session.serve_segment("a/b.ts", &caller).await.is_err());
    }

    #[test]
    fn idle_tracking() {
        let key = test_key();
        assert_eq!(key.service_ref, TECH_REF);
        assert_eq!(normalize_ref(" 1:0:19: "), "1:0:19:");
        assert_eq!(normalize_ref("/das-erste-hd/"), "das-erste-hd");
    }
}
