//! Gateway configuration.
//!
//! Every knob lives in a typed struct injected at construction; nothing
//! reads the environment after startup. `from_env_or_default` constructors
//! layer environment variables over the defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_duration_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

/// HTTP front-end and admission settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent streaming sessions; 0 disables admission control.
    pub max_concurrent_streams: usize,
    /// Per-request idle timeout; zero disables the idle monitor.
    pub idle_timeout: Duration,
    /// On transcode failure, fall back to the direct reverse proxy instead
    /// of answering 502.
    pub transcode_fail_open: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 18090,
            max_concurrent_streams: 0,
            idle_timeout: Duration::ZERO,
            transcode_fail_open: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_string("BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some(v) = env_parse("PORT") {
            config.port = v;
        }
        if let Some(v) = env_parse("MAX_CONCURRENT_STREAMS") {
            config.max_concurrent_streams = v;
        }
        if let Some(v) = env_duration_secs("IDLE_TIMEOUT_SECS") {
            config.idle_timeout = v;
        }
        if let Some(v) = env_bool("TRANSCODE_FAIL_OPEN") {
            config.transcode_fail_open = v;
        }
        config
    }
}

/// Upstream receiver endpoints and the proxy allowlist.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the receiver's web API, e.g. `http://receiver.lan`.
    pub api_base: String,
    /// Authorities (`host:port`, lowercased, explicit port) a resolved
    /// stream URL may point at. Requests outside this set are rejected
    /// before any outbound I/O.
    pub allowed_authorities: Vec<String>,
    /// Playlist file with the channel lineup.
    pub playlist_path: PathBuf,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "http://receiver.lan".to_string(),
            allowed_authorities: Vec::new(),
            playlist_path: PathBuf::from("channels.m3u"),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_string("UPSTREAM_API_BASE") {
            config.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env_string("UPSTREAM_ALLOWED") {
            config.allowed_authorities = v
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_string("PLAYLIST_PATH") {
            config.playlist_path = PathBuf::from(v);
        }
        config
    }
}

/// Zap & stream-probe budgets.
#[derive(Debug, Clone)]
pub struct ZapConfig {
    /// Fixed settle delay after a web zap. Encrypted channels need the
    /// receiver a few seconds before the descrambled TS flows.
    pub zap_delay: Duration,
    /// Overall budget for proving the stream port delivers bytes.
    pub stream_probe_timeout: Duration,
    /// Per-attempt budget for a single ranged GET.
    pub stream_probe_attempt: Duration,
    /// Base delay between probe attempts (jittered).
    pub stream_probe_retry_delay: Duration,
    /// Budget for the web-zap HTTP call itself.
    pub web_zap_timeout: Duration,
}

impl Default for ZapConfig {
    fn default() -> Self {
        Self {
            zap_delay: Duration::from_secs(5),
            stream_probe_timeout: Duration::from_secs(20),
            stream_probe_attempt: Duration::from_secs(3),
            stream_probe_retry_delay: Duration::from_millis(500),
            web_zap_timeout: Duration::from_secs(10),
        }
    }
}

impl ZapConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_duration_ms("ZAP_DELAY_MS") {
            config.zap_delay = v;
        }
        if let Some(v) = env_duration_ms("STREAM_PROBE_TIMEOUT_MS") {
            config.stream_probe_timeout = v;
        }
        if let Some(v) = env_duration_ms("STREAM_PROBE_ATTEMPT_MS") {
            config.stream_probe_attempt = v;
        }
        if let Some(v) = env_duration_ms("STREAM_PROBE_RETRY_DELAY_MS") {
            config.stream_probe_retry_delay = v;
        }
        config
    }
}

/// Readiness poll loop shape.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Base poll interval.
    pub poll_interval: Duration,
    /// Symmetric jitter applied to each interval.
    pub poll_jitter: Duration,
    /// Maximum polls before giving up.
    pub max_polls: u32,
    /// Consecutive successful polls required before declaring ready.
    pub debounce_polls: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            poll_jitter: Duration::from_millis(100),
            max_polls: 30,
            debounce_polls: 2,
        }
    }
}

/// Transcoder child lifecycle deadlines.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the ffmpeg binary; resolved at startup.
    pub ffmpeg_path: PathBuf,
    /// No meaningful progress from spawn within this window kills the child.
    pub start_timeout: Duration,
    /// No meaningful progress while running within this window kills it.
    pub stall_timeout: Duration,
    /// TERM-to-KILL escalation grace.
    pub stop_grace: Duration,
    /// Wait after KILL before giving up on the reap.
    pub stop_kill: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            start_timeout: Duration::from_secs(20),
            stall_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(3),
            stop_kill: Duration::from_secs(2),
        }
    }
}

impl RunnerConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_string("FFMPEG_PATH") {
            config.ffmpeg_path = PathBuf::from(v);
        }
        if let Some(v) = env_duration_secs("START_TIMEOUT_SECS") {
            config.start_timeout = v;
        }
        if let Some(v) = env_duration_secs("STALL_TIMEOUT_SECS") {
            config.stall_timeout = v;
        }
        config
    }

    /// Resolve the configured ffmpeg path to something executable.
    ///
    /// Tries the configured value, then `PATH`, then conventional install
    /// locations. Fails closed: a gateway without ffmpeg cannot serve HLS.
    pub fn resolve_ffmpeg(&self) -> Result<PathBuf> {
        let candidates = [
            self.ffmpeg_path.clone(),
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
        ];

        for candidate in &candidates {
            if candidate.is_absolute() {
                if candidate.is_file() {
                    return Ok(candidate.clone());
                }
                continue;
            }

            // Relative name: consult PATH.
            if let Some(paths) = std::env::var_os("PATH") {
                for dir in std::env::split_paths(&paths) {
                    let full = dir.join(candidate);
                    if full.is_file() {
                        return Ok(full);
                    }
                }
            }
        }

        Err(Error::config(format!(
            "ffmpeg binary not found (configured: {})",
            self.ffmpeg_path.display()
        )))
    }
}

/// HLS session shape.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Root under which every session creates its exclusive workdir.
    pub work_root: PathBuf,
    /// Target segment duration in seconds.
    pub segment_duration: u32,
    /// Segments kept in the live window.
    pub dvr_window_size: u32,
    /// Segments required before the session reports ready.
    pub startup_segments: u32,
    /// Always transcode audio to AAC.
    pub force_aac: bool,
    /// AAC bitrate in kbit/s.
    pub aac_bitrate_k: u32,
    /// Enable the HEVC profile family.
    pub hevc_enabled: bool,
    /// VAAPI render device for hardware encodes.
    pub vaapi_device: String,
    /// Evict a session with no viewer access for this long.
    pub max_idle: Duration,
    /// Hardware acceleration policy: auto, force, off.
    pub hwaccel_mode: String,
    /// A GPU capable encoder is present.
    pub has_gpu: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("zapgate-hls"),
            segment_duration: 4,
            dvr_window_size: 180,
            startup_segments: 3,
            force_aac: true,
            aac_bitrate_k: 160,
            hevc_enabled: false,
            vaapi_device: "/dev/dri/renderD128".to_string(),
            max_idle: Duration::from_secs(60),
            hwaccel_mode: "auto".to_string(),
            has_gpu: false,
        }
    }
}

impl HlsConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_string("HLS_WORK_ROOT") {
            config.work_root = PathBuf::from(v);
        }
        if let Some(v) = env_parse("HLS_SEGMENT_DURATION") {
            config.segment_duration = v;
        }
        if let Some(v) = env_parse("HLS_DVR_WINDOW_SIZE") {
            config.dvr_window_size = v;
        }
        if let Some(v) = env_parse("HLS_STARTUP_SEGMENTS") {
            config.startup_segments = v;
        }
        if let Some(v) = env_bool("HLS_FORCE_AAC") {
            config.force_aac = v;
        }
        if let Some(v) = env_parse("HLS_AAC_BITRATE_K") {
            config.aac_bitrate_k = v;
        }
        if let Some(v) = env_bool("HLS_HEVC_ENABLED") {
            config.hevc_enabled = v;
        }
        if let Some(v) = env_string("VAAPI_DEVICE") {
            config.vaapi_device = v;
        }
        if let Some(v) = env_duration_secs("HLS_MAX_IDLE_SECS") {
            config.max_idle = v;
        }
        if let Some(v) = env_string("HWACCEL_MODE") {
            config.hwaccel_mode = v;
        }
        if let Some(v) = env_bool("HAS_GPU") {
            config.has_gpu = v;
        }
        config
    }
}

/// Capability store backend selection and scan pacing.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    /// Backend name: `memory` or `sqlite`. Unknown names fail closed.
    pub backend: String,
    /// SQLite database URL for the durable backend.
    pub database_url: String,
    /// Delay between scan probes.
    pub probe_delay: Duration,
    /// Hard per-attempt probe timeout.
    pub probe_timeout: Duration,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database_url: "sqlite:zapgate.db?mode=rwc".to_string(),
            probe_delay: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(8),
        }
    }
}

impl CapabilityConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_string("CAPABILITY_BACKEND") {
            config.backend = v;
        }
        if let Some(v) = env_string("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = env_duration_ms("SCAN_PROBE_DELAY_MS") {
            config.probe_delay = v;
        }
        config
    }
}

/// The full gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub zap: ZapConfig,
    pub readiness: ReadinessConfig,
    pub runner: RunnerConfig,
    pub hls: HlsConfig,
    pub capability: CapabilityConfig,
}

impl GatewayConfig {
    pub fn from_env_or_default() -> Self {
        Self {
            server: ServerConfig::from_env_or_default(),
            upstream: UpstreamConfig::from_env_or_default(),
            zap: ZapConfig::from_env_or_default(),
            readiness: ReadinessConfig::default(),
            runner: RunnerConfig::from_env_or_default(),
            hls: HlsConfig::from_env_or_default(),
            capability: CapabilityConfig::from_env_or_default(),
        }
    }
}
