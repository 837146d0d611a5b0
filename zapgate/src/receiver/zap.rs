//! Zap & resolve: drive the receiver to a channel and prove the stream
//! port actually delivers bytes.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ReceiverClient;
use crate::config::ZapConfig;
use crate::utils::time::{jittered, sleep_cancellable};
use crate::utils::url::{extract_service_ref, rebuild_port_8001};
use crate::{Error, Result};

/// Result of a successful zap + probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    /// Stream URL that answered the probe.
    pub url: String,
    /// Program hint parsed from the mini playlist, if any.
    pub program_id: Option<u32>,
}

/// Parse the receiver's mini playlist.
///
/// The stream URL is the first non-comment line that starts with `http`.
/// A `#EXTVLCOPT:` line may carry a `program=<int>` hint.
pub fn parse_mini_playlist(body: &str) -> (Option<String>, Option<u32>) {
    let mut stream_url = None;
    let mut program_id = None;

    for line in body.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("#EXTVLCOPT:") {
            if let Some(idx) = rest.find("program=") {
                let value = &rest[idx + "program=".len()..];
                let end = value
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(value.len());
                program_id = value[..end].parse().ok();
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        if stream_url.is_none() && line.starts_with("http") {
            stream_url = Some(line.to_string());
        }
    }

    (stream_url, program_id)
}

/// Zap pipeline: web zap, settle delay, probe with fallbacks.
pub struct ZapResolver {
    client: ReceiverClient,
    probe: reqwest::Client,
    config: ZapConfig,
}

impl ZapResolver {
    pub fn new(client: ReceiverClient, config: ZapConfig) -> Result<Self> {
        crate::receiver::ensure_crypto_provider();
        let probe = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| Error::upstream(format!("failed to build probe client: {e}")))?;

        Ok(Self {
            client,
            probe,
            config,
        })
    }

    /// Zap to a channel and resolve a verified stream URL.
    ///
    /// `channel` is either a technical service reference or the declared
    /// playlist URL. The fallback ladder on probe failure: port-8001
    /// rebuild of the resolved URL, then the original playlist URL; each
    /// rung gets a fresh probe budget.
    pub async fn zap_and_resolve(
        &self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        let service_ref = if channel.contains("://") {
            extract_service_ref(channel)
                .ok_or_else(|| Error::Zap(format!("no service ref in URL {channel}")))?
        } else {
            channel.to_string()
        };

        let body = self
            .client
            .web_zap(&service_ref, self.config.web_zap_timeout)
            .await?;

        let (resolved, program_id) = parse_mini_playlist(&body);
        let resolved =
            resolved.ok_or_else(|| Error::Zap("mini playlist carried no stream URL".into()))?;

        debug!(service_ref = %service_ref, url = %resolved, ?program_id, "web zap resolved");

        // Hardware needs settle time before the (descrambled) TS flows;
        // skipping this breaks encrypted channels.
        sleep_cancellable(self.config.zap_delay, cancel).await?;

        if self.try_probe_stream(&resolved, cancel).await? {
            return Ok(ResolvedStream {
                url: resolved,
                program_id,
            });
        }

        // Fallback (a): raw TS port on the resolved host.
        if let Some(rebuilt) = rebuild_port_8001(&resolved)
            && rebuilt != resolved
        {
            warn!(url = %rebuilt, "resolved URL failed probe, trying port-8001 rebuild");
            if self.try_probe_stream(&rebuilt, cancel).await? {
                return Ok(ResolvedStream {
                    url: rebuilt,
                    program_id,
                });
            }
        }

        // Fallback (b): the declared playlist URL.
        if channel.contains("://") && channel != resolved {
            warn!(url = %channel, "falling back to the declared playlist URL");
            if self.try_probe_stream(channel, cancel).await? {
                return Ok(ResolvedStream {
                    url: channel.to_string(),
                    program_id,
                });
            }
        }

        Err(Error::Zap(format!(
            "stream for {service_ref} never delivered bytes"
        )))
    }

    /// Probe `url` with short ranged GETs until one byte arrives or the
    /// overall probe budget elapses. `Ok(false)` means budget exhausted.
    pub async fn try_probe_stream(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.config.stream_probe_timeout;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }

            attempt += 1;
            match self.probe_once(url).await {
                Ok(true) => {
                    info!(url = %url, attempt, "stream probe delivered bytes");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "stream probe attempt failed");
                }
            }

            let delay = jittered(
                self.config.stream_probe_retry_delay,
                self.config.stream_probe_retry_delay / 2,
            );
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            sleep_cancellable(delay.min(remaining), cancel).await?;
        }
    }

    async fn probe_once(&self, url: &str) -> Result<bool> {
        let mut response = self
            .probe
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .timeout(self.config.stream_probe_attempt)
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let chunk = tokio::time::timeout(self.config.stream_probe_attempt, response.chunk())
            .await
            .map_err(|_| Error::timeout("probe body read"))?
            .map_err(|e| Error::upstream(e.to_string()))?;

        Ok(chunk.map(|c| !c.is_empty()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    #[test]
    fn mini_playlist_parsing() {
        let body = "#EXTM3U\n#EXTVLCOPT:program=108\nhttp://receiver.lan:8001/1:0:19:132F\n";
        let (url, program) = parse_mini_playlist(body);
        assert_eq!(url.as_deref(), Some("http://receiver.lan:8001/1:0:19:132F"));
        assert_eq!(program, Some(108));
    }

    #[test]
    fn mini_playlist_without_program_hint() {
        let body = "#EXTM3U\nhttp://receiver.lan:8001/1:0:19:132F\n";
        let (url, program) = parse_mini_playlist(body);
        assert!(url.is_some());
        assert_eq!(program, None);
    }

    #[test]
    fn mini_playlist_takes_first_http_line() {
        let body = "#EXTM3U\nnot-a-url\nhttp://first.example/1\nhttp://second.example/2\n";
        let (url, _) = parse_mini_playlist(body);
        assert_eq!(url.as_deref(), Some("http://first.example/1"));
    }

    #[test]
    fn empty_playlist_yields_nothing() {
        assert_eq!(parse_mini_playlist("#EXTM3U\n"), (None, None));
    }

    #[derive(Clone)]
    struct UpstreamState {
        stream_failures: Arc<AtomicU32>,
        stream_port: u16,
    }

    async fn zap_handler(State(state): State<UpstreamState>) -> String {
        format!(
            "#EXTM3U\n#EXTVLCOPT:program=108\nhttp://127.0.0.1:{}/stream\n",
            state.stream_port
        )
    }

    async fn stream_handler(State(state): State<UpstreamState>) -> (StatusCode, Vec<u8>) {
        if state.stream_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v > 0 { Some(v - 1) } else { None }
        })
        .is_ok()
        {
            (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
        } else {
            (StatusCode::OK, vec![0x47])
        }
    }

    /// Stand up an in-process receiver: zap endpoint + flaky stream port.
    async fn spawn_upstream(initial_failures: u32) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = UpstreamState {
            stream_failures: Arc::new(AtomicU32::new(initial_failures)),
            stream_port: addr.port(),
        };

        let app = Router::new()
            .route("/web/stream.m3u", get(zap_handler))
            .route("/stream", get(stream_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://127.0.0.1:{}", addr.port()), addr.port())
    }

    fn fast_zap_config() -> ZapConfig {
        ZapConfig {
            zap_delay: Duration::from_millis(10),
            stream_probe_timeout: Duration::from_millis(1500),
            stream_probe_attempt: Duration::from_millis(300),
            stream_probe_retry_delay: Duration::from_millis(30),
            web_zap_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn zap_then_probe_retries_until_bytes_flow() {
        let (base, _) = spawn_upstream(2).await;
        let resolver = ZapResolver::new(
            ReceiverClient::new(&base).unwrap(),
            fast_zap_config(),
        )
        .unwrap();

        let resolved = resolver
            .zap_and_resolve("1:0:19:132F:3EF:1:C00000:0:0:0:", &CancellationToken::new())
            .await
            .expect("stream resolves after two failures");

        assert!(resolved.url.ends_with("/stream"));
        assert_eq!(resolved.program_id, Some(108));
    }

    #[tokio::test]
    async fn probe_budget_exhaustion_fails_the_zap() {
        let (base, _) = spawn_upstream(u32::MAX).await;
        let mut config = fast_zap_config();
        config.stream_probe_timeout = Duration::from_millis(200);
        let resolver = ZapResolver::new(ReceiverClient::new(&base).unwrap(), config).unwrap();

        let result = resolver
            .zap_and_resolve("1:0:19:132F", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Zap(_))));
    }

    #[tokio::test]
    async fn cancel_aborts_the_settle_delay() {
        let (base, _) = spawn_upstream(0).await;
        let mut config = fast_zap_config();
        config.zap_delay = Duration::from_secs(30);
        let resolver = ZapResolver::new(ReceiverClient::new(&base).unwrap(), config).unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = resolver.zap_and_resolve("1:0:19:132F", &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
