//! Proxy server: state wiring, router assembly, lifecycle.

pub mod admission;
pub mod error;
pub mod idle;
mod routes;
pub mod upstream;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::capability;
use crate::channels::ChannelMap;
use crate::config::GatewayConfig;
use crate::hls::{HlsManager, SessionDeps};
use crate::metrics::MetricsCollector;
use crate::receiver::{ReadinessChecker, ReceiverClient, ZapResolver};
use crate::runner::Runner;
use crate::scan::{FfprobeProber, ScanManager, ffprobe_path};
use crate::{Error, Result};

use admission::Admission;
use idle::IdleMonitor;
use upstream::UpstreamValidator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub channels: Arc<ChannelMap>,
    pub manager: Arc<HlsManager>,
    pub scan: Arc<ScanManager>,
    pub metrics: Arc<MetricsCollector>,
    pub admission: Arc<Admission>,
    pub idle: Arc<IdleMonitor>,
    pub validator: Arc<UpstreamValidator>,
    pub resolver: Arc<ZapResolver>,
    /// Shared client for pass-through proxying; no total timeout, streams
    /// run for hours.
    pub http: reqwest::Client,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every component from the configuration. Fails closed on a
    /// missing ffmpeg binary or an unknown capability backend.
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsCollector::new());

        let channels = Arc::new(ChannelMap::new(config.upstream.playlist_path.clone()));
        if let Err(e) = channels.reload() {
            tracing::warn!(
                path = %config.upstream.playlist_path.display(),
                error = %e,
                "playlist not loaded yet; slugs resolve after the first reload"
            );
        }

        let ffmpeg = config.runner.resolve_ffmpeg()?;
        tracing::info!(ffmpeg = %ffmpeg.display(), "transcoder binary resolved");

        let client = ReceiverClient::new(&config.upstream.api_base)?;
        let resolver = Arc::new(ZapResolver::new(client.clone(), config.zap.clone())?);
        let readiness = Arc::new(ReadinessChecker::new(
            Arc::new(client.clone()),
            config.readiness.clone(),
        ));

        let store = capability::open_store(&config.capability).await?;
        let prober = Arc::new(FfprobeProber::new(ffprobe_path(&ffmpeg)));
        let scan = Arc::new(ScanManager::new(
            store.clone(),
            channels.clone(),
            client,
            prober,
            config.capability.clone(),
        ));

        let deps = SessionDeps {
            runner: Runner::new(ffmpeg, config.runner.clone()),
            resolver: resolver.clone(),
            readiness,
            store,
            metrics: metrics.clone(),
            hls: config.hls.clone(),
        };
        let manager = Arc::new(HlsManager::new(deps, channels.clone()));

        let admission = Arc::new(Admission::new(
            config.server.max_concurrent_streams,
            metrics.clone(),
        ));
        let idle = Arc::new(IdleMonitor::new(config.server.idle_timeout, metrics.clone()));
        let validator = Arc::new(UpstreamValidator::new(
            &config.upstream.allowed_authorities,
            &config.upstream.api_base,
        ));

        crate::receiver::ensure_crypto_provider();
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| Error::upstream(format!("failed to build proxy client: {e}")))?;

        Ok(Self {
            config,
            channels,
            manager,
            scan,
            metrics,
            admission,
            idle,
            validator,
            resolver,
            http,
            start_time: Instant::now(),
        })
    }
}

/// The gateway's HTTP server.
pub struct ProxyServer {
    state: AppState,
    cancel: CancellationToken,
}

impl ProxyServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, start the background tasks, and serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.bind_address, self.state.config.server.port
        )
        .parse()
        .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;

        self.state.idle.spawn(self.cancel.clone());
        self.state.manager.spawn_sweeper();

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("gateway listening on http://{addr}");

        let cancel = self.cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                tracing::info!("gateway shutting down");
            })
            .await?;

        self.state.manager.shutdown().await;
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
