//! HTTP surface: streaming paths, HLS files, and the control plane.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use super::admission::{StreamSlot, is_control_plane, is_session_start};
use super::error::ApiError;
use crate::gate::{self, RouteDecision};
use crate::{Error, Result};

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/channels", get(api_channels))
        .route("/api/scan", post(api_scan_start))
        .route("/api/scan/status", get(api_scan_status))
        .route("/api/scan/stop", post(api_scan_stop))
        .route("/discover.json", get(discover))
        .route("/lineup.json", get(lineup))
        .route("/lineup_status.json", get(lineup_status))
        .route("/device.xml", get(device_xml))
        .route("/hls/{service_ref}/preflight", get(preflight))
        .route("/hls/{service_ref}/{file}", get(hls_file))
        .fallback(dispatch)
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
struct StreamQuery {
    #[serde(default)]
    profile: String,
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Caller token that fires when the request handler unwinds.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": state.manager.session_count(),
    }))
}

async fn readyz(State(state): State<AppState>) -> Response {
    let ffmpeg_ok = state.config.runner.resolve_ffmpeg().is_ok();

    let upstream_ok = tokio::time::timeout(
        Duration::from_secs(2),
        state.http.get(&state.config.upstream.api_base).send(),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let body = axum::Json(json!({
        "ffmpeg": ffmpeg_ok,
        "upstream": upstream_ok,
        "channels": state.channels.len(),
    }));

    if ffmpeg_ok && upstream_ok {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn api_channels(State(state): State<AppState>) -> impl IntoResponse {
    if state.channels.is_empty() {
        let _ = state.channels.reload();
    }

    let channels: Vec<_> = state
        .channels
        .entries()
        .into_iter()
        .map(|entry| {
            json!({
                "slug": crate::channels::slugify(&entry.name),
                "name": entry.name,
                "tvg_id": entry.tvg_id,
                "url": entry.url,
            })
        })
        .collect();

    axum::Json(json!({ "channels": channels }))
}

async fn api_scan_start(State(state): State<AppState>) -> Response {
    state.metrics.scan_run();
    if state.scan.start_background() {
        (StatusCode::ACCEPTED, axum::Json(json!({"started": true}))).into_response()
    } else {
        ApiError::conflict("scan already running").into_response()
    }
}

async fn api_scan_status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.scan.status())
}

async fn api_scan_stop(State(state): State<AppState>) -> StatusCode {
    state.scan.stop();
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// HDHomeRun-style discovery
// ---------------------------------------------------------------------------

fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("127.0.0.1:{}", state.config.server.port));
    format!("http://{host}")
}

async fn discover(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let base = base_url(&state, &headers);
    axum::Json(json!({
        "FriendlyName": "zapgate",
        "Manufacturer": "zapgate",
        "ModelNumber": "HDTC-2US",
        "FirmwareName": "hdhomeruntc_atsc",
        "FirmwareVersion": "20240101",
        "DeviceID": "ZAPGATE1",
        "DeviceAuth": "zapgate",
        "BaseURL": base,
        "LineupURL": format!("{base}/lineup.json"),
        "TunerCount": state.config.server.max_concurrent_streams.max(2),
    }))
}

async fn lineup(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.channels.is_empty() {
        let _ = state.channels.reload();
    }

    let base = base_url(&state, &headers);
    let lineup: Vec<_> = state
        .channels
        .entries()
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            json!({
                "GuideNumber": (i + 1).to_string(),
                "GuideName": entry.name,
                "URL": format!("{base}/{}?mode=ts", crate::channels::slugify(&entry.name)),
            })
        })
        .collect();

    axum::Json(lineup)
}

async fn lineup_status(State(state): State<AppState>) -> impl IntoResponse {
    let scanning = matches!(state.scan.status().state, crate::scan::ScanState::Running);
    axum::Json(json!({
        "ScanInProgress": if scanning { 1 } else { 0 },
        "ScanPossible": 1,
        "Source": "Antenna",
        "SourceList": ["Antenna"],
    }))
}

async fn device_xml(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let base = base_url(&state, &headers);
    let xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <URLBase>{base}</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>zapgate</friendlyName>
    <manufacturer>zapgate</manufacturer>
    <modelName>HDTC-2US</modelName>
    <modelNumber>HDTC-2US</modelNumber>
    <serialNumber>ZAPGATE1</serialNumber>
    <UDN>uuid:zapgate-hdhr-1</UDN>
  </device>
</root>
"#
    );

    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

// ---------------------------------------------------------------------------
// HLS surface
// ---------------------------------------------------------------------------

async fn preflight(
    State(state): State<AppState>,
    Path(service_ref): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let ua = user_agent(&headers);
    match state
        .manager
        .start_session(&service_ref, &query.profile, &ua)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(service_ref = %service_ref, error = %e, "preflight failed");
            ApiError::service_unavailable(e.to_string()).into_response()
        }
    }
}

async fn hls_file(
    State(state): State<AppState>,
    Path((service_ref, file)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    if file == "playlist.m3u8" {
        serve_playlist(state, service_ref, query, headers).await
    } else {
        serve_segment(state, service_ref, file).await
    }
}

async fn serve_playlist(
    state: AppState,
    service_ref: String,
    query: StreamQuery,
    headers: HeaderMap,
) -> Response {
    let Some(_slot) = state.admission.try_acquire() else {
        return ApiError::too_many_streams().into_response();
    };

    let ua = user_agent(&headers);
    let (caller, _guard) = request_token();

    let session = match state
        .manager
        .start_session(&service_ref, &query.profile, &ua)
        .await
    {
        Ok(session) => session,
        Err(e) => return transcode_failure(&state, &service_ref, e).await,
    };

    let bytes = match session.serve_playlist(&caller).await {
        Ok(bytes) => bytes,
        Err(e) => return transcode_failure(&state, &service_ref, e).await,
    };

    let max_age = session.segment_duration();
    let expires = (chrono::Utc::now() + chrono::Duration::seconds(max_age as i64))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    let mut response = (StatusCode::OK, bytes).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("private, max-age={max_age}, must-revalidate"))
    {
        response_headers.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&expires) {
        response_headers.insert(header::EXPIRES, value);
    }
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn serve_segment(state: AppState, service_ref: String, file: String) -> Response {
    let Some(session) = state.manager.find_session(&service_ref, &file) else {
        return ApiError::not_found(format!("no session for {service_ref}")).into_response();
    };

    let (caller, _guard) = request_token();
    let bytes = match session.serve_segment(&file, &caller).await {
        Ok(bytes) => bytes,
        Err(e @ (Error::Session(_) | Error::Timeout(_))) => {
            debug!(segment = %file, error = %e, "segment not served");
            return ApiError::not_found(format!("segment {file}")).into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    let content_type = segment_content_type(&file);
    let mut response = (StatusCode::OK, bytes).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn segment_content_type(name: &str) -> &'static str {
    if name.ends_with(".m4s") {
        "video/iso.segment"
    } else if name.ends_with(".mp4") || name.ends_with(".cmfv") {
        "video/mp4"
    } else if name.ends_with(".cmfa") {
        "audio/mp4"
    } else {
        "video/mp2t"
    }
}

/// Transcode failure policy: fall open to the direct proxy, or 502.
async fn transcode_failure(state: &AppState, service_ref: &str, err: Error) -> Response {
    if err.is_client_disconnect() {
        debug!(service_ref = %service_ref, "client left during session start");
        return StatusCode::REQUEST_TIMEOUT.into_response();
    }

    warn!(service_ref = %service_ref, error = %err, "transcode pipeline failed");

    if state.config.server.transcode_fail_open {
        info!(service_ref = %service_ref, "transcode fail-open, proxying directly");
        return proxy_stream(state.clone(), service_ref.to_string(), None).await;
    }

    ApiError::bad_gateway(err.to_string()).into_response()
}

// ---------------------------------------------------------------------------
// Dispatch: HEAD shim → gate → TS proxy / reverse proxy
// ---------------------------------------------------------------------------

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let raw_path = request.uri().path().to_string();
    // Players encode the colons of technical references inconsistently;
    // classify on the decoded form.
    let path = urlencoding::decode(&raw_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw_path.clone());
    let query = request.uri().query().unwrap_or("").to_string();
    let headers = request.headers().clone();

    // HEAD shim: some players probe with HEAD before tuning.
    if method == Method::HEAD {
        return head_shim(&path);
    }
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    // Unmatched control-plane paths belong to the receiver's own web UI.
    if is_control_plane(&path) {
        return proxy_passthrough(state, &raw_path, &query).await;
    }

    let slot = if is_session_start(&path) {
        match state.admission.try_acquire() {
            Some(slot) => Some(slot),
            None => return ApiError::too_many_streams().into_response(),
        }
    } else {
        None
    };

    let result = gate::classify(&path, &query, &headers, |slug| {
        state.channels.lookup(slug).is_some()
    });
    state
        .metrics
        .route_decision(result.decision.as_str(), result.reason.as_str());
    debug!(
        path = %path,
        decision = result.decision.as_str(),
        reason = result.reason.as_str(),
        "gate decision"
    );

    let segment = path.trim_start_matches('/').to_string();

    match result.decision {
        RouteDecision::Hls => {
            let location = if query.is_empty() {
                format!("/hls/{segment}/playlist.m3u8")
            } else {
                format!("/hls/{segment}/playlist.m3u8?{query}")
            };
            let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            response
        }
        RouteDecision::Ts => proxy_stream(state, segment, slot).await,
        RouteDecision::Proxy => proxy_passthrough(state, &raw_path, &query).await,
    }
}

fn head_shim(path: &str) -> Response {
    let content_type = if path.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    };

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if content_type == "video/mp2t" {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

/// TS pass-through: zap, validate the resolved target, stream it with the
/// idle monitor attached.
async fn proxy_stream(state: AppState, ref_or_slug: String, slot: Option<StreamSlot>) -> Response {
    let (caller, _guard) = request_token();

    let channel = match resolve_channel_target(&state, &ref_or_slug) {
        Ok(channel) => channel,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let resolved = match state.resolver.zap_and_resolve(&channel, &caller).await {
        Ok(resolved) => resolved,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let target = match state.validator.validate(&resolved.url) {
        Ok(url) => url,
        Err(e) => {
            warn!(url = %resolved.url, error = %e, "upstream rejected");
            return ApiError::from(e).into_response();
        }
    };

    let upstream = match state.http.get(target).send().await {
        Ok(response) => response,
        Err(e) => return ApiError::bad_gateway(format!("upstream request failed: {e}")).into_response(),
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("video/mp2t")
        .to_string();

    let guard = Arc::new(state.idle.register());
    let idle_cancel = guard.cancelled();

    let held = (guard.clone(), slot);
    let stream = upstream
        .bytes_stream()
        .inspect_ok(move |_| {
            held.0.touch();
            let _ = &held.1;
        })
        .take_until(Box::pin(idle_cancel.cancelled_owned()))
        .map_err(std::io::Error::other);

    let mut response = (status, Body::from_stream(stream)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

fn resolve_channel_target(state: &AppState, ref_or_slug: &str) -> Result<String> {
    if ref_or_slug.contains(':') {
        return Ok(ref_or_slug.to_string());
    }
    state
        .channels
        .lookup(ref_or_slug)
        .map(|entry| entry.url)
        .ok_or_else(|| Error::ChannelNotFound(ref_or_slug.to_string()))
}

/// Plain reverse proxy to the receiver for everything the gate rejects.
async fn proxy_passthrough(state: AppState, path: &str, query: &str) -> Response {
    let target = if query.is_empty() {
        format!("{}{path}", state.config.upstream.api_base)
    } else {
        format!("{}{path}?{query}", state.config.upstream.api_base)
    };

    let url = match state.validator.validate(&target) {
        Ok(url) => url,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let upstream = match state.http.get(url).send().await {
        Ok(response) => response,
        Err(e) => return ApiError::bad_gateway(format!("upstream request failed: {e}")).into_response(),
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for key in [header::CONTENT_TYPE, header::CONTENT_LENGTH, header::CACHE_CONTROL] {
        if let Some(value) = upstream.headers().get(&key) {
            response_headers.insert(key, value.clone());
        }
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    let mut response = (status, Body::from_stream(stream)).into_response();
    response.headers_mut().extend(response_headers);
    response
}
