//! Routing gate: decide pass-through, HLS, or plain proxying per request.
//!
//! Pure function of the path, the query string, the request headers, and a
//! known-slug lookup. The server records the decision and reason as metric
//! labels.

use axum::http::HeaderMap;

/// What the request should get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Hls,
    Ts,
    Proxy,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::Hls => "hls",
            RouteDecision::Ts => "ts",
            RouteDecision::Proxy => "proxy",
        }
    }
}

/// Why the decision was made; precedence order of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    GateRef,
    GateSlug,
    GateReject,
    Query,
    Accept,
    Fetch,
    Default,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::GateRef => "gate_ref",
            RouteReason::GateSlug => "gate_slug",
            RouteReason::GateReject => "gate_reject",
            RouteReason::Query => "query",
            RouteReason::Accept => "accept",
            RouteReason::Fetch => "fetch",
            RouteReason::Default => "default",
        }
    }
}

/// Path classification from step one of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Colon-separated technical service reference.
    StreamRef,
    /// Known channel slug.
    StreamSlug,
    Other,
}

/// Gate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteResult {
    pub decision: RouteDecision,
    pub reason: RouteReason,
    pub path_class: PathClass,
    /// True when the gateway handles the stream itself (HLS or TS).
    pub route: bool,
}

const HLS_ACCEPT_TYPES: [&str; 3] = [
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "application/mpegurl",
];

const TS_ACCEPT_TYPES: [&str; 2] = ["video/mp2t", "video/mpeg"];

/// Classify one request.
///
/// `path` is the URL path (leading slash tolerated), `query` the raw query
/// string, and `known_slug` answers whether a slug names a channel.
pub fn classify(
    path: &str,
    query: &str,
    headers: &HeaderMap,
    known_slug: impl Fn(&str) -> bool,
) -> RouteResult {
    let segment = path.trim_start_matches('/');

    // Step 1: a streamable path is a single non-empty segment.
    let path_class = if segment.is_empty() || segment.contains('/') {
        PathClass::Other
    } else if segment.contains(':') {
        PathClass::StreamRef
    } else if known_slug(segment) {
        PathClass::StreamSlug
    } else {
        PathClass::Other
    };

    if path_class == PathClass::Other {
        return RouteResult {
            decision: RouteDecision::Proxy,
            reason: RouteReason::GateReject,
            path_class,
            route: false,
        };
    }

    let routed = |decision, reason| RouteResult {
        decision,
        reason,
        path_class,
        route: true,
    };

    // Step 2: query overrides are authoritative; `mode=` wins over the
    // flag forms, and `hls=1` over `ts=1`.
    match query_override(query) {
        Some(RouteDecision::Hls) => return routed(RouteDecision::Hls, RouteReason::Query),
        Some(RouteDecision::Ts) => return routed(RouteDecision::Ts, RouteReason::Query),
        _ => {}
    }

    // Step 3: Accept header.
    if let Some(accept) = headers.get(axum::http::header::ACCEPT).and_then(|v| v.to_str().ok()) {
        let accept = accept.to_ascii_lowercase();
        if HLS_ACCEPT_TYPES.iter().any(|t| accept.contains(t)) {
            return routed(RouteDecision::Hls, RouteReason::Accept);
        }
        if TS_ACCEPT_TYPES.iter().any(|t| accept.contains(t)) {
            return routed(RouteDecision::Ts, RouteReason::Accept);
        }
    }

    // Step 4: fetch metadata marks modern browsers.
    let fetch_dest = headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if matches!(fetch_dest, "video" | "audio" | "media") || headers.contains_key("sec-ch-ua") {
        return routed(RouteDecision::Hls, RouteReason::Fetch);
    }

    // Step 5: ambiguous clients get the broadly compatible default.
    routed(RouteDecision::Hls, RouteReason::Default)
}

fn query_override(query: &str) -> Option<RouteDecision> {
    let mut mode = None;
    let mut hls_flag = false;
    let mut ts_flag = false;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "mode" => match value.as_ref() {
                "hls" => mode = Some(RouteDecision::Hls),
                "ts" => mode = Some(RouteDecision::Ts),
                _ => {}
            },
            "hls" if value == "1" => hls_flag = true,
            "ts" if value == "1" => ts_flag = true,
            _ => {}
        }
    }

    mode.or(if hls_flag {
        Some(RouteDecision::Hls)
    } else if ts_flag {
        Some(RouteDecision::Ts)
    } else {
        None
    })
}
