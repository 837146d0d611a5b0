//! FFmpeg stderr parsing: progress keys and error classification.
//!
//! With `-progress pipe:2` ffmpeg interleaves `key=value` progress records
//! with its normal log lines. Only two keys matter for liveness:
//! `out_time_ms` and `total_size`.

/// Parse `out_time_ms=<int>` from a progress line.
///
/// ffmpeg emits microseconds under this key on current builds; the value is
/// only compared against zero, so the unit is irrelevant here.
pub fn parse_out_time_ms(line: &str) -> Option<i64> {
    parse_keyed_int(line, "out_time_ms=")
}

/// Parse `total_size=<int>` from a progress line.
pub fn parse_total_size(line: &str) -> Option<i64> {
    parse_keyed_int(line, "total_size=")
}

fn parse_keyed_int(line: &str, key: &str) -> Option<i64> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

/// Stable labels for ffmpeg failure lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegErrorClass {
    /// Upstream closed or refused the TS connection.
    StreamConnectReset,
    /// Generic I/O failure.
    IoError,
    /// Anything else.
    Unclassified,
}

impl FfmpegErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FfmpegErrorClass::StreamConnectReset => "stream_connect_reset",
            FfmpegErrorClass::IoError => "io_error",
            FfmpegErrorClass::Unclassified => "unclassified",
        }
    }
}

/// Classify a raw ffmpeg stderr line into a stable label.
///
/// Total over all inputs and stable under case changes. Connection-reset
/// shapes take precedence over the generic I/O label.
pub fn classify_ffmpeg_error(line: &str) -> FfmpegErrorClass {
    let lower = line.to_ascii_lowercase();

    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
    {
        return FfmpegErrorClass::StreamConnectReset;
    }

    if lower.contains("input/output error") {
        return FfmpegErrorClass::IoError;
    }

    FfmpegErrorClass::Unclassified
}

/// Classify a whole stderr tail, strongest label wins.
pub fn classify_ffmpeg_tail<'a>(lines: impl IntoIterator<Item = &'a str>) -> FfmpegErrorClass {
    let mut result = FfmpegErrorClass::Unclassified;
    for line in lines {
        match classify_ffmpeg_error(line) {
            FfmpegErrorClass::StreamConnectReset => return FfmpegErrorClass::StreamConnectReset,
            FfmpegErrorClass::IoError => result = FfmpegErrorClass::IoError,
            FfmpegErrorClass::Unclassified => {}
        }
    }
    result
}
