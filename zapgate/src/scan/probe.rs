//! Stream probing for the capability scan.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::tokio_command;
use serde::Deserialize;

use crate::{Error, Result};

/// What a probe learned about a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Codec of the first video stream, or of the first audio stream for
    /// audio-only services.
    pub codec: String,
    /// `WxH`; empty for audio-only services.
    pub resolution: String,
    /// `None` when the probe could not determine the field order.
    pub interlaced: Option<bool>,
}

/// Probes a stream URL and reports its capability.
#[async_trait]
pub trait StreamProber: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    field_order: String,
}

/// Turn ffprobe's JSON into a probe outcome.
///
/// A stream counts as playable with video *or* audio alone; audio-only
/// recordings are deliberately accepted.
pub fn parse_ffprobe_output(json: &str) -> Option<ProbeOutcome> {
    let output: FfprobeOutput = serde_json::from_str(json).ok()?;

    if let Some(video) = output.streams.iter().find(|s| s.codec_type == "video") {
        let interlaced = match video.field_order.as_str() {
            "progressive" => Some(false),
            "tt" | "bb" | "tb" | "bt" => Some(true),
            _ => None,
        };
        let resolution = if video.width > 0 && video.height > 0 {
            format!("{}x{}", video.width, video.height)
        } else {
            String::new()
        };
        return Some(ProbeOutcome {
            codec: video.codec_name.clone(),
            resolution,
            interlaced,
        });
    }

    output
        .streams
        .iter()
        .find(|s| s.codec_type == "audio")
        .map(|audio| ProbeOutcome {
            codec: audio.codec_name.clone(),
            resolution: String::new(),
            interlaced: None,
        })
}

/// Derive the ffprobe path next to a resolved ffmpeg binary.
pub fn ffprobe_path(ffmpeg: &Path) -> PathBuf {
    match ffmpeg.parent() {
        Some(dir) if dir.as_os_str().is_empty() => PathBuf::from("ffprobe"),
        Some(dir) => dir.join("ffprobe"),
        None => PathBuf::from("ffprobe"),
    }
}

/// ffprobe-backed prober.
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl StreamProber for FfprobeProber {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome> {
        let mut command = tokio_command(&self.binary);
        command
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-analyzeduration",
                "2000000",
                "-i",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::timeout(format!("probe of {url}")))?
            .map_err(|e| Error::Scan(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(Error::Scan(format!(
                "ffprobe exited with {:?} for {url}",
                output.status.code()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&json)
            .ok_or_else(|| Error::Scan(format!("no playable stream in {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interlaced_video() {
        let json = r#"{"streams":[
            {"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"field_order":"tt"},
            {"codec_type":"audio","codec_name":"mp2"}
        ]}"#;
        let outcome = parse_ffprobe_output(json).unwrap();
        assert_eq!(outcome.codec, "h264");
        assert_eq!(outcome.resolution, "1920x1080");
        assert_eq!(outcome.interlaced, Some(true));
    }

    #[test]
    fn parses_progressive_video() {
        let json = r#"{"streams":[
            {"codec_type":"video","codec_name":"hevc","width":1280,"height":720,"field_order":"progressive"}
        ]}"#;
        let outcome = parse_ffprobe_output(json).unwrap();
        assert_eq!(outcome.interlaced, Some(false));
    }

    #[test]
    fn unknown_field_order_is_none() {
        let json = r#"{"streams":[
            {"codec_type":"video","codec_name":"h264","width":720,"height":576}
        ]}"#;
        let outcome = parse_ffprobe_output(json).unwrap();
        assert_eq!(outcome.interlaced, None);
    }

    #[test]
    fn audio_only_counts_as_playable() {
        let json = r#"{"streams":[{"codec_type":"audio","codec_name":"aac"}]}"#;
        let outcome = parse_ffprobe_output(json).unwrap();
        assert_eq!(outcome.codec, "aac");
        assert!(outcome.resolution.is_empty());
    }

    #[test]
    fn no_streams_is_not_playable() {
        assert!(parse_ffprobe_output(r#"{"streams":[]}"#).is_none());
        assert!(parse_ffprobe_output("not json").is_none());
    }

    #[test]
    fn ffprobe_sits_next_to_ffmpeg() {
        assert_eq!(
            ffprobe_path(Path::new("/usr/bin/ffmpeg")),
            PathBuf::from("/usr/bin/ffprobe")
        );
        assert_eq!(ffprobe_path(Path::new("ffmpeg")), PathBuf::from("ffprobe"));
    }
}
