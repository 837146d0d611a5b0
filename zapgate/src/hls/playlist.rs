//! Playlist file handling: stable reads and the Safari DVR rewrite.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Read a file only once its contents hold still.
///
/// Two reads separated by `stability_window` must agree on size, mtime and
/// bytes; otherwise keep trying until `timeout`. ffmpeg rewrites the
/// playlist in place on every segment, and serving a half-flushed playlist
/// desyncs players.
pub async fn read_stable_file(
    path: &Path,
    stability_window: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let first_meta = tokio::fs::metadata(path).await;
        let first_bytes = tokio::fs::read(path).await;

        if let (Ok(meta_a), Ok(bytes_a)) = (first_meta, first_bytes) {
            tokio::time::sleep(stability_window).await;

            if let (Ok(meta_b), Ok(bytes_b)) =
                (tokio::fs::metadata(path).await, tokio::fs::read(path).await)
                && meta_a.len() == meta_b.len()
                && meta_a.modified().ok() == meta_b.modified().ok()
                && bytes_a == bytes_b
            {
                return Ok(bytes_b);
            }
        } else {
            tokio::time::sleep(stability_window).await;
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "file {} never stabilized",
                path.display()
            )));
        }
    }
}

/// Rewrite a media playlist for Safari DVR playback.
///
/// Injects `#EXT-X-START` (negative offset, precise) and
/// `#EXT-X-PLAYLIST-TYPE:EVENT` after the media-sequence line, or near the
/// top when there is none. Idempotent: already-rewritten playlists come
/// back byte-identical.
pub fn rewrite_for_dvr(playlist: &str, offset_seconds: u32) -> String {
    let has_start = playlist.lines().any(|l| l.starts_with("#EXT-X-START"));
    let has_type = playlist
        .lines()
        .any(|l| l.starts_with("#EXT-X-PLAYLIST-TYPE"));

    if has_start && has_type {
        return playlist.to_string();
    }

    let mut inject = Vec::new();
    if !has_start {
        inject.push(format!(
            "#EXT-X-START:TIME-OFFSET=-{offset_seconds},PRECISE=YES"
        ));
    }
    if !has_type {
        inject.push("#EXT-X-PLAYLIST-TYPE:EVENT".to_string());
    }

    let lines: Vec<&str> = playlist.lines().collect();
    let anchor = lines
        .iter()
        .position(|l| l.starts_with("#EXT-X-MEDIA-SEQUENCE"))
        .or_else(|| lines.iter().position(|l| l.starts_with("#EXTM3U")))
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + inject.len());
    out.extend(lines[..anchor].iter().map(|s| s.to_string()));
    out.extend(inject);
    out.extend(lines[anchor..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if playlist.ends_with('\n') {
        result.push('\n');
    }
    result
}
