//! Compile a [`ProfileSpec`] into the ffmpeg argument list.
//!
//! All output paths are relative; the runner executes the child with the
//! session workdir as its cwd, which confines output to the workdir.

use super::{Container, HwAccel, ProfileSpec};

/// Playlist filename inside every session workdir.
pub const PLAYLIST_NAME: &str = "playlist.m3u8";

/// Init segment filename for fmp4 sessions.
pub const INIT_SEGMENT_NAME: &str = "init.mp4";

/// Everything the argument builder needs beyond the profile itself.
#[derive(Debug, Clone)]
pub struct ArgsRequest<'a> {
    /// Resolved input URI.
    pub input: &'a str,
    pub profile: &'a ProfileSpec,
    /// Target segment duration in seconds.
    pub segment_duration: u32,
    /// Segments kept in the playlist window.
    pub dvr_window_size: u32,
    /// Session nonce embedded in segment filenames so restarts never
    /// collide with segments a client is still fetching.
    pub nonce: &'a str,
    /// Program to select within a multi-program TS.
    pub program_id: Option<u32>,
    /// VAAPI render device.
    pub vaapi_device: &'a str,
    /// Transcode audio to AAC instead of copying.
    pub force_aac: bool,
    pub aac_bitrate_k: u32,
}

/// Segment filename pattern for a given nonce and container.
pub fn segment_pattern(nonce: &str, container: Container) -> String {
    let ext = match container {
        Container::Ts => "ts",
        Container::Fmp4 | Container::Mp4 => "m4s",
    };
    format!("seg_{nonce}_%05d.{ext}")
}

/// Build the complete ffmpeg argument list.
pub fn build_args(req: &ArgsRequest<'_>) -> Vec<String> {
    let profile = req.profile;
    let mut args: Vec<String> = Vec::with_capacity(48);

    args.extend(["-hide_banner", "-loglevel", "warning", "-nostats"].map(String::from));
    // Progress records go to stderr where the watchdog reads them.
    args.extend(["-progress", "pipe:2"].map(String::from));

    if profile.hwaccel == HwAccel::Vaapi {
        args.push("-init_hw_device".to_string());
        args.push(format!("vaapi=va:{}", req.vaapi_device));
        args.extend(
            ["-hwaccel", "vaapi", "-hwaccel_output_format", "vaapi", "-hwaccel_device", "va"]
                .map(String::from),
        );
    }

    // Legacy receivers ship broken DTS and missing PTS; regenerate both.
    args.extend(["-fflags", "+genpts+igndts"].map(String::from));
    args.extend(["-i".to_string(), req.input.to_string()]);

    match req.program_id {
        Some(program) => {
            args.push("-map".into());
            args.push(format!("0:p:{program}"));
        }
        None => {
            args.extend(["-map", "0:v:0?", "-map", "0:a:0?"].map(String::from));
        }
    }

    if profile.transcode_video {
        args.extend(["-c:v".to_string(), profile.video_codec.clone()]);

        if profile.deinterlace {
            if profile.hwaccel == HwAccel::Vaapi {
                args.extend(["-vf", "deinterlace_vaapi"].map(String::from));
            } else {
                args.extend(["-vf", "yadif=1"].map(String::from));
            }
        }

        if profile.hwaccel == HwAccel::None {
            args.extend(["-preset".to_string(), profile.preset.clone()]);
            args.extend(["-crf".to_string(), profile.crf.to_string()]);
        } else {
            // Hardware encoders are rate-controlled, not CRF-controlled.
            args.extend(["-qp".to_string(), profile.crf.to_string()]);
        }

        args.extend(["-maxrate".to_string(), format!("{}k", profile.max_rate_k)]);
        args.extend(["-bufsize".to_string(), format!("{}k", profile.buf_size_k)]);
        args.extend(["-bf".to_string(), profile.b_frames.to_string()]);

        // Keyframe cadence aligned to the segment duration.
        args.extend([
            "-force_key_frames".to_string(),
            format!("expr:gte(t,n_forced*{})", req.segment_duration),
        ]);

        if !profile.tag.is_empty() {
            args.extend(["-tag:v".to_string(), profile.tag.clone()]);
        }
    } else {
        args.extend(["-c:v", "copy"].map(String::from));
    }

    if req.force_aac {
        args.extend(["-c:a", "aac"].map(String::from));
        args.extend(["-b:a".to_string(), format!("{}k", req.aac_bitrate_k)]);
        args.extend(["-ac", "2"].map(String::from));
    } else {
        args.extend(["-c:a", "copy"].map(String::from));
    }

    args.extend(["-f", "hls"].map(String::from));
    args.extend(["-hls_time".to_string(), req.segment_duration.to_string()]);
    args.extend([
        "-hls_list_size".to_string(),
        req.dvr_window_size.to_string(),
    ]);

    let mut hls_flags = String::from("delete_segments+independent_segments+program_date_time");

    match profile.container {
        Container::Fmp4 | Container::Mp4 => {
            args.extend(["-hls_segment_type", "fmp4"].map(String::from));
            args.extend([
                "-hls_fmp4_init_filename".to_string(),
                INIT_SEGMENT_NAME.to_string(),
            ]);
        }
        Container::Ts => {
            args.extend(["-hls_segment_type", "mpegts"].map(String::from));
        }
    }

    if profile.ll_hls {
        // Low-latency extensions only in the dedicated variant.
        args.extend(["-lhls", "1"].map(String::from));
        hls_flags.push_str("+split_by_time");
    }

    args.extend(["-hls_flags".to_string(), hls_flags]);
    args.extend([
        "-hls_segment_filename".to_string(),
        segment_pattern(req.nonce, profile.container),
    ]);
    args.push(PLAYLIST_NAME.to_string());

    args
}
