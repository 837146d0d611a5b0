//! Profile compiler: from a requested profile name, client hints, and the
//! capability record to a frozen codec decision.
//!
//! Pure functions only; the session turns the resulting [`ProfileSpec`]
//! into an argument list via [`args::build_args`].

pub mod args;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Output container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Ts,
    Fmp4,
    Mp4,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Ts => "ts",
            Container::Fmp4 => "fmp4",
            Container::Mp4 => "mp4",
        }
    }
}

/// Hardware acceleration family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    None,
    Vaapi,
    Nvenc,
}

/// A frozen codec decision. Opaque to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    pub container: Container,
    pub transcode_video: bool,
    pub video_codec: String,
    pub crf: u32,
    pub max_rate_k: u32,
    pub buf_size_k: u32,
    pub deinterlace: bool,
    pub hwaccel: HwAccel,
    pub audio_bitrate_k: u32,
    pub ll_hls: bool,
    pub dvr_window_sec: u32,
    pub b_frames: u32,
    pub preset: String,
    pub tag: String,
}

impl Default for ProfileSpec {
    fn default() -> Self {
        Self {
            name: "high".to_string(),
            container: Container::Ts,
            transcode_video: true,
            video_codec: "libx264".to_string(),
            crf: 21,
            max_rate_k: 8000,
            buf_size_k: 16000,
            deinterlace: false,
            hwaccel: HwAccel::None,
            audio_bitrate_k: 160,
            ll_hls: false,
            dvr_window_sec: 0,
            b_frames: 2,
            preset: "veryfast".to_string(),
            tag: String::new(),
        }
    }
}

/// Apple HLS caps the HEVC VBV rate; exceeding it stalls AVPlayer.
const HEVC_MAX_RATE_K: u32 = 12000;

/// Decide GPU usage from availability and the configured policy.
///
/// `force` always uses the GPU, `off` never does, anything else follows
/// availability.
pub fn should_use_gpu(has_gpu: bool, mode: &str) -> bool {
    match mode {
        "force" => true,
        "off" => false,
        _ => has_gpu,
    }
}

/// Apple-browser heuristic over the User-Agent.
///
/// Safari without the Chromium-family markers, or any iOS device token.
pub fn is_apple_browser(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();

    let ios_device = ["iphone", "ipad", "ipod"].iter().any(|t| ua.contains(t));
    if ios_device {
        return true;
    }

    ua.contains("safari")
        && !["chrome", "chromium", "crios", "fxios", "edgios"]
            .iter()
            .any(|t| ua.contains(t))
}

/// Normalize a requested profile name through the alias map.
fn normalize_name(requested: &str) -> &'static str {
    match requested.to_ascii_lowercase().as_str() {
        "" | "auto" => "auto",
        "high" | "hd" | "web_opt" | "web" | "default" => "high",
        "safari" | "apple" => "safari",
        "safari_hevc" => "safari_hevc",
        "safari_hevc_hw" => "safari_hevc_hw",
        "safari_hevc_hw_ll" => "safari_hevc_hw_ll",
        "repair" => "repair",
        _ => "auto",
    }
}

/// Resolve a request to a frozen [`ProfileSpec`].
pub fn resolve(
    requested: &str,
    user_agent: &str,
    dvr_window_sec: u32,
    capability: Option<&Capability>,
    has_gpu: bool,
    hwaccel_mode: &str,
) -> ProfileSpec {
    let mut name = normalize_name(requested);
    if name == "auto" {
        name = if is_apple_browser(user_agent) {
            "safari"
        } else {
            "high"
        };
    }

    let gpu = should_use_gpu(has_gpu, hwaccel_mode);

    match name {
        "safari" => safari_profile(dvr_window_sec, capability, gpu),
        "safari_hevc" => hevc_profile("safari_hevc", dvr_window_sec, HwAccel::None, false),
        "safari_hevc_hw" => hevc_profile(
            "safari_hevc_hw",
            dvr_window_sec,
            if gpu { HwAccel::Vaapi } else { HwAccel::None },
            false,
        ),
        "safari_hevc_hw_ll" => hevc_profile(
            "safari_hevc_hw_ll",
            dvr_window_sec,
            if gpu { HwAccel::Vaapi } else { HwAccel::None },
            true,
        ),
        "repair" => repair_profile(dvr_window_sec),
        _ => high_profile(dvr_window_sec),
    }
}

fn high_profile(dvr_window_sec: u32) -> ProfileSpec {
    ProfileSpec {
        name: "high".into(),
        dvr_window_sec,
        ..Default::default()
    }
}

fn safari_profile(dvr_window_sec: u32, capability: Option<&Capability>, gpu: bool) -> ProfileSpec {
    // Progressive sources stream as-is; everything else (interlaced or
    // unknown) is transcoded with deinterlace so Safari gets clean frames.
    let progressive = capability.map(|c| c.is_progressive()).unwrap_or(false);

    if progressive {
        return ProfileSpec {
            name: "safari".into(),
            container: Container::Fmp4,
            transcode_video: false,
            video_codec: "copy".into(),
            deinterlace: false,
            dvr_window_sec,
            ..Default::default()
        };
    }

    ProfileSpec {
        name: "safari".into(),
        container: Container::Fmp4,
        transcode_video: true,
        video_codec: if gpu { "h264_vaapi".into() } else { "libx264".into() },
        deinterlace: true,
        hwaccel: if gpu { HwAccel::Vaapi } else { HwAccel::None },
        dvr_window_sec,
        ..Default::default()
    }
}

fn hevc_profile(name: &str, dvr_window_sec: u32, hwaccel: HwAccel, ll_hls: bool) -> ProfileSpec {
    let video_codec = match hwaccel {
        HwAccel::None => "libx265",
        HwAccel::Vaapi => "hevc_vaapi",
        HwAccel::Nvenc => "hevc_nvenc",
    };

    ProfileSpec {
        name: name.into(),
        container: Container::Fmp4,
        transcode_video: true,
        video_codec: video_codec.into(),
        crf: 23,
        max_rate_k: HEVC_MAX_RATE_K,
        buf_size_k: HEVC_MAX_RATE_K * 2,
        deinterlace: true,
        hwaccel,
        ll_hls,
        dvr_window_sec,
        b_frames: 0,
        preset: "fast".into(),
        // Apple players require the hvc1 sample entry, not hev1.
        tag: "hvc1".into(),
        ..Default::default()
    }
}

fn repair_profile(dvr_window_sec: u32) -> ProfileSpec {
    // Always transcode: the whole point is regenerating timestamps and GOP
    // structure for broken sources.
    ProfileSpec {
        name: "repair".into(),
        container: Container::Ts,
        transcode_video: true,
        video_codec: "libx264".into(),
        crf: 23,
        preset: "veryfast".into(),
        dvr_window_sec,
        ..Default::default()
    }
}
