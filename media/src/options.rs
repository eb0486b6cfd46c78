//! Per-stream option structs.
//!
//! These are the YAML leaves of the server configuration as well as the
//! programmatic API, so everything derives `Deserialize`. Knobs the upstream
//! libraries treat as "leave the library default" are `Option`s; only present
//! values are applied.

use std::collections::BTreeMap;

use serde::Deserialize;

/// How a source URL is to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMethod {
    /// A local media file, demuxed at read speed.
    File,
    /// A network stream (RTSP and friends).
    Network,
    /// A capture device, e.g. v4l2.
    Webcam,
}

/// Options consumed when opening a [`crate::source::Source`].
///
/// `method` and `input_url` are required; everything else augments the
/// demuxer dictionary for the chosen backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceOptions {
    pub method: SourceMethod,
    pub input_url: String,

    /// Device demuxer name, e.g. "v4l2". Required for webcam sources.
    #[serde(default)]
    pub input_format: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub framerate: Option<u32>,
    /// Device pixel format name, e.g. "yuyv422".
    #[serde(default)]
    pub pixel_format: Option<String>,

    /// Realtime demux buffer bytes. Defaulted for webcam inputs, see
    /// [`default_webcam_rtbufsize`].
    #[serde(default)]
    pub rtbufsize: Option<i64>,
    /// Maximum demux-reorder delay in microseconds.
    #[serde(default)]
    pub max_delay: Option<i64>,

    /// "udp" or "tcp"; anything else is a config error.
    #[serde(default)]
    pub rtsp_transport: Option<String>,
    /// Socket I/O timeout in microseconds.
    #[serde(default)]
    pub stimeout: Option<i64>,

    /// Dump the probed format to stderr after open.
    #[serde(default)]
    pub dump_format: bool,

    #[serde(default)]
    pub video: VideoDecodeOptions,
}

/// Decode-side knobs for a video sub-stream, including the optional
/// swscale stage applied to every decoded frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoDecodeOptions {
    #[serde(default)]
    pub dec_name: Option<String>,
    #[serde(default)]
    pub dec_thread_count: Option<i32>,
    #[serde(default)]
    pub dec_thread_type: Option<i32>,

    #[serde(default)]
    pub sws_enable: bool,
    /// Source width when absent.
    #[serde(default)]
    pub sws_dst_width: Option<u32>,
    /// Source height when absent.
    #[serde(default)]
    pub sws_dst_height: Option<u32>,
    /// Source pixel format when absent, by FFmpeg name.
    #[serde(default)]
    pub sws_dst_pix_fmt: Option<String>,
    /// SWS_BICUBIC when absent.
    #[serde(default)]
    pub sws_flags: Option<u32>,
}

/// Which transformation a filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// Bitstream reformat without decoding.
    Bsf,
    /// Full decode, rate gate, re-encode.
    Encode,
}

/// One entry of a stream's ordered filter chain.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterOptions {
    #[serde(rename = "type")]
    pub filter_type: FilterType,

    /// Bitstream filter name; resolved from the codec id when absent.
    #[serde(default)]
    pub bsf_name: Option<String>,

    #[serde(default)]
    pub dec_name: Option<String>,
    #[serde(default)]
    pub dec_thread_count: Option<i32>,
    #[serde(default)]
    pub dec_thread_type: Option<i32>,

    /// Encoder name; falls back to the default H.264 encoder when the named
    /// one is not available.
    #[serde(default)]
    pub enc_name: Option<String>,
    #[serde(default)]
    pub enc_bit_rate: Option<usize>,
    /// Output frames per second; positive values also gate the input frames.
    #[serde(default)]
    pub enc_framerate: Option<u32>,
    #[serde(default)]
    pub enc_gop_size: Option<u32>,
    #[serde(default)]
    pub enc_max_b_frames: Option<usize>,
    #[serde(default)]
    pub enc_qmin: Option<i32>,
    #[serde(default)]
    pub enc_qmax: Option<i32>,
    #[serde(default)]
    pub enc_thread_count: Option<i32>,
    /// Free-form `avcodec_open2` options, e.g. `{preset: slow, tune: zerolatency}`.
    #[serde(default)]
    pub enc_open_options: BTreeMap<String, String>,
}

/// Default realtime buffer for webcam inputs:
/// `width × height × max(framerate, 15) × 2` bytes.
pub fn default_webcam_rtbufsize(width: u32, height: u32, framerate: Option<u32>) -> i64 {
    let fps = framerate.unwrap_or(0).max(15);
    i64::from(width) * i64::from(height) * i64::from(fps) * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_options_from_yaml() {
        let opts: SourceOptions = serde_yaml::from_str(
            "method: network\n\
             input_url: rtsp://127.0.0.1:8554/cam\n\
             rtsp_transport: tcp\n\
             stimeout: 5000000\n",
        )
        .unwrap();
        assert_eq!(opts.method, SourceMethod::Network);
        assert_eq!(opts.rtsp_transport.as_deref(), Some("tcp"));
        assert_eq!(opts.stimeout, Some(5_000_000));
        assert!(opts.rtbufsize.is_none());
        assert!(!opts.video.sws_enable);
    }

    #[test]
    fn missing_required_fields_rejected() {
        assert!(serde_yaml::from_str::<SourceOptions>("method: file\n").is_err());
        assert!(serde_yaml::from_str::<SourceOptions>("input_url: /a.mp4\n").is_err());
        assert!(serde_yaml::from_str::<SourceOptions>("method: pigeon\ninput_url: x\n").is_err());
    }

    #[test]
    fn filter_options_from_yaml() {
        let opts: FilterOptions = serde_yaml::from_str(
            "type: encode\n\
             enc_name: libx264\n\
             enc_framerate: 5\n\
             enc_open_options:\n\
               preset: slow\n\
               tune: zerolatency\n",
        )
        .unwrap();
        assert_eq!(opts.filter_type, FilterType::Encode);
        assert_eq!(opts.enc_name.as_deref(), Some("libx264"));
        assert_eq!(opts.enc_framerate, Some(5));
        assert!(opts.enc_qmin.is_none());
        assert_eq!(opts.enc_open_options["preset"], "slow");

        // Unknown filter types are a config error at parse time.
        assert!(serde_yaml::from_str::<FilterOptions>("type: resample\n").is_err());
    }

    #[test]
    fn webcam_rtbufsize_default() {
        // 640×480 at 30 fps, 2 bytes per pixel.
        assert_eq!(default_webcam_rtbufsize(640, 480, Some(30)), 18_432_000);
        // Frame rates below 15 (or unset) are clamped up to 15.
        assert_eq!(default_webcam_rtbufsize(640, 480, Some(5)), 9_216_000);
        assert_eq!(default_webcam_rtbufsize(640, 480, None), 9_216_000);
    }
}
