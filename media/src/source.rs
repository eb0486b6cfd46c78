//! Media source adapter: one upstream URL as a typed packet source.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format;
use log::{debug, info};
use parking_lot::RwLock;
use strand_wire::MediaType;

use crate::options::{default_webcam_rtbufsize, SourceMethod, SourceOptions};
use crate::params::CodecParameters;
use crate::{Error, Rational};

/// One media track inside an open source.
pub struct SubStream {
    media_type: MediaType,
    index: usize,
    time_base: Rational,
    raw: ffmpeg::codec::Parameters,
    shared: Arc<RwLock<CodecParameters>>,
}

impl SubStream {
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Positional stream index within the source; packets carry the same
    /// index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// The demuxer's parameters, as needed to construct decoders and
    /// bitstream filters.
    pub fn raw_parameters(&self) -> &ffmpeg::codec::Parameters {
        &self.raw
    }

    /// Current parameters as subscribers should see them. A re-encode filter
    /// overwrites this slot once its encoder is open.
    pub fn params_snapshot(&self) -> CodecParameters {
        self.shared.read().clone()
    }

    /// Shared handle to the subscriber-visible parameter slot.
    pub fn params_slot(&self) -> Arc<RwLock<CodecParameters>> {
        self.shared.clone()
    }
}

/// A single open upstream: demuxer plus the first sub-stream of each media
/// type. All FFmpeg handles are released on drop, in reverse order of
/// acquisition.
pub struct Source {
    ictx: format::context::Input,
    subs: Vec<SubStream>,
}

impl Source {
    /// Opens the upstream described by `options`, probes it, and records its
    /// sub-streams. Fails with [`Error::Config`] on invalid options and
    /// [`Error::Ffmpeg`] on backend failures.
    pub fn open(options: &SourceOptions) -> Result<Source, Error> {
        if options.input_url.is_empty() {
            return Err(Error::Config("input_url must be set".into()));
        }
        crate::init()?;
        match options.method {
            SourceMethod::File => {}
            SourceMethod::Network => format::network::init(),
            SourceMethod::Webcam => ffmpeg::device::register_all(),
        }

        let dict = demux_dictionary(options)?;
        debug!("opening {} with options [{}]", options.input_url, dict);

        let ictx = match options.method {
            SourceMethod::Webcam => {
                let name = options.input_format.as_deref().ok_or_else(|| {
                    Error::Config("input_format must be set for webcam sources".into())
                })?;
                let format = find_input_format(name)?;
                match format::open_with(&options.input_url, &format, dict)? {
                    format::context::Context::Input(i) => i,
                    _ => {
                        return Err(Error::Config(format!(
                            "not an input format: {}",
                            name
                        )))
                    }
                }
            }
            _ => format::input_with_dictionary(&options.input_url, dict)?,
        };

        if options.dump_format {
            format::context::input::dump(&ictx, 0, Some(&options.input_url));
        }

        let mut subs: Vec<SubStream> = Vec::new();
        for stream in ictx.streams() {
            let par = stream.parameters();
            let media_type = match par.medium() {
                ffmpeg::media::Type::Video => MediaType::Video,
                ffmpeg::media::Type::Audio => MediaType::Audio,
                ffmpeg::media::Type::Subtitle => MediaType::Subtitle,
                _ => continue,
            };
            if subs.iter().any(|s| s.media_type == media_type) {
                // Only the first sub-stream of each type is used.
                continue;
            }
            let snapshot = CodecParameters::from_av(&par);
            info!(
                "{}: {:?} sub-stream #{} codec_id={}",
                options.input_url,
                media_type,
                stream.index(),
                snapshot.codec_id
            );
            subs.push(SubStream {
                media_type,
                index: stream.index(),
                time_base: Rational::from(stream.time_base()),
                raw: par,
                shared: Arc::new(RwLock::new(snapshot)),
            });
        }

        Ok(Source { ictx, subs })
    }

    /// Reads one packet from the demuxer. End of stream is reported as
    /// [`Error::Eof`], distinct from every other failure.
    pub fn next_packet(&mut self) -> Result<ffmpeg::Packet, Error> {
        let mut pkt = ffmpeg::Packet::empty();
        match pkt.read(&mut self.ictx) {
            Ok(()) => Ok(pkt),
            Err(ffmpeg::Error::Eof) => Err(Error::Eof),
            Err(e) => Err(Error::Ffmpeg(e)),
        }
    }

    pub fn sub_stream(&self, media_type: MediaType) -> Result<&SubStream, Error> {
        self.subs
            .iter()
            .find(|s| s.media_type == media_type)
            .ok_or(Error::MissingSubStream(media_type))
    }

    pub fn sub_streams(&self) -> &[SubStream] {
        &self.subs
    }

    /// Releases the demuxer and all recorded sub-streams.
    pub fn close(self) {}
}

fn demux_dictionary(options: &SourceOptions) -> Result<ffmpeg::Dictionary<'static>, Error> {
    let mut dict = ffmpeg::Dictionary::new();

    if options.method == SourceMethod::Webcam {
        if let (Some(w), Some(h)) = (options.width, options.height) {
            dict.set("video_size", &format!("{}x{}", w, h));
        }
        if let Some(fr) = options.framerate {
            if fr > 0 {
                dict.set("framerate", &fr.to_string());
            }
        }
        if let Some(fmt) = &options.pixel_format {
            dict.set("pixel_format", fmt);
        }
    }

    match options.rtbufsize {
        Some(n) if n > 0 => dict.set("rtbufsize", &n.to_string()),
        _ => {
            if options.method == SourceMethod::Webcam {
                if let (Some(w), Some(h)) = (options.width, options.height) {
                    let n = default_webcam_rtbufsize(w, h, options.framerate);
                    dict.set("rtbufsize", &n.to_string());
                }
            }
        }
    }
    if let Some(n) = options.max_delay {
        if n > 0 {
            dict.set("max_delay", &n.to_string());
        }
    }
    if let Some(t) = &options.rtsp_transport {
        match t.as_str() {
            "udp" | "tcp" => dict.set("rtsp_transport", t),
            _ => {
                return Err(Error::Config(format!("invalid rtsp_transport: {}", t)));
            }
        }
    }
    if let Some(n) = options.stimeout {
        if n > 0 {
            dict.set("stimeout", &n.to_string());
        }
    }
    Ok(dict)
}

fn find_input_format(name: &str) -> Result<format::Format, Error> {
    // Demuxer names are comma-separated alias lists, e.g. "video4linux2,v4l2".
    format::list()
        .filter(|f| matches!(f, format::Format::Input(_)))
        .find(|f| f.name().split(',').any(|n| n == name))
        .ok_or_else(|| Error::Config(format!("input format not found: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> SourceOptions {
        serde_yaml::from_str("method: network\ninput_url: rtsp://example/cam\n").unwrap()
    }

    #[test]
    fn rtsp_transport_validated() {
        let mut opts = base_options();
        opts.rtsp_transport = Some("tcp".into());
        assert!(demux_dictionary(&opts).is_ok());
        opts.rtsp_transport = Some("udp".into());
        assert!(demux_dictionary(&opts).is_ok());
        opts.rtsp_transport = Some("sctp".into());
        match demux_dictionary(&opts) {
            Err(Error::Config(msg)) => assert!(msg.contains("rtsp_transport")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn webcam_rtbufsize_defaulted_only_with_dimensions() {
        let mut opts: SourceOptions = serde_yaml::from_str(
            "method: webcam\ninput_url: /dev/video0\ninput_format: v4l2\n",
        )
        .unwrap();
        let dict = demux_dictionary(&opts).unwrap();
        assert!(dict.get("rtbufsize").is_none());

        opts.width = Some(640);
        opts.height = Some(480);
        opts.framerate = Some(30);
        let dict = demux_dictionary(&opts).unwrap();
        assert_eq!(dict.get("rtbufsize"), Some("18432000"));
        assert_eq!(dict.get("video_size"), Some("640x480"));

        // An explicit value wins over the computed default.
        opts.rtbufsize = Some(1_000_000);
        let dict = demux_dictionary(&opts).unwrap();
        assert_eq!(dict.get("rtbufsize"), Some("1000000"));
    }

    #[test]
    fn empty_url_is_config_error() {
        let mut opts = base_options();
        opts.input_url.clear();
        match Source::open(&opts) {
            Err(Error::Config(msg)) => assert!(msg.contains("input_url")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
