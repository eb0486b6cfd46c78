//! The decode, rate gate, re-encode filter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{frame, Rational};
use log::{debug, info};
use parking_lot::RwLock;

use crate::decode::{ScalePlan, VideoDecoder};
use crate::filter::{PacketFilter, Status};
use crate::options::{FilterOptions, VideoDecodeOptions};
use crate::params::CodecParameters;
use crate::source::SubStream;
use crate::Error;

/// Encoder time base when no output framerate is configured.
const DEFAULT_ENC_FRAMERATE: u32 = 25;

/// Wall-clock gate in front of the encoder: frames arriving less than
/// `1000 / framerate` ms after the previously accepted one are discarded.
pub(crate) struct FrameGate {
    min_interval: Option<Duration>,
    last: Option<Instant>,
}

impl FrameGate {
    pub fn new(framerate: Option<u32>) -> FrameGate {
        FrameGate {
            min_interval: framerate
                .filter(|&f| f > 0)
                .map(|f| Duration::from_millis(1000 / u64::from(f))),
            last: None,
        }
    }

    pub fn accept(&mut self, now: Instant) -> bool {
        let min = match self.min_interval {
            None => return true,
            Some(min) => min,
        };
        if let Some(prev) = self.last {
            if now.duration_since(prev) < min {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Re-encodes a video sub-stream: decode with pixel-format normalization,
/// gate to the configured output framerate, encode with fresh monotone PTS.
pub struct EncodeFilter {
    options: FilterOptions,
    sub: SubStreamRef,
    decoder: Option<VideoDecoder>,
    encoder: Option<encoder::video::Encoder>,
    gate: FrameGate,
    next_pts: i64,
}

/// What the filter keeps of its sub-stream: enough to build the decoder and
/// the shared slot where the post-filter parameters land.
struct SubStreamRef {
    raw: ffmpeg::codec::Parameters,
    slot: Arc<RwLock<CodecParameters>>,
}

impl EncodeFilter {
    pub fn new(sub: &SubStream, options: &FilterOptions) -> Result<EncodeFilter, Error> {
        Ok(EncodeFilter {
            gate: FrameGate::new(options.enc_framerate),
            options: options.clone(),
            sub: SubStreamRef {
                raw: sub.raw_parameters().clone(),
                slot: sub.params_slot(),
            },
            decoder: None,
            encoder: None,
            next_pts: 0,
        })
    }

    fn build_decoder(&self) -> Result<VideoDecoder, Error> {
        let dec_options = VideoDecodeOptions {
            dec_name: self.options.dec_name.clone(),
            dec_thread_count: self.options.dec_thread_count,
            dec_thread_type: self.options.dec_thread_type,
            ..VideoDecodeOptions::default()
        };
        // Encoders reject full-range yuvj420p; normalize every decoded frame
        // to yuv420p before it leaves the decode stage.
        let plan = ScalePlan {
            enable: true,
            dst_format: Some(Pixel::YUV420P),
            ..ScalePlan::default()
        };
        VideoDecoder::with_plan_raw(&self.sub.raw, &dec_options, plan)
    }
}

impl PacketFilter for EncodeFilter {
    fn send(&mut self, pkt: &ffmpeg::Packet) -> Result<Status, Error> {
        if self.decoder.is_none() {
            self.decoder = Some(self.build_decoder()?);
        }
        let decoder = self.decoder.as_mut().expect("decoder just initialized");
        let frame = match decoder.decode(pkt)? {
            None => return Ok(Status::Break),
            Some(frame) => frame,
        };

        if self.encoder.is_none() {
            let (enc, params) = open_encoder(&self.options, frame)?;
            *self.sub.slot.write() = params;
            self.encoder = Some(enc);
        }

        if !self.gate.accept(Instant::now()) {
            return Ok(Status::Break);
        }

        let mut enc_frame = frame.clone();
        enc_frame.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        let encoder = self.encoder.as_mut().expect("encoder just initialized");
        encoder.send_frame(&enc_frame)?;
        Ok(Status::Ok)
    }

    fn recv(&mut self, pkt: &mut ffmpeg::Packet) -> Result<Status, Error> {
        let encoder = match &mut self.encoder {
            None => return Ok(Status::Break),
            Some(enc) => enc,
        };
        match encoder.receive_packet(pkt) {
            Ok(()) => Ok(Status::Again),
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) | Err(ffmpeg::Error::Eof) => {
                Ok(Status::Break)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens the configured encoder against the first decoded frame's geometry
/// and returns it with the parameters subscribers should now see.
fn open_encoder(
    options: &FilterOptions,
    frame: &frame::Video,
) -> Result<(encoder::video::Encoder, CodecParameters), Error> {
    let requested = options.enc_name.as_deref();
    let codec = requested
        .and_then(encoder::find_by_name)
        .or_else(|| encoder::find(codec::Id::H264))
        .ok_or_else(|| Error::Encoder("no H.264 encoder available".into()))?;
    if let Some(name) = requested {
        if name != codec.name() {
            info!("encoder {} not available, using {}", name, codec.name());
        }
    }

    let mut ctx = codec::context::Context::new_with_codec(codec);
    unsafe {
        if let Some(n) = options.enc_thread_count {
            (*ctx.as_mut_ptr()).thread_count = n;
        }
    }
    let mut video = ctx.encoder().video()?;
    video.set_width(frame.width());
    video.set_height(frame.height());
    video.set_format(Pixel::YUV420P);
    let framerate = options
        .enc_framerate
        .filter(|&f| f > 0)
        .unwrap_or(DEFAULT_ENC_FRAMERATE) as i32;
    video.set_time_base(Rational::new(1, framerate));
    video.set_frame_rate(Some(Rational::new(framerate, 1)));
    if let Some(b) = options.enc_bit_rate {
        video.set_bit_rate(b);
    }
    if let Some(g) = options.enc_gop_size {
        video.set_gop(g);
    }
    if let Some(b) = options.enc_max_b_frames {
        video.set_max_b_frames(b);
    }
    if let Some(q) = options.enc_qmin {
        video.set_qmin(q);
    }
    if let Some(q) = options.enc_qmax {
        video.set_qmax(q);
    }

    let mut open_options = ffmpeg::Dictionary::new();
    for (k, v) in &options.enc_open_options {
        open_options.set(k, v);
    }
    debug!(
        "opening encoder {} {}x{} @{}fps",
        codec.name(),
        frame.width(),
        frame.height(),
        framerate
    );
    let enc = video.open_with(open_options)?;

    let mut par = codec::Parameters::new();
    let ret = unsafe { ffi::avcodec_parameters_from_context(par.as_mut_ptr(), enc.as_ptr()) };
    if ret < 0 {
        return Err(Error::Encoder("failed to export encoder parameters".into()));
    }
    Ok((enc, CodecParameters::from_av(&par)))
}
