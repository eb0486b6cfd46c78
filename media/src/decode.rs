//! Video decoding with an optional swscale stage.

use std::ffi::CString;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::{codec, decoder, frame};

use crate::options::VideoDecodeOptions;
use crate::source::SubStream;
use crate::Error;

/// Where decoded frames should end up: unscaled, or run through swscale with
/// per-knob fallbacks to the source geometry.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScalePlan {
    pub enable: bool,
    pub dst_width: Option<u32>,
    pub dst_height: Option<u32>,
    pub dst_format: Option<Pixel>,
    pub flags: Option<u32>,
}

impl ScalePlan {
    fn from_options(options: &VideoDecodeOptions) -> Result<ScalePlan, Error> {
        let dst_format = match &options.sws_dst_pix_fmt {
            Some(name) => Some(pixel_from_name(name)?),
            None => None,
        };
        Ok(ScalePlan {
            enable: options.sws_enable,
            dst_width: options.sws_dst_width,
            dst_height: options.sws_dst_height,
            dst_format,
            flags: options.sws_flags,
        })
    }
}

/// Looks up an FFmpeg pixel format by name, e.g. "yuv420p".
pub(crate) fn pixel_from_name(name: &str) -> Result<Pixel, Error> {
    let cname = CString::new(name)
        .map_err(|_| Error::Config(format!("invalid pixel format name: {:?}", name)))?;
    let fmt = unsafe { ffi::av_get_pix_fmt(cname.as_ptr()) };
    if fmt == ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        return Err(Error::Config(format!("unknown pixel format: {}", name)));
    }
    Ok(Pixel::from(fmt))
}

/// Decodes one sub-stream's packets into frames, scaling on the way out when
/// a [`ScalePlan`] asks for it.
pub struct VideoDecoder {
    decoder: decoder::Video,
    frame: frame::Video,
    plan: ScalePlan,
    scaler: Option<scaling::Context>,
    scaled: frame::Video,
}

impl VideoDecoder {
    pub fn new(sub: &SubStream, options: &VideoDecodeOptions) -> Result<VideoDecoder, Error> {
        let plan = ScalePlan::from_options(options)?;
        Self::with_plan_raw(sub.raw_parameters(), options, plan)
    }

    pub(crate) fn with_plan_raw(
        par: &ffmpeg::codec::Parameters,
        options: &VideoDecodeOptions,
        plan: ScalePlan,
    ) -> Result<VideoDecoder, Error> {
        let mut ctx = codec::context::Context::from_parameters(par.clone())?;
        unsafe {
            let c = ctx.as_mut_ptr();
            if let Some(n) = options.dec_thread_count {
                (*c).thread_count = n;
            }
            if let Some(t) = options.dec_thread_type {
                (*c).thread_type = t;
            }
        }
        let decoder = match &options.dec_name {
            Some(name) => {
                let codec = decoder::find_by_name(name)
                    .ok_or_else(|| Error::Decoder(format!("decoder not found: {}", name)))?;
                ctx.decoder().open_as(codec)?.video()?
            }
            None => ctx.decoder().video()?,
        };
        Ok(VideoDecoder {
            decoder,
            frame: frame::Video::empty(),
            plan,
            scaler: None,
            scaled: frame::Video::empty(),
        })
    }

    /// Feeds one packet and pulls at most one frame. `Ok(None)` means the
    /// decoder needs more input before it can produce anything.
    pub fn decode(&mut self, pkt: &ffmpeg::Packet) -> Result<Option<&frame::Video>, Error> {
        match self.decoder.send_packet(pkt) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) | Err(ffmpeg::Error::Eof) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }

        if !self.plan.enable {
            return Ok(Some(&self.frame));
        }

        if self.scaler.is_none() {
            let dst_w = self.plan.dst_width.unwrap_or(self.frame.width());
            let dst_h = self.plan.dst_height.unwrap_or(self.frame.height());
            let dst_fmt = self.plan.dst_format.unwrap_or_else(|| self.frame.format());
            let flags = self
                .plan
                .flags
                .map(|f| scaling::flag::Flags::from_bits_truncate(f as i32))
                .unwrap_or(scaling::flag::Flags::BICUBIC);
            self.scaled = frame::Video::new(dst_fmt, dst_w, dst_h);
            self.scaler = Some(scaling::Context::get(
                self.frame.format(),
                self.frame.width(),
                self.frame.height(),
                dst_fmt,
                dst_w,
                dst_h,
                flags,
            )?);
        }
        let scaler = self.scaler.as_mut().expect("scaler just initialized");
        scaler.run(&self.frame, &mut self.scaled)?;
        self.scaled.set_pts(self.frame.pts());
        Ok(Some(&self.scaled))
    }
}
