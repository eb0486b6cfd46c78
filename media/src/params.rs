//! Serializable codec parameters.
//!
//! [`CodecParameters`] mirrors the demuxer-declared `AVCodecParameters` of a
//! sub-stream: everything a subscriber needs to configure a compatible
//! decoder. The JSON spelling (flat integers, lowercase-hex extradata) is the
//! wire contract of the `/streams` index and must stay stable across
//! subscriber implementations.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use serde::{Serialize, Serializer};
use strand_wire::MediaType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl From<ffmpeg::Rational> for Rational {
    fn from(r: ffmpeg::Rational) -> Rational {
        Rational {
            num: r.numerator(),
            den: r.denominator(),
        }
    }
}

/// Static description of one sub-stream, in raw FFmpeg integer values.
///
/// Fields that only apply to one media type are `None` elsewhere and omitted
/// from the JSON, giving per-type objects like the demuxer would print.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CodecParameters {
    pub codec_type: i32,
    pub codec_id: i32,
    pub codec_tag: u32,
    pub bit_rate: i64,
    pub bits_per_coded_sample: i32,
    pub bits_per_raw_sample: i32,
    pub profile: i32,
    pub level: i32,
    #[serde(serialize_with = "hex_or_null")]
    pub extradata: Option<Bytes>,
    pub extradata_size: i32,

    // video & audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<i32>,

    // video & subtitle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,

    // video
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_order: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_range: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_primaries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_trc: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_space: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroma_location: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_aspect_ratio: Option<Rational>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_delay: Option<i32>,

    // audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_align: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_padding: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_padding: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_preroll: Option<i32>,
}

fn hex_or_null<S: Serializer>(v: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(b) => s.serialize_str(&hex::encode(b)),
        None => s.serialize_none(),
    }
}

impl CodecParameters {
    pub fn media_type(&self) -> MediaType {
        match self.codec_type {
            0 => MediaType::Video,
            1 => MediaType::Audio,
            2 => MediaType::Data,
            3 => MediaType::Subtitle,
            4 => MediaType::Attachment,
            _ => MediaType::Unknown,
        }
    }

    /// Snapshots the given FFmpeg parameters.
    pub fn from_av(par: &ffmpeg::codec::Parameters) -> CodecParameters {
        let p = unsafe { &*par.as_ptr() };
        let extradata = extradata_of(par);
        let mut cp = CodecParameters {
            codec_type: p.codec_type as i32,
            codec_id: p.codec_id as i32,
            codec_tag: p.codec_tag,
            bit_rate: p.bit_rate,
            bits_per_coded_sample: p.bits_per_coded_sample,
            bits_per_raw_sample: p.bits_per_raw_sample,
            profile: p.profile,
            level: p.level,
            extradata_size: extradata.as_ref().map(|e| e.len() as i32).unwrap_or(0),
            extradata,
            ..CodecParameters::default()
        };
        match cp.media_type() {
            MediaType::Video => {
                cp.format = Some(p.format);
                cp.width = Some(p.width);
                cp.height = Some(p.height);
                cp.field_order = Some(p.field_order as i32);
                cp.color_range = Some(p.color_range as i32);
                cp.color_primaries = Some(p.color_primaries as i32);
                cp.color_trc = Some(p.color_trc as i32);
                cp.color_space = Some(p.color_space as i32);
                cp.chroma_location = Some(p.chroma_location as i32);
                cp.sample_aspect_ratio = Some(Rational {
                    num: p.sample_aspect_ratio.num,
                    den: p.sample_aspect_ratio.den,
                });
                cp.video_delay = Some(p.video_delay);
            }
            MediaType::Audio => {
                cp.format = Some(p.format);
                cp.channels = Some(p.ch_layout.nb_channels);
                cp.sample_rate = Some(p.sample_rate);
                cp.block_align = Some(p.block_align);
                cp.frame_size = Some(p.frame_size);
                cp.initial_padding = Some(p.initial_padding);
                cp.trailing_padding = Some(p.trailing_padding);
                cp.seek_preroll = Some(p.seek_preroll);
            }
            MediaType::Subtitle => {
                cp.width = Some(p.width);
                cp.height = Some(p.height);
            }
            _ => {}
        }
        cp
    }
}

/// Copies the out-of-band extradata (e.g. an AVC configuration record) out of
/// FFmpeg-owned memory.
pub fn extradata_of(par: &ffmpeg::codec::Parameters) -> Option<Bytes> {
    let p = unsafe { &*par.as_ptr() };
    if p.extradata.is_null() || p.extradata_size <= 0 {
        return None;
    }
    let slice = unsafe { std::slice::from_raw_parts(p.extradata, p.extradata_size as usize) };
    Some(Bytes::copy_from_slice(slice))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_json_shape() {
        let cp = CodecParameters {
            codec_type: 0,
            codec_id: 27, // AV_CODEC_ID_H264
            bit_rate: 400_000,
            profile: 100,
            level: 31,
            extradata: Some(Bytes::from_static(&[0x01, 0x64, 0x00, 0x1f])),
            extradata_size: 4,
            format: Some(0),
            width: Some(1280),
            height: Some(720),
            field_order: Some(1),
            color_range: Some(0),
            color_primaries: Some(2),
            color_trc: Some(2),
            color_space: Some(2),
            chroma_location: Some(1),
            sample_aspect_ratio: Some(Rational { num: 1, den: 1 }),
            video_delay: Some(0),
            ..CodecParameters::default()
        };
        assert_eq!(cp.media_type(), MediaType::Video);
        let j: serde_json::Value = serde_json::to_value(&cp).unwrap();
        assert_eq!(j["codec_type"], 0);
        assert_eq!(j["codec_id"], 27);
        assert_eq!(j["extradata"], "0164001f");
        assert_eq!(j["extradata_size"], 4);
        assert_eq!(j["width"], 1280);
        assert_eq!(j["sample_aspect_ratio"]["den"], 1);
        // Audio-only fields stay out of a video object.
        assert!(j.get("sample_rate").is_none());
    }

    #[test]
    fn missing_extradata_serializes_null() {
        let cp = CodecParameters {
            codec_type: 1,
            channels: Some(2),
            sample_rate: Some(48_000),
            ..CodecParameters::default()
        };
        assert_eq!(cp.media_type(), MediaType::Audio);
        let j: serde_json::Value = serde_json::to_value(&cp).unwrap();
        assert!(j["extradata"].is_null());
        assert_eq!(j["extradata_size"], 0);
        assert_eq!(j["channels"], 2);
        assert!(j.get("width").is_none());
    }
}
