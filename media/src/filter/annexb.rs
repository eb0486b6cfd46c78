//! Container-to-elementary-stream reformat for H.264/HEVC.
//!
//! MP4-style streams carry NAL units as length-prefixed blobs and keep the
//! parameter sets (SPS/PPS, plus VPS for HEVC) out-of-band in the codec
//! extradata. The wire payload must be self-contained, so this filter turns
//! length prefixes into Annex-B start codes and re-inserts the parameter sets
//! ahead of every keyframe. Streams that are already Annex-B (RTSP demuxers
//! usually hand those out) pass through untouched, as does raw video via the
//! "null" filter name.

use bytes::{BufMut, Bytes, BytesMut};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::Id;

use crate::filter::{PacketFilter, Status};
use crate::options::FilterOptions;
use crate::params::extradata_of;
use crate::source::SubStream;
use crate::Error;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

enum Mode {
    /// Already self-contained; packets are forwarded as-is.
    Passthrough,
    /// Length-prefixed NAL units to rewrite.
    LengthPrefixed(Reformat),
}

pub struct AnnexBFilter {
    mode: Mode,
    pending: Option<ffmpeg::Packet>,
}

impl AnnexBFilter {
    pub fn new(sub: &SubStream, options: &FilterOptions) -> Result<AnnexBFilter, Error> {
        let codec_id = sub.raw_parameters().id();
        let name = match &options.bsf_name {
            Some(name) => name.clone(),
            None => match codec_id {
                Id::H264 => "h264_mp4toannexb".to_string(),
                Id::HEVC => "hevc_mp4toannexb".to_string(),
                Id::RAWVIDEO => "null".to_string(),
                other => {
                    return Err(Error::Decoder(format!(
                        "no default bitstream filter for codec {:?}",
                        other
                    )))
                }
            },
        };
        let extradata = extradata_of(sub.raw_parameters());
        let mode = match name.as_str() {
            "null" => Mode::Passthrough,
            "h264_mp4toannexb" => match &extradata {
                Some(extra) if !is_annexb(extra) => {
                    Mode::LengthPrefixed(Reformat::from_avcc(extra)?)
                }
                _ => Mode::Passthrough,
            },
            "hevc_mp4toannexb" => match &extradata {
                Some(extra) if !is_annexb(extra) => {
                    Mode::LengthPrefixed(Reformat::from_hvcc(extra)?)
                }
                _ => Mode::Passthrough,
            },
            other => {
                return Err(Error::Decoder(format!(
                    "bitstream filter not supported: {}",
                    other
                )))
            }
        };
        Ok(AnnexBFilter {
            mode,
            pending: None,
        })
    }
}

impl PacketFilter for AnnexBFilter {
    fn send(&mut self, pkt: &ffmpeg::Packet) -> Result<Status, Error> {
        let out = match &self.mode {
            Mode::Passthrough => pkt.clone(),
            Mode::LengthPrefixed(reformat) => {
                let payload = reformat.convert(pkt.data().unwrap_or(&[]), pkt.is_key())?;
                let mut out = ffmpeg::Packet::copy(&payload);
                out.set_pts(pkt.pts());
                out.set_dts(pkt.dts());
                out.set_stream(pkt.stream());
                out.set_flags(pkt.flags());
                out.set_duration(pkt.duration());
                out.set_position(pkt.position());
                out
            }
        };
        self.pending = Some(out);
        Ok(Status::Ok)
    }

    fn recv(&mut self, pkt: &mut ffmpeg::Packet) -> Result<Status, Error> {
        match self.pending.take() {
            Some(p) => {
                *pkt = p;
                Ok(Status::Ok)
            }
            None => Ok(Status::Break),
        }
    }
}

/// The byte-level rewrite: NAL length size plus the start-code-framed
/// parameter sets to put in front of keyframes.
struct Reformat {
    nal_length_size: usize,
    parameter_sets: Bytes,
}

impl Reformat {
    /// Parses an ISO/IEC 14496-15 `AVCDecoderConfigurationRecord`.
    fn from_avcc(extra: &[u8]) -> Result<Reformat, Error> {
        if extra.len() < 7 || extra[0] != 1 {
            return Err(Error::Decoder("malformed AVC configuration record".into()));
        }
        let nal_length_size = (extra[4] & 0x03) as usize + 1;
        let num_sps = (extra[5] & 0x1f) as usize;
        let mut cur = &extra[6..];
        let mut sets = BytesMut::new();
        for _ in 0..num_sps {
            copy_prefixed_nal(&mut cur, &mut sets)?;
        }
        if cur.is_empty() {
            return Err(Error::Decoder("malformed AVC configuration record".into()));
        }
        let num_pps = cur[0] as usize;
        cur = &cur[1..];
        for _ in 0..num_pps {
            copy_prefixed_nal(&mut cur, &mut sets)?;
        }
        Ok(Reformat {
            nal_length_size,
            parameter_sets: sets.freeze(),
        })
    }

    /// Parses an ISO/IEC 14496-15 `HEVCDecoderConfigurationRecord`.
    fn from_hvcc(extra: &[u8]) -> Result<Reformat, Error> {
        if extra.len() < 23 || extra[0] != 1 {
            return Err(Error::Decoder("malformed HEVC configuration record".into()));
        }
        let nal_length_size = (extra[21] & 0x03) as usize + 1;
        let num_arrays = extra[22] as usize;
        let mut cur = &extra[23..];
        let mut sets = BytesMut::new();
        for _ in 0..num_arrays {
            if cur.len() < 3 {
                return Err(Error::Decoder("malformed HEVC configuration record".into()));
            }
            // array_completeness/NAL_unit_type byte, then the NAL count.
            let num_nalus = u16::from_be_bytes([cur[1], cur[2]]) as usize;
            cur = &cur[3..];
            for _ in 0..num_nalus {
                copy_prefixed_nal(&mut cur, &mut sets)?;
            }
        }
        Ok(Reformat {
            nal_length_size,
            parameter_sets: sets.freeze(),
        })
    }

    /// Rewrites one packet payload from length prefixes to start codes,
    /// putting the parameter sets in front when the packet is a keyframe.
    fn convert(&self, data: &[u8], key: bool) -> Result<Bytes, Error> {
        let mut out = BytesMut::with_capacity(data.len() + self.parameter_sets.len() + 16);
        if key {
            out.put_slice(&self.parameter_sets);
        }
        let mut cur = data;
        while !cur.is_empty() {
            if cur.len() < self.nal_length_size {
                return Err(Error::Decoder("truncated NAL length prefix".into()));
            }
            let mut len = 0usize;
            for &b in &cur[..self.nal_length_size] {
                len = (len << 8) | b as usize;
            }
            cur = &cur[self.nal_length_size..];
            if len > cur.len() {
                return Err(Error::Decoder("NAL length exceeds packet".into()));
            }
            out.put_slice(&START_CODE);
            out.put_slice(&cur[..len]);
            cur = &cur[len..];
        }
        Ok(out.freeze())
    }
}

/// Reads one `u16`-length-prefixed NAL from `cur`, appending it to `out`
/// behind a start code.
fn copy_prefixed_nal(cur: &mut &[u8], out: &mut BytesMut) -> Result<(), Error> {
    if cur.len() < 2 {
        return Err(Error::Decoder("truncated parameter set".into()));
    }
    let len = u16::from_be_bytes([cur[0], cur[1]]) as usize;
    if cur.len() < 2 + len {
        return Err(Error::Decoder("truncated parameter set".into()));
    }
    out.put_slice(&START_CODE);
    out.put_slice(&cur[2..2 + len]);
    *cur = &cur[2 + len..];
    Ok(())
}

/// True when the extradata already uses Annex-B start codes (elementary
/// streams from e.g. the RTSP demuxer).
fn is_annexb(extra: &[u8]) -> bool {
    extra.starts_with(&[0, 0, 1]) || extra.starts_with(&[0, 0, 0, 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1f, 0xac];
    const PPS: &[u8] = &[0x68, 0xee, 0x3c, 0x80];

    /// A minimal avcC record with one SPS and one PPS, 4-byte NAL lengths.
    fn avcc() -> Vec<u8> {
        let mut v = vec![1, 0x64, 0x00, 0x1f, 0xff, 0xe1];
        v.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        v.extend_from_slice(SPS);
        v.push(1);
        v.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        v.extend_from_slice(PPS);
        v
    }

    fn framed(nal: &[u8]) -> Vec<u8> {
        let mut v = START_CODE.to_vec();
        v.extend_from_slice(nal);
        v
    }

    #[test]
    fn avcc_parameter_sets_extracted() {
        let r = Reformat::from_avcc(&avcc()).unwrap();
        assert_eq!(r.nal_length_size, 4);
        let mut expected = framed(SPS);
        expected.extend_from_slice(&framed(PPS));
        assert_eq!(&r.parameter_sets[..], &expected[..]);
    }

    #[test]
    fn avcc_rejects_garbage() {
        assert!(Reformat::from_avcc(&[]).is_err());
        assert!(Reformat::from_avcc(&[0, 1, 2, 3, 4, 5, 6]).is_err());
        let mut truncated = avcc();
        truncated.truncate(truncated.len() - 2);
        assert!(Reformat::from_avcc(&truncated).is_err());
    }

    #[test]
    fn converts_length_prefixes_to_start_codes() {
        let r = Reformat::from_avcc(&avcc()).unwrap();
        let idr = [0x65, 0x88, 0x84, 0x00];
        let sei = [0x06, 0x05, 0xff];
        let mut payload = Vec::new();
        payload.extend_from_slice(&(sei.len() as u32).to_be_bytes());
        payload.extend_from_slice(&sei);
        payload.extend_from_slice(&(idr.len() as u32).to_be_bytes());
        payload.extend_from_slice(&idr);

        // Non-key packet: just reframed.
        let out = r.convert(&payload, false).unwrap();
        let mut expected = framed(&sei);
        expected.extend_from_slice(&framed(&idr));
        assert_eq!(&out[..], &expected[..]);
        assert_eq!(&out[..4], &START_CODE);

        // Keyframe: parameter sets first, then the reframed payload.
        let out = r.convert(&payload, true).unwrap();
        let mut expected = framed(SPS);
        expected.extend_from_slice(&framed(PPS));
        expected.extend_from_slice(&framed(&sei));
        expected.extend_from_slice(&framed(&idr));
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn convert_rejects_bad_lengths() {
        let r = Reformat::from_avcc(&avcc()).unwrap();
        // Length prefix runs past the payload.
        assert!(r.convert(&[0, 0, 0, 9, 0x65], false).is_err());
        // Truncated length prefix.
        assert!(r.convert(&[0, 0], false).is_err());
    }

    #[test]
    fn hvcc_parameter_sets_extracted() {
        let vps = [0x40, 0x01, 0x0c];
        let sps = [0x42, 0x01, 0x01];
        let pps = [0x44, 0x01, 0xc0];
        let mut extra = vec![1];
        extra.resize(21, 0);
        extra.push(0x03); // nal_length_size - 1
        extra.push(3); // three arrays
        for nal in [&vps[..], &sps[..], &pps[..]] {
            extra.push(0x20); // array header (type bits, irrelevant here)
            extra.extend_from_slice(&1u16.to_be_bytes());
            extra.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            extra.extend_from_slice(nal);
        }
        let r = Reformat::from_hvcc(&extra).unwrap();
        assert_eq!(r.nal_length_size, 4);
        let mut expected = framed(&vps);
        expected.extend_from_slice(&framed(&sps));
        expected.extend_from_slice(&framed(&pps));
        assert_eq!(&r.parameter_sets[..], &expected[..]);
    }

    #[test]
    fn annexb_extradata_detected() {
        assert!(is_annexb(&[0, 0, 0, 1, 0x67]));
        assert!(is_annexb(&[0, 0, 1, 0x67]));
        assert!(!is_annexb(&avcc()));
    }
}
