//! Conversion of demuxed/filtered packets into wire packets.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use strand_wire as wire;

/// Copies one compressed packet into its owned wire representation.
///
/// Timestamps are carried raw; FFmpeg's "no value" sentinel passes through
/// unchanged so subscribers see exactly what the demuxer produced.
pub fn to_wire(pkt: &ffmpeg::Packet, media_type: wire::MediaType) -> wire::Packet {
    let side_data = pkt
        .side_data()
        .map(|sd| {
            let kind: ffi::AVPacketSideDataType = sd.kind().into();
            wire::SideData {
                kind: kind as u8,
                data: Bytes::copy_from_slice(sd.data()),
            }
        })
        .collect();
    wire::Packet {
        media_type,
        pts: pkt.pts().unwrap_or(wire::NOPTS),
        dts: pkt.dts().unwrap_or(wire::NOPTS),
        payload: Bytes::copy_from_slice(pkt.data().unwrap_or(&[])),
        stream_index: pkt.stream() as i32,
        flags: pkt.flags().bits(),
        side_data,
        duration: pkt.duration(),
        pos: pkt.position() as i64,
    }
}
