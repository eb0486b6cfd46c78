//! Wire serialization of media packets.
//!
//! Every payload that crosses a WebSocket between the proxy and a subscriber
//! is exactly one message in this format: a fixed header followed by one
//! compressed packet, all multi-byte integers big-endian. The format is
//! self-delimiting (`total_size` covers the header too), so heterogeneous
//! subscribers (native and browser) can parse it from a plain byte buffer.
//!
//! ```text
//! header:  ver_major(u8) | ver_minor(u8) | media_type(u8) | total_size(u32)
//! body:    pts(i64) | dts(i64) | payload_size(i32) | payload
//!        | stream_index(i32) | flags(i32) | side_data_count(i32)
//!        | { side_type(u8) | side_size(i32) | side_bytes }*
//!        | duration(i64) | pos(i64)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Byte length of the fixed header.
pub const HEADER_LEN: usize = 7;

/// Keyframe bit in [`Packet::flags`], matching `AV_PKT_FLAG_KEY`.
pub const FLAG_KEY: i32 = 0x0001;

/// Timestamp sentinel for "unknown", matching `AV_NOPTS_VALUE`.
pub const NOPTS: i64 = i64::MIN;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer is shorter than the message it claims to hold.
    #[error("buffer too short: need {need} bytes, have {have}")]
    NotEnough { need: usize, have: usize },

    /// Payload or side data storage could not be reserved.
    #[error("failed to allocate {0} bytes of packet storage")]
    AllocFail(usize),

    /// The declared `total_size` disagrees with the parsed layout.
    #[error("framing mismatch: total_size={total_size}, cursor={cursor}")]
    Framing { total_size: usize, cursor: usize },
}

/// Media kind of one packet, numbered like `AVMediaType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaType {
    Video = 0,
    Audio = 1,
    Data = 2,
    Subtitle = 3,
    Attachment = 4,
    /// `AVMEDIA_TYPE_UNKNOWN` is -1; it wraps to 255 on the wire.
    Unknown = 255,
}

impl MediaType {
    pub fn from_u8(v: u8) -> MediaType {
        match v {
            0 => MediaType::Video,
            1 => MediaType::Audio,
            2 => MediaType::Data,
            3 => MediaType::Subtitle,
            4 => MediaType::Attachment,
            _ => MediaType::Unknown,
        }
    }
}

/// One element of packet side data, tagged with the `AVPacketSideDataType`
/// value truncated to a byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideData {
    pub kind: u8,
    pub data: Bytes,
}

/// One compressed access unit, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub media_type: MediaType,
    pub pts: i64,
    pub dts: i64,
    pub payload: Bytes,
    pub stream_index: i32,
    pub flags: i32,
    pub side_data: Vec<SideData>,
    pub duration: i64,
    pub pos: i64,
}

impl Packet {
    pub fn is_key(&self) -> bool {
        self.flags & FLAG_KEY != 0
    }

    /// Total byte length of the encoded message, header included.
    pub fn encoded_len(&self) -> usize {
        let mut n = HEADER_LEN + (8 + 8 + 4) + self.payload.len() + (4 + 4 + 4) + (8 + 8);
        for sd in &self.side_data {
            n += 1 + 4 + sd.data.len();
        }
        n
    }

    /// Serializes into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(VERSION_MAJOR);
        buf.put_u8(VERSION_MINOR);
        buf.put_u8(self.media_type as u8);
        buf.put_u32(total as u32);
        buf.put_i64(self.pts);
        buf.put_i64(self.dts);
        buf.put_i32(self.payload.len() as i32);
        buf.put_slice(&self.payload);
        buf.put_i32(self.stream_index);
        buf.put_i32(self.flags);
        buf.put_i32(self.side_data.len() as i32);
        for sd in &self.side_data {
            buf.put_u8(sd.kind);
            buf.put_i32(sd.data.len() as i32);
            buf.put_slice(&sd.data);
        }
        buf.put_i64(self.duration);
        buf.put_i64(self.pos);
        // An encode that disagrees with encoded_len() is a bug, not an input
        // error.
        assert_eq!(buf.len(), total, "encoded length mismatch");
        buf.freeze()
    }

    /// Parses one message from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Packet, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::NotEnough {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let mut cur = buf;
        let _ver_major = cur.get_u8();
        let _ver_minor = cur.get_u8();
        let media_type = MediaType::from_u8(cur.get_u8());
        let total_size = cur.get_u32() as usize;
        if buf.len() < total_size {
            return Err(Error::NotEnough {
                need: total_size,
                have: buf.len(),
            });
        }
        if total_size < HEADER_LEN {
            // The declared size cannot even cover the header just parsed.
            return Err(Error::Framing {
                total_size,
                cursor: HEADER_LEN,
            });
        }
        // Parse within the declared bounds only; trailing bytes beyond
        // total_size belong to the transport, not to us.
        let mut cur = &buf[HEADER_LEN..total_size];

        need(&cur, 8 + 8 + 4)?;
        let pts = cur.get_i64();
        let dts = cur.get_i64();
        let payload_len = checked_len(cur.get_i32(), &cur)?;
        let payload = take_bytes(&mut cur, payload_len)?;

        need(&cur, 4 + 4 + 4)?;
        let stream_index = cur.get_i32();
        let flags = cur.get_i32();
        let side_data_count = cur.get_i32();
        if side_data_count < 0 {
            return Err(Error::NotEnough {
                need: total_size,
                have: buf.len(),
            });
        }
        let mut side_data = Vec::new();
        side_data
            .try_reserve_exact(side_data_count as usize)
            .map_err(|_| Error::AllocFail(side_data_count as usize))?;
        for _ in 0..side_data_count {
            need(&cur, 1 + 4)?;
            let kind = cur.get_u8();
            let len = checked_len(cur.get_i32(), &cur)?;
            let data = take_bytes(&mut cur, len)?;
            side_data.push(SideData { kind, data });
        }

        need(&cur, 8 + 8)?;
        let duration = cur.get_i64();
        let pos = cur.get_i64();

        if !cur.is_empty() {
            return Err(Error::Framing {
                total_size,
                cursor: total_size - cur.len(),
            });
        }
        Ok(Packet {
            media_type,
            pts,
            dts,
            payload,
            stream_index,
            flags,
            side_data,
            duration,
            pos,
        })
    }
}

fn need(cur: &&[u8], n: usize) -> Result<(), Error> {
    if cur.len() < n {
        return Err(Error::NotEnough {
            need: n,
            have: cur.len(),
        });
    }
    Ok(())
}

/// A declared inner length: must be non-negative and fit in what's left.
fn checked_len(len: i32, cur: &&[u8]) -> Result<usize, Error> {
    if len < 0 || len as usize > cur.len() {
        return Err(Error::NotEnough {
            need: len.max(0) as usize,
            have: cur.len(),
        });
    }
    Ok(len as usize)
}

fn take_bytes(cur: &mut &[u8], len: usize) -> Result<Bytes, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::AllocFail(len))?;
    v.extend_from_slice(&cur[..len]);
    cur.advance(len);
    Ok(Bytes::from(v))
}
