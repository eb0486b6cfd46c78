//! Ordered, per-stream transformation of compressed packets.

use ffmpeg_next as ffmpeg;

use crate::options::{FilterOptions, FilterType};
use crate::source::SubStream;
use crate::Error;

mod annexb;
mod encode;

pub use annexb::AnnexBFilter;
pub use encode::EncodeFilter;

/// Result of one `send`/`recv` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `send`: packet accepted, output may be pending.
    /// `recv`: produced one packet; output exhausted.
    Ok,
    /// `send`: feed the packet again.
    /// `recv`: produced one packet; more may follow, call again.
    Again,
    /// `send`: this packet produced no output, move on.
    /// `recv`: output exhausted for now.
    Break,
}

/// One packet transformation stage.
///
/// `send` consumes the packet: the caller must not rely on its contents
/// afterwards. `recv` produces packets owned by the caller.
pub trait PacketFilter {
    fn send(&mut self, pkt: &ffmpeg::Packet) -> Result<Status, Error>;
    fn recv(&mut self, pkt: &mut ffmpeg::Packet) -> Result<Status, Error>;
}

/// The ordered filter chain of one sub-stream.
pub struct FilterChain {
    filters: Vec<Box<dyn PacketFilter>>,
}

impl FilterChain {
    /// Builds the chain described by `options` against `sub`. An empty list
    /// yields a pass-through chain.
    pub fn new(sub: &SubStream, options: &[FilterOptions]) -> Result<FilterChain, Error> {
        let mut filters: Vec<Box<dyn PacketFilter>> = Vec::with_capacity(options.len());
        for opt in options {
            match opt.filter_type {
                FilterType::Bsf => filters.push(Box::new(AnnexBFilter::new(sub, opt)?)),
                FilterType::Encode => filters.push(Box::new(EncodeFilter::new(sub, opt)?)),
            }
        }
        Ok(FilterChain { filters })
    }

    #[cfg(test)]
    pub(crate) fn from_filters(filters: Vec<Box<dyn PacketFilter>>) -> FilterChain {
        FilterChain { filters }
    }

    /// Runs one inbound packet through the whole chain, handing every packet
    /// that falls out of the tail to `sink`.
    pub fn feed(
        &mut self,
        pkt: &ffmpeg::Packet,
        sink: &mut dyn FnMut(&ffmpeg::Packet) -> Result<(), Error>,
    ) -> Result<(), Error> {
        feed_from(&mut self.filters, pkt, sink)
    }
}

fn feed_from(
    filters: &mut [Box<dyn PacketFilter>],
    pkt: &ffmpeg::Packet,
    sink: &mut dyn FnMut(&ffmpeg::Packet) -> Result<(), Error>,
) -> Result<(), Error> {
    let (first, rest) = match filters.split_first_mut() {
        None => return sink(pkt),
        Some(split) => split,
    };
    loop {
        match first.send(pkt)? {
            Status::Again => continue,
            Status::Break => return Ok(()),
            Status::Ok => break,
        }
    }
    let mut out = ffmpeg::Packet::empty();
    loop {
        match first.recv(&mut out)? {
            Status::Break => break,
            Status::Ok => {
                feed_from(rest, &out, sink)?;
                break;
            }
            Status::Again => {
                feed_from(rest, &out, sink)?;
            }
        }
    }
    Ok(())
}
