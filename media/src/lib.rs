//! Stream ingest on top of FFmpeg.
//!
//! The pipeline per stream: a [`source::Source`] wraps one upstream
//! (RTSP/device/file) as a typed packet source, a [`filter::FilterChain`]
//! transforms its compressed video packets, and an [`worker::IngestWorker`]
//! drives the two on a dedicated thread at a rate-limited cadence, handing
//! the results to a publish sink.

use std::sync::Once;

use ffmpeg_next as ffmpeg;

pub mod decode;
pub mod filter;
pub mod options;
pub mod packet;
pub mod params;
pub mod rate;
pub mod source;
pub mod worker;

pub use options::{FilterOptions, FilterType, SourceMethod, SourceOptions, VideoDecodeOptions};
pub use params::{CodecParameters, Rational};
pub use strand_wire::MediaType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing options; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Upstream ended. Recoverable: the worker may loop.
    #[error("end of stream")]
    Eof,

    #[error("decoder: {0}")]
    Decoder(String),

    #[error("encoder: {0}")]
    Encoder(String),

    #[error("no {0:?} sub-stream")]
    MissingSubStream(MediaType),

    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),
}

impl Error {
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

/// One-time FFmpeg library initialization. Safe to call repeatedly.
pub fn init() -> Result<(), Error> {
    static INIT: Once = Once::new();
    let mut result = Ok(());
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            result = Err(Error::Ffmpeg(e));
        }
    });
    result
}
