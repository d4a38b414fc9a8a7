//! PCM-to-compressed-bytes transducers.
//!
//! Each destination owns one [`Encoder`], fed interleaved stereo `f32`
//! straight off its sample ring. Encoders buffer input internally, drain
//! whole codec frames as they complete, and hand finished bytes to an
//! [`EncoderSink`], header and body separately, so the transport can
//! treat them as a unit. The virtual-dispatch hierarchy of comparable
//! engines is collapsed into a tagged variant here; the operation set is
//! identical across codecs.

mod aac;
mod mp3;
pub mod ogg;
mod opus;
mod vorbis;

pub use aac::AacEncoder;
pub use mp3::Mp3Encoder;
pub use opus::OpusEncoder;
pub use vorbis::VorbisEncoder;

use crate::constants::ENGINE_CHANNELS;
use crate::profile::StreamFormat;

use std::error::Error as StdError;
use std::fmt;
use tracing::warn;

/// Receiver for encoded bytes.
///
/// Called zero or more times per [`Encoder::encode_buffer`]. `header` is
/// empty for formats without separate framing (MP3, ADTS).
pub trait EncoderSink {
    /// Delivers one encoded unit.
    fn write(&mut self, header: &[u8], body: &[u8]);
}

/// Collects encoder output into memory. Handy for tests and draining.
#[derive(Debug, Default)]
pub struct VecSink {
    /// Concatenated header+body bytes in emission order.
    pub bytes: Vec<u8>,
    /// (header, body) lengths per emission.
    pub units: Vec<(usize, usize)>,
}

impl EncoderSink for VecSink {
    fn write(&mut self, header: &[u8], body: &[u8]) {
        self.bytes.extend_from_slice(header);
        self.bytes.extend_from_slice(body);
        self.units.push((header.len(), body.len()));
    }
}

/// Resolved settings an encoder is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Target bitrate in kbps.
    pub bitrate: u32,
    /// Output channel count (1 or 2).
    pub channels: u32,
}

/// Why an encoder could not be created or initialised.
#[derive(Debug)]
#[non_exhaustive]
pub enum EncoderError {
    /// The codec cannot run at the engine's sample rate.
    UnsupportedSampleRate {
        /// Offending rate.
        rate: u32,
        /// What the codec needs instead.
        requirement: &'static str,
    },
    /// The requested configuration is outside what the backend supports.
    Unsupported(&'static str),
    /// The codec backend refused to initialise.
    Backend(String),
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedSampleRate { rate, requirement } => {
                write!(f, "sample rate {rate} Hz unsupported: {requirement}")
            },
            Self::Unsupported(what) => write!(f, "unsupported encoder configuration: {what}"),
            Self::Backend(detail) => write!(f, "codec backend error: {detail}"),
        }
    }
}

impl StdError for EncoderError {}

/// Convenience alias for encoder setup results.
pub type Result<T> = std::result::Result<T, EncoderError>;

/// A stateful PCM transducer for one stream format.
pub enum Encoder {
    /// CBR MP3 via LAME.
    Mp3(Mp3Encoder),
    /// Ogg Vorbis via libvorbis.
    Vorbis(VorbisEncoder),
    /// Ogg Opus via libopus.
    Opus(OpusEncoder),
    /// ADTS AAC via libfdk-aac.
    Aac(AacEncoder),
}

impl Encoder {
    /// Builds the encoder variant for `format` with the given settings.
    /// Allocation of codec state is deferred to [`init`](Self::init).
    pub fn new(format: StreamFormat, settings: EncoderSettings) -> Self {
        match format {
            StreamFormat::Mp3 => Self::Mp3(Mp3Encoder::new(settings)),
            StreamFormat::Vorbis => Self::Vorbis(VorbisEncoder::new(settings)),
            StreamFormat::Opus => Self::Opus(OpusEncoder::new(settings)),
            StreamFormat::Aac => Self::Aac(AacEncoder::new(settings, false)),
            StreamFormat::HeAac => Self::Aac(AacEncoder::new(settings, true)),
        }
    }

    /// Allocates codec state for the given engine sample rate.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        match self {
            Self::Mp3(e) => e.init(sample_rate),
            Self::Vorbis(e) => e.init(sample_rate),
            Self::Opus(e) => e.init(sample_rate),
            Self::Aac(e) => e.init(sample_rate),
        }
    }

    /// Accepts `frames` frames of interleaved stereo input, encoding as
    /// many whole codec frames as become available. Never blocks.
    pub fn encode_buffer(&mut self, samples: &[f32], sink: &mut dyn EncoderSink) {
        match self {
            Self::Mp3(e) => e.encode_buffer(samples, sink),
            Self::Vorbis(e) => e.encode_buffer(samples, sink),
            Self::Opus(e) => e.encode_buffer(samples, sink),
            Self::Aac(e) => e.encode_buffer(samples, sink),
        }
    }

    /// Records new track metadata. Effect is format-dependent: Ogg
    /// formats stash tags for the next stream header; MP3/AAC carry
    /// metadata out-of-band and ignore this.
    pub fn update_metadata(&mut self, artist: &str, title: &str, album: &str) {
        match self {
            Self::Mp3(_) | Self::Aac(_) => {},
            Self::Vorbis(e) => e.update_metadata(artist, title, album),
            Self::Opus(e) => e.update_metadata(artist, title, album),
        }
    }

    /// Drains whatever whole frames remain buffered. Safe to call more
    /// than once.
    pub fn flush(&mut self, sink: &mut dyn EncoderSink) {
        match self {
            Self::Mp3(e) => e.flush(sink),
            Self::Vorbis(e) => e.flush(sink),
            Self::Opus(e) => e.flush(sink),
            Self::Aac(e) => e.flush(sink),
        }
    }
}

/// Bounded staging buffer between arbitrary-sized engine writes and
/// fixed-size codec frames.
pub(crate) struct PcmFifo {
    buf: Vec<f32>,
    capacity: usize,
}

impl PcmFifo {
    /// `capacity` in samples; sized at least 2 × codec-frame × channels
    /// by callers.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends samples, dropping (and logging) whatever exceeds capacity.
    pub(crate) fn push(&mut self, samples: &[f32]) {
        let room = self.capacity - self.buf.len();
        if samples.len() > room {
            warn!(
                required = samples.len(),
                available = room,
                "input buffer too small, losing samples"
            );
        }
        let take = samples.len().min(room);
        self.buf.extend_from_slice(&samples[..take]);
    }

    /// Copies the oldest `out.len()` samples into `out` and removes them,
    /// if that many are buffered.
    pub(crate) fn pop_chunk(&mut self, out: &mut [f32]) -> bool {
        if self.buf.len() < out.len() {
            return false;
        }
        out.copy_from_slice(&self.buf[..out.len()]);
        self.buf.drain(..out.len());
        true
    }

    /// Removes and returns everything buffered.
    pub(crate) fn drain_all(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.buf)
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Folds interleaved stereo input down to the encoder's channel layout.
///
/// Stereo passes through; mono averages each frame's pair.
pub(crate) fn adapt_channels<'a>(
    stereo: &'a [f32],
    channels: u32,
    scratch: &'a mut Vec<f32>,
) -> &'a [f32] {
    if channels == ENGINE_CHANNELS as u32 {
        return stereo;
    }
    scratch.clear();
    scratch.extend(
        stereo
            .chunks_exact(ENGINE_CHANNELS)
            .map(|frame| (frame[0] + frame[1]) * 0.5),
    );
    scratch
}

/// Converts float samples in [-1, 1] to 16-bit PCM.
pub(crate) fn to_i16(samples: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
    );
}
