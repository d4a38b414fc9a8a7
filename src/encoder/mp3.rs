//! CBR MP3 encoding through LAME.

use crate::constants::{ENGINE_CHANNELS, MP3_FRAME_SIZE, NETWORK_LATENCY_FRAMES};
use crate::encoder::{adapt_channels, to_i16, EncoderError, EncoderSettings, EncoderSink, PcmFifo, Result};

use mp3lame_encoder::{Birtate, Builder, FlushNoGap, InterleavedPcm, MonoPcm, Quality};
use std::mem::MaybeUninit;
use tracing::warn;

/// MP3 encoder.
///
/// Emits raw MP3 frames as body bytes with no separate header. Track
/// metadata travels out-of-band (ICY `song` updates), so
/// `update_metadata` has no in-band effect for this format.
pub struct Mp3Encoder {
    settings: EncoderSettings,
    lame: Option<mp3lame_encoder::Encoder>,
    fifo: PcmFifo,
    chunk: Vec<f32>,
    mono_scratch: Vec<f32>,
    pcm: Vec<i16>,
    out: Vec<MaybeUninit<u8>>,
}

impl Mp3Encoder {
    /// Prepares an encoder; LAME state is allocated by
    /// [`init`](Self::init).
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            lame: None,
            fifo: PcmFifo::new(2 * NETWORK_LATENCY_FRAMES * ENGINE_CHANNELS),
            chunk: vec![0.0; MP3_FRAME_SIZE * ENGINE_CHANNELS],
            mono_scratch: Vec::new(),
            pcm: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Allocates and configures the LAME context.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        let mut builder =
            Builder::new().ok_or_else(|| EncoderError::Backend("could not allocate LAME context".into()))?;
        builder
            .set_num_channels(self.settings.channels as u8)
            .map_err(build_err)?;
        builder.set_sample_rate(sample_rate).map_err(build_err)?;
        builder
            .set_brate(bitrate_for(self.settings.bitrate)?)
            .map_err(build_err)?;
        builder.set_quality(Quality::Best).map_err(build_err)?;
        self.lame = Some(builder.build().map_err(build_err)?);
        Ok(())
    }

    /// Buffers input and encodes every complete 1152-sample frame.
    pub fn encode_buffer(&mut self, samples: &[f32], sink: &mut dyn EncoderSink) {
        if self.lame.is_none() {
            return;
        }
        self.fifo.push(samples);
        let mut chunk = std::mem::take(&mut self.chunk);
        while self.fifo.pop_chunk(&mut chunk) {
            self.encode_chunk(&chunk, sink);
        }
        self.chunk = chunk;
    }

    fn encode_chunk(&mut self, stereo: &[f32], sink: &mut dyn EncoderSink) {
        let Some(lame) = self.lame.as_mut() else {
            return;
        };
        let input = adapt_channels(stereo, self.settings.channels, &mut self.mono_scratch);
        to_i16(input, &mut self.pcm);

        // Worst-case MP3 output for n samples, per the LAME docs.
        let cap = self.pcm.len() * 5 / 4 + 7200;
        self.out.resize(cap, MaybeUninit::uninit());

        let encoded = if self.settings.channels == 1 {
            lame.encode(MonoPcm(&self.pcm), &mut self.out)
        } else {
            lame.encode(InterleavedPcm(&self.pcm), &mut self.out)
        };
        match encoded {
            Ok(written) if written > 0 => {
                // SAFETY: LAME initialised exactly `written` bytes.
                let bytes = unsafe {
                    std::slice::from_raw_parts(self.out.as_ptr().cast::<u8>(), written)
                };
                sink.write(&[], bytes);
            },
            Ok(_) => {},
            Err(e) => warn!("mp3 encode failed: {e:?}"),
        }
    }

    /// Encodes the buffered remainder and drains LAME's internal state.
    pub fn flush(&mut self, sink: &mut dyn EncoderSink) {
        if self.lame.is_none() {
            return;
        }
        let rest = self.fifo.drain_all();
        if !rest.is_empty() {
            self.encode_chunk(&rest, sink);
        }

        let Some(lame) = self.lame.as_mut() else {
            return;
        };
        self.out.resize(7200, MaybeUninit::uninit());
        match lame.flush::<FlushNoGap>(&mut self.out) {
            Ok(written) if written > 0 => {
                // SAFETY: LAME initialised exactly `written` bytes.
                let bytes = unsafe {
                    std::slice::from_raw_parts(self.out.as_ptr().cast::<u8>(), written)
                };
                sink.write(&[], bytes);
            },
            Ok(_) => {},
            Err(e) => warn!("mp3 flush failed: {e:?}"),
        }
    }
}

fn build_err(e: mp3lame_encoder::BuildError) -> EncoderError {
    EncoderError::Backend(format!("LAME setup failed: {e:?}"))
}

fn bitrate_for(kbps: u32) -> Result<Birtate> {
    Ok(match kbps {
        8 => Birtate::Kbps8,
        16 => Birtate::Kbps16,
        24 => Birtate::Kbps24,
        32 => Birtate::Kbps32,
        40 => Birtate::Kbps40,
        48 => Birtate::Kbps48,
        64 => Birtate::Kbps64,
        80 => Birtate::Kbps80,
        96 => Birtate::Kbps96,
        112 => Birtate::Kbps112,
        128 => Birtate::Kbps128,
        160 => Birtate::Kbps160,
        192 => Birtate::Kbps192,
        224 => Birtate::Kbps224,
        256 => Birtate::Kbps256,
        320 => Birtate::Kbps320,
        _ => return Err(EncoderError::Unsupported("bitrate not offered by LAME")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::VecSink;

    #[test]
    fn frames_emit_only_once_complete() {
        let mut enc = Mp3Encoder::new(EncoderSettings {
            bitrate: 192,
            channels: 2,
        });
        enc.init(44_100).unwrap();

        let mut sink = VecSink::default();
        enc.encode_buffer(&vec![0.0f32; 1000 * 2], &mut sink);
        assert!(sink.bytes.is_empty());

        enc.encode_buffer(&vec![0.0f32; 2000 * 2], &mut sink);
        // 3000 frames buffered: two 1152-sample frames encoded.
        assert!(!sink.bytes.is_empty());
        // MP3 frame sync word on the first emitted frame.
        assert_eq!(sink.bytes[0], 0xFF);
        assert_eq!(sink.bytes[1] & 0xE0, 0xE0);
    }

    #[test]
    fn unknown_bitrate_is_rejected() {
        let mut enc = Mp3Encoder::new(EncoderSettings {
            bitrate: 123,
            channels: 2,
        });
        assert!(matches!(
            enc.init(44_100),
            Err(EncoderError::Unsupported(_))
        ));
    }

    #[test]
    fn flush_drains_partial_input() {
        let mut enc = Mp3Encoder::new(EncoderSettings {
            bitrate: 128,
            channels: 2,
        });
        enc.init(48_000).unwrap();

        let mut sink = VecSink::default();
        enc.encode_buffer(&vec![0.0f32; 500 * 2], &mut sink);
        assert!(sink.bytes.is_empty());
        enc.flush(&mut sink);
        assert!(!sink.bytes.is_empty());
    }
}
