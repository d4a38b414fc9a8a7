//! ADTS AAC encoding through libfdk-aac.

use crate::constants::{AAC_FRAME_SIZE, ENGINE_CHANNELS, NETWORK_LATENCY_FRAMES};
use crate::encoder::{adapt_channels, to_i16, EncoderError, EncoderSettings, EncoderSink, PcmFifo, Result};

use fdk_aac::enc::{BitRate, ChannelMode, Encoder as FdkEncoder, EncoderParams, Transport};
use tracing::warn;

/// AAC-LC encoder producing ADTS packets.
///
/// One complete 1024-sample frame in, one ADTS packet out (the ADTS
/// header is part of the body; nothing is sent as a separate header
/// unit). Metadata travels out-of-band, as for MP3.
pub struct AacEncoder {
    settings: EncoderSettings,
    he: bool,
    fdk: Option<FdkEncoder>,
    fifo: PcmFifo,
    chunk: Vec<f32>,
    mono_scratch: Vec<f32>,
    pcm: Vec<i16>,
    out: Vec<u8>,
}

impl AacEncoder {
    /// Prepares an encoder; `he` requests the HE-AAC profile. Codec
    /// state is allocated by [`init`](Self::init).
    pub fn new(settings: EncoderSettings, he: bool) -> Self {
        Self {
            settings,
            he,
            fdk: None,
            fifo: PcmFifo::new(2 * NETWORK_LATENCY_FRAMES * ENGINE_CHANNELS),
            chunk: vec![0.0; AAC_FRAME_SIZE * ENGINE_CHANNELS],
            mono_scratch: Vec::new(),
            pcm: Vec::new(),
            out: vec![0; 8192],
        }
    }

    /// Allocates and configures the libfdk context.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        if self.he {
            // The bundled backend pins the audio object type to AAC-LC.
            return Err(EncoderError::Unsupported(
                "HE-AAC requires an SBR-capable AAC backend",
            ));
        }
        let channels = match self.settings.channels {
            1 => ChannelMode::Mono,
            _ => ChannelMode::Stereo,
        };
        let fdk = FdkEncoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(self.settings.bitrate * 1000),
            sample_rate,
            transport: Transport::Adts,
            channels,
        })
        .map_err(|e| EncoderError::Backend(format!("fdk-aac setup failed: {e:?}")))?;
        self.fdk = Some(fdk);
        Ok(())
    }

    /// Buffers input and encodes every complete 1024-sample frame.
    pub fn encode_buffer(&mut self, samples: &[f32], sink: &mut dyn EncoderSink) {
        if self.fdk.is_none() {
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
        let Some(fdk) = self.fdk.as_mut() else {
            return;
        };
        let input = adapt_channels(stereo, self.settings.channels, &mut self.mono_scratch);
        to_i16(input, &mut self.pcm);

        let mut consumed = 0;
        while consumed < self.pcm.len() {
            match fdk.encode(&self.pcm[consumed..], &mut self.out) {
                Ok(info) => {
                    if info.output_size > 0 {
                        sink.write(&[], &self.out[..info.output_size]);
                    }
                    if info.input_consumed == 0 && info.output_size == 0 {
                        break;
                    }
                    consumed += info.input_consumed;
                },
                Err(e) => {
                    warn!("aac encode failed: {e:?}");
                    break;
                },
            }
        }
    }

    /// Encodes whatever complete frames remain buffered.
    pub fn flush(&mut self, sink: &mut dyn EncoderSink) {
        if self.fdk.is_none() {
            return;
        }
        let rest = self.fifo.drain_all();
        if !rest.is_empty() {
            self.encode_chunk(&rest, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::VecSink;

    #[test]
    fn he_aac_is_rejected_at_init() {
        let mut enc = AacEncoder::new(
            EncoderSettings {
                bitrate: 128,
                channels: 2,
            },
            true,
        );
        assert!(matches!(enc.init(48_000), Err(EncoderError::Unsupported(_))));
    }

    #[test]
    fn adts_packets_carry_syncword() {
        let mut enc = AacEncoder::new(
            EncoderSettings {
                bitrate: 128,
                channels: 2,
            },
            false,
        );
        enc.init(48_000).unwrap();

        let mut sink = VecSink::default();
        // Several frames of silence; fdk buffers a frame or two of delay.
        enc.encode_buffer(&vec![0.0f32; 8 * AAC_FRAME_SIZE * 2], &mut sink);
        assert!(!sink.bytes.is_empty());
        assert_eq!(sink.bytes[0], 0xFF);
        assert_eq!(sink.bytes[1] & 0xF0, 0xF0);
    }
}
