//! Ogg Opus encoding.

use crate::constants::{
    ENGINE_CHANNELS, MAX_OPUS_PACKET, OPUS_FRAME_SIZE, OPUS_PRE_SKIP, OPUS_SAMPLE_RATE,
    VENDOR_STRING,
};
use crate::encoder::ogg::{ByteWriter, OggPacketizer};
use crate::encoder::{adapt_channels, EncoderError, EncoderSettings, EncoderSink, PcmFifo, Result};

use audiopus::coder::Encoder as OpusCoder;
use audiopus::{Application, Bitrate, Channels, SampleRate, Signal};
use std::collections::BTreeMap;
use tracing::warn;

/// Opus encoder feeding an Ogg packetizer.
///
/// Requires 48 kHz input and encodes 40 ms frames. Track metadata only
/// takes effect in the stream's comment header: retagging a live Ogg
/// stream interrupts listeners, so tags are stashed for the next stream
/// start instead.
pub struct OpusEncoder {
    settings: EncoderSettings,
    sample_rate: u32,
    opus: Option<OpusCoder>,
    fifo: PcmFifo,
    chunk: Vec<f32>,
    mono_scratch: Vec<f32>,
    packet: [u8; MAX_OPUS_PACKET],
    ogg: OggPacketizer,
    granule: u64,
    comments: BTreeMap<String, String>,
}

impl OpusEncoder {
    /// Prepares an encoder; codec state is allocated by
    /// [`init`](Self::init).
    pub fn new(settings: EncoderSettings) -> Self {
        let mut comments = BTreeMap::new();
        comments.insert("ENCODER".into(), VENDOR_STRING.into());
        Self {
            settings,
            sample_rate: 0,
            opus: None,
            fifo: PcmFifo::new(2 * crate::constants::NETWORK_LATENCY_FRAMES * ENGINE_CHANNELS),
            chunk: vec![0.0; OPUS_FRAME_SIZE * ENGINE_CHANNELS],
            mono_scratch: Vec::new(),
            packet: [0; MAX_OPUS_PACKET],
            ogg: OggPacketizer::new(),
            granule: 0,
            comments,
        }
    }

    /// Allocates libopus state and queues the stream headers.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate != OPUS_SAMPLE_RATE {
            return Err(EncoderError::UnsupportedSampleRate {
                rate: sample_rate,
                requirement: "the Opus encoder only accepts 48000 Hz",
            });
        }
        self.sample_rate = sample_rate;

        let channels = match self.settings.channels {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        };
        let mut opus = OpusCoder::new(SampleRate::Hz48000, channels, Application::Audio)
            .map_err(|e| EncoderError::Backend(format!("opus encoder creation failed: {e}")))?;

        // Tuned for high-quality music.
        opus.set_complexity(10).map_err(setup_err)?;
        opus.set_signal(Signal::Music).map_err(setup_err)?;
        opus
            .set_bitrate(Bitrate::BitsPerSecond(self.settings.bitrate as i32 * 1000))
            .map_err(setup_err)?;

        self.opus = Some(opus);
        self.init_stream();
        Ok(())
    }

    fn init_stream(&mut self) {
        self.granule = 0;
        let headers = vec![
            build_ident_header(self.settings.channels as u8, self.sample_rate, OPUS_PRE_SKIP),
            build_tags(&self.comments),
        ];
        self.ogg.init_stream(headers);
    }

    /// Buffers input and encodes every complete 40 ms frame.
    pub fn encode_buffer(&mut self, samples: &[f32], sink: &mut dyn EncoderSink) {
        if self.opus.is_none() {
            return;
        }
        self.fifo.push(samples);
        self.drain(sink);
    }

    fn drain(&mut self, sink: &mut dyn EncoderSink) {
        let Some(opus) = self.opus.as_mut() else {
            return;
        };
        let mut chunk = std::mem::take(&mut self.chunk);
        while self.fifo.pop_chunk(&mut chunk) {
            let input = adapt_channels(&chunk, self.settings.channels, &mut self.mono_scratch);
            match opus.encode_float(input, &mut self.packet[..]) {
                Ok(written) if written > 0 => {
                    self.granule += OPUS_FRAME_SIZE as u64;
                    let packet = &self.packet[..written];
                    self.ogg.push(packet, self.granule, false, sink);
                },
                Ok(_) => {},
                Err(e) => {
                    warn!("opus encode failed: {e}");
                    break;
                },
            }
        }
        self.chunk = chunk;
    }

    /// Stashes tags for the next stream header.
    pub fn update_metadata(&mut self, artist: &str, title: &str, album: &str) {
        self.comments.insert("ARTIST".into(), artist.into());
        self.comments.insert("TITLE".into(), title.into());
        self.comments.insert("ALBUM".into(), album.into());
    }

    /// Encodes whatever complete frames remain buffered.
    pub fn flush(&mut self, sink: &mut dyn EncoderSink) {
        self.drain(sink);
    }
}

fn setup_err(e: audiopus::Error) -> EncoderError {
    EncoderError::Backend(format!("opus encoder setup failed: {e}"))
}

/// Opus identification header, 19 bytes exactly (RFC 7845 §5.1).
///
/// Multi-byte fields are little-endian; the buffer is sized to content
/// length.
pub(crate) fn build_ident_header(channels: u8, sample_rate: u32, pre_skip: u16) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(19);
    w.put_bytes(b"OpusHead");
    w.put_u8(0x01); // version
    w.put_u8(channels);
    w.put_u16_le(pre_skip);
    w.put_u32_le(sample_rate);
    w.put_u16_le(0); // output gain
    w.put_u8(0); // mapping family: one stream
    w.into_inner()
}

/// Opus comment header (RFC 7845 §5.2): vendor string plus `KEY=value`
/// comments, every length field little-endian.
pub(crate) fn build_tags(comments: &BTreeMap<String, String>) -> Vec<u8> {
    let vendor = VENDOR_STRING.as_bytes();
    let body_len: usize = comments
        .iter()
        .map(|(k, v)| 4 + k.len() + 1 + v.len())
        .sum();

    let mut w = ByteWriter::with_capacity(8 + 4 + vendor.len() + 4 + body_len);
    w.put_bytes(b"OpusTags");
    w.put_u32_le(vendor.len() as u32);
    w.put_bytes(vendor);
    w.put_u32_le(comments.len() as u32);
    for (key, value) in comments {
        let comment = format!("{key}={value}");
        w.put_u32_le(comment.len() as u32);
        w.put_bytes(comment.as_bytes());
    }
    w.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ogg::tests::parse_pages;
    use crate::encoder::VecSink;

    #[test]
    fn ident_header_bytes_are_exact() {
        let header = build_ident_header(2, 48_000, 312);
        assert_eq!(
            header,
            [
                0x4F, 0x70, 0x75, 0x73, 0x48, 0x65, 0x61, 0x64, // "OpusHead"
                0x01, 0x02, 0x38, 0x01, 0x80, 0xBB, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn tags_carry_vendor_and_comments() {
        let mut comments = BTreeMap::new();
        comments.insert("ENCODER".to_string(), "x".to_string());
        comments.insert("ARTIST".to_string(), "DJ A".to_string());
        let tags = build_tags(&comments);

        assert_eq!(&tags[..8], b"OpusTags");
        let vendor_len = u32::from_le_bytes(tags[8..12].try_into().unwrap()) as usize;
        assert_eq!(&tags[12..12 + vendor_len], VENDOR_STRING.as_bytes());
        let at = 12 + vendor_len;
        let count = u32::from_le_bytes(tags[at..at + 4].try_into().unwrap());
        assert_eq!(count, 2);
        let first_len = u32::from_le_bytes(tags[at + 4..at + 8].try_into().unwrap()) as usize;
        assert_eq!(&tags[at + 8..at + 8 + first_len], b"ARTIST=DJ A");
        // Length-exact: nothing after the last comment.
        let second_len =
            u32::from_le_bytes(tags[at + 8 + first_len..at + 12 + first_len].try_into().unwrap())
                as usize;
        assert_eq!(tags.len(), at + 12 + first_len + second_len);
    }

    #[test]
    fn silence_stream_pages_out_with_full_granule() {
        let mut enc = OpusEncoder::new(EncoderSettings {
            bitrate: 128,
            channels: 2,
        });
        enc.init(48_000).unwrap();

        let mut sink = VecSink::default();
        let silence = vec![0.0f32; 48_000 * 2];
        enc.encode_buffer(&silence, &mut sink);

        let pages = parse_pages(&sink);
        // Ident header page, tags page, then 25 audio pages of 1920 samples.
        assert_eq!(pages.len(), 2 + 25);
        assert_eq!(&pages[0].body[..8], b"OpusHead");
        assert_eq!(pages[0].granule, 0);
        assert_eq!(&pages[1].body[..8], b"OpusTags");
        assert_eq!(pages.last().unwrap().granule, 48_000);
    }

    #[test]
    fn rejects_non_48k_rates() {
        let mut enc = OpusEncoder::new(EncoderSettings {
            bitrate: 128,
            channels: 2,
        });
        assert!(matches!(
            enc.init(44_100),
            Err(EncoderError::UnsupportedSampleRate { rate: 44_100, .. })
        ));
    }

    #[test]
    fn partial_frames_wait_for_completion() {
        let mut enc = OpusEncoder::new(EncoderSettings {
            bitrate: 128,
            channels: 2,
        });
        enc.init(48_000).unwrap();

        let mut sink = VecSink::default();
        enc.encode_buffer(&vec![0.0f32; 1000 * 2], &mut sink);
        assert!(sink.units.is_empty(), "no complete frame yet");

        enc.encode_buffer(&vec![0.0f32; 920 * 2], &mut sink);
        let pages = parse_pages(&sink);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.last().unwrap().granule, 1920);
    }
}
