//! Ogg Vorbis encoding through libvorbis.
//!
//! libvorbis drives its own analysis/bitrate-management pipeline and
//! hands back packets with granule positions attached; those packets are
//! paged out through the crate's own [`OggPacketizer`].

use crate::constants::{ENGINE_CHANNELS, NETWORK_LATENCY_FRAMES, VENDOR_STRING, VORBIS_BLOCK_SIZE};
use crate::encoder::ogg::OggPacketizer;
use crate::encoder::{EncoderError, EncoderSettings, EncoderSink, PcmFifo, Result};

use std::collections::BTreeMap;
use std::ffi::CString;
use std::mem;
use std::os::raw::{c_int, c_long};
use std::ptr;

use ogg_sys::ogg_packet;
use vorbis_sys::{
    vorbis_analysis,
    vorbis_analysis_blockout,
    vorbis_analysis_buffer,
    vorbis_analysis_headerout,
    vorbis_analysis_init,
    vorbis_analysis_wrote,
    vorbis_bitrate_addblock,
    vorbis_bitrate_flushpacket,
    vorbis_block,
    vorbis_block_clear,
    vorbis_block_init,
    vorbis_comment,
    vorbis_comment_add_tag,
    vorbis_comment_clear,
    vorbis_comment_init,
    vorbis_dsp_clear,
    vorbis_dsp_state,
    vorbis_info,
    vorbis_info_clear,
    vorbis_info_init,
};
use vorbisenc_sys::vorbis_encode_init;

// The libvorbis states hold pointers into each other, so they live in one
// boxed, address-stable block.
#[repr(C)]
struct VorbisState {
    vi: vorbis_info,
    vc: vorbis_comment,
    vd: vorbis_dsp_state,
    vb: vorbis_block,
}

impl VorbisState {
    fn new() -> Box<Self> {
        Box::new(Self {
            vi: unsafe { mem::zeroed() },
            vc: unsafe { mem::zeroed() },
            vd: unsafe { mem::zeroed() },
            vb: unsafe { mem::zeroed() },
        })
    }
}

/// Vorbis encoder feeding an Ogg packetizer.
pub struct VorbisEncoder {
    settings: EncoderSettings,
    state: Option<Box<VorbisState>>,
    fifo: PcmFifo,
    chunk: Vec<f32>,
    ogg: OggPacketizer,
    comments: BTreeMap<String, String>,
}

// The raw libvorbis state is only touched from whichever thread currently
// owns the encoder.
unsafe impl Send for VorbisEncoder {}

impl VorbisEncoder {
    /// Prepares an encoder; libvorbis state is allocated by
    /// [`init`](Self::init).
    pub fn new(settings: EncoderSettings) -> Self {
        let mut comments = BTreeMap::new();
        comments.insert("ENCODER".into(), VENDOR_STRING.into());
        Self {
            settings,
            state: None,
            fifo: PcmFifo::new(2 * NETWORK_LATENCY_FRAMES * ENGINE_CHANNELS),
            chunk: vec![0.0; VORBIS_BLOCK_SIZE * ENGINE_CHANNELS],
            ogg: OggPacketizer::new(),
            comments,
        }
    }

    /// Initialises libvorbis in managed-bitrate mode and queues the three
    /// stream headers.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 96_000 {
            return Err(EncoderError::UnsupportedSampleRate {
                rate: sample_rate,
                requirement: "Ogg Vorbis does not support 96 kHz here",
            });
        }

        let channels = self.settings.channels as c_long;
        let mut state = VorbisState::new();

        unsafe {
            vorbis_info_init(&mut state.vi);
            let ret = vorbis_encode_init(
                &mut state.vi,
                channels,
                sample_rate as c_long,
                -1,
                (self.settings.bitrate * 1000) as c_long,
                -1,
            );
            if ret != 0 {
                vorbis_info_clear(&mut state.vi);
                return Err(EncoderError::Backend(format!(
                    "vorbis_encode_init failed ({ret})"
                )));
            }

            vorbis_comment_init(&mut state.vc);
            for (key, value) in &self.comments {
                let (Ok(key), Ok(value)) = (CString::new(key.as_str()), CString::new(value.as_str()))
                else {
                    continue;
                };
                vorbis_comment_add_tag(&mut state.vc, key.as_ptr(), value.as_ptr());
            }

            vorbis_analysis_init(&mut state.vd, &mut state.vi);
            vorbis_block_init(&mut state.vd, &mut state.vb);

            let mut ident: ogg_packet = mem::zeroed();
            let mut comment: ogg_packet = mem::zeroed();
            let mut setup: ogg_packet = mem::zeroed();
            vorbis_analysis_headerout(
                &mut state.vd,
                &mut state.vc,
                &mut ident,
                &mut comment,
                &mut setup,
            );
            self.ogg.init_stream(vec![
                packet_bytes(&ident),
                packet_bytes(&comment),
                packet_bytes(&setup),
            ]);
        }

        self.state = Some(state);
        Ok(())
    }

    /// Buffers input and pushes complete analysis blocks through
    /// libvorbis.
    pub fn encode_buffer(&mut self, samples: &[f32], sink: &mut dyn EncoderSink) {
        if self.state.is_none() {
            return;
        }
        self.fifo.push(samples);
        let mut chunk = std::mem::take(&mut self.chunk);
        while self.fifo.pop_chunk(&mut chunk) {
            self.submit(&chunk);
            self.drain_packets(sink);
        }
        self.chunk = chunk;
    }

    /// Deinterleaves one block into libvorbis's analysis buffers.
    fn submit(&mut self, stereo: &[f32]) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let frames = stereo.len() / ENGINE_CHANNELS;
        let channels = self.settings.channels as usize;

        unsafe {
            let buffers = std::slice::from_raw_parts(
                vorbis_analysis_buffer(&mut state.vd, frames as c_int),
                channels,
            );
            if channels == 1 {
                let mono = std::slice::from_raw_parts_mut(buffers[0], frames);
                for (i, frame) in stereo.chunks_exact(ENGINE_CHANNELS).enumerate() {
                    mono[i] = (frame[0] + frame[1]) * 0.5;
                }
            } else {
                let left = std::slice::from_raw_parts_mut(buffers[0], frames);
                let right = std::slice::from_raw_parts_mut(buffers[1], frames);
                for (i, frame) in stereo.chunks_exact(ENGINE_CHANNELS).enumerate() {
                    left[i] = frame[0];
                    right[i] = frame[1];
                }
            }
            vorbis_analysis_wrote(&mut state.vd, frames as c_int);
        }
    }

    /// Runs the analysis/bitrate loop and pages out every finished packet.
    fn drain_packets(&mut self, sink: &mut dyn EncoderSink) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        unsafe {
            while vorbis_analysis_blockout(&mut state.vd, &mut state.vb) == 1 {
                vorbis_analysis(&mut state.vb, ptr::null_mut());
                vorbis_bitrate_addblock(&mut state.vb);

                let mut op: ogg_packet = mem::zeroed();
                while vorbis_bitrate_flushpacket(&mut state.vd, &mut op) != 0 {
                    let granule = op.granulepos.max(0) as u64;
                    let eos = op.e_o_s != 0;
                    self.ogg.push(&packet_bytes(&op), granule, eos, sink);
                }
            }
        }
    }

    /// Stashes tags for the next stream header.
    pub fn update_metadata(&mut self, artist: &str, title: &str, album: &str) {
        self.comments.insert("ARTIST".into(), artist.into());
        self.comments.insert("TITLE".into(), title.into());
        self.comments.insert("ALBUM".into(), album.into());
    }

    /// Pushes the buffered remainder through the analysis loop. The
    /// stream is not ended; teardown drops the encoder instead.
    pub fn flush(&mut self, sink: &mut dyn EncoderSink) {
        if self.state.is_none() {
            return;
        }
        let rest = self.fifo.drain_all();
        if !rest.is_empty() {
            self.submit(&rest);
            self.drain_packets(sink);
        }
    }
}

impl Drop for VorbisEncoder {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            unsafe {
                vorbis_block_clear(&mut state.vb);
                vorbis_dsp_clear(&mut state.vd);
                vorbis_comment_clear(&mut state.vc);
                vorbis_info_clear(&mut state.vi);
            }
        }
    }
}

/// Copies a libvorbis packet out of its internal storage.
fn packet_bytes(op: &ogg_packet) -> Vec<u8> {
    if op.packet.is_null() || op.bytes <= 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(op.packet, op.bytes as usize).to_vec() }
}
