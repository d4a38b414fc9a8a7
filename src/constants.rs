//! Constants affecting engine buffering, connection handling and codec framing.

use std::time::Duration;

/// Number of audio channels in the engine's canonical interleaved layout.
pub const ENGINE_CHANNELS: usize = 2;

/// Fixed network latency, in frames.
///
/// Related chunk sizes: MP3 frames are 1152 samples, Ogg frames 64 to 8192
/// samples. Transmission happens at a fixed latency of 8192 frames, which is
/// 185 ms @ 44100 Hz and twice the largest engine buffer.
pub const NETWORK_LATENCY_FRAMES: usize = 8192;

/// Capacity of each worker's sample ring, in frames (743 ms @ 44100 Hz).
///
/// Normally `* 2` is sufficient; two extra chunks are allowed for the CPU
/// overload case where a broadcast thread is not scheduled in time.
pub const RING_BUFFER_FRAMES: usize = NETWORK_LATENCY_FRAMES * 4;

/// Maximum number of workers a [`NetworkStream`] will register.
///
/// The slot list is preallocated at this size so that registration never
/// reallocates under audio-thread contention.
///
/// [`NetworkStream`]: crate::stream::NetworkStream
pub const MAX_WORKERS: usize = 64;

/// Number of 500 ms iterations spent polling a pending connection.
pub const MAX_CONNECT_POLLS: u32 = 30;

/// Wait between two connection polls.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on unsent bytes queued towards one server
/// (10 s of MP3 @ 192 kbit/s). Crossing it triggers a reconnect.
///
/// Shoutcast's default receive buffer is 1048576 bytes with an
/// autodumpsourcetime of 30 s.
pub const MAX_NETWORK_CACHE: usize = 491_520;

/// Consecutive send failures tolerated before reconnecting.
pub const MAX_SEND_FAILURES: u32 = 3;

/// Backoff after the transport reports itself busy mid-send.
pub const BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// How long a worker waits on its data signal before re-checking enable flags.
pub const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Grace period when joining a worker thread at teardown.
pub const JOIN_GRACE: Duration = Duration::from_secs(4);

/// Encode cycles between two queries of the now-playing oracle.
pub const METADATA_HEARTBEAT: u32 = 16;

/// Samples per channel in one MP3 frame.
pub const MP3_FRAME_SIZE: usize = 1152;

/// Samples per channel in one AAC-LC frame.
pub const AAC_FRAME_SIZE: usize = 1024;

/// Samples per channel fed to libvorbis per analysis block.
pub const VORBIS_BLOCK_SIZE: usize = 1024;

/// Samples per channel in one Opus frame (40 ms @ 48 kHz).
pub const OPUS_FRAME_SIZE: usize = 1920;

/// Sample rate required by the Opus encoder.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Decoder warm-up samples advertised in the Opus identification header.
///
/// libopus reports a fixed 6.5 ms lookahead at 48 kHz.
pub const OPUS_PRE_SKIP: u16 = 312;

/// Output ceiling for one 40 ms Opus packet: two maximum-size 20 ms
/// frames (1275 bytes each, per RFC 6716 §3.2) plus TOC and length bytes.
pub const MAX_OPUS_PACKET: usize = 2 * 1275 + 2;

/// Vendor string written into Ogg comment headers.
pub const VENDOR_STRING: &str = concat!("aircast/", env!("CARGO_PKG_VERSION"));

/// Bitrates (kbps) offered to profiles, the intersection of what the
/// MP3/AAC/Opus/Vorbis backends accept as constant-rate targets.
pub const SUPPORTED_BITRATES: [u32; 12] = [
    32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];

/// Default bitrate for new profiles.
pub const DEFAULT_BITRATE: u32 = 128;
