//! Ogg bitstream construction for the Opus and Vorbis payloads.
//!
//! Pages are built directly rather than through libogg, with the page
//! header and body kept separate so the transport receives them as a
//! unit, mirroring libogg's `ogg_page` split.

use crate::encoder::EncoderSink;

use byteorder::{LittleEndian, WriteBytesExt};
use lazy_static::lazy_static;
use rand::random;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

const PAGE_SIGNATURE: &[u8; 4] = b"OggS";
const PAGE_HEADER_SIZE: usize = 27;

/// Largest payload a single page can carry (255 lacing values).
const MAX_PAGE_PAYLOAD: usize = 255 * 255;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

lazy_static! {
    // CRC-32 with polynomial 0x04c11db7, zero initial value and no final
    // xor, as required for the Ogg page checksum.
    static ref CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut r = (i as u32) << 24;
            for _ in 0..8 {
                r = if r & 0x8000_0000 != 0 {
                    (r << 1) ^ 0x04c1_1db7
                } else {
                    r << 1
                };
            }
            *entry = r;
        }
        table
    };
}

fn crc32(seed: u32, bytes: &[u8]) -> u32 {
    bytes.iter().fold(seed, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// Picks a stream serial distinct from the one previously issued in this
/// process.
fn unique_serial() -> u32 {
    static PREVIOUS: AtomicU32 = AtomicU32::new(0);
    loop {
        let serial = random::<u32>();
        if serial != PREVIOUS.swap(serial, Ordering::Relaxed) {
            debug!(serial, "new ogg stream serial");
            return serial;
        }
    }
}

/// Little-endian byte pusher over a growable buffer.
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16_le(&mut self, v: u16) {
        self.buf
            .write_u16::<LittleEndian>(v)
            .expect("writing to a Vec cannot fail");
    }

    pub(crate) fn put_u32_le(&mut self, v: u32) {
        self.buf
            .write_u32::<LittleEndian>(v)
            .expect("writing to a Vec cannot fail");
    }

    pub(crate) fn put_u64_le(&mut self, v: u64) {
        self.buf
            .write_u64::<LittleEndian>(v)
            .expect("writing to a Vec cannot fail");
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Builds an Ogg logical bitstream from codec packets.
///
/// [`init_stream`] queues the codec's header packets; the first audio
/// [`push`] flushes each of them onto its own page (the identification
/// header must be alone on the stream's first page), after which audio
/// packets are paged out one per page to keep latency flat.
///
/// [`init_stream`]: OggPacketizer::init_stream
/// [`push`]: OggPacketizer::push
pub struct OggPacketizer {
    serial: u32,
    packet_number: u64,
    granule_pos: u64,
    page_sequence: u32,
    headers_pending: Vec<Vec<u8>>,
}

impl OggPacketizer {
    /// Creates a packetizer with a fresh serial.
    pub fn new() -> Self {
        Self {
            serial: unique_serial(),
            packet_number: 0,
            granule_pos: 0,
            page_sequence: 0,
            headers_pending: Vec::new(),
        }
    }

    /// Starts a new logical stream: regenerates the serial, resets all
    /// cursors and queues `headers` as the stream preamble (identification
    /// header first, then tags, plus any further codec setup packets).
    pub fn init_stream(&mut self, headers: Vec<Vec<u8>>) {
        self.serial = unique_serial();
        self.packet_number = 0;
        self.granule_pos = 0;
        self.page_sequence = 0;
        self.headers_pending = headers;
    }

    /// Current stream serial.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Packets accepted since [`init_stream`](OggPacketizer::init_stream).
    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// Granule position of the most recent audio page.
    pub fn granule_pos(&self) -> u64 {
        self.granule_pos
    }

    /// Appends an audio packet with its absolute granule position and
    /// pages it out. `end_of_stream` marks the stream's final packet.
    pub fn push(
        &mut self,
        packet: &[u8],
        granule: u64,
        end_of_stream: bool,
        sink: &mut dyn EncoderSink,
    ) {
        self.flush_headers(sink);

        debug_assert!(granule >= self.granule_pos, "granule must not decrease");
        self.granule_pos = self.granule_pos.max(granule);
        self.packet_number += 1;

        let eos = if end_of_stream { FLAG_EOS } else { 0 };
        self.emit_packet(packet, self.granule_pos, eos, sink);
    }

    /// Emits the queued header packets, if any are still pending. Each
    /// header gets its own page, the first carrying the
    /// beginning-of-stream flag.
    fn flush_headers(&mut self, sink: &mut dyn EncoderSink) {
        if self.headers_pending.is_empty() {
            return;
        }
        debug!(count = self.headers_pending.len(), "pushing headers to output");
        for (i, header) in std::mem::take(&mut self.headers_pending).into_iter().enumerate() {
            let flags = if i == 0 && self.packet_number == 0 {
                FLAG_BOS
            } else {
                0
            };
            self.packet_number += 1;
            self.emit_packet(&header, 0, flags, sink);
        }
    }

    /// Pages one packet, splitting it across continued pages when its
    /// segment table would overflow.
    fn emit_packet(&mut self, packet: &[u8], granule: u64, flags: u8, sink: &mut dyn EncoderSink) {
        let mut offset = 0;
        let mut first_page = true;
        loop {
            let rest = &packet[offset..];
            let complete = rest.len() < MAX_PAGE_PAYLOAD;
            let take = rest.len().min(MAX_PAGE_PAYLOAD);

            let mut page_flags = if complete { flags & FLAG_EOS } else { 0 };
            if first_page {
                page_flags |= flags & FLAG_BOS;
            } else {
                page_flags |= FLAG_CONTINUED;
            }
            // An unfinished packet pins no timestamp to its page.
            let page_granule = if complete { granule } else { u64::MAX };
            self.emit_page(&rest[..take], page_flags, page_granule, complete, sink);

            offset += take;
            first_page = false;
            if complete {
                break;
            }
        }
    }

    fn emit_page(
        &mut self,
        payload: &[u8],
        flags: u8,
        granule: u64,
        complete: bool,
        sink: &mut dyn EncoderSink,
    ) {
        // Lacing: runs of 255 plus a terminating remainder. A packet whose
        // length is an exact multiple of 255 needs the trailing zero; an
        // incomplete (continued) packet must not have one.
        let full = payload.len() / 255;
        let rem = (payload.len() % 255) as u8;
        let segments = if complete { full + 1 } else { full };

        let mut w = ByteWriter::with_capacity(PAGE_HEADER_SIZE + segments);
        w.put_bytes(PAGE_SIGNATURE);
        w.put_u8(0); // stream structure version
        w.put_u8(flags);
        w.put_u64_le(granule);
        w.put_u32_le(self.serial);
        w.put_u32_le(self.page_sequence);
        w.put_u32_le(0); // crc, patched below
        w.put_u8(segments as u8);
        for _ in 0..full {
            w.put_u8(255);
        }
        if complete {
            w.put_u8(rem);
        }
        let mut header = w.into_inner();

        let crc = crc32(crc32(0, &header), payload);
        header[22..26].copy_from_slice(&crc.to_le_bytes());

        self.page_sequence += 1;
        sink.write(&header, payload);
    }
}

impl Default for OggPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::encoder::VecSink;
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::io::Cursor;

    pub(crate) struct Page {
        pub flags: u8,
        pub granule: u64,
        pub serial: u32,
        pub sequence: u32,
        pub body: Vec<u8>,
    }

    /// Parses the pages out of a captured stream, verifying each CRC.
    pub(crate) fn parse_pages(sink: &VecSink) -> Vec<Page> {
        let mut pages = Vec::new();
        let mut at = 0;
        for &(header_len, body_len) in &sink.units {
            let header = &sink.bytes[at..at + header_len];
            let body = &sink.bytes[at + header_len..at + header_len + body_len];
            at += header_len + body_len;

            assert_eq!(&header[..4], PAGE_SIGNATURE);
            assert_eq!(header[4], 0);
            let mut rdr = Cursor::new(&header[5..]);
            let flags = rdr.read_u8().unwrap();
            let granule = rdr.read_u64::<LittleEndian>().unwrap();
            let serial = rdr.read_u32::<LittleEndian>().unwrap();
            let sequence = rdr.read_u32::<LittleEndian>().unwrap();
            let crc = rdr.read_u32::<LittleEndian>().unwrap();
            let segments = rdr.read_u8().unwrap() as usize;
            let lacing = &header[PAGE_HEADER_SIZE..];
            assert_eq!(lacing.len(), segments);
            assert_eq!(lacing.iter().map(|&l| l as usize).sum::<usize>(), body.len());

            let mut zeroed = header.to_vec();
            zeroed[22..26].fill(0);
            assert_eq!(crc, crc32(crc32(0, &zeroed), body), "page crc mismatch");

            pages.push(Page {
                flags,
                granule,
                serial,
                sequence,
                body: body.to_vec(),
            });
        }
        pages
    }

    #[test]
    fn headers_flush_on_first_push() {
        let mut ogg = OggPacketizer::new();
        ogg.init_stream(vec![vec![1; 19], vec![2; 40]]);
        assert_eq!(ogg.packet_number(), 0);

        let mut sink = VecSink::default();
        ogg.push(&[9; 100], 960, false, &mut sink);

        let pages = parse_pages(&sink);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].flags, FLAG_BOS);
        assert_eq!(pages[0].granule, 0);
        assert_eq!(pages[0].body, vec![1; 19]);
        assert_eq!(pages[1].flags, 0);
        assert_eq!(pages[1].granule, 0);
        assert_eq!(pages[2].granule, 960);
        assert_eq!(ogg.packet_number(), 3);
        assert!(pages.windows(2).all(|p| p[1].sequence == p[0].sequence + 1));
    }

    #[test]
    fn granule_is_monotonic_and_serial_stable() {
        let mut ogg = OggPacketizer::new();
        ogg.init_stream(vec![vec![0; 8]]);
        let mut sink = VecSink::default();
        ogg.push(&[1], 10, false, &mut sink);
        ogg.push(&[2], 20, false, &mut sink);
        ogg.push(&[3], 30, true, &mut sink);

        let pages = parse_pages(&sink);
        let serial = pages[0].serial;
        assert!(pages.iter().all(|p| p.serial == serial));
        let granules: Vec<u64> = pages.iter().skip(1).map(|p| p.granule).collect();
        assert_eq!(granules, vec![10, 20, 30]);
        assert_eq!(pages.last().unwrap().flags, FLAG_EOS);
    }

    #[test]
    fn new_stream_changes_serial_and_resets_counters() {
        let mut ogg = OggPacketizer::new();
        ogg.init_stream(vec![vec![0; 4]]);
        let mut sink = VecSink::default();
        ogg.push(&[1], 5, false, &mut sink);
        let first_serial = parse_pages(&sink)[0].serial;

        ogg.init_stream(vec![vec![0; 4]]);
        assert_eq!(ogg.packet_number(), 0);
        assert_eq!(ogg.granule_pos(), 0);
        let mut sink = VecSink::default();
        ogg.push(&[1], 5, false, &mut sink);
        let pages = parse_pages(&sink);
        assert_ne!(pages[0].serial, first_serial);
        assert_eq!(pages[0].sequence, 0);
    }

    #[test]
    fn lacing_handles_boundary_sizes() {
        for len in [0usize, 1, 254, 255, 510, 1000] {
            let mut ogg = OggPacketizer::new();
            ogg.init_stream(Vec::new());
            let mut sink = VecSink::default();
            ogg.push(&vec![0xAB; len], 1, false, &mut sink);
            let pages = parse_pages(&sink);
            assert_eq!(pages.len(), 1, "payload of {len} bytes fits one page");
            assert_eq!(pages[0].body.len(), len);
        }
    }

    #[test]
    fn oversized_packet_continues_across_pages() {
        let len = MAX_PAGE_PAYLOAD + 100;
        let mut ogg = OggPacketizer::new();
        ogg.init_stream(Vec::new());
        let mut sink = VecSink::default();
        ogg.push(&vec![0xCD; len], 42, false, &mut sink);

        let pages = parse_pages(&sink);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].granule, u64::MAX);
        assert_eq!(pages[0].body.len(), MAX_PAGE_PAYLOAD);
        assert_eq!(pages[1].flags, FLAG_CONTINUED);
        assert_eq!(pages[1].granule, 42);
        assert_eq!(pages[1].body.len(), 100);
    }
}
