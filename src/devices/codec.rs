//! Wire codecs for the OpenBCI serial protocols. Pure byte-level parsing so
//! the framing logic stays testable without hardware.

/// Cyton frame layout: START, counter, 8×3 channel bytes, 3×2 aux bytes, STOP.
pub const CYTON_FRAME_LEN: usize = 33;
pub const CYTON_START: u8 = 0xA0;
pub const CYTON_STOP: u8 = 0xC0;

/// Microvolts per 24-bit count at the default gain of 24.
pub const CYTON_SCALE_UV: f64 = (4.5 / 24.0) / ((1 << 23) as f64 - 1.0) * 1_000_000.0;

/// Microvolts per 19-bit Ganglion count.
pub const GANGLION_SCALE_UV: f64 = 1.2 * 8_388_607.0 / 1_000_000.0;

pub const GANGLION_FRAME_LEN: usize = 20;
pub const GANGLION_IMPEDANCE_TYPE: u8 = 206;

#[derive(Clone, Debug, PartialEq)]
pub struct CytonFrame {
    pub counter: u8,
    /// Raw sign-extended 24-bit channel counts.
    pub raw: [i32; 8],
    /// Channel values in microvolts.
    pub channels_uv: [f32; 8],
    pub aux: [i16; 3],
}

/// Sign-extends a big-endian 24-bit word.
fn i24_from_be(bytes: &[u8]) -> i32 {
    let value = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    if value > 0x7F_FFFF {
        value as i32 - 0x100_0000
    } else {
        value as i32
    }
}

/// Decodes one well-framed Cyton packet. Returns None when the start or stop
/// marker is wrong.
pub fn decode_cyton_frame(packet: &[u8]) -> Option<CytonFrame> {
    if packet.len() != CYTON_FRAME_LEN
        || packet[0] != CYTON_START
        || packet[32] != CYTON_STOP
    {
        return None;
    }
    let mut raw = [0i32; 8];
    let mut channels_uv = [0f32; 8];
    for ch in 0..8 {
        let base = 2 + ch * 3;
        raw[ch] = i24_from_be(&packet[base..base + 3]);
        channels_uv[ch] = (raw[ch] as f64 * CYTON_SCALE_UV) as f32;
    }
    let mut aux = [0i16; 3];
    for (i, a) in aux.iter_mut().enumerate() {
        let base = 26 + i * 2;
        *a = i16::from_be_bytes([packet[base], packet[base + 1]]);
    }
    Some(CytonFrame {
        counter: packet[1],
        raw,
        channels_uv,
        aux,
    })
}

/// Builds a valid Cyton packet from raw counts; used by tests and the serial
/// loopback self-test.
pub fn encode_cyton_frame(counter: u8, raw: &[i32; 8], aux: &[i16; 3]) -> [u8; CYTON_FRAME_LEN] {
    let mut out = [0u8; CYTON_FRAME_LEN];
    out[0] = CYTON_START;
    out[1] = counter;
    for (ch, &v) in raw.iter().enumerate() {
        let u = (v & 0x00FF_FFFF) as u32;
        let base = 2 + ch * 3;
        out[base] = (u >> 16) as u8;
        out[base + 1] = (u >> 8) as u8;
        out[base + 2] = u as u8;
    }
    for (i, &a) in aux.iter().enumerate() {
        let base = 26 + i * 2;
        let bytes = a.to_be_bytes();
        out[base] = bytes[0];
        out[base + 1] = bytes[1];
    }
    out[32] = CYTON_STOP;
    out
}

/// Streaming Cyton decoder with resynchronization and loss accounting.
#[derive(Debug, Default)]
pub struct CytonDecoder {
    buffer: Vec<u8>,
    last_counter: Option<u8>,
    pub packets_decoded: u64,
    pub packets_dropped: u64,
    pub bytes_skipped: u64,
}

impl CytonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_counter = None;
    }

    /// Feeds raw serial bytes and returns every completed frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<CytonFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Resync: find the next plausible frame head (START with STOP at
            // the expected offset).
            let mut head = None;
            let mut scan = 0usize;
            while scan + CYTON_FRAME_LEN <= self.buffer.len() {
                if self.buffer[scan] == CYTON_START
                    && self.buffer[scan + CYTON_FRAME_LEN - 1] == CYTON_STOP
                {
                    head = Some(scan);
                    break;
                }
                scan += 1;
            }
            let Some(head) = head else {
                // Keep at most one frame's worth of tail bytes for the next
                // push; everything older can never frame.
                if self.buffer.len() > CYTON_FRAME_LEN {
                    let drop = self.buffer.len() - CYTON_FRAME_LEN;
                    self.buffer.drain(..drop);
                    self.bytes_skipped += drop as u64;
                }
                break;
            };
            if head > 0 {
                self.bytes_skipped += head as u64;
                self.buffer.drain(..head);
            }
            let packet: Vec<u8> = self.buffer.drain(..CYTON_FRAME_LEN).collect();
            match decode_cyton_frame(&packet) {
                Some(frame) => {
                    if let Some(last) = self.last_counter {
                        let expected = last.wrapping_add(1);
                        if frame.counter != expected {
                            self.packets_dropped +=
                                frame.counter.wrapping_sub(expected) as u64;
                        }
                    }
                    self.last_counter = Some(frame.counter);
                    self.packets_decoded += 1;
                    frames.push(frame);
                }
                None => {
                    // Framing looked right but markers disagreed; skip the
                    // start byte and rescan.
                    self.packets_dropped += 1;
                }
            }
        }
        frames
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GanglionPacket {
    Data {
        counter: u8,
        channels_uv: [f32; 4],
        accel: [i16; 3],
    },
    Impedance(Vec<u8>),
    Status(Vec<u8>),
}

/// Sign-extends a 19-bit value carried in a 24-bit big-endian field.
fn i19_from_be(bytes: &[u8]) -> i32 {
    let value = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    let value = value & 0x7_FFFF;
    if value > 0x3_FFFF {
        value as i32 - 0x8_0000
    } else {
        value as i32
    }
}

/// Decodes one Ganglion packet by its type tag.
pub fn decode_ganglion_packet(packet: &[u8]) -> Option<GanglionPacket> {
    if packet.len() < 12 {
        return None;
    }
    let packet_type = packet[0];
    if packet_type <= 200 {
        if packet.len() != GANGLION_FRAME_LEN {
            return None;
        }
        let mut channels_uv = [0f32; 4];
        for ch in 0..4 {
            let base = 1 + ch * 3;
            let raw = i19_from_be(&packet[base..base + 3]);
            channels_uv[ch] = (raw as f64 * GANGLION_SCALE_UV) as f32;
        }
        let mut accel = [0i16; 3];
        for (i, a) in accel.iter_mut().enumerate() {
            let base = 13 + i * 2;
            *a = i16::from_be_bytes([packet[base], packet[base + 1]]);
        }
        Some(GanglionPacket::Data {
            counter: packet_type,
            channels_uv,
            accel,
        })
    } else if packet_type == GANGLION_IMPEDANCE_TYPE {
        Some(GanglionPacket::Impedance(packet[1..].to_vec()))
    } else {
        Some(GanglionPacket::Status(packet.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn cyton_round_trip_is_bit_exact() {
        let mut rng = StdRng::seed_from_u64(99);
        for counter in 0..=255u8 {
            let mut raw = [0i32; 8];
            for v in raw.iter_mut() {
                *v = rng.gen_range(-(1 << 23)..(1 << 23));
            }
            let aux = [
                rng.gen_range(i16::MIN..i16::MAX),
                rng.gen_range(i16::MIN..i16::MAX),
                0,
            ];
            let packet = encode_cyton_frame(counter, &raw, &aux);
            let frame = decode_cyton_frame(&packet).unwrap();
            assert_eq!(frame.counter, counter);
            assert_eq!(frame.raw, raw);
            assert_eq!(frame.aux, aux);
            for ch in 0..8 {
                let expected = (raw[ch] as f64 * CYTON_SCALE_UV) as f32;
                assert_eq!(frame.channels_uv[ch].to_bits(), expected.to_bits());
            }
        }
    }

    #[test]
    fn bad_markers_are_rejected() {
        let packet = encode_cyton_frame(0, &[0; 8], &[0; 3]);
        let mut broken = packet;
        broken[0] = 0x00;
        assert!(decode_cyton_frame(&broken).is_none());
        let mut broken = packet;
        broken[32] = 0x00;
        assert!(decode_cyton_frame(&broken).is_none());
    }

    #[test]
    fn decoder_resyncs_after_garbage() {
        let mut decoder = CytonDecoder::new();
        let mut stream = vec![0x13u8, 0x37, 0xA0, 0x01];
        stream.extend_from_slice(&encode_cyton_frame(0, &[1; 8], &[0; 3]));
        stream.extend_from_slice(&encode_cyton_frame(1, &[2; 8], &[0; 3]));
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].counter, 0);
        assert_eq!(frames[1].counter, 1);
        assert!(decoder.bytes_skipped >= 4);
    }

    #[test]
    fn decoder_handles_partial_pushes() {
        let mut decoder = CytonDecoder::new();
        let packet = encode_cyton_frame(7, &[42; 8], &[1, 2, 3]);
        let frames = decoder.push(&packet[..20]);
        assert!(frames.is_empty());
        let frames = decoder.push(&packet[20..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].counter, 7);
    }

    #[test]
    fn counter_gaps_increment_the_drop_counter() {
        let mut decoder = CytonDecoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_cyton_frame(10, &[0; 8], &[0; 3]));
        stream.extend_from_slice(&encode_cyton_frame(14, &[0; 8], &[0; 3]));
        decoder.push(&stream);
        assert_eq!(decoder.packets_dropped, 3);
    }

    #[test]
    fn counter_wrap_is_not_a_gap() {
        let mut decoder = CytonDecoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_cyton_frame(255, &[0; 8], &[0; 3]));
        stream.extend_from_slice(&encode_cyton_frame(0, &[0; 8], &[0; 3]));
        decoder.push(&stream);
        assert_eq!(decoder.packets_dropped, 0);
        assert_eq!(decoder.packets_decoded, 2);
    }

    #[test]
    fn corrupted_stream_recovers_with_bounded_loss() {
        // 1000 packets with wrapping counters; 10 random single-byte hits.
        let mut rng = StdRng::seed_from_u64(1234);
        let mut stream = Vec::new();
        for i in 0..1000u32 {
            let raw = [i as i32 % 1000; 8];
            stream.extend_from_slice(&encode_cyton_frame((i % 256) as u8, &raw, &[0; 3]));
        }
        // Corrupt framing markers specifically: those are the packets that
        // must be lost and re-found.
        let mut victims = std::collections::BTreeSet::new();
        while victims.len() < 10 {
            victims.insert(rng.gen_range(1..1000usize));
        }
        for victim in victims {
            stream[victim * CYTON_FRAME_LEN] ^= 0xFF;
        }
        let mut decoder = CytonDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(97) {
            decoded.extend(decoder.push(chunk));
        }
        assert!(decoded.len() >= 990, "decoded {}", decoded.len());
        assert!(decoder.packets_dropped >= 10);
        // Counters must follow the expected wrap except at corruption points.
        let mut violations = 0;
        for pair in decoded.windows(2) {
            if pair[1].counter != pair[0].counter.wrapping_add(1) {
                violations += 1;
            }
        }
        assert!(violations <= 10);
    }

    #[test]
    fn ganglion_data_packet_round_trip() {
        let mut packet = [0u8; GANGLION_FRAME_LEN];
        packet[0] = 42; // counter / type
        // Channel 0 = 1000 counts, channel 1 = -1000 counts.
        let enc = |v: i32| -> [u8; 3] {
            let u = (v & 0x7_FFFF) as u32;
            [(u >> 16) as u8, (u >> 8) as u8, u as u8]
        };
        packet[1..4].copy_from_slice(&enc(1000));
        packet[4..7].copy_from_slice(&enc(-1000));
        packet[13] = 0x01;
        packet[14] = 0x00;
        let decoded = decode_ganglion_packet(&packet).unwrap();
        match decoded {
            GanglionPacket::Data {
                counter,
                channels_uv,
                accel,
            } => {
                assert_eq!(counter, 42);
                let scale = GANGLION_SCALE_UV as f32;
                assert!((channels_uv[0] - 1000.0 * scale).abs() < 1e-3);
                assert!((channels_uv[1] + 1000.0 * scale).abs() < 1e-3);
                assert_eq!(accel[0], 256);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn ganglion_impedance_and_status_tags() {
        let mut packet = vec![GANGLION_IMPEDANCE_TYPE];
        packet.extend_from_slice(&[5u8; 15]);
        assert!(matches!(
            decode_ganglion_packet(&packet).unwrap(),
            GanglionPacket::Impedance(_)
        ));
        let mut packet = vec![210u8];
        packet.extend_from_slice(b"status line....");
        assert!(matches!(
            decode_ganglion_packet(&packet).unwrap(),
            GanglionPacket::Status(_)
        ));
    }
}
