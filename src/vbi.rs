//! Codec for VBI line slots carrying teletext: bit-to-sample expansion, framing-code search,
//! and a parser for raw VBI streams.

use super::line::{Line, Packet};
use super::t42::{read_slot, DEFAULT_TIMEBASE, T42_LINE_SIZE};
use super::{CancelToken, Error, ErrorDetails, Format, Result, Timecode};
use log::warn;
use std::io::Read;

/// Size of a single-rate VBI line slot in bytes.
pub const VBI_LINE_SIZE: usize = 720;

/// Size of a double-rate VBI line slot in bytes.
pub const VBI_DOUBLE_LINE_SIZE: usize = 1440;

/// Clock run-in bytes preceding the framing code.
pub const CLOCK_RUN_IN: [u8; 2] = [0x55, 0x55];

/// Teletext framing code.
pub const FRAMING_CODE: u8 = 0x27;

/// Sample amplitude threshold separating zero and one bits.
const SAMPLE_THRESHOLD: u8 = 0x80;

/// Encoded prefix (run-in + framing) plus payload, in bytes.
const ENCODED_BYTES: usize = CLOCK_RUN_IN.len() + 1 + T42_LINE_SIZE;

/// Expands a 42-byte T42 line into a VBI line slot.
///
/// `slot` must be [`VBI_LINE_SIZE`] (one sample per bit) or [`VBI_DOUBLE_LINE_SIZE`] (two
/// samples per bit) long; the clock run-in and framing code are written first and the remainder
/// of the slot is zero-filled.
pub fn t42_to_vbi_into(data: &[u8; T42_LINE_SIZE], slot: &mut [u8]) {
    debug_assert!(slot.len() == VBI_LINE_SIZE || slot.len() == VBI_DOUBLE_LINE_SIZE);
    let samples_per_bit = slot.len() / VBI_LINE_SIZE;
    for b in slot.iter_mut() {
        *b = 0;
    }
    let mut sample = 0;
    let bytes = CLOCK_RUN_IN
        .iter()
        .chain(std::iter::once(&FRAMING_CODE))
        .chain(data.iter());
    for &byte in bytes {
        for bit in (0..8).rev() {
            let level = if byte & (1 << bit) != 0 { 0xFF } else { 0x00 };
            for _ in 0..samples_per_bit {
                slot[sample] = level;
                sample += 1;
            }
        }
    }
}

/// Expands a 42-byte T42 line into a freshly-allocated VBI line slot.
pub fn t42_to_vbi(data: &[u8; T42_LINE_SIZE], double: bool) -> Vec<u8> {
    let mut slot = vec![
        0;
        if double {
            VBI_DOUBLE_LINE_SIZE
        } else {
            VBI_LINE_SIZE
        }
    ];
    t42_to_vbi_into(data, &mut slot);
    slot
}

/// Reads the byte decoded from `samples` starting at sample index `start`.
fn decode_byte(samples: &[u8], start: usize, samples_per_bit: usize) -> u8 {
    let mut byte = 0_u8;
    for bit in 0..8 {
        let sample = samples[start + bit * samples_per_bit];
        byte <<= 1;
        if sample >= SAMPLE_THRESHOLD {
            byte |= 1;
        }
    }
    byte
}

/// Recovers the 42 T42 bytes from a VBI line slot.
///
/// The sample rate is inferred from the slot length; the framing code is located by scanning
/// sample offsets, so payloads need not start at the slot boundary. Slots without a framing
/// code fail with [`ErrorDetails::UnexpectedEof`] at the slot length.
pub fn vbi_to_t42(slot: &[u8]) -> Result<[u8; T42_LINE_SIZE]> {
    let samples_per_bit = match slot.len() {
        VBI_LINE_SIZE => 1,
        VBI_DOUBLE_LINE_SIZE => 2,
        _ => return Err(Error::new(slot.len() as u64, ErrorDetails::UnexpectedEof)),
    };
    let needed = ENCODED_BYTES * 8 * samples_per_bit;
    if slot.len() < needed {
        return Err(Error::new(slot.len() as u64, ErrorDetails::UnexpectedEof));
    }
    for start in 0..=(slot.len() - needed) {
        if decode_byte(slot, start, samples_per_bit) != CLOCK_RUN_IN[0] {
            continue;
        }
        let stride = 8 * samples_per_bit;
        if decode_byte(slot, start + stride, samples_per_bit) != CLOCK_RUN_IN[1]
            || decode_byte(slot, start + 2 * stride, samples_per_bit) != FRAMING_CODE
        {
            continue;
        }
        let mut data = [0_u8; T42_LINE_SIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = decode_byte(slot, start + (3 + i) * stride, samples_per_bit);
        }
        return Ok(data);
    }
    Err(Error::new(slot.len() as u64, ErrorDetails::UnexpectedEof))
}

/// Parser for raw VBI streams of fixed-size line slots.
///
/// Timecodes are synthesized the same way as for raw T42 streams.
pub struct VbiParser<R> {
    reader: R,
    slot: Vec<u8>,
    format: Format,
    timecode: Timecode,
    lines_per_frame: u8,
    cancel: CancelToken,
    position: u64,
    done: bool,
}

impl<R: Read> VbiParser<R> {
    /// Creates a parser for single- or double-rate slots with the default two slots per frame.
    pub fn new(reader: R, double: bool) -> Self {
        Self::with_lines_per_frame(reader, double, 2)
    }

    /// Creates a parser grouping `lines_per_frame` line slots into each frame.
    pub fn with_lines_per_frame(reader: R, double: bool, lines_per_frame: u8) -> Self {
        let (size, format) = if double {
            (VBI_DOUBLE_LINE_SIZE, Format::VbiDouble)
        } else {
            (VBI_LINE_SIZE, Format::Vbi)
        };
        Self {
            reader,
            slot: vec![0; size],
            format,
            timecode: Timecode::zero(DEFAULT_TIMEBASE),
            lines_per_frame: lines_per_frame.max(1),
            cancel: CancelToken::new(),
            position: 0,
            done: false,
        }
    }

    /// Installs a cooperative cancellation token, checked at each packet boundary.
    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Reads the next frame's worth of line slots.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.done {
            return Ok(None);
        }
        self.cancel.check()?;
        let mut packet = Packet::new(self.timecode);
        for _ in 0..self.lines_per_frame {
            if !read_slot(&mut self.reader, &mut self.slot, self.position)? {
                self.done = true;
                break;
            }
            let offset = self.position;
            self.position += self.slot.len() as u64;
            let data = match vbi_to_t42(&self.slot) {
                Ok(data) => data,
                Err(_) => {
                    warn!("No framing code in VBI slot at offset {}", offset);
                    continue;
                }
            };
            match Line::from_t42(&data, self.timecode, self.format) {
                Some(line) => packet.lines.push(line),
                None => warn!(
                    "Discarding VBI line with undecodable address at offset {}",
                    offset
                ),
            }
        }
        if self.done && packet.lines.is_empty() {
            return Ok(None);
        }
        self.timecode.add_one_frame();
        Ok(Some(packet))
    }
}

impl<R: Read> Iterator for VbiParser<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::caption_line;

    #[test]
    fn round_trip_single_rate() {
        let data = caption_line(1, 20, "round trip");
        let slot = t42_to_vbi(&data, false);
        assert_eq!(slot.len(), VBI_LINE_SIZE);
        assert_eq!(vbi_to_t42(&slot).unwrap(), data);
    }

    #[test]
    fn round_trip_double_rate() {
        let data = caption_line(8, 0, "header row");
        let slot = t42_to_vbi(&data, true);
        assert_eq!(slot.len(), VBI_DOUBLE_LINE_SIZE);
        assert_eq!(vbi_to_t42(&slot).unwrap(), data);
    }

    #[test]
    fn framing_code_found_at_nonzero_offset() {
        let data = caption_line(3, 10, "shifted");
        let encoded = t42_to_vbi(&data, false);
        let mut slot = vec![0_u8; VBI_LINE_SIZE];
        let used = ENCODED_BYTES * 8;
        let shift = 16;
        slot[shift..shift + used].copy_from_slice(&encoded[..used]);
        assert_eq!(vbi_to_t42(&slot).unwrap(), data);
    }

    #[test]
    fn empty_slot_has_no_framing_code() {
        let slot = vec![0_u8; VBI_LINE_SIZE];
        assert!(vbi_to_t42(&slot).is_err());
    }

    #[test]
    fn parser_decodes_slots() {
        let a = caption_line(1, 20, "first");
        let b = caption_line(1, 21, "second");
        let mut stream = Vec::new();
        stream.extend_from_slice(&t42_to_vbi(&a, false));
        stream.extend_from_slice(&t42_to_vbi(&b, false));
        let mut parser = VbiParser::new(stream.as_slice(), false);
        let packet = parser.next_packet().unwrap().unwrap();
        assert_eq!(packet.lines.len(), 2);
        assert_eq!(packet.lines[0].data, a);
        assert_eq!(packet.lines[1].data, b);
        assert!(parser.next_packet().unwrap().is_none());
    }
}
