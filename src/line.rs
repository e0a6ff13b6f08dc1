//! In-memory teletext line and packet records shared by parsers and exporters.

use super::t42::{decode_mrag, T42_LINE_SIZE};
use super::{Format, Result, SliceReader, Timecode};
use crate::read_bitfield;
use log::{debug, warn};
use modular_bitfield_msb::prelude::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};

/// Payload type tag carried by the essence line header.
#[derive(Debug, Copy, Clone, PartialEq, FromPrimitive)]
pub enum LineKind {
    /// 42-byte teletext payload.
    Teletext = 0x01,
}

/// Fixed 14-byte header preceding each payload line inside a data essence element.
#[bitfield]
#[derive(Debug)]
pub struct LineHeader {
    /// Video line number the payload was sampled from.
    pub line_number: B16,
    /// Field/progressive wrapping mode.
    pub wrapping: B8,
    /// Sample coding of the payload bits.
    pub sample_coding: B8,
    /// Number of payload samples.
    pub sample_count: B16,
    #[skip]
    reserved0: B16,
    /// Number of payload bytes following the header.
    pub data_count: B16,
    #[skip]
    reserved1: B24,
    /// Payload type tag; `0x01` denotes teletext.
    pub line_type: B8,
}

/// Byte offset of displayable content within a 42-byte teletext payload.
///
/// Row 0 page headers carry 8 bytes of page metadata after the 2-byte magazine/row address;
/// caption rows only carry the address.
pub fn text_offset(row: u8) -> usize {
    if row == 0 {
        10
    } else {
        2
    }
}

/// A single teletext line extracted from a stream.
#[derive(Clone)]
pub struct Line {
    /// Teletext magazine, 1–8.
    pub magazine: u8,
    /// Teletext row, 0–31. Row 0 is a page header and carries metadata, not subtitle text.
    pub row: u8,
    /// Time address of the frame this line belongs to.
    pub timecode: Timecode,
    /// Raw 42-byte T42 payload.
    pub data: [u8; T42_LINE_SIZE],
    /// The format this line was decoded from.
    pub format: Format,
}

impl Line {
    /// Decodes the magazine/row address of a 42-byte payload and builds a line record.
    ///
    /// Returns [`None`] when the address bytes fail Hamming decoding.
    pub fn from_t42(data: &[u8; T42_LINE_SIZE], timecode: Timecode, format: Format) -> Option<Self> {
        let (magazine, row) = decode_mrag(data[0], data[1])?;
        Some(Self {
            magazine,
            row,
            timecode,
            data: *data,
            format,
        })
    }

    /// Decoded text preview of the display bytes.
    ///
    /// Parity bits are stripped; teletext colour codes are rendered as ANSI SGR sequences so a
    /// terminal shows the original colouring; box/height codes and other controls become spaces.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for &b in &self.data[text_offset(self.row)..] {
            let v = b & 0x7F;
            match v {
                0x00..=0x07 => out.push_str(&format!("\x1b[3{}m", v)),
                0x20..=0x7E => out.push(v as char),
                _ => out.push(' '),
            }
        }
        out
    }
}

impl Debug for Line {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("magazine", &self.magazine)
            .field("row", &self.row)
            .field("timecode", &self.timecode)
            .field("text", &crate::stl::normalize_text(&self.text()))
            .finish()
    }
}

/// A frame-sized grouping of lines sharing one SMPTE timecode.
#[derive(Debug)]
pub struct Packet {
    /// Time address of the edit unit.
    pub timecode: Timecode,
    /// Lines in parser order; OP-47 caption frames typically carry two.
    pub lines: SmallVec<[Line; 2]>,
    /// Raw payloads of keys requested via `add_required_key`, delivered per packet.
    pub raw: Vec<(crate::klv::KeyType, Vec<u8>)>,
}

impl Packet {
    /// An empty packet at the given time address.
    pub fn new(timecode: Timecode) -> Self {
        Self {
            timecode,
            lines: SmallVec::new(),
            raw: Vec::new(),
        }
    }
}

/// Parses a data essence payload (`u16` line count, then per line a 14-byte [`LineHeader`] and
/// `data_count` payload bytes) and appends the teletext lines to `out`.
///
/// Non-teletext lines and lines with undecodable addresses are skipped, not fatal.
pub(crate) fn parse_essence_lines(
    payload: &[u8],
    timecode: Timecode,
    format: Format,
    out: &mut SmallVec<[Line; 2]>,
) -> Result<()> {
    let mut reader = SliceReader::new(payload);
    let count = reader.read_be_u16()?;
    for _ in 0..count {
        let header = read_bitfield!(reader, LineHeader);
        let data = reader.read(header.data_count() as usize)?;
        match LineKind::from_u8(header.line_type()) {
            Some(LineKind::Teletext) => {}
            None => {
                debug!("Skipping line of unknown type {:#x}", header.line_type());
                continue;
            }
        }
        if data.len() != T42_LINE_SIZE {
            warn!(
                "Discarding teletext line with payload of {} bytes on line {}",
                data.len(),
                header.line_number()
            );
            continue;
        }
        let mut t42 = [0_u8; T42_LINE_SIZE];
        t42.copy_from_slice(data);
        match Line::from_t42(&t42, timecode, format) {
            Some(line) => out.push(line),
            None => warn!(
                "Discarding teletext line with undecodable address on line {}",
                header.line_number()
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{caption_line, essence_payload};

    #[test]
    fn header_layout_is_14_bytes() {
        assert_eq!(std::mem::size_of::<LineHeader>(), 14);
        let header = LineHeader::new()
            .with_line_number(0x0102)
            .with_data_count(42)
            .with_line_type(0x01);
        let bytes = header.into_bytes();
        assert_eq!(&bytes[0..2], &[0x01, 0x02]);
        assert_eq!(&bytes[8..10], &[0x00, 42]);
        assert_eq!(bytes[13], 0x01);
    }

    #[test]
    fn essence_payload_round_trip() {
        let tc = Timecode::zero(25);
        let payload = essence_payload(&[
            caption_line(1, 20, "Hello"),
            caption_line(1, 22, "world"),
        ]);
        let mut out = SmallVec::new();
        parse_essence_lines(&payload, tc, Format::Mxf, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].magazine, 1);
        assert_eq!(out[0].row, 20);
        assert_eq!(out[1].row, 22);
        assert!(out[0].text().contains("Hello"));
    }

    #[test]
    fn unknown_line_type_is_skipped() {
        let tc = Timecode::zero(25);
        let mut payload = essence_payload(&[caption_line(2, 5, "x")]);
        payload[2 + 13] = 0x7E; // line_type
        let mut out = SmallVec::new();
        parse_essence_lines(&payload, tc, Format::Mxf, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let tc = Timecode::zero(25);
        let mut payload = essence_payload(&[caption_line(1, 1, "y")]);
        payload.truncate(payload.len() - 10);
        let mut out = SmallVec::new();
        assert!(parse_essence_lines(&payload, tc, Format::Mxf, &mut out).is_err());
    }

    #[test]
    fn text_offset_depends_on_row() {
        assert_eq!(text_offset(0), 10);
        assert_eq!(text_offset(1), 2);
        assert_eq!(text_offset(24), 2);
    }
}
