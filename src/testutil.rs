//! Shared fixtures for module tests: synthetic lines, essence payloads and MXF streams.

use crate::klv::{encode_ber_length, keys};
use crate::line::{LineHeader, LineKind};
use crate::t42::{encode_mrag, odd_parity, T42_LINE_SIZE};
use crate::Timecode;

/// Builds a parity-encoded caption line with a valid magazine/row address.
pub(crate) fn caption_line(magazine: u8, row: u8, text: &str) -> [u8; T42_LINE_SIZE] {
    let mut data = [odd_parity(b' '); T42_LINE_SIZE];
    let (b0, b1) = encode_mrag(magazine, row);
    data[0] = b0;
    data[1] = b1;
    for (i, b) in text.bytes().enumerate().take(T42_LINE_SIZE - 2) {
        data[2 + i] = odd_parity(b);
    }
    data
}

/// Builds a data essence payload of teletext lines.
pub(crate) fn essence_payload(lines: &[[u8; T42_LINE_SIZE]]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(lines.len() as u16).to_be_bytes());
    for line in lines {
        let header = LineHeader::new()
            .with_line_number(21)
            .with_wrapping(0)
            .with_sample_coding(1)
            .with_sample_count(T42_LINE_SIZE as u16)
            .with_data_count(T42_LINE_SIZE as u16)
            .with_line_type(LineKind::Teletext as u8);
        payload.extend_from_slice(&header.into_bytes());
        payload.extend_from_slice(line);
    }
    payload
}

/// Builds a 57-byte system metadata pack with the SMPTE timecode at offset 41.
pub(crate) fn system_payload(timecode: &Timecode) -> Vec<u8> {
    let mut payload = vec![0_u8; 57];
    payload[41..45].copy_from_slice(&timecode.to_smpte_bytes());
    payload
}

/// Builds a TimecodeComponent local set for the given start timecode.
pub(crate) fn timecode_component_payload(start: &Timecode) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x1502_u16.to_be_bytes());
    payload.extend_from_slice(&2_u16.to_be_bytes());
    payload.extend_from_slice(&(start.timebase() as u16).to_be_bytes());
    payload.extend_from_slice(&0x1501_u16.to_be_bytes());
    payload.extend_from_slice(&8_u16.to_be_bytes());
    payload.extend_from_slice(&start.frame_count().to_be_bytes());
    payload.extend_from_slice(&0x1503_u16.to_be_bytes());
    payload.extend_from_slice(&1_u16.to_be_bytes());
    payload.push(start.drop_frame() as u8);
    payload
}

/// Builds a 64-byte partition pack payload with plausible navigation fields.
pub(crate) fn partition_pack_payload() -> Vec<u8> {
    let mut payload = vec![0_u8; 64];
    payload[0..2].copy_from_slice(&1_u16.to_be_bytes());
    payload[2..4].copy_from_slice(&2_u16.to_be_bytes());
    payload[4..8].copy_from_slice(&0x200_u32.to_be_bytes());
    payload
}

/// Appends one complete KLV triplet.
pub(crate) fn push_klv(out: &mut Vec<u8>, key: &[u8; 16], payload: &[u8]) {
    out.extend_from_slice(key);
    encode_ber_length(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Assembles synthetic MXF streams: a header partition, an optional TimecodeComponent, and one
/// system item plus data element per frame.
pub(crate) struct MxfBuilder {
    start: Timecode,
    include_timecode_component: bool,
    frames: Vec<Vec<[u8; T42_LINE_SIZE]>>,
}

impl MxfBuilder {
    pub fn new(start: Timecode) -> Self {
        Self {
            start,
            include_timecode_component: true,
            frames: Vec::new(),
        }
    }

    pub fn without_timecode_component(mut self) -> Self {
        self.include_timecode_component = false;
        self
    }

    pub fn add_frame(&mut self, lines: &[[u8; T42_LINE_SIZE]]) {
        self.frames.push(lines.to_vec());
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_klv(&mut out, &keys::HEADER_PARTITION, &partition_pack_payload());
        if self.include_timecode_component {
            push_klv(
                &mut out,
                &keys::TIMECODE_COMPONENT,
                &timecode_component_payload(&self.start),
            );
        }
        let mut timecode = self.start;
        for lines in &self.frames {
            push_klv(&mut out, &keys::SYSTEM_ITEM, &system_payload(&timecode));
            push_klv(&mut out, &keys::DATA_ESSENCE, &essence_payload(lines));
            timecode.add_one_frame();
        }
        out
    }
}
