//! In-place timecode rewriting for MXF files.

use super::super::klv::{KeyType, KlvReader};
use super::super::{CancelToken, Error, ErrorDetails, Result, SliceReader, Timecode};
use super::{parse_timecode_component, system_timecode_offset, TAG_DROP_FRAME, TAG_START_TIMECODE};
use log::warn;
use std::io::{Read, Seek, SeekFrom, Write};

/// Counts of the metadata rewritten by [`restripe`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestripeSummary {
    /// TimecodeComponent sets whose start value was rewritten.
    pub timecode_components: u32,
    /// System items whose SMPTE timecode bytes were rewritten.
    pub system_packets: u64,
}

/// Locations of the rewritable values inside a TimecodeComponent payload.
fn timecode_component_value_offsets(payload: &[u8]) -> Result<(Option<usize>, Option<usize>)> {
    let mut start_offset = None;
    let mut drop_frame_offset = None;
    let mut reader = SliceReader::new(payload);
    while reader.remaining_len() >= 4 {
        let tag = reader.read_be_u16()?;
        let length = reader.read_be_u16()?;
        let value_offset = reader.location();
        reader.skip(length as usize)?;
        match tag {
            TAG_START_TIMECODE if length == 8 => start_offset = Some(value_offset),
            TAG_DROP_FRAME if length == 1 => drop_frame_offset = Some(value_offset),
            _ => {}
        }
    }
    Ok((start_offset, drop_frame_offset))
}

/// Rewrites the start timecode of an MXF file in place.
///
/// Two passes over the stream: the first rewrites every TimecodeComponent start value (and drop
/// frame flag) to `start`, parsed against the timebase the file declares; the second rewrites
/// the 4 SMPTE timecode bytes of every system item to `start` plus the item's frame index.
/// Every byte outside those values is left untouched, so the operation preserves the file size
/// and is idempotent.
///
/// The cancel flag is checked at every KLV boundary. On cancellation the file is left partially
/// rewritten; callers are expected to operate on a copy.
pub fn restripe<F: Read + Write + Seek>(
    file: &mut F,
    start: &str,
    cancel: &CancelToken,
) -> Result<RestripeSummary> {
    let mut summary = RestripeSummary::default();

    // Pass 1: TimecodeComponents. The first one read supplies the timebase for parsing `start`.
    let mut klv_reader = KlvReader::new(&mut *file)?;
    klv_reader.seek_to(0)?;
    let mut payload = Vec::new();
    let mut new_start: Option<Timecode> = None;
    loop {
        cancel.check()?;
        let klv = match klv_reader.next_header()? {
            Some(klv) => klv,
            None => break,
        };
        if klv.key_type != KeyType::TimecodeComponent {
            klv_reader.skip_payload(&klv)?;
            continue;
        }
        klv_reader.read_payload(&klv, &mut payload)?;
        let (timebase, _, _) = parse_timecode_component(&payload)
            .map_err(|e| Error::new(klv.payload_offset() + e.location, e.details))?;
        let timecode = match new_start {
            Some(timecode) => timecode,
            None => {
                let timecode = Timecode::parse(start, timebase)?;
                new_start = Some(timecode);
                timecode
            }
        };
        let (start_offset, drop_frame_offset) = timecode_component_value_offsets(&payload)
            .map_err(|e| Error::new(klv.payload_offset() + e.location, e.details))?;
        let writer = klv_reader.get_mut();
        if let Some(offset) = start_offset {
            let at = klv.payload_offset() + offset as u64;
            writer
                .seek(SeekFrom::Start(at))
                .and_then(|_| writer.write_all(&timecode.frame_count().to_be_bytes()))
                .map_err(|e| Error::from_io(at, e))?;
        }
        if let Some(offset) = drop_frame_offset {
            let at = klv.payload_offset() + offset as u64;
            writer
                .seek(SeekFrom::Start(at))
                .and_then(|_| writer.write_all(&[timecode.drop_frame() as u8]))
                .map_err(|e| Error::from_io(at, e))?;
        }
        summary.timecode_components += 1;
        klv_reader.seek_to(klv.payload_offset() + klv.length)?;
    }
    let new_start = match new_start {
        Some(timecode) => timecode,
        None => {
            warn!("No TimecodeComponent to restripe; assuming timebase 25");
            Timecode::parse(start, 25)?
        }
    };

    // Pass 2: system items.
    klv_reader.seek_to(0)?;
    let mut timecode = new_start;
    loop {
        cancel.check()?;
        let klv = match klv_reader.next_header()? {
            Some(klv) => klv,
            None => break,
        };
        if klv.key_type != KeyType::System {
            klv_reader.skip_payload(&klv)?;
            continue;
        }
        match system_timecode_offset(klv.length) {
            Some(offset) => {
                let at = klv.payload_offset() + offset;
                let writer = klv_reader.get_mut();
                writer
                    .seek(SeekFrom::Start(at))
                    .and_then(|_| writer.write_all(&timecode.to_smpte_bytes()))
                    .map_err(|e| Error::from_io(at, e))?;
                summary.system_packets += 1;
            }
            None => warn!(
                "System item at {} too short for a timecode; skipping",
                klv.offset
            ),
        }
        timecode.add_one_frame();
        klv_reader.seek_to(klv.payload_offset() + klv.length)?;
    }

    file.flush().map_err(|e| Error::new(0, ErrorDetails::Io(e)))?;
    Ok(summary)
}
