//! Demultiplexer for MXF files carrying teletext data essence.
//!
//! Walks the KLV stream, recovers the start timecode from the first TimecodeComponent
//! metadata set, and yields one [`Packet`] per edit unit with per-frame SMPTE timecodes
//! decoded from system items.

use super::klv::{KeyType, Klv, KlvReader};
use super::line::parse_essence_lines;
use super::timecode::VALID_TIMEBASES;
use super::{CancelToken, Error, ErrorDetails, Format, Packet, Result, SliceReader, Timecode};
use log::{debug, warn};
use smallvec::SmallVec;
use std::io::{Read, Seek};

mod restripe;
pub use restripe::{restripe, RestripeSummary};

/// Default cap on the header scan for a TimecodeComponent, in bytes.
pub const DEFAULT_HEADER_SCAN_LIMIT: u64 = 128 * 1024;

/// Timebase assumed when no TimecodeComponent is present.
const FALLBACK_TIMEBASE: u8 = 25;

/// TimecodeComponent local tag: start timecode as a frame count.
const TAG_START_TIMECODE: u16 = 0x1501;
/// TimecodeComponent local tag: rounded timecode base.
const TAG_ROUNDED_TIMECODE_BASE: u16 = 0x1502;
/// TimecodeComponent local tag: drop frame flag.
const TAG_DROP_FRAME: u16 = 0x1503;

/// Index table segment local tags.
const TAG_INDEX_EDIT_RATE: u16 = 0x3F0B;
const TAG_INDEX_DURATION: u16 = 0x3F0D;
const TAG_EDIT_UNIT_BYTE_COUNT: u16 = 0x3F05;
const TAG_INDEX_ENTRY_ARRAY: u16 = 0x3F0A;

/// Byte offset of the SMPTE timecode within a system item payload of `length` bytes, or
/// [`None`] when the payload is too short to carry one.
///
/// Offset 41 fits a SMPTE 385M system metadata pack; offset 12 fits a system metadata set.
pub(crate) fn system_timecode_offset(length: u64) -> Option<u64> {
    if length >= 45 {
        Some(41)
    } else if length >= 16 {
        Some(12)
    } else {
        None
    }
}

/// Parsed fixed header of an MXF partition pack. Used only for navigation.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPack {
    /// Major version of the MXF byte-level format.
    pub major_version: u16,
    /// Minor version of the MXF byte-level format.
    pub minor_version: u16,
    /// KLV alignment grid size.
    pub kag_size: u32,
    /// Offset of this partition relative to the start of the file.
    pub this_partition: i64,
    /// Offset of the previous partition, or 0.
    pub previous_partition: i64,
    /// Offset of the footer partition, or 0 if not yet known.
    pub footer_partition: i64,
}

impl PartitionPack {
    /// Parses the fixed portion of a partition pack payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 64 {
            return Err(Error::new(
                payload.len() as u64,
                ErrorDetails::MxfParse("partition pack shorter than 64 bytes"),
            ));
        }
        let mut reader = SliceReader::new(payload);
        Ok(Self {
            major_version: reader.read_be_u16()?,
            minor_version: reader.read_be_u16()?,
            kag_size: reader.read_be_u32()?,
            this_partition: reader.read_be_i64()?,
            previous_partition: reader.read_be_i64()?,
            footer_partition: reader.read_be_i64()?,
        })
    }
}

/// Edit-unit location table recovered from an index table segment.
#[derive(Debug, Clone, Default)]
pub struct MxfIndex {
    /// Edit rate as a rational number of edit units per second.
    pub edit_rate: (u32, u32),
    /// Byte offset of the essence start within the file.
    pub body_partition_offset: u64,
    /// Number of indexed edit units.
    pub edit_unit_count: u64,
    /// Whether every edit unit occupies the same number of bytes.
    pub is_constant_byte_size: bool,
    /// Byte size of each edit unit when constant.
    pub constant_edit_unit_byte_count: u32,
    /// Per-edit-unit byte offsets relative to the essence start, when not constant.
    pub stream_offsets: Vec<u64>,
}

impl MxfIndex {
    /// Parses an index table segment local set. The body partition offset is filled in by the
    /// parser once the essence start is known.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut index = Self::default();
        let mut reader = SliceReader::new(payload);
        while reader.remaining_len() >= 4 {
            let tag = reader.read_be_u16()?;
            let length = reader.read_be_u16()?;
            let mut value = reader.new_sub_reader(length as usize)?;
            match tag {
                TAG_INDEX_EDIT_RATE => {
                    index.edit_rate = (value.read_be_u32()?, value.read_be_u32()?);
                }
                TAG_INDEX_DURATION => {
                    index.edit_unit_count = value.read_be_u64()?;
                }
                TAG_EDIT_UNIT_BYTE_COUNT => {
                    index.constant_edit_unit_byte_count = value.read_be_u32()?;
                    index.is_constant_byte_size = index.constant_edit_unit_byte_count != 0;
                }
                TAG_INDEX_ENTRY_ARRAY => {
                    let count = value.read_be_u32()?;
                    let entry_len = value.read_be_u32()? as usize;
                    if entry_len < 11 {
                        return Err(value.make_error(ErrorDetails::MxfParse(
                            "index entry shorter than 11 bytes",
                        )));
                    }
                    index.stream_offsets.reserve(count as usize);
                    for _ in 0..count {
                        let mut entry = value.new_sub_reader(entry_len)?;
                        entry.skip(3)?;
                        index.stream_offsets.push(entry.read_be_u64()?);
                    }
                }
                _ => {}
            }
        }
        if !index.is_constant_byte_size {
            index.edit_unit_count = index.stream_offsets.len() as u64;
        }
        Ok(index)
    }

    /// Byte offset of edit unit `i` within the file.
    pub fn offset_of(&self, i: u64) -> Option<u64> {
        if i >= self.edit_unit_count {
            return None;
        }
        if self.is_constant_byte_size {
            Some(self.body_partition_offset + i * self.constant_edit_unit_byte_count as u64)
        } else {
            self.stream_offsets
                .get(i as usize)
                .map(|o| self.body_partition_offset + o)
        }
    }

    /// Byte offset of edit unit `i`'s system packet payload, past the 16-byte key.
    pub fn system_packet_offset(&self, i: u64) -> Option<u64> {
        self.offset_of(i).map(|o| o + 16)
    }
}

/// Parses a TimecodeComponent local set into `(timebase, drop_frame, start_frames)`.
pub(crate) fn parse_timecode_component(payload: &[u8]) -> Result<(u8, bool, u64)> {
    let mut timebase = FALLBACK_TIMEBASE;
    let mut drop_frame = false;
    let mut start_frames = 0;
    let mut reader = SliceReader::new(payload);
    while reader.remaining_len() >= 4 {
        let tag = reader.read_be_u16()?;
        let length = reader.read_be_u16()?;
        let mut value = reader.new_sub_reader(length as usize)?;
        match tag {
            TAG_ROUNDED_TIMECODE_BASE => {
                let base = value.read_be_u16()?;
                if base <= u8::MAX as u16 && VALID_TIMEBASES.contains(&(base as u8)) {
                    timebase = base as u8;
                } else {
                    warn!("Unusable timecode base {}; assuming {}", base, FALLBACK_TIMEBASE);
                }
            }
            TAG_START_TIMECODE => {
                start_frames = value.read_be_u64()?;
            }
            TAG_DROP_FRAME => {
                drop_frame = value.read_u8()? != 0;
            }
            _ => {}
        }
    }
    if drop_frame && timebase != 30 && timebase != 60 {
        warn!("Ignoring drop frame flag at timebase {}", timebase);
        drop_frame = false;
    }
    Ok((timebase, drop_frame, start_frames))
}

/// MXF demultiplexer yielding one [`Packet`] per edit unit.
///
/// # Example
///
/// ```no_run
/// use teletext_io::mxf::MxfParser;
/// use std::fs::File;
///
/// let file = File::open("captions.mxf").expect("unable to open!");
/// let mut parser = MxfParser::new(file)?;
/// println!("essence starts at {}", parser.start_timecode());
/// while let Some(packet) = parser.next_packet()? {
///     for line in &packet.lines {
///         println!("{} {:?}", packet.timecode, line);
///     }
/// }
/// # Ok::<(), teletext_io::Error>(())
/// ```
pub struct MxfParser<R: Read + Seek> {
    klv: KlvReader<R>,
    pending: Option<Klv>,
    payload: Vec<u8>,
    start_timecode: Timecode,
    timecode_component_found: bool,
    timebase: u8,
    next_frame_index: u64,
    required: SmallVec<[KeyType; 2]>,
    index: Option<MxfIndex>,
    header_partition: Option<PartitionPack>,
    cancel: CancelToken,
    done: bool,
}

impl<R: Read + Seek> MxfParser<R> {
    /// Opens a reader and scans the header with the default byte cap.
    pub fn new(reader: R) -> Result<Self> {
        Self::with_header_scan_limit(reader, DEFAULT_HEADER_SCAN_LIMIT)
    }

    /// Opens a reader, bounding the TimecodeComponent search to `limit` bytes.
    pub fn with_header_scan_limit(reader: R, limit: u64) -> Result<Self> {
        let mut parser = Self {
            klv: KlvReader::new(reader)?,
            pending: None,
            payload: Vec::new(),
            start_timecode: Timecode::zero(FALLBACK_TIMEBASE),
            timecode_component_found: false,
            timebase: FALLBACK_TIMEBASE,
            next_frame_index: 0,
            required: SmallVec::new(),
            index: None,
            header_partition: None,
            cancel: CancelToken::new(),
            done: false,
        };
        parser.scan_header(limit)?;
        Ok(parser)
    }

    /// Installs a cooperative cancellation token, checked at each packet boundary.
    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Requests that payloads of `key_type` be surfaced raw on each packet instead of skipped.
    pub fn add_required_key(&mut self, key_type: KeyType) {
        if !self.required.contains(&key_type) {
            self.required.push(key_type);
        }
    }

    /// The essence start timecode, from the TimecodeComponent or synthesized at 00:00:00:00.
    pub fn start_timecode(&self) -> Timecode {
        self.start_timecode
    }

    /// Whether a TimecodeComponent was found during the header scan.
    pub fn has_timecode_component(&self) -> bool {
        self.timecode_component_found
    }

    /// The stream timebase in frames per second.
    pub fn timebase(&self) -> u8 {
        self.timebase
    }

    /// The edit-unit index recovered from the header, if any.
    pub fn index(&self) -> Option<&MxfIndex> {
        self.index.as_ref()
    }

    /// The header partition pack, if one was parsed.
    pub fn header_partition(&self) -> Option<&PartitionPack> {
        self.header_partition.as_ref()
    }

    fn scan_header(&mut self, limit: u64) -> Result<()> {
        loop {
            let klv = match self.klv.next_header()? {
                Some(klv) => klv,
                None => {
                    self.done = true;
                    break;
                }
            };
            match klv.key_type {
                KeyType::System | KeyType::Data | KeyType::Video | KeyType::Audio => {
                    if !self.timecode_component_found {
                        warn!("No TimecodeComponent in header; synthesizing 00:00:00:00");
                    }
                    if let Some(index) = self.index.as_mut() {
                        index.body_partition_offset = klv.offset;
                    }
                    self.pending = Some(klv);
                    break;
                }
                KeyType::PartitionPack => {
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    let pack = PartitionPack::parse(&self.payload)
                        .map_err(|e| Error::new(klv.payload_offset() + e.location, e.details))?;
                    if self.header_partition.is_none() {
                        self.header_partition = Some(pack);
                    }
                }
                KeyType::TimecodeComponent
                    if !self.timecode_component_found && klv.offset <= limit =>
                {
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    let (timebase, drop_frame, start_frames) =
                        parse_timecode_component(&self.payload)?;
                    self.timebase = timebase;
                    self.start_timecode =
                        Timecode::from_frame_count(start_frames, timebase, drop_frame)?;
                    self.timecode_component_found = true;
                }
                KeyType::IndexTableSegment => {
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    self.index = Some(
                        MxfIndex::parse(&self.payload)
                            .map_err(|e| Error::new(klv.payload_offset() + e.location, e.details))?,
                    );
                }
                _ => self.klv.skip_payload(&klv)?,
            }
        }
        Ok(())
    }

    /// The timecode expected for the next edit unit when no system item overrides it.
    fn expected_timecode(&self) -> Timecode {
        self.start_timecode.plus_frames(self.next_frame_index)
    }

    fn decode_system_timecode(&self, payload: &[u8], offset: u64) -> Option<Timecode> {
        let at = system_timecode_offset(payload.len() as u64)? as usize;
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&payload[at..at + 4]);
        match Timecode::from_smpte_bytes(&bytes, self.timebase) {
            Ok(tc) => Some(tc),
            Err(_) => {
                warn!("Undecodable SMPTE timecode in system item at {}", offset);
                None
            }
        }
    }

    /// Reads the next edit unit. Returns [`None`] at end of stream.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        self.cancel.check()?;
        let mut packet: Option<Packet> = None;
        let mut has_system = false;
        let mut has_data = false;
        loop {
            let klv = match self.pending.take() {
                Some(klv) => klv,
                None => match self.klv.next_header()? {
                    Some(klv) => klv,
                    None => {
                        self.done = true;
                        break;
                    }
                },
            };
            match klv.key_type {
                KeyType::System => {
                    if packet.is_some() {
                        self.pending = Some(klv);
                        break;
                    }
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    let timecode = self
                        .decode_system_timecode(&self.payload, klv.offset)
                        .unwrap_or_else(|| self.expected_timecode());
                    let mut new_packet = Packet::new(timecode);
                    if self.required.contains(&KeyType::System) {
                        new_packet.raw.push((KeyType::System, self.payload.clone()));
                    }
                    packet = Some(new_packet);
                    has_system = true;
                }
                KeyType::Data => {
                    if has_data && !has_system {
                        // A second data element without system items starts the next unit.
                        self.pending = Some(klv);
                        break;
                    }
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    let packet = packet.get_or_insert_with(|| Packet::new(self.expected_timecode()));
                    let timecode = packet.timecode;
                    parse_essence_lines(&self.payload, timecode, Format::Mxf, &mut packet.lines)
                        .map_err(|e| Error::new(klv.payload_offset() + e.location, e.details))?;
                    if self.required.contains(&KeyType::Data) {
                        packet.raw.push((KeyType::Data, self.payload.clone()));
                    }
                    has_data = true;
                }
                key_type if self.required.contains(&key_type) => {
                    self.klv.read_payload(&klv, &mut self.payload)?;
                    packet
                        .get_or_insert_with(|| Packet::new(self.expected_timecode()))
                        .raw
                        .push((key_type, self.payload.clone()));
                }
                _ => {
                    debug!("Skipping {:?} payload at {}", klv.key_type, klv.offset);
                    self.klv.skip_payload(&klv)?;
                }
            }
        }
        match packet {
            Some(packet) => {
                self.next_frame_index += 1;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Delivers every payload to `sink`, filtered to `keys` when non-empty.
    ///
    /// With `keep_klv_headers`, each delivered buffer is prefixed with the 16-byte key and the
    /// original BER length bytes.
    pub fn demux<F>(&mut self, keys: &[KeyType], keep_klv_headers: bool, sink: &mut F) -> Result<u64>
    where
        F: FnMut(KeyType, &[u8]) -> Result<()>,
    {
        let mut delivered = 0;
        let mut frame = Vec::new();
        loop {
            self.cancel.check()?;
            let klv = match self.pending.take() {
                Some(klv) => klv,
                None => match self.klv.next_header()? {
                    Some(klv) => klv,
                    None => break,
                },
            };
            if !keys.is_empty() && !keys.contains(&klv.key_type) {
                self.klv.skip_payload(&klv)?;
                continue;
            }
            self.klv.read_payload(&klv, &mut self.payload)?;
            if keep_klv_headers {
                frame.clear();
                frame.extend_from_slice(&klv.key);
                frame.extend_from_slice(&klv.ber);
                frame.extend_from_slice(&self.payload);
                sink(klv.key_type, &frame)?;
            } else {
                sink(klv.key_type, &self.payload)?;
            }
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl<R: Read + Seek> Iterator for MxfParser<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
