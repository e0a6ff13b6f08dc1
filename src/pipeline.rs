//! Single-pass filter and conversion pipeline from packet sources to output sinks.

use super::line::Line;
use super::rcwt::RcwtWriter;
use super::registry::PacketSource;
use super::stl::{StlConfig, StlWriter};
use super::t42::T42_LINE_SIZE;
use super::vbi::{t42_to_vbi_into, VBI_DOUBLE_LINE_SIZE, VBI_LINE_SIZE};
use super::{CancelToken, Error, Result};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// A set of teletext rows, 0–31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSet(u32);

impl RowSet {
    /// Every row, 0 through 31.
    pub const ALL: RowSet = RowSet(u32::MAX);

    /// The caption rows, 1 through 24.
    pub const CAPTION: RowSet = RowSet(0x01FF_FFFE);

    /// No rows.
    pub const EMPTY: RowSet = RowSet(0);

    /// The set containing exactly `row`.
    pub fn single(row: u8) -> Self {
        let mut set = Self::EMPTY;
        set.insert(row);
        set
    }

    /// Adds `row` to the set. Rows above 31 are ignored.
    pub fn insert(&mut self, row: u8) {
        if row < 32 {
            self.0 |= 1 << row;
        }
    }

    /// Whether `row` is in the set.
    pub fn contains(&self, row: u8) -> bool {
        row < 32 && self.0 & (1 << row) != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for RowSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::iter::FromIterator<u8> for RowSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for row in iter {
            set.insert(row);
        }
        set
    }
}

/// Magazine and row filtering applied to every line before it is handed downstream.
#[derive(Debug, Clone)]
pub struct FilterOptions {
    /// Keep only lines of this magazine, when set.
    pub magazine: Option<u8>,
    /// Keep only lines whose row is in this set.
    pub rows: RowSet,
    /// Emit zero-filled line slots in place of filtered-out lines so downstream consumers see a
    /// constant frame size.
    pub keep: bool,
    /// Line slots per frame, used by `keep` mode padding.
    pub lines_per_frame: u8,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            magazine: None,
            rows: RowSet::ALL,
            keep: false,
            lines_per_frame: 2,
        }
    }
}

impl FilterOptions {
    /// Options preset to the caption rows, 1 through 24.
    pub fn caption() -> Self {
        Self {
            rows: RowSet::CAPTION,
            ..Self::default()
        }
    }

    /// Whether `line` passes the magazine and row filters.
    pub fn passes(&self, line: &Line) -> bool {
        self.rows.contains(line.row)
            && self.magazine.map_or(true, |magazine| line.magazine == magazine)
    }
}

/// Shared state threaded through a conversion: currently the RCWT header-emitted flag.
///
/// One context normally lives for the whole process; resetting the flag is an explicit call.
#[derive(Debug, Default)]
pub struct Context {
    rcwt_header_written: AtomicBool,
}

impl Context {
    /// A fresh context with the RCWT header not yet emitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per armed flag; the caller that sees true writes the header.
    pub(crate) fn claim_rcwt_header(&self) -> bool {
        !self.rcwt_header_written.swap(true, Ordering::Relaxed)
    }

    /// Re-arms the RCWT header flag so the next record is preceded by a file header.
    pub fn reset_rcwt_header(&self) {
        self.rcwt_header_written.store(false, Ordering::Relaxed);
    }
}

/// Output selection for [`convert`]. RCWT and STL are terminal formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Raw 42-byte lines.
    T42,
    /// 720-byte VBI line slots.
    Vbi,
    /// 1440-byte double-rate VBI line slots.
    VbiDouble,
    /// RCWT caption container.
    Rcwt,
    /// EBU STL subtitle file.
    Stl,
}

/// Everything [`convert`] needs besides the source and sink.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Line filtering.
    pub filter: FilterOptions,
    /// Output format.
    pub output: OutputFormat,
    /// STL exporter configuration, used when `output` is [`OutputFormat::Stl`].
    pub stl: StlConfig,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            filter: FilterOptions::default(),
            output: OutputFormat::T42,
            stl: StlConfig::default(),
        }
    }
}

/// Counters reported by [`convert`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    /// Packets read from the source.
    pub packets: u64,
    /// Lines (or, for STL, subtitles) written to the sink.
    pub lines: u64,
}

fn write_slot<W: Write>(writer: &mut W, slot: &[u8]) -> Result<()> {
    writer.write_all(slot).map_err(|e| Error::from_io(0, e))
}

/// Streams `source` into `writer`, applying filters and converting to the selected format.
///
/// Single-pass: never buffers more than one packet (the STL exporter accumulates its small
/// subtitle events until the end of the stream). The cancellation token is checked at every
/// packet boundary.
pub fn convert<S: PacketSource, W: Write>(
    source: &mut S,
    options: &ConvertOptions,
    context: &Context,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<ConvertSummary> {
    let mut summary = ConvertSummary::default();
    let filter = &options.filter;
    match options.output {
        OutputFormat::Stl => {
            let mut stl = StlWriter::new(&mut *writer, options.stl.clone());
            while let Some(packet) = source.next_packet()? {
                cancel.check()?;
                summary.packets += 1;
                stl.push_packet(&packet);
            }
            summary.lines = stl.finish()?;
        }
        OutputFormat::Rcwt => {
            let mut rcwt = RcwtWriter::new(&mut *writer, context);
            while let Some(packet) = source.next_packet()? {
                cancel.check()?;
                summary.packets += 1;
                for line in packet.lines.iter().filter(|line| filter.passes(line)) {
                    rcwt.write_line(line)?;
                    summary.lines += 1;
                }
            }
        }
        OutputFormat::T42 | OutputFormat::Vbi | OutputFormat::VbiDouble => {
            let slot_size = match options.output {
                OutputFormat::T42 => T42_LINE_SIZE,
                OutputFormat::Vbi => VBI_LINE_SIZE,
                _ => VBI_DOUBLE_LINE_SIZE,
            };
            let mut slot = vec![0_u8; slot_size];
            while let Some(packet) = source.next_packet()? {
                cancel.check()?;
                summary.packets += 1;
                let mut emitted = 0;
                for line in &packet.lines {
                    if filter.passes(line) {
                        if slot_size == T42_LINE_SIZE {
                            slot.copy_from_slice(&line.data);
                        } else {
                            t42_to_vbi_into(&line.data, &mut slot);
                        }
                        write_slot(writer, &slot)?;
                        summary.lines += 1;
                        emitted += 1;
                    } else if filter.keep {
                        for b in slot.iter_mut() {
                            *b = 0;
                        }
                        write_slot(writer, &slot)?;
                        emitted += 1;
                    }
                }
                if filter.keep {
                    while emitted < filter.lines_per_frame as usize {
                        for b in slot.iter_mut() {
                            *b = 0;
                        }
                        write_slot(writer, &slot)?;
                        emitted += 1;
                    }
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t42::T42Parser;
    use crate::testutil::caption_line;

    fn t42_stream(lines: &[[u8; T42_LINE_SIZE]]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(line);
        }
        out
    }

    #[test]
    fn row_filter_property() {
        let stream = t42_stream(&[
            caption_line(1, 0, "header"),
            caption_line(1, 20, "caption"),
            caption_line(1, 25, "outside"),
            caption_line(1, 1, "first"),
        ]);
        let mut source = T42Parser::new(stream.as_slice());
        let mut options = ConvertOptions::default();
        options.filter = FilterOptions::caption();
        let mut out = Vec::new();
        let summary = convert(
            &mut source,
            &options,
            &Context::new(),
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(summary.lines, 2);
        assert_eq!(out.len(), 2 * T42_LINE_SIZE);
        // Every surviving line decodes to a caption row.
        for chunk in out.chunks(T42_LINE_SIZE) {
            let (_, row) = crate::t42::decode_mrag(chunk[0], chunk[1]).unwrap();
            assert!((1..=24).contains(&row));
        }
    }

    #[test]
    fn magazine_filter() {
        let stream = t42_stream(&[caption_line(1, 20, "one"), caption_line(2, 20, "two")]);
        let mut source = T42Parser::new(stream.as_slice());
        let mut options = ConvertOptions::default();
        options.filter.magazine = Some(2);
        let mut out = Vec::new();
        let summary = convert(
            &mut source,
            &options,
            &Context::new(),
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(summary.lines, 1);
        assert_eq!(out, caption_line(2, 20, "two"));
    }

    #[test]
    fn keep_mode_preserves_frame_size() {
        let stream = t42_stream(&[
            caption_line(1, 20, "keep me"),
            caption_line(1, 25, "drop me"),
        ]);
        let mut source = T42Parser::new(stream.as_slice());
        let mut options = ConvertOptions::default();
        options.filter = FilterOptions::caption();
        options.filter.keep = true;
        let mut out = Vec::new();
        convert(
            &mut source,
            &options,
            &Context::new(),
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.len(), 2 * T42_LINE_SIZE);
        assert_eq!(&out[..T42_LINE_SIZE], &caption_line(1, 20, "keep me"));
        assert!(out[T42_LINE_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn vbi_output_round_trips() {
        let line = caption_line(3, 12, "via vbi");
        let stream = t42_stream(&[line]);
        let mut source = T42Parser::new(stream.as_slice());
        let mut options = ConvertOptions::default();
        options.output = OutputFormat::Vbi;
        let mut out = Vec::new();
        convert(
            &mut source,
            &options,
            &Context::new(),
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.len(), VBI_LINE_SIZE);
        assert_eq!(crate::vbi::vbi_to_t42(&out).unwrap(), line);
    }

    #[test]
    fn cancellation_stops_conversion() {
        let stream = t42_stream(&[caption_line(1, 20, "x")]);
        let mut source = T42Parser::new(stream.as_slice());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        assert!(convert(
            &mut source,
            &ConvertOptions::default(),
            &Context::new(),
            &mut out,
            &cancel,
        )
        .is_err());
    }

    #[test]
    fn row_sets() {
        assert!(RowSet::ALL.contains(0));
        assert!(RowSet::ALL.contains(31));
        assert!(!RowSet::CAPTION.contains(0));
        assert!(RowSet::CAPTION.contains(1));
        assert!(RowSet::CAPTION.contains(24));
        assert!(!RowSet::CAPTION.contains(25));
        let set: RowSet = vec![0_u8, 8, 31].into_iter().collect();
        assert!(set.contains(8));
        assert!(!set.contains(7));
        assert_eq!(RowSet::single(5), vec![5_u8].into_iter().collect());
    }
}
