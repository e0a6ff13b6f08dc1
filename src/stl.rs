//! EBU STL subtitle export with temporal merging.
//!
//! Teletext roll-up captions repeat the same sentence many times as it is built up word by word
//! and shifted between rows. The exporter tracks caption content across frames and emits one
//! Text and Timing Information block per logically-distinct subtitle, spanning the frames from
//! its first appearance to its clearance.

use super::line::{text_offset, Line, Packet};
use super::pipeline::RowSet;
use super::t42::T42_LINE_SIZE;
use super::{Error, Result, Timecode};
use log::debug;
use std::collections::HashMap;
use std::io::Write;

/// Size of the General Subtitle Information block at the start of an STL file.
pub const GSI_BLOCK_SIZE: usize = 1024;

/// Size of each Text and Timing Information block.
pub const TTI_BLOCK_SIZE: usize = 128;

/// Size of the text field within a TTI block.
pub const TTI_TEXT_SIZE: usize = TTI_BLOCK_SIZE - 16;

/// STL text-field padding byte.
const STL_PAD: u8 = 0x8F;

/// Configuration for the STL exporter.
#[derive(Debug, Clone)]
pub struct StlConfig {
    /// Original programme title written into the GSI block.
    pub title: String,
    /// Frames a cleared subtitle may stay pending before it is finalized; a subtitle that
    /// reappears (growing) within the window is resumed instead of duplicated.
    pub clear_delay_frames: u32,
    /// Rows considered subtitle content. Row 0 is always excluded.
    pub rows: RowSet,
    /// Keep only lines of this magazine, when set.
    pub magazine: Option<u8>,
}

impl Default for StlConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            clear_delay_frames: 30,
            rows: RowSet::CAPTION,
            magazine: None,
        }
    }
}

/// Strips ANSI CSI `ESC [ … m` sequences, trims the ends, and collapses internal whitespace
/// runs to a single space.
///
/// # Example
///
/// ```
/// use teletext_io::stl::normalize_text;
/// assert_eq!(
///     normalize_text("\x1b[37m\x1b[40m  Hello  World  \x1b[0m"),
///     "Hello World"
/// );
/// ```
pub fn normalize_text(s: &str) -> String {
    let mut stripped = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for n in chars.by_ref() {
                if n == 'm' {
                    break;
                }
            }
            continue;
        }
        stripped.push(c);
    }
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `curr` extends `prev` word by word.
///
/// True iff `curr` is strictly longer and either begins with `prev` as a byte prefix, or all
/// words of `prev` except possibly the last match the corresponding words of `curr` with the
/// last word of `prev` a prefix of its counterpart. An empty `prev` grows into any non-empty
/// `curr`.
pub fn is_text_growing(prev: &str, curr: &str) -> bool {
    if curr.len() <= prev.len() {
        return false;
    }
    if prev.is_empty() {
        return true;
    }
    if curr.as_bytes().starts_with(prev.as_bytes()) {
        return true;
    }
    let prev_words: Vec<&str> = prev.split(' ').collect();
    let curr_words: Vec<&str> = curr.split(' ').collect();
    if curr_words.len() < prev_words.len() {
        return false;
    }
    let last = prev_words.len() - 1;
    if prev_words[..last] != curr_words[..last] {
        return false;
    }
    curr_words[last].starts_with(prev_words[last])
}

/// A caption currently on screen.
struct TrackedContent {
    row: u8,
    payload: [u8; T42_LINE_SIZE],
    first_seen: Timecode,
    last_seen: Timecode,
    seq: u64,
}

/// A caption that left the screen and may still grow back.
struct PendingClear {
    content: TrackedContent,
    cleared_at: Timecode,
    frames_waited: u32,
}

/// A finalized subtitle awaiting block emission.
struct SubtitleEvent {
    row: u8,
    payload: [u8; T42_LINE_SIZE],
    tc_in: Timecode,
    tc_out: Timecode,
    seq: u64,
}

/// Streaming STL exporter.
///
/// Packets are pushed one at a time; [`StlWriter::finish`] writes the GSI block and the
/// accumulated TTI blocks. Content never fails the exporter; undecodable payload bytes become
/// spaces.
pub struct StlWriter<W: Write> {
    writer: W,
    config: StlConfig,
    active: HashMap<String, TrackedContent>,
    pending_clear: HashMap<String, PendingClear>,
    events: Vec<SubtitleEvent>,
    last_timecode: Option<Timecode>,
    next_seq: u64,
}

impl<W: Write> StlWriter<W> {
    /// Creates an exporter writing to `writer` on [`StlWriter::finish`].
    pub fn new(writer: W, config: StlConfig) -> Self {
        Self {
            writer,
            config,
            active: HashMap::new(),
            pending_clear: HashMap::new(),
            events: Vec::new(),
            last_timecode: None,
            next_seq: 0,
        }
    }

    fn line_passes(&self, line: &Line) -> bool {
        line.row != 0
            && self.config.rows.contains(line.row)
            && self
                .config
                .magazine
                .map_or(true, |magazine| line.magazine == magazine)
    }

    fn finalize(&mut self, content: TrackedContent, tc_out: Timecode) {
        self.events.push(SubtitleEvent {
            row: content.row,
            payload: content.payload,
            tc_in: content.first_seen,
            tc_out,
            seq: content.seq,
        });
    }

    /// Folds one packet into the tracker.
    pub fn push_packet(&mut self, packet: &Packet) {
        let now = packet.timecode;
        self.last_timecode = Some(now);

        // Content visible this frame, in line order; the last occurrence of a text wins.
        let mut order: Vec<String> = Vec::new();
        let mut current: HashMap<String, &Line> = HashMap::new();
        for line in packet.lines.iter().filter(|line| self.line_passes(line)) {
            let text = normalize_text(&line.text());
            if text.is_empty() {
                continue;
            }
            if current.insert(text.clone(), line).is_none() {
                order.push(text);
            }
        }

        for text in &order {
            let line = current[text];
            if let Some(content) = self.active.get_mut(text) {
                if content.row != line.row {
                    debug!("Subtitle moved from row {} to {}", content.row, line.row);
                }
                content.row = line.row;
                content.payload = line.data;
                content.last_seen = now;
                continue;
            }
            let grown_from = self
                .active
                .keys()
                .find(|prev| is_text_growing(prev, text))
                .cloned();
            if let Some(prev) = grown_from {
                let old = self.active.remove(&prev).unwrap();
                self.active.insert(
                    text.clone(),
                    TrackedContent {
                        row: line.row,
                        payload: line.data,
                        first_seen: old.first_seen,
                        last_seen: now,
                        seq: old.seq,
                    },
                );
                continue;
            }
            let resumed_from = self
                .pending_clear
                .keys()
                .find(|prev| is_text_growing(prev, text))
                .cloned();
            if let Some(prev) = resumed_from {
                let old = self.pending_clear.remove(&prev).unwrap();
                self.active.insert(
                    text.clone(),
                    TrackedContent {
                        row: line.row,
                        payload: line.data,
                        first_seen: old.content.first_seen,
                        last_seen: now,
                        seq: old.content.seq,
                    },
                );
                continue;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.active.insert(
                text.clone(),
                TrackedContent {
                    row: line.row,
                    payload: line.data,
                    first_seen: now,
                    last_seen: now,
                    seq,
                },
            );
        }

        // Anything no longer on screen starts its clear delay.
        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|text| !current.contains_key(*text))
            .cloned()
            .collect();
        for text in stale {
            let content = self.active.remove(&text).unwrap();
            self.pending_clear.insert(
                text,
                PendingClear {
                    content,
                    cleared_at: now,
                    frames_waited: 0,
                },
            );
        }

        for pending in self.pending_clear.values_mut() {
            pending.frames_waited += 1;
        }
        // Finalization is a separate pass so an entry is never emitted while being counted.
        let expired: Vec<String> = self
            .pending_clear
            .iter()
            .filter(|(_, pending)| pending.frames_waited >= self.config.clear_delay_frames)
            .map(|(text, _)| text.clone())
            .collect();
        for text in expired {
            let pending = self.pending_clear.remove(&text).unwrap();
            self.finalize(pending.content, pending.cleared_at);
        }
    }

    /// Finalizes all remaining subtitles and writes the GSI and TTI blocks.
    ///
    /// Returns the number of subtitles written.
    pub fn finish(mut self) -> Result<u64> {
        let last = self.last_timecode.unwrap_or_else(|| Timecode::zero(25));
        let pending: Vec<PendingClear> = self
            .pending_clear
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in pending {
            let cleared_at = pending.cleared_at;
            self.finalize(pending.content, cleared_at);
        }
        let active: Vec<TrackedContent> =
            self.active.drain().map(|(_, content)| content).collect();
        for content in active {
            self.finalize(content, last);
        }
        self.events
            .sort_by_key(|event| (event.tc_in.frame_count(), event.seq));

        let gsi = build_gsi(&self.config.title, self.events.len());
        self.writer
            .write_all(&gsi)
            .map_err(|e| Error::from_io(0, e))?;
        for (i, event) in self.events.iter().enumerate() {
            let block = build_tti(i as u16 + 1, event);
            self.writer
                .write_all(&block)
                .map_err(|e| Error::from_io(0, e))?;
        }
        Ok(self.events.len() as u64)
    }
}

fn put(block: &mut [u8], offset: usize, value: &[u8]) {
    block[offset..offset + value.len()].copy_from_slice(value);
}

/// Builds the 1024-byte General Subtitle Information block.
fn build_gsi(title: &str, total_subtitles: usize) -> [u8; GSI_BLOCK_SIZE] {
    let mut gsi = [0x20_u8; GSI_BLOCK_SIZE];
    put(&mut gsi, 0, b"437");
    put(&mut gsi, 3, b"STL25.01");
    gsi[11] = b'1';
    put(&mut gsi, 12, b"00");
    put(&mut gsi, 14, b"EN");
    for (i, b) in title.bytes().take(32).enumerate() {
        gsi[16 + i] = if (0x20..0x7F).contains(&b) { b } else { b' ' };
    }
    put(
        &mut gsi,
        225,
        format!("{:05}", total_subtitles.min(99999)).as_bytes(),
    );
    put(&mut gsi, 230, b"001");
    put(&mut gsi, 233, b"40");
    put(&mut gsi, 235, b"23");
    gsi[237] = b'1';
    put(&mut gsi, 238, b"00000000");
    put(&mut gsi, 246, b"00000000");
    gsi[254] = b'1';
    gsi[255] = b'1';
    gsi
}

/// Maps one parity-stripped payload byte into the STL text field character set.
fn stl_char(v: u8) -> u8 {
    match v {
        // Teletext start box carries over; normal height becomes the STL end box.
        0x0B => 0x0B,
        0x0C => 0x0A,
        0x00..=0x07 => v,
        0x20..=0x7F => v,
        _ => 0x20,
    }
}

/// Builds a 128-byte Text and Timing Information block.
fn build_tti(number: u16, event: &SubtitleEvent) -> [u8; TTI_BLOCK_SIZE] {
    let mut tti = [0_u8; TTI_BLOCK_SIZE];
    tti[0] = 0x00; // subtitle group
    put(&mut tti, 1, &number.to_be_bytes());
    tti[3] = 0xFF; // extension block number
    tti[4] = 0x00; // cumulative status
    put(&mut tti, 5, &event.tc_in.to_bcd());
    put(&mut tti, 9, &event.tc_out.to_bcd());
    tti[13] = event.row; // vertical position
    tti[14] = 0x02; // justification: left
    tti[15] = 0x00; // comment flag
    let mut pos = 16;
    for &b in &event.payload[text_offset(event.row)..] {
        if pos == TTI_BLOCK_SIZE {
            break;
        }
        tti[pos] = stl_char(b & 0x7F);
        pos += 1;
    }
    while pos < TTI_BLOCK_SIZE {
        tti[pos] = STL_PAD;
        pos += 1;
    }
    tti
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::caption_line;
    use crate::Format;

    fn packet_with(timecode: Timecode, texts: &[&str]) -> Packet {
        let mut packet = Packet::new(timecode);
        for (i, text) in texts.iter().enumerate() {
            let data = caption_line(1, 20 + i as u8, text);
            packet
                .lines
                .push(Line::from_t42(&data, timecode, Format::T42).unwrap());
        }
        packet
    }

    fn tti_blocks(stl: &[u8]) -> Vec<&[u8]> {
        assert!(stl.len() >= GSI_BLOCK_SIZE);
        assert_eq!((stl.len() - GSI_BLOCK_SIZE) % TTI_BLOCK_SIZE, 0);
        stl[GSI_BLOCK_SIZE..].chunks(TTI_BLOCK_SIZE).collect()
    }

    fn tti_text(block: &[u8]) -> String {
        block[16..]
            .iter()
            .take_while(|&&b| b != STL_PAD)
            .map(|&b| b as char)
            .collect()
    }

    #[test]
    fn normalize_strips_ansi_and_whitespace() {
        assert_eq!(
            normalize_text("\x1b[37m\x1b[40m  Hello  World  \x1b[0m"),
            "Hello World"
        );
        assert_eq!(normalize_text("   "), "");
        assert_eq!(normalize_text("plain"), "plain");
    }

    #[test]
    fn growth_detection() {
        assert!(is_text_growing("thought we", "thought we would"));
        assert!(!is_text_growing("Hello", "Hello"));
        assert!(!is_text_growing("Hello world", "Hello"));
        assert!(is_text_growing("", "anything"));
        // Word-by-word growth where the last word completes.
        assert!(is_text_growing("thought w", "thought we"));
        assert!(!is_text_growing("thought x", "thought we would"));
    }

    #[test]
    fn word_buildup_merges_to_one_subtitle() {
        let tb = 25;
        let mut out = Vec::new();
        let mut config = StlConfig::default();
        config.clear_delay_frames = 0;
        let mut writer = StlWriter::new(&mut out, config);

        let base = Timecode::zero(tb);
        writer.push_packet(&packet_with(base, &["thought"]));
        writer.push_packet(&packet_with(base.plus_frames(1), &["thought we"]));
        writer.push_packet(&packet_with(base.plus_frames(2), &["thought we would"]));
        writer.push_packet(&packet_with(base.plus_frames(3), &[]));
        let count = writer.finish().unwrap();
        assert_eq!(count, 1);

        let blocks = tti_blocks(&out);
        assert_eq!(blocks.len(), 1);
        let block = blocks[0];
        assert_eq!(&block[1..3], &1_u16.to_be_bytes());
        assert_eq!(&block[5..9], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&block[9..13], &[0x00, 0x00, 0x00, 0x03]);
        assert!(tti_text(block).starts_with("thought we would"));
    }

    #[test]
    fn clear_delay_bridges_gaps() {
        let tb = 25;
        let mut out = Vec::new();
        let config = StlConfig::default(); // 30 frame delay
        let mut writer = StlWriter::new(&mut out, config);

        let base = Timecode::zero(tb);
        writer.push_packet(&packet_with(base, &["Alright,"]));
        for i in 1..=14 {
            writer.push_packet(&packet_with(base.plus_frames(i), &[]));
        }
        writer.push_packet(&packet_with(base.plus_frames(15), &["Alright, the"]));
        writer.push_packet(&packet_with(base.plus_frames(16), &[]));
        let count = writer.finish().unwrap();
        assert_eq!(count, 1);

        let blocks = tti_blocks(&out);
        assert_eq!(&blocks[0][5..9], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&blocks[0][9..13], &[0x00, 0x00, 0x00, 0x16]);
    }

    #[test]
    fn distinct_texts_become_distinct_subtitles() {
        let tb = 25;
        let mut out = Vec::new();
        let mut config = StlConfig::default();
        config.clear_delay_frames = 2;
        let mut writer = StlWriter::new(&mut out, config);

        let base = Timecode::zero(tb);
        writer.push_packet(&packet_with(base, &["first subtitle"]));
        writer.push_packet(&packet_with(base.plus_frames(1), &[]));
        writer.push_packet(&packet_with(base.plus_frames(10), &["second subtitle"]));
        let count = writer.finish().unwrap();
        assert_eq!(count, 2);

        let blocks = tti_blocks(&out);
        // Numbers are strictly increasing from 1 and TC In never exceeds TC Out.
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(&block[1..3], &(i as u16 + 1).to_be_bytes());
            assert!(block[5..9] <= block[9..13]);
        }
        assert!(tti_text(blocks[0]).starts_with("first subtitle"));
        assert!(tti_text(blocks[1]).starts_with("second subtitle"));
    }

    #[test]
    fn events_sort_by_first_seen() {
        let tb = 25;
        let mut out = Vec::new();
        let mut config = StlConfig::default();
        config.clear_delay_frames = 1;
        let mut writer = StlWriter::new(&mut out, config);

        let base = Timecode::zero(tb);
        // "long" stays on screen while "short" appears later and clears first.
        for i in 0..6 {
            let texts: Vec<&str> = if (2..4).contains(&i) {
                vec!["long running", "short"]
            } else {
                vec!["long running"]
            };
            writer.push_packet(&packet_with(base.plus_frames(i), &texts));
        }
        writer.finish().unwrap();

        let blocks = tti_blocks(&out);
        assert_eq!(blocks.len(), 2);
        assert!(tti_text(blocks[0]).starts_with("long running"));
        assert!(tti_text(blocks[1]).starts_with("short"));
        assert!(blocks[0][5..9] <= blocks[1][5..9]);
    }

    #[test]
    fn row_zero_is_excluded() {
        let tb = 25;
        let mut out = Vec::new();
        let mut writer = StlWriter::new(&mut out, StlConfig::default());
        let base = Timecode::zero(tb);
        let mut packet = Packet::new(base);
        let header = caption_line(1, 0, "page header");
        packet
            .lines
            .push(Line::from_t42(&header, base, Format::T42).unwrap());
        writer.push_packet(&packet);
        assert_eq!(writer.finish().unwrap(), 0);
    }

    #[test]
    fn gsi_fields() {
        let gsi = build_gsi("My Programme", 42);
        assert_eq!(&gsi[0..3], b"437");
        assert_eq!(&gsi[3..11], b"STL25.01");
        assert_eq!(gsi[11], b'1');
        assert_eq!(&gsi[12..14], b"00");
        assert_eq!(&gsi[14..16], b"EN");
        assert_eq!(&gsi[16..28], b"My Programme");
        assert_eq!(gsi[28], 0x20);
        assert_eq!(&gsi[225..230], b"00042");
        assert_eq!(&gsi[230..233], b"001");
        assert_eq!(&gsi[233..235], b"40");
        assert_eq!(&gsi[235..237], b"23");
        assert_eq!(gsi[237], b'1');
        assert_eq!(&gsi[238..246], b"00000000");
        assert_eq!(&gsi[246..254], b"00000000");
        assert_eq!(gsi[254], b'1');
        assert_eq!(gsi[255], b'1');
    }

    #[test]
    fn tti_text_mapping() {
        let mut payload = caption_line(1, 20, "");
        payload[2] = 0x0B; // start box
        payload[3] = 0x0C; // normal height
        payload[4] = 0x01; // colour code survives
        payload[5] = crate::t42::odd_parity(b'A');
        payload[6] = 0x0E; // other control becomes a space
        let event = SubtitleEvent {
            row: 20,
            payload,
            tc_in: Timecode::zero(25),
            tc_out: Timecode::zero(25),
            seq: 0,
        };
        let block = build_tti(1, &event);
        assert_eq!(block[13], 20);
        assert_eq!(block[14], 0x02);
        assert_eq!(&block[16..21], &[0x0B, 0x0A, 0x01, b'A', 0x20]);
        // The text field pads with 0x8F out to the block end.
        assert_eq!(block[TTI_BLOCK_SIZE - 1], STL_PAD);
        assert_eq!(block[16 + 40], STL_PAD);
    }
}
