//! RCWT framing: an 11-byte file header followed by one timestamped record per line.

use super::line::Line;
use super::pipeline::Context;
use super::{Error, Result};
use std::io::Write;

/// RCWT file header: 3-byte magic, creating program, and format version tag.
pub const RCWT_HEADER: [u8; 11] = [
    0xCC, 0xCC, 0xED, 0xCC, 0x00, 0x00, 0x50, 0x00, 0x01, 0x00, 0x00,
];

/// Writer emitting RCWT records.
///
/// The file header is written once per process, before the first record, tracked through the
/// [`Context`]'s header-emitted flag; [`Context::reset_rcwt_header`] re-arms it.
pub struct RcwtWriter<'a, W: Write> {
    writer: W,
    context: &'a Context,
    field: u8,
}

impl<'a, W: Write> RcwtWriter<'a, W> {
    /// Wraps a writer.
    pub fn new(writer: W, context: &'a Context) -> Self {
        Self {
            writer,
            context,
            field: 0,
        }
    }

    /// Writes one line as an RCWT record: big-endian u64 FTS in milliseconds, the field
    /// alternation byte, and the 42 payload bytes.
    pub fn write_line(&mut self, line: &Line) -> Result<()> {
        if self.context.claim_rcwt_header() {
            self.writer
                .write_all(&RCWT_HEADER)
                .map_err(|e| Error::from_io(0, e))?;
        }
        let fts = line.timecode.frame_count() * (1000 / line.timecode.timebase() as u64);
        self.writer
            .write_all(&fts.to_be_bytes())
            .and_then(|_| self.writer.write_all(&[self.field]))
            .and_then(|_| self.writer.write_all(&line.data))
            .map_err(|e| Error::from_io(0, e))?;
        self.field ^= 1;
        Ok(())
    }

    /// Consumes the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
