//! Pluggable per-format handler lookup and the open-by-format constructor.

use super::mxf::MxfParser;
use super::t42::T42Parser;
use super::vbi::VbiParser;
use super::{Error, ErrorDetails, Packet, Result};
use enum_dispatch::enum_dispatch;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{OnceLock, RwLock};

/// Stream format tags understood by the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Format {
    /// Raw 42-byte teletext lines.
    T42,
    /// 720-byte VBI line slots.
    Vbi,
    /// 1440-byte double-rate VBI line slots.
    VbiDouble,
    /// MXF container.
    Mxf,
    /// Ancillary-data packets.
    Anc,
    /// RCWT caption container.
    Rcwt,
    /// EBU STL subtitle file.
    Stl,
    /// MPEG transport stream.
    Ts,
    /// Anything else.
    Unknown,
}

impl Display for Format {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Format::T42 => "t42",
            Format::Vbi => "vbi",
            Format::VbiDouble => "vbi-double",
            Format::Mxf => "mxf",
            Format::Anc => "anc",
            Format::Rcwt => "rcwt",
            Format::Stl => "stl",
            Format::Ts => "ts",
            Format::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Byte sources the registry can hand to a handler.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// An owned, type-erased byte source.
///
/// # Example
///
/// ```no_run
/// use teletext_io::{open, Format, PacketSource, Source};
/// use std::fs::File;
///
/// let file = File::open("captions.mxf").expect("unable to open!");
/// let mut stream = open(Format::Mxf, Source::new(file))?;
/// while let Some(packet) = stream.next_packet()? {
///     println!("{:?}", packet);
/// }
/// # Ok::<(), teletext_io::Error>(())
/// ```
pub struct Source {
    inner: Box<dyn ReadSeek>,
}

impl Source {
    /// Wraps any readable, seekable byte source.
    pub fn new<T: ReadSeek + 'static>(inner: T) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Opens a file as a source.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::from_io(0, e))?;
        Ok(Self::new(std::io::BufReader::new(file)))
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").finish()
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// A cooperative stream of packets; call until [`None`].
#[enum_dispatch]
pub trait PacketSource {
    /// Yields the next packet, or [`None`] at end of stream.
    fn next_packet(&mut self) -> Result<Option<Packet>>;
}

impl<R: Read + Seek> PacketSource for MxfParser<R> {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        MxfParser::next_packet(self)
    }
}

impl<R: Read> PacketSource for T42Parser<R> {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        T42Parser::next_packet(self)
    }
}

impl<R: Read> PacketSource for VbiParser<R> {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        VbiParser::next_packet(self)
    }
}

/// A packet stream bound to a concrete parser by [`open`].
#[enum_dispatch(PacketSource)]
pub enum PacketStream {
    /// MXF demultiplexer.
    Mxf(MxfParser<Source>),
    /// Raw T42 parser.
    T42(T42Parser<Source>),
    /// Raw VBI parser, single or double rate.
    Vbi(VbiParser<Source>),
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketStream::Mxf(_) => "Mxf",
            PacketStream::T42(_) => "T42",
            PacketStream::Vbi(_) => "Vbi",
        };
        f.debug_tuple("PacketStream").field(&name).finish()
    }
}

impl Iterator for PacketStream {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

/// A per-format stream constructor.
#[enum_dispatch]
pub trait Handler {
    /// The input format this handler parses.
    fn input_format(&self) -> Format;

    /// Binds a source to a packet stream.
    fn open(&self, source: Source) -> Result<PacketStream>;
}

/// Handler for raw T42 streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct T42Handler;

impl Handler for T42Handler {
    fn input_format(&self) -> Format {
        Format::T42
    }

    fn open(&self, source: Source) -> Result<PacketStream> {
        Ok(PacketStream::T42(T42Parser::new(source)))
    }
}

/// Handler for single-rate VBI streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct VbiHandler;

impl Handler for VbiHandler {
    fn input_format(&self) -> Format {
        Format::Vbi
    }

    fn open(&self, source: Source) -> Result<PacketStream> {
        Ok(PacketStream::Vbi(VbiParser::new(source, false)))
    }
}

/// Handler for double-rate VBI streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct VbiDoubleHandler;

impl Handler for VbiDoubleHandler {
    fn input_format(&self) -> Format {
        Format::VbiDouble
    }

    fn open(&self, source: Source) -> Result<PacketStream> {
        Ok(PacketStream::Vbi(VbiParser::new(source, true)))
    }
}

/// Handler for MXF containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MxfHandler;

impl Handler for MxfHandler {
    fn input_format(&self) -> Format {
        Format::Mxf
    }

    fn open(&self, source: Source) -> Result<PacketStream> {
        Ok(PacketStream::Mxf(MxfParser::new(source)?))
    }
}

/// A registered handler.
#[enum_dispatch(Handler)]
#[derive(Debug, Clone, Copy)]
pub enum FormatHandler {
    /// Raw T42 streams.
    T42(T42Handler),
    /// Single-rate VBI streams.
    Vbi(VbiHandler),
    /// Double-rate VBI streams.
    VbiDouble(VbiDoubleHandler),
    /// MXF containers.
    Mxf(MxfHandler),
}

fn builtin_handlers() -> HashMap<Format, FormatHandler> {
    let mut handlers = HashMap::new();
    for handler in [
        FormatHandler::from(T42Handler),
        FormatHandler::from(VbiHandler),
        FormatHandler::from(VbiDoubleHandler),
        FormatHandler::from(MxfHandler),
    ]
    .iter()
    .copied()
    {
        handlers.insert(handler.input_format(), handler);
    }
    handlers
}

fn registry() -> &'static RwLock<HashMap<Format, FormatHandler>> {
    static REGISTRY: OnceLock<RwLock<HashMap<Format, FormatHandler>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(builtin_handlers()))
}

/// Registers `handler` under its declared input format, replacing any previous registration.
pub fn register(handler: FormatHandler) {
    registry()
        .write()
        .unwrap()
        .insert(handler.input_format(), handler);
}

/// Looks up the handler registered for `format`.
pub fn handler_for(format: Format) -> Result<FormatHandler> {
    registry()
        .read()
        .unwrap()
        .get(&format)
        .copied()
        .ok_or_else(|| Error::new(0, ErrorDetails::UnsupportedFormat(format)))
}

/// Binds `source` to a packet stream through the handler registered for `format`.
pub fn open(format: Format, source: Source) -> Result<PacketStream> {
    handler_for(format)?.open(source)
}

/// Restores the registry to the built-in handler set.
pub fn reset_registry() {
    *registry().write().unwrap() = builtin_handlers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{caption_line, MxfBuilder};
    use crate::Timecode;
    use std::io::Cursor;

    #[test]
    fn builtins_are_registered() {
        reset_registry();
        for format in [Format::T42, Format::Vbi, Format::VbiDouble, Format::Mxf]
            .iter()
            .copied()
        {
            assert_eq!(handler_for(format).unwrap().input_format(), format);
        }
    }

    // Registration state for the non-builtin tags is asserted in a single test; the registry is
    // process-wide and tests run in parallel.
    #[test]
    fn unregistered_formats_are_unsupported_until_registered() {
        reset_registry();
        for format in [Format::Anc, Format::Rcwt, Format::Stl, Format::Ts, Format::Unknown]
            .iter()
            .copied()
        {
            assert!(matches!(
                handler_for(format).unwrap_err().details,
                ErrorDetails::UnsupportedFormat(f) if f == format
            ));
        }

        // Route double-rate VBI parsing to the Anc tag as a caller would for a custom mapping.
        registry()
            .write()
            .unwrap()
            .insert(Format::Anc, FormatHandler::from(VbiDoubleHandler));
        assert!(handler_for(Format::Anc).is_ok());
        reset_registry();
        assert!(handler_for(Format::Anc).is_err());
    }

    #[test]
    fn open_dispatches_to_the_right_parser() {
        reset_registry();
        let line = caption_line(1, 20, "registry");
        let mut stream = open(Format::T42, Source::new(Cursor::new(line.to_vec()))).unwrap();
        let packet = stream.next_packet().unwrap().unwrap();
        assert_eq!(packet.lines.len(), 1);
        assert_eq!(packet.lines[0].format, Format::T42);

        let start = Timecode::parse("01:00:00:00", 25).unwrap();
        let mut builder = MxfBuilder::new(start);
        builder.add_frame(&[caption_line(1, 20, "mxf")]);
        let mut stream = open(
            Format::Mxf,
            Source::new(Cursor::new(builder.finish())),
        )
        .unwrap();
        let packet = stream.next_packet().unwrap().unwrap();
        assert_eq!(packet.timecode, start);
    }

}
