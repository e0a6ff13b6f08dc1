//! Library for reading, converting and restriping broadcast teletext streams.
//!
//! Sources (raw T42, VBI, or MXF) are opened through a format registry into a stream of
//! frame-sized [`Packet`]s of teletext [`Line`]s, which a single-pass pipeline filters and
//! converts to T42, VBI, RCWT or EBU STL output. MXF files can additionally have their
//! timecode metadata rewritten in place.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! teletext-io = "~0.1.0"
//! ```

#![allow(unused)]
#![deny(missing_docs, unsafe_code, warnings)]

use std::fmt::{Display, Formatter};
use std::result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod slice_reader;
pub use slice_reader::SliceReader;

mod timecode;
pub use timecode::{Timecode, VALID_TIMEBASES};

mod line;
pub use line::{text_offset, Line, LineHeader, LineKind, Packet};

pub mod t42;
pub mod vbi;

pub mod klv;
pub mod mxf;

mod pipeline;
pub use pipeline::{
    convert, Context, ConvertOptions, ConvertSummary, FilterOptions, OutputFormat, RowSet,
};

mod rcwt;
pub use rcwt::{RcwtWriter, RCWT_HEADER};

pub mod stl;

mod registry;
pub use registry::{
    handler_for, open, register, reset_registry, Format, FormatHandler, Handler, MxfHandler,
    PacketSource, PacketStream, ReadSeek, Source, T42Handler, VbiDoubleHandler, VbiHandler,
};

#[cfg(test)]
mod testutil;

/// Errors that may be encountered while parsing or converting teletext streams.
#[derive(Debug)]
pub enum ErrorDetails {
    /// A textual or byte-encoded timecode with a component out of range.
    InvalidTimecode,
    /// A malformed BER length.
    InvalidLength,
    /// A short read in the middle of a record.
    UnexpectedEof,
    /// A semantic error in an MXF stream; [`Error::location`] carries the byte offset.
    MxfParse(&'static str),
    /// No handler registered for the format.
    UnsupportedFormat(Format),
    /// Pass-through from the byte source.
    Io(std::io::Error),
    /// Cooperative cancellation.
    Cancelled,
}

/// Error type encapsulating all parser and pipeline errors.
#[derive(Debug)]
pub struct Error {
    /// Byte offset at which the error was encountered, where known.
    pub location: u64,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    /// Creates an error at a byte location.
    pub fn new(location: u64, details: ErrorDetails) -> Self {
        Self { location, details }
    }

    pub(crate) fn invalid_timecode() -> Self {
        Self::new(0, ErrorDetails::InvalidTimecode)
    }

    /// Wraps an I/O error, folding short reads into [`ErrorDetails::UnexpectedEof`].
    pub(crate) fn from_io(location: u64, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::new(location, ErrorDetails::UnexpectedEof)
        } else {
            Self::new(location, ErrorDetails::Io(error))
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            ErrorDetails::InvalidTimecode => write!(f, "invalid timecode"),
            ErrorDetails::InvalidLength => {
                write!(f, "malformed BER length at byte {}", self.location)
            }
            ErrorDetails::UnexpectedEof => {
                write!(f, "unexpected end of stream at byte {}", self.location)
            }
            ErrorDetails::MxfParse(what) => {
                write!(f, "MXF parse error at byte {}: {}", self.location, what)
            }
            ErrorDetails::UnsupportedFormat(format) => {
                write!(f, "no handler registered for format {}", format)
            }
            ErrorDetails::Io(inner) => write!(f, "I/O error: {}", inner),
            ErrorDetails::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.details {
            ErrorDetails::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::from_io(0, error)
    }
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// Cooperative cancellation flag shared between a caller and a streaming operation.
///
/// Parsers and the pipeline check the flag at packet boundaries; the restriper checks it at
/// every KLV boundary. Cancellation leaves in-flight state consistent at the last boundary.
///
/// # Example
///
/// ```
/// use teletext_io::CancelToken;
/// let token = CancelToken::new();
/// let worker = token.clone();
/// token.cancel();
/// assert!(worker.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every operation sharing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns [`ErrorDetails::Cancelled`] when cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::new(0, ErrorDetails::Cancelled))
        } else {
            Ok(())
        }
    }
}
