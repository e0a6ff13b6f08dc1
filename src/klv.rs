//! KLV scanning: 16-byte SMPTE UL keys, prefix classification, and BER lengths.

use super::{Error, ErrorDetails, Result};
use smallvec::SmallVec;
use std::io::{Read, Seek, SeekFrom};

/// Leading bytes shared by every SMPTE universal label.
pub const SMPTE_UL_PREFIX: [u8; 4] = [0x06, 0x0E, 0x2B, 0x34];

/// Classification of a 16-byte KLV key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Header, body or footer partition pack.
    PartitionPack,
    /// Primer pack preceding header metadata.
    PrimerPack,
    /// TimecodeComponent structural metadata set.
    TimecodeComponent,
    /// Index table segment.
    IndexTableSegment,
    /// System item carrying per-edit-unit metadata including the SMPTE timecode.
    System,
    /// Picture essence element.
    Video,
    /// Sound essence element.
    Audio,
    /// Data essence element (VBI/ANC wrapping).
    Data,
    /// KLV fill item.
    Filler,
    /// Any key this crate does not recognize; payload is delivered opaquely.
    Unknown,
}

/// Well-known keys, usable for writing streams as well as matching.
pub mod keys {
    /// Closed complete header partition pack.
    pub const HEADER_PARTITION: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x02,
        0x04, 0x00,
    ];
    /// Closed complete footer partition pack.
    pub const FOOTER_PARTITION: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x04,
        0x04, 0x00,
    ];
    /// Primer pack.
    pub const PRIMER_PACK: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05,
        0x01, 0x00,
    ];
    /// TimecodeComponent structural metadata set.
    pub const TIMECODE_COMPONENT: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01,
        0x14, 0x00,
    ];
    /// Index table segment.
    pub const INDEX_TABLE_SEGMENT: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10,
        0x01, 0x00,
    ];
    /// Content-package system item.
    pub const SYSTEM_ITEM: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x04, 0x01,
        0x01, 0x00,
    ];
    /// Generic-container data essence element.
    pub const DATA_ESSENCE: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x17, 0x01,
        0x01, 0x01,
    ];
    /// KLV fill item.
    pub const FILLER: [u8; 16] = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00,
        0x00, 0x00,
    ];
}

/// Fixed classification table; entries are tried in order and match on a leading prefix.
const KEY_TABLE: &[(&[u8], KeyType)] = &[
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x14],
        KeyType::TimecodeComponent,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10],
        KeyType::IndexTableSegment,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x02],
        KeyType::PartitionPack,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x03],
        KeyType::PartitionPack,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x04],
        KeyType::PartitionPack,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05],
        KeyType::PrimerPack,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x04],
        KeyType::System,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10],
        KeyType::Filler,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x05],
        KeyType::Video,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x15],
        KeyType::Video,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x06],
        KeyType::Audio,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x16],
        KeyType::Audio,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x07],
        KeyType::Data,
    ),
    (
        &[0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x17],
        KeyType::Data,
    ),
];

/// Classifies a 16-byte key against the fixed label table.
pub fn classify_key(key: &[u8; 16]) -> KeyType {
    if key[0..4] != SMPTE_UL_PREFIX {
        return KeyType::Unknown;
    }
    for (prefix, key_type) in KEY_TABLE {
        if key.starts_with(prefix) {
            return *key_type;
        }
    }
    KeyType::Unknown
}

/// One scanned key-length header.
#[derive(Debug, Clone)]
pub struct Klv {
    /// The 16-byte key.
    pub key: [u8; 16],
    /// Classification of the key.
    pub key_type: KeyType,
    /// Declared payload length in bytes.
    pub length: u64,
    /// Byte offset of the key within the stream.
    pub offset: u64,
    /// The BER length bytes exactly as they appeared.
    pub ber: SmallVec<[u8; 9]>,
}

impl Klv {
    /// Total size of key plus length bytes.
    pub fn header_len(&self) -> u64 {
        16 + self.ber.len() as u64
    }

    /// Byte offset of the payload within the stream.
    pub fn payload_offset(&self) -> u64 {
        self.offset + self.header_len()
    }
}

/// Appends the shortest BER encoding of `length`.
pub fn encode_ber_length(length: u64, out: &mut Vec<u8>) {
    if length < 0x80 {
        out.push(length as u8);
    } else {
        let bytes = length.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (8 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// Reads the 16-byte key at `position`. `Ok(None)` means a clean end of stream; a partial key
/// is an [`ErrorDetails::UnexpectedEof`].
pub(crate) fn read_key<R: Read>(reader: &mut R, position: u64) -> Result<Option<[u8; 16]>> {
    let mut key = [0_u8; 16];
    let mut filled = 0;
    while filled < key.len() {
        let n = reader
            .read(&mut key[filled..])
            .map_err(|e| Error::new(position + filled as u64, ErrorDetails::Io(e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::new(
                position + filled as u64,
                ErrorDetails::UnexpectedEof,
            ));
        }
        filled += n;
    }
    Ok(Some(key))
}

/// Reads a BER length at `position`, returning the value and the raw bytes consumed.
pub(crate) fn read_ber_length<R: Read>(
    reader: &mut R,
    position: u64,
) -> Result<(u64, SmallVec<[u8; 9]>)> {
    let mut first = [0_u8; 1];
    reader
        .read_exact(&mut first)
        .map_err(|e| Error::from_io(position, e))?;
    let mut raw = SmallVec::new();
    raw.push(first[0]);
    if first[0] & 0x80 == 0 {
        return Ok((first[0] as u64, raw));
    }
    let count = (first[0] & 0x7F) as usize;
    if count == 0 || count > 8 {
        return Err(Error::new(position, ErrorDetails::InvalidLength));
    }
    let mut bytes = [0_u8; 8];
    reader
        .read_exact(&mut bytes[8 - count..])
        .map_err(|e| Error::from_io(position + 1, e))?;
    raw.extend_from_slice(&bytes[8 - count..]);
    Ok((u64::from_be_bytes(bytes), raw))
}

/// Streaming scanner over KLV-encoded data.
///
/// The scanner reads key and length headers; payloads are only materialized when the caller
/// asks for them, otherwise they are seeked past.
///
/// # Example
///
/// ```no_run
/// use teletext_io::klv::{KeyType, KlvReader};
/// use std::fs::File;
///
/// let file = File::open("essence.mxf").expect("unable to open!");
/// let mut reader = KlvReader::new(file)?;
/// let mut payload = Vec::new();
/// while let Some(klv) = reader.next_header()? {
///     match klv.key_type {
///         KeyType::Data => {
///             reader.read_payload(&klv, &mut payload)?;
///             println!("{} data bytes at {}", payload.len(), klv.offset);
///         }
///         _ => reader.skip_payload(&klv)?,
///     }
/// }
/// # Ok::<(), teletext_io::Error>(())
/// ```
#[derive(Debug)]
pub struct KlvReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read + Seek> KlvReader<R> {
    /// Creates a scanner starting at the reader's current position.
    pub fn new(mut inner: R) -> Result<Self> {
        let position = inner
            .seek(SeekFrom::Current(0))
            .map_err(|e| Error::from_io(0, e))?;
        Ok(Self { inner, position })
    }

    /// Current byte position within the stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Mutable access to the underlying reader. The caller must restore the stream position
    /// before the next scanner call, or use [`KlvReader::seek_to`].
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Seeks the stream to an absolute position and resynchronizes the scanner.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(position))
            .map_err(|e| Error::from_io(position, e))?;
        self.position = position;
        Ok(())
    }

    /// Reads the next key and BER length. `Ok(None)` at a clean end of stream.
    pub fn next_header(&mut self) -> Result<Option<Klv>> {
        let offset = self.position;
        let key = match read_key(&mut self.inner, offset)? {
            Some(key) => key,
            None => return Ok(None),
        };
        let (length, ber) = read_ber_length(&mut self.inner, offset + 16)?;
        self.position = offset + 16 + ber.len() as u64;
        Ok(Some(Klv {
            key,
            key_type: classify_key(&key),
            length,
            offset,
            ber,
        }))
    }

    /// Reads the payload of `klv` into `buf`, reusing its allocation.
    pub fn read_payload(&mut self, klv: &Klv, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        buf.resize(klv.length as usize, 0);
        self.inner
            .read_exact(buf)
            .map_err(|e| Error::from_io(self.position, e))?;
        self.position += klv.length;
        Ok(())
    }

    /// Seeks past the payload of `klv` without reading it.
    pub fn skip_payload(&mut self, klv: &Klv) -> Result<()> {
        self.inner
            .seek(SeekFrom::Current(klv.length as i64))
            .map_err(|e| Error::from_io(self.position, e))?;
        self.position += klv.length;
        Ok(())
    }

    /// Consumes the scanner, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classify_known_keys() {
        assert_eq!(classify_key(&keys::HEADER_PARTITION), KeyType::PartitionPack);
        assert_eq!(classify_key(&keys::FOOTER_PARTITION), KeyType::PartitionPack);
        assert_eq!(classify_key(&keys::PRIMER_PACK), KeyType::PrimerPack);
        assert_eq!(
            classify_key(&keys::TIMECODE_COMPONENT),
            KeyType::TimecodeComponent
        );
        assert_eq!(
            classify_key(&keys::INDEX_TABLE_SEGMENT),
            KeyType::IndexTableSegment
        );
        assert_eq!(classify_key(&keys::SYSTEM_ITEM), KeyType::System);
        assert_eq!(classify_key(&keys::DATA_ESSENCE), KeyType::Data);
        assert_eq!(classify_key(&keys::FILLER), KeyType::Filler);
        assert_eq!(classify_key(&[0_u8; 16]), KeyType::Unknown);
    }

    #[test]
    fn ber_short_form() {
        let mut cursor = Cursor::new(vec![0x7F]);
        let (length, raw) = read_ber_length(&mut cursor, 0).unwrap();
        assert_eq!(length, 0x7F);
        assert_eq!(raw.as_slice(), &[0x7F]);
    }

    #[test]
    fn ber_long_form() {
        let mut cursor = Cursor::new(vec![0x82, 0x01, 0x00]);
        let (length, raw) = read_ber_length(&mut cursor, 0).unwrap();
        assert_eq!(length, 0x100);
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn ber_rejects_indefinite_and_oversized() {
        let mut cursor = Cursor::new(vec![0x80]);
        assert!(matches!(
            read_ber_length(&mut cursor, 0).unwrap_err().details,
            ErrorDetails::InvalidLength
        ));
        let mut cursor = Cursor::new(vec![0x89, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(matches!(
            read_ber_length(&mut cursor, 0).unwrap_err().details,
            ErrorDetails::InvalidLength
        ));
    }

    #[test]
    fn ber_encode_round_trip() {
        for &length in &[0_u64, 0x7F, 0x80, 0x100, 0x12345, u64::from(u32::MAX) + 1] {
            let mut encoded = Vec::new();
            encode_ber_length(length, &mut encoded);
            let mut cursor = Cursor::new(encoded);
            assert_eq!(read_ber_length(&mut cursor, 0).unwrap().0, length);
        }
    }

    #[test]
    fn scanner_skips_and_reads() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&keys::FILLER);
        encode_ber_length(4, &mut stream);
        stream.extend_from_slice(&[0; 4]);
        stream.extend_from_slice(&keys::DATA_ESSENCE);
        encode_ber_length(3, &mut stream);
        stream.extend_from_slice(&[1, 2, 3]);

        let mut reader = KlvReader::new(Cursor::new(stream)).unwrap();
        let first = reader.next_header().unwrap().unwrap();
        assert_eq!(first.key_type, KeyType::Filler);
        assert_eq!(first.offset, 0);
        reader.skip_payload(&first).unwrap();

        let second = reader.next_header().unwrap().unwrap();
        assert_eq!(second.key_type, KeyType::Data);
        assert_eq!(second.length, 3);
        let mut payload = Vec::new();
        reader.read_payload(&second, &mut payload).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);

        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn partial_key_is_unexpected_eof() {
        let mut reader = KlvReader::new(Cursor::new(vec![0x06, 0x0E])).unwrap();
        assert!(matches!(
            reader.next_header().unwrap_err().details,
            ErrorDetails::UnexpectedEof
        ));
    }
}
