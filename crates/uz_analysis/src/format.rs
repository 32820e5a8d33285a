//! Format recognition from magic bytes and fixed-offset header fields

use crate::{
    buffer::StreamBuffer,
    decompress::{Bzip2Decompressor, DecompressingReader, XzDecompressor},
    error::Result,
    gzip::GzipReader,
};
use chrono::DateTime;
use indexmap::IndexMap;
use std::{fmt, io::Read};

const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const BZIP2_MAGIC: [u8; 2] = *b"BZ";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const TAR_MAGIC: [u8; 5] = *b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;
const RAR4_MAGIC: [u8; 7] = *b"Rar!\x1A\x07\x00";
const RAR5_MAGIC: [u8; 8] = *b"Rar!\x1A\x07\x01\x00";
const SEVENZ_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// Supported compression and archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// XZ compressed stream (.xz)
    Xz,
    /// Gzip compressed stream (.gz)
    Gzip,
    /// Bzip2 compressed stream (.bz2)
    Bzip2,
    /// ZIP archive
    Zip,
    /// Tar archive, GNU or POSIX flavour
    Tar,
    /// RAR archive, version 4 or 5
    Rar,
    /// 7-Zip archive
    SevenZip,
}

impl Format {
    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::Rar => "rar",
            Self::SevenZip => "7z",
        }
    }

    /// Whether the payload is compressed
    pub fn is_compression(&self) -> bool {
        !matches!(self, Self::Tar)
    }

    /// Whether this is a multi-entry container that is never decoded in-process
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Zip | Self::Tar | Self::Rar | Self::SevenZip)
    }

    /// Whether the content can be consumed from a pipe rather than needing
    /// random access to a real file
    pub fn is_streamable(&self) -> bool {
        !matches!(self, Self::Zip | Self::Rar | Self::SevenZip)
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Zip => ".zip",
            Self::Tar => ".tar",
            Self::Rar => ".rar",
            Self::SevenZip => ".7z",
        }
    }

    /// Short extensions that stand for this compression wrapped around a tar
    /// archive, e.g. `.tgz`
    pub fn tar_aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Gzip => &[".tgz", ".taz"],
            Self::Bzip2 => &[".tbz", ".tbz2", ".tz2"],
            Self::Xz => &[".txz"],
            _ => &[],
        }
    }

    /// The tar flag that decompresses this format inside the tar process
    pub fn tar_flag(&self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("-z"),
            Self::Bzip2 => Some("-j"),
            Self::Xz => Some("-J"),
            _ => None,
        }
    }

    /// Whether [`open`](Self::open) can decode this format
    pub fn can_decode(&self) -> bool {
        matches!(self, Self::Xz | Self::Gzip | Self::Bzip2)
    }

    /// Open a decoder that yields the payload of `source`, which must start
    /// at the beginning of this format's header. Returns `None` for formats
    /// without an in-process decoder.
    pub fn open<'a, R: Read + 'a>(self, source: R) -> Result<Option<Box<dyn Read + 'a>>> {
        let reader: Box<dyn Read + 'a> = match self {
            Self::Gzip => Box::new(GzipReader::new(source)),
            Self::Bzip2 => Box::new(DecompressingReader::new(source, Bzip2Decompressor::new())),
            Self::Xz => Box::new(DecompressingReader::new(source, XzDecompressor::new()?)),
            Self::Zip | Self::Tar | Self::Rar | Self::SevenZip => return Ok(None),
        };
        Ok(Some(reader))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value extracted from a format header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Number(u64),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "'{text}'"),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u16> for MetadataValue {
    fn from(value: u16) -> Self {
        Self::Number(u64::from(value))
    }
}

/// A format matched at the start of a stream, together with what its header
/// revealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    format: Format,
    metadata: IndexMap<&'static str, MetadataValue>,
}

impl FormatDescriptor {
    /// Create a descriptor without metadata
    pub fn new(format: Format) -> Self {
        Self {
            format,
            metadata: IndexMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with(mut self, key: &'static str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key, value.into());
        self
    }

    /// The recognized format
    pub fn format(&self) -> Format {
        self.format
    }

    /// Short lowercase name of the format
    pub fn name(&self) -> &'static str {
        self.format.name()
    }

    /// Whether the layer wraps a single compressed stream
    pub fn is_compression(&self) -> bool {
        self.format.is_compression()
    }

    /// Whether the layer holds a collection of entries
    pub fn is_archive(&self) -> bool {
        self.format.is_archive()
    }

    /// Whether the layer can be unpacked from a pipe
    pub fn is_streamable(&self) -> bool {
        self.format.is_streamable()
    }

    /// Conventional file extension, including the dot
    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Header fields in the order they were extracted
    pub fn metadata(&self) -> &IndexMap<&'static str, MetadataValue> {
        &self.metadata
    }

    /// Look up a single header field
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }
}

/// Shows the format name; the alternate form (`{:#}`) appends the metadata,
/// e.g. `bzip2(version='1', blocksize='900 kB')`.
impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if f.alternate() && !self.metadata.is_empty() {
            f.write_str("(")?;
            for (i, (key, value)) in self.metadata.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Matches one format against the leading bytes of a stream
#[derive(Clone, Copy)]
pub struct Recognizer {
    format: Format,
    probe_len: usize,
    matcher: fn(&[u8]) -> Option<FormatDescriptor>,
}

impl Recognizer {
    /// The format this recognizer detects
    pub fn format(&self) -> Format {
        self.format
    }

    /// How many leading bytes the matcher looks at
    pub fn probe_len(&self) -> usize {
        self.probe_len
    }

    /// Match against a header prefix, which may be shorter than
    /// [`probe_len`](Self::probe_len) for short streams
    pub fn matches(&self, header: &[u8]) -> Option<FormatDescriptor> {
        (self.matcher)(header)
    }

    /// Peek at the start of `buffer` without moving its cursor
    pub fn recognize<R: Read>(
        &self,
        buffer: &mut StreamBuffer<R>,
    ) -> Result<Option<FormatDescriptor>> {
        let header = buffer.slice(0..self.probe_len)?;
        Ok(self.matches(header))
    }
}

impl fmt::Debug for Recognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recognizer")
            .field("format", &self.format)
            .field("probe_len", &self.probe_len)
            .finish()
    }
}

/// All recognizers, in the order they are tried
pub const RECOGNIZERS: [Recognizer; 7] = [
    Recognizer {
        format: Format::Xz,
        probe_len: XZ_MAGIC.len(),
        matcher: match_xz,
    },
    Recognizer {
        format: Format::Gzip,
        probe_len: 8,
        matcher: match_gzip,
    },
    Recognizer {
        format: Format::Bzip2,
        probe_len: 4,
        matcher: match_bzip2,
    },
    Recognizer {
        format: Format::Zip,
        probe_len: 10,
        matcher: match_zip,
    },
    Recognizer {
        format: Format::Tar,
        probe_len: TAR_MAGIC_OFFSET + 8,
        matcher: match_tar,
    },
    Recognizer {
        format: Format::Rar,
        probe_len: RAR5_MAGIC.len(),
        matcher: match_rar,
    },
    Recognizer {
        format: Format::SevenZip,
        probe_len: SEVENZ_MAGIC.len() + 2,
        matcher: match_sevenz,
    },
];

/// Return the first format that matches the start of `buffer`
pub fn recognize<R: Read>(buffer: &mut StreamBuffer<R>) -> Result<Option<FormatDescriptor>> {
    for recognizer in &RECOGNIZERS {
        if let Some(descriptor) = recognizer.recognize(buffer)? {
            return Ok(Some(descriptor));
        }
    }
    Ok(None)
}

fn le_u16(header: &[u8], offset: usize) -> Option<u16> {
    let bytes = header.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn match_xz(header: &[u8]) -> Option<FormatDescriptor> {
    header
        .starts_with(&XZ_MAGIC)
        .then(|| FormatDescriptor::new(Format::Xz))
}

fn match_gzip(header: &[u8]) -> Option<FormatDescriptor> {
    if !header.starts_with(&GZIP_MAGIC) {
        return None;
    }
    let method = match *header.get(2)? {
        0 => "store",
        1 => "compress",
        2 => "pack",
        3 => "lzh",
        8 => "deflate",
        _ => "unknown",
    };
    let mtime = u32::from_le_bytes(header.get(4..8)?.try_into().ok()?);

    Some(
        FormatDescriptor::new(Format::Gzip)
            .with("compression_method", method)
            .with("timestamp", format_timestamp(mtime)),
    )
}

/// Seconds since the epoch as an ISO-8601 UTC timestamp
pub(crate) fn format_timestamp(seconds: u32) -> String {
    DateTime::from_timestamp(i64::from(seconds), 0)
        .map(|time| time.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn match_bzip2(header: &[u8]) -> Option<FormatDescriptor> {
    if !header.starts_with(&BZIP2_MAGIC) {
        return None;
    }
    let version = match *header.get(2)? {
        b'h' => "2 (Huffman)",
        b'0' => "1",
        _ => return None,
    };
    let block_size = *header.get(3)?;
    if !(b'1'..=b'9').contains(&block_size) {
        return None;
    }

    Some(
        FormatDescriptor::new(Format::Bzip2)
            .with("version", version)
            .with("blocksize", format!("{}00 kB", block_size as char)),
    )
}

fn match_zip(header: &[u8]) -> Option<FormatDescriptor> {
    if !header.starts_with(&ZIP_MAGIC) {
        return None;
    }
    Some(
        FormatDescriptor::new(Format::Zip)
            .with("min_version", le_u16(header, 4)?)
            .with("flags", le_u16(header, 6)?)
            .with("compression_method", le_u16(header, 8)?),
    )
}

fn match_tar(header: &[u8]) -> Option<FormatDescriptor> {
    let magic_end = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
    if header.get(TAR_MAGIC_OFFSET..magic_end)? != TAR_MAGIC {
        return None;
    }
    // GNU tar writes "ustar  \0", POSIX writes "ustar\0" followed by "00".
    let variant = match *header.get(magic_end)? {
        b' ' => "gnu",
        0 => "posix",
        _ => return None,
    };

    let version = header.get(magic_end + 1..magic_end + 3)?;
    Some(
        FormatDescriptor::new(Format::Tar)
            .with("variant", variant)
            .with("version", version.escape_ascii().to_string()),
    )
}

fn match_rar(header: &[u8]) -> Option<FormatDescriptor> {
    let version = if header.starts_with(&RAR5_MAGIC) {
        "5"
    } else if header.starts_with(&RAR4_MAGIC) {
        "4"
    } else {
        return None;
    };
    Some(FormatDescriptor::new(Format::Rar).with("version", version))
}

fn match_sevenz(header: &[u8]) -> Option<FormatDescriptor> {
    if !header.starts_with(&SEVENZ_MAGIC) {
        return None;
    }
    let mut descriptor = FormatDescriptor::new(Format::SevenZip);
    if let Some(&[major, minor]) = header.get(6..8) {
        descriptor = descriptor.with("version", format!("{major}.{minor}"));
    }
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    fn detect(bytes: &[u8]) -> Option<FormatDescriptor> {
        let mut buffer = StreamBuffer::new(Cursor::new(bytes.to_vec()));
        recognize(&mut buffer).unwrap()
    }

    fn tar_header(gnu: bool) -> Vec<u8> {
        let mut header = if gnu {
            tar::Header::new_gnu()
        } else {
            tar::Header::new_ustar()
        };
        header.set_path("hello.txt").unwrap();
        header.set_size(0);
        header.set_cksum();
        header.as_bytes().to_vec()
    }

    #[rstest]
    #[case::xz(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00, 0x04], Format::Xz)]
    #[case::gzip(&[0x1F, 0x8B, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03], Format::Gzip)]
    #[case::bzip2(b"BZh91AY&SY", Format::Bzip2)]
    #[case::zip(b"PK\x03\x04\x14\x00\x00\x00\x08\x00", Format::Zip)]
    #[case::rar4(b"Rar!\x1A\x07\x00\xCF\x90\x73", Format::Rar)]
    #[case::rar5(b"Rar!\x1A\x07\x01\x00\x33\x92", Format::Rar)]
    #[case::sevenz(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04], Format::SevenZip)]
    fn test_detect_formats(#[case] bytes: &[u8], #[case] expected: Format) {
        assert_eq!(detect(bytes).map(|d| d.format()), Some(expected));
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::text(b"hello world, this is not compressed")]
    #[case::bad_bzip2_version(b"BZx91AY&SY")]
    #[case::bad_bzip2_block_size(b"BZh01AY&SY")]
    #[case::truncated_gzip(&[0x1F, 0x8B, 0x08])]
    #[case::truncated_zip(b"PK\x03\x04\x14")]
    #[case::zip_end_of_directory(b"PK\x05\x06\x00\x00\x00\x00\x00\x00")]
    fn test_no_match(#[case] bytes: &[u8]) {
        assert_eq!(detect(bytes), None);
    }

    #[test]
    fn test_gzip_metadata() {
        let descriptor = detect(&[0x1F, 0x8B, 0x03, 0x00, 0x00, 0xE1, 0xF5, 0x05, 0x00, 0x03]).unwrap();
        assert_eq!(
            descriptor.get("compression_method"),
            Some(&MetadataValue::from("lzh"))
        );
        assert_eq!(
            descriptor.get("timestamp"),
            Some(&MetadataValue::from("1973-03-03T09:46:40"))
        );

        let unknown = detect(&[0x1F, 0x8B, 0x63, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(
            unknown.get("compression_method"),
            Some(&MetadataValue::from("unknown"))
        );
    }

    #[test]
    fn test_bzip2_metadata() {
        let descriptor = detect(b"BZ05rest").unwrap();
        assert_eq!(descriptor.get("version"), Some(&MetadataValue::from("1")));
        assert_eq!(
            descriptor.get("blocksize"),
            Some(&MetadataValue::from("500 kB"))
        );
        assert_eq!(
            format!("{descriptor:#}"),
            "bzip2(version='1', blocksize='500 kB')"
        );
        assert_eq!(descriptor.to_string(), "bzip2");
    }

    #[test]
    fn test_zip_metadata() {
        let descriptor = detect(b"PK\x03\x04\x14\x00\x08\x00\x08\x00rest").unwrap();
        assert_eq!(
            format!("{descriptor:#}"),
            "zip(min_version=20, flags=8, compression_method=8)"
        );
        assert!(descriptor.is_archive());
        assert!(!descriptor.is_streamable());
    }

    #[test]
    fn test_tar_variants() {
        let gnu = detect(&tar_header(true)).unwrap();
        assert_eq!(gnu.format(), Format::Tar);
        assert_eq!(gnu.get("variant"), Some(&MetadataValue::from("gnu")));
        assert_eq!(gnu.get("version"), Some(&MetadataValue::from(" \\x00")));

        let posix = detect(&tar_header(false)).unwrap();
        assert_eq!(posix.get("variant"), Some(&MetadataValue::from("posix")));
        assert_eq!(posix.get("version"), Some(&MetadataValue::from("00")));
    }

    #[test]
    fn test_sevenz_version() {
        let descriptor = detect(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04]).unwrap();
        assert_eq!(descriptor.get("version"), Some(&MetadataValue::from("0.4")));
    }

    #[test]
    fn test_recognition_does_not_move_the_cursor() {
        let mut buffer = StreamBuffer::new(Cursor::new(tar_header(true)));
        assert!(recognize(&mut buffer).unwrap().is_some());
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.buffered_len(), TAR_MAGIC_OFFSET + 8);
    }

    #[test]
    fn test_format_properties() {
        assert!(Format::Gzip.is_compression());
        assert!(!Format::Gzip.is_archive());
        assert!(Format::Gzip.is_streamable());
        assert!(!Format::Tar.is_compression());
        assert!(Format::Tar.is_archive());
        assert!(Format::Tar.is_streamable());
        for format in [Format::Zip, Format::Rar, Format::SevenZip] {
            assert!(format.is_archive());
            assert!(!format.is_streamable());
            assert!(!format.can_decode());
        }
        assert_eq!(Format::Xz.tar_flag(), Some("-J"));
        assert_eq!(Format::Tar.tar_flag(), None);
    }

    #[test]
    fn test_open_only_for_decodable_formats() {
        assert!(Format::Tar.open(Cursor::new(Vec::new())).unwrap().is_none());
        assert!(Format::Zip.open(Cursor::new(Vec::new())).unwrap().is_none());
        assert!(Format::Gzip.open(Cursor::new(Vec::new())).unwrap().is_some());
    }
}
