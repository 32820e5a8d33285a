//! Streaming gzip decoding
//!
//! [`GzipReader`] parses the RFC 1952 member header itself and feeds the
//! deflate body to a raw (headerless) inflater. The trailer's CRC-32 and
//! size fields are not checked, and only the first member of a multi-member
//! file is decoded.

use crate::{
    decompress::{read_some, BLOCK_SIZE},
    error::{Result, UnravelError},
    format::format_timestamp,
};
use flate2::{Decompress, FlushDecompress, Status};
use std::io::{self, Read};

/// Gzip magic bytes
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Compression method byte for deflate, the only one in use
pub const CM_DEFLATE: u8 = 8;

/// Gzip header flags
pub mod flags {
    /// Content is probably ASCII text
    pub const FTEXT: u8 = 0x01;
    /// Header CRC16 present
    pub const FHCRC: u8 = 0x02;
    /// Extra field present
    pub const FEXTRA: u8 = 0x04;
    /// Original filename present
    pub const FNAME: u8 = 0x08;
    /// Comment present
    pub const FCOMMENT: u8 = 0x10;
    /// Must be zero
    pub const RESERVED: u8 = 0xE0;
}

/// Parsed gzip member header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipHeader {
    /// Raw flag byte
    pub flags: u8,
    /// Modification time of the original file (Unix timestamp, 0 if unknown)
    pub mtime: u32,
    /// Extra flags (compression level hint)
    pub extra_flags: u8,
    /// Operating system the file was compressed on
    pub os: u8,
    /// Original filename, if stored
    pub filename: Option<String>,
    /// Free-form comment, if stored
    pub comment: Option<String>,
    /// Header CRC16, if stored. Not verified.
    pub header_crc: Option<u16>,
}

impl GzipHeader {
    /// Read a header from the start of a gzip member
    pub fn parse<R: Read>(source: &mut R) -> Result<Self> {
        let fixed = read_field(source, 10, "header")?;

        if fixed[0..2] != GZIP_MAGIC {
            return Err(UnravelError::malformed_header(
                "magic",
                format!("expected 1f 8b, got {:02x} {:02x}", fixed[0], fixed[1]),
            ));
        }
        if fixed[2] != CM_DEFLATE {
            return Err(UnravelError::malformed_header(
                "compression method",
                format!("expected deflate ({CM_DEFLATE}), got {}", fixed[2]),
            ));
        }
        let flag_byte = fixed[3];
        if flag_byte & flags::RESERVED != 0 {
            return Err(UnravelError::malformed_header(
                "flags",
                format!("reserved bits set in {flag_byte:#04x}"),
            ));
        }

        if flag_byte & flags::FEXTRA != 0 {
            let len = read_field(source, 2, "extra field length")?;
            let len = u16::from_le_bytes([len[0], len[1]]);
            read_field(source, usize::from(len), "extra field")?;
        }
        let filename = if flag_byte & flags::FNAME != 0 {
            Some(read_zero_terminated(source, "filename")?)
        } else {
            None
        };
        let comment = if flag_byte & flags::FCOMMENT != 0 {
            Some(read_zero_terminated(source, "comment")?)
        } else {
            None
        };
        let header_crc = if flag_byte & flags::FHCRC != 0 {
            let crc = read_field(source, 2, "header crc")?;
            Some(u16::from_le_bytes([crc[0], crc[1]]))
        } else {
            None
        };

        Ok(Self {
            flags: flag_byte,
            mtime: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            extra_flags: fixed[8],
            os: fixed[9],
            filename,
            comment,
            header_crc,
        })
    }

    /// Whether the compressor flagged the content as text
    pub fn is_probably_text(&self) -> bool {
        self.flags & flags::FTEXT != 0
    }

    /// Modification time as an ISO-8601 UTC string, if one was recorded
    pub fn timestamp(&self) -> Option<String> {
        (self.mtime != 0).then(|| format_timestamp(self.mtime))
    }

    /// Name of the operating system, from the RFC 1952 table
    pub fn os_name(&self) -> &'static str {
        match self.os {
            0 => "FAT",
            1 => "Amiga",
            2 => "VMS",
            3 => "Unix",
            4 => "VM/CMS",
            5 => "Atari TOS",
            6 => "HPFS",
            7 => "Macintosh",
            8 => "Z-System",
            9 => "CP/M",
            10 => "TOPS-20",
            11 => "NTFS",
            12 => "QDOS",
            13 => "Acorn RISCOS",
            _ => "unknown",
        }
    }
}

/// Read exactly `n` bytes or fail with a short read naming `field`
fn read_field<R: Read>(source: &mut R, n: usize, field: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0; n];
    let mut filled = 0;
    while filled < n {
        let got = read_some(source, &mut buf[filled..])?;
        if got == 0 {
            return Err(UnravelError::short_read(field, n, filled));
        }
        filled += got;
    }
    Ok(buf)
}

/// Read a zero-terminated ISO 8859-1 string
fn read_zero_terminated<R: Read>(source: &mut R, field: &str) -> Result<String> {
    let mut text = String::new();
    let mut byte = [0u8; 1];
    loop {
        if read_some(source, &mut byte)? == 0 {
            return Err(UnravelError::short_read(field, text.len() + 1, text.len()));
        }
        match byte[0] {
            0 => return Ok(text),
            b => text.push(char::from(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    HeaderParsed,
    Streaming,
    Exhausted,
}

/// Decodes a gzip stream read from `source`.
///
/// Nothing is read until the first call to [`read`](Read::read) or
/// [`header`](Self::header). Compressed input is pulled in blocks of
/// [`BLOCK_SIZE`] bytes; when the caller's buffer fills up before a block is
/// used up, the rest of the block is fed to the inflater on the next call
/// before anything new is read.
pub struct GzipReader<R> {
    source: R,
    state: State,
    header: Option<GzipHeader>,
    inflater: Option<Decompress>,
    input: Vec<u8>,
    input_pos: usize,
    input_len: usize,
}

impl<R: Read> GzipReader<R> {
    /// Wrap a gzip stream. Nothing is read until the first call.
    pub fn new(source: R) -> Self {
        Self {
            source,
            state: State::Uninitialized,
            header: None,
            inflater: None,
            input: vec![0; BLOCK_SIZE],
            input_pos: 0,
            input_len: 0,
        }
    }

    /// Parse the header if that has not happened yet, without starting to
    /// decompress.
    pub fn header(&mut self) -> Result<&GzipHeader> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                let header = GzipHeader::parse(&mut self.source)?;
                tracing::debug!(
                    filename = header.filename.as_deref(),
                    mtime = header.mtime,
                    os = header.os_name(),
                    "parsed gzip header"
                );
                self.state = State::HeaderParsed;
                header
            }
        };
        Ok(self.header.insert(header))
    }

    /// The header, if it has been parsed already
    pub fn parsed_header(&self) -> Option<&GzipHeader> {
        self.header.as_ref()
    }

    /// Whether the end of the deflate stream has been reached
    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }

    /// Consume the reader, returning the source
    pub fn into_inner(self) -> R {
        self.source
    }

    fn inflate_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let inflater = self.inflater.get_or_insert_with(|| Decompress::new(false));

        loop {
            if self.input_pos == self.input_len {
                let n = read_some(&mut self.source, &mut self.input)?;
                if n == 0 {
                    return Err(UnravelError::decode(
                        "gzip",
                        "input ended before the final deflate block",
                    ));
                }
                self.input_pos = 0;
                self.input_len = n;
            }

            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            let status = inflater
                .decompress(
                    &self.input[self.input_pos..self.input_len],
                    buf,
                    FlushDecompress::None,
                )
                .map_err(|err| UnravelError::decode("gzip", err.to_string()))?;
            let consumed = (inflater.total_in() - before_in) as usize;
            let produced = (inflater.total_out() - before_out) as usize;
            self.input_pos += consumed;

            match status {
                Status::StreamEnd => {
                    // What is left of the input is the trailer.
                    self.state = State::Exhausted;
                    return Ok(produced);
                }
                Status::Ok | Status::BufError => {
                    if produced > 0 {
                        return Ok(produced);
                    }
                    if consumed == 0 && self.input_pos < self.input_len {
                        return Err(UnravelError::decode("gzip", "inflater made no progress"));
                    }
                }
            }
        }
    }
}

impl<R: Read> Read for GzipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                State::Uninitialized => {
                    self.header()?;
                }
                State::HeaderParsed => {
                    self.inflater = Some(Decompress::new(false));
                    self.state = State::Streaming;
                }
                State::Streaming => return Ok(self.inflate_into(buf)?),
                State::Exhausted => return Ok(0),
            }
        }
    }
}
