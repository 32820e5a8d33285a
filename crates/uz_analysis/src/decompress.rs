//! Streaming decompression on top of block decompressors
//!
//! A [`BlockDecompressor`] turns compressed bytes into output one bounded
//! window at a time, keeping state between calls. [`DecompressingReader`]
//! drives one from a source in fixed-size blocks and hands the result out
//! through [`Read`].

use crate::error::{Result, UnravelError};
use std::io::{self, Read};

/// Compressed bytes pulled from the source per step
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Decompressed bytes produced per step
pub const OUTPUT_WINDOW: usize = 4 * BLOCK_SIZE;

/// A stateful decompression function with bounded output
pub trait BlockDecompressor {
    /// Name of the format, used in error messages
    fn format_name(&self) -> &'static str;

    /// Decompress from `input` into `output` and return how many bytes were
    /// consumed and produced, in that order.
    ///
    /// Never writes past the end of `output`. Input the call did not consume
    /// must be passed in again. When `output` came back full the backend may
    /// still hold output, and calling with empty input drains it.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)>;

    /// Whether the end of the compressed stream has been seen
    fn is_finished(&self) -> bool;
}

/// Exposes a [`BlockDecompressor`] fed from `source` as a sequential reader
pub struct DecompressingReader<R, D> {
    source: R,
    decompressor: D,
    block: Vec<u8>,
    block_pos: usize,
    block_len: usize,
    pending: Vec<u8>,
    pending_pos: usize,
    pending_len: usize,
    backend_has_output: bool,
    truncated: bool,
}

impl<R: Read, D: BlockDecompressor> DecompressingReader<R, D> {
    /// Decompress `source` with `decompressor`
    pub fn new(source: R, decompressor: D) -> Self {
        Self {
            source,
            decompressor,
            block: vec![0; BLOCK_SIZE],
            block_pos: 0,
            block_len: 0,
            pending: vec![0; OUTPUT_WINDOW],
            pending_pos: 0,
            pending_len: 0,
            backend_has_output: false,
            truncated: false,
        }
    }

    /// Get a reference to the block decompressor
    pub fn decompressor(&self) -> &D {
        &self.decompressor
    }

    fn truncation_error(&self) -> UnravelError {
        UnravelError::decode(
            self.decompressor.format_name(),
            "compressed stream is truncated",
        )
    }

    /// Run the decompressor until it yields output or the stream ends.
    /// Unconsumed input stays in `block` for the next call.
    fn refill(&mut self) -> Result<()> {
        self.pending_pos = 0;
        self.pending_len = 0;
        if self.truncated {
            return Err(self.truncation_error());
        }

        while !self.decompressor.is_finished() {
            let has_input = self.block_pos < self.block_len;
            if !has_input && !self.backend_has_output {
                let n = read_some(&mut self.source, &mut self.block)?;
                if n == 0 {
                    self.truncated = true;
                    return Err(self.truncation_error());
                }
                self.block_pos = 0;
                self.block_len = n;
                continue;
            }

            let input = &self.block[self.block_pos..self.block_len];
            let (consumed, produced) = self.decompressor.decompress(input, &mut self.pending)?;
            self.block_pos += consumed;
            self.backend_has_output = produced == self.pending.len();

            if produced > 0 {
                self.pending_len = produced;
                return Ok(());
            }
            if has_input && consumed == 0 {
                return Err(UnravelError::decode(
                    self.decompressor.format_name(),
                    "decoder made no progress",
                ));
            }
        }
        Ok(())
    }
}

impl<R: Read, D: BlockDecompressor> Read for DecompressingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending_pos >= self.pending_len {
            self.refill()?;
        }

        let available = &self.pending[self.pending_pos..self.pending_len];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}

/// `Read::read` that retries on `Interrupted`
pub(crate) fn read_some<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Bzip2 block decompressor backed by libbz2
pub struct Bzip2Decompressor {
    inner: bzip2::Decompress,
    finished: bool,
}

impl Bzip2Decompressor {
    /// Create a decompressor for a single bzip2 stream
    pub fn new() -> Self {
        Self {
            inner: bzip2::Decompress::new(false),
            finished: false,
        }
    }
}

impl Default for Bzip2Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDecompressor for Bzip2Decompressor {
    fn format_name(&self) -> &'static str {
        "bzip2"
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
        let status = self
            .inner
            .decompress(input, output)
            .map_err(|err| UnravelError::decode("bzip2", err.to_string()))?;
        match status {
            bzip2::Status::StreamEnd => self.finished = true,
            bzip2::Status::MemNeeded => {
                return Err(UnravelError::decode("bzip2", "out of memory"));
            }
            _ => {}
        }
        Ok((
            (self.inner.total_in() - in_before) as usize,
            (self.inner.total_out() - out_before) as usize,
        ))
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// XZ block decompressor backed by liblzma
pub struct XzDecompressor {
    inner: xz2::stream::Stream,
    finished: bool,
}

impl XzDecompressor {
    /// Create a decompressor for a single xz stream
    pub fn new() -> Result<Self> {
        let inner = xz2::stream::Stream::new_stream_decoder(u64::MAX, 0)
            .map_err(|err| UnravelError::decode("xz", err.to_string()))?;
        Ok(Self {
            inner,
            finished: false,
        })
    }
}

impl BlockDecompressor for XzDecompressor {
    fn format_name(&self) -> &'static str {
        "xz"
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
        // liblzma reports a call without progress as `MemNeeded`; the reader
        // treats that like any other empty step.
        let status = self
            .inner
            .process(input, output, xz2::stream::Action::Run)
            .map_err(|err| UnravelError::decode("xz", err.to_string()))?;
        if matches!(status, xz2::stream::Status::StreamEnd) {
            self.finished = true;
        }
        Ok((
            (self.inner.total_in() - in_before) as usize,
            (self.inner.total_out() - out_before) as usize,
        ))
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
