//! Random access over forward-only byte sources
//!
//! Format detection needs to peek at fixed offsets (tar keeps its marker 257
//! bytes in) while the data may come from a pipe that can only be read once.
//! [`StreamBuffer`] keeps every byte it has pulled from its source, so looking
//! at a position twice never touches the source again, and [`StreamView`]
//! lets a decoder consume the same bytes from the start afterwards.

use crate::error::{Result, UnravelError};
use std::{
    cell::RefCell,
    io::{self, Read, Seek, SeekFrom},
    ops::{Bound, RangeBounds},
};

/// A growing, append-only buffer over a forward-only reader.
///
/// Two access modes share the accumulated bytes but nothing else:
///
/// - random access through [`slice`](Self::slice) and [`index`](Self::index),
///   which never move a cursor, and
/// - sequential access through [`Read`] and [`Seek`], which move a cursor that
///   is independent of how much has been buffered.
///
/// The source is only ever asked for the exact shortfall between what is
/// buffered and what was requested.
#[derive(Debug)]
pub struct StreamBuffer<R> {
    source: R,
    buffer: Vec<u8>,
    cursor: usize,
    exhausted: bool,
}

impl<R: Read> StreamBuffer<R> {
    /// Wrap a reader
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            cursor: 0,
            exhausted: false,
        }
    }

    /// Make sure at least `n` bytes are buffered, reading only the missing
    /// bytes from the source.
    ///
    /// Returns how many of the `n` bytes are available, which is less than
    /// `n` only when the source ran out.
    pub fn ensure(&mut self, n: usize) -> io::Result<usize> {
        let buffered = self.buffer.len();
        if buffered < n && !self.exhausted {
            let shortfall = n - buffered;
            let got = self
                .source
                .by_ref()
                .take(shortfall as u64)
                .read_to_end(&mut self.buffer)?;
            tracing::trace!(requested = shortfall, got, "pulled bytes from source");
            if got < shortfall {
                self.exhausted = true;
            }
        }
        Ok(self.buffer.len().min(n))
    }

    /// Buffer the remainder of the source. Returns the total length.
    pub fn ensure_all(&mut self) -> io::Result<usize> {
        if !self.exhausted {
            let got = self.source.read_to_end(&mut self.buffer)?;
            tracing::trace!(got, "pulled remaining bytes from source");
            self.exhausted = true;
        }
        Ok(self.buffer.len())
    }

    /// Returns the bytes in `range`, or as many of them as the source holds.
    ///
    /// An open-ended range reads the whole source.
    pub fn slice<B: RangeBounds<usize>>(&mut self, range: B) -> io::Result<&[u8]> {
        let start = match range.start_bound() {
            Bound::Included(&start) => start,
            Bound::Excluded(&start) => start.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let available = match range.end_bound() {
            Bound::Included(&end) => self.ensure(end.saturating_add(1))?,
            Bound::Excluded(&end) => self.ensure(end)?,
            Bound::Unbounded => self.ensure_all()?,
        };
        Ok(&self.buffer[start.min(available)..available])
    }

    /// Like [`slice`](Self::slice) but with signed bounds: negative values
    /// count from the end of the source, which forces it to be read fully.
    /// `None` as the upper bound means "to the end".
    pub fn slice_signed(&mut self, lo: isize, hi: Option<isize>) -> io::Result<&[u8]> {
        let from_end = lo < 0 || hi.is_some_and(|hi| hi < 0);
        let len = if from_end { self.ensure_all()? } else { 0 };

        let lo = resolve_signed(lo, len);
        match hi {
            Some(hi) => self.slice(lo..resolve_signed(hi, len)),
            None => self.slice(lo..),
        }
    }

    /// Returns the byte at `index`, or `None` past the end of the source.
    /// Negative indices count from the end.
    pub fn index(&mut self, index: isize) -> io::Result<Option<u8>> {
        let position = if index < 0 {
            let len = self.ensure_all()?;
            match len.checked_sub(index.unsigned_abs()) {
                Some(position) => position,
                None => return Ok(None),
            }
        } else {
            index.unsigned_abs()
        };
        self.ensure(position.saturating_add(1))?;
        Ok(self.buffer.get(position).copied())
    }

    /// Read exactly `n` bytes at the cursor, or fail with a short read that
    /// names `field`. The cursor does not move on failure.
    pub fn read_exact_bytes(&mut self, n: usize, field: &str) -> Result<Vec<u8>> {
        let end = self.cursor + n;
        let available = self.ensure(end)?;
        if available < end {
            return Err(UnravelError::short_read(
                field,
                n,
                available.saturating_sub(self.cursor),
            ));
        }
        let bytes = self.buffer[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(bytes)
    }

    /// Current position of the sequential cursor
    pub fn position(&self) -> u64 {
        self.cursor as u64
    }

    /// Number of bytes pulled from the source so far
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the source has signalled end of data
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Get a reference to the underlying source
    pub fn get_ref(&self) -> &R {
        &self.source
    }
}

fn resolve_signed(index: isize, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs())
    } else {
        index.unsigned_abs()
    }
}

impl<R: Read> Read for StreamBuffer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.ensure(self.cursor.saturating_add(buf.len()))?;
        if self.cursor >= available {
            return Ok(0);
        }
        let n = available - self.cursor;
        buf[..n].copy_from_slice(&self.buffer[self.cursor..available]);
        self.cursor = available;
        Ok(n)
    }
}

impl<R: Read> Seek for StreamBuffer<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(position) => {
                let offset = i64::try_from(position).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek position out of range")
                })?;
                (0, offset)
            }
            SeekFrom::Current(offset) => (self.cursor, offset),
            SeekFrom::End(offset) => (self.ensure_all()?, offset),
        };
        let target = isize::try_from(offset)
            .ok()
            .and_then(|offset| base.checked_add_signed(offset))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid seek to a negative or overflowing position",
                )
            })?;
        self.cursor = target;
        Ok(target as u64)
    }
}

/// A sequential reader over a shared [`StreamBuffer`].
///
/// Views borrow the buffer, so the buffer outlives all of them. Each view has
/// its own position; reading through a view fills the buffer on demand but
/// never moves the buffer's own cursor.
#[derive(Debug)]
pub struct StreamView<'a, R> {
    buffer: &'a RefCell<StreamBuffer<R>>,
    start: usize,
    position: usize,
}

impl<'a, R: Read> StreamView<'a, R> {
    /// Create a view that starts reading at absolute offset `start`
    pub fn new(buffer: &'a RefCell<StreamBuffer<R>>, start: usize) -> Self {
        Self {
            buffer,
            start,
            position: start,
        }
    }

    /// Absolute offset the view started at
    pub fn start(&self) -> usize {
        self.start
    }

    /// Absolute offset of the next byte this view will return
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<R: Read> Read for StreamView<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buffer = self
            .buffer
            .try_borrow_mut()
            .map_err(|_| io::Error::other("stream buffer is borrowed elsewhere"))?;
        let bytes = buffer.slice(self.position..self.position.saturating_add(buf.len()))?;
        let n = bytes.len();
        buf[..n].copy_from_slice(bytes);
        self.position += n;
        Ok(n)
    }
}
