use std::cell::Cell;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;

/// Opaque seek handle into a compressed container.
///
/// `chunk` addresses a compression unit (its byte position in the compressed
/// file for chunked backends, or the global decompressed offset for
/// zstd-seekable, which leaves `offset_in_chunk` at zero);
/// `offset_in_chunk` addresses a byte within the decompressed unit.
/// Ordering is lexicographic, so offsets compare the way file positions do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Offset {
    pub chunk: u64,
    pub offset_in_chunk: u32,
}

impl Offset {
    pub const ZERO: Offset = Offset {
        chunk: 0,
        offset_in_chunk: 0,
    };

    pub fn new(chunk: u64, offset_in_chunk: u32) -> Self {
        Offset {
            chunk,
            offset_in_chunk,
        }
    }
}

/// Read contract shared by all container backends.
///
/// Construction replaces the classic `open() -> bool`: each backend exposes
/// an `open(path) -> anyhow::Result<Self>` that validates magics up front.
/// After a successful open, reads never fail loudly — I/O errors and
/// truncation degrade to end-of-stream, reported once through `tracing`.
pub trait File {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read;
    /// 0 means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Read a single byte, `None` at end of stream.
    fn getc(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        if self.read(&mut byte) == 1 {
            Some(byte[0])
        } else {
            None
        }
    }

    /// Advance the read position by `len` bytes without surfacing the data.
    /// Returns false if the stream ended first or the backend cannot skip.
    fn skip(&mut self, len: usize) -> bool;

    /// Coarse progress through the compressed input, 0..=100.
    fn percent_read(&self) -> u8;

    /// Whether [`File::current_offset`] / [`File::set_current_offset`] are
    /// meaningful on this backend. Callers must check before bookmarking.
    fn supports_offsets(&self) -> bool {
        false
    }

    /// Capture the current position. Only meaningful when
    /// [`File::supports_offsets`] returns true; other backends return
    /// [`Offset::ZERO`].
    fn current_offset(&self) -> Offset {
        Offset::ZERO
    }

    /// Restore a previously captured position. Degrades to a no-op
    /// returning false on backends without offset support.
    fn set_current_offset(&mut self, _offset: Offset) -> bool {
        false
    }
}

/// Shared progress counter between a [`CountingReader`] and the backend
/// that owns it (possibly buried inside a decompressor).
pub(crate) type ByteCounter = Rc<Cell<u64>>;

/// `std::fs::File` wrapper counting compressed bytes consumed, so backends
/// that hand their input to a streaming decompressor can still answer
/// [`File::percent_read`].
pub(crate) struct CountingReader {
    inner: fs::File,
    consumed: ByteCounter,
}

impl CountingReader {
    /// Open `path` and return the reader, its total size, and a handle to
    /// the consumed-bytes counter.
    pub(crate) fn open(path: &Path) -> anyhow::Result<(Self, u64, ByteCounter)> {
        let inner = fs::File::open(path)
            .with_context(|| format!("opening trace file {}", path.display()))?;
        let total = inner.metadata()?.len();
        let consumed: ByteCounter = Rc::new(Cell::new(0));
        let reader = CountingReader {
            inner,
            consumed: Rc::clone(&consumed),
        };
        Ok((reader, total, consumed))
    }
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.set(self.consumed.get() + n as u64);
        Ok(n)
    }
}

/// Progress percentage from a consumed/total byte pair.
pub(crate) fn percent(consumed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (consumed.min(total) * 100 / total) as u8
}
