use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use tracing::warn;

use crate::file::{percent, File, Offset};
use crate::format::{SNAPPY_CHUNK_SIZE, SNAPPY_MAGIC};
use crate::outstream::OutStream;

/// Upper bound on a single chunk's compressed length field. Anything larger
/// means the stream is corrupt, not merely truncated.
const MAX_COMPRESSED_CHUNK: u32 = 1 << 30;

// ── Reader ─────────────────────────────────────────────────────────────────

/// Reader for the snappy trace container: 2-byte magic `b"at"`, then
/// repeated `[u32 LE compressed length][compressed bytes]` chunks.
///
/// One decompressed chunk is cached at a time; reads and skips drain the
/// cache and reload on exhaustion. Offsets are
/// `(file position of the chunk's length prefix, byte within the
/// decompressed chunk)`, so restoring one costs a single chunk
/// decompression.
///
/// A truncated or corrupt tail — the usual result of a crashed capture —
/// decompresses as far as the data allows, logs one warning, and then
/// reports end of stream.
pub struct SnappyFile {
    file: fs::File,
    file_size: u64,
    /// Decompressed bytes of the current chunk.
    cache: Vec<u8>,
    /// Read position within `cache`.
    cache_pos: usize,
    /// File position of the current chunk's length prefix.
    chunk_offset: u64,
    /// File position of the chunk after the current one.
    next_chunk_offset: u64,
    decoder: snap::raw::Decoder,
}

impl SnappyFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file = fs::File::open(path)
            .with_context(|| format!("opening trace file {}", path.display()))?;
        let file_size = file.metadata()?.len();

        let mut magic = [0u8; 2];
        file.read_exact(&mut magic)
            .with_context(|| format!("reading container magic from {}", path.display()))?;
        if magic != SNAPPY_MAGIC {
            anyhow::bail!("{} is not a snappy trace container", path.display());
        }

        Ok(SnappyFile {
            file,
            file_size,
            cache: Vec::new(),
            cache_pos: 0,
            chunk_offset: SNAPPY_MAGIC.len() as u64,
            next_chunk_offset: SNAPPY_MAGIC.len() as u64,
            decoder: snap::raw::Decoder::new(),
        })
    }

    /// Load the chunk at `next_chunk_offset` into the cache. Returns false
    /// at end of stream or on unrecoverable corruption.
    fn load_next_chunk(&mut self) -> bool {
        self.chunk_offset = self.next_chunk_offset;
        if self.chunk_offset >= self.file_size {
            return false;
        }
        if self.file.seek(SeekFrom::Start(self.chunk_offset)).is_err() {
            return false;
        }

        let mut len_buf = [0u8; 4];
        match read_full(&mut self.file, &mut len_buf) {
            4 => {}
            0 => return false,
            n => {
                warn!(
                    "truncated snappy container: {} stray byte(s) after last chunk",
                    n
                );
                return false;
            }
        }
        let compressed_len = u32::from_le_bytes(len_buf);
        if compressed_len == 0 || compressed_len > MAX_COMPRESSED_CHUNK {
            warn!("corrupt snappy chunk length {compressed_len}, stopping");
            return false;
        }

        let mut compressed = vec![0u8; compressed_len as usize];
        let got = read_full(&mut self.file, &mut compressed);
        if got < compressed.len() {
            // Crashed capture: the last chunk was cut short. Try to recover
            // whatever prefix still decompresses.
            warn!(
                "truncated snappy chunk at offset {}: expected {} bytes, found {}; \
                 decompressing as much as possible",
                self.chunk_offset, compressed_len, got
            );
            compressed.truncate(got);
        }

        match self.decoder.decompress_vec(&compressed) {
            Ok(raw) => {
                self.cache = raw;
                self.cache_pos = 0;
                self.next_chunk_offset = self.chunk_offset + 4 + got as u64;
                !self.cache.is_empty()
            }
            Err(err) => {
                warn!(
                    "failed to decompress snappy chunk at offset {}: {}",
                    self.chunk_offset, err
                );
                false
            }
        }
    }

    fn cached_remaining(&self) -> usize {
        self.cache.len() - self.cache_pos
    }
}

impl File for SnappyFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            if self.cache_pos >= self.cache.len() {
                if !self.load_next_chunk() {
                    break;
                }
            }
            let n = (buf.len() - total).min(self.cached_remaining());
            buf[total..total + n]
                .copy_from_slice(&self.cache[self.cache_pos..self.cache_pos + n]);
            self.cache_pos += n;
            total += n;
        }
        total
    }

    fn skip(&mut self, len: usize) -> bool {
        let mut remaining = len;
        while remaining > 0 {
            if self.cache_pos >= self.cache.len() {
                if !self.load_next_chunk() {
                    return false;
                }
            }
            let n = remaining.min(self.cached_remaining());
            self.cache_pos += n;
            remaining -= n;
        }
        true
    }

    fn percent_read(&self) -> u8 {
        percent(self.next_chunk_offset, self.file_size)
    }

    fn supports_offsets(&self) -> bool {
        true
    }

    fn current_offset(&self) -> Offset {
        Offset::new(self.chunk_offset, self.cache_pos as u32)
    }

    fn set_current_offset(&mut self, offset: Offset) -> bool {
        if offset.chunk != self.chunk_offset || self.cache.is_empty() {
            self.next_chunk_offset = offset.chunk;
            if !self.load_next_chunk() {
                return false;
            }
        }
        if offset.offset_in_chunk as usize > self.cache.len() {
            return false;
        }
        self.cache_pos = offset.offset_in_chunk as usize;
        true
    }
}

fn read_full(file: &mut fs::File, buf: &mut [u8]) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
    total
}

// ── Writer ─────────────────────────────────────────────────────────────────

/// Encoder producing the snappy trace container read by [`SnappyFile`].
///
/// Raw bytes accumulate until a full chunk is gathered, then the chunk is
/// compressed and framed as `[u32 LE length][compressed bytes]`. The magic
/// is written at construction, so even an abandoned stream sniffs
/// correctly.
pub struct SnappyStream {
    file: fs::File,
    pending: Vec<u8>,
    chunk_size: usize,
    encoder: snap::raw::Encoder,
    ok: bool,
}

impl SnappyStream {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::with_chunk_size(path, SNAPPY_CHUNK_SIZE)
    }

    /// `chunk_size` sets the uncompressed bytes gathered per chunk. Smaller
    /// chunks seek faster and compress worse.
    pub fn with_chunk_size(path: impl AsRef<Path>, chunk_size: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file = fs::File::create(path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        file.write_all(&SNAPPY_MAGIC)?;
        Ok(SnappyStream {
            file,
            pending: Vec::with_capacity(chunk_size),
            chunk_size,
            encoder: snap::raw::Encoder::new(),
            ok: true,
        })
    }

    fn flush_chunk(&mut self, raw_len: usize) -> std::io::Result<()> {
        let compressed = self
            .encoder
            .compress_vec(&self.pending[..raw_len])
            .map_err(std::io::Error::other)?;
        self.file
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.file.write_all(&compressed)?;
        self.pending.drain(..raw_len);
        Ok(())
    }

    fn flush_pending(&mut self) {
        while self.ok && self.pending.len() >= self.chunk_size {
            if let Err(err) = self.flush_chunk(self.chunk_size) {
                warn!("snappy stream write failed: {err}");
                self.ok = false;
            }
        }
    }

    /// Flush any partial chunk and sync buffered data to the file.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.finalize()
            .context("finalizing snappy trace container")?;
        Ok(())
    }

    fn finalize(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.flush_chunk(len)?;
        }
        self.file.flush()
    }
}

impl OutStream for SnappyStream {
    fn write(&mut self, buf: &[u8]) -> bool {
        if !self.ok {
            return false;
        }
        self.pending.extend_from_slice(buf);
        self.flush_pending();
        self.ok
    }

    fn flush(&mut self) {
        if !self.ok {
            return;
        }
        if !self.pending.is_empty() {
            let len = self.pending.len();
            if let Err(err) = self.flush_chunk(len) {
                warn!("snappy stream flush failed: {err}");
                self.ok = false;
                return;
            }
        }
        let _ = self.file.flush();
    }
}

impl Drop for SnappyStream {
    fn drop(&mut self) {
        if self.ok {
            if let Err(err) = self.finalize() {
                warn!("snappy stream finalization failed: {err}");
            }
        }
    }
}
