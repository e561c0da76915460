use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use crate::file::{percent, File, Offset};
use crate::format::{
    SEEK_TABLE_FOOTER_SIZE, SEEK_TABLE_HAS_CHECKSUM, SEEK_TABLE_MAGIC, ZSTD_DEFAULT_FRAME_SIZE,
    ZSTD_DEFAULT_LEVEL, ZSTD_SKIPPABLE_MAGIC,
};
use crate::outstream::OutStream;

// ── Reader ─────────────────────────────────────────────────────────────────

/// One seek-table row, resolved to absolute positions at open time.
#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    /// Byte offset of the frame in the compressed file.
    c_offset: u64,
    c_len: u32,
    /// Cumulative decompressed offset of the frame's first byte.
    d_offset: u64,
    d_len: u32,
    /// Low 32 bits of xxhash64 over the frame's uncompressed data.
    checksum: u32,
}

/// Reader for seekable zstd containers: standard zstd frames followed by a
/// skippable frame holding the seek table.
///
/// The table is loaded into RAM at open, after which any decompressed byte
/// offset resolves to its frame in one binary search — seeking costs at
/// most one frame decompression. Offsets store the global decompressed
/// position in [`Offset::chunk`]; `offset_in_chunk` is unused.
pub struct ZstdSeekableFile {
    file: fs::File,
    frames: Vec<FrameEntry>,
    total_raw: u64,
    verify_checksums: bool,
    /// Decompressed bytes of the frame at `cache_frame`.
    cache: Vec<u8>,
    cache_frame: usize,
    /// Global decompressed read position.
    pos: u64,
}

const NO_FRAME: usize = usize::MAX;

impl ZstdSeekableFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file = fs::File::open(path)
            .with_context(|| format!("opening trace file {}", path.display()))?;
        let file_size = file.metadata()?.len();
        if file_size < SEEK_TABLE_FOOTER_SIZE + 8 {
            anyhow::bail!("{} is too small to hold a seek table", path.display());
        }

        // Footer: frame count, descriptor, integrity magic.
        let mut footer = [0u8; SEEK_TABLE_FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-(SEEK_TABLE_FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;
        if u32::from_le_bytes(footer[5..9].try_into()?) != SEEK_TABLE_MAGIC {
            anyhow::bail!("{} has no seek table trailer", path.display());
        }
        let num_frames = u32::from_le_bytes(footer[0..4].try_into()?) as u64;
        let descriptor = footer[4];
        if descriptor & !SEEK_TABLE_HAS_CHECKSUM != 0 {
            anyhow::bail!(
                "{} uses unsupported seek table features (descriptor {:#04x})",
                path.display(),
                descriptor
            );
        }
        let has_checksum = descriptor & SEEK_TABLE_HAS_CHECKSUM != 0;
        let entry_size: u64 = if has_checksum { 12 } else { 8 };

        let content_size = num_frames * entry_size + SEEK_TABLE_FOOTER_SIZE;
        let table_frame_start = (file_size)
            .checked_sub(content_size + 8)
            .with_context(|| format!("{} seek table is larger than the file", path.display()))?;

        // The table must sit inside a well-formed skippable frame.
        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(table_frame_start))?;
        file.read_exact(&mut header)?;
        if u32::from_le_bytes(header[0..4].try_into()?) != ZSTD_SKIPPABLE_MAGIC {
            anyhow::bail!("{} seek table frame has a bad magic", path.display());
        }
        if u64::from(u32::from_le_bytes(header[4..8].try_into()?)) != content_size {
            anyhow::bail!("{} seek table frame size is inconsistent", path.display());
        }

        let mut table = vec![0u8; (num_frames * entry_size) as usize];
        file.read_exact(&mut table)?;

        let mut frames = Vec::with_capacity(num_frames as usize);
        let mut c_offset = 0u64;
        let mut d_offset = 0u64;
        for row in table.chunks_exact(entry_size as usize) {
            let c_len = u32::from_le_bytes(row[0..4].try_into()?);
            let d_len = u32::from_le_bytes(row[4..8].try_into()?);
            let checksum = if has_checksum {
                u32::from_le_bytes(row[8..12].try_into()?)
            } else {
                0
            };
            frames.push(FrameEntry {
                c_offset,
                c_len,
                d_offset,
                d_len,
                checksum,
            });
            c_offset += c_len as u64;
            d_offset += d_len as u64;
        }
        if c_offset > table_frame_start {
            anyhow::bail!("{} seek table spans past the data region", path.display());
        }

        Ok(ZstdSeekableFile {
            file,
            frames,
            total_raw: d_offset,
            verify_checksums: has_checksum,
            cache: Vec::new(),
            cache_frame: NO_FRAME,
            pos: 0,
        })
    }

    /// Total decompressed size described by the seek table.
    pub fn raw_size(&self) -> u64 {
        self.total_raw
    }

    /// Index of the frame containing decompressed offset `pos`.
    fn frame_of(&self, pos: u64) -> usize {
        self.frames
            .partition_point(|f| f.d_offset + f.d_len as u64 <= pos)
    }

    fn load_frame(&mut self, idx: usize) -> bool {
        let entry = self.frames[idx];
        if self.file.seek(SeekFrom::Start(entry.c_offset)).is_err() {
            return false;
        }
        let mut compressed = vec![0u8; entry.c_len as usize];
        if self.file.read_exact(&mut compressed).is_err() {
            warn!("seekable zstd frame {idx} is truncated");
            return false;
        }
        let raw = match zstd::bulk::decompress(&compressed, entry.d_len as usize) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to decompress seekable zstd frame {idx}: {err}");
                return false;
            }
        };
        if raw.len() != entry.d_len as usize {
            warn!(
                "seekable zstd frame {idx} decompressed to {} bytes, seek table says {}",
                raw.len(),
                entry.d_len
            );
            return false;
        }
        if self.verify_checksums {
            let computed = (xxh64(&raw, 0) & 0xFFFF_FFFF) as u32;
            if computed != entry.checksum {
                warn!(
                    "seekable zstd frame {idx} checksum mismatch: expected {:08x}, got {:08x}",
                    entry.checksum, computed
                );
                return false;
            }
        }
        self.cache = raw;
        self.cache_frame = idx;
        true
    }
}

impl File for ZstdSeekableFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() && self.pos < self.total_raw {
            let idx = self.frame_of(self.pos);
            if self.cache_frame != idx && !self.load_frame(idx) {
                break;
            }
            let in_frame = (self.pos - self.frames[idx].d_offset) as usize;
            let n = (buf.len() - total).min(self.cache.len() - in_frame);
            buf[total..total + n].copy_from_slice(&self.cache[in_frame..in_frame + n]);
            self.pos += n as u64;
            total += n;
        }
        total
    }

    /// Skips never decompress: intermediate frames are stepped over through
    /// the seek table and only the landing frame is loaded on the next read.
    fn skip(&mut self, len: usize) -> bool {
        let target = self.pos + len as u64;
        if target > self.total_raw {
            self.pos = self.total_raw;
            return false;
        }
        self.pos = target;
        true
    }

    fn percent_read(&self) -> u8 {
        percent(self.pos, self.total_raw)
    }

    fn supports_offsets(&self) -> bool {
        true
    }

    fn current_offset(&self) -> Offset {
        Offset::new(self.pos, 0)
    }

    fn set_current_offset(&mut self, offset: Offset) -> bool {
        if offset.chunk > self.total_raw {
            return false;
        }
        self.pos = offset.chunk;
        true
    }
}

// ── Writer ─────────────────────────────────────────────────────────────────

/// Encoder producing seekable zstd containers.
///
/// Raw bytes accumulate into frames of `frame_size`; each frame is
/// compressed independently and its sizes and checksum recorded for the
/// seek table. [`OutStream::flush`] ends the current frame *without*
/// writing the table, so a capture that dies mid-stream still leaves
/// standard frames the plain zstd reader can decode up to the last flush.
/// The table is emitted by [`ZstdSeekableStream::finish`] (or best-effort
/// on drop).
pub struct ZstdSeekableStream {
    file: fs::File,
    pending: Vec<u8>,
    frame_size: usize,
    level: i32,
    entries: Vec<(u32, u32, u32)>,
    ok: bool,
    finished: bool,
}

impl ZstdSeekableStream {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::with_options(path, ZSTD_DEFAULT_FRAME_SIZE, ZSTD_DEFAULT_LEVEL)
    }

    /// `frame_size` bounds the decompressed payload per frame (and thus the
    /// seek granularity); `level` is the zstd compression level.
    pub fn with_options(
        path: impl AsRef<Path>,
        frame_size: usize,
        level: i32,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        Ok(ZstdSeekableStream {
            file,
            pending: Vec::with_capacity(frame_size),
            frame_size,
            level,
            entries: Vec::new(),
            ok: true,
            finished: false,
        })
    }

    /// Compress and emit the first `raw_len` pending bytes as one frame.
    fn end_frame(&mut self, raw_len: usize) -> std::io::Result<()> {
        let compressed = zstd::bulk::compress(&self.pending[..raw_len], self.level)?;
        self.file.write_all(&compressed)?;
        let checksum = (xxh64(&self.pending[..raw_len], 0) & 0xFFFF_FFFF) as u32;
        self.entries
            .push((compressed.len() as u32, raw_len as u32, checksum));
        self.pending.drain(..raw_len);
        Ok(())
    }

    fn end_pending_frames(&mut self) {
        while self.ok && self.pending.len() >= self.frame_size {
            if let Err(err) = self.end_frame(self.frame_size) {
                warn!("seekable zstd stream write failed: {err}");
                self.ok = false;
            }
        }
    }

    fn write_seek_table(&mut self) -> std::io::Result<()> {
        let content_size = self.entries.len() as u32 * 12 + SEEK_TABLE_FOOTER_SIZE as u32;
        self.file.write_all(&ZSTD_SKIPPABLE_MAGIC.to_le_bytes())?;
        self.file.write_all(&content_size.to_le_bytes())?;
        for &(c_len, d_len, checksum) in &self.entries {
            self.file.write_all(&c_len.to_le_bytes())?;
            self.file.write_all(&d_len.to_le_bytes())?;
            self.file.write_all(&checksum.to_le_bytes())?;
        }
        self.file
            .write_all(&(self.entries.len() as u32).to_le_bytes())?;
        self.file.write_all(&[SEEK_TABLE_HAS_CHECKSUM])?;
        self.file.write_all(&SEEK_TABLE_MAGIC.to_le_bytes())?;
        self.file.flush()
    }

    /// End the last frame and append the seek-table frame.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.finalize()
            .context("finalizing seekable zstd trace container")?;
        Ok(())
    }

    fn finalize(&mut self) -> std::io::Result<()> {
        self.finished = true;
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.end_frame(len)?;
        }
        self.write_seek_table()
    }
}

impl OutStream for ZstdSeekableStream {
    fn write(&mut self, buf: &[u8]) -> bool {
        if !self.ok {
            return false;
        }
        self.pending.extend_from_slice(buf);
        self.end_pending_frames();
        self.ok
    }

    fn flush(&mut self) {
        if !self.ok {
            return;
        }
        if !self.pending.is_empty() {
            let len = self.pending.len();
            if let Err(err) = self.end_frame(len) {
                warn!("seekable zstd stream flush failed: {err}");
                self.ok = false;
                return;
            }
        }
        let _ = self.file.flush();
    }
}

impl Drop for ZstdSeekableStream {
    fn drop(&mut self) {
        if self.ok && !self.finished {
            if let Err(err) = self.finalize() {
                warn!("seekable zstd stream finalization failed: {err}");
            }
        }
    }
}
