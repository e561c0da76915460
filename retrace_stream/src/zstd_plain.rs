use std::io::{BufReader, Read};
use std::path::Path;

use tracing::warn;

use crate::file::{percent, ByteCounter, CountingReader, File};
use crate::format::ZSTD_CACHE_SIZE;

/// Reader for plain zstd frame sequences.
///
/// The parser issues many byte-sized reads, so the stream is decoded
/// incrementally into a large cache rather than read through the
/// decompressor one call at a time.
///
/// This backend is also the fallback for seekable containers that lost
/// their seek table — a capture that crashed before finalization leaves
/// standard frames with no trailer, which decode fine sequentially.
/// Skippable frames (including an intact seek table) are passed over by
/// the decoder, so offsets are simply not supported here rather than
/// wrong.
pub struct ZstdFile {
    decoder: zstd::stream::read::Decoder<'static, BufReader<CountingReader>>,
    cache: Vec<u8>,
    cache_pos: usize,
    consumed: ByteCounter,
    total: u64,
    eof: bool,
}

impl ZstdFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let (reader, total, consumed) = CountingReader::open(path)?;
        let decoder = zstd::stream::read::Decoder::new(reader)?;
        Ok(ZstdFile {
            decoder,
            cache: Vec::new(),
            cache_pos: 0,
            consumed,
            total,
            eof: false,
        })
    }

    /// Refill the cache with the next stretch of decompressed bytes.
    fn load_cache(&mut self) -> bool {
        if self.eof {
            return false;
        }
        self.cache.resize(ZSTD_CACHE_SIZE, 0);
        self.cache_pos = 0;
        match self.decoder.read(&mut self.cache) {
            Ok(0) => {
                self.eof = true;
                self.cache.clear();
                false
            }
            Ok(n) => {
                self.cache.truncate(n);
                true
            }
            Err(err) => {
                warn!("zstd trace read failed: {err}");
                self.eof = true;
                self.cache.clear();
                false
            }
        }
    }

    fn cached_remaining(&self) -> usize {
        self.cache.len() - self.cache_pos
    }
}

impl File for ZstdFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            if self.cache_pos >= self.cache.len() && !self.load_cache() {
                break;
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
            if self.cache_pos >= self.cache.len() && !self.load_cache() {
                return false;
            }
            let n = remaining.min(self.cached_remaining());
            self.cache_pos += n;
            remaining -= n;
        }
        true
    }

    fn percent_read(&self) -> u8 {
        percent(self.consumed.get(), self.total)
    }
}
