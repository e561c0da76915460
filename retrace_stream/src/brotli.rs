use std::io::Read;
use std::path::Path;

use tracing::warn;

use crate::file::{percent, ByteCounter, CountingReader, File};

/// Bytes pulled from the underlying file per decompressor refill.
const INPUT_BUF_SIZE: usize = 64 * 1024;

/// Reader for brotli-compressed traces.
///
/// Brotli containers carry no magic; [`crate::open_for_read`] selects this
/// backend only when nothing else matches. The decompressor pull-loops,
/// requesting fixed-size file reads as it needs more input. There is no
/// seek support of any kind: [`File::skip`] always fails, and callers that
/// need to fast-forward must re-read sequentially.
pub struct BrotliFile {
    decoder: brotli::Decompressor<CountingReader>,
    consumed: ByteCounter,
    total: u64,
    eof: bool,
}

impl BrotliFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let (reader, total, consumed) = CountingReader::open(path)?;
        Ok(BrotliFile {
            decoder: brotli::Decompressor::new(reader, INPUT_BUF_SIZE),
            consumed,
            total,
            eof: false,
        })
    }
}

impl File for BrotliFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.eof {
            return 0;
        }
        let mut total = 0;
        while total < buf.len() {
            match self.decoder.read(&mut buf[total..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(err) => {
                    warn!("brotli trace read failed: {err}");
                    self.eof = true;
                    break;
                }
            }
        }
        total
    }

    fn skip(&mut self, _len: usize) -> bool {
        false
    }

    fn percent_read(&self) -> u8 {
        percent(self.consumed.get(), self.total)
    }
}
