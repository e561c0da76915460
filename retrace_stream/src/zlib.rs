use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::Context;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::file::{percent, ByteCounter, CountingReader, File};
use crate::outstream::OutStream;

const SKIP_BUF_SIZE: usize = 64 * 1024;

// ── Reader ─────────────────────────────────────────────────────────────────

/// Reader for gzip-compressed traces. Strictly sequential — no offset
/// support; forward skips are serviced by reading through the stream.
pub struct GzFile {
    decoder: MultiGzDecoder<CountingReader>,
    consumed: ByteCounter,
    total: u64,
    eof: bool,
}

impl GzFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let (reader, total, consumed) = CountingReader::open(path)?;
        let decoder = MultiGzDecoder::new(reader);
        Ok(GzFile {
            decoder,
            consumed,
            total,
            eof: false,
        })
    }
}

impl File for GzFile {
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
                    warn!("gzip trace read failed: {err}");
                    self.eof = true;
                    break;
                }
            }
        }
        total
    }

    fn skip(&mut self, len: usize) -> bool {
        let mut scratch = [0u8; SKIP_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let n = self.read(&mut scratch[..want]);
            if n == 0 {
                return false;
            }
            remaining -= n;
        }
        true
    }

    fn percent_read(&self) -> u8 {
        percent(self.consumed.get(), self.total)
    }
}

// ── Writer ─────────────────────────────────────────────────────────────────

/// Gzip encoder at best compression. Intended for offline re-compression of
/// an existing trace, not live capture — gzip decodes too slowly for the
/// interactive tools to sit behind it comfortably.
pub struct GzStream {
    encoder: GzEncoder<fs::File>,
    ok: bool,
    finished: bool,
}

impl GzStream {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        Ok(GzStream {
            encoder: GzEncoder::new(file, Compression::best()),
            ok: true,
            finished: false,
        })
    }

    /// Write the gzip trailer and sync the file.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.finished = true;
        self.encoder
            .try_finish()
            .context("finalizing gzip trace container")?;
        self.encoder.get_mut().flush()?;
        Ok(())
    }
}

impl OutStream for GzStream {
    fn write(&mut self, buf: &[u8]) -> bool {
        if !self.ok {
            return false;
        }
        if let Err(err) = self.encoder.write_all(buf) {
            warn!("gzip stream write failed: {err}");
            self.ok = false;
        }
        self.ok
    }

    fn flush(&mut self) {
        if !self.ok {
            return;
        }
        if let Err(err) = self.encoder.flush() {
            warn!("gzip stream flush failed: {err}");
            self.ok = false;
        }
    }
}

impl Drop for GzStream {
    fn drop(&mut self) {
        if self.ok && !self.finished {
            if let Err(err) = self.encoder.try_finish() {
                warn!("gzip stream finalization failed: {err}");
            }
        }
    }
}
