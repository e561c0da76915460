use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;
use tracing::warn;

use crate::brotli::BrotliFile;
use crate::file::File;
use crate::format::{GZIP_MAGIC, SEEK_TABLE_MAGIC, SNAPPY_MAGIC, ZSTD_FRAME_MAGIC};
use crate::snappy::SnappyFile;
use crate::zlib::GzFile;
use crate::zstd_plain::ZstdFile;
use crate::zstd_seekable::ZstdSeekableFile;

/// Open a trace for reading, picking the backend by magic sniffing.
///
/// The first four bytes identify snappy, gzip and zstd containers; for zstd
/// the last four bytes decide between the seekable reader (seek-table
/// trailer present) and the plain sequential one. Brotli writes no magic
/// at all and is selected by elimination.
///
/// A zstd file whose seek table is present but unusable — typically a
/// capture that crashed while finalizing — degrades to the sequential
/// reader with a warning rather than failing the open.
pub fn open_for_read(path: impl AsRef<Path>) -> anyhow::Result<Box<dyn File>> {
    let path = path.as_ref();
    let (head, tail) = peek(path)
        .with_context(|| format!("sniffing container magic of {}", path.display()))?;

    if head[..2] == SNAPPY_MAGIC {
        return Ok(Box::new(SnappyFile::open(path)?));
    }
    if head[..2] == GZIP_MAGIC {
        return Ok(Box::new(GzFile::open(path)?));
    }
    if head == ZSTD_FRAME_MAGIC.to_le_bytes() {
        if tail == SEEK_TABLE_MAGIC.to_le_bytes() {
            match ZstdSeekableFile::open(path) {
                Ok(file) => return Ok(Box::new(file)),
                Err(err) => {
                    warn!(
                        "{}: seek table unusable ({err:#}); falling back to sequential zstd",
                        path.display()
                    );
                }
            }
        }
        return Ok(Box::new(ZstdFile::open(path)?));
    }
    Ok(Box::new(BrotliFile::open(path)?))
}

/// Human-readable container kind, by the same sniffing rules as
/// [`open_for_read`]. Does not validate the seek table — a seekable
/// container with a damaged trailer still reports `"zstd-seekable"`.
pub fn container_kind(path: impl AsRef<Path>) -> anyhow::Result<&'static str> {
    let (head, tail) = peek(path.as_ref())?;
    Ok(if head[..2] == SNAPPY_MAGIC {
        "snappy"
    } else if head[..2] == GZIP_MAGIC {
        "gzip"
    } else if head == ZSTD_FRAME_MAGIC.to_le_bytes() {
        if tail == SEEK_TABLE_MAGIC.to_le_bytes() {
            "zstd-seekable"
        } else {
            "zstd"
        }
    } else {
        "brotli"
    })
}

/// First and last four bytes of the file (zero-padded for tiny files).
fn peek(path: &Path) -> anyhow::Result<([u8; 4], [u8; 4])> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut head = [0u8; 4];
    let mut read = 0;
    while read < head.len() {
        match file.read(&mut head[read..])? {
            0 => break,
            n => read += n,
        }
    }

    let mut tail = [0u8; 4];
    if size >= 4 {
        file.seek(SeekFrom::End(-4))?;
        file.read_exact(&mut tail)?;
    }
    Ok((head, tail))
}
