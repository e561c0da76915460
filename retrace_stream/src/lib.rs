//! Compressed trace container layer.
//!
//! A recorded call stream is stored inside one of several chunked
//! compression containers. This crate provides the read-side [`File`]
//! contract with its backends (snappy, gzip, brotli, zstd, zstd-seekable),
//! the write-side [`OutStream`] encoders (snappy, gzip, zstd-seekable), and
//! [`open_for_read`], which picks the right backend by sniffing magic
//! bytes.
//!
//! Backends differ in seek capability: snappy and zstd-seekable support
//! exact offset capture/restore ([`File::supports_offsets`]); gzip, brotli
//! and plain zstd are strictly sequential.

pub mod brotli;
pub mod file;
pub mod format;
pub mod outstream;
pub mod sniff;
pub mod snappy;
pub mod zlib;
pub mod zstd_plain;
pub mod zstd_seekable;

pub use brotli::BrotliFile;
pub use file::{File, Offset};
pub use outstream::OutStream;
pub use sniff::{container_kind, open_for_read};
pub use snappy::{SnappyFile, SnappyStream};
pub use zlib::{GzFile, GzStream};
pub use zstd_plain::ZstdFile;
pub use zstd_seekable::{ZstdSeekableFile, ZstdSeekableStream};
