/// Magic bytes opening a snappy trace container.
pub const SNAPPY_MAGIC: [u8; 2] = *b"at";

/// Nominal uncompressed bytes per snappy chunk.
pub const SNAPPY_CHUNK_SIZE: usize = 1 << 20;

/// Standard gzip magic.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Standard zstd frame magic (little-endian on disk).
pub const ZSTD_FRAME_MAGIC: u32 = 0xFD2F_B528;

/// Magic of the skippable frame wrapping the seek table.
pub const ZSTD_SKIPPABLE_MAGIC: u32 = 0x184D_2A5E;

/// Seek-table integrity magic — the last 4 bytes of a seekable container.
pub const SEEK_TABLE_MAGIC: u32 = 0x8F92_EAB1;

/// Size of the seek-table footer: frame count (u32) + descriptor (u8) +
/// [`SEEK_TABLE_MAGIC`] (u32).
pub const SEEK_TABLE_FOOTER_SIZE: u64 = 9;

/// Descriptor bit: every seek-table entry carries a 32-bit checksum
/// (low 4 bytes of xxhash64 over the frame's uncompressed data).
pub const SEEK_TABLE_HAS_CHECKSUM: u8 = 1 << 7;

/// Default uncompressed bytes per seekable zstd frame.
pub const ZSTD_DEFAULT_FRAME_SIZE: usize = 2 << 20;

/// Default zstd compression level for live capture.
pub const ZSTD_DEFAULT_LEVEL: i32 = 3;

/// Decode cache size for the plain (non-seekable) zstd reader. Large enough
/// to amortize the many small reads the call-stream parser issues.
pub const ZSTD_CACHE_SIZE: usize = 2 << 20;
