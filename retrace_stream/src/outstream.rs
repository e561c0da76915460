/// Write contract shared by the container encoders.
///
/// Writes are all-or-nothing: a `false` return means the underlying file
/// failed and the stream is dead — further writes keep returning false.
/// Finalization (trailers, seek tables) happens in each encoder's
/// consuming `finish()`; dropping an unfinished stream finalizes
/// best-effort so a crashed capture still leaves a decodable file.
pub trait OutStream {
    /// Append `buf` to the stream. Returns false on I/O failure.
    fn write(&mut self, buf: &[u8]) -> bool;

    /// Push buffered data down to the operating system. For chunked
    /// encoders this ends the current chunk/frame early, trading
    /// compression ratio for durability.
    fn flush(&mut self);
}
