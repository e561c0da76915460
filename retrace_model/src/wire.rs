//! Byte grammar of the call stream.
//!
//! The stream opens with a textual properties block (`key=value` lines,
//! terminated by one empty line), then runs event records to end of
//! container. Ids, counts and lengths are LEB128 varints; integer payloads
//! are width-prefixed little-endian; floats are raw IEEE-754 bits, so
//! scalar round trips are bit-exact.

use anyhow::{bail, Context};
use retrace_stream::File;

/// Event tags.
pub mod event {
    /// Opens a call: thread id, function reference, argument values.
    pub const ENTER: u8 = 0x00;
    /// Completes the most recently opened call: optional return value,
    /// optional backtrace.
    pub const LEAVE: u8 = 0x01;
    pub const SIG_FUNCTION: u8 = 0x02;
    pub const SIG_STRUCT: u8 = 0x03;
    pub const SIG_ENUM: u8 = 0x04;
    /// Legacy single `name = value` enum definition.
    pub const SIG_OLD_ENUM: u8 = 0x05;
    pub const SIG_BITMASK: u8 = 0x06;
    pub const SIG_FRAME: u8 = 0x07;
}

/// Value tags of the recursive value grammar.
pub mod ty {
    pub const NULL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const SINT: u8 = 3;
    pub const UINT: u8 = 4;
    pub const FLOAT: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const STRING: u8 = 7;
    pub const WSTRING: u8 = 8;
    pub const ENUM: u8 = 9;
    pub const BITMASK: u8 = 10;
    pub const ARRAY: u8 = 11;
    pub const BLOB: u8 = 12;
    pub const STRUCT: u8 = 13;
    pub const POINTER: u8 = 14;
    pub const REPR: u8 = 15;
}

/// Presence bits of a stack-frame definition.
pub mod frame_field {
    pub const MODULE: u8 = 1 << 0;
    pub const FUNCTION: u8 = 1 << 1;
    pub const FILENAME: u8 = 1 << 2;
    pub const LINE: u8 = 1 << 3;
    pub const OFFSET: u8 = 1 << 4;
}

/// Hardening bound on decoded string/blob lengths and array/member counts.
/// Anything larger is a corrupt length field, not data.
pub const MAX_LENGTH: u64 = 1 << 30;

// ── Read side ──────────────────────────────────────────────────────────────

pub fn read_byte(file: &mut dyn File) -> anyhow::Result<u8> {
    file.getc().context("unexpected end of call stream")
}

/// LEB128 unsigned varint.
pub fn read_varint(file: &mut dyn File) -> anyhow::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = read_byte(file)?;
        if shift == 63 && byte & 0x7e != 0 {
            bail!("varint overflows 64 bits");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("varint overflows 64 bits")
}

/// Length-checked varint for counts and byte lengths.
pub fn read_length(file: &mut dyn File) -> anyhow::Result<u64> {
    let len = read_varint(file)?;
    if len > MAX_LENGTH {
        bail!("implausible length {len} in call stream");
    }
    Ok(len)
}

pub fn read_exact(file: &mut dyn File, buf: &mut [u8]) -> anyhow::Result<()> {
    if file.read(buf) != buf.len() {
        bail!("unexpected end of call stream");
    }
    Ok(())
}

/// Length-prefixed UTF-8 string. Capture shims occasionally record raw
/// process memory here, so invalid sequences are replaced, not rejected.
pub fn read_string(file: &mut dyn File) -> anyhow::Result<String> {
    let len = read_length(file)? as usize;
    let mut bytes = vec![0u8; len];
    read_exact(file, &mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Width-prefixed unsigned integer: one width byte (0, 1, 2, 4 or 8),
/// then that many little-endian bytes. Width 0 is the value 0.
pub fn read_uint_packed(file: &mut dyn File) -> anyhow::Result<u64> {
    let width = read_byte(file)?;
    if width == 0 {
        return Ok(0);
    }
    if !matches!(width, 1 | 2 | 4 | 8) {
        bail!("bad integer width {width} in call stream");
    }
    let mut bytes = [0u8; 8];
    read_exact(file, &mut bytes[..width as usize])?;
    Ok(u64::from_le_bytes(bytes))
}

/// Width-prefixed signed integer, sign-extended from the stored width.
pub fn read_sint_packed(file: &mut dyn File) -> anyhow::Result<i64> {
    let width = read_byte(file)?;
    if width == 0 {
        return Ok(0);
    }
    if !matches!(width, 1 | 2 | 4 | 8) {
        bail!("bad integer width {width} in call stream");
    }
    let mut bytes = [0u8; 8];
    read_exact(file, &mut bytes[..width as usize])?;
    let raw = u64::from_le_bytes(bytes);
    let shift = 64 - 8 * u32::from(width);
    Ok(((raw << shift) as i64) >> shift)
}

/// Advance past `len` payload bytes.
///
/// Prefers the backend's `skip`; backends without skip support (brotli)
/// fall back to reading into a scratch buffer, so scan-mode parsing works
/// on every container kind and advances the stream exactly like a full
/// parse.
pub fn skip_bytes(file: &mut dyn File, len: u64) -> anyhow::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if file.skip(len as usize) {
        return Ok(());
    }
    let mut scratch = [0u8; 4096];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        match file.read(&mut scratch[..want]) {
            0 => bail!("unexpected end of call stream"),
            n => remaining -= n as u64,
        }
    }
    Ok(())
}

// ── Write side ─────────────────────────────────────────────────────────────

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

pub fn put_uint_packed(buf: &mut Vec<u8>, value: u64) {
    let width: u8 = match value {
        0 => 0,
        _ if value <= 0xFF => 1,
        _ if value <= 0xFFFF => 2,
        _ if value <= 0xFFFF_FFFF => 4,
        _ => 8,
    };
    buf.push(width);
    buf.extend_from_slice(&value.to_le_bytes()[..width as usize]);
}

pub fn put_sint_packed(buf: &mut Vec<u8>, value: i64) {
    let width: u8 = if value == 0 {
        0
    } else if (-0x80..0x80).contains(&value) {
        1
    } else if (-0x8000..0x8000).contains(&value) {
        2
    } else if (-0x8000_0000..0x8000_0000).contains(&value) {
        4
    } else {
        8
    };
    buf.push(width);
    buf.extend_from_slice(&value.to_le_bytes()[..width as usize]);
}
