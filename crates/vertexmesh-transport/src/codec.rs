//! Framing primitives shared by the control and data planes.
//!
//! Integers travel as zig-zag varints: the signed value is folded so that
//! small magnitudes of either sign stay short, then emitted 7 bits at a time,
//! least significant group first, with the high bit marking continuation. An
//! `i32` always fits in 1 to 5 bytes.
//!
//! Byte arrays are a varint length followed by the raw bytes. Strings are
//! UTF-8 byte arrays. Nothing carries an implicit length, so every reader
//! must consume fields in exactly the order the writer produced them.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Largest length prefix accepted for a byte array (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum encoded width of an `i32`.
pub const MAX_VARINT_LEN: usize = 5;

#[inline]
fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Appends the varint encoding of `value` to `buf`.
pub fn encode_i32(value: i32, buf: &mut impl BufMut) {
    let mut v = zigzag(value);
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Number of bytes [`encode_i32`] will produce for `value`.
pub fn encoded_len_i32(value: i32) -> usize {
    let v = zigzag(value);
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Folds one more encoded byte into a partially decoded varint.
///
/// Returns `Ok(Some(value))` once the terminating byte has been seen.
fn accumulate(acc: &mut u32, index: usize, byte: u8) -> Result<Option<i32>> {
    if index == MAX_VARINT_LEN - 1 && byte & 0xF0 != 0 {
        return Err(TransportError::invalid_frame("varint overflows 32 bits"));
    }
    *acc |= u32::from(byte & 0x7F) << (7 * index);
    if byte & 0x80 == 0 {
        Ok(Some(unzigzag(*acc)))
    } else {
        Ok(None)
    }
}

/// Decodes a varint from the front of `buf`, advancing it.
pub fn decode_i32(buf: &mut impl Buf) -> Result<i32> {
    let mut acc = 0u32;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(TransportError::invalid_frame("truncated varint"));
        }
        if let Some(value) = accumulate(&mut acc, index, buf.get_u8())? {
            return Ok(value);
        }
    }
    Err(TransportError::invalid_frame("varint longer than 5 bytes"))
}

fn check_len(len: i32) -> Result<usize> {
    if len < 0 {
        return Err(TransportError::invalid_frame(format!(
            "negative length prefix {}",
            len
        )));
    }
    if len as u32 > MAX_PAYLOAD_SIZE {
        return Err(TransportError::PayloadTooLarge {
            size: len as u32,
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len as usize)
}

/// Length prefix for `len` bytes, refusing anything a reader would reject.
fn length_prefix(len: usize) -> Result<i32> {
    match u32::try_from(len) {
        Ok(size) if size <= MAX_PAYLOAD_SIZE => Ok(size as i32),
        _ => Err(TransportError::PayloadTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max_size: MAX_PAYLOAD_SIZE,
        }),
    }
}

/// Appends a length-prefixed byte array to `buf`.
///
/// Arrays above [`MAX_PAYLOAD_SIZE`] are refused and nothing is appended.
pub fn encode_bytes(data: &[u8], buf: &mut impl BufMut) -> Result<()> {
    encode_i32(length_prefix(data.len())?, buf);
    buf.put_slice(data);
    Ok(())
}

/// Decodes a length-prefixed byte array from the front of `buf`.
pub fn decode_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = check_len(decode_i32(buf)?)?;
    if buf.remaining() < len {
        return Err(TransportError::invalid_frame(format!(
            "byte array declares {} bytes, {} available",
            len,
            buf.remaining()
        )));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Appends a length-prefixed UTF-8 string to `buf`.
pub fn encode_string(value: &str, buf: &mut impl BufMut) -> Result<()> {
    encode_bytes(value.as_bytes(), buf)
}

/// Decodes a length-prefixed UTF-8 string from the front of `buf`.
pub fn decode_string(buf: &mut impl Buf) -> Result<String> {
    let raw = decode_bytes(buf)?;
    String::from_utf8(raw).map_err(|e| TransportError::invalid_frame(e.to_string()))
}

/// Reads one varint `i32` from `reader`.
pub async fn read_i32<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut acc = 0u32;
    for index in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        if let Some(value) = accumulate(&mut acc, index, byte)? {
            return Ok(value);
        }
    }
    Err(TransportError::invalid_frame("varint longer than 5 bytes"))
}

/// Writes one varint `i32` to `writer` and flushes it.
pub async fn write_i32<W>(writer: &mut W, value: i32) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN);
    encode_i32(value, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-prefixed byte array from `reader`.
pub async fn read_bytes<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = check_len(read_i32(reader).await?)?;
    let mut out = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut out).await?;
    }
    Ok(out)
}

/// Writes a length-prefixed byte array to `writer` and flushes it.
pub async fn write_bytes<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let prefix = length_prefix(data.len())?;
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + data.len());
    encode_i32(prefix, &mut buf);
    buf.put_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string from `reader`.
pub async fn read_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let raw = read_bytes(reader).await?;
    String::from_utf8(raw).map_err(|e| TransportError::invalid_frame(e.to_string()))
}

/// Writes a length-prefixed UTF-8 string to `writer` and flushes it.
pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_bytes(writer, value.as_bytes()).await
}

/// Reads one varint `i32` from a blocking reader, for sync endpoints.
pub fn read_i32_blocking<R>(reader: &mut R) -> Result<i32>
where
    R: std::io::Read + ?Sized,
{
    let mut acc = 0u32;
    let mut byte = [0u8; 1];
    for index in 0..MAX_VARINT_LEN {
        reader.read_exact(&mut byte)?;
        if let Some(value) = accumulate(&mut acc, index, byte[0])? {
            return Ok(value);
        }
    }
    Err(TransportError::invalid_frame("varint longer than 5 bytes"))
}

/// Reads a length-prefixed byte array from a blocking reader.
pub fn read_bytes_blocking<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: std::io::Read + ?Sized,
{
    let len = check_len(read_i32_blocking(reader)?)?;
    let mut out = vec![0u8; len];
    reader.read_exact(&mut out)?;
    Ok(out)
}

/// Writes one varint `i32` to a blocking writer.
pub fn write_i32_blocking<W>(writer: &mut W, value: i32) -> Result<()>
where
    W: std::io::Write + ?Sized,
{
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN);
    encode_i32(value, &mut buf);
    writer.write_all(&buf)?;
    Ok(())
}

/// Writes a length-prefixed byte array to a blocking writer.
pub fn write_bytes_blocking<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: std::io::Write + ?Sized,
{
    let prefix = length_prefix(data.len())?;
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + data.len());
    encode_i32(prefix, &mut buf);
    buf.put_slice(data);
    writer.write_all(&buf)?;
    Ok(())
}
