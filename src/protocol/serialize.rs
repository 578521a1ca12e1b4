//! Primitive payload encoding shared by all message payloads
//!
//! Sizes use the compact form: values below 254 take one byte, larger values
//! are written as `254` followed by a big-endian `u32`.

use bytes::{Buf, BufMut};

use super::CodecError;

const SIZE_EXTENDED: u8 = 254;

/// Fail with `Underflow` unless `needed` bytes remain
pub fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Underflow {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i16<B: Buf>(buf: &mut B) -> Result<i16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn write_size<B: BufMut>(buf: &mut B, size: usize) {
    if size < SIZE_EXTENDED as usize {
        buf.put_u8(size as u8);
    } else {
        buf.put_u8(SIZE_EXTENDED);
        buf.put_u32(size as u32);
    }
}

pub fn read_size<B: Buf>(buf: &mut B) -> Result<usize, CodecError> {
    match get_u8(buf)? {
        SIZE_EXTENDED => Ok(get_u32(buf)? as usize),
        255 => Err(CodecError::Invalid("null size".to_string())),
        small => Ok(small as usize),
    }
}

pub fn write_string<B: BufMut>(buf: &mut B, value: &str) {
    write_size(buf, value.len());
    buf.put_slice(value.as_bytes());
}

pub fn read_string<B: Buf>(buf: &mut B) -> Result<String, CodecError> {
    let len = read_size(buf)?;
    ensure(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(String::from_utf8(bytes)?)
}
