//! CQL binary protocol in-wire types.

use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::str;

use crate::errors::FrameError;

fn ensure(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::UnexpectedEndOfBuffer {
            expected: needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, FrameError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, FrameError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, FrameError> {
    let len = read_short(buf)? as usize;
    ensure(buf, len)?;
    let raw = &buf[0..len];
    let v = str::from_utf8(raw)?;
    buf.advance(len);
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), FrameError> {
    let raw = v.as_bytes();
    if raw.len() > u16::MAX as usize {
        return Err(FrameError::ValueTooLong(raw.len()));
    }
    write_short(raw.len() as u16, buf);
    buf.put_slice(raw);
    Ok(())
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), FrameError> {
    let raw = v.as_bytes();
    if raw.len() > i32::MAX as usize {
        return Err(FrameError::ValueTooLong(raw.len()));
    }
    write_int(raw.len() as i32, buf);
    buf.put_slice(raw);
    Ok(())
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], FrameError> {
    let len = read_short(buf)? as usize;
    ensure(buf, len)?;
    let v = &buf[0..len];
    buf.advance(len);
    Ok(v)
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), FrameError> {
    if v.len() > u16::MAX as usize {
        return Err(FrameError::ValueTooLong(v.len()));
    }
    write_short(v.len() as u16, buf);
    buf.put_slice(v);
    Ok(())
}

/// Writes a `[bytes]` value; `None` encodes the CQL null (-1 length).
pub fn write_bytes_opt(v: Option<&[u8]>, buf: &mut impl BufMut) -> Result<(), FrameError> {
    match v {
        Some(v) => {
            if v.len() > i32::MAX as usize {
                return Err(FrameError::ValueTooLong(v.len()));
            }
            write_int(v.len() as i32, buf);
            buf.put_slice(v);
        }
        None => write_int(-1, buf),
    }
    Ok(())
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, FrameError> {
    let count = read_short(buf)?;
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let k = read_string(buf)?.to_owned();
        let v = read_string(buf)?.to_owned();
        map.insert(k, v);
    }
    Ok(map)
}

pub fn write_string_map(
    map: &HashMap<String, String>,
    buf: &mut impl BufMut,
) -> Result<(), FrameError> {
    if map.len() > u16::MAX as usize {
        return Err(FrameError::ValueTooLong(map.len()));
    }
    write_short(map.len() as u16, buf);
    for (k, v) in map {
        write_string(k, buf)?;
        write_string(v, buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_int() {
        for val in [i32::MIN, -1, 0, 1, i32::MAX] {
            let mut buf = Vec::new();
            write_int(val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn type_string() {
        let mut buf = Vec::new();
        write_string("local quorum", &mut buf).unwrap();
        assert_eq!(read_string(&mut &buf[..]).unwrap(), "local quorum");
    }

    #[test]
    fn type_string_map() {
        let mut map = HashMap::new();
        map.insert("CQL_VERSION".to_owned(), "3.0.0".to_owned());
        map.insert("COMPRESSION".to_owned(), "".to_owned());
        let mut buf = Vec::new();
        write_string_map(&map, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), map);
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut buf = Vec::new();
        write_string("abcdef", &mut buf).unwrap();
        buf.truncate(4);
        assert!(read_string(&mut &buf[..]).is_err());
    }
}
