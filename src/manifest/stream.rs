// Little-endian stream primitives for the manifest container

use std::io::{Read, Write};

use crate::common::error::{Error, Result};

pub fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_u8(w: &mut impl Write, value: u8) -> Result<()> {
    w.write_all(&[value])?;
    Ok(())
}

pub fn write_u32(w: &mut impl Write, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_i32(w: &mut impl Write, value: i32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_u64(w: &mut impl Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_i64(w: &mut impl Write, value: i64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Read a length-prefixed string.
///
/// The i32 prefix selects the encoding: zero is the empty string, a
/// positive length is ASCII with a single NUL terminator, a negative
/// length is UTF-16LE (the magnitude counts code units including the
/// two-byte NUL terminator).
pub fn read_fstring(r: &mut impl Read) -> Result<String> {
    let length = read_i32(r)?;

    if length == 0 {
        return Ok(String::new());
    }

    if length > 0 {
        let mut buf = vec![0u8; length as usize - 1];
        r.read_exact(&mut buf)?;
        let mut terminator = [0u8; 1];
        r.read_exact(&mut terminator)?;
        let s = String::from_utf8(buf)
            .map_err(|e| Error::InvalidManifest(format!("Non-ASCII byte in string: {}", e)))?;
        if !s.is_ascii() {
            return Err(Error::InvalidManifest(
                "Positive-length string contains non-ASCII data".to_string(),
            ));
        }
        return Ok(s);
    }

    // UTF-16LE, two bytes per unit, two-byte NUL terminator
    let byte_len = length.unsigned_abs() as usize * 2;
    let mut buf = vec![0u8; byte_len - 2];
    r.read_exact(&mut buf)?;
    let mut terminator = [0u8; 2];
    r.read_exact(&mut terminator)?;

    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|e| Error::InvalidManifest(format!("Invalid UTF-16 string: {}", e)))
}

/// Write a length-prefixed string, preferring ASCII and falling back to
/// UTF-16LE when any code point is outside ASCII.
pub fn write_fstring(w: &mut impl Write, s: &str) -> Result<()> {
    if s.is_empty() {
        write_i32(w, 0)?;
        return Ok(());
    }

    if s.is_ascii() {
        write_i32(w, s.len() as i32 + 1)?;
        w.write_all(s.as_bytes())?;
        w.write_all(&[0])?;
    } else {
        let units: Vec<u16> = s.encode_utf16().collect();
        write_i32(w, -(units.len() as i32 + 1))?;
        for unit in &units {
            w.write_all(&unit.to_le_bytes())?;
        }
        w.write_all(&[0, 0])?;
    }
    Ok(())
}
