// Chunk GUID

use std::fmt;
use std::io::{Read, Write};

use crate::common::error::Result;
use crate::manifest::stream::{read_u32, write_u32};

/// 128-bit chunk identifier stored as four little-endian u32 words.
///
/// Not a standard UUID: equality and hashing are over the raw 128-bit
/// value, and [`Guid::num`] is the canonical map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u32; 4]);

impl Guid {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        Ok(Guid([
            read_u32(r)?,
            read_u32(r)?,
            read_u32(r)?,
            read_u32(r)?,
        ]))
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        for word in self.0 {
            write_u32(w, word)?;
        }
        Ok(())
    }

    /// Canonical numeric form: `g3 | g2<<32 | g1<<64 | g0<<96`.
    pub fn num(&self) -> u128 {
        let [g0, g1, g2, g3] = self.0;
        (g3 as u128) | ((g2 as u128) << 32) | ((g1 as u128) << 64) | ((g0 as u128) << 96)
    }

    /// Uppercase packed hex form used in chunk download paths.
    pub fn packed_hex(&self) -> String {
        let [g0, g1, g2, g3] = self.0;
        format!("{:08X}{:08X}{:08X}{:08X}", g0, g1, g2, g3)
    }

    /// Group number fallback for manifests that do not store one:
    /// crc32 over the four words in little-endian order, modulo 100.
    pub fn derive_group(&self) -> u8 {
        let mut hasher = crc32fast::Hasher::new();
        for word in self.0 {
            hasher.update(&word.to_le_bytes());
        }
        (hasher.finalize() % 100) as u8
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [g0, g1, g2, g3] = self.0;
        write!(f, "{:08x}-{:08x}-{:08x}-{:08x}", g0, g1, g2, g3)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
