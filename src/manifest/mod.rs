// Binary manifest container: header, metadata, chunk data list,
// file manifest list and custom key/value fields

pub mod chunks;
pub mod compare;
pub mod files;
pub mod guid;
pub mod meta;
pub mod stream;

use std::collections::HashSet;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};

use crate::common::error::{Error, Result};
use stream::{read_array, read_fstring, read_u32, read_u8, write_fstring, write_u32, write_u8};

pub use chunks::{chunk_dir, ChunkDataList, ChunkInfo};
pub use compare::ManifestComparison;
pub use files::{ChunkPart, FileFlags, FileManifest, FileManifestList};
pub use guid::Guid;
pub use meta::ManifestMeta;

pub const HEADER_MAGIC: u32 = 0x44BE_C00C;
/// Canonical header size; larger headers are tolerated on read.
pub const HEADER_SIZE: u32 = 41;

const STORED_COMPRESSED: u8 = 0x1;
const DEFAULT_SERIALISATION_VERSION: u32 = 17;
const MAX_SERIALISATION_VERSION: u32 = 21;

/// Ordered string key/value section at the end of the manifest body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomFields {
    pub version: u8,
    entries: Vec<(String, String)>,
}

impl CustomFields {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn read(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let size = read_u32(r)?;
        let mut cf = CustomFields {
            version: read_u8(r)?,
            ..Default::default()
        };
        let count = read_u32(r)? as usize;

        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(read_fstring(r)?);
        }
        for key in keys {
            cf.entries.push((key, read_fstring(r)?));
        }

        let read_bytes = r.stream_position()? - start;
        if read_bytes != size as u64 {
            log::warn!(
                "Did not read entire custom fields part! Version: {}, {} bytes missing, skipping...",
                cf.version,
                size as i64 - read_bytes as i64
            );
            r.seek(SeekFrom::Start(start + size as u64))?;
            cf.version = 0;
        }

        Ok(cf)
    }

    pub fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let start = w.stream_position()?;
        write_u32(w, 0)?; // placeholder size
        write_u8(w, self.version)?;
        write_u32(w, self.entries.len() as u32)?;

        for (key, _) in &self.entries {
            write_fstring(w, key)?;
        }
        for (_, value) in &self.entries {
            write_fstring(w, value)?;
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(start))?;
        write_u32(w, (end - start) as u32)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

/// A parsed manifest: header fields plus the four body sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub header_size: u32,
    pub size_uncompressed: u32,
    pub size_compressed: u32,
    pub sha_hash: [u8; 20],
    pub stored_as: u8,
    pub version: u32,
    pub meta: ManifestMeta,
    pub chunk_data_list: ChunkDataList,
    pub file_manifest_list: FileManifestList,
    pub custom_fields: CustomFields,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            header_size: HEADER_SIZE,
            size_uncompressed: 0,
            size_compressed: 0,
            sha_hash: [0u8; 20],
            stored_as: 0,
            version: 18,
            meta: ManifestMeta::default(),
            chunk_data_list: ChunkDataList::default(),
            file_manifest_list: FileManifestList::default(),
            custom_fields: CustomFields::default(),
        }
    }
}

impl Manifest {
    pub fn compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }

    /// Parse a complete manifest from its serialized form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(data);

        let magic = read_u32(&mut r)?;
        if magic != HEADER_MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let mut manifest = Manifest {
            header_size: read_u32(&mut r)?,
            size_uncompressed: read_u32(&mut r)?,
            size_compressed: read_u32(&mut r)?,
            ..Default::default()
        };
        manifest.sha_hash = read_array(&mut r)?;
        manifest.stored_as = read_u8(&mut r)?;
        manifest.version = read_u32(&mut r)?;

        if r.stream_position()? != manifest.header_size as u64 {
            log::warn!(
                "Did not read entire header, {} != {}! Header version: {}",
                r.stream_position()?,
                manifest.header_size,
                manifest.version
            );
            r.seek(SeekFrom::Start(manifest.header_size as u64))?;
        }

        let mut body = Vec::new();
        r.read_to_end(&mut body)?;

        if manifest.compressed() {
            let mut inflated = Vec::with_capacity(manifest.size_uncompressed as usize);
            ZlibDecoder::new(body.as_slice()).read_to_end(&mut inflated)?;

            let digest: [u8; 20] = Sha1::digest(&inflated).into();
            if digest != manifest.sha_hash {
                return Err(Error::HashMismatch {
                    expected: manifest.sha_hash.to_vec(),
                    actual: digest.to_vec(),
                });
            }
            body = inflated;
        }

        let mut body_r = Cursor::new(body.as_slice());
        manifest.meta = ManifestMeta::read(&mut body_r)?;
        manifest.chunk_data_list = ChunkDataList::read(&mut body_r)?;
        manifest.file_manifest_list = FileManifestList::read(&mut body_r)?;
        manifest.custom_fields = CustomFields::read(&mut body_r)?;

        let remaining = (body.len() as u64).saturating_sub(body_r.stream_position()?);
        if remaining > 0 {
            log::warn!(
                "Did not read {} remaining bytes in manifest! This may not be a problem.",
                remaining
            );
        }

        Ok(manifest)
    }

    /// Serialize this manifest, optionally zlib-compressing the body.
    ///
    /// The serialisation version is driven by which optional features are
    /// present; `meta.feature_level` is updated to match so the emitted
    /// manifest is self-consistent.
    pub fn serialize(&mut self, compress: bool) -> Result<Vec<u8>> {
        let mut target_version = DEFAULT_SERIALISATION_VERSION.max(self.meta.feature_level);
        if self.meta.data_version == 2 {
            target_version = target_version.max(21);
        } else if self.file_manifest_list.version == 2 {
            target_version = target_version.max(20);
        } else if self.file_manifest_list.version == 1 {
            target_version = target_version.max(19);
        } else if self.meta.data_version == 1 {
            target_version = target_version.max(18);
        }

        if target_version > MAX_SERIALISATION_VERSION {
            log::warn!(
                "Trying to serialise an unknown target version: {}, clamping to {}.",
                target_version,
                MAX_SERIALISATION_VERSION
            );
            target_version = MAX_SERIALISATION_VERSION;
        }

        self.meta.feature_level = target_version;
        if self.meta.data_version >= 1 {
            self.meta.ensure_build_id();
        }

        let mut body_w = Cursor::new(Vec::new());
        self.meta.write(&mut body_w)?;
        self.chunk_data_list.write(&mut body_w)?;
        self.file_manifest_list.write(&mut body_w)?;
        self.custom_fields.write(&mut body_w)?;
        let mut body = body_w.into_inner();

        self.header_size = HEADER_SIZE;
        self.version = target_version;
        self.size_uncompressed = body.len() as u32;
        self.size_compressed = body.len() as u32;
        self.sha_hash = Sha1::digest(&body).into();

        if self.compressed() || compress {
            self.stored_as |= STORED_COMPRESSED;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            body = encoder.finish()?;
            self.size_compressed = body.len() as u32;
        }

        let mut out = Vec::with_capacity(HEADER_SIZE as usize + body.len());
        write_u32(&mut out, HEADER_MAGIC)?;
        write_u32(&mut out, self.header_size)?;
        write_u32(&mut out, self.size_uncompressed)?;
        write_u32(&mut out, self.size_compressed)?;
        out.extend_from_slice(&self.sha_hash);
        write_u8(&mut out, self.stored_as)?;
        write_u32(&mut out, self.version)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Apply a delta manifest: its file entries replace or extend ours,
    /// and chunks we do not already know are merged into the chunk list.
    pub fn apply_delta(&mut self, delta: &Manifest) {
        let mut replaced = HashSet::new();

        for fm in &mut self.file_manifest_list.elements {
            if let Some(delta_file) = delta.file_manifest_list.file_by_path(&fm.filename) {
                replaced.insert(delta_file.filename.clone());
                *fm = delta_file.clone();
            }
        }
        for delta_file in &delta.file_manifest_list.elements {
            if !replaced.contains(&delta_file.filename) {
                self.file_manifest_list.elements.push(delta_file.clone());
            }
        }
        self.file_manifest_list.invalidate_maps();

        let known: HashSet<u128> = self
            .chunk_data_list
            .elements
            .iter()
            .map(|chunk| chunk.guid.num())
            .collect();
        for chunk in &delta.chunk_data_list.elements {
            if !known.contains(&chunk.guid.num()) {
                self.chunk_data_list.elements.push(chunk.clone());
            }
        }
        self.chunk_data_list.invalidate_maps();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let chunk_a = {
            let mut c = ChunkInfo::new(Guid([1, 1, 1, 1]), 0xA5A5, [0xAA; 20], 1024, 700);
            c.set_group_num(12);
            c
        };
        let chunk_b = {
            let mut c = ChunkInfo::new(Guid([2, 2, 2, 2]), 0x5A5A, [0xBB; 20], 1024, 650);
            c.set_group_num(34);
            c
        };

        let file = FileManifest {
            filename: "data/content.pak".to_string(),
            hash: [0x11; 20],
            chunk_parts: vec![
                ChunkPart {
                    guid: Guid([1, 1, 1, 1]),
                    offset: 0,
                    size: 1024,
                    file_offset: 0,
                },
                ChunkPart {
                    guid: Guid([2, 2, 2, 2]),
                    offset: 0,
                    size: 512,
                    file_offset: 1024,
                },
            ],
            file_size: 1536,
            ..Default::default()
        };

        let mut manifest = Manifest {
            meta: ManifestMeta {
                app_name: "SampleApp".to_string(),
                build_version: "1.0".to_string(),
                feature_level: 18,
                ..Default::default()
            },
            chunk_data_list: ChunkDataList::new(vec![chunk_a, chunk_b]),
            file_manifest_list: FileManifestList::new(vec![file]),
            ..Default::default()
        };
        manifest.custom_fields.set("BuildLabel", "Live");
        manifest
    }

    #[test]
    fn test_roundtrip_compressed() {
        let mut manifest = sample_manifest();
        let bytes = manifest.serialize(true).unwrap();
        let restored = Manifest::parse(&bytes).unwrap();
        assert_eq!(restored, manifest);
        assert!(restored.compressed());
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let mut manifest = sample_manifest();
        let bytes = manifest.serialize(false).unwrap();
        let restored = Manifest::parse(&bytes).unwrap();
        assert_eq!(restored, manifest);
        assert!(!restored.compressed());
        assert_eq!(restored.size_compressed, restored.size_uncompressed);
    }

    #[test]
    fn test_bad_magic() {
        let mut manifest = sample_manifest();
        let mut bytes = manifest.serialize(false).unwrap();
        bytes[0] ^= 0xFF;
        match Manifest::parse(&bytes) {
            Err(Error::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_corrupted_body_hash_mismatch() {
        let mut manifest = sample_manifest();
        let mut bytes = manifest.serialize(true).unwrap();
        // flip a bit in the stored hash so the inflated body cannot match
        bytes[16] ^= 0x01;
        match Manifest::parse(&bytes) {
            Err(Error::HashMismatch { .. }) => {}
            other => panic!("expected HashMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_oversized_header_tolerated() {
        let mut manifest = sample_manifest();
        let bytes = manifest.serialize(false).unwrap();

        // grow the header by four zero bytes and patch the declared size
        let mut padded = bytes[..HEADER_SIZE as usize].to_vec();
        padded.extend_from_slice(&[0u8; 4]);
        padded.extend_from_slice(&bytes[HEADER_SIZE as usize..]);
        padded[4..8].copy_from_slice(&45u32.to_le_bytes());

        let restored = Manifest::parse(&padded).unwrap();
        assert_eq!(restored.header_size, 45);
        assert_eq!(restored.file_manifest_list, manifest.file_manifest_list);

        // re-serialisation restores the canonical header
        let mut restored = restored;
        let rewritten = restored.serialize(false).unwrap();
        assert_eq!(&rewritten[4..8], &HEADER_SIZE.to_le_bytes());
    }

    #[test]
    fn test_version_bumps() {
        let mut manifest = sample_manifest();
        manifest.file_manifest_list.version = 1;
        manifest.serialize(false).unwrap();
        assert_eq!(manifest.version, 19);
        assert_eq!(manifest.meta.feature_level, 19);

        let mut manifest = sample_manifest();
        manifest.file_manifest_list.version = 2;
        for fm in &mut manifest.file_manifest_list.elements {
            fm.hash_sha256 = Some([3u8; 32]);
        }
        manifest.serialize(false).unwrap();
        assert_eq!(manifest.version, 20);

        let mut manifest = sample_manifest();
        manifest.meta.data_version = 2;
        manifest.serialize(false).unwrap();
        assert_eq!(manifest.version, 21);

        // unknown future level clamps to the highest we can write
        let mut manifest = sample_manifest();
        manifest.meta.feature_level = 99;
        manifest.serialize(false).unwrap();
        assert_eq!(manifest.version, 21);
    }

    #[test]
    fn test_custom_fields_ordering() {
        let mut cf = CustomFields::default();
        cf.set("zeta", "1");
        cf.set("alpha", "2");
        cf.set("zeta", "3");
        let keys: Vec<&str> = cf.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
        assert_eq!(cf.get("zeta"), Some("3"));
        assert_eq!(cf.get("missing"), None);
    }

    #[test]
    fn test_apply_delta() {
        let mut base = sample_manifest();
        let mut delta = sample_manifest();

        // delta patches the existing file and brings one new file + chunk
        delta.file_manifest_list.elements[0].hash = [0x99; 20];
        let new_chunk = ChunkInfo::new(Guid([7, 7, 7, 7]), 0x77, [0x77; 20], 1024, 300);
        delta.chunk_data_list.elements.push(new_chunk);
        delta.file_manifest_list.elements.push(FileManifest {
            filename: "data/new.pak".to_string(),
            hash: [0x77; 20],
            chunk_parts: vec![ChunkPart {
                guid: Guid([7, 7, 7, 7]),
                offset: 0,
                size: 128,
                file_offset: 0,
            }],
            file_size: 128,
            ..Default::default()
        });
        delta.file_manifest_list.invalidate_maps();

        base.apply_delta(&delta);
        assert_eq!(base.file_manifest_list.elements.len(), 2);
        assert_eq!(base.file_manifest_list.elements[0].hash, [0x99; 20]);
        assert_eq!(base.chunk_data_list.elements.len(), 3);
        assert!(base
            .chunk_data_list
            .chunk_by_guid(Guid([7, 7, 7, 7]).num())
            .is_some());
    }
}
