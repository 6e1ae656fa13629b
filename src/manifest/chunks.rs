// Chunk data list section

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::OnceLock;

use crate::common::error::Result;
use crate::manifest::guid::Guid;
use crate::manifest::stream::{
    read_array, read_i64, read_u32, read_u64, read_u8, write_i64, write_u32, write_u64, write_u8,
};

/// Directory component of the chunk download path for a manifest version.
pub fn chunk_dir(version: u32) -> &'static str {
    if version >= 15 {
        "ChunksV4"
    } else if version >= 6 {
        "ChunksV3"
    } else if version >= 3 {
        "ChunksV2"
    } else {
        "Chunks"
    }
}

/// Metadata for a single downloadable chunk.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub guid: Guid,
    /// 64-bit rolling hash, part of the download path
    pub hash: u64,
    /// SHA-1 of the decompressed chunk contents
    pub sha_hash: [u8; 20],
    /// Uncompressed size in bytes
    pub window_size: u32,
    /// Compressed size as downloaded
    pub file_size: i64,
    group_num: Option<u8>,
}

impl ChunkInfo {
    pub fn new(guid: Guid, hash: u64, sha_hash: [u8; 20], window_size: u32, file_size: i64) -> Self {
        Self {
            guid,
            hash,
            sha_hash,
            window_size,
            file_size,
            group_num: None,
        }
    }

    /// Stored group number when present, otherwise derived from the GUID.
    pub fn group_num(&self) -> u8 {
        self.group_num.unwrap_or_else(|| self.guid.derive_group())
    }

    pub fn set_group_num(&mut self, group: u8) {
        self.group_num = Some(group);
    }

    /// Relative download path for this chunk under a given manifest version.
    pub fn path(&self, manifest_version: u32) -> String {
        format!(
            "{}/{:02}/{:016X}_{}.chunk",
            chunk_dir(manifest_version),
            self.group_num(),
            self.hash,
            self.guid.packed_hex()
        )
    }
}

impl PartialEq for ChunkInfo {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
            && self.hash == other.hash
            && self.sha_hash == other.sha_hash
            && self.window_size == other.window_size
            && self.file_size == other.file_size
            && self.group_num() == other.group_num()
    }
}

impl Eq for ChunkInfo {}

/// The CDL manifest section: all chunks referenced by the file list.
#[derive(Debug, Clone, Default)]
pub struct ChunkDataList {
    pub version: u8,
    pub elements: Vec<ChunkInfo>,
    guid_map: OnceLock<HashMap<u128, usize>>,
}

impl ChunkDataList {
    pub fn new(elements: Vec<ChunkInfo>) -> Self {
        Self {
            version: 0,
            elements,
            guid_map: OnceLock::new(),
        }
    }

    /// Look up a chunk by its numeric GUID, building the index on first use.
    pub fn chunk_by_guid(&self, guid_num: u128) -> Option<&ChunkInfo> {
        let map = self.guid_map.get_or_init(|| {
            self.elements
                .iter()
                .enumerate()
                .map(|(idx, chunk)| (chunk.guid.num(), idx))
                .collect()
        });
        map.get(&guid_num).map(|&idx| &self.elements[idx])
    }

    pub fn contains_guid(&self, guid_num: u128) -> bool {
        self.chunk_by_guid(guid_num).is_some()
    }

    /// Drop the lazily-built lookup index after mutating `elements`.
    pub fn invalidate_maps(&mut self) {
        self.guid_map = OnceLock::new();
    }

    /// Largest uncompressed chunk size in the list.
    pub fn biggest_chunk(&self) -> u32 {
        self.elements
            .iter()
            .map(|chunk| chunk.window_size)
            .max()
            .unwrap_or(0)
    }

    pub fn read(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let size = read_u32(r)?;
        let mut cdl = ChunkDataList {
            version: read_u8(r)?,
            ..Default::default()
        };
        let count = read_u32(r)? as usize;

        // columns: guids, rolling hashes, sha1s, groups, window sizes, file sizes
        cdl.elements = Vec::with_capacity(count);
        for _ in 0..count {
            cdl.elements
                .push(ChunkInfo::new(Guid::read(r)?, 0, [0u8; 20], 0, 0));
        }
        for chunk in &mut cdl.elements {
            chunk.hash = read_u64(r)?;
        }
        for chunk in &mut cdl.elements {
            chunk.sha_hash = read_array(r)?;
        }
        for chunk in &mut cdl.elements {
            chunk.group_num = Some(read_u8(r)?);
        }
        for chunk in &mut cdl.elements {
            chunk.window_size = read_u32(r)?;
        }
        for chunk in &mut cdl.elements {
            chunk.file_size = read_i64(r)?;
        }

        let read_bytes = r.stream_position()? - start;
        if read_bytes != size as u64 {
            log::warn!(
                "Did not read entire chunk data list! Version: {}, {} bytes missing, skipping...",
                cdl.version,
                size as i64 - read_bytes as i64
            );
            r.seek(SeekFrom::Start(start + size as u64))?;
            // prevent re-serialising fields we did not understand
            cdl.version = 0;
        }

        Ok(cdl)
    }

    pub fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let start = w.stream_position()?;
        write_u32(w, 0)?; // placeholder size
        write_u8(w, self.version)?;
        write_u32(w, self.elements.len() as u32)?;

        for chunk in &self.elements {
            chunk.guid.write(w)?;
        }
        for chunk in &self.elements {
            write_u64(w, chunk.hash)?;
        }
        for chunk in &self.elements {
            w.write_all(&chunk.sha_hash)?;
        }
        for chunk in &self.elements {
            write_u8(w, chunk.group_num())?;
        }
        for chunk in &self.elements {
            write_u32(w, chunk.window_size)?;
        }
        for chunk in &self.elements {
            write_i64(w, chunk.file_size)?;
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(start))?;
        write_u32(w, (end - start) as u32)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

impl PartialEq for ChunkDataList {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.elements == other.elements
    }
}

impl Eq for ChunkDataList {}
