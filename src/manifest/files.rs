// File manifest list section

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::OnceLock;

use bitflags::bitflags;

use crate::common::error::Result;
use crate::manifest::guid::Guid;
use crate::manifest::stream::{
    read_array, read_fstring, read_u32, read_u8, write_fstring, write_u32, write_u8,
};

bitflags! {
    /// Per-file attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u8 {
        const READ_ONLY = 0x1;
        const COMPRESSED = 0x2;
        const EXECUTABLE = 0x4;
    }
}

/// A byte range within a chunk assigned to a position within a file.
///
/// `file_offset` is not stored on the wire; it is reconstructed by a
/// running accumulator while reading the part list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPart {
    pub guid: Guid,
    /// Offset inside the decompressed chunk
    pub offset: u32,
    /// Number of bytes to copy
    pub size: u32,
    /// Position within the containing file
    pub file_offset: u32,
}

/// Serialized size of a chunk part record (4 size + 16 guid + 4 offset + 4 size).
const CHUNK_PART_SIZE: u32 = 28;

/// Description of one file in the target tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileManifest {
    pub filename: String,
    pub symlink_target: String,
    /// SHA-1 of the reassembled file contents
    pub hash: [u8; 20],
    pub flags: FileFlags,
    pub install_tags: Vec<String>,
    pub chunk_parts: Vec<ChunkPart>,
    /// Derived: sum of chunk part sizes
    pub file_size: u64,
    pub hash_md5: Option<[u8; 16]>,
    pub mime_type: String,
    pub hash_sha256: Option<[u8; 32]>,
}

impl FileManifest {
    pub fn read_only(&self) -> bool {
        self.flags.contains(FileFlags::READ_ONLY)
    }

    pub fn compressed(&self) -> bool {
        self.flags.contains(FileFlags::COMPRESSED)
    }

    pub fn executable(&self) -> bool {
        self.flags.contains(FileFlags::EXECUTABLE)
    }
}

/// The FML manifest section.
#[derive(Debug, Clone, Default)]
pub struct FileManifestList {
    pub version: u8,
    pub elements: Vec<FileManifest>,
    path_map: OnceLock<HashMap<String, usize>>,
}

impl FileManifestList {
    pub fn new(elements: Vec<FileManifest>) -> Self {
        Self {
            version: 0,
            elements,
            path_map: OnceLock::new(),
        }
    }

    /// Look up a file by its relative path, building the index on first use.
    pub fn file_by_path(&self, path: &str) -> Option<&FileManifest> {
        let map = self.path_map.get_or_init(|| {
            self.elements
                .iter()
                .enumerate()
                .map(|(idx, fm)| (fm.filename.clone(), idx))
                .collect()
        });
        map.get(path).map(|&idx| &self.elements[idx])
    }

    /// Drop the lazily-built lookup index after mutating `elements`.
    pub fn invalidate_maps(&mut self) {
        self.path_map = OnceLock::new();
    }

    pub fn read(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let size = read_u32(r)?;
        let mut fml = FileManifestList {
            version: read_u8(r)?,
            ..Default::default()
        };
        let count = read_u32(r)? as usize;

        fml.elements = Vec::with_capacity(count);
        for _ in 0..count {
            fml.elements.push(FileManifest::default());
        }

        for fm in &mut fml.elements {
            fm.filename = read_fstring(r)?;
        }
        for fm in &mut fml.elements {
            fm.symlink_target = read_fstring(r)?;
        }
        for fm in &mut fml.elements {
            fm.hash = read_array(r)?;
        }
        for fm in &mut fml.elements {
            fm.flags = FileFlags::from_bits_retain(read_u8(r)?);
        }
        for fm in &mut fml.elements {
            let tags = read_u32(r)?;
            for _ in 0..tags {
                fm.install_tags.push(read_fstring(r)?);
            }
        }

        // chunk parts, with the file offset reconstructed as we go
        for fm in &mut fml.elements {
            let parts = read_u32(r)?;
            let mut file_offset = 0u32;
            for _ in 0..parts {
                let part_start = r.stream_position()?;
                let part_size = read_u32(r)?;
                let part = ChunkPart {
                    guid: Guid::read(r)?,
                    offset: read_u32(r)?,
                    size: read_u32(r)?,
                    file_offset,
                };
                file_offset = file_offset.wrapping_add(part.size);
                fm.chunk_parts.push(part);

                let consumed = r.stream_position()? - part_start;
                if (part_size as u64) > consumed {
                    let diff = part_size as u64 - consumed;
                    log::warn!("Did not read {} bytes from chunk part!", diff);
                    r.seek(SeekFrom::Current(diff as i64))?;
                }
            }
        }

        // MD5 hash + MIME type column pair (feature level 19)
        if fml.version >= 1 {
            for fm in &mut fml.elements {
                if read_u32(r)? != 0 {
                    fm.hash_md5 = Some(read_array(r)?);
                }
            }
            for fm in &mut fml.elements {
                fm.mime_type = read_fstring(r)?;
            }
        }

        // SHA-256 column (feature level 20)
        if fml.version >= 2 {
            for fm in &mut fml.elements {
                fm.hash_sha256 = Some(read_array(r)?);
            }
        }

        for fm in &mut fml.elements {
            fm.file_size = fm.chunk_parts.iter().map(|cp| cp.size as u64).sum();
        }

        let read_bytes = r.stream_position()? - start;
        if read_bytes != size as u64 {
            log::warn!(
                "Did not read entire file data list! Version: {}, {} bytes missing, skipping...",
                fml.version,
                size as i64 - read_bytes as i64
            );
            r.seek(SeekFrom::Start(start + size as u64))?;
            fml.version = 0;
        }

        Ok(fml)
    }

    pub fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let start = w.stream_position()?;
        write_u32(w, 0)?; // placeholder size
        write_u8(w, self.version)?;
        write_u32(w, self.elements.len() as u32)?;

        for fm in &self.elements {
            write_fstring(w, &fm.filename)?;
        }
        for fm in &self.elements {
            write_fstring(w, &fm.symlink_target)?;
        }
        for fm in &self.elements {
            w.write_all(&fm.hash)?;
        }
        for fm in &self.elements {
            write_u8(w, fm.flags.bits())?;
        }
        for fm in &self.elements {
            write_u32(w, fm.install_tags.len() as u32)?;
            for tag in &fm.install_tags {
                write_fstring(w, tag)?;
            }
        }

        for fm in &self.elements {
            write_u32(w, fm.chunk_parts.len() as u32)?;
            for cp in &fm.chunk_parts {
                write_u32(w, CHUNK_PART_SIZE)?;
                cp.guid.write(w)?;
                write_u32(w, cp.offset)?;
                write_u32(w, cp.size)?;
            }
        }

        if self.version >= 1 {
            for fm in &self.elements {
                match fm.hash_md5 {
                    Some(md5) => {
                        write_u32(w, 1)?;
                        w.write_all(&md5)?;
                    }
                    None => write_u32(w, 0)?,
                }
            }
            for fm in &self.elements {
                write_fstring(w, &fm.mime_type)?;
            }
        }

        if self.version >= 2 {
            for fm in &self.elements {
                w.write_all(&fm.hash_sha256.unwrap_or([0u8; 32]))?;
            }
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(start))?;
        write_u32(w, (end - start) as u32)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

impl PartialEq for FileManifestList {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.elements == other.elements
    }
}

impl Eq for FileManifestList {}
