// Shared fixtures for integration tests
#![allow(dead_code)]

use chunkdl::manifest::{
    ChunkDataList, ChunkInfo, ChunkPart, FileManifest, FileManifestList, Guid, Manifest,
};

pub fn guid(seed: u32) -> Guid {
    Guid([seed, 0, 0, seed])
}

pub fn chunk(seed: u32, window_size: u32) -> ChunkInfo {
    let mut info = ChunkInfo::new(
        guid(seed),
        seed as u64,
        [seed as u8; 20],
        window_size,
        (window_size / 2) as i64,
    );
    info.set_group_num((seed % 100) as u8);
    info
}

/// Build a file from `(chunk_seed, offset_in_chunk, size)` triples; the
/// per-file offsets are accumulated the way the manifest reader does it.
pub fn file(name: &str, hash_seed: u8, parts: &[(u32, u32, u32)]) -> FileManifest {
    let mut file_offset = 0u32;
    let chunk_parts: Vec<ChunkPart> = parts
        .iter()
        .map(|&(seed, offset, size)| {
            let cp = ChunkPart {
                guid: guid(seed),
                offset,
                size,
                file_offset,
            };
            file_offset += size;
            cp
        })
        .collect();
    FileManifest {
        filename: name.to_string(),
        hash: [hash_seed; 20],
        file_size: chunk_parts.iter().map(|cp| cp.size as u64).sum(),
        chunk_parts,
        ..Default::default()
    }
}

pub fn manifest(chunks: Vec<ChunkInfo>, files: Vec<FileManifest>) -> Manifest {
    Manifest {
        chunk_data_list: ChunkDataList::new(chunks),
        file_manifest_list: FileManifestList::new(files),
        ..Default::default()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
