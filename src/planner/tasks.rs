// Install task stream types

use bitflags::bitflags;

bitflags! {
    /// Operations carried by file tasks and writer messages. Multiple
    /// flags can combine on one task, e.g. `RENAME_FILE | DELETE_FILE`
    /// atomically replaces the old file with the finished temp file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u16 {
        const NONE = 0;
        const OPEN_FILE = 1 << 0;
        const CLOSE_FILE = 1 << 1;
        const DELETE_FILE = 1 << 2;
        const RENAME_FILE = 1 << 3;
        const CREATE_EMPTY_FILE = 1 << 4;
        const MAKE_EXECUTABLE = 1 << 5;
        const RELEASE_MEMORY = 1 << 6;
        const SILENT = 1 << 7;
    }
}

/// A file-level operation in the task stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    pub filename: String,
    pub old_file: Option<String>,
    pub flags: TaskFlags,
}

impl FileTask {
    pub fn new(filename: impl Into<String>, flags: TaskFlags) -> Self {
        Self {
            filename: filename.into(),
            old_file: None,
            flags,
        }
    }

    pub fn rename(filename: impl Into<String>, old_file: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            old_file: Some(old_file.into()),
            flags: TaskFlags::RENAME_FILE | TaskFlags::DELETE_FILE,
        }
    }
}

/// Where the bytes for a chunk part come from at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// Fetched over the network into a shared-memory slot
    Download,
    /// Copied out of a file from the previous installation
    OldFile { path: String, offset: u64 },
    /// Copied out of a file already written earlier in this run
    NewFile { path: String, offset: u64 },
}

/// One chunk part write within the currently open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub guid: u128,
    /// Offset within the source chunk (or source file for reuse)
    pub chunk_offset: u64,
    pub chunk_size: u32,
    pub source: ChunkSource,
    /// Set when this task is the final consumer of the chunk and its
    /// shared-memory slot must be released after the write
    pub cleanup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    File(FileTask),
    Chunk(ChunkTask),
}

impl Task {
    pub fn as_chunk(&self) -> Option<&ChunkTask> {
        match self {
            Task::Chunk(ct) => Some(ct),
            Task::File(_) => None,
        }
    }
}
