// Error types and error handling

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BadMagic(u32),
    HashMismatch { expected: Vec<u8>, actual: Vec<u8> },
    InvalidManifest(String),
    ChunkNotFound(u128),
    FileNotFound(String),
    InsufficientSharedMemory {
        required: u64,
        available: u64,
        suggested_mib: u64,
    },
    DownloadFailed(String),
    WriteFailed(String),
    ConfigError(String),
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::BadMagic(magic) => write!(f, "No header magic (got {:#010x})", magic),
            Error::HashMismatch { expected, actual } => {
                write!(
                    f,
                    "Hash mismatch: expected {}, got {}",
                    hex::encode(expected),
                    hex::encode(actual)
                )
            }
            Error::InvalidManifest(e) => write!(f, "Invalid manifest: {}", e),
            Error::ChunkNotFound(guid) => write!(f, "Chunk {:032x} not found", guid),
            Error::FileNotFound(path) => write!(f, "File not found: {}", path),
            Error::InsufficientSharedMemory {
                required,
                available,
                suggested_mib,
            } => write!(
                f,
                "Shared memory cache is smaller than required: {:.1} MiB < {:.1} MiB, \
                 raise the limit to at least {} MiB",
                *available as f64 / 1024.0 / 1024.0,
                *required as f64 / 1024.0 / 1024.0,
                suggested_mib
            ),
            Error::DownloadFailed(e) => write!(f, "Download failed: {}", e),
            Error::WriteFailed(path) => write!(f, "Writing failed for {}", path),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::Aborted => write!(f, "Installation aborted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
