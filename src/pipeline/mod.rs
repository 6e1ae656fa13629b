// Concurrent download/write pipeline

pub mod coordinator;
pub mod messages;
pub mod pool;
pub mod progress;

pub use coordinator::{CancelHandle, Coordinator};
pub use messages::{
    ChunkWrite, DownloadResult, DownloadTask, DownloaderMsg, WorkerQueues, WriterMsg, WriterResult,
};
pub use pool::{ChunkPool, SharedMemorySegment};
pub use progress::{Counters, UiUpdate};
