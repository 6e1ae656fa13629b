// External worker contract
//
// Download workers and the file writer are separate processes (or
// threads) owned by the caller. They communicate with the coordinator
// exclusively through these message types; chunk bytes travel through
// the shared arena, addressed by slot descriptor.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::pipeline::pool::SharedMemorySegment;
use crate::planner::TaskFlags;

/// Instruction for a download worker: fetch `url`, decompress and verify
/// the chunk, and place the decompressed bytes at `slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub guid: u128,
    pub slot: SharedMemorySegment,
}

/// Messages flowing to download workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloaderMsg {
    Task(DownloadTask),
    Terminate,
}

/// Outcome of a download attempt. Failures carry the original task so
/// the coordinator can resubmit it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub task: DownloadTask,
    pub success: bool,
    pub size_downloaded: u64,
    pub size_decompressed: u64,
}

impl DownloadResult {
    pub fn failure(task: DownloadTask) -> Self {
        Self {
            task,
            success: false,
            size_downloaded: 0,
            size_decompressed: 0,
        }
    }
}

/// One chunk-part write into the currently open file. With `slot` set the
/// writer copies `chunk_size` bytes starting `chunk_offset` into the slot;
/// with `old_file` set it instead reads from that path at `chunk_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    pub filename: String,
    pub slot: Option<SharedMemorySegment>,
    pub chunk_offset: u64,
    pub chunk_size: u32,
    pub guid: u128,
    pub old_file: Option<String>,
    pub flags: TaskFlags,
}

/// Messages flowing to the file writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterMsg {
    /// File-level operation (open/close/delete/rename/...)
    File {
        filename: String,
        old_file: Option<String>,
        flags: TaskFlags,
    },
    Chunk(ChunkWrite),
    Terminate,
}

/// Outcome of one writer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterResult {
    pub filename: String,
    pub guid: Option<u128>,
    pub size: u64,
    pub slot: Option<SharedMemorySegment>,
    pub flags: TaskFlags,
    pub success: bool,
}

/// The four queues linking the coordinator with its workers.
pub struct WorkerQueues {
    pub dl_tasks: (Sender<DownloaderMsg>, Receiver<DownloaderMsg>),
    pub dl_results: (Sender<DownloadResult>, Receiver<DownloadResult>),
    pub writer_tasks: (Sender<WriterMsg>, Receiver<WriterMsg>),
    pub writer_results: (Sender<WriterResult>, Receiver<WriterResult>),
}

impl WorkerQueues {
    /// Bounded queues: the cap keeps the coordinator's put timeouts
    /// meaningful and bounds memory under a stalled worker.
    pub fn new(capacity: usize) -> Self {
        Self {
            dl_tasks: bounded(capacity),
            dl_results: bounded(capacity),
            writer_tasks: bounded(capacity),
            writer_results: bounded(capacity),
        }
    }

    /// Endpoints a download worker needs.
    pub fn downloader_endpoints(&self) -> (Receiver<DownloaderMsg>, Sender<DownloadResult>) {
        (self.dl_tasks.1.clone(), self.dl_results.0.clone())
    }

    /// Endpoints the file writer needs.
    pub fn writer_endpoints(&self) -> (Receiver<WriterMsg>, Sender<WriterResult>) {
        (self.writer_tasks.1.clone(), self.writer_results.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result_carries_task() {
        let task = DownloadTask {
            url: "https://cdn.example.com/ChunksV4/00/AB_CD.chunk".to_string(),
            guid: 42,
            slot: SharedMemorySegment { offset: 0, end: 1024 },
        };
        let result = DownloadResult::failure(task.clone());
        assert!(!result.success);
        assert_eq!(result.task, task);
    }

    #[test]
    fn test_queue_endpoints() {
        let queues = WorkerQueues::new(4);
        let (task_rx, result_tx) = queues.downloader_endpoints();

        queues.dl_tasks.0.send(DownloaderMsg::Terminate).unwrap();
        assert_eq!(task_rx.recv().unwrap(), DownloaderMsg::Terminate);

        let task = DownloadTask {
            url: "u".to_string(),
            guid: 1,
            slot: SharedMemorySegment { offset: 0, end: 1 },
        };
        result_tx.send(DownloadResult::failure(task)).unwrap();
        assert!(!queues.dl_results.1.recv().unwrap().success);
    }
}
